//! Dump -> transform -> sort -> engine, through the command-line tools.

use chrono::Duration;
use manta_gc::{
    config::{Command, DEFAULT_UNLINK_CONCURRENCY, GcConfig, GracePolicy},
    handlers::run_command,
    models::sort_key::parse_timestamp,
};
use serde_json::{Value, json};

const OWNER: &str = "930896af-bf8c-48d4-885c-6573a94b1853";

fn config() -> GcConfig {
    GcConfig {
        grace: GracePolicy::new(
            parse_timestamp("2024-03-10T00:00:00Z").unwrap(),
            Duration::days(2),
        ),
        earliest_dump_date: parse_timestamp("2024-03-01T00:00:00Z"),
        shard: Some("1.moray".into()),
        storage_id: Some("1.stor".into()),
        unlink_concurrency: DEFAULT_UNLINK_CONCURRENCY,
    }
}

fn dump(table: &str, keys: &[&str], entries: Vec<Vec<Value>>) -> String {
    let mut out = json!({"name": table, "keys": keys}).to_string();
    out.push('\n');
    for entry in entries {
        out.push_str(&json!({ "entry": entry }).to_string());
        out.push('\n');
    }
    out
}

fn object(object_id: &str, sharks: &[&str]) -> Value {
    let sharks: Vec<Value> = sharks
        .iter()
        .map(|id| json!({"manta_storage_id": id, "server_uuid": "srv", "zone_uuid": "zone"}))
        .collect();
    Value::String(
        json!({
            "key": format!("/{OWNER}/stor/{object_id}"),
            "type": "object",
            "objectId": object_id,
            "owner": OWNER,
            "sharks": sharks
        })
        .to_string(),
    )
}

fn millis(ts: &str) -> Value {
    json!(parse_timestamp(ts).unwrap().timestamp_millis().to_string())
}

async fn run(command: Command, input: &str) -> String {
    let mut output = Vec::new();
    run_command(&config(), command, input.as_bytes(), &mut output)
        .await
        .unwrap();
    String::from_utf8(output).unwrap()
}

fn sorted(parts: &[&str]) -> String {
    let mut lines: Vec<&str> = parts.iter().flat_map(|part| part.lines()).collect();
    lines.sort_unstable();
    lines.iter().map(|line| format!("{line}\n")).collect()
}

#[tokio::test]
async fn deleted_object_is_collected_and_relinked_object_is_kept() {
    let manta = dump(
        "manta",
        &["_key", "_value", "_mtime"],
        vec![
            vec![json!("/k/kept"), object("kept", &["1.stor"]), millis("2024-01-01T00:00:00Z")],
            vec![json!("/k/back"), object("back", &["1.stor"]), millis("2024-02-02T00:00:00Z")],
        ],
    );
    let delete_log = dump(
        "manta_delete_log",
        &["_key", "_value", "_mtime", "objectid"],
        vec![
            vec![
                json!("/gone/1"),
                object("gone", &["1.stor", "2.stor"]),
                millis("2024-02-01T00:00:00Z"),
                json!("gone"),
            ],
            vec![
                json!("/back/1"),
                object("back", &["3.stor"]),
                millis("2024-02-01T00:00:00Z"),
                json!("back"),
            ],
            // Newer than the earliest dump: not trusted yet.
            vec![
                json!("/late/1"),
                object("late", &["1.stor"]),
                millis("2024-03-05T00:00:00Z"),
                json!("late"),
            ],
        ],
    );

    let live = run(Command::TransformGc, &manta).await;
    let dead = run(Command::TransformGc, &delete_log).await;
    assert_eq!(live.lines().count(), 2);
    assert_eq!(dead.lines().count(), 2);

    let actions = run(Command::GcObjects, &sorted(&[&live, &dead])).await;
    assert_eq!(
        actions,
        format!(
            "moray\tgone\t2024-02-01T00:00:00.000Z\t1.moray\n\
             mako\tgone\t1.stor\tsrv\tzone\t{OWNER}\n\
             mako\tgone\t2.stor\tsrv\tzone\t{OWNER}\n"
        )
    );
}

#[tokio::test]
async fn unreferenced_storage_objects_are_cruft() {
    let manta = dump(
        "manta",
        &["_key", "_value", "_mtime"],
        vec![vec![
            json!("/k/kept"),
            object("kept", &["1.stor"]),
            millis("2024-01-01T00:00:00Z"),
        ]],
    );
    let old = parse_timestamp("2024-01-01T00:00:00Z").unwrap().timestamp();
    let new = parse_timestamp("2024-02-29T12:00:00Z").unwrap().timestamp();
    let listing = format!(
        "/{OWNER}/kept\t10\t{old}\n/{OWNER}/orphan\t10\t{old}\n/{OWNER}/fresh\t10\t{new}\n"
    );

    let references = run(Command::TransformCruft { listing: false }, &manta).await;
    let stored = run(Command::TransformCruft { listing: true }, &listing).await;
    let cruft = run(Command::Cruft, &sorted(&[&references, &stored])).await;
    assert_eq!(cruft, format!("cruft\torphan\t1.stor\t{OWNER}\n"));
}

#[tokio::test]
async fn unsorted_input_fails_without_output() {
    let mut output = Vec::new();
    let input = "b\t2024-01-01T00:00:00.000Z\tlive\na\t2024-01-01T00:00:00.000Z\tlive\n";
    let result = run_command(&config(), Command::GcObjects, input.as_bytes(), &mut output).await;
    assert!(result.is_err());
    assert!(output.is_empty());
}

#[tokio::test]
async fn reappearing_upload_fails_without_any_mpu_output() {
    let a = "3a2a4ab8-2b6f-4c1c-9d4e-7f1f2c3b4a5d";
    let b = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
    let batch = |upload: &str| {
        format!(
            "{upload}\t0\t2024-03-01T00:00:00.000Z\t{upload}:/{OWNER}/stor/big\t1.moray\tcommit\n\
             {upload}\t1\t2024-02-28T00:00:00.000Z\t/{OWNER}/uploads/3a/{upload}\n\
             {upload}\t2\t2024-02-28T00:00:00.000Z\t/{OWNER}/uploads/3a/{upload}/0\n"
        )
    };
    let input = format!(
        "{}{}{a}\t2\t2024-02-28T00:00:00.000Z\t/{OWNER}/uploads/3a/{a}/1\n",
        batch(a),
        batch(b)
    );

    let complete = run(Command::GcMpu, &batch(a)).await;
    assert_eq!(complete.lines().count(), 3);

    let mut output = Vec::new();
    let result = run_command(&config(), Command::GcMpu, input.as_bytes(), &mut output).await;
    assert!(result.is_err());
    assert!(output.is_empty());
}
