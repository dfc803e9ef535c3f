use super::{frame_to_line, raw_lines};
use crate::services::demux::{Demux, KeyExtractor};
use anyhow::{Context, Result};
use futures::{StreamExt, future};
use std::{io, path::PathBuf};
use tokio::{
    fs::File,
    io::{AsyncRead, BufWriter},
};
use tracing::warn;

/// `demux`: spread input lines over `outputs`, keyed on the whole line or
/// on field `field`.
pub async fn demux_to_files<R>(
    input: R,
    outputs: &[PathBuf],
    field: Option<usize>,
    delimiter: &str,
) -> Result<Vec<u64>>
where
    R: AsyncRead + Unpin,
{
    let mut sinks = Vec::with_capacity(outputs.len());
    for path in outputs {
        let file = File::create(path)
            .await
            .with_context(|| format!("creating output {}", path.display()))?;
        sinks.push(BufWriter::new(file));
    }

    let key = match field {
        Some(index) => KeyExtractor::field(index, delimiter),
        None => KeyExtractor::WholeLine,
    };
    let demux = Demux::new(sinks)?.with_key(key);
    let lines = raw_lines(input).enumerate().filter_map(|(index, frame)| {
        let line = match frame {
            Err(err) => Some(Err(io::Error::new(io::ErrorKind::InvalidData, err))),
            Ok(frame) => match frame_to_line(index as u64 + 1, frame) {
                Ok(line) => Some(Ok(line)),
                Err(err) => {
                    warn!(tool = "demux", error = %err, "skipping line");
                    None
                }
            },
        };
        future::ready(line)
    });
    Ok(demux.run(lines).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::demux::md5_selector;

    #[tokio::test]
    async fn lines_with_the_same_key_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let outputs: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("out.{i}"))).collect();
        let input = "k1\ta\nk2\tb\nk1\tc\nk3\td\n";

        let counts = demux_to_files(input.as_bytes(), &outputs, Some(0), "\t")
            .await
            .unwrap();
        assert_eq!(counts.iter().sum::<u64>(), 4);

        let k1 = std::fs::read_to_string(&outputs[md5_selector("k1", 3)]).unwrap();
        let k1: Vec<&str> = k1.lines().filter(|line| line.starts_with("k1")).collect();
        assert_eq!(k1, vec!["k1\ta", "k1\tc"]);
    }

    #[tokio::test]
    async fn undecodable_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = vec![dir.path().join("out.0")];
        let input: &[u8] = b"a\n\xff\xfe\nb\r\n";

        let counts = demux_to_files(input, &outputs, None, "\t").await.unwrap();
        assert_eq!(counts, vec![2]);
        assert_eq!(std::fs::read_to_string(&outputs[0]).unwrap(), "a\nb\n");
    }

    #[tokio::test]
    async fn no_outputs_fails() {
        assert!(demux_to_files("x\n".as_bytes(), &[], None, "\t").await.is_err());
    }
}
