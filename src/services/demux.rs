//! Split one sorted line stream into N streams by key.
//!
//! Every line goes to exactly one sink. With the default md5 selector all
//! lines sharing a key land in the same sink, so each output stays a valid
//! input for a per-key engine and can be sorted and processed independently.

use crate::errors::{GcError, GcResult};
use futures::{Stream, StreamExt, pin_mut};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

pub type KeyFn = Box<dyn Fn(&str) -> String + Send + Sync>;
pub type SelectorFn = Box<dyn Fn(&str, usize) -> usize + Send + Sync>;

/// Which part of a line decides its sink.
pub enum KeyExtractor {
    WholeLine,
    /// Zero-based field; lines with fewer fields get the empty key.
    Field { index: usize, delimiter: String },
    Custom(KeyFn),
}

impl KeyExtractor {
    pub fn field(index: usize, delimiter: impl Into<String>) -> Self {
        Self::Field {
            index,
            delimiter: delimiter.into(),
        }
    }

    pub fn extract<'a>(&self, line: &'a str) -> std::borrow::Cow<'a, str> {
        match self {
            KeyExtractor::WholeLine => line.into(),
            KeyExtractor::Field { index, delimiter } => {
                line.split(delimiter.as_str()).nth(*index).unwrap_or("").into()
            }
            KeyExtractor::Custom(key) => key(line).into(),
        }
    }
}

/// `md5(key) mod n`.
pub fn md5_selector(key: &str, n: usize) -> usize {
    let digest = md5::compute(key.as_bytes());
    (u128::from_be_bytes(digest.0) % n as u128) as usize
}

pub struct Demux<W> {
    sinks: Vec<W>,
    key: KeyExtractor,
    selector: SelectorFn,
    counts: Vec<u64>,
}

impl<W: AsyncWrite + Unpin> Demux<W> {
    pub fn new(sinks: Vec<W>) -> GcResult<Self> {
        if sinks.is_empty() {
            return Err(GcError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "demux needs at least one output",
            )));
        }
        let counts = vec![0; sinks.len()];
        Ok(Self {
            sinks,
            key: KeyExtractor::WholeLine,
            selector: Box::new(md5_selector),
            counts,
        })
    }

    pub fn with_key(mut self, key: KeyExtractor) -> Self {
        self.key = key;
        self
    }

    pub fn with_selector(mut self, selector: SelectorFn) -> Self {
        self.selector = selector;
        self
    }

    /// Sink index for `line`.
    pub fn route(&self, line: &str) -> usize {
        let n = self.sinks.len();
        (self.selector)(&*self.key.extract(line), n) % n
    }

    /// Write `line` with exactly one trailing newline to its sink.
    pub async fn write_line(&mut self, line: &str) -> GcResult<usize> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);
        let index = self.route(line);
        let sink = &mut self.sinks[index];
        sink.write_all(line.as_bytes()).await?;
        sink.write_all(b"\n").await?;
        self.counts[index] += 1;
        Ok(index)
    }

    /// Route every line, then flush and shut down all sinks. Returns the
    /// number of lines written to each sink.
    pub async fn run<S>(mut self, lines: S) -> GcResult<Vec<u64>>
    where
        S: Stream<Item = io::Result<String>>,
    {
        pin_mut!(lines);
        while let Some(line) = lines.next().await {
            self.write_line(&line?).await?;
        }
        self.finish().await
    }

    pub async fn finish(mut self) -> GcResult<Vec<u64>> {
        for (index, sink) in self.sinks.iter_mut().enumerate() {
            sink.flush().await?;
            sink.shutdown().await?;
            debug!(sink = index, lines = self.counts[index], "output closed");
        }
        info!(outputs = self.sinks.len(), lines = self.counts.iter().sum::<u64>(), "demux finished");
        Ok(self.counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn lines(raw: &[&str]) -> impl Stream<Item = io::Result<String>> {
        stream::iter(raw.iter().map(|line| Ok(line.to_string())).collect::<Vec<_>>())
    }

    #[test]
    fn no_outputs_is_an_error() {
        assert!(Demux::<Vec<u8>>::new(Vec::new()).is_err());
    }

    #[test]
    fn selector_is_deterministic_and_in_range() {
        for key in ["", "a", "obj-1", "3a2a4ab8-2b6f-4c1c-9d4e-7f1f2c3b4a5d"] {
            let first = md5_selector(key, 7);
            assert!(first < 7);
            assert_eq!(first, md5_selector(key, 7));
        }
        assert_eq!(md5_selector("anything", 1), 0);
    }

    #[test]
    fn field_key_groups_lines_of_one_object() {
        let demux = Demux::new(vec![Vec::<u8>::new(); 4])
            .unwrap()
            .with_key(KeyExtractor::field(0, "\t"));
        let a = demux.route("obj-1\t2024-01-01T00:00:00.000Z\tlive");
        let b = demux.route("obj-1\t2024-01-02T00:00:00.000Z\tdead\t{}\t1.moray");
        assert_eq!(a, b);
        assert_eq!(a, md5_selector("obj-1", 4));
        assert_eq!(demux.route("short"), demux.route("short\tx"));
        assert_eq!(KeyExtractor::field(3, "\t").extract("a\tb"), "");
    }

    #[tokio::test]
    async fn custom_selector_routes_every_line_once() {
        let demux = Demux::new(vec![Vec::<u8>::new(), Vec::new()])
            .unwrap()
            .with_key(KeyExtractor::Custom(Box::new(|line| line.to_uppercase())))
            .with_selector(Box::new(|key, _| usize::from(key.starts_with('B'))));
        let counts = demux.run(lines(&["a1", "b1\n", "a2", "b2\r\n"])).await.unwrap();
        assert_eq!(counts, vec![2, 2]);
    }

    #[tokio::test]
    async fn writes_one_newline_per_line() {
        let mut demux = Demux::new(vec![Vec::<u8>::new()]).unwrap();
        demux.write_line("x\n").await.unwrap();
        demux.write_line("y").await.unwrap();
        assert_eq!(demux.sinks[0], b"x\ny\n");
    }
}
