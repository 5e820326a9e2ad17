//! The single consumer of the dispatch channel

use crate::server::storage::LogSink;
use crate::types::Record;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Write counters collected by a [`Writer`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterReport {
    /// Records the sink accepted
    pub written: u64,
    /// Records the sink rejected
    pub failed: u64,
}

/// What the writer hands back once the channel is closed and drained
#[derive(Debug)]
pub struct WriterOutcome<S> {
    /// The sink, still open; closing it is left to the caller
    pub sink: S,
    /// Counters
    pub report: WriterReport,
}

/// Serializes every record into the sink, in channel-receive order.
///
/// The writer is the only code that touches the sink after startup. It runs
/// on a blocking thread because sink writes are plain file I/O.
pub struct Writer<S> {
    dispatch: mpsc::Receiver<Record>,
    sink: S,
}

impl<S: LogSink> Writer<S> {
    /// Create a writer draining `dispatch` into `sink`
    pub fn new(dispatch: mpsc::Receiver<Record>, sink: S) -> Self {
        Self { dispatch, sink }
    }

    /// Run until the dispatch channel is closed.
    ///
    /// Records sent before the close are still delivered: the receiver only
    /// reports the channel closed once its buffer is empty. A failed write is
    /// logged and skipped.
    pub fn run(mut self) -> WriterOutcome<S> {
        info!("writer started");
        let mut report = WriterReport::default();

        while let Some(record) = self.dispatch.blocking_recv() {
            match self.sink.write(record.as_bytes()) {
                Ok(_) => report.written += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, bytes = record.as_bytes().len(), "sink write failed, dropping record");
                }
            }
        }

        debug!("dispatch channel closed and empty");
        info!(
            written = report.written,
            failed = report.failed,
            "writer drained"
        );

        WriterOutcome {
            sink: self.sink,
            report,
        }
    }

    /// Run on the blocking thread pool
    pub fn spawn(self) -> JoinHandle<WriterOutcome<S>> {
        tokio::task::spawn_blocking(move || self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::storage::MemorySink;
    use std::io;

    struct FlakySink {
        inner: MemorySink,
        fail_on: usize,
        calls: usize,
    }

    impl LogSink for FlakySink {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls == self.fail_on {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.inner.write(bytes)
        }

        fn close(&mut self) -> io::Result<()> {
            self.inner.close()
        }
    }

    fn record(text: &'static str) -> Record {
        Record::new(text).unwrap()
    }

    #[tokio::test]
    async fn test_drains_buffered_records_after_close() {
        let (tx, rx) = mpsc::channel(5);
        for line in ["a\n", "b\n", "c\n", "d\n", "e\n"] {
            tx.send(record(line)).await.unwrap();
        }
        drop(tx);

        let sink = MemorySink::new();
        let outcome = Writer::new(rx, sink.clone()).spawn().await.unwrap();

        assert_eq!(sink.contents(), b"a\nb\nc\nd\ne\n");
        assert_eq!(outcome.report.written, 5);
        assert!(!outcome.sink.is_closed());
    }

    #[tokio::test]
    async fn test_write_failure_does_not_stop_writer() {
        let (tx, rx) = mpsc::channel(5);
        let sink = MemorySink::new();
        let flaky = FlakySink {
            inner: sink.clone(),
            fail_on: 2,
            calls: 0,
        };
        let handle = Writer::new(rx, flaky).spawn();

        for line in ["one\n", "two\n", "three\n"] {
            tx.send(record(line)).await.unwrap();
        }
        drop(tx);

        let outcome = handle.await.unwrap();
        assert_eq!(
            outcome.report,
            WriterReport {
                written: 2,
                failed: 1
            }
        );
        assert_eq!(sink.contents(), b"one\nthree\n");
    }

    #[tokio::test]
    async fn test_no_records_no_writes() {
        let (tx, rx) = mpsc::channel::<Record>(5);
        drop(tx);

        let sink = MemorySink::new();
        let outcome = Writer::new(rx, sink.clone()).spawn().await.unwrap();
        assert_eq!(outcome.report, WriterReport::default());
        assert!(sink.contents().is_empty());
        assert_eq!(sink.write_calls(), 0);
    }
}
