//! Built-in work units: log aggregator, work-unit sorter, async file loader
//! (spec §2 "Built-in Work Units"; detailed in `SPEC_FULL.md` §12).
//!
//! None of these get special treatment from the scheduler — they are
//! ordinary [`crate::work_unit::WorkUnitBody`] closures that exercise the
//! framework the same way any client work unit would.

use crate::async_work_unit::{AsyncWorkUnit, BackgroundTask};
use crate::scheduler::FrameScheduler;
use crate::work_unit::{WorkUnitBody, WorkUnitOutcome};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer};

/// One formatted tracing record, batched by the log aggregator.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: String,
    pub target: String,
    pub message: String,
}

/// A `tracing_subscriber::Layer` that forwards every event into a channel
/// instead of formatting it immediately — the log aggregator work unit
/// drains the channel once per frame, batching writes the way
/// `CoordinationMessage` draining does for `knhk-warm`'s coordination
/// channel.
pub struct ChannelLayer {
    sender: Sender<LogRecord>,
}

impl ChannelLayer {
    /// Build a layer/receiver pair. Install the layer on the global or a
    /// per-scheduler subscriber; hand the receiver to
    /// [`log_aggregator_body`].
    pub fn new() -> (Self, Receiver<LogRecord>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl<S: Subscriber> Layer<S> for ChannelLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        struct MessageVisitor(String);
        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                }
            }
        }
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);

        let _ = self.sender.send(LogRecord {
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.0,
        });
    }
}

/// Sink the log aggregator writes batches to. Kept as a trait so tests can
/// assert on captured records instead of real I/O.
pub trait LogSink: Send + 'static {
    fn write_batch(&mut self, records: &[LogRecord]) -> io::Result<()>;
}

/// Writes each record as one line to an arbitrary [`std::io::Write`].
pub struct WriterSink<W>(pub W);

impl<W: io::Write + Send + 'static> LogSink for WriterSink<W> {
    fn write_batch(&mut self, records: &[LogRecord]) -> io::Result<()> {
        for record in records {
            writeln!(self.0, "[{}] {} {}", record.level, record.target, record.message)?;
        }
        Ok(())
    }
}

/// Build the log aggregator's [`WorkUnitBody`]: drain `receiver`, hand the
/// batch to `sink`. An I/O failure on the sink is reported exactly like
/// any other work-unit failure (spec §12.1) — no special resilience.
pub fn log_aggregator_body(receiver: Receiver<LogRecord>, mut sink: impl LogSink) -> WorkUnitBody {
    Box::new(move || {
        let batch: Vec<LogRecord> = receiver.try_iter().collect();
        if batch.is_empty() {
            return WorkUnitOutcome::Completed;
        }
        match sink.write_batch(&batch) {
            Ok(()) => WorkUnitOutcome::Completed,
            Err(_) => WorkUnitOutcome::Failed,
        }
    })
}

/// Build the work-unit sorter's [`WorkUnitBody`] (spec §4.3, §12.2): calls
/// `update_dependency_cache` + `sort_work_units` on `scheduler`, letting a
/// client amortize the rebuild cost across a frame instead of paying it
/// inline on the mutation call that made the cache dirty.
pub fn sorter_body(scheduler: Arc<FrameScheduler>) -> WorkUnitBody {
    Box::new(move || {
        scheduler.update_dependency_cache();
        scheduler.sort_work_units(false);
        WorkUnitOutcome::Completed
    })
}

/// Background task backing the async file loader (spec §12.3): blocking
/// reads performed off the frame-visible polling node.
pub struct FileLoadTask;

impl BackgroundTask for FileLoadTask {
    type Request = PathBuf;
    type Response = io::Result<Vec<u8>>;

    fn handle(&mut self, request: PathBuf) -> io::Result<Vec<u8>> {
        std::fs::read(request)
    }
}

/// Destination the async file loader publishes completed buffers into —
/// a thin wrapper so the polling body doesn't need to know about the
/// caller's double-buffer layout.
pub trait FileLoadSink: Send + 'static {
    fn publish(&mut self, path: PathBuf, result: io::Result<Vec<u8>>);
}

/// Owns the background thread and exposes `submit`/the polling body.
pub struct AsyncFileLoader {
    inner: Arc<AsyncWorkUnit<FileLoadTask>>,
    in_flight: Mutex<Option<PathBuf>>,
}

impl AsyncFileLoader {
    pub fn new(queue_depth: usize) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(AsyncWorkUnit::spawn(FileLoadTask, queue_depth)?),
            in_flight: Mutex::new(None),
        })
    }

    /// Queue a load. Returns `false` if the background thread's request
    /// queue is already full (caller should retry next frame).
    pub fn request_load(&self, path: PathBuf) -> bool {
        let accepted = self.inner.submit(path.clone());
        if accepted {
            *self.in_flight.lock() = Some(path);
        }
        accepted
    }

    /// The per-frame polling node (spec §4.4 point 5, §12.3): a
    /// non-blocking check of the completion channel that always reports
    /// `Completed` itself — only the underlying load can fail, and that
    /// failure is handed to `sink.publish` rather than this node's own
    /// outcome, per §9's framing of the poller as never failing.
    pub fn poller_body(self: &Arc<Self>, mut sink: impl FileLoadSink) -> WorkUnitBody {
        let this = Arc::clone(self);
        Box::new(move || {
            if let Some(result) = this.inner.poll() {
                if let Some(path) = this.in_flight.lock().take() {
                    sink.publish(path, result);
                }
            }
            WorkUnitOutcome::Completed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct VecSink(Arc<Mutex<Vec<LogRecord>>>);
    impl LogSink for VecSink {
        fn write_batch(&mut self, records: &[LogRecord]) -> io::Result<()> {
            self.0.lock().extend_from_slice(records);
            Ok(())
        }
    }

    #[test]
    fn log_aggregator_drains_batch_and_completes() {
        let (sender, receiver) = unbounded();
        sender
            .send(LogRecord {
                level: "INFO".into(),
                target: "test".into(),
                message: "hello".into(),
            })
            .unwrap();
        drop(sender);

        let captured = Arc::new(Mutex::new(Vec::new()));
        let mut body = log_aggregator_body(receiver, VecSink(Arc::clone(&captured)));
        assert_eq!(body(), WorkUnitOutcome::Completed);
        assert_eq!(captured.lock().len(), 1);
        assert_eq!(captured.lock()[0].message, "hello");
    }

    #[test]
    fn log_aggregator_is_noop_completed_when_empty() {
        let (_sender, receiver) = unbounded();
        let mut body = log_aggregator_body(receiver, VecSink(Arc::new(Mutex::new(Vec::new()))));
        assert_eq!(body(), WorkUnitOutcome::Completed);
    }

    #[test]
    fn file_loader_publishes_on_poll() {
        let loader = Arc::new(AsyncFileLoader::new(4).unwrap());
        let dir = std::env::temp_dir();
        let path = dir.join(format!("frame-scheduler-test-{}.bin", std::process::id()));
        std::fs::write(&path, b"payload").unwrap();

        assert!(loader.request_load(path.clone()));

        let published = Arc::new(Mutex::new(None));
        struct Capture(Arc<Mutex<Option<(PathBuf, Vec<u8>)>>>);
        impl FileLoadSink for Capture {
            fn publish(&mut self, path: PathBuf, result: io::Result<Vec<u8>>) {
                if let Ok(bytes) = result {
                    *self.0.lock() = Some((path, bytes));
                }
            }
        }
        let mut body = loader.poller_body(Capture(Arc::clone(&published)));

        let found = AtomicUsize::new(0);
        for _ in 0..200 {
            body();
            if published.lock().is_some() {
                found.fetch_add(1, Ordering::Relaxed);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(found.load(Ordering::Relaxed) > 0, "loader never published");
        assert_eq!(published.lock().as_ref().unwrap().1, b"payload");

        let _ = std::fs::remove_file(&path);
    }
}
