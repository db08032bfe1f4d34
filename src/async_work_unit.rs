//! Base facility for asynchronous work units (spec §4.4 point 5, §9).
//!
//! An asynchronous unit owns a long-lived background thread that outlives
//! any single frame; in the dependency graph it is represented by an
//! ordinary node whose body polls/steers that thread rather than doing
//! the work inline. [`AsyncWorkUnit`] wires a user-supplied background
//! task to a [`WorkUnitBody`] closure the caller passes to
//! `FrameScheduler::add_work_unit` like any other unit.

use crate::work_unit::{WorkUnitBody, WorkUnitOutcome};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::JoinHandle;

/// A unit of background work that runs on its own thread across many
/// frames, exchanging one in-flight request/response pair with the node
/// that polls it.
pub trait BackgroundTask: Send + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Perform one unit of background work. Called repeatedly on the
    /// background thread until the request channel disconnects (the
    /// `AsyncWorkUnit` was dropped).
    fn handle(&mut self, request: Self::Request) -> Self::Response;
}

/// Owns the background thread and the channels used to poll it. Dropping
/// this value closes the request channel, which unblocks and joins the
/// background thread.
pub struct AsyncWorkUnit<T: BackgroundTask> {
    requests: Sender<T::Request>,
    responses: Receiver<T::Response>,
    handle: Option<JoinHandle<()>>,
}

impl<T: BackgroundTask> AsyncWorkUnit<T> {
    /// Spawn `task`'s background thread. `queue_depth` bounds how many
    /// outstanding requests may be in flight before `poll` would block —
    /// the per-frame body is expected to issue at most one request per
    /// poll, so 1 suffices for most loaders.
    pub fn spawn(mut task: T, queue_depth: usize) -> std::io::Result<Self> {
        let (request_tx, request_rx) = bounded::<T::Request>(queue_depth.max(1));
        let (response_tx, response_rx) = bounded::<T::Response>(queue_depth.max(1));

        let handle = std::thread::Builder::new()
            .name("frame-scheduler-async-worker".to_string())
            .spawn(move || {
                while let Ok(request) = request_rx.recv() {
                    let response = task.handle(request);
                    if response_tx.send(response).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            requests: request_tx,
            responses: response_rx,
            handle: Some(handle),
        })
    }

    /// Hand a request to the background thread without waiting for its
    /// response. Intended to be called from the polling `WorkUnitBody`.
    pub fn submit(&self, request: T::Request) -> bool {
        self.requests.try_send(request).is_ok()
    }

    /// Drain at most one completed response, non-blocking.
    pub fn poll(&self) -> Option<T::Response> {
        self.responses.try_recv().ok()
    }
}

impl<T: BackgroundTask> Drop for AsyncWorkUnit<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Build the polling [`WorkUnitBody`] a normal node runs each frame: drain
/// at most one response via `on_response`, and always report `Completed`
/// (per spec §9, the poller itself never fails — only the work it steers
/// might, which `on_response` is responsible for surfacing however the
/// caller's graph models that).
pub fn poller_body<T, F>(unit: std::sync::Arc<AsyncWorkUnit<T>>, mut on_response: F) -> WorkUnitBody
where
    T: BackgroundTask,
    F: FnMut(T::Response) + Send + 'static,
{
    Box::new(move || {
        if let Some(response) = unit.poll() {
            on_response(response);
        }
        WorkUnitOutcome::Completed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    struct Doubler;
    impl BackgroundTask for Doubler {
        type Request = u32;
        type Response = u32;
        fn handle(&mut self, request: u32) -> u32 {
            request * 2
        }
    }

    #[test]
    fn submit_then_poll_round_trips() {
        let unit = AsyncWorkUnit::spawn(Doubler, 4);
        assert!(unit.submit(21));
        let mut response = None;
        for _ in 0..100 {
            if let Some(r) = unit.poll() {
                response = Some(r);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(response, Some(42));
    }

    #[test]
    fn poller_body_forwards_responses() {
        let unit = Arc::new(AsyncWorkUnit::spawn(Doubler, 4));
        let collected = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let mut body = poller_body(Arc::clone(&unit), move |response| sink.lock().push(response));

        unit.submit(10);
        std::thread::sleep(Duration::from_millis(20));
        let outcome = body();
        assert_eq!(outcome, WorkUnitOutcome::Completed);
        assert_eq!(*collected.lock(), vec![20]);
    }
}
