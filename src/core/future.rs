//! Job result futures and the lazy-sequence handle for producer jobs.
//!
//! A [`JobFuture`] is a shared slot that settles exactly once per run with the
//! job's result or error. Waiters come in two flavors: blocking (condvar) and
//! async (notify); both observe the same state. Passing a future as a job
//! argument creates a dependency edge resolved by the scheduler at dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio::sync::Notify;

use crate::core::error::{EngineError, JobError};
use crate::core::job::JobId;
use crate::core::value::TaskValue;

type DoneCallback = Arc<dyn Fn(&TaskValue) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&JobError) + Send + Sync>;

#[derive(Default)]
struct FutureState {
    outcome: Option<Result<TaskValue, JobError>>,
    stream: Option<StreamHandle>,
    done_callbacks: Vec<DoneCallback>,
    error_callbacks: Vec<ErrorCallback>,
}

struct FutureShared {
    job_id: JobId,
    state: Mutex<FutureState>,
    cv: Condvar,
    notify: Notify,
}

/// Handle to a job's eventual result.
///
/// Cheap to clone; all clones observe the same slot. Usable as a job argument
/// to express a dependency edge.
#[derive(Clone)]
pub struct JobFuture {
    shared: Arc<FutureShared>,
}

impl JobFuture {
    pub(crate) fn new(job_id: JobId) -> Self {
        Self {
            shared: Arc::new(FutureShared {
                job_id,
                state: Mutex::new(FutureState::default()),
                cv: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Id of the job this future belongs to.
    #[must_use]
    pub fn job_id(&self) -> &JobId {
        &self.shared.job_id
    }

    /// True once the job has settled with a result or error.
    #[must_use]
    pub fn done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// Block until the job settles and return its result.
    ///
    /// # Errors
    ///
    /// [`EngineError::Timeout`] when `timeout` elapses first, or the job's
    /// stored [`JobError`] when it failed or was cancelled.
    pub fn result(&self, timeout: Option<Duration>) -> Result<TaskValue, EngineError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = state.outcome.clone() {
                return outcome.map_err(EngineError::from);
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.cv.wait_until(&mut state, deadline).timed_out() {
                        return Err(EngineError::Timeout);
                    }
                }
                None => self.shared.cv.wait(&mut state),
            }
        }
    }

    /// Await the job settling and return its result.
    ///
    /// # Errors
    ///
    /// The job's stored [`JobError`] when it failed or was cancelled.
    pub async fn result_async(&self) -> Result<TaskValue, JobError> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(outcome) = self.shared.state.lock().outcome.clone() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Block until the job settles and return its stored error, if any.
    ///
    /// # Errors
    ///
    /// [`EngineError::Timeout`] when `timeout` elapses first.
    pub fn exception(&self, timeout: Option<Duration>) -> Result<Option<JobError>, EngineError> {
        match self.result(timeout) {
            Ok(_) => Ok(None),
            Err(EngineError::Job(err)) => Ok(Some(err)),
            Err(other) => Err(other),
        }
    }

    /// Await the job settling and return its stored error, if any.
    pub async fn exception_async(&self) -> Option<JobError> {
        self.result_async().await.err()
    }

    /// Result value if the job has already settled successfully.
    #[must_use]
    pub fn peek(&self) -> Option<Result<TaskValue, JobError>> {
        self.shared.state.lock().outcome.clone()
    }

    /// The lazy-sequence handle, for producer jobs that have been dispatched.
    #[must_use]
    pub fn stream(&self) -> Option<StreamHandle> {
        self.shared.state.lock().stream.clone()
    }

    /// Register an observer fired when the job settles successfully.
    ///
    /// If the job has already settled, the observer fires immediately.
    pub fn on_done(&self, callback: impl Fn(&TaskValue) + Send + Sync + 'static) {
        let callback: DoneCallback = Arc::new(callback);
        let fire = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            match &state.outcome {
                Some(Ok(value)) => Some(value.clone()),
                Some(Err(_)) => None,
                None => {
                    state.done_callbacks.push(Arc::clone(&callback));
                    return;
                }
            }
        };
        if let Some(value) = fire {
            callback(&value);
        }
    }

    /// Register an observer fired when the job settles with an error.
    ///
    /// If the job has already failed, the observer fires immediately.
    pub fn on_error(&self, callback: impl Fn(&JobError) + Send + Sync + 'static) {
        let callback: ErrorCallback = Arc::new(callback);
        let fire = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            match &state.outcome {
                Some(Err(err)) => Some(err.clone()),
                Some(Ok(_)) => None,
                None => {
                    state.error_callbacks.push(Arc::clone(&callback));
                    return;
                }
            }
        };
        if let Some(err) = fire {
            callback(&err);
        }
    }

    /// Settle the slot and fire observers. Called by the scheduler only.
    pub(crate) fn settle(&self, outcome: Result<TaskValue, JobError>) {
        let (done_cbs, error_cbs) = {
            let mut state = self.shared.state.lock();
            if state.outcome.is_some() {
                // Terminal results are immutable until an explicit rerun.
                return;
            }
            state.outcome = Some(outcome.clone());
            (state.done_callbacks.clone(), state.error_callbacks.clone())
        };
        match &outcome {
            Ok(value) => {
                for cb in &done_cbs {
                    cb(value);
                }
            }
            Err(err) => {
                for cb in &error_cbs {
                    cb(err);
                }
            }
        }
        self.shared.cv.notify_all();
        self.shared.notify.notify_waiters();
    }

    pub(crate) fn set_stream(&self, handle: StreamHandle) {
        self.shared.state.lock().stream = Some(handle);
    }

    /// Clear the slot for a rerun. Observers stay registered.
    pub(crate) fn reset(&self) {
        let mut state = self.shared.state.lock();
        state.outcome = None;
        state.stream = None;
    }
}

impl std::fmt::Debug for JobFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobFuture")
            .field("job_id", &self.shared.job_id)
            .field("done", &self.done())
            .finish()
    }
}

/// Error returned to a producer emitting into a closed stream.
#[derive(Debug, Clone, Copy, Error)]
#[error("stream closed by consumer")]
pub struct StreamClosed;

/// Producer-side handle of a lazy sequence.
///
/// Handed to producer callables; values emitted here appear on the consumer's
/// [`StreamHandle`] in order.
pub struct StreamSink {
    items: tokio::sync::mpsc::UnboundedSender<TaskValue>,
    sent: crossbeam_channel::Receiver<TaskValue>,
    closed: Arc<AtomicBool>,
}

impl StreamSink {
    /// Emit the next value of the sequence.
    ///
    /// # Errors
    ///
    /// [`StreamClosed`] once the consumer has closed the stream or the job
    /// was cancelled; the producer should stop.
    pub fn emit(&self, value: TaskValue) -> Result<(), StreamClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamClosed);
        }
        self.items.send(value).map_err(|_| StreamClosed)
    }

    /// Latest value pushed by the consumer through [`StreamHandle::send`],
    /// if any.
    #[must_use]
    pub fn sent(&self) -> Option<TaskValue> {
        self.sent.try_recv().ok()
    }

    /// True once the consumer closed the stream.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum StreamPhase {
    Open,
    Exhausted,
    Closed,
}

struct StreamInner {
    job_id: JobId,
    items: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<TaskValue>>,
    sent: crossbeam_channel::Sender<TaskValue>,
    phase: Mutex<StreamPhase>,
    on_exhausted: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    closed: Arc<AtomicBool>,
}

/// Consumer-side handle of a lazy sequence produced by a generator job.
///
/// The protocol is explicit: [`next`](Self::next) pulls the next value,
/// [`send`](Self::send) pushes a value to the producer and pulls, and
/// [`close`](Self::close) ends consumption early. Exhausting or closing the
/// stream is what moves the producing job to `done`.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<StreamInner>,
}

impl StreamHandle {
    /// Id of the producing job.
    #[must_use]
    pub fn job_id(&self) -> &JobId {
        &self.inner.job_id
    }

    /// Pull the next value, blocking until the producer emits one.
    ///
    /// Returns `None` once the sequence is exhausted or the stream closed.
    /// Must not be called from async context; use
    /// [`next_async`](Self::next_async) there.
    #[must_use]
    pub fn next(&self) -> Option<TaskValue> {
        if *self.inner.phase.lock() != StreamPhase::Open {
            return None;
        }
        match self.inner.items.blocking_lock().blocking_recv() {
            Some(value) => Some(value),
            None => {
                self.finish(StreamPhase::Exhausted);
                None
            }
        }
    }

    /// Async analogue of [`next`](Self::next).
    pub async fn next_async(&self) -> Option<TaskValue> {
        if *self.inner.phase.lock() != StreamPhase::Open {
            return None;
        }
        match self.inner.items.lock().await.recv().await {
            Some(value) => Some(value),
            None => {
                self.finish(StreamPhase::Exhausted);
                None
            }
        }
    }

    /// Push a value to the producer, then pull the next value.
    ///
    /// The producer observes pushed values via [`StreamSink::sent`].
    #[must_use]
    pub fn send(&self, value: TaskValue) -> Option<TaskValue> {
        let _ = self.inner.sent.send(value);
        self.next()
    }

    /// Stop consuming. The producing job is marked done; subsequent `next`
    /// calls return `None`.
    pub fn close(&self) {
        self.finish(StreamPhase::Exhausted);
    }

    /// Adapt into a [`futures::Stream`] of values.
    #[must_use]
    pub fn into_stream(self) -> impl futures::Stream<Item = TaskValue> {
        futures::stream::unfold(self, |handle| async move {
            handle.next_async().await.map(|value| (value, handle))
        })
    }

    /// Close without firing the exhaustion hook. Used on cancellation, where
    /// the scheduler settles the job itself.
    pub(crate) fn mark_cancelled(&self) {
        let mut phase = self.inner.phase.lock();
        if *phase == StreamPhase::Open {
            *phase = StreamPhase::Closed;
            self.inner.closed.store(true, Ordering::Release);
            drop(phase);
            let _ = self.inner.on_exhausted.lock().take();
        }
    }

    pub(crate) fn set_on_exhausted(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.inner.on_exhausted.lock() = Some(hook);
    }

    fn finish(&self, next_phase: StreamPhase) {
        let hook = {
            let mut phase = self.inner.phase.lock();
            if *phase != StreamPhase::Open {
                return;
            }
            *phase = next_phase;
            self.inner.closed.store(true, Ordering::Release);
            self.inner.on_exhausted.lock().take()
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("job_id", &self.inner.job_id)
            .field("phase", &*self.inner.phase.lock())
            .finish()
    }
}

/// Build a connected sink/handle pair for a producer job.
pub(crate) fn stream_pair(job_id: JobId) -> (StreamSink, StreamHandle) {
    let (items_tx, items_rx) = tokio::sync::mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = crossbeam_channel::unbounded();
    let closed = Arc::new(AtomicBool::new(false));
    let sink = StreamSink {
        items: items_tx,
        sent: sent_rx,
        closed: Arc::clone(&closed),
    };
    let handle = StreamHandle {
        inner: Arc::new(StreamInner {
            job_id,
            items: tokio::sync::Mutex::new(items_rx),
            sent: sent_tx,
            phase: Mutex::new(StreamPhase::Open),
            on_exhausted: Mutex::new(None),
            closed,
        }),
    };
    (sink, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_future_settles_once() {
        let fut = JobFuture::new(JobId::from("j1"));
        assert!(!fut.done());
        fut.settle(Ok(json!(1)));
        fut.settle(Ok(json!(2)));
        assert_eq!(fut.result(None).unwrap(), json!(1));
    }

    #[test]
    fn test_result_timeout() {
        let fut = JobFuture::new(JobId::from("j1"));
        let err = fut.result(Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, EngineError::Timeout));
    }

    #[test]
    fn test_callbacks_fire_on_settle_and_late_registration() {
        let fut = JobFuture::new(JobId::from("j1"));
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = Arc::clone(&hits);
        fut.on_done(move |_| {
            hits2.fetch_add(1, Ordering::Relaxed);
        });
        fut.settle(Ok(json!("ok")));
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        // Late registration fires immediately.
        let hits3 = Arc::clone(&hits);
        fut.on_done(move |_| {
            hits3.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_exception_surfaces_error() {
        let fut = JobFuture::new(JobId::from("j1"));
        fut.settle(Err(JobError::UserCallable("nope".into())));
        let err = fut.exception(None).unwrap().unwrap();
        assert!(matches!(err, JobError::UserCallable(_)));
        assert!(fut.result(None).is_err());
    }

    #[test]
    fn test_stream_exhaustion_fires_hook() {
        let (sink, handle) = stream_pair(JobId::from("j1"));
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        handle.set_on_exhausted(Box::new(move || {
            fired2.store(true, Ordering::Release);
        }));

        sink.emit(json!(1)).unwrap();
        sink.emit(json!(2)).unwrap();
        drop(sink);

        assert_eq!(handle.next(), Some(json!(1)));
        assert!(!fired.load(Ordering::Acquire));
        assert_eq!(handle.next(), Some(json!(2)));
        assert_eq!(handle.next(), None);
        assert!(fired.load(Ordering::Acquire));
        // Idempotent past exhaustion.
        assert_eq!(handle.next(), None);
    }

    #[test]
    fn test_stream_close_stops_producer() {
        let (sink, handle) = stream_pair(JobId::from("j1"));
        sink.emit(json!(1)).unwrap();
        handle.close();
        assert!(sink.emit(json!(2)).is_err());
        assert!(sink.is_closed());
        assert_eq!(handle.next(), None);
    }

    #[test]
    fn test_stream_send_reaches_producer() {
        let (sink, handle) = stream_pair(JobId::from("j1"));
        sink.emit(json!(0)).unwrap();
        let got = handle.send(json!("ping"));
        assert_eq!(got, Some(json!(0)));
        assert_eq!(sink.sent(), Some(json!("ping")));
    }
}
