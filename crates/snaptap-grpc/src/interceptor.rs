//! Request/response recording around each RPC.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};

use serde::Serialize;
use snaptap::{FailureRecord, LogRecord, LogSink};
use tokio_stream::Stream;
use tonic::{Request, Response, Status};

/// Records every call it wraps to a [`LogSink`].
///
/// For each call the interceptor writes a request record, runs the wrapped
/// handler exactly once, writes a response record describing what the
/// handler returned, and hands that result back unchanged. Failing to
/// record never fails the call: the error is logged and the call proceeds.
///
/// ## Thread Safety
///
/// The interceptor is shared by all concurrently running calls. Ordering
/// between calls is whatever order they reach the sink in; within one call
/// the request record is always written before the response record.
#[derive(Debug)]
pub struct Interceptor {
    recorder: Recorder,
    correlation_ids: bool,
    next_call_id: AtomicU64,
    in_flight: Arc<AtomicUsize>,
}

impl Interceptor {
    /// Create an interceptor writing to `sink`.
    pub fn new(sink: Arc<LogSink>) -> Self {
        Self {
            recorder: Recorder { sink },
            correlation_ids: false,
            next_call_id: AtomicU64::new(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Tag both records of each call with a shared, process-unique `call_id`.
    pub fn with_correlation_ids(mut self, enabled: bool) -> Self {
        self.correlation_ids = enabled;
        self
    }

    /// The sink records are written to.
    pub fn sink(&self) -> &Arc<LogSink> {
        &self.recorder.sink
    }

    /// Number of calls (including open response streams) currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Record a unary call around `next`.
    ///
    /// `method` is the fully-qualified gRPC path of the call. The request
    /// still carries its metadata and extensions when it reaches `next`.
    pub async fn intercept<Req, Resp, F, Fut>(
        &self,
        method: &'static str,
        request: Request<Req>,
        next: F,
    ) -> Result<Response<Resp>, Status>
    where
        Req: Serialize,
        Resp: Serialize,
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let _in_flight = InFlightGuard::enter(&self.in_flight);
        let call_id = self.call_id();

        tracing::debug!(method, "intercepting call");
        self.recorder
            .record(LogRecord::request(method, request.get_ref()), call_id);

        let result = next(request).await;

        match &result {
            Ok(response) => self
                .recorder
                .record(LogRecord::response(method, response.get_ref()), call_id),
            Err(status) => self.recorder.record_failure(method, status, call_id),
        }

        result
    }

    /// Record a server-streaming call around `next`.
    ///
    /// The request is recorded up front. If the handler fails before
    /// producing a stream, the failure is recorded as the response.
    /// Otherwise the streamed messages are passed through untouched and
    /// folded into one message, which is recorded as the single response
    /// once the stream ends, errors, or is dropped by the client. An empty
    /// stream records `Item::default()`. The call counts as in flight until
    /// that response is recorded.
    pub async fn intercept_streaming<Req, Item, S, F, Fut>(
        &self,
        method: &'static str,
        request: Request<Req>,
        next: F,
    ) -> Result<Response<RecordedStream<Item>>, Status>
    where
        Req: Serialize,
        Item: Accumulate,
        S: Stream<Item = Result<Item, Status>> + Send + 'static,
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<S>, Status>>,
    {
        let in_flight = InFlightGuard::enter(&self.in_flight);
        let call_id = self.call_id();

        tracing::debug!(method, "intercepting streaming call");
        self.recorder
            .record(LogRecord::request(method, request.get_ref()), call_id);

        match next(request).await {
            Ok(response) => {
                let (metadata, inner, extensions) = response.into_parts();
                let stream = RecordedStream {
                    inner: Box::pin(inner),
                    recorder: self.recorder.clone(),
                    method,
                    call_id,
                    pending: Some(Item::default()),
                    _in_flight: in_flight,
                };
                Ok(Response::from_parts(metadata, stream, extensions))
            }
            Err(status) => {
                self.recorder.record_failure(method, &status, call_id);
                Err(status)
            }
        }
    }

    fn call_id(&self) -> Option<u64> {
        self.correlation_ids
            .then(|| self.next_call_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Writes records to the sink, containing any failure to do so.
#[derive(Debug, Clone)]
struct Recorder {
    sink: Arc<LogSink>,
}

impl Recorder {
    fn record<M: Serialize + ?Sized>(&self, record: LogRecord<'_, M>, call_id: Option<u64>) {
        let record = match call_id {
            Some(id) => record.with_call_id(id),
            None => record,
        };
        if let Err(e) = self.sink.write(&record) {
            tracing::warn!(
                method = record.method(),
                kind = %record.kind(),
                error = %e,
                "failed to record intercepted message"
            );
        }
    }

    fn record_failure(&self, method: &str, status: &Status, call_id: Option<u64>) {
        let failure = failure_record(status);
        self.record(LogRecord::response(method, &failure), call_id);
    }
}

fn failure_record(status: &Status) -> FailureRecord {
    FailureRecord::new(format!("{:?}", status.code()), status.message())
}

/// Keeps the in-flight counter raised while a call is running.
#[derive(Debug)]
struct InFlightGuard {
    count: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn enter(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self {
            count: Arc::clone(count),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A streamed response message that can absorb the messages after it.
///
/// Streams are recorded as one response per call: every message the
/// stream yields is merged, in order, into a message that starts out as
/// `Default::default()`.
pub trait Accumulate: Serialize + Default {
    /// Merge the contents of `next` into `self`.
    fn accumulate(&mut self, next: &Self);
}

/// A response stream that records everything it yields as one response.
///
/// Returned by [`Interceptor::intercept_streaming`].
pub struct RecordedStream<T: Accumulate> {
    inner: Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>,
    recorder: Recorder,
    method: &'static str,
    call_id: Option<u64>,
    // `None` once the response record has been written.
    pending: Option<T>,
    _in_flight: InFlightGuard,
}

impl<T: Accumulate> RecordedStream<T> {
    fn finish(&mut self) {
        if let Some(merged) = self.pending.take() {
            self.recorder
                .record(LogRecord::response(self.method, &merged), self.call_id);
        }
    }

    fn fail(&mut self, status: &Status) {
        if self.pending.take().is_some() {
            self.recorder
                .record_failure(self.method, status, self.call_id);
        }
    }
}

impl<T: Accumulate> fmt::Debug for RecordedStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordedStream")
            .field("method", &self.method)
            .field("call_id", &self.call_id)
            .field("finished", &self.pending.is_none())
            .finish_non_exhaustive()
    }
}

impl<T: Accumulate + Unpin> Stream for RecordedStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = ready!(self.inner.as_mut().poll_next(cx));
        match &item {
            Some(Ok(message)) => {
                if let Some(merged) = self.pending.as_mut() {
                    merged.accumulate(message);
                }
            }
            Some(Err(status)) => self.fail(status),
            None => self.finish(),
        }
        Poll::Ready(item)
    }
}

impl<T: Accumulate> Drop for RecordedStream<T> {
    fn drop(&mut self) {
        // Client went away before the end of the stream.
        self.finish();
    }
}
