//! Tower layers wrapped around every gRPC call, outermost first:
//! [`LoggingLayer`], [`RecoveryLayer`], then [`HaltLayer`].

use std::any::Any;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use http_body::{Body, Frame};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tonic::body::BoxBody;
use tonic::codegen::http::{header, HeaderMap, HeaderValue, Request, Response};
use tonic::codegen::Bytes;
use tonic::{Code, Status};
use tower::{Layer, Service};
use tracing::{error, info};

const GRPC_STATUS: &str = "grpc-status";
const GRPC_MESSAGE: &str = "grpc-message";

pub const HALTED_MESSAGE: &str = "server is shutting down";

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingLayer;

impl<S> Layer<S> for LoggingLayer {
    type Service = Logging<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Logging { inner }
    }
}

/// Logs method, elapsed time and outcome once the call completes.
#[derive(Debug, Clone)]
pub struct Logging<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for Logging<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Display,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; keep the ready one for this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let method = req.uri().path().to_owned();

        Box::pin(async move {
            let started = Instant::now();
            let result = inner.call(req).await;
            let elapsed = started.elapsed();

            let (code, message) = match &result {
                Ok(resp) => outcome(resp),
                Err(e) => (Code::Unknown, Some(e.to_string())),
            };
            let failed = code != Code::Ok;

            metrics::counter!(
                "xrate_grpc_requests_total",
                "method" => method.clone(),
                "outcome" => if failed { "error" } else { "ok" }
            )
            .increment(1);
            metrics::histogram!("xrate_grpc_request_duration_seconds", "method" => method.clone())
                .record(elapsed.as_secs_f64());

            let duration_ms = elapsed.as_secs_f64() * 1000.0;
            if failed {
                error!(
                    method = %method,
                    duration_ms,
                    code = ?code,
                    error = message.as_deref().unwrap_or(""),
                    "gRPC call"
                );
            } else {
                info!(method = %method, duration_ms, "gRPC call");
            }

            result
        })
    }
}

// Errors travel as trailers-only responses, so the status sits in the
// headers; a missing header means the call succeeded.
fn outcome<B>(resp: &Response<B>) -> (Code, Option<String>) {
    let headers = resp.headers();
    let code = headers
        .get(GRPC_STATUS)
        .map(|v| Code::from_bytes(v.as_bytes()))
        .unwrap_or(Code::Ok);
    let message = headers
        .get(GRPC_MESSAGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (code, message)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryLayer;

impl<S> Layer<S> for RecoveryLayer {
    type Service = Recovery<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Recovery { inner }
    }
}

/// Turns a panic inside the handler into an `INTERNAL` response so the
/// connection and the process keep running.
#[derive(Debug, Clone)]
pub struct Recovery<S> {
    inner: S,
}

impl<S, ReqBody> Service<Request<ReqBody>> for Recovery<S>
where
    S: Service<Request<ReqBody>, Response = Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let method = req.uri().path().to_owned();

        Box::pin(async move {
            match AssertUnwindSafe(async move { inner.call(req).await }).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    error!(method = %method, panic = %panic_message(panic.as_ref()), "gRPC panic recovered");
                    Ok(internal_response())
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn internal_response() -> Response<BoxBody> {
    trailers_only(Code::Internal, "internal error")
}

fn trailers_only(code: Code, message: &'static str) -> Response<BoxBody> {
    let mut resp = Response::new(tonic::body::empty_body());
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert(GRPC_STATUS, HeaderValue::from(code as i32));
    headers.insert(GRPC_MESSAGE, HeaderValue::from_static(message));
    resp
}

#[derive(Debug, Clone)]
pub struct HaltLayer {
    halt: watch::Receiver<bool>,
}

impl HaltLayer {
    pub fn new(halt: watch::Receiver<bool>) -> Self {
        Self { halt }
    }
}

impl<S> Layer<S> for HaltLayer {
    type Service = Halt<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Halt { inner, halt: self.halt.clone() }
    }
}

/// Cuts every call short once the halt signal flips to `true`: a pending
/// handler answers `UNAVAILABLE`, an open response stream is ended with
/// `UNAVAILABLE` trailers.
#[derive(Debug, Clone)]
pub struct Halt<S> {
    inner: S,
    halt: watch::Receiver<bool>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for Halt<S>
where
    S: Service<Request<ReqBody>, Response = Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let mut halt = self.halt.clone();

        Box::pin(async move {
            let result = tokio::select! {
                res = inner.call(req) => res,
                _ = halted(&mut halt) => {
                    return Ok::<_, S::Error>(trailers_only(Code::Unavailable, HALTED_MESSAGE));
                }
            };

            result.map(|resp| {
                let (parts, body) = resp.into_parts();
                Response::from_parts(parts, BoxBody::new(HaltBody::new(body, halt)))
            })
        })
    }
}

async fn halted(halt: &mut watch::Receiver<bool>) {
    if halt.wait_for(|halted| *halted).await.is_err() {
        // Sender gone: nothing can halt us any more.
        std::future::pending::<()>().await;
    }
}

struct HaltBody {
    inner: BoxBody,
    halt: Option<WatchStream<bool>>,
    done: bool,
}

impl HaltBody {
    fn new(inner: BoxBody, halt: watch::Receiver<bool>) -> Self {
        Self { inner, halt: Some(WatchStream::new(halt)), done: false }
    }

    fn poll_halt(&mut self, cx: &mut Context<'_>) -> bool {
        let Some(halt) = self.halt.as_mut() else {
            return false;
        };
        loop {
            match Pin::new(&mut *halt).poll_next(cx) {
                Poll::Ready(Some(true)) => return true,
                Poll::Ready(Some(false)) => continue,
                Poll::Ready(None) => {
                    self.halt = None;
                    return false;
                }
                Poll::Pending => return false,
            }
        }
    }
}

impl Body for HaltBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, Status>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.poll_halt(cx) {
            this.done = true;
            this.inner = tonic::body::empty_body(); // drops the handler's stream
            return Poll::Ready(Some(Ok(Frame::trailers(halted_trailers()))));
        }

        let frame = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(f))) = &frame {
            if f.is_trailers() {
                this.done = true;
            }
        }
        frame
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }
}

fn halted_trailers() -> HeaderMap {
    let mut trailers = HeaderMap::new();
    trailers.insert(GRPC_STATUS, HeaderValue::from(Code::Unavailable as i32));
    trailers.insert(GRPC_MESSAGE, HeaderValue::from_static(HALTED_MESSAGE));
    trailers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Clone)]
    struct Panicking;

    impl Service<Request<()>> for Panicking {
        type Response = Response<BoxBody>;
        type Error = Infallible;
        type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<()>) -> Self::Future {
            Box::pin(async move {
                if req.uri().path().ends_with("/Boom") {
                    panic!("boom");
                }
                Ok(Response::new(tonic::body::empty_body()))
            })
        }
    }

    fn request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[tokio::test]
    async fn test_recovery_converts_panic_to_internal() {
        let svc = RecoveryLayer.layer(Panicking);
        let resp = svc.oneshot(request("/exchangerate.v1.ExchangeRateService/Boom")).await.unwrap();

        let (code, message) = outcome(&resp);
        assert_eq!(code, Code::Internal);
        assert_eq!(message.as_deref(), Some("internal error"));
    }

    #[tokio::test]
    async fn test_recovery_passes_through_normal_calls() {
        let svc = RecoveryLayer.layer(Panicking);
        let resp = svc.oneshot(request("/exchangerate.v1.ExchangeRateService/GetRates")).await.unwrap();
        assert_eq!(outcome(&resp), (Code::Ok, None));
    }

    #[tokio::test]
    async fn test_logging_wraps_recovery() {
        let svc = LoggingLayer.layer(RecoveryLayer.layer(Panicking));
        let resp = svc.oneshot(request("/exchangerate.v1.ExchangeRateService/Boom")).await.unwrap();
        assert_eq!(outcome(&resp).0, Code::Internal);
    }

    // Never answers on its own; `/Stream` returns headers with a body that
    // never yields a frame.
    #[derive(Clone)]
    struct Stuck;

    struct Endless;

    impl Body for Endless {
        type Data = Bytes;
        type Error = Status;

        fn poll_frame(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, Status>>> {
            Poll::Pending
        }
    }

    impl Service<Request<()>> for Stuck {
        type Response = Response<BoxBody>;
        type Error = Infallible;
        type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<()>) -> Self::Future {
            Box::pin(async move {
                if req.uri().path().ends_with("/Stream") {
                    return Ok(Response::new(BoxBody::new(Endless)));
                }
                std::future::pending::<Result<Response<BoxBody>, Infallible>>().await
            })
        }
    }

    #[tokio::test]
    async fn test_halt_answers_pending_call_unavailable() {
        let (tx, rx) = watch::channel(false);
        let svc = HaltLayer::new(rx).layer(Stuck);

        let call = tokio::spawn(svc.oneshot(request("/exchangerate.v1.ExchangeRateService/GetRates")));
        tokio::task::yield_now().await;
        tx.send_replace(true);

        let resp = tokio::time::timeout(Duration::from_secs(2), call).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome(&resp), (Code::Unavailable, Some(HALTED_MESSAGE.to_string())));
    }

    #[tokio::test]
    async fn test_halt_ends_open_stream_with_trailers() {
        let (tx, rx) = watch::channel(false);
        let svc = HaltLayer::new(rx).layer(Stuck);

        let resp = svc.oneshot(request("/exchangerate.v1.ExchangeRateService/Stream")).await.unwrap();
        assert_eq!(outcome(&resp).0, Code::Ok);
        let mut body = resp.into_body();

        tx.send_replace(true);
        let frame = tokio::time::timeout(
            Duration::from_secs(2),
            futures::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();

        let trailers = frame.into_trailers().unwrap();
        assert_eq!(trailers.get(GRPC_STATUS).unwrap(), "14");
        assert!(body.is_end_stream());
    }

    #[tokio::test]
    async fn test_halt_passes_calls_through_while_running() {
        let (_tx, rx) = watch::channel(false);
        let svc = HaltLayer::new(rx).layer(Panicking);
        let resp = svc.oneshot(request("/exchangerate.v1.ExchangeRateService/GetRates")).await.unwrap();
        assert_eq!(outcome(&resp), (Code::Ok, None));
    }

    #[test]
    fn test_panic_message_variants() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
