//! Request ID middleware.
//!
//! Every request gets an id: the client's `X-Request-Id` when it is usable,
//! a fresh UUIDv4 otherwise. The id is stored as a [`RequestId`] request
//! extension and echoed on the response, including streaming responses whose
//! body is still being produced.
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:8080/messages/room1
//! ```

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied id that is propagated as-is.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Request id attached to every request as an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(Arc<str>);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn generate() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    /// Take the client's id if it is short, non-empty visible ASCII.
    fn from_header(value: &HeaderValue) -> Option<Self> {
        let value = value.to_str().ok()?;
        let usable = !value.is_empty()
            && value.len() <= MAX_REQUEST_ID_LEN
            && value.bytes().all(|b| b.is_ascii_graphic());
        usable.then(|| Self(value.into()))
    }

    fn header_value(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.0).ok()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request ID layer for the Tower middleware stack.
#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = request_id_for(&req);
        let header = request_id.header_value();

        if let Some(value) = &header {
            req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        }
        req.extensions_mut().insert(request_id);

        // Take the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            if let Some(value) = header {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            Ok(response)
        })
    }
}

/// Extract the request ID from headers or generate a new one.
fn request_id_for<B>(req: &Request<B>) -> RequestId {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(RequestId::from_header)
        .unwrap_or_else(RequestId::generate)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_request_id_is_kept() {
        let req = Request::builder()
            .header("x-request-id", "existing-id-123")
            .body(Body::empty())
            .unwrap();

        assert_eq!(request_id_for(&req).as_str(), "existing-id-123");
    }

    #[test]
    fn test_missing_request_id_is_generated() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let id = request_id_for(&req);
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn test_unusable_request_id_is_replaced() {
        let too_long = "a".repeat(MAX_REQUEST_ID_LEN + 1);
        for value in ["", "has space", too_long.as_str()] {
            let req = Request::builder()
                .header("x-request-id", value)
                .body(Body::empty())
                .unwrap();

            let id = request_id_for(&req);
            assert!(
                Uuid::parse_str(id.as_str()).is_ok(),
                "{value:?} should be replaced"
            );
        }
    }
}
