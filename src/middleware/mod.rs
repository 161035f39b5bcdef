//! HTTP middleware.
//!
//! - **Request ID**: generation and propagation of `X-Request-Id`, exposed to
//!   handlers and the HTTP trace span as a [`RequestId`] extension
//!
//! ```text
//! Request → Request ID → Trace → CORS → Body limit → Handler → Response
//!               ↓                                               ↑
//!         extension + span                            X-Request-Id header
//! ```

pub mod request_id;

pub use request_id::{REQUEST_ID_HEADER, RequestId, RequestIdLayer};
