//! Publish and stream handlers.
//!
//! # Endpoints
//!
//! - `POST /messages/{id}` - Append one message to the destination's topic
//! - `GET /messages/{id}?start=oldest|newest` - Stream the topic as ndjson
//!
//! # Streaming
//!
//! A stream response is `application/x-ndjson`: one message per line, each
//! written as soon as it is read. The response never ends on its own while
//! the topic is live. Dropping the connection cancels the stream and releases
//! its broker connection and cursor.

use std::convert::Infallible;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use tracing::{debug, instrument};

use crate::broker::{Broker, StartOffset};
use crate::error::AppResult;
use crate::models::{Destination, PublishResponse, StreamQuery};
use crate::state::AppState;

/// Content type of stream responses.
pub const NDJSON: &str = "application/x-ndjson";

/// Publish one message.
///
/// The body must decode as a [`Message`](crate::models::Message): a JSON
/// object whose `timestamp`, `sender`, `receiver` and `message` fields, where
/// present, are strings. It is stored exactly as sent.
///
/// # Request Body
///
/// ```json
/// {"timestamp":"t1","sender":"a","receiver":"b","message":"hi"}
/// ```
///
/// # Responses
///
/// - `201` with `{"status":"accepted","topic":"messages-room1","timestamp":...}`
/// - `400` for an invalid payload or destination id
/// - `503` when the broker is unreachable, `500`/`504` when the append fails
#[instrument(skip(state, body), fields(size = body.len()))]
pub async fn publish<B: Broker>(
    State(state): State<AppState<B>>,
    Path(id): Path<String>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<PublishResponse>)> {
    let destination = Destination::from_id(&id, &state.config.topic_prefix)?;
    let response = state.publisher.publish(&destination, body).await?;

    Ok((StatusCode::CREATED, Json(response)))
}

/// Stream a destination's messages, oldest first by default.
///
/// Errors opening the connection or cursor are returned as regular error
/// responses. Once the body has started, any failure just ends it.
#[instrument(skip(state, query))]
pub async fn stream_messages<B: Broker>(
    State(state): State<AppState<B>>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> AppResult<Response> {
    let destination = Destination::from_id(&id, &state.config.topic_prefix)?;
    let start = StartOffset::from_query(query.start.as_deref())?;

    let cancel = state.stream_token();
    let handle = state
        .streams
        .open(&destination, start, cancel.clone())
        .await?;
    debug!(client = %handle.client, "Streaming");

    // Dropping the body (client gone) cancels the stream
    let guard = cancel.drop_guard();
    let mut output = handle.output;
    let body = Body::from_stream(async_stream::stream! {
        let _guard = guard;
        while let Some(line) = output.recv().await {
            yield Ok::<_, Infallible>(line);
        }
    });

    Ok((
        [(CONTENT_TYPE, NDJSON), (CACHE_CONTROL, "no-cache")],
        body,
    )
        .into_response())
}
