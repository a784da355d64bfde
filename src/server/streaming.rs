//! SSE (Server-Sent Events) streaming for token-by-token responses.
//!
//! Each piece becomes a `piece` event. The terminal event is named after the
//! way the generation ended (`completed`, `cancelled` or `failed`) and carries
//! the accumulated text. A final `[DONE]` data line closes the stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::Event;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;

use crate::inference::stream::{GenerationEvent, GenerationStream, OutcomeSummary};
use crate::server::metrics::ServerMetrics;

/// Payload of a `piece` event.
#[derive(Debug, Serialize)]
pub struct PieceChunk<'a> {
    pub request_id: &'a str,
    pub content: &'a str,
}

/// Convert a generation stream into an SSE stream.
pub fn generation_to_sse_stream(
    stream: GenerationStream,
    metrics: Arc<ServerMetrics>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let request_id = stream.request_id().to_string();

    stream
        .map(move |event| {
            let event = match event {
                GenerationEvent::Piece(content) => {
                    let chunk = PieceChunk {
                        request_id: &request_id,
                        content: &content,
                    };
                    Event::default()
                        .event("piece")
                        .data(serde_json::to_string(&chunk).unwrap_or_default())
                }
                GenerationEvent::Finished(outcome) => {
                    metrics.record_outcome(&outcome);
                    let summary = OutcomeSummary::from(&outcome);
                    Event::default()
                        .event(outcome.end.as_str())
                        .data(serde_json::to_string(&summary).unwrap_or_default())
                }
            };
            Ok(event)
        })
        // Append the [DONE] sentinel after all events.
        .chain(futures::stream::once(async { Ok(Event::default().data("[DONE]")) }))
}
