//! Token streaming for a single query.
//!
//! A generation runs as its own tokio task that drives the backend's step
//! primitive and forwards each piece over a channel. The consumer sees the
//! pieces as [`GenerationEvent::Piece`] followed by exactly one
//! [`GenerationEvent::Finished`] carrying the accumulated text, whether the
//! run completed, was cancelled or failed.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::stream::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::inference::backend::{BackendError, Step};
use crate::inference::session::{call_backend, BackendSlot, SessionError, SessionState};

/// Why a generation failed mid-stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Backend released during generation")]
    Released,

    #[error("Generation task aborted: {0}")]
    Aborted(String),
}

impl From<SessionError> for GenerationError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Backend(e) => GenerationError::Backend(e),
            SessionError::NotReady => GenerationError::Released,
            other => GenerationError::Aborted(other.to_string()),
        }
    }
}

/// How a generation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    /// The backend produced its end-of-generation marker.
    Completed,
    /// Cancelled by the consumer or the session.
    Cancelled,
    /// A backend primitive failed mid-stream.
    Failed(GenerationError),
}

impl StreamEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEnd::Completed => "completed",
            StreamEnd::Cancelled => "cancelled",
            StreamEnd::Failed(_) => "failed",
        }
    }
}

/// Final result of one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub request_id: String,

    /// Concatenation of every emitted piece.
    pub text: String,

    /// Number of pieces emitted.
    pub pieces: usize,

    pub end: StreamEnd,
}

impl GenerationOutcome {
    pub fn is_completed(&self) -> bool {
        self.end == StreamEnd::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.end == StreamEnd::Cancelled
    }

    pub fn error(&self) -> Option<&GenerationError> {
        match &self.end {
            StreamEnd::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Serializable view of an outcome for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeSummary {
    pub request_id: String,
    pub text: String,
    pub pieces: usize,
    pub finish_reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&GenerationOutcome> for OutcomeSummary {
    fn from(outcome: &GenerationOutcome) -> Self {
        Self {
            request_id: outcome.request_id.clone(),
            text: outcome.text.clone(),
            pieces: outcome.pieces,
            finish_reason: outcome.end.as_str(),
            error: outcome.error().map(|e| e.to_string()),
        }
    }
}

/// An event on a generation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// A newly generated piece of text.
    Piece(String),
    /// Terminal event; nothing follows it.
    Finished(GenerationOutcome),
}

/// Consumer side of a running generation.
pub struct GenerationStream {
    request_id: String,
    rx: mpsc::UnboundedReceiver<GenerationEvent>,
    cancel: CancellationToken,
    seen_text: String,
    seen_pieces: usize,
    finished: bool,
}

impl GenerationStream {
    pub(crate) fn new(
        request_id: String,
        rx: mpsc::UnboundedReceiver<GenerationEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request_id,
            rx,
            cancel,
            seen_text: String::new(),
            seen_pieces: 0,
            finished: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Request cancellation. Observed by the generation loop between steps.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this generation when triggered.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Receive the next event, or `None` once the terminal event was delivered.
    pub async fn next_event(&mut self) -> Option<GenerationEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        self.observe(event)
    }

    /// Drain the stream and return its outcome.
    ///
    /// If the generation task died without a terminal event, the text seen so
    /// far is still returned, marked as failed.
    pub async fn finish(mut self) -> GenerationOutcome {
        while let Some(event) = self.next_event().await {
            if let GenerationEvent::Finished(outcome) = event {
                return outcome;
            }
        }
        GenerationOutcome {
            request_id: self.request_id.clone(),
            text: std::mem::take(&mut self.seen_text),
            pieces: self.seen_pieces,
            end: StreamEnd::Failed(GenerationError::Aborted(
                "stream closed without a terminal event".to_string(),
            )),
        }
    }

    fn observe(&mut self, event: Option<GenerationEvent>) -> Option<GenerationEvent> {
        match &event {
            Some(GenerationEvent::Piece(piece)) => {
                self.seen_text.push_str(piece);
                self.seen_pieces += 1;
            }
            Some(GenerationEvent::Finished(_)) | None => self.finished = true,
        }
        event
    }
}

impl Stream for GenerationStream {
    type Item = GenerationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(event) => Poll::Ready(self.observe(event)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Producer side: drives the backend for one query.
pub(crate) struct GenerationTask {
    pub request_id: String,
    pub query: String,
    pub slot: BackendSlot,
    pub state: Arc<watch::Sender<SessionState>>,
    pub tx: mpsc::UnboundedSender<GenerationEvent>,
    pub cancel: CancellationToken,
}

impl GenerationTask {
    pub async fn run(self) -> GenerationOutcome {
        let start = Instant::now();
        info!(
            request_id = self.request_id,
            query_len = self.query.len(),
            "Starting generation"
        );

        let mut text = String::new();
        let mut pieces = 0;

        let query = self.query.clone();
        let end = match call_backend(&self.slot, move |b| b.start_completion(&query)).await {
            Ok(()) => self.drive(&mut text, &mut pieces).await,
            Err(e) => StreamEnd::Failed(e.into()),
        };

        self.cleanup(&end).await;

        // Back to Ready before the terminal event so the consumer can issue the next query.
        self.state.send_if_modified(|state| {
            if *state == SessionState::Generating {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        });

        let outcome = GenerationOutcome {
            request_id: self.request_id.clone(),
            text,
            pieces,
            end,
        };

        match &outcome.end {
            StreamEnd::Failed(e) => warn!(
                request_id = self.request_id,
                pieces = outcome.pieces,
                error = %e,
                "Generation failed"
            ),
            end => info!(
                request_id = self.request_id,
                pieces = outcome.pieces,
                end = end.as_str(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Generation finished"
            ),
        }

        if self.tx.send(GenerationEvent::Finished(outcome.clone())).is_err() {
            debug!(request_id = self.request_id, "Receiver dropped before terminal event");
        }

        outcome
    }

    async fn drive(&self, text: &mut String, pieces: &mut usize) -> StreamEnd {
        loop {
            if self.cancel.is_cancelled() {
                return StreamEnd::Cancelled;
            }

            let step = call_backend(&self.slot, |b| b.step()).await;

            // The in-flight step finished after cancellation was requested.
            if self.cancel.is_cancelled() {
                debug!(request_id = self.request_id, "Discarding step completed after cancel");
                return StreamEnd::Cancelled;
            }

            match step {
                Ok(Step::EndOfGeneration) => return StreamEnd::Completed,
                Ok(Step::Piece(piece)) => {
                    if piece.is_empty() {
                        continue;
                    }
                    if self.tx.send(GenerationEvent::Piece(piece.clone())).is_err() {
                        debug!(request_id = self.request_id, "Receiver dropped, stopping generation");
                        return StreamEnd::Cancelled;
                    }
                    text.push_str(&piece);
                    *pieces += 1;
                }
                Err(e) => return StreamEnd::Failed(e.into()),
            }
        }
    }

    /// Stop after a normal end, cancel otherwise. Failures are logged only.
    async fn cleanup(&self, end: &StreamEnd) {
        let result = match end {
            StreamEnd::Completed => call_backend(&self.slot, |b| b.stop_completion()).await,
            StreamEnd::Cancelled | StreamEnd::Failed(_) => {
                call_backend(&self.slot, |b| b.cancel_completion()).await
            }
        };

        if let Err(e) = result {
            warn!(
                request_id = self.request_id,
                end = end.as_str(),
                cleanup_error = %e,
                "Backend cleanup failed"
            );
        }
    }
}
