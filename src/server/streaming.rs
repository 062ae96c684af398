//! SSE (Server-Sent Events) streaming of pipeline progress.
//!
//! Each [`PipelineEvent`] becomes one `data:` line, followed by a `result`
//! event carrying the full reply and the `[DONE]` sentinel.

use axum::response::sse::Event;
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::pipeline::PipelineEvent;
use crate::protocol::GenerateResponse;

/// Final event of a stream.
#[derive(Debug, Serialize)]
pub struct ResultEvent {
    pub event: &'static str,
    #[serde(flatten)]
    pub response: GenerateResponse,
}

impl ResultEvent {
    pub fn new(response: GenerateResponse) -> Self {
        Self {
            event: "result",
            response,
        }
    }
}

/// Convert pipeline progress and the eventual reply into an SSE stream.
pub fn pipeline_to_sse_stream(
    events: mpsc::Receiver<PipelineEvent>,
    result: oneshot::Receiver<GenerateResponse>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let progress = ReceiverStream::new(events).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().data(data))
    });

    let outcome = futures::stream::once(result).map(|received| {
        let response = received.unwrap_or_else(|_| {
            GenerateResponse::failure("generation task ended without a reply")
        });
        let data = serde_json::to_string(&ResultEvent::new(response)).unwrap_or_default();
        Ok(Event::default().data(data))
    });

    progress
        .chain(outcome)
        // Append the [DONE] sentinel after all events.
        .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::OutputKind;

    #[tokio::test]
    async fn test_progress_then_result_then_done() {
        let (tx, rx) = mpsc::channel(4);
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(PipelineEvent::StageStarted {
            kind: OutputKind::Texture,
            backend: "mock".into(),
        })
        .await
        .unwrap();
        drop(tx);
        done_tx.send(GenerateResponse::failure("boom")).unwrap();

        let events: Vec<_> = pipeline_to_sse_stream(rx, done_rx).collect().await;
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_result_event_is_flat() {
        let value = serde_json::to_value(ResultEvent::new(GenerateResponse::failure("boom"))).unwrap();
        assert_eq!(value["event"], "result");
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "boom");
    }
}
