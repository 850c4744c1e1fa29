//! SSE consumption: byte stream -> `SseEnvelope`, restartable from a
//! sequence cursor, with finish-detection for a single run's topic
//! (spec.md §4.1, §6, testable property 5).

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use eventsource_stream::Eventsource;
use polos_contracts::SseEnvelope;

pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Result<SseEnvelope>> + Send>>;

/// Wrap a raw byte stream (as returned by `reqwest::Response::bytes_stream`)
/// into a lazy stream of parsed `SseEnvelope`s. Comment lines and keepalive
/// pings are dropped by `eventsource_stream`'s own line-accumulation /
/// blank-line-flush logic; we only have to decode the JSON payload.
pub fn parse<S, E>(byte_stream: S) -> EnvelopeStream
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    Box::pin(byte_stream.eventsource().filter_map(|res| async move {
        match res {
            Ok(event) if event.data.is_empty() => None,
            Ok(event) => Some(
                serde_json::from_str::<SseEnvelope>(&event.data)
                    .map_err(|e| ClientError::Decode(e.to_string())),
            ),
            Err(e) => Some(Err(ClientError::NetworkError(e.to_string()))),
        }
    }))
}

/// Well-known finish event types a run stream halts on (spec.md §6).
pub const FINISH_EVENT_TYPES: &[&str] = &["workflow_finish", "agent_finish"];

pub fn is_run_finish(env: &SseEnvelope, run_execution_id: Uuid) -> bool {
    FINISH_EVENT_TYPES.contains(&env.event_type.as_str())
        && env.metadata_execution_id() == Some(run_execution_id)
}

/// Stops iteration right after yielding the first finish event whose
/// `_metadata.execution_id` matches `run_execution_id`.
pub struct RunEventStream {
    inner: EnvelopeStream,
    run_execution_id: Uuid,
    done: bool,
}

impl RunEventStream {
    pub fn new(inner: EnvelopeStream, run_execution_id: Uuid) -> Self {
        Self {
            inner,
            run_execution_id,
            done: false,
        }
    }
}

impl Stream for RunEventStream {
    type Item = Result<SseEnvelope>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(env))) => {
                if is_run_finish(&env, self.run_execution_id) {
                    self.done = true;
                }
                Poll::Ready(Some(Ok(env)))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::stream;

    fn envelope(event_type: &str, exec_id: Option<Uuid>) -> String {
        let data = match exec_id {
            Some(id) => serde_json::json!({ "_metadata": { "execution_id": id.to_string() } }),
            None => serde_json::json!({}),
        };
        let env = SseEnvelope {
            id: Uuid::now_v7(),
            sequence_id: 1,
            topic: "workflow/wf/run".into(),
            event_type: event_type.into(),
            data,
            created_at: Utc::now(),
        };
        format!("data: {}\n\n", serde_json::to_string(&env).unwrap())
    }

    fn byte_chunks(lines: Vec<String>) -> impl Stream<Item = std::result::Result<bytes::Bytes, std::io::Error>> {
        stream::iter(lines.into_iter().map(|l| Ok(bytes::Bytes::from(l))))
    }

    #[tokio::test]
    async fn halts_after_matching_finish_event() {
        let run_id = Uuid::now_v7();
        let other_id = Uuid::now_v7();
        let lines = vec![
            envelope("step_start", Some(run_id)),
            envelope("agent_finish", Some(other_id)),
            envelope("agent_finish", Some(run_id)),
            // Should never be reached.
            envelope("step_start", Some(run_id)),
        ];
        let parsed = parse(byte_chunks(lines));
        let mut run_stream = RunEventStream::new(parsed, run_id);

        let mut seen = Vec::new();
        while let Some(item) = run_stream.next().await {
            seen.push(item.unwrap().event_type);
        }
        assert_eq!(seen, vec!["step_start", "agent_finish", "agent_finish"]);
    }

    #[tokio::test]
    async fn ignores_keepalive_comments() {
        let run_id = Uuid::now_v7();
        let lines = vec![
            ": keepalive\n\n".to_string(),
            envelope("agent_finish", Some(run_id)),
        ];
        let mut parsed = parse(byte_chunks(lines));
        let first = parsed.next().await.unwrap().unwrap();
        assert_eq!(first.event_type, "agent_finish");
    }
}
