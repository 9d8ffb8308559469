// Run event streams: SSE frames from a streamed run response turned into `RunEvent`s.
use crate::assistant::{RunEvent, RunEventKind, RunEventStream};
use anyhow::anyhow;
use futures::StreamExt;
use serde_json::Value;
use sse_stream::SseStream;
use tracing::trace;

/// Turns a streamed run response into run events. The stream ends after `done` or EOF.
pub fn run_event_stream(response: reqwest::Response) -> RunEventStream {
    let frames = SseStream::from_byte_stream(response.bytes_stream())
        .map(|item| item.map_err(|err| anyhow!("run stream decode failed: {err}")))
        .boxed();
    futures::stream::unfold((frames, false), |(mut frames, finished)| async move {
        if finished {
            return None;
        }
        loop {
            match frames.next().await? {
                Ok(frame) => {
                    let Some(event) = frame_to_event(frame.event.as_deref(), frame.data.as_deref())
                    else {
                        continue;
                    };
                    let done = event.kind == RunEventKind::Done;
                    return Some((Ok(event), (frames, done)));
                }
                Err(err) => return Some((Err(err), (frames, true))),
            }
        }
    })
    .boxed()
}

/// Frames without an event name or data (keepalives, `retry:` hints) yield nothing.
fn frame_to_event(name: Option<&str>, data: Option<&str>) -> Option<RunEvent> {
    let name = name.map(str::trim).filter(|name| !name.is_empty());
    let raw = data.unwrap_or("").trim();
    if name.is_none() && raw.is_empty() {
        trace!("empty sse frame skipped");
        return None;
    }
    let kind = match name {
        Some(name) => RunEventKind::from_name(name),
        None if raw == "[DONE]" => RunEventKind::Done,
        None => RunEventKind::Unknown(String::new()),
    };
    let payload =
        serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Some(RunEvent::new(kind, payload))
}
