use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};

/// One server-sent event as the adapters see it. `id`/`retry` fields are dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    /// `None` for the default `message` type
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data<S: Into<String>>(data: S) -> Self {
        SseEvent {
            event: None,
            data: data.into(),
        }
    }
}

impl From<Event> for SseEvent {
    fn from(event: Event) -> Self {
        let name = match event.event.as_str() {
            "" | "message" => None,
            _ => Some(event.event),
        };
        SseEvent {
            event: name,
            data: event.data,
        }
    }
}

/// Frame a `text/event-stream` body. Lines and UTF-8 sequences split across
/// chunks are reassembled by `eventsource-stream`.
pub fn sse_events<S, B, E>(body: S) -> impl Stream<Item = Result<SseEvent, EventStreamError<E>>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    body.eventsource().map(|item| item.map(SseEvent::from))
}
