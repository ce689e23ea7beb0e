use fleet_core::{EventStream, WorkflowEvent};
use futures_util::stream::{self, Stream, StreamExt};

/// The last frame of every stream, after the terminal event.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// One `data:` frame carrying the event as a single JSON line.
pub fn frame_event(event: &WorkflowEvent) -> String {
    format!("data: {}\n\n", event.to_json_line())
}

/// Frame a whole event stream, appending [`DONE_FRAME`] once it ends.
pub fn frame_stream(events: EventStream) -> impl Stream<Item = String> + Send {
    events
        .map(|event| frame_event(&event))
        .chain(stream::once(async { DONE_FRAME.to_string() }))
}
