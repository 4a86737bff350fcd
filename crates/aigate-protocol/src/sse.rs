use bytes::Bytes;

use crate::stream::StreamEvent;

/// Frame a stream event as a server-sent-event chunk.
pub fn frame(event: &StreamEvent) -> Result<Bytes, serde_json::Error> {
    let data = serde_json::to_string(event)?;
    Ok(Bytes::from(format!(
        "event: {}\ndata: {}\n\n",
        event.name(),
        data
    )))
}
