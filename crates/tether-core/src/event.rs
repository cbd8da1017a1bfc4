#![forbid(unsafe_code)]

//! Client-originated event payloads.

/// An event delivered from the client to a registered handler.
///
/// The payload body is the raw JSON text the client sent; decoding it is
/// the handler's business (wire plumbing stays outside the core).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventPayload {
    /// Event name, e.g. `"click"` or `"input"`.
    pub event: String,
    /// Raw JSON payload as received.
    pub data: String,
}

impl EventPayload {
    /// Build a payload.
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}
