//! Contract for the facts appended to rental line and inventory unit streams.

use chrono::{DateTime, Utc};

/// A fact recorded against one aggregate stream.
///
/// Stored payloads are never rewritten. A variant that gains a field bumps its
/// [`Event::version`] and the new field must deserialize with a default.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Dotted `<context>.<aggregate>.<fact>` name such as `rental.line.closed`.
    /// Also the event name on the SSE stream.
    fn event_type(&self) -> &'static str;

    /// Payload schema version of this particular event.
    fn version(&self) -> u32 {
        1
    }

    /// System time of recording; business dates travel in the payload.
    fn occurred_at(&self) -> DateTime<Utc>;
}
