mod message;
mod packet;

pub use message::{Message, MessageDisposition};
pub use packet::{CallbackContext, Packet, SendCallback};

/// Current wall-clock time as milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
