use crate::traits::error::{RealtimeError, Result};
use crate::traits::frame::Frame;
use async_trait::async_trait;
use futures::{Sink, Stream};
use std::pin::Pin;

/// Outbound half of an open transport
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = RealtimeError> + Send>>;

/// Inbound half of an open transport
///
/// The stream ends when the peer closes the connection. An `Err` item is a
/// transport fault and ends the current connection epoch.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Bidirectional, ordered, message-framed byte channel
///
/// `open` is called once per connection attempt. The returned halves belong
/// to that attempt only; the client never reuses them after they fail.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a new connection to `url`
    async fn open(&self, url: &str) -> Result<(FrameSink, FrameStream)>;

    /// Short name used in log output
    fn name(&self) -> &'static str {
        "transport"
    }
}
