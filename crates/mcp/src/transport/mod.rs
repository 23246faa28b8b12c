//! Transport bindings.
//!
//! Every binding presents the same contract to a [`Session`](crate::Session):
//! a lazy sequence of raw inbound frames, a way to push outbound frames, and
//! a close. Framing differs; the session logic does not.

use std::future::Future;

use serde::Serialize;

use crate::error::Result;
use crate::protocol::RequestId;

pub mod outbox;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

/// Maximum inbound frame size (1MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// A serialized frame on its way to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    /// The request this frame belongs to. `None` for frames that answer
    /// nothing in particular, e.g. the error for an undecodable message.
    pub correlation: Option<RequestId>,
    /// The single final frame for `correlation`.
    pub terminal: bool,
    pub body: String,
}

impl OutboundFrame {
    /// An intermediate frame of an in-flight request.
    pub fn chunk(id: RequestId, message: &impl Serialize) -> Result<Self> {
        Ok(Self {
            correlation: Some(id),
            terminal: false,
            body: serde_json::to_string(message)?,
        })
    }

    /// The final response for `id`.
    pub fn terminal(id: Option<RequestId>, message: &impl Serialize) -> Result<Self> {
        Ok(Self {
            correlation: id,
            terminal: true,
            body: serde_json::to_string(message)?,
        })
    }
}

/// A bidirectional frame channel with one client.
pub trait Transport: Send + Sync + 'static {
    /// Next raw inbound frame; `None` once the client has disconnected.
    fn receive(&self) -> impl Future<Output = Option<Result<String>>> + Send;

    fn send(&self, frame: OutboundFrame) -> impl Future<Output = Result<()>> + Send;

    /// Flush and release the channel. Further sends fail with `Closed`.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}
