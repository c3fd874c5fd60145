//! Transport seam between the streaming link and the network.
//!
//! A [`Connector`] opens [`Connection`]s.  Each connection pairs a
//! [`Transport`] (the send side) with a receiver of [`TransportEvent`]s
//! (pongs and the disconnect notification).

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {uri} failed: {reason}")]
    Connect { uri: String, reason: String },

    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    #[error("send failed: {0}")]
    Send(String),

    #[error("connection closed")]
    Closed,

    #[error("failed to encode control message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Notifications from the receive side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Pong,
    Disconnected,
}

#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Queue one binary message.  It may stay buffered until
    /// [`flush`](Self::flush); buffered bytes show up in
    /// [`in_flight_bytes`](Self::in_flight_bytes).
    async fn send_binary(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Push buffered messages to the network.
    async fn flush(&mut self) -> Result<(), TransportError>;

    fn in_flight_bytes(&self) -> usize;

    fn is_connected(&self) -> bool;

    async fn close(&mut self);
}

pub struct Connection {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Connection, TransportError>;
}

const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn Transport>, _: Box<dyn Connector>) {}
};
