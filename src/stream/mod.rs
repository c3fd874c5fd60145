//! Streaming of detected utterances to a remote service.
//!
//! # Architecture
//!
//! ```text
//! SessionEvents ──▶ StreamSession (handlers + controller task)
//!                         │ spawns, reaps, retries
//!                         ▼
//!                     link task ──pop_nowait──▶ FrameRing
//!                         │
//!                         ▼
//!                   dyn Transport ◀── dyn Connector (WsConnector)
//! ```

pub mod heartbeat;
pub mod link;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod ws;

pub use heartbeat::{Heartbeat, HeartbeatAction};
pub use link::LinkOutcome;
pub use protocol::{encode_frame, ControlMessage, StartInfo};
pub use session::{StreamSession, StreamState};
pub use transport::{Connection, Connector, Transport, TransportError, TransportEvent};
pub use ws::WsConnector;
