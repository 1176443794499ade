//! Signaling: wire envelopes, framing, and the rendezvous relay

pub mod envelope;
pub mod framing;
pub mod relay_client;
pub mod relay_server;

pub use envelope::{CandidateInfo, DescriptionKind, SessionDescription, SignalingEnvelope};
pub use relay_client::{RelayClient, RelayEvent, SignalError};
pub use relay_server::RelayServer;
