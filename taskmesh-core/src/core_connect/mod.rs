//! Connection establishment and lifecycle
//!
//! The negotiator turns discovered peers into data channels; the
//! registry owns every live connection and is the single source of
//! truth for who is reachable.

pub mod listener;
pub mod negotiator;
pub mod peer_connection;
pub mod registry;
pub mod rendezvous;
pub mod state;

pub use listener::DataListener;
pub use negotiator::{NegotiationAction, Negotiator, ProximityNegotiator};
pub use peer_connection::{PeerConnection, TransportEvent};
pub use registry::ConnectionRegistry;
pub use rendezvous::RendezvousNegotiator;
pub use state::PeerState;
