//! # pulse-realtime
//!
//! Live delivery to connected clients:
//!
//! - [`session`]: binds a connection to an optional [`Identity`]
//! - [`filter`]: per-subscription predicates (authentication, roles, ownership, arguments)
//! - [`registry`]: the concurrent subscription set, implementing
//!   [`pulse_events::LiveEventSink`]
//! - [`protocol`]: the `graphql-transport-ws` state machine
//! - [`hub`]: the axum websocket driver

pub mod error;
pub mod filter;
pub mod hub;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod session;

pub use error::{AuthError, SubscribeError};
pub use filter::{required_roles, SubscriptionArgs, SubscriptionFilter};
pub use hub::{RealtimeConfig, RealtimeHub};
pub use identity::{AuthConfig, Identity, JwtTokenVerifier, Role, TokenVerifier};
pub use protocol::{ClientMessage, ProtocolSession, Reply, ServerMessage, SUBPROTOCOL};
pub use registry::{Subscriber, SubscriptionHandle, SubscriptionRegistry, SubscriptionState};
pub use session::{ConnectionSession, ConnectionSessionManager};
