//! Full-mesh peer-to-peer conferencing core.
//!
//! Every participant of a channel holds a direct connection to every other
//! participant. A shared, eventually-consistent document store is the only
//! signaling transport: offers, answers, and ICE candidates travel through
//! per-peer mailboxes that the recipient consumes and deletes. On top of
//! the mesh, a speaking detector classifies each stream with attack/release
//! hysteresis.
//!
//! The document store, the media-capture API, and the point-to-point
//! connection primitive are collaborators behind traits ([`store`],
//! [`media`], [`link`]); [`rtc`] binds the connection seam to the `webrtc`
//! crate. [`session`] runs the event loop that ties the pieces together.

pub mod error;
pub mod events;
pub mod link;
pub mod manager;
pub mod media;
pub mod membership;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod speaking;
pub mod store;

pub use error::{LocalMediaError, PeerConnectionError, SignalingError, StoreError};
pub use events::{EventReceiver, EventSender, SessionEvent};
pub use session::{ChannelSnapshot, Session, SessionCommand, SessionConfig, SessionHandle};
