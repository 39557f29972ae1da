//! # parley-client
//!
//! Client side of a Parley call: the [`CallController`] state machine that
//! drives a call from the first click to teardown, plus the seams it talks
//! through.
//!
//! - [`CallApi`] reaches the REST surface ([`HttpCallApi`] over `reqwest`)
//! - [`MediaEngine`] / [`PeerConnection`] wrap whatever media stack the
//!   embedding application uses; payloads stay opaque JSON
//! - [`SignalSink`] carries outbound events over the WebSocket
//! - [`ClientNotice`]s flow back to the UI over an mpsc channel

pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod peer;
pub mod signaling;

pub use api::{CallApi, HttpCallApi};
pub use config::ClientConfig;
pub use controller::{spawn_self_check, ActiveCall, CallController, CallPhase, SignalSink};
pub use error::{ClientError, Result};
pub use events::ClientNotice;
pub use peer::{MediaEngine, MediaStream, PeerConnection, SignalingState};
