//! Media seams. The controller never looks inside a description or a
//! candidate; it only decides when each one may be applied.

use async_trait::async_trait;
use serde_json::Value;

use parley_shared::call::CallKind;

use crate::error::Result;

/// Negotiation state of a peer connection, mirroring the usual offer/answer
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Captured local tracks (microphone, plus camera for video calls).
pub trait MediaStream: Send + Sync {
    /// Stop every track. Must be safe to call more than once.
    fn stop(&mut self);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&mut self) -> Result<Value>;
    async fn create_answer(&mut self) -> Result<Value>;
    async fn set_local_description(&mut self, description: Value) -> Result<()>;
    async fn set_remote_description(&mut self, description: Value) -> Result<()>;
    async fn add_ice_candidate(&mut self, candidate: Value) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;
    fn has_local_description(&self) -> bool;
    fn has_remote_description(&self) -> bool;

    fn close(&mut self);
}

/// Acquires local media and builds peer connections around it.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    type Stream: MediaStream;
    type Peer: PeerConnection;

    /// Microphone only for audio calls, microphone and camera for video.
    /// May suspend on a permission prompt.
    async fn acquire(&self, kind: CallKind) -> Result<Self::Stream>;

    /// A new peer connection carrying `local`'s tracks.
    async fn create_peer(&self, local: &Self::Stream) -> Result<Self::Peer>;
}
