use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use parley_shared::call::CallRole;
use parley_shared::protocol::ClientEvent;
use parley_shared::types::SessionId;

use crate::peer::SignalingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Group not joined yet.
    Idle,
    Joined,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Connected,
    Closed,
}

/// Remote ICE candidates that arrived before the remote description.
///
/// Arrival order is kept. The oldest entry is evicted when the buffer is
/// full, and entries older than `max_age` are dropped at flush time.
#[derive(Debug)]
pub struct CandidateBuffer {
    entries: VecDeque<(Instant, Value)>,
    max_age: Duration,
    capacity: usize,
}

impl CandidateBuffer {
    pub fn new(max_age: Duration, capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_age,
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, candidate: Value, now: Instant) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            warn!(capacity = self.capacity, "Candidate buffer full, evicting oldest");
        }
        self.entries.push_back((now, candidate));
    }

    /// Take every buffered candidate still young enough to apply, oldest first.
    pub fn drain_fresh(&mut self, now: Instant) -> Vec<Value> {
        let mut fresh = Vec::with_capacity(self.entries.len());
        let mut expired = 0usize;

        for (arrived, candidate) in self.entries.drain(..) {
            if now.saturating_duration_since(arrived) <= self.max_age {
                fresh.push(candidate);
            } else {
                expired += 1;
            }
        }

        if expired > 0 {
            warn!(expired, "Dropped stale ICE candidates");
        }
        fresh
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Per-call signaling bookkeeping: which messages have gone out, which have
/// been accepted, and the candidates waiting for a remote description.
pub struct SignalingSession {
    pub session_id: SessionId,
    pub role: CallRole,
    pub state: NegotiationState,
    pub candidates: CandidateBuffer,
    /// Our last offer, kept so it can be re-sent when the receiver asks.
    local_offer: Option<Value>,
}

impl SignalingSession {
    pub fn new(session_id: SessionId, role: CallRole, candidates: CandidateBuffer) -> Self {
        Self {
            session_id,
            role,
            state: NegotiationState::Idle,
            candidates,
            local_offer: None,
        }
    }

    pub fn join(&mut self) -> ClientEvent {
        self.state = NegotiationState::Joined;
        debug!(session = %self.session_id, role = ?self.role, "Joining call group");
        ClientEvent::JoinCall {
            session_id: self.session_id,
        }
    }

    pub fn create_offer(&mut self, payload: Value) -> ClientEvent {
        self.state = NegotiationState::OfferSent;
        self.local_offer = Some(payload.clone());
        debug!(session = %self.session_id, "Sending offer");
        ClientEvent::Offer {
            session_id: self.session_id,
            payload,
        }
    }

    /// The pending offer again, if it is still waiting for an answer. The
    /// receiver asks for this once it is ready, since an offer sent before it
    /// joined the group was dropped by the relay.
    pub fn resend_offer(&self) -> Option<ClientEvent> {
        if self.state != NegotiationState::OfferSent {
            return None;
        }
        self.local_offer.clone().map(|payload| ClientEvent::Offer {
            session_id: self.session_id,
            payload,
        })
    }

    /// Tell the caller we are ready for its offer.
    pub fn request_offer(&self) -> ClientEvent {
        ClientEvent::Renegotiate {
            session_id: self.session_id,
        }
    }

    pub fn create_answer(&mut self, payload: Value) -> ClientEvent {
        self.state = NegotiationState::AnswerSent;
        debug!(session = %self.session_id, "Sending answer");
        ClientEvent::Answer {
            session_id: self.session_id,
            payload,
        }
    }

    pub fn create_ice_candidate(&self, candidate: Value) -> ClientEvent {
        ClientEvent::IceCandidate {
            session_id: self.session_id,
            candidate,
        }
    }

    /// Whether an incoming offer should be processed. Only the receiver takes
    /// offers, and only until it has answered.
    pub fn accept_offer(&mut self) -> bool {
        let accept = self.role == CallRole::Receiver
            && matches!(
                self.state,
                NegotiationState::Idle | NegotiationState::Joined | NegotiationState::OfferReceived
            );
        if accept {
            self.state = NegotiationState::OfferReceived;
        } else {
            debug!(session = %self.session_id, state = ?self.state, "Ignoring offer");
        }
        accept
    }

    /// Whether an incoming answer should be applied: only to our own pending
    /// offer, and only once.
    pub fn accept_answer(&self, peer_state: SignalingState, has_remote: bool) -> bool {
        let accept = self.role == CallRole::Caller
            && self.state == NegotiationState::OfferSent
            && peer_state == SignalingState::HaveLocalOffer
            && !has_remote;
        if !accept {
            warn!(
                session = %self.session_id,
                state = ?self.state,
                peer_state = ?peer_state,
                "Skipping unexpected answer"
            );
        }
        accept
    }

    pub fn mark_connected(&mut self) {
        self.state = NegotiationState::Connected;
    }

    pub fn leave(&mut self) -> Option<ClientEvent> {
        let joined = self.state != NegotiationState::Idle && self.state != NegotiationState::Closed;
        self.state = NegotiationState::Closed;
        self.candidates.clear();
        joined.then_some(ClientEvent::LeaveCall {
            session_id: self.session_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn buffer() -> CandidateBuffer {
        CandidateBuffer::new(Duration::from_secs(5), 3)
    }

    #[test]
    fn test_buffer_keeps_order_and_evicts_oldest() {
        let mut buf = buffer();
        let now = Instant::now();
        for i in 0..4 {
            buf.push(json!(i), now);
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.drain_fresh(now), vec![json!(1), json!(2), json!(3)]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_buffer_drops_expired() {
        let mut buf = buffer();
        let start = Instant::now();
        buf.push(json!("old"), start);
        buf.push(json!("new"), start + Duration::from_secs(4));

        let fresh = buf.drain_fresh(start + Duration::from_secs(6));
        assert_eq!(fresh, vec![json!("new")]);
    }

    #[test]
    fn test_receiver_accepts_one_offer() {
        let mut session = SignalingSession::new(SessionId::new(), CallRole::Receiver, buffer());
        session.join();
        assert!(session.accept_offer());
        session.create_answer(json!({"sdp": "answer"}));
        assert!(!session.accept_offer());
    }

    #[test]
    fn test_caller_never_takes_offers() {
        let mut session = SignalingSession::new(SessionId::new(), CallRole::Caller, buffer());
        assert!(!session.accept_offer());
    }

    #[test]
    fn test_answer_guard() {
        let mut session = SignalingSession::new(SessionId::new(), CallRole::Caller, buffer());
        assert!(!session.accept_answer(SignalingState::HaveLocalOffer, false));

        session.create_offer(json!({"sdp": "offer"}));
        assert!(!session.accept_answer(SignalingState::Stable, false));
        assert!(!session.accept_answer(SignalingState::HaveLocalOffer, true));
        assert!(session.accept_answer(SignalingState::HaveLocalOffer, false));
    }

    #[test]
    fn test_offer_resent_only_while_pending() {
        let mut session = SignalingSession::new(SessionId::new(), CallRole::Caller, buffer());
        assert!(session.resend_offer().is_none());

        session.create_offer(json!({"sdp": "offer"}));
        match session.resend_offer() {
            Some(ClientEvent::Offer { payload, .. }) => assert_eq!(payload["sdp"], "offer"),
            other => panic!("unexpected: {other:?}"),
        }

        session.mark_connected();
        assert!(session.resend_offer().is_none());
    }

    #[test]
    fn test_leave_only_after_join() {
        let mut session = SignalingSession::new(SessionId::new(), CallRole::Caller, buffer());
        assert!(session.leave().is_none());

        let mut joined = SignalingSession::new(SessionId::new(), CallRole::Caller, buffer());
        joined.join();
        assert!(matches!(joined.leave(), Some(ClientEvent::LeaveCall { .. })));
        assert_eq!(joined.state, NegotiationState::Closed);
    }
}
