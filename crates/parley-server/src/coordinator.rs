//! Call coordinator: the only writer of call session state besides the
//! reaper.
//!
//! Every transition is a compare-and-set on the stored state. A transition
//! that loses a race re-reads the session and decides again instead of
//! overwriting what the winner wrote.

use std::sync::Arc;

use tracing::{debug, info, warn};

use parley_shared::call::{CallHistoryEntry, CallKind, CallSession, CallState, CallStatus};
use parley_shared::protocol::ServerEvent;
use parley_shared::types::{SessionId, UserId};
use parley_store::StoreError;

use crate::clock::Clock;
use crate::error::CallError;
use crate::presence::PresenceRegistry;
use crate::store::CallStore;

/// How many times a transition re-reads after losing a race before giving up.
const MAX_TRANSITION_ATTEMPTS: usize = 3;

/// What `initiate` does about an active session it collides with.
#[derive(Debug, PartialEq, Eq)]
enum Conflict {
    /// A leftover ringing session between the same two users: end it.
    Stale,
    Reject(ConflictKind),
}

#[derive(Debug, PartialEq, Eq)]
enum ConflictKind {
    AlreadyInCall,
    PeerBusy,
    CallInProgress,
}

fn classify(session: &CallSession, caller: UserId, receiver: UserId) -> Conflict {
    if session.state == CallState::Ringing && session.connects(caller, receiver) {
        Conflict::Stale
    } else if session.is_participant(caller) {
        Conflict::Reject(ConflictKind::AlreadyInCall)
    } else if session.state == CallState::Ongoing {
        Conflict::Reject(ConflictKind::PeerBusy)
    } else {
        Conflict::Reject(ConflictKind::CallInProgress)
    }
}

impl From<ConflictKind> for CallError {
    fn from(kind: ConflictKind) -> Self {
        match kind {
            ConflictKind::AlreadyInCall => CallError::AlreadyInCall,
            ConflictKind::PeerBusy => CallError::PeerBusy,
            ConflictKind::CallInProgress => CallError::CallInProgress,
        }
    }
}

#[derive(Clone)]
pub struct CallCoordinator {
    store: CallStore,
    presence: PresenceRegistry,
    clock: Arc<dyn Clock>,
    history_limit: u32,
}

impl CallCoordinator {
    pub fn new(
        store: CallStore,
        presence: PresenceRegistry,
        clock: Arc<dyn Clock>,
        history_limit: u32,
    ) -> Self {
        Self {
            store,
            presence,
            clock,
            history_limit,
        }
    }

    pub async fn user_exists(&self, user: UserId) -> Result<bool, CallError> {
        Ok(self.store.with(|db| db.find_user(user)).await?.is_some())
    }

    /// Start a call from `caller` to `receiver`.
    pub async fn initiate(
        &self,
        caller: UserId,
        receiver: UserId,
        kind: CallKind,
    ) -> Result<CallSession, CallError> {
        if caller == receiver {
            return Err(CallError::InvalidTarget);
        }

        let (caller_user, receiver_user) = self
            .store
            .with(|db| Ok((db.find_user(caller)?, db.find_user(receiver)?)))
            .await?;
        let caller_user = caller_user.ok_or(CallError::Unauthorized)?;
        if receiver_user.is_none() {
            return Err(CallError::NotFound("User"));
        }

        let active = self
            .store
            .with(|db| db.find_active_sessions_touching(&[caller, receiver]))
            .await?;

        let mut stale = Vec::new();
        for session in &active {
            match classify(session, caller, receiver) {
                Conflict::Stale => stale.push(session.id),
                Conflict::Reject(kind) => {
                    info!(
                        caller = %caller.short(),
                        receiver = %receiver.short(),
                        blocking = %session.id,
                        reason = ?kind,
                        "Call attempt rejected"
                    );
                    return Err(kind.into());
                }
            }
        }

        let now = self.clock.now();
        for id in stale {
            let ended = self
                .store
                .with(|db| db.finish_call_session(id, &[CallState::Ringing], CallState::Ended, now, 0))
                .await?;
            if ended {
                info!(session = %id, "Ended stale ringing session before new call");
            }
        }

        let session = CallSession::ringing(caller, receiver, kind, now);
        self.store.with(|db| db.insert_call_session(&session)).await?;

        info!(
            session = %session.id,
            caller = %caller.short(),
            receiver = %receiver.short(),
            kind = kind.as_str(),
            "Call initiated"
        );

        self.presence
            .notify(
                receiver,
                ServerEvent::IncomingCall {
                    session_id: session.id,
                    kind,
                    caller: caller_user.profile(),
                },
            )
            .await;

        self.reload(session.id).await
    }

    /// Receiver accepts a ringing session.
    pub async fn answer(&self, session_id: SessionId, user: UserId) -> Result<CallSession, CallError> {
        let session = self.load(session_id).await?;
        if session.receiver_id != user {
            return Err(CallError::Forbidden);
        }
        if !session.state.can_transition_to(CallState::Ongoing) {
            return Err(CallError::InvalidState {
                expected: CallState::Ringing,
                actual: session.state,
            });
        }

        let now = self.clock.now();
        let won = self
            .store
            .with(|db| db.mark_call_ongoing(session_id, now))
            .await?;
        if !won {
            let current = self.load(session_id).await?;
            return Err(CallError::InvalidState {
                expected: CallState::Ringing,
                actual: current.state,
            });
        }

        info!(session = %session_id, "Call answered");

        let receiver = self.store.with(|db| db.get_user_profile(user)).await?;
        self.presence
            .notify(
                session.caller_id,
                ServerEvent::CallAnswered {
                    session_id,
                    receiver,
                },
            )
            .await;

        self.reload(session_id).await
    }

    /// Receiver declines. Always succeeds for the receiver: a ringing session
    /// becomes `declined`, an ongoing one is hung up, a finished one is
    /// returned unchanged.
    pub async fn decline(&self, session_id: SessionId, user: UserId) -> Result<CallSession, CallError> {
        let mut session = self.load(session_id).await?;
        if session.receiver_id != user {
            return Err(CallError::Forbidden);
        }

        if session.state.can_transition_to(CallState::Declined) {
            let now = self.clock.now();
            let won = self
                .store
                .with(|db| {
                    db.finish_call_session(
                        session_id,
                        &[CallState::Ringing],
                        CallState::Declined,
                        now,
                        0,
                    )
                })
                .await?;

            if won {
                info!(session = %session_id, "Call declined");
                self.presence
                    .notify(session.caller_id, ServerEvent::CallDeclined { session_id })
                    .await;
                return self.reload(session_id).await;
            }
            session = self.load(session_id).await?;
        }

        if session.state == CallState::Ongoing {
            debug!(session = %session_id, "Decline on ongoing call, hanging up");
            return self.hang_up(session).await;
        }

        debug!(session = %session_id, state = %session.state, "Decline on finished call ignored");
        Ok(session)
    }

    /// Either participant ends the session. Duration counts from answer.
    pub async fn end(&self, session_id: SessionId, user: UserId) -> Result<CallSession, CallError> {
        let session = self.load(session_id).await?;
        if !session.is_participant(user) {
            return Err(CallError::Forbidden);
        }
        self.hang_up(session).await
    }

    /// End every ringing/ongoing session touching `user`, with zero duration.
    pub async fn force_cleanup(&self, user: UserId) -> Result<usize, CallError> {
        let now = self.clock.now();
        let (active, cleaned) = self
            .store
            .with(|db| {
                let active = db.find_active_sessions_touching(&[user])?;
                let cleaned = db.end_active_sessions_for_user(user, now)?;
                Ok((active, cleaned))
            })
            .await?;

        if cleaned > 0 {
            info!(user = %user.short(), cleaned, "Force-cleaned active sessions");
        }

        for session in active {
            if let Some(peer) = session.counterpart(user) {
                self.presence
                    .notify(
                        peer,
                        ServerEvent::CallEnded {
                            session_id: session.id,
                            duration: 0,
                        },
                    )
                    .await;
            }
        }

        Ok(cleaned)
    }

    pub async fn status(&self, user: UserId) -> Result<CallStatus, CallError> {
        let active = self
            .store
            .with(|db| db.find_active_session_for_user(user))
            .await?;

        Ok(match active {
            Some(session) => CallStatus::active(session, user),
            None => CallStatus::idle(),
        })
    }

    /// Sessions currently ringing or ongoing, across all users.
    pub async fn active_call_count(&self) -> Result<usize, CallError> {
        Ok(self.store.with(|db| db.count_active_sessions()).await?)
    }

    pub async fn history(&self, user: UserId) -> Result<Vec<CallHistoryEntry>, CallError> {
        let limit = self.history_limit;
        Ok(self
            .store
            .with(|db| db.call_history_for_user(user, limit))
            .await?)
    }

    /// The session, if `user` takes part in it.
    pub async fn session_for_participant(
        &self,
        session_id: SessionId,
        user: UserId,
    ) -> Result<CallSession, CallError> {
        let session = self.load(session_id).await?;
        if !session.is_participant(user) {
            return Err(CallError::Forbidden);
        }
        Ok(session)
    }

    /// Move an active session to `ended`, conditioned on the exact state read
    /// so a concurrent answer cannot be billed as a zero-length call.
    async fn hang_up(&self, mut session: CallSession) -> Result<CallSession, CallError> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            if !session.state.can_transition_to(CallState::Ended) {
                debug!(session = %session.id, state = %session.state, "Session already finished");
                return Ok(session);
            }

            let now = self.clock.now();
            let duration = session.elapsed_seconds(now);
            let (id, from) = (session.id, session.state);
            let won = self
                .store
                .with(|db| db.finish_call_session(id, &[from], CallState::Ended, now, duration))
                .await?;

            if won {
                info!(session = %id, duration, "Call ended");
                for participant in [session.caller_id, session.receiver_id] {
                    self.presence
                        .notify(
                            participant,
                            ServerEvent::CallEnded {
                                session_id: id,
                                duration,
                            },
                        )
                        .await;
                }
                return self.reload(id).await;
            }

            session = self.load(id).await?;
        }

        warn!(session = %session.id, "Gave up ending session after repeated races");
        Err(CallError::Internal(format!(
            "session {} kept changing state",
            session.id
        )))
    }

    async fn load(&self, session_id: SessionId) -> Result<CallSession, CallError> {
        match self.store.with(|db| db.get_call_session(session_id)).await {
            Ok(session) => Ok(session),
            Err(StoreError::NotFound) => Err(CallError::NotFound("Call")),
            Err(e) => Err(e.into()),
        }
    }

    async fn reload(&self, session_id: SessionId) -> Result<CallSession, CallError> {
        Ok(self.store.with(|db| db.get_call_session(session_id)).await?)
    }
}
