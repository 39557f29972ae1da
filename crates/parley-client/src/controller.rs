//! Client call controller.
//!
//! Phases run `Idle -> Calling -> RingingRemote` on the caller side and
//! `Idle -> RingingLocal` on the receiver side, then `Connecting ->
//! Connected -> Idle` for both. The controller is driven from two places:
//! user actions (`start_call`, `answer`, `decline`, `hang_up`) and server
//! events fed through [`CallController::handle_event`]. Wrap it in
//! `Arc<Mutex<_>>` to share it between the two and the self-check task.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use parley_shared::call::{CallHistoryEntry, CallKind, CallRole, CallSession, CallState};
use parley_shared::error::ErrorCode;
use parley_shared::protocol::{ClientEvent, ServerEvent};
use parley_shared::types::{SessionId, UserId, UserProfile};

use crate::api::CallApi;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::ClientNotice;
use crate::peer::{MediaEngine, MediaStream, PeerConnection};
use crate::signaling::{CandidateBuffer, SignalingSession};

/// Outbound half of the event WebSocket.
pub trait SignalSink: Send + Sync {
    fn send(&self, event: ClientEvent) -> Result<()>;
}

impl SignalSink for mpsc::UnboundedSender<ClientEvent> {
    fn send(&self, event: ClientEvent) -> Result<()> {
        mpsc::UnboundedSender::send(self, event).map_err(|_| ClientError::SignalingClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    /// Outbound request in flight.
    Calling,
    /// Our call is ringing on the other side.
    RingingRemote,
    /// Someone is calling us.
    RingingLocal,
    Connecting,
    Connected,
}

/// The call this client is part of, from its own point of view.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveCall {
    pub session_id: SessionId,
    pub kind: CallKind,
    pub role: CallRole,
    pub remote: UserId,
    pub remote_profile: Option<UserProfile>,
}

impl ActiveCall {
    fn from_session(session: &CallSession, role: CallRole) -> Self {
        let remote = match role {
            CallRole::Caller => session.receiver_id,
            CallRole::Receiver => session.caller_id,
        };
        Self {
            session_id: session.id,
            kind: session.kind,
            role,
            remote,
            remote_profile: None,
        }
    }
}

pub struct CallController<A, M, S>
where
    M: MediaEngine,
{
    config: ClientConfig,
    api: A,
    media: M,
    sink: S,
    notices: mpsc::UnboundedSender<ClientNotice>,
    phase: CallPhase,
    call: Option<ActiveCall>,
    local_media: Option<M::Stream>,
    peer: Option<M::Peer>,
    signaling: Option<SignalingSession>,
}

impl<A, M, S> CallController<A, M, S>
where
    A: CallApi + 'static,
    M: MediaEngine + 'static,
    S: SignalSink + 'static,
{
    /// A new idle controller and the receiving end of its notice channel.
    pub fn new(
        config: ClientConfig,
        api: A,
        media: M,
        sink: S,
    ) -> (Self, mpsc::UnboundedReceiver<ClientNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let controller = Self {
            config,
            api,
            media,
            sink,
            notices,
            phase: CallPhase::Idle,
            call: None,
            local_media: None,
            peer: None,
            signaling: None,
        };
        (controller, rx)
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn active_call(&self) -> Option<&ActiveCall> {
        self.call.as_ref()
    }

    pub fn is_calling(&self) -> bool {
        matches!(self.phase, CallPhase::Calling | CallPhase::RingingRemote)
    }

    pub fn is_ringing(&self) -> bool {
        self.phase == CallPhase::RingingLocal
    }

    pub fn is_in_call(&self) -> bool {
        matches!(self.phase, CallPhase::Connecting | CallPhase::Connected)
    }

    // ----- user actions -------------------------------------------------

    /// Call `receiver`. Any session left over locally or on the server is
    /// cleared first; a conflict the server reports as recoverable triggers
    /// one cleanup and retry.
    pub async fn start_call(&mut self, receiver: UserId, kind: CallKind) -> Result<CallSession> {
        let lingering_local = self.phase != CallPhase::Idle;
        let lingering_server = match self.api.status().await {
            Ok(status) => status.has_active_call,
            Err(e) => {
                warn!(error = %e, "Pre-call status check failed");
                false
            }
        };

        if lingering_local {
            info!(phase = ?self.phase, "Dropping local call state before new call");
            self.teardown();
        }
        if lingering_server {
            info!("Server reports an active call, cleaning up before new call");
            if let Err(e) = self.force_cleanup().await {
                warn!(error = %e, "Pre-call cleanup failed");
            }
            tokio::time::sleep(self.config.cleanup_settle).await;
        }

        self.phase = CallPhase::Calling;
        let first = self.api.initiate(receiver, kind).await;
        let result = match first {
            Err(e) if e.is_recoverable_conflict() => {
                self.notify(ClientNotice::CallBlocked {
                    code: e.code().unwrap_or(ErrorCode::Internal),
                    message: e.to_string(),
                });
                if let Err(cleanup_err) = self.force_cleanup().await {
                    warn!(error = %cleanup_err, "Cleanup after blocked call failed");
                }
                self.phase = CallPhase::Calling;
                self.api.initiate(receiver, kind).await
            }
            other => other,
        };

        match result {
            Ok(session) => {
                self.on_call_created(&session);
                Ok(session)
            }
            Err(e) => {
                warn!(receiver = %receiver.short(), error = %e, "Call attempt failed");
                self.teardown();
                self.notify(ClientNotice::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Accept the call currently ringing locally.
    pub async fn answer(&mut self) -> Result<CallSession> {
        let call = self.incoming()?;

        let session = match self.api.answer(call.session_id).await {
            Ok(session) => session,
            Err(e) => {
                self.teardown();
                self.notify(ClientNotice::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        info!(session = %call.session_id, "Answered call");
        self.phase = CallPhase::Connecting;

        if let Err(e) = self.connect_as_receiver(call.kind).await {
            self.abort_connect(&e).await;
            return Err(e);
        }
        Ok(session)
    }

    /// Refuse the call currently ringing locally. Local state is cleared
    /// whatever the server says.
    pub async fn decline(&mut self) -> Result<()> {
        let call = self.incoming()?;
        let result = self.api.decline(call.session_id).await;
        self.teardown();

        match result {
            Ok(_) => {
                self.notify(ClientNotice::CallDeclined {
                    session_id: call.session_id,
                });
                Ok(())
            }
            Err(e) => {
                self.notify(ClientNotice::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// End the current call (or cancel it while it rings). Local state is
    /// cleared whatever the server says.
    pub async fn hang_up(&mut self) -> Result<()> {
        let Some(call) = self.call.clone() else {
            self.teardown();
            return Ok(());
        };
        if self.phase == CallPhase::RingingLocal {
            return self.decline().await;
        }

        let result = self.api.end(call.session_id).await;
        self.teardown();

        match result {
            Ok(session) => {
                self.notify(ClientNotice::CallEnded {
                    session_id: session.id,
                    duration: session.duration_seconds,
                });
                Ok(())
            }
            Err(e) => {
                self.notify(ClientNotice::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Ask the server to end every active session of ours.
    pub async fn force_cleanup(&mut self) -> Result<usize> {
        let count = self.api.cleanup().await?;
        if count > 0 {
            self.teardown();
        }
        self.notify(ClientNotice::CleanedUp { count });
        Ok(count)
    }

    /// Bring local state in line with what the server reports.
    pub async fn sync_with_server(&mut self) -> Result<Option<CallSession>> {
        let status = self.api.status().await?;
        match status.session.filter(|_| status.has_active_call) {
            Some(session) => {
                self.adopt(&session);
                Ok(Some(session))
            }
            None => {
                if self.phase != CallPhase::Idle {
                    info!(phase = ?self.phase, "Server has no active call, clearing local state");
                    self.teardown();
                }
                Ok(None)
            }
        }
    }

    pub async fn history(&self) -> Result<Vec<CallHistoryEntry>> {
        self.api.history().await
    }

    /// Forward a locally gathered ICE candidate to the other side.
    pub fn on_local_candidate(&self, candidate: Value) -> Result<()> {
        match &self.signaling {
            Some(signaling) => self.sink.send(signaling.create_ice_candidate(candidate)),
            None => {
                debug!("Local candidate with no call, dropping");
                Ok(())
            }
        }
    }

    // ----- server events ------------------------------------------------

    pub async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::GetOnlineUsers(users) => self.notify(ClientNotice::OnlineUsers { users }),
            ServerEvent::IncomingCall {
                session_id,
                kind,
                caller,
            } => self.on_incoming(session_id, kind, caller),
            ServerEvent::CallAnswered { session_id, .. } => self.on_call_answered(session_id).await,
            ServerEvent::CallDeclined { session_id } => {
                if self.is_current(session_id) {
                    info!(session = %session_id, "Call declined by peer");
                    self.teardown();
                    self.notify(ClientNotice::CallDeclined { session_id });
                }
            }
            ServerEvent::CallEnded {
                session_id,
                duration,
            } => {
                if self.is_current(session_id) {
                    info!(session = %session_id, duration, "Call ended by server");
                    self.teardown();
                    self.notify(ClientNotice::CallEnded {
                        session_id,
                        duration,
                    });
                }
            }
            ServerEvent::Offer {
                session_id,
                payload,
                ..
            } => {
                if let Err(e) = self.on_offer(session_id, payload).await {
                    warn!(session = %session_id, error = %e, "Failed to handle offer");
                    self.notify(ClientNotice::Error {
                        message: "Failed to establish call connection".to_string(),
                    });
                }
            }
            ServerEvent::Answer {
                session_id,
                payload,
                ..
            } => {
                if let Err(e) = self.on_answer(session_id, payload).await {
                    warn!(session = %session_id, error = %e, "Failed to handle answer");
                }
            }
            ServerEvent::IceCandidate {
                session_id,
                candidate,
                ..
            } => self.on_remote_candidate(session_id, candidate).await,
            ServerEvent::Renegotiate { session_id, .. } => self.on_renegotiate(session_id),
            ServerEvent::Error { message } => {
                warn!(%message, "Server rejected an event");
                self.notify(ClientNotice::Error { message });
            }
        }
    }

    fn on_incoming(&mut self, session_id: SessionId, kind: CallKind, caller: UserProfile) {
        if self.phase != CallPhase::Idle {
            warn!(
                session = %session_id,
                phase = ?self.phase,
                "Incoming call while busy, ignoring"
            );
            return;
        }

        info!(session = %session_id, caller = %caller.id.short(), "Incoming call");
        self.call = Some(ActiveCall {
            session_id,
            kind,
            role: CallRole::Receiver,
            remote: caller.id,
            remote_profile: Some(caller.clone()),
        });
        self.signaling = Some(self.new_signaling(session_id, CallRole::Receiver));
        self.phase = CallPhase::RingingLocal;
        self.notify(ClientNotice::IncomingCall {
            session_id,
            kind,
            caller,
        });
    }

    async fn on_call_answered(&mut self, session_id: SessionId) {
        let Some(call) = self.call.clone().filter(|c| c.session_id == session_id) else {
            debug!(session = %session_id, "Answer notification for another call");
            return;
        };
        if call.role != CallRole::Caller {
            return;
        }
        // Media is started once per call; a repeated notification must not
        // replace the live peer and tracks.
        if self.peer.is_some()
            || !matches!(self.phase, CallPhase::RingingRemote | CallPhase::Connecting)
        {
            debug!(session = %session_id, phase = ?self.phase, "Duplicate answer notification");
            return;
        }

        info!(session = %session_id, "Call answered");
        self.phase = CallPhase::Connecting;
        self.notify(ClientNotice::CallAnswered { session_id });

        if let Err(e) = self.connect_as_caller(call.kind).await {
            self.abort_connect(&e).await;
        }
    }

    async fn on_offer(&mut self, session_id: SessionId, payload: Value) -> Result<()> {
        if !self.is_current(session_id) {
            debug!(session = %session_id, "Offer for another call");
            return Ok(());
        }

        let answered = {
            let (Some(peer), Some(signaling)) = (self.peer.as_mut(), self.signaling.as_mut())
            else {
                warn!(session = %session_id, "No peer connection for offer");
                return Ok(());
            };
            if !signaling.accept_offer() {
                return Ok(());
            }

            if !peer.has_remote_description() {
                peer.set_remote_description(payload).await?;
            }
            flush_candidates(peer, signaling).await;

            if peer.has_local_description() {
                false
            } else {
                let answer = peer.create_answer().await?;
                peer.set_local_description(answer.clone()).await?;
                self.sink.send(signaling.create_answer(answer))?;
                signaling.mark_connected();
                true
            }
        };

        if answered {
            self.phase = CallPhase::Connected;
            self.notify(ClientNotice::Connected { session_id });
        }
        Ok(())
    }

    async fn on_answer(&mut self, session_id: SessionId, payload: Value) -> Result<()> {
        if !self.is_current(session_id) {
            return Ok(());
        }

        {
            let (Some(peer), Some(signaling)) = (self.peer.as_mut(), self.signaling.as_mut())
            else {
                warn!(session = %session_id, "No peer connection for answer");
                return Ok(());
            };
            if !signaling.accept_answer(peer.signaling_state(), peer.has_remote_description()) {
                return Ok(());
            }

            peer.set_remote_description(payload).await?;
            flush_candidates(peer, signaling).await;
            signaling.mark_connected();
        }

        self.phase = CallPhase::Connected;
        self.notify(ClientNotice::Connected { session_id });
        Ok(())
    }

    async fn on_remote_candidate(&mut self, session_id: SessionId, candidate: Value) {
        if !self.is_current(session_id) {
            return;
        }

        match (self.peer.as_mut(), self.signaling.as_mut()) {
            (Some(peer), Some(_)) if peer.has_remote_description() => {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    warn!(session = %session_id, error = %e, "Failed to add ICE candidate");
                }
            }
            (_, Some(signaling)) => {
                debug!(session = %session_id, "Buffering ICE candidate until remote description");
                signaling.candidates.push(candidate, Instant::now());
            }
            (_, None) => {}
        }
    }

    fn on_renegotiate(&mut self, session_id: SessionId) {
        if !self.is_current(session_id) {
            return;
        }
        let Some(offer) = self.signaling.as_ref().and_then(|s| s.resend_offer()) else {
            debug!(session = %session_id, "Nothing to re-offer");
            return;
        };
        debug!(session = %session_id, "Peer is ready, re-sending offer");
        if let Err(e) = self.sink.send(offer) {
            warn!(session = %session_id, error = %e, "Failed to re-send offer");
        }
    }

    // ----- internals ----------------------------------------------------

    fn on_call_created(&mut self, session: &CallSession) {
        info!(session = %session.id, kind = session.kind.as_str(), "Call ringing");
        self.call = Some(ActiveCall::from_session(session, CallRole::Caller));
        self.signaling = Some(self.new_signaling(session.id, CallRole::Caller));
        self.phase = CallPhase::RingingRemote;
        self.notify(ClientNotice::Calling {
            session_id: session.id,
            kind: session.kind,
        });
    }

    fn adopt(&mut self, session: &CallSession) {
        let Some(role) = session.role_of(self.config.user_id) else {
            return;
        };

        if !self.is_current(session.id) {
            info!(session = %session.id, "Adopting active call reported by server");
            self.teardown();
            self.call = Some(ActiveCall::from_session(session, role));
            self.signaling = Some(self.new_signaling(session.id, role));
        }

        self.phase = match (session.state, role) {
            (CallState::Ongoing, _) if self.phase == CallPhase::Connected => CallPhase::Connected,
            (CallState::Ongoing, _) => CallPhase::Connecting,
            (CallState::Ringing, CallRole::Caller) => CallPhase::RingingRemote,
            (CallState::Ringing, CallRole::Receiver) => CallPhase::RingingLocal,
            _ => self.phase,
        };
    }

    async fn connect_as_caller(&mut self, kind: CallKind) -> Result<()> {
        self.start_media(kind).await?;

        let (Some(peer), Some(signaling)) = (self.peer.as_mut(), self.signaling.as_mut()) else {
            return Err(ClientError::NoActiveCall);
        };
        self.sink.send(signaling.join())?;

        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.sink.send(signaling.create_offer(offer))?;
        Ok(())
    }

    /// Join the group before acquiring media so an early offer is queued for
    /// us rather than dropped, then ask the caller for its offer.
    async fn connect_as_receiver(&mut self, kind: CallKind) -> Result<()> {
        let join = self
            .signaling
            .as_mut()
            .map(|s| s.join())
            .ok_or(ClientError::NoActiveCall)?;
        self.sink.send(join)?;

        self.start_media(kind).await?;

        if let Some(signaling) = &self.signaling {
            self.sink.send(signaling.request_offer())?;
        }
        Ok(())
    }

    async fn start_media(&mut self, kind: CallKind) -> Result<()> {
        let mut stream = self.media.acquire(kind).await?;
        let peer = match self.media.create_peer(&stream).await {
            Ok(peer) => peer,
            Err(e) => {
                stream.stop();
                return Err(e);
            }
        };
        self.local_media = Some(stream);
        self.peer = Some(peer);
        Ok(())
    }

    /// Connecting failed locally: tell the user and end the call on the
    /// server so the other side is not left waiting.
    async fn abort_connect(&mut self, error: &ClientError) {
        warn!(error = %error, "Could not connect call");
        let notice = match error {
            ClientError::Media(message) => ClientNotice::MediaFailed {
                message: message.clone(),
            },
            other => ClientNotice::Error {
                message: other.to_string(),
            },
        };
        self.notify(notice);
        if let Err(e) = self.hang_up().await {
            debug!(error = %e, "Hang-up after failed connect also failed");
        }
    }

    fn incoming(&self) -> Result<ActiveCall> {
        match &self.call {
            Some(call) if self.phase == CallPhase::RingingLocal => Ok(call.clone()),
            _ => Err(ClientError::NoIncomingCall),
        }
    }

    fn is_current(&self, session_id: SessionId) -> bool {
        self.call.as_ref().is_some_and(|c| c.session_id == session_id)
    }

    fn new_signaling(&self, session_id: SessionId, role: CallRole) -> SignalingSession {
        let buffer = CandidateBuffer::new(self.config.candidate_max_age, self.config.candidate_capacity);
        SignalingSession::new(session_id, role, buffer)
    }

    /// Release everything held for the current call and go idle.
    fn teardown(&mut self) {
        if let Some(mut signaling) = self.signaling.take() {
            if let Some(leave) = signaling.leave() {
                if let Err(e) = self.sink.send(leave) {
                    debug!(error = %e, "Could not leave call group");
                }
            }
        }
        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }
        if let Some(mut stream) = self.local_media.take() {
            stream.stop();
        }
        if let Some(call) = self.call.take() {
            debug!(session = %call.session_id, "Cleared call state");
        }
        self.phase = CallPhase::Idle;
    }

    fn notify(&self, notice: ClientNotice) {
        debug!(notice = %notice.summary(), "Call notice");
        if self.notices.send(notice).is_err() {
            debug!("Notice receiver dropped");
        }
    }
}

/// Run the periodic status check in the background. Ticks are skipped while
/// the controller is idle.
pub fn spawn_self_check<A, M, S>(controller: Arc<Mutex<CallController<A, M, S>>>) -> JoinHandle<()>
where
    A: CallApi + 'static,
    M: MediaEngine + 'static,
    S: SignalSink + 'static,
{
    tokio::spawn(async move {
        let period = controller.lock().await.config.self_check_interval;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let mut ctl = controller.lock().await;
            if ctl.phase == CallPhase::Idle {
                continue;
            }
            if let Err(e) = ctl.sync_with_server().await {
                warn!(error = %e, "Call self-check failed");
            }
        }
    })
}

async fn flush_candidates<P: PeerConnection>(peer: &mut P, signaling: &mut SignalingSession) {
    for candidate in signaling.candidates.drain_fresh(Instant::now()) {
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            warn!(session = %signaling.session_id, error = %e, "Failed to add buffered ICE candidate");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use parley_shared::call::CallStatus;

    use crate::peer::SignalingState;

    // ----- fakes --------------------------------------------------------

    struct ApiScript {
        log: Vec<&'static str>,
        status: CallStatus,
        initiate: VecDeque<std::result::Result<(), ErrorCode>>,
        cleaned: usize,
        fail_end: bool,
        session: Option<CallSession>,
    }

    #[derive(Clone)]
    struct FakeApi {
        me: UserId,
        script: Arc<StdMutex<ApiScript>>,
    }

    fn server_error(code: ErrorCode) -> ClientError {
        ClientError::Server {
            status: 400,
            code,
            message: format!("{code:?}"),
        }
    }

    impl FakeApi {
        fn record(&self, call: &'static str) {
            self.script.lock().unwrap().log.push(call);
        }

        fn log(&self) -> Vec<&'static str> {
            self.script.lock().unwrap().log.clone()
        }

        fn finish(&self, session_id: SessionId, state: CallState) -> Result<CallSession> {
            let mut script = self.script.lock().unwrap();
            let mut session = script
                .session
                .clone()
                .filter(|s| s.id == session_id)
                .unwrap_or_else(|| {
                    let mut s = CallSession::ringing(UserId::new(), self.me, CallKind::Audio, Utc::now());
                    s.id = session_id;
                    s
                });
            session.state = state;
            if state == CallState::Ended {
                session.duration_seconds = 42;
            }
            script.session = Some(session.clone());
            Ok(session)
        }
    }

    #[async_trait]
    impl CallApi for FakeApi {
        async fn initiate(&self, receiver: UserId, kind: CallKind) -> Result<CallSession> {
            self.record("initiate");
            let mut script = self.script.lock().unwrap();
            match script.initiate.pop_front().unwrap_or(Ok(())) {
                Ok(()) => {
                    let session = CallSession::ringing(self.me, receiver, kind, Utc::now());
                    script.session = Some(session.clone());
                    Ok(session)
                }
                Err(code) => Err(server_error(code)),
            }
        }

        async fn answer(&self, session_id: SessionId) -> Result<CallSession> {
            self.record("answer");
            self.finish(session_id, CallState::Ongoing)
        }

        async fn decline(&self, session_id: SessionId) -> Result<CallSession> {
            self.record("decline");
            self.finish(session_id, CallState::Declined)
        }

        async fn end(&self, session_id: SessionId) -> Result<CallSession> {
            self.record("end");
            if self.script.lock().unwrap().fail_end {
                return Err(server_error(ErrorCode::Internal));
            }
            self.finish(session_id, CallState::Ended)
        }

        async fn cleanup(&self) -> Result<usize> {
            self.record("cleanup");
            let mut script = self.script.lock().unwrap();
            script.status = CallStatus::idle();
            Ok(std::mem::take(&mut script.cleaned))
        }

        async fn status(&self) -> Result<CallStatus> {
            self.record("status");
            Ok(self.script.lock().unwrap().status.clone())
        }

        async fn history(&self) -> Result<Vec<CallHistoryEntry>> {
            self.record("history");
            Ok(Vec::new())
        }
    }

    type PeerLog = Arc<StdMutex<Vec<String>>>;

    struct FakeStream {
        stopped: Arc<AtomicBool>,
    }

    impl MediaStream for FakeStream {
        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct FakePeer {
        log: PeerLog,
        local: bool,
        remote: bool,
        state: SignalingState,
    }

    impl FakePeer {
        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl PeerConnection for FakePeer {
        async fn create_offer(&mut self) -> Result<Value> {
            self.push("create_offer".into());
            Ok(json!({ "type": "offer", "sdp": "o" }))
        }

        async fn create_answer(&mut self) -> Result<Value> {
            self.push("create_answer".into());
            Ok(json!({ "type": "answer", "sdp": "a" }))
        }

        async fn set_local_description(&mut self, description: Value) -> Result<()> {
            self.push("set_local".into());
            self.local = true;
            self.state = if description["type"] == "offer" {
                SignalingState::HaveLocalOffer
            } else {
                SignalingState::Stable
            };
            Ok(())
        }

        async fn set_remote_description(&mut self, _description: Value) -> Result<()> {
            self.push("set_remote".into());
            self.remote = true;
            self.state = if self.state == SignalingState::HaveLocalOffer {
                SignalingState::Stable
            } else {
                SignalingState::HaveRemoteOffer
            };
            Ok(())
        }

        async fn add_ice_candidate(&mut self, candidate: Value) -> Result<()> {
            self.push(format!("candidate:{}", candidate["candidate"].as_str().unwrap_or("")));
            Ok(())
        }

        fn signaling_state(&self) -> SignalingState {
            self.state
        }

        fn has_local_description(&self) -> bool {
            self.local
        }

        fn has_remote_description(&self) -> bool {
            self.remote
        }

        fn close(&mut self) {
            self.push("close".into());
            self.state = SignalingState::Closed;
        }
    }

    struct FakeMedia {
        log: PeerLog,
        stopped: Arc<AtomicBool>,
        deny: bool,
    }

    #[async_trait]
    impl MediaEngine for FakeMedia {
        type Stream = FakeStream;
        type Peer = FakePeer;

        async fn acquire(&self, _kind: CallKind) -> Result<FakeStream> {
            if self.deny {
                return Err(ClientError::Media("microphone access denied".into()));
            }
            Ok(FakeStream {
                stopped: self.stopped.clone(),
            })
        }

        async fn create_peer(&self, _local: &FakeStream) -> Result<FakePeer> {
            Ok(FakePeer {
                log: self.log.clone(),
                local: false,
                remote: false,
                state: SignalingState::Stable,
            })
        }
    }

    // ----- fixture ------------------------------------------------------

    type TestController = CallController<FakeApi, FakeMedia, mpsc::UnboundedSender<ClientEvent>>;

    struct Fixture {
        ctl: TestController,
        api: FakeApi,
        notices: mpsc::UnboundedReceiver<ClientNotice>,
        sent: mpsc::UnboundedReceiver<ClientEvent>,
        peer_log: PeerLog,
        stopped: Arc<AtomicBool>,
        me: UserId,
        other: UserId,
    }

    fn fixture_with(deny_media: bool) -> Fixture {
        let me = UserId::new();
        let mut config = ClientConfig::new("http://localhost:5001", me);
        config.cleanup_settle = Duration::ZERO;
        config.self_check_interval = Duration::from_millis(10);

        let api = FakeApi {
            me,
            script: Arc::new(StdMutex::new(ApiScript {
                log: Vec::new(),
                status: CallStatus::idle(),
                initiate: VecDeque::new(),
                cleaned: 0,
                fail_end: false,
                session: None,
            })),
        };
        let peer_log: PeerLog = Arc::default();
        let stopped = Arc::new(AtomicBool::new(false));
        let media = FakeMedia {
            log: peer_log.clone(),
            stopped: stopped.clone(),
            deny: deny_media,
        };
        let (sink, sent) = mpsc::unbounded_channel();
        let (ctl, notices) = CallController::new(config, api.clone(), media, sink);

        Fixture {
            ctl,
            api,
            notices,
            sent,
            peer_log,
            stopped,
            me,
            other: UserId::new(),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(false)
    }

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn peer_log(f: &Fixture) -> Vec<String> {
        f.peer_log.lock().unwrap().clone()
    }

    fn profile(id: UserId) -> UserProfile {
        UserProfile {
            id,
            display_name: "Bob".into(),
            avatar: None,
        }
    }

    async fn ring_locally(f: &mut Fixture) -> SessionId {
        let session_id = SessionId::new();
        f.ctl
            .handle_event(ServerEvent::IncomingCall {
                session_id,
                kind: CallKind::Audio,
                caller: profile(f.other),
            })
            .await;
        session_id
    }

    // ----- caller side --------------------------------------------------

    #[tokio::test]
    async fn test_start_call_rings_remote() {
        let mut f = fixture();
        let session = f.ctl.start_call(f.other, CallKind::Video).await.unwrap();

        assert_eq!(f.ctl.phase(), CallPhase::RingingRemote);
        assert!(f.ctl.is_calling());
        assert_eq!(f.ctl.active_call().unwrap().session_id, session.id);
        assert_eq!(f.api.log(), vec!["status", "initiate"]);
        assert!(matches!(
            drain(&mut f.notices).as_slice(),
            [ClientNotice::Calling { kind: CallKind::Video, .. }]
        ));
    }

    #[tokio::test]
    async fn test_start_call_cleans_lingering_server_session() {
        let mut f = fixture();
        {
            let mut script = f.api.script.lock().unwrap();
            let stale = CallSession::ringing(f.me, f.other, CallKind::Audio, Utc::now());
            script.status = CallStatus::active(stale, f.me);
            script.cleaned = 1;
        }

        f.ctl.start_call(f.other, CallKind::Audio).await.unwrap();
        assert_eq!(f.api.log(), vec!["status", "cleanup", "initiate"]);
        assert_eq!(f.ctl.phase(), CallPhase::RingingRemote);
    }

    #[tokio::test]
    async fn test_recoverable_conflict_retries_once() {
        let mut f = fixture();
        f.api
            .script
            .lock()
            .unwrap()
            .initiate
            .push_back(Err(ErrorCode::AlreadyInCall));

        f.ctl.start_call(f.other, CallKind::Audio).await.unwrap();
        assert_eq!(f.api.log(), vec!["status", "initiate", "cleanup", "initiate"]);

        let notices = drain(&mut f.notices);
        assert!(matches!(
            notices.first(),
            Some(ClientNotice::CallBlocked {
                code: ErrorCode::AlreadyInCall,
                ..
            })
        ));
        assert!(matches!(notices.last(), Some(ClientNotice::Calling { .. })));
    }

    #[tokio::test]
    async fn test_busy_peer_is_not_retried() {
        let mut f = fixture();
        f.api
            .script
            .lock()
            .unwrap()
            .initiate
            .push_back(Err(ErrorCode::PeerBusy));

        let err = f.ctl.start_call(f.other, CallKind::Audio).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::PeerBusy));
        assert_eq!(f.ctl.phase(), CallPhase::Idle);
        assert_eq!(f.api.log(), vec!["status", "initiate"]);
    }

    #[tokio::test]
    async fn test_caller_offers_after_answer_and_ignores_duplicate_answer() {
        let mut f = fixture();
        let session = f.ctl.start_call(f.other, CallKind::Audio).await.unwrap();

        f.ctl
            .handle_event(ServerEvent::CallAnswered {
                session_id: session.id,
                receiver: profile(f.other),
            })
            .await;
        assert_eq!(f.ctl.phase(), CallPhase::Connecting);

        let sent = drain(&mut f.sent);
        assert!(matches!(
            sent.as_slice(),
            [ClientEvent::JoinCall { .. }, ClientEvent::Offer { .. }]
        ));

        // The receiver asks again once it is ready.
        f.ctl
            .handle_event(ServerEvent::Renegotiate {
                session_id: session.id,
                from: f.other,
            })
            .await;
        assert!(matches!(drain(&mut f.sent).as_slice(), [ClientEvent::Offer { .. }]));

        let answer = ServerEvent::Answer {
            session_id: session.id,
            from: f.other,
            payload: json!({ "type": "answer" }),
        };
        f.ctl.handle_event(answer.clone()).await;
        f.ctl.handle_event(answer).await;

        assert_eq!(f.ctl.phase(), CallPhase::Connected);
        let remotes = peer_log(&f).iter().filter(|e| *e == "set_remote").count();
        assert_eq!(remotes, 1);

        // No re-offer once connected.
        f.ctl
            .handle_event(ServerEvent::Renegotiate {
                session_id: session.id,
                from: f.other,
            })
            .await;
        assert!(drain(&mut f.sent).is_empty());
    }

    #[tokio::test]
    async fn test_repeated_answer_notification_keeps_media() {
        let mut f = fixture();
        let session = f.ctl.start_call(f.other, CallKind::Audio).await.unwrap();
        let answered = ServerEvent::CallAnswered {
            session_id: session.id,
            receiver: profile(f.other),
        };

        f.ctl.handle_event(answered.clone()).await;
        drain(&mut f.sent);
        f.ctl.handle_event(answered).await;

        assert!(drain(&mut f.sent).is_empty());
        let log = peer_log(&f);
        assert_eq!(log.iter().filter(|e| *e == "create_offer").count(), 1);
        assert!(!log.iter().any(|e| e == "close"));
        assert!(!f.stopped.load(Ordering::SeqCst));
        assert_eq!(f.ctl.phase(), CallPhase::Connecting);
    }

    #[tokio::test]
    async fn test_media_failure_ends_call() {
        let mut f = fixture_with(true);
        let session = f.ctl.start_call(f.other, CallKind::Video).await.unwrap();
        drain(&mut f.notices);

        f.ctl
            .handle_event(ServerEvent::CallAnswered {
                session_id: session.id,
                receiver: profile(f.other),
            })
            .await;

        assert_eq!(f.ctl.phase(), CallPhase::Idle);
        assert!(f.api.log().contains(&"end"));
        assert!(drain(&mut f.notices)
            .iter()
            .any(|n| matches!(n, ClientNotice::MediaFailed { .. })));
    }

    // ----- receiver side ------------------------------------------------

    #[tokio::test]
    async fn test_receiver_answers_once() {
        let mut f = fixture();
        let session_id = ring_locally(&mut f).await;
        assert!(f.ctl.is_ringing());
        assert_eq!(
            f.ctl.active_call().unwrap().remote_profile.as_ref().unwrap().display_name,
            "Bob"
        );

        f.ctl.answer().await.unwrap();
        assert_eq!(f.ctl.phase(), CallPhase::Connecting);
        assert!(matches!(
            drain(&mut f.sent).as_slice(),
            [ClientEvent::JoinCall { .. }, ClientEvent::Renegotiate { .. }]
        ));

        let offer = ServerEvent::Offer {
            session_id,
            from: f.other,
            payload: json!({ "type": "offer" }),
        };
        f.ctl.handle_event(offer.clone()).await;
        f.ctl.handle_event(offer).await;

        assert_eq!(f.ctl.phase(), CallPhase::Connected);
        let answers: Vec<_> = drain(&mut f.sent)
            .into_iter()
            .filter(|e| matches!(e, ClientEvent::Answer { .. }))
            .collect();
        assert_eq!(answers.len(), 1);
    }

    #[tokio::test]
    async fn test_early_candidates_applied_after_remote_description() {
        let mut f = fixture();
        let session_id = ring_locally(&mut f).await;
        f.ctl.answer().await.unwrap();

        for c in ["c1", "c2"] {
            f.ctl
                .handle_event(ServerEvent::IceCandidate {
                    session_id,
                    from: f.other,
                    candidate: json!({ "candidate": c }),
                })
                .await;
        }
        assert!(peer_log(&f).iter().all(|e| !e.starts_with("candidate")));

        f.ctl
            .handle_event(ServerEvent::Offer {
                session_id,
                from: f.other,
                payload: json!({ "type": "offer" }),
            })
            .await;

        let log = peer_log(&f);
        let pos = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        assert!(pos("set_remote") < pos("candidate:c1"));
        assert!(pos("candidate:c1") < pos("candidate:c2"));
        assert!(pos("candidate:c2") < pos("create_answer"));

        // Later candidates go straight to the peer.
        f.ctl
            .handle_event(ServerEvent::IceCandidate {
                session_id,
                from: f.other,
                candidate: json!({ "candidate": "c3" }),
            })
            .await;
        assert_eq!(peer_log(&f).last().unwrap(), "candidate:c3");
    }

    #[tokio::test]
    async fn test_decline_clears_ringing() {
        let mut f = fixture();
        ring_locally(&mut f).await;
        drain(&mut f.notices);

        f.ctl.decline().await.unwrap();
        assert_eq!(f.ctl.phase(), CallPhase::Idle);
        assert!(f.api.log().contains(&"decline"));
        assert!(matches!(
            drain(&mut f.notices).as_slice(),
            [ClientNotice::CallDeclined { .. }]
        ));
    }

    #[tokio::test]
    async fn test_answer_without_incoming_call() {
        let mut f = fixture();
        assert!(matches!(f.ctl.answer().await, Err(ClientError::NoIncomingCall)));
    }

    #[tokio::test]
    async fn test_incoming_while_busy_is_ignored() {
        let mut f = fixture();
        let session = f.ctl.start_call(f.other, CallKind::Audio).await.unwrap();
        ring_locally(&mut f).await;
        assert_eq!(f.ctl.active_call().unwrap().session_id, session.id);
        assert_eq!(f.ctl.phase(), CallPhase::RingingRemote);
    }

    // ----- teardown -----------------------------------------------------

    #[tokio::test]
    async fn test_hang_up_clears_state_even_on_error() {
        let mut f = fixture();
        ring_locally(&mut f).await;
        f.ctl.answer().await.unwrap();
        drain(&mut f.sent);
        f.api.script.lock().unwrap().fail_end = true;

        assert!(f.ctl.hang_up().await.is_err());
        assert_eq!(f.ctl.phase(), CallPhase::Idle);
        assert!(f.ctl.active_call().is_none());
        assert!(f.stopped.load(Ordering::SeqCst));
        assert!(peer_log(&f).contains(&"close".to_string()));
        assert!(matches!(
            drain(&mut f.sent).as_slice(),
            [ClientEvent::LeaveCall { .. }]
        ));
    }

    #[tokio::test]
    async fn test_remote_end_tears_down() {
        let mut f = fixture();
        let session = f.ctl.start_call(f.other, CallKind::Audio).await.unwrap();
        drain(&mut f.notices);

        // Events for other sessions are ignored.
        f.ctl
            .handle_event(ServerEvent::CallEnded {
                session_id: SessionId::new(),
                duration: 1,
            })
            .await;
        assert_eq!(f.ctl.phase(), CallPhase::RingingRemote);

        f.ctl
            .handle_event(ServerEvent::CallEnded {
                session_id: session.id,
                duration: 30,
            })
            .await;
        assert_eq!(f.ctl.phase(), CallPhase::Idle);
        assert_eq!(
            drain(&mut f.notices),
            vec![ClientNotice::CallEnded {
                session_id: session.id,
                duration: 30
            }]
        );
    }

    #[tokio::test]
    async fn test_sync_clears_state_server_forgot() {
        let mut f = fixture();
        f.ctl.start_call(f.other, CallKind::Audio).await.unwrap();

        assert!(f.ctl.sync_with_server().await.unwrap().is_none());
        assert_eq!(f.ctl.phase(), CallPhase::Idle);
    }

    #[tokio::test]
    async fn test_sync_adopts_server_session() {
        let mut f = fixture();
        let mut session = CallSession::ringing(f.other, f.me, CallKind::Video, Utc::now());
        session.state = CallState::Ongoing;
        f.api.script.lock().unwrap().status = CallStatus::active(session.clone(), f.me);

        f.ctl.sync_with_server().await.unwrap();
        let call = f.ctl.active_call().unwrap();
        assert_eq!(call.session_id, session.id);
        assert_eq!(call.role, CallRole::Receiver);
        assert_eq!(f.ctl.phase(), CallPhase::Connecting);
    }

    #[tokio::test]
    async fn test_self_check_corrects_divergence() {
        let mut f = fixture();
        f.ctl.start_call(f.other, CallKind::Audio).await.unwrap();

        let ctl = Arc::new(Mutex::new(f.ctl));
        let task = spawn_self_check(ctl.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert_eq!(ctl.lock().await.phase(), CallPhase::Idle);
    }
}
