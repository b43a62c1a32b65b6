//! Recovery paths of the engine: join replies, rejoin, resync, status
//! checks, the idle drift check and the offline fallback.
//!
//! Recovery is always a hard reset to the server's text. Local edits the
//! server has not sequenced yet are kept in the stash, rebased onto the
//! authoritative text by diffing it against the last known server text,
//! and resubmitted once the session is live again.

use std::time::Instant;

use tokio::sync::oneshot;

use crate::buffer::{new_edit_id, rebase_through};
use crate::document::DocumentSink;
use crate::engine::{CollabEngine, JoinAck, NotifyLevel, PendingRequest, SessionEvent};
use crate::error::{Result, SyncError};
use crate::operation::Operation;
use crate::protocol::ClientAction;
use crate::session::Phase;
use crate::timers::TimerKey;

impl<D: DocumentSink> CollabEngine<D> {
    /// Rejoin the session and wait for the server's reply.
    ///
    /// If a join is already under way the returned receiver resolves with
    /// that one. It fails if the script is closed first.
    pub fn rejoin_session(&mut self) -> Result<oneshot::Receiver<JoinAck>> {
        if self.session.is_none() {
            return Err(SyncError::NoActiveSession);
        }
        self.begin_rejoin(None);

        let (tx, rx) = oneshot::channel();
        match self.pending.values_mut().rev().find(|request| request.is_join()) {
            Some(PendingRequest::Join { waiters }) => waiters.push(tx),
            _ => {
                // plain joinSession carries no request ID
                self.pending
                    .insert(new_edit_id(), PendingRequest::Join { waiters: vec![tx] });
            }
        }
        Ok(rx)
    }

    /// Start a rejoin unless one is already under way.
    ///
    /// Unacknowledged edits move to the stash, the roster is reseeded and
    /// `rejoinSession` goes out with a fresh request ID.
    pub(crate) fn begin_rejoin(&mut self, reason: Option<SyncError>) {
        if !matches!(self.phase, Phase::Active | Phase::Offline) {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match &reason {
            Some(reason) => log::warn!("rejoining {}: {reason}", session.script_id()),
            None => log::info!("rejoining {}", session.script_id()),
        }

        if self.phase == Phase::Offline {
            // offline edits become one stashed edit against the saved source
            if let Some(op) = Operation::diff(&session.server_text, &self.doc.text()) {
                self.stash.push(op);
            }
        } else {
            self.events.push_back(SessionEvent::Banner(
                "Synchronization error: Rejoining the session".to_string(),
            ));
        }
        session.seed_members();
        let state = session.state;

        self.stash_buffer();
        self.timers.cancel(&TimerKey::DriftCheck);
        self.presence.clear_markers();
        self.phase = Phase::Rejoining;
        if let Some(reason) = reason {
            self.events.push_back(SessionEvent::Desync(reason));
        }

        let request_id = new_edit_id();
        self.pending.insert(
            request_id.clone(),
            PendingRequest::Join {
                waiters: Vec::new(),
            },
        );
        self.send(ClientAction::RejoinSession {
            state,
            tutoring: self.tutoring,
            request_id,
        });
        self.timers.arm(TimerKey::Sync, self.config.sync_timeout());
    }

    pub(crate) fn on_joined_session(
        &mut self,
        script_id: &str,
        script_text: String,
        state: u64,
        active_members: Vec<String>,
        request_id: Option<String>,
    ) {
        if self.script_id() != Some(script_id) || self.phase == Phase::Offline {
            // reply to a join for a script that has since been closed
            log::debug!("ignoring join reply for {script_id}");
            return;
        }
        log::info!("joined collaboration session {script_id} at state {state}");
        self.timers.cancel(&TimerKey::Sync);

        let resubmit = self.reset_to_authoritative(&script_text, state, false);
        self.phase = Phase::Active;
        self.read_only = false;
        self.doc.set_read_only(false);
        if let Some(session) = self.session.as_mut() {
            session.session_active = true;
            for member in &active_members {
                if !session.is_self(member) {
                    session.members.set_active(member, true);
                }
            }
        }

        let ack = JoinAck {
            script_id: script_id.to_string(),
            state,
            script_text,
        };
        let request = match request_id {
            Some(id) => self.pending.shift_remove(&id),
            None => self.take_oldest(PendingRequest::is_join),
        };
        if let Some(PendingRequest::Join { waiters }) = request {
            for waiter in waiters {
                let _ = waiter.send(ack.clone());
            }
        }

        self.events.push_back(SessionEvent::Joined {
            script_id: script_id.to_string(),
            state,
            active_members,
        });
        self.resubmit(resubmit);
    }

    /// Replace the document with the server's text and rebase every
    /// unacknowledged local edit onto it. Returns the rebased edits, already
    /// applied to the document, for resubmission.
    ///
    /// With `keep_in_flight` the edit awaiting its echo stays in flight under
    /// its own ID: the server has not answered for it yet, so sending a copy
    /// would sequence it twice. It is rebased with the rest and its echo is
    /// counted as usual.
    pub(crate) fn reset_to_authoritative(
        &mut self,
        script_text: &str,
        state: u64,
        keep_in_flight: bool,
    ) -> Vec<Operation> {
        let stashed_in_flight = self.stash_in_flight.take().is_some();
        let mut held = if keep_in_flight {
            self.buffer.in_flight().cloned()
        } else {
            None
        };
        let had_in_flight = held.is_none() && (stashed_in_flight || self.buffer.awaiting().is_some());
        let mut ops = std::mem::take(&mut self.stash);
        ops.extend(self.buffer.take_all().into_iter().map(|edit| edit.operation));
        self.timers.cancel_acks();

        let mut base = self
            .session
            .as_ref()
            .map(|session| session.server_text.clone())
            .unwrap_or_default();

        if had_in_flight {
            if let Some(first) = ops.first() {
                let mut with_first = base.clone();
                first.apply_to(&mut with_first);
                if with_first == script_text {
                    // the server sequenced it but the echo never reached us
                    ops.remove(0);
                    base = with_first;
                }
            }
        }
        if let Some(diff) = Operation::diff(&base, script_text) {
            let (_, gaps) = rebase_through(diff, ops.iter_mut());
            for gap in &gaps {
                log::warn!("{gap}");
            }
        }
        if let Some(edit) = held.as_mut() {
            // the in-flight edit is the head of the buffer, stash is empty
            edit.operation = ops.remove(0);
            edit.state = state;
        }
        ops.retain(|op| !op.is_noop());
        if !ops.is_empty() {
            log::debug!("rebased {} local edits onto the server text", ops.len());
        }

        self.editor_locked = true;
        let cursor = self.doc.cursor();
        self.doc.set_text(script_text);
        for op in held.iter().map(|edit| &edit.operation).chain(&ops) {
            self.doc.apply(op);
        }
        self.doc.set_cursor(cursor);
        self.editor_locked = false;
        self.presence.reset_local(None);

        if let Some(session) = self.session.as_mut() {
            session.server_text = script_text.to_string();
            session.state = state;
            session.history.clear();
        }
        if let Some(edit) = held {
            log::debug!("edit {} stays in flight across the resync", edit.id);
            self.timers
                .arm(TimerKey::Ack(edit.id.clone()), self.config.edit_timeout());
            self.buffer.restore_in_flight(edit);
        }
        ops
    }

    /// Send rebased edits through the buffer again, with fresh IDs.
    fn resubmit(&mut self, ops: Vec<Operation>) {
        if ops.is_empty() {
            return;
        }
        let live = self
            .session
            .as_ref()
            .filter(|session| self.phase == Phase::Active && session.session_active)
            .map(|session| session.state);
        let Some(state) = live else {
            self.stash = ops;
            return;
        };
        log::info!("resubmitting {} local edits", ops.len());
        self.timers.cancel(&TimerKey::DriftCheck);
        for op in ops {
            if let Some(edit) = self.buffer.enqueue(state, op) {
                self.send_edit(edit);
            }
        }
    }

    pub(crate) fn on_sync_to_session(&mut self, state: u64, script_text: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if self.buffer.is_empty() && self.stash.is_empty() && session.server_text == script_text {
            log::debug!("resync: text unchanged, adopting state {state}");
            session.state = state;
            return;
        }
        log::info!("resyncing {} to state {state}", session.script_id());
        let keep_in_flight = self.phase == Phase::Active;
        let resubmit = self.reset_to_authoritative(&script_text, state, keep_in_flight);
        self.events.push_back(SessionEvent::Resynced { state });
        self.resubmit(resubmit);
    }

    pub(crate) fn on_sync_error(&mut self, state: u64, script_text: String) {
        self.events.push_back(SessionEvent::Banner(
            "There was a sync error. Adjusting the local edit...".to_string(),
        ));
        self.on_sync_to_session(state, script_text);
    }

    /// Ask the server whether the session is still alive and in step.
    pub fn check_session_status(&mut self) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Err(SyncError::NoActiveSession);
        };
        log::debug!("checking collaboration session status");
        let state = session.state;
        self.send(ClientAction::CheckSessionStatus { state });
        self.timers.arm(TimerKey::Sync, self.config.sync_timeout());
        Ok(())
    }

    pub(crate) fn on_session_status(&mut self, active: bool, remote: Option<u64>) {
        self.timers.cancel(&TimerKey::Sync);
        let Some(local) = self.state() else {
            return;
        };
        if !active {
            self.begin_rejoin(None);
        } else if let Some(remote) = remote.filter(|remote| *remote != local) {
            self.begin_rejoin(Some(SyncError::StateMismatch { local, remote }));
        }
    }

    /// Fetch the current text of any shared script.
    pub fn request_script_text(&mut self, share_id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        let request_id = new_edit_id();
        self.pending
            .insert(request_id.clone(), PendingRequest::ScriptText(tx));
        self.send_to(share_id, ClientAction::GetScriptText { request_id });
        rx
    }

    pub(crate) fn on_script_text(&mut self, script_text: String, request_id: Option<String>) {
        let request = match request_id {
            Some(id) => self.pending.shift_remove(&id),
            None => self.take_oldest(PendingRequest::is_script_text),
        };
        match request {
            Some(PendingRequest::ScriptText(tx)) => {
                let _ = tx.send(script_text);
            }
            Some(PendingRequest::DriftCheck { state }) => self.finish_drift_check(state, &script_text),
            Some(join @ PendingRequest::Join { .. }) => {
                log::warn!("script text answered a join request");
                self.pending.insert(new_edit_id(), join);
            }
            None => log::debug!("unsolicited script text"),
        }
    }

    fn take_oldest(&mut self, kind: fn(&PendingRequest) -> bool) -> Option<PendingRequest> {
        let index = self.pending.values().position(kind)?;
        self.pending.shift_remove_index(index).map(|(_, request)| request)
    }

    /// Ask for the server's text so it can be compared with ours.
    fn start_drift_check(&mut self) {
        if self.phase != Phase::Active || !self.buffer.is_empty() {
            return;
        }
        let Some(state) = self.state() else {
            return;
        };
        log::debug!("comparing local text with the server at state {state}");
        let request_id = new_edit_id();
        self.pending
            .insert(request_id.clone(), PendingRequest::DriftCheck { state });
        self.send(ClientAction::GetScriptText { request_id });
    }

    fn finish_drift_check(&mut self, requested_at: u64, script_text: &str) {
        if self.phase != Phase::Active || !self.buffer.is_empty() || self.state() != Some(requested_at) {
            log::debug!("document changed during the drift check, skipping");
            return;
        }
        if self.doc.text() != script_text {
            log::warn!("local text drifted from the server copy");
            self.begin_rejoin(Some(SyncError::TextDrift));
        }
    }

    /// Run every timer due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        for key in self.timers.expired(now) {
            match key {
                TimerKey::Sync => {
                    log::error!("no reply from the collaboration server");
                    self.notify(
                        NotifyLevel::Failure,
                        "Failed to synchronize with the central server. Please refresh the page.",
                    );
                    self.events.push_back(SessionEvent::SyncFailed);
                }
                TimerKey::Ack(id) => {
                    if self.buffer.awaiting() == Some(id.as_str()) {
                        self.begin_rejoin(Some(SyncError::Timeout));
                    }
                }
                TimerKey::DriftCheck => self.start_drift_check(),
            }
        }
    }

    pub(crate) fn on_sessions_full(&mut self, script_id: &str) {
        if self.script_id() != Some(script_id) {
            return;
        }
        log::info!("no real-time session available for {script_id}");
        self.notify(
            NotifyLevel::Failure,
            "Server has reached the maximum number of real-time collaboration sessions. Please try again later.",
        );
        self.go_offline(Some(SyncError::SessionFull));
    }

    /// Load the saved source and keep editing without synchronization.
    /// Read-only unless the local user owns the script.
    pub(crate) fn go_offline(&mut self, reason: Option<SyncError>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        log::info!("opening {} in offline mode", session.script_id());
        let read_only = !session.owner;
        let source = session.script.source.clone();
        session.server_text = source.clone();
        session.session_active = false;
        session.members.deactivate_all();
        let script_id = session.script_id().to_string();

        self.timers.cancel_all();
        self.buffer.clear();
        self.stash.clear();
        self.stash_in_flight = None;
        self.presence.clear_markers();

        self.editor_locked = true;
        self.doc.set_text(&source);
        self.doc.set_read_only(read_only);
        self.editor_locked = false;
        self.read_only = read_only;
        self.phase = Phase::Offline;

        self.events.push_back(SessionEvent::Offline {
            script_id,
            read_only,
            reason,
        });
    }

    /// The transport went away. Outstanding requests fail; a script that
    /// never joined falls back to offline mode.
    pub fn transport_lost(&mut self) {
        self.timers.cancel_all();
        self.outgoing.clear();
        self.pending.clear();

        match self.phase {
            Phase::Joining => self.go_offline(Some(SyncError::ConnectionClosed)),
            Phase::Active | Phase::Rejoining => {
                log::error!("lost connection to the collaboration server");
                self.stash_buffer();
                if let Some(session) = self.session.as_mut() {
                    session.session_active = false;
                    session.members.deactivate_all();
                }
                self.presence.clear_markers();
                self.events
                    .push_back(SessionEvent::Desync(SyncError::ConnectionClosed));
                self.events.push_back(SessionEvent::SyncFailed);
            }
            _ => {}
        }
    }

    /// Fire every armed timer as if `after` had elapsed.
    #[cfg(test)]
    pub(crate) fn advance(&mut self, after: std::time::Duration) {
        self.handle_timeout(Instant::now() + after);
    }
}
