//! The collaboration engine.
//!
//! ## Architecture
//!
//! ```text
//!   local edits, cursor moves ──┐          ┌── server frames
//!                               ▼          ▼
//!                         ┌──────────────────────┐
//!                         │     CollabEngine     │── DocumentSink
//!                         │ Session · EditBuffer │
//!                         │ Timers · Presence    │
//!                         └──┬────────────────┬──┘
//!             poll_transmit()│                │poll_event()
//!                            ▼                ▼
//!                     ClientMessage      SessionEvent
//! ```
//!
//! The engine performs no I/O and never sleeps. Whoever drives it feeds it
//! local edits and decoded server frames one at a time, ships whatever
//! [`CollabEngine::poll_transmit`] yields, and calls
//! [`CollabEngine::handle_timeout`] once [`CollabEngine::next_deadline`] has
//! passed. Handlers therefore never run concurrently and need no locking.
//!
//! Rejoin, resync and the idle drift check live in [`crate::reconcile`].

use std::collections::VecDeque;
use std::time::Instant;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::buffer::{rebase_through, Ack, EditBuffer, PendingEdit};
use crate::config::SessionConfig;
use crate::document::DocumentSink;
use crate::error::{Result, SyncError};
use crate::operation::Operation;
use crate::presence::{PresenceRelay, RemoteMarker};
use crate::protocol::{
    ClientAction, ClientMessage, Header, ProtocolError, ServerAction, ServerMessage,
    NOTIFICATION_TYPE,
};
use crate::session::{Phase, Roster, ScriptInfo, Session};
use crate::timers::{TimerKey, Timers};

/// The assistant's username. Its joins and saves are not announced.
pub const ASSISTANT_USER: &str = "cai";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Success,
    Failure,
}

/// Reply to a join or rejoin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAck {
    pub script_id: String,
    pub state: u64,
    pub script_text: String,
}

/// Everything the application may want to show or react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Joined (or rejoined) and the document now holds the server's text.
    Joined {
        script_id: String,
        state: u64,
        active_members: Vec<String>,
    },
    /// Left the server session; the script stays open.
    Left { script_id: String },
    Closed { script_id: String },
    /// Editing locally without synchronization.
    Offline {
        script_id: String,
        read_only: bool,
        reason: Option<SyncError>,
    },
    /// A user notification.
    Notify { level: NotifyLevel, text: String },
    /// A transient banner.
    Banner(String),
    /// The server did not answer a join or status check. Persistent.
    SyncFailed,
    /// Local and server state diverged; recovery is under way.
    Desync(SyncError),
    /// The document was replaced after a resync.
    Resynced { state: u64 },
    MemberJoined(String),
    MemberLeft(String),
    RosterChanged,
    PresenceUpdated(RemoteMarker),
    PresenceRemoved(String),
    Chat {
        sender: String,
        message: Value,
        message_type: String,
    },
    ScriptRenamed {
        script_id: String,
        name: Option<String>,
    },
    /// The local user lost access to a script and its tab should close.
    CloseRequested(String),
    WriteAccessChanged(bool),
    JoinedTutoring,
}

/// An outstanding request correlated by request ID.
#[derive(Debug)]
pub(crate) enum PendingRequest {
    Join { waiters: Vec<oneshot::Sender<JoinAck>> },
    ScriptText(oneshot::Sender<String>),
    /// Internal `getScriptText` issued by the drift check at this state.
    DriftCheck { state: u64 },
}

impl PendingRequest {
    pub(crate) fn is_join(&self) -> bool {
        matches!(self, Self::Join { .. })
    }

    pub(crate) fn is_script_text(&self) -> bool {
        matches!(self, Self::ScriptText(_) | Self::DriftCheck { .. })
    }
}

/// Client-side synchronization engine for one user.
pub struct CollabEngine<D: DocumentSink> {
    pub(crate) config: SessionConfig,
    pub(crate) user_name: String,
    pub(crate) doc: D,
    pub(crate) phase: Phase,
    pub(crate) session: Option<Session>,
    pub(crate) buffer: EditBuffer,
    /// Local edits held back while (re)joining. They apply, in order, on top
    /// of the session's `server_text`.
    pub(crate) stash: Vec<Operation>,
    /// ID of the edit that was in flight when the buffer was stashed. It is
    /// always the head of `stash`.
    pub(crate) stash_in_flight: Option<String>,
    pub(crate) timers: Timers,
    pub(crate) presence: PresenceRelay,
    pub(crate) pending: IndexMap<String, PendingRequest>,
    pub(crate) outgoing: VecDeque<ClientMessage>,
    pub(crate) events: VecDeque<SessionEvent>,
    pub(crate) tutoring: bool,
    /// Held while the engine itself writes to the document.
    pub(crate) editor_locked: bool,
    /// Local edits are refused: offline without ownership, or write access
    /// revoked.
    pub(crate) read_only: bool,
}

impl<D: DocumentSink> CollabEngine<D> {
    pub fn new(config: SessionConfig, user_name: &str, doc: D) -> Self {
        let presence = PresenceRelay::new(config.marker_bands);
        Self {
            config,
            user_name: user_name.to_lowercase(),
            doc,
            phase: Phase::Idle,
            session: None,
            buffer: EditBuffer::new(),
            stash: Vec::new(),
            stash_in_flight: None,
            timers: Timers::new(),
            presence,
            pending: IndexMap::new(),
            outgoing: VecDeque::new(),
            events: VecDeque::new(),
            tutoring: false,
            editor_locked: false,
            read_only: false,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn doc(&self) -> &D {
        &self.doc
    }

    pub fn into_document(self) -> D {
        self.doc
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn script_id(&self) -> Option<&str> {
        self.session.as_ref().map(Session::script_id)
    }

    /// The local state counter.
    pub fn state(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.state)
    }

    pub fn members(&self) -> Option<&Roster> {
        self.session.as_ref().map(|s| &s.members)
    }

    pub fn markers(&self) -> impl Iterator<Item = &RemoteMarker> {
        self.presence.markers()
    }

    /// Edits sent or queued but not yet acknowledged.
    pub fn buffered_edits(&self) -> usize {
        self.buffer.len()
    }

    /// Edits held back until the next join completes.
    pub fn stashed_edits(&self) -> usize {
        self.stash.len()
    }

    pub fn is_editor_locked(&self) -> bool {
        self.editor_locked
    }

    /// Whether local edits are currently refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_tutoring(&self) -> bool {
        self.tutoring
    }

    // ── Driver interface ─────────────────────────────────────────

    /// Next frame to send to the server.
    pub fn poll_transmit(&mut self) -> Option<ClientMessage> {
        self.outgoing.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Earliest instant at which [`Self::handle_timeout`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Decode a JSON text frame and handle it.
    pub fn handle_frame(&mut self, frame: &str) -> std::result::Result<(), ProtocolError> {
        let message = ServerMessage::decode(frame)?;
        self.handle_message(message);
        Ok(())
    }

    // ── Script lifecycle ─────────────────────────────────────────

    /// Open a shared script and join its session. Any other open script is
    /// closed first.
    pub fn open_script(&mut self, script: ScriptInfo) {
        if let Some(current) = self.script_id().map(str::to_string) {
            if current == script.share_id && self.phase != Phase::Offline {
                log::debug!("script {current} is already open");
                return;
            }
            let _ = self.close_script(&current);
        }

        log::info!("opening collaborative script {}", script.share_id);
        let mut session = Session::new(script, &self.user_name, self.config.history_window);
        session.server_text = self.doc.text();
        let state = session.state;
        self.session = Some(session);
        self.phase = Phase::Joining;
        self.doc.set_read_only(true);

        self.send(ClientAction::JoinSession { state });
        self.timers.arm(TimerKey::Sync, self.config.sync_timeout());
    }

    /// Open a shared script for local editing only.
    pub fn open_offline(&mut self, script: ScriptInfo) {
        if let Some(current) = self.script_id().map(str::to_string) {
            let _ = self.close_script(&current);
        }
        self.session = Some(Session::new(script, &self.user_name, self.config.history_window));
        self.go_offline(None);
    }

    /// Close the open script, leaving its session.
    pub fn close_script(&mut self, share_id: &str) -> Result<()> {
        if self.script_id() != Some(share_id) {
            log::warn!("cannot close {share_id}: it is not the open collaborative script");
            return Err(SyncError::NoActiveSession);
        }
        log::info!("closing collaborative script {share_id}");

        if matches!(self.phase, Phase::Joining | Phase::Active | Phase::Rejoining) {
            self.send(ClientAction::LeaveSession);
        }
        self.timers.cancel_all();
        self.buffer.clear();
        self.stash.clear();
        self.stash_in_flight = None;
        self.presence.clear_markers();
        self.presence.reset_local(None);
        self.pending.retain(|_, request| matches!(request, PendingRequest::ScriptText(_)));
        self.editor_locked = false;
        self.read_only = false;
        self.session = None;
        self.phase = Phase::Closed;

        self.events.push_back(SessionEvent::Closed {
            script_id: share_id.to_string(),
        });
        Ok(())
    }

    /// Leave the server session without closing the script. The next local
    /// edit rejoins it.
    pub fn leave_session(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(SyncError::NoActiveSession);
        };
        if !session.session_active {
            return Ok(());
        }
        log::info!("leaving collaboration session {}", session.script_id());
        session.session_active = false;
        session.members.deactivate_all();
        let script_id = session.script_id().to_string();

        self.send(ClientAction::LeaveSession);
        self.stash_buffer();
        self.timers.cancel_all();
        self.presence.clear_markers();
        self.events.push_back(SessionEvent::Left { script_id });
        Ok(())
    }

    // ── Local edits ──────────────────────────────────────────────

    /// Apply an edit to the document, then synchronize it.
    pub fn edit(&mut self, op: Operation) -> Result<()> {
        if self.session.is_none() {
            return Err(SyncError::NoActiveSession);
        }
        if self.read_only {
            return Err(SyncError::ReadOnly);
        }
        let op = op.materialize();
        self.doc.apply(&op);
        self.local_edit(op)
    }

    /// Synchronize an edit the user already made to the document.
    ///
    /// Ignored while the engine itself is writing to the document.
    pub fn local_edit(&mut self, op: Operation) -> Result<()> {
        if self.editor_locked || op.is_noop() {
            return Ok(());
        }
        if self.read_only {
            log::warn!("ignoring edit to a read-only script");
            return Err(SyncError::ReadOnly);
        }
        let (state, server_active) = match &self.session {
            Some(session) => (session.state, session.session_active),
            None => return Err(SyncError::NoActiveSession),
        };
        let op = op.materialize();

        match self.phase {
            Phase::Active if server_active => {
                self.timers.cancel(&TimerKey::DriftCheck);
                match self.buffer.enqueue(state, op) {
                    Some(edit) => self.send_edit(edit),
                    None => log::debug!("edit buffered behind {} others", self.buffer.len() - 1),
                }
            }
            Phase::Active => {
                log::info!("server session is no longer active, rejoining");
                self.begin_rejoin(None);
                self.stash.push(op);
            }
            Phase::Joining | Phase::Rejoining => self.stash.push(op),
            Phase::Offline => log::debug!("offline edit kept locally"),
            Phase::Idle | Phase::Closed => return Err(SyncError::NoActiveSession),
        }
        Ok(())
    }

    pub(crate) fn send_edit(&mut self, edit: PendingEdit) {
        log::debug!("sending edit {} at state {}", edit.id, edit.state);
        self.timers
            .arm(TimerKey::Ack(edit.id.clone()), self.config.edit_timeout());
        self.send(ClientAction::Edit {
            id: edit.id,
            state: edit.state,
            edit_data: edit.operation,
        });
    }

    /// Move every unacknowledged edit into the stash.
    pub(crate) fn stash_buffer(&mut self) {
        if self.stash.is_empty() {
            self.stash_in_flight = self.buffer.awaiting().map(str::to_string);
        }
        self.timers.cancel_acks();
        let edits = self.buffer.take_all();
        self.stash.extend(edits.into_iter().map(|edit| edit.operation));
    }

    // ── Presence ─────────────────────────────────────────────────

    pub fn update_cursor(&mut self, position: usize) {
        if let Some(position) = self.presence.update_local_cursor(position) {
            if let Some(state) = self.live_state() {
                self.send(ClientAction::CursorPosition { position, state });
            }
        }
    }

    pub fn update_selection(&mut self, start: usize, end: usize) {
        if let Some((start, end)) = self.presence.update_local_selection(start, end) {
            if let Some(state) = self.live_state() {
                self.send(ClientAction::Select { start, end, state });
            }
        }
    }

    /// State counter if presence updates should go out right now.
    fn live_state(&self) -> Option<u64> {
        match &self.session {
            Some(session) if self.phase == Phase::Active && session.session_active => {
                Some(session.state)
            }
            _ => None,
        }
    }

    // ── Collaboration management ─────────────────────────────────

    pub fn add_collaborators(&mut self, share_id: &str, collaborators: &[String]) {
        let collaborators: Vec<String> = collaborators.iter().map(|c| c.to_lowercase()).collect();
        if let Some(session) = self.session.as_mut().filter(|s| s.script_id() == share_id) {
            session.members.add(&collaborators);
            self.events.push_back(SessionEvent::RosterChanged);
        }
        self.send_to(share_id, ClientAction::AddCollaborators { collaborators });
    }

    pub fn remove_collaborators(&mut self, share_id: &str, collaborators: &[String]) {
        let collaborators: Vec<String> = collaborators.iter().map(|c| c.to_lowercase()).collect();
        if let Some(session) = self.session.as_mut().filter(|s| s.script_id() == share_id) {
            session.members.remove(&collaborators);
            self.events.push_back(SessionEvent::RosterChanged);
        }
        self.send_to(share_id, ClientAction::RemoveCollaborators { collaborators });
    }

    /// Give up collaborating on a script. Closes it if it is open.
    pub fn leave_collaboration(&mut self, share_id: &str) {
        self.send_to(share_id, ClientAction::LeaveCollaboration);
        if self.script_id() == Some(share_id) {
            let _ = self.close_script(share_id);
        }
    }

    pub fn rename_script(&mut self, script_name: &str) -> Result<()> {
        self.require_session()?;
        self.send(ClientAction::RenameScript {
            script_name: script_name.to_string(),
        });
        Ok(())
    }

    pub fn save_script(&mut self) -> Result<()> {
        self.require_session()?;
        self.send(ClientAction::SaveScript);
        Ok(())
    }

    pub fn join_tutoring(&mut self) -> Result<()> {
        self.require_session()?;
        self.tutoring = true;
        self.send(ClientAction::JoinTutoring);
        Ok(())
    }

    pub fn leave_tutoring(&mut self) -> Result<()> {
        self.require_session()?;
        self.tutoring = false;
        self.send(ClientAction::LeaveTutoring);
        Ok(())
    }

    pub fn send_chat(&mut self, message: Value, message_type: &str) -> Result<()> {
        self.require_session()?;
        self.send(ClientAction::Chat {
            cai_message: message,
            cai_message_type: message_type.to_string(),
        });
        Ok(())
    }

    /// Report that the script was compiled with this text.
    pub fn send_compilation_record(&mut self, text: &str) -> Result<()> {
        self.require_session()?;
        self.send(ClientAction::Compile {
            text: text.to_string(),
        });
        Ok(())
    }

    fn require_session(&self) -> Result<()> {
        match self.session {
            Some(_) => Ok(()),
            None => Err(SyncError::NoActiveSession),
        }
    }

    // ── Outbound helpers ─────────────────────────────────────────

    pub(crate) fn send(&mut self, action: ClientAction) {
        let script_id = self.script_id().unwrap_or_default().to_string();
        self.send_to(&script_id, action);
    }

    pub(crate) fn send_to(&mut self, script_id: &str, action: ClientAction) {
        let header = Header::new(script_id, self.user_name.as_str());
        self.outgoing.push_back(ClientMessage::new(header, action));
    }

    pub(crate) fn notify(&mut self, level: NotifyLevel, text: impl Into<String>) {
        self.events.push_back(SessionEvent::Notify {
            level,
            text: text.into(),
        });
    }

    // ── Inbound dispatch ─────────────────────────────────────────

    /// Handle one server frame.
    pub fn handle_message(&mut self, message: ServerMessage) {
        let ServerMessage { header, action } = message;
        if header.notification_type != NOTIFICATION_TYPE {
            log::debug!("ignoring {} notification", header.notification_type);
            return;
        }
        let sender = header.sender.to_lowercase();
        let script_id = header.script_id;

        if action.is_session_scoped() && !self.in_session(&script_id) {
            log::debug!("dropping {action:?} for inactive script {script_id}");
            return;
        }

        match action {
            ServerAction::JoinedSession {
                script_text,
                state,
                active_members,
                request_id,
            } => self.on_joined_session(&script_id, script_text, state, active_members, request_id),
            ServerAction::SessionStatus { active, state } => self.on_session_status(active, state),
            ServerAction::SessionClosed => self.on_session_closed(&script_id),
            ServerAction::SessionClosedForInactivity => {
                self.notify(
                    NotifyLevel::Info,
                    "Remote collaboration session was closed because of a prolonged inactivity.",
                );
                self.on_session_closed(&script_id);
            }
            ServerAction::SessionsFull => self.on_sessions_full(&script_id),
            ServerAction::Edit {
                id,
                state,
                edit_data,
            } => self.on_edit(id, state, edit_data),
            ServerAction::SyncToSession { state, script_text } => {
                self.on_sync_to_session(state, script_text)
            }
            ServerAction::SyncError { state, script_text } => {
                self.on_sync_error(state, script_text)
            }
            ServerAction::MemberJoinedSession => self.on_member_joined(sender),
            ServerAction::MemberLeftSession => self.on_member_left(sender),
            ServerAction::CursorPosition { position } => {
                if !self.is_self(&sender) {
                    let index = self.member_index(&sender);
                    let marker = self.presence.on_remote_cursor(&sender, position, index).clone();
                    self.events.push_back(SessionEvent::PresenceUpdated(marker));
                }
            }
            ServerAction::Select { start, end } => {
                if !self.is_self(&sender) {
                    let index = self.member_index(&sender);
                    let marker = self
                        .presence
                        .on_remote_selection(&sender, start, end, index)
                        .clone();
                    self.events.push_back(SessionEvent::PresenceUpdated(marker));
                }
            }
            ServerAction::ScriptText {
                script_text,
                request_id,
            } => self.on_script_text(script_text, request_id),
            ServerAction::UserAddedToCollaboration { added_members } => {
                if let Some(session) = self.session_for(&script_id) {
                    session.members.add(&added_members);
                    self.events.push_back(SessionEvent::RosterChanged);
                }
            }
            ServerAction::UserRemovedFromCollaboration { removed_members } => {
                self.on_user_removed(&script_id, removed_members)
            }
            ServerAction::UserLeftCollaboration => self.on_user_left(&script_id, sender),
            ServerAction::ScriptRenamed { script_name } => {
                log::info!("script {script_id} renamed to {script_name:?}");
                self.events.push_back(SessionEvent::ScriptRenamed {
                    script_id,
                    name: script_name,
                });
            }
            ServerAction::ScriptSaved => {
                if sender != ASSISTANT_USER {
                    self.notify(
                        NotifyLevel::Success,
                        format!("{sender} saved the current version of the script."),
                    );
                }
            }
            ServerAction::MiscMessage { text } => {
                if sender != ASSISTANT_USER {
                    self.notify(NotifyLevel::Info, text);
                }
            }
            ServerAction::WriteAccess { can_edit } => {
                self.read_only = !can_edit;
                self.doc.set_read_only(!can_edit);
                let text = if can_edit {
                    format!("{sender} gave you the write access!")
                } else {
                    "You no longer have the write access.".to_string()
                };
                self.notify(NotifyLevel::Info, text);
                self.events.push_back(SessionEvent::WriteAccessChanged(can_edit));
            }
            ServerAction::Chat {
                cai_message,
                cai_message_type,
            } => {
                if !self.is_self(&sender) {
                    self.events.push_back(SessionEvent::Chat {
                        sender,
                        message: cai_message,
                        message_type: cai_message_type,
                    });
                }
            }
            ServerAction::JoinedTutoring => self.events.push_back(SessionEvent::JoinedTutoring),
            ServerAction::Unknown => log::debug!("ignoring unknown action from {sender}"),
        }
    }

    pub(crate) fn in_session(&self, script_id: &str) -> bool {
        self.phase.is_joined() && self.script_id() == Some(script_id)
    }

    fn session_for(&mut self, script_id: &str) -> Option<&mut Session> {
        self.session
            .as_mut()
            .filter(|session| session.script_id() == script_id)
    }

    fn is_self(&self, name: &str) -> bool {
        name == self.user_name
    }

    fn member_index(&self, name: &str) -> Option<usize> {
        self.session
            .as_ref()
            .and_then(|session| session.members.index_of(name))
    }

    // ── Edits from the server ────────────────────────────────────

    fn on_edit(&mut self, id: String, state: u64, op: Operation) {
        let op = op.materialize();

        if self.buffer.awaiting() == Some(id.as_str()) {
            self.on_ack(&id, op);
            return;
        }

        if self.phase == Phase::Rejoining && self.stash_in_flight.as_deref() == Some(id.as_str()) {
            // our edit made it before the rejoin; keep the shadow text in step
            self.stash_in_flight = None;
            if !self.stash.is_empty() {
                self.stash.remove(0);
                self.record_server_op(op);
            }
            return;
        }

        self.on_remote_edit(state, op);
    }

    /// Our edit came back. `sequenced` is the server's version of it, which
    /// is what the shadow text must follow.
    fn on_ack(&mut self, id: &str, sequenced: Operation) {
        self.timers.cancel(&TimerKey::Ack(id.to_string()));
        self.record_server_op(sequenced);
        let Some(state) = self.state() else {
            return;
        };

        match self.buffer.acknowledge(id, state) {
            Ack::Drained => {
                log::debug!("in sync at state {state}");
                self.timers
                    .arm(TimerKey::DriftCheck, self.config.drift_check_delay());
            }
            Ack::SendNext(next) => self.send_edit(next),
            Ack::OutOfSync { expected, found } => {
                log::warn!("buffered edit carries state {found}, expected {expected}");
                self.begin_rejoin(Some(SyncError::StateMismatch {
                    local: expected,
                    remote: found,
                }));
            }
            Ack::NotAwaited => {}
        }
    }

    fn on_remote_edit(&mut self, state: u64, op: Operation) {
        let Some(local) = self.state() else {
            return;
        };
        if self.phase == Phase::Active && state != local {
            log::warn!("out of sync: local state {local}, server state {state}");
            self.send(ClientAction::RequestSync { state: local });
            self.events.push_back(SessionEvent::Desync(SyncError::StateMismatch {
                local,
                remote: state,
            }));
        }

        if !self.buffer.is_empty() {
            log::debug!("adjusting {} buffered edits", self.buffer.len());
        }
        let (transformed, mut gaps) = self.buffer.rebase(op.clone());
        let (transformed, stash_gaps) = rebase_through(transformed, self.stash.iter_mut());
        gaps.extend(stash_gaps);
        if !gaps.is_empty() {
            for gap in &gaps {
                log::warn!("{gap}");
            }
            self.timers
                .arm(TimerKey::DriftCheck, std::time::Duration::ZERO);
        }

        self.apply_to_document(&transformed);
        self.record_server_op(op);
    }

    /// Apply a server operation to the document under the edit lock,
    /// carrying the local caret and remote markers along.
    fn apply_to_document(&mut self, op: &Operation) {
        self.editor_locked = true;
        let cursor = self.doc.cursor();
        self.doc.apply(op);
        self.doc.set_cursor(op.adjust_position(cursor));
        self.presence.adjust_local(op);
        self.presence.adjust_remote(op);
        self.editor_locked = false;
    }

    /// Count an operation the server has sequenced.
    fn record_server_op(&mut self, op: Operation) {
        if let Some(session) = self.session.as_mut() {
            op.apply_to(&mut session.server_text);
            session.history.record(session.state, op);
            session.state += 1;
        }
    }

    // ── Roster ───────────────────────────────────────────────────

    fn on_member_joined(&mut self, sender: String) {
        if sender != ASSISTANT_USER {
            self.notify(
                NotifyLevel::Info,
                format!("{sender} has joined the collaboration session."),
            );
        }
        if let Some(session) = self.session.as_mut() {
            session.members.set_active(&sender, true);
        }
        self.events.push_back(SessionEvent::MemberJoined(sender));
    }

    fn on_member_left(&mut self, sender: String) {
        if sender != ASSISTANT_USER {
            self.notify(
                NotifyLevel::Info,
                format!("{sender} has left the collaboration session."),
            );
        }
        if let Some(session) = self.session.as_mut() {
            session.members.set_active(&sender, false);
        }
        if self.presence.remove_marker(&sender).is_some() {
            self.events
                .push_back(SessionEvent::PresenceRemoved(sender.clone()));
        }
        self.events.push_back(SessionEvent::MemberLeft(sender));
    }

    fn on_session_closed(&mut self, script_id: &str) {
        if let Some(session) = self.session_for(script_id) {
            log::info!("server closed session {script_id}");
            session.session_active = false;
            session.members.deactivate_all();
            self.presence.clear_markers();
        }
    }

    fn on_user_removed(&mut self, script_id: &str, removed: Vec<String>) {
        let removed: Vec<String> = removed.iter().map(|name| name.to_lowercase()).collect();
        if removed.contains(&self.user_name) {
            log::info!("removed from collaboration on {script_id}");
            self.events
                .push_back(SessionEvent::CloseRequested(script_id.to_string()));
            if self.script_id() == Some(script_id) {
                let _ = self.close_script(script_id);
            }
        } else if let Some(session) = self.session_for(script_id) {
            session.members.remove(&removed);
            for name in &removed {
                self.presence.remove_marker(name);
            }
            self.events.push_back(SessionEvent::RosterChanged);
        }
    }

    fn on_user_left(&mut self, script_id: &str, sender: String) {
        let Some(session) = self.session_for(script_id) else {
            return;
        };
        session.members.remove(&[sender.as_str()]);
        let now_alone = session.members.is_empty();
        self.presence.remove_marker(&sender);
        self.events.push_back(SessionEvent::RosterChanged);

        if now_alone {
            log::info!("last collaborator left {script_id}");
            let _ = self.close_script(script_id);
        }
    }
}
