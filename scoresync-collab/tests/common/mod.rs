//! In-process stand-in for the central sequencing server.
//!
//! Sequences edits by state number, transforming late edits against the
//! history they missed, and answers the join / sync / text requests the
//! client sends. Replies are returned as `(recipient, frame)` pairs so the
//! tests decide when they are delivered.

#![allow(dead_code)]

use scoresync_collab::protocol::{ClientAction, ClientMessage, Header, ServerAction, ServerMessage};
use scoresync_collab::{transform, Operation};

pub const SCRIPT_ID: &str = "share-1";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Hub {
    pub script_id: String,
    pub text: String,
    pub history: Vec<Operation>,
    pub joined: Vec<String>,
    /// Edits from this user are lost without being sequenced.
    pub drop_edits_from: Option<String>,
    /// Refuse every join with `sessionsFull`.
    pub full: bool,
}

impl Hub {
    pub fn new(text: &str) -> Self {
        Self {
            script_id: SCRIPT_ID.to_string(),
            text: text.to_string(),
            history: Vec::new(),
            joined: Vec::new(),
            drop_edits_from: None,
            full: false,
        }
    }

    pub fn state(&self) -> u64 {
        self.history.len() as u64
    }

    fn frame(&self, sender: &str, action: ServerAction) -> ServerMessage {
        ServerMessage::new(Header::new(self.script_id.as_str(), sender), action)
    }

    fn others(&self, sender: &str) -> Vec<String> {
        self.joined.iter().filter(|m| *m != sender).cloned().collect()
    }

    pub fn handle(&mut self, msg: ClientMessage) -> Vec<(String, ServerMessage)> {
        let sender = msg.header.sender.clone();
        let mut out = Vec::new();

        match msg.action {
            ClientAction::JoinSession { .. } | ClientAction::RejoinSession { .. } => {
                let request_id = match &msg.action {
                    ClientAction::RejoinSession { request_id, .. } => Some(request_id.clone()),
                    _ => None,
                };
                if self.full {
                    out.push((sender.clone(), self.frame("server", ServerAction::SessionsFull)));
                    return out;
                }
                if !self.joined.contains(&sender) {
                    for other in self.others(&sender) {
                        out.push((other, self.frame(&sender, ServerAction::MemberJoinedSession)));
                    }
                    self.joined.push(sender.clone());
                }
                let reply = self.frame(
                    "server",
                    ServerAction::JoinedSession {
                        script_text: self.text.clone(),
                        state: self.state(),
                        active_members: self.joined.clone(),
                        request_id,
                    },
                );
                out.push((sender, reply));
            }
            ClientAction::LeaveSession => {
                self.joined.retain(|m| *m != sender);
                for other in self.others(&sender) {
                    out.push((other, self.frame(&sender, ServerAction::MemberLeftSession)));
                }
            }
            ClientAction::Edit {
                id,
                state,
                edit_data,
            } => {
                if self.drop_edits_from.as_deref() == Some(sender.as_str()) {
                    return out;
                }
                let mut op = edit_data.materialize();
                let missed = self.history.get(state as usize..).unwrap_or(&[]);
                for seen in missed {
                    if let Ok((_, rebased)) = transform(seen, &op) {
                        op = rebased;
                    }
                }
                let parent = self.state();
                op.apply_to(&mut self.text);
                self.history.push(op.clone());
                for member in self.joined.clone() {
                    let frame = self.frame(
                        &sender,
                        ServerAction::Edit {
                            id: id.clone(),
                            state: parent,
                            edit_data: op.clone(),
                        },
                    );
                    out.push((member, frame));
                }
            }
            ClientAction::GetScriptText { request_id } => {
                let reply = self.frame(
                    "server",
                    ServerAction::ScriptText {
                        script_text: self.text.clone(),
                        request_id: Some(request_id),
                    },
                );
                out.push((sender, reply));
            }
            ClientAction::RequestSync { .. } => {
                let reply = self.frame(
                    "server",
                    ServerAction::SyncToSession {
                        state: self.state(),
                        script_text: self.text.clone(),
                    },
                );
                out.push((sender, reply));
            }
            ClientAction::CheckSessionStatus { .. } => {
                let reply = self.frame(
                    "server",
                    ServerAction::SessionStatus {
                        active: self.joined.contains(&sender),
                        state: Some(self.state()),
                    },
                );
                out.push((sender, reply));
            }
            ClientAction::CursorPosition { position, .. } => {
                for other in self.others(&sender) {
                    out.push((other, self.frame(&sender, ServerAction::CursorPosition { position })));
                }
            }
            ClientAction::Select { start, end, .. } => {
                for other in self.others(&sender) {
                    out.push((other, self.frame(&sender, ServerAction::Select { start, end })));
                }
            }
            ClientAction::Chat {
                cai_message,
                cai_message_type,
            } => {
                for other in self.others(&sender) {
                    let frame = self.frame(
                        &sender,
                        ServerAction::Chat {
                            cai_message: cai_message.clone(),
                            cai_message_type: cai_message_type.clone(),
                        },
                    );
                    out.push((other, frame));
                }
            }
            _ => {}
        }
        out
    }
}
