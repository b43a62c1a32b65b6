//! Per-document session state: lifecycle phase, state counter, roster.
//!
//! ```text
//!  Idle ──open──► Joining ──joinedSession──► Active ◄──joinedSession── Rejoining
//!                    │                          │ └────timeout/mismatch/drift──┘
//!                    └──sessionsFull──► Offline │
//!                                               └──close / last member left──► Closed
//! ```
//!
//! Usernames are compared case-insensitively; everything stored here is
//! lower-cased on the way in.

use std::collections::BTreeMap;

use indexmap::IndexMap;

use crate::operation::Operation;

/// Lifecycle phase of the collaboration engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Joining,
    Active,
    Rejoining,
    /// Editing locally without synchronization.
    Offline,
    Closed,
}

impl Phase {
    /// Joined from the client's point of view. Stays true while rejoining.
    pub fn is_joined(self) -> bool {
        matches!(self, Phase::Active | Phase::Rejoining)
    }
}

/// A collaborator on the shared script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    /// Currently connected to the session.
    pub active: bool,
    pub can_edit: bool,
}

impl Default for Member {
    fn default() -> Self {
        Self {
            active: false,
            can_edit: true,
        }
    }
}

/// Other members of the session, in the order they became known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    members: IndexMap<String, Member>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole roster with inactive members.
    pub fn set_all<S: AsRef<str>>(&mut self, names: &[S]) {
        self.members.clear();
        self.add(names);
    }

    /// Add inactive members, resetting any existing entries.
    pub fn add<S: AsRef<str>>(&mut self, names: &[S]) {
        for name in names {
            self.members
                .insert(name.as_ref().to_lowercase(), Member::default());
        }
    }

    pub fn remove<S: AsRef<str>>(&mut self, names: &[S]) {
        for name in names {
            self.members.shift_remove(&name.as_ref().to_lowercase());
        }
    }

    /// Mark a member (in)active, adding them if unknown.
    pub fn set_active(&mut self, name: &str, active: bool) {
        self.members
            .entry(name.to_lowercase())
            .or_default()
            .active = active;
    }

    pub fn deactivate_all(&mut self) {
        for member in self.members.values_mut() {
            member.active = false;
        }
    }

    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.get(&name.to_lowercase())
    }

    /// Position in insertion order. Drives the presence colour band.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.members.get_index_of(&name.to_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Member)> {
        self.members.iter().map(|(name, m)| (name.as_str(), m))
    }

    pub fn active_members(&self) -> Vec<String> {
        self.iter()
            .filter(|(_, m)| m.active)
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

/// The shared script a session is opened for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInfo {
    /// Share ID; identifies the collaboration session.
    pub share_id: String,
    /// Username of the script's owner.
    pub owner: String,
    pub collaborators: Vec<String>,
    /// Last saved source, used when falling back to offline editing.
    pub source: String,
}

impl ScriptInfo {
    pub fn new(
        share_id: impl Into<String>,
        owner: impl Into<String>,
        collaborators: Vec<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            share_id: share_id.into(),
            owner: owner.into().to_lowercase(),
            collaborators: collaborators.into_iter().map(|c| c.to_lowercase()).collect(),
            source: source.into(),
        }
    }
}

/// Acknowledged operations by state number, kept for diagnostics only.
#[derive(Debug, Clone, Default)]
pub struct History {
    entries: BTreeMap<u64, Operation>,
    window: usize,
}

impl History {
    pub fn new(window: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            window,
        }
    }

    pub fn record(&mut self, state: u64, op: Operation) {
        self.entries.insert(state, op);
        while self.entries.len() > self.window {
            self.entries.pop_first();
        }
    }

    pub fn get(&self, state: u64) -> Option<&Operation> {
        self.entries.get(&state)
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

/// One open collaborative document.
#[derive(Debug, Clone)]
pub struct Session {
    pub script: ScriptInfo,
    pub user_name: String,
    pub owner: bool,
    /// Operations applied since the session started; must match the
    /// server's counter.
    pub state: u64,
    pub members: Roster,
    /// Whether the server still keeps the session alive. It closes idle
    /// sessions on its own.
    pub session_active: bool,
    /// The document as the server has it, as far as this client knows:
    /// the local text without unacknowledged local edits.
    pub server_text: String,
    pub history: History,
}

impl Session {
    pub fn new(script: ScriptInfo, user_name: &str, history_window: usize) -> Self {
        let user_name = user_name.to_lowercase();
        let owner = script.owner == user_name;
        let mut session = Self {
            script,
            user_name,
            owner,
            state: 0,
            members: Roster::new(),
            session_active: false,
            server_text: String::new(),
            history: History::new(history_window),
        };
        session.seed_members();
        session
    }

    pub fn script_id(&self) -> &str {
        &self.script.share_id
    }

    /// Rebuild the roster from the script's owner and collaborator list.
    pub fn seed_members(&mut self) {
        self.members = Roster::new();
        if !self.owner {
            self.members.add(&[self.script.owner.as_str()]);
        }
        let others: Vec<&str> = self
            .script
            .collaborators
            .iter()
            .map(String::as_str)
            .filter(|name| *name != self.user_name)
            .collect();
        self.members.add(&others);
    }

    pub fn is_self(&self, name: &str) -> bool {
        name.to_lowercase() == self.user_name
    }
}
