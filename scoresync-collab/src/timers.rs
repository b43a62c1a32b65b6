//! Deadlines the engine waits on.
//!
//! The engine never sleeps; it records deadlines here and whoever drives it
//! calls [`CollabEngine::handle_timeout`](crate::engine::CollabEngine::handle_timeout)
//! once [`Timers::next_deadline`] has passed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Join, rejoin or status check awaiting the server.
    Sync,
    /// Acknowledgement of the edit with this ID.
    Ack(String),
    /// Idle comparison of local and server text.
    DriftCheck,
}

#[derive(Debug, Clone, Default)]
pub struct Timers {
    deadlines: HashMap<TimerKey, Instant>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer.
    pub fn arm(&mut self, key: TimerKey, after: Duration) {
        self.deadlines.insert(key, Instant::now() + after);
    }

    /// Returns whether the timer was armed.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.deadlines.remove(key).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    /// Cancel every acknowledgement timer.
    pub fn cancel_acks(&mut self) {
        self.deadlines.retain(|key, _| !matches!(key, TimerKey::Ack(_)));
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.deadlines.contains_key(key)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn expired(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut due: Vec<(TimerKey, Instant)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (key.clone(), *deadline))
            .collect();
        due.sort_by_key(|(_, deadline)| *deadline);
        for (key, _) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(key, _)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
