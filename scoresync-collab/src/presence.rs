//! Presence relay: who is looking at what.
//!
//! ## Architecture
//!
//! ```text
//! Local caret / selection change
//!       │
//!       ▼
//! PresenceRelay::update_local_cursor()   (only when it moved)
//!       │
//!       ▼
//! cursorPosition { position }  /  select { start, end }
//!       │
//!       ▼   (server fan-out)
//! Remote PresenceRelay::on_remote_*()
//!       │
//!       ▼
//! RemoteMarker, replaced wholesale per user
//! ```
//!
//! Positions travel as flat char offsets rather than row/column pairs, so
//! they can be pushed through [`Operation::adjust_position`] when the text
//! changes underneath them.

use std::collections::HashMap;

use crate::operation::Operation;

// ───────────────────────────────────────────────────────────────────
// Remote markers
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// A caret, rendered one character wide.
    Cursor,
    Selection,
}

/// Where a remote collaborator's caret or selection is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMarker {
    pub user: String,
    pub kind: MarkerKind,
    pub start: usize,
    pub end: usize,
    /// Colour band, `1..=bands` for known members, 0 for strangers.
    pub band: usize,
}

impl RemoteMarker {
    fn adjust(&mut self, op: &Operation) {
        self.start = op.adjust_position(self.start);
        self.end = op.adjust_position(self.end).max(self.start);
    }
}

/// Colour band for a member at roster position `index`.
pub fn color_band(index: Option<usize>, bands: usize) -> usize {
    match index {
        Some(i) if bands > 0 => i % bands + 1,
        _ => 0,
    }
}

// ───────────────────────────────────────────────────────────────────
// Relay
// ───────────────────────────────────────────────────────────────────

/// Local caret/selection tracking plus the markers of everyone else.
#[derive(Debug, Clone)]
pub struct PresenceRelay {
    local_cursor: Option<usize>,
    local_selection: Option<(usize, usize)>,
    markers: HashMap<String, RemoteMarker>,
    bands: usize,
}

impl PresenceRelay {
    pub fn new(bands: usize) -> Self {
        Self {
            local_cursor: None,
            local_selection: None,
            markers: HashMap::new(),
            bands,
        }
    }

    /// Record the local caret. Returns the position to broadcast, or `None`
    /// if it did not move.
    pub fn update_local_cursor(&mut self, position: usize) -> Option<usize> {
        if self.local_cursor == Some(position) {
            return None;
        }
        self.local_cursor = Some(position);
        Some(position)
    }

    /// Record the local selection. Returns the range to broadcast, or `None`
    /// if unchanged.
    pub fn update_local_selection(&mut self, start: usize, end: usize) -> Option<(usize, usize)> {
        let range = (start.min(end), start.max(end));
        if self.local_selection == Some(range) {
            return None;
        }
        self.local_selection = Some(range);
        Some(range)
    }

    pub fn local_cursor(&self) -> Option<usize> {
        self.local_cursor
    }

    pub fn local_selection(&self) -> Option<(usize, usize)> {
        self.local_selection
    }

    /// Move the stored local caret and selection through `op`. Returns the
    /// new caret position if one is stored.
    pub fn adjust_local(&mut self, op: &Operation) -> Option<usize> {
        if let Some((start, end)) = self.local_selection {
            let start = op.adjust_position(start);
            let end = op.adjust_position(end).max(start);
            self.local_selection = Some((start, end));
        }
        self.local_cursor = self.local_cursor.map(|pos| op.adjust_position(pos));
        self.local_cursor
    }

    /// Forget the local caret, e.g. after the document was replaced.
    pub fn reset_local(&mut self, cursor: Option<usize>) {
        self.local_cursor = cursor;
        self.local_selection = None;
    }

    /// Replace a user's marker with a caret.
    pub fn on_remote_cursor(
        &mut self,
        user: &str,
        position: usize,
        member_index: Option<usize>,
    ) -> &RemoteMarker {
        self.place(user, MarkerKind::Cursor, position, position + 1, member_index)
    }

    /// Replace a user's marker with a selection; an empty selection is a caret.
    pub fn on_remote_selection(
        &mut self,
        user: &str,
        start: usize,
        end: usize,
        member_index: Option<usize>,
    ) -> &RemoteMarker {
        let (start, end) = (start.min(end), start.max(end));
        if start == end {
            self.place(user, MarkerKind::Cursor, start, start + 1, member_index)
        } else {
            self.place(user, MarkerKind::Selection, start, end, member_index)
        }
    }

    fn place(
        &mut self,
        user: &str,
        kind: MarkerKind,
        start: usize,
        end: usize,
        member_index: Option<usize>,
    ) -> &RemoteMarker {
        let user = user.to_lowercase();
        let marker = RemoteMarker {
            user: user.clone(),
            kind,
            start,
            end,
            band: color_band(member_index, self.bands),
        };
        self.markers.insert(user.clone(), marker);
        &self.markers[&user]
    }

    /// Shift every remote marker through an edit applied to the document.
    pub fn adjust_remote(&mut self, op: &Operation) {
        for marker in self.markers.values_mut() {
            marker.adjust(op);
        }
    }

    pub fn remove_marker(&mut self, user: &str) -> Option<RemoteMarker> {
        self.markers.remove(&user.to_lowercase())
    }

    pub fn clear_markers(&mut self) {
        self.markers.clear();
    }

    pub fn marker(&self, user: &str) -> Option<&RemoteMarker> {
        self.markers.get(&user.to_lowercase())
    }

    pub fn markers(&self) -> impl Iterator<Item = &RemoteMarker> {
        self.markers.values()
    }

    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // ── Local tracking ───────────────────────────────────────────

    #[test]
    fn test_local_cursor_only_reported_on_change() {
        let mut relay = PresenceRelay::new(6);
        assert_eq!(relay.update_local_cursor(4), Some(4));
        assert_eq!(relay.update_local_cursor(4), None);
        assert_eq!(relay.update_local_cursor(5), Some(5));
    }

    #[test]
    fn test_local_selection_normalized() {
        let mut relay = PresenceRelay::new(6);
        assert_eq!(relay.update_local_selection(9, 2), Some((2, 9)));
        assert_eq!(relay.update_local_selection(2, 9), None);
    }

    #[test]
    fn test_adjust_local() {
        let mut relay = PresenceRelay::new(6);
        relay.update_local_cursor(5);
        relay.update_local_selection(3, 8);

        assert_eq!(relay.adjust_local(&Operation::insert(0, "ab")), Some(7));
        assert_eq!(relay.local_selection(), Some((5, 10)));

        // removal spanning the caret clamps it to the removal start
        assert_eq!(relay.adjust_local(&Operation::remove(6, 4)), Some(6));
    }

    // ── Remote markers ───────────────────────────────────────────

    #[test]
    fn test_color_band() {
        assert_eq!(color_band(Some(0), 6), 1);
        assert_eq!(color_band(Some(5), 6), 6);
        assert_eq!(color_band(Some(6), 6), 1);
        assert_eq!(color_band(None, 6), 0);
    }

    #[test]
    fn test_remote_cursor_replaced_wholesale() {
        let mut relay = PresenceRelay::new(6);
        relay.on_remote_selection("Bob", 2, 6, Some(1));
        let marker = relay.on_remote_cursor("bob", 9, Some(1)).clone();

        assert_eq!(relay.marker_count(), 1);
        assert_eq!(marker.kind, MarkerKind::Cursor);
        assert_eq!((marker.start, marker.end), (9, 10));
        assert_eq!(marker.band, 2);
    }

    #[test]
    fn test_empty_selection_is_cursor() {
        let mut relay = PresenceRelay::new(6);
        let marker = relay.on_remote_selection("carol", 3, 3, None);
        assert_eq!(marker.kind, MarkerKind::Cursor);
        assert_eq!(marker.band, 0);
    }

    #[test]
    fn test_remote_markers_follow_edits() {
        let mut relay = PresenceRelay::new(6);
        relay.on_remote_selection("bob", 4, 8, Some(0));
        relay.adjust_remote(&Operation::insert(0, "xx"));
        let marker = relay.marker("bob").unwrap();
        assert_eq!((marker.start, marker.end), (6, 10));

        relay.adjust_remote(&Operation::remove(0, 20));
        let marker = relay.marker("bob").unwrap();
        assert_eq!((marker.start, marker.end), (0, 0));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut relay = PresenceRelay::new(6);
        relay.on_remote_cursor("a", 1, None);
        relay.on_remote_cursor("b", 1, None);
        assert!(relay.remove_marker("A").is_some());
        assert_eq!(relay.marker_count(), 1);
        relay.clear_markers();
        assert_eq!(relay.markers().count(), 0);
    }
}
