//! Edit operations exchanged between collaborators.
//!
//! Wire format (JSON, tagged by `action`):
//! ```text
//! {"action":"insert","start":4,"text":"ab","len":2,"end":6}
//! {"action":"remove","start":4,"len":2,"end":6}
//! {"action":"mult","operations":[ … ]}
//! ```
//!
//! Offsets count Unicode scalar values, not bytes. `end` (and `len` for
//! inserts) are derived fields: they are recomputed by [`Operation::materialize`]
//! before every transform and by [`Operation::finalize`] after it, so values
//! received over the wire are never trusted.

use serde::{Deserialize, Serialize};

/// A single atomic edit, or a transient decomposition of one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Operation {
    Insert {
        start: usize,
        text: String,
        #[serde(default)]
        len: usize,
        #[serde(default)]
        end: usize,
    },
    Remove {
        start: usize,
        len: usize,
        #[serde(default)]
        end: usize,
    },
    /// Only produced by the transform engine when an operation has to be
    /// split around a concurrent edit. Sub-operations apply in order.
    #[serde(rename = "mult")]
    Multi { operations: Vec<Operation> },
}

impl Operation {
    /// Insert `text` at `start`.
    pub fn insert(start: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        let len = text.chars().count();
        Self::Insert {
            start,
            text,
            len,
            end: start + len,
        }
    }

    /// Remove `len` characters starting at `start`.
    pub fn remove(start: usize, len: usize) -> Self {
        Self::Remove {
            start,
            len,
            end: start + len,
        }
    }

    pub fn multi(operations: Vec<Operation>) -> Self {
        Self::Multi { operations }
    }

    /// Deep copy with every derived field filled in.
    pub fn materialize(&self) -> Self {
        match self {
            Self::Insert { start, text, .. } => Self::insert(*start, text.clone()),
            Self::Remove { start, len, .. } => Self::remove(*start, *len),
            Self::Multi { operations } => {
                Self::multi(operations.iter().map(Operation::materialize).collect())
            }
        }
    }

    /// Re-derive `end` after positions or lengths were adjusted.
    pub fn finalize(self) -> Self {
        match self {
            Self::Insert {
                start, text, len, ..
            } => Self::Insert {
                start,
                text,
                len,
                end: start + len,
            },
            Self::Remove { start, len, .. } => Self::Remove {
                start,
                len,
                end: start + len,
            },
            Self::Multi { operations } => {
                Self::multi(operations.into_iter().map(Operation::finalize).collect())
            }
        }
    }

    /// True when applying the operation leaves every document unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Insert { text, .. } => text.is_empty(),
            Self::Remove { len, .. } => *len == 0,
            Self::Multi { operations } => operations.iter().all(Operation::is_noop),
        }
    }

    /// Map a document offset through this operation.
    ///
    /// An insertion at or before the offset pushes it right; a removal that
    /// spans it clamps it to the removal start; a removal entirely before it
    /// pulls it left.
    pub fn adjust_position(&self, index: usize) -> usize {
        match self {
            Self::Insert { start, text, .. } => {
                if *start <= index {
                    index + text.chars().count()
                } else {
                    index
                }
            }
            Self::Remove { start, len, .. } => {
                let end = start + len;
                if *start < index {
                    if end <= index {
                        index - len
                    } else {
                        *start
                    }
                } else {
                    index
                }
            }
            Self::Multi { operations } => operations
                .iter()
                .fold(index, |index, op| op.adjust_position(index)),
        }
    }

    /// Apply to a plain string. Out-of-range offsets are clamped.
    pub fn apply_to(&self, text: &mut String) {
        match self {
            Self::Insert { start, text: ins, .. } => {
                let at = byte_offset(text, *start);
                text.insert_str(at, ins);
            }
            Self::Remove { start, len, .. } => {
                let from = byte_offset(text, *start);
                let to = byte_offset(text, start + len);
                text.replace_range(from..to, "");
            }
            Self::Multi { operations } => {
                for op in operations {
                    op.apply_to(text);
                }
            }
        }
    }

    /// Smallest single edit turning `old` into `new`, found by trimming the
    /// common prefix and suffix. `None` when the texts are equal.
    pub fn diff(old: &str, new: &str) -> Option<Self> {
        if old == new {
            return None;
        }
        let old_chars: Vec<char> = old.chars().collect();
        let new_chars: Vec<char> = new.chars().collect();

        let prefix = old_chars
            .iter()
            .zip(&new_chars)
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
        let suffix = old_chars
            .iter()
            .rev()
            .zip(new_chars.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let removed = old_chars.len() - prefix - suffix;
        let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

        Some(match (removed, inserted.is_empty()) {
            (0, _) => Self::insert(prefix, inserted),
            (n, true) => Self::remove(prefix, n),
            (n, false) => Self::multi(vec![Self::remove(prefix, n), Self::insert(prefix, inserted)]),
        })
    }
}

/// Byte offset of the `index`-th char, clamped to the end of `text`.
pub(crate) fn byte_offset(text: &str, index: usize) -> usize {
    text.char_indices()
        .nth(index)
        .map_or(text.len(), |(offset, _)| offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied(doc: &str, op: &Operation) -> String {
        let mut text = doc.to_string();
        op.apply_to(&mut text);
        text
    }

    #[test]
    fn test_insert_derived_fields() {
        let op = Operation::insert(3, "héllo");
        match op {
            Operation::Insert { start, len, end, .. } => {
                assert_eq!(len, 5);
                assert_eq!(end - start, len);
            }
            _ => panic!("expected insert"),
        }
    }

    #[test]
    fn test_remove_derived_fields() {
        match Operation::remove(2, 4) {
            Operation::Remove { start, len, end } => assert_eq!(end - start, len),
            _ => panic!("expected remove"),
        }
    }

    #[test]
    fn test_materialize_ignores_wire_values() {
        let wire = Operation::Insert {
            start: 1,
            text: "abc".into(),
            len: 99,
            end: 0,
        };
        assert_eq!(wire.materialize(), Operation::insert(1, "abc"));
    }

    #[test]
    fn test_finalize_recurses_into_multi() {
        let op = Operation::multi(vec![
            Operation::Remove { start: 1, len: 2, end: 0 },
            Operation::Remove { start: 5, len: 1, end: 0 },
        ]);
        assert_eq!(
            op.finalize(),
            Operation::multi(vec![Operation::remove(1, 2), Operation::remove(5, 1)])
        );
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(Operation::insert(1, "X")).unwrap();
        assert_eq!(json["action"], "insert");
        assert_eq!(json["end"], 2);

        let multi: Operation = serde_json::from_str(
            r#"{"action":"mult","operations":[{"action":"remove","start":0,"len":1}]}"#,
        )
        .unwrap();
        assert_eq!(multi.materialize(), Operation::multi(vec![Operation::remove(0, 1)]));
    }

    #[test]
    fn test_apply_to_string() {
        assert_eq!(applied("ABCDE", &Operation::insert(1, "X")), "AXBCDE");
        assert_eq!(applied("ABCDE", &Operation::remove(3, 2)), "ABC");
        assert_eq!(applied("añb", &Operation::remove(1, 1)), "ab");
        assert_eq!(applied("AB", &Operation::insert(10, "!")), "AB!");
    }

    #[test]
    fn test_multi_applies_sequentially() {
        let op = Operation::multi(vec![Operation::remove(1, 1), Operation::remove(1, 2)]);
        assert_eq!(applied("ABEFG", &op), "AG");
    }

    #[test]
    fn test_adjust_position() {
        assert_eq!(Operation::insert(2, "xyz").adjust_position(2), 5);
        assert_eq!(Operation::insert(3, "xyz").adjust_position(2), 2);
        assert_eq!(Operation::remove(0, 2).adjust_position(5), 3);
        assert_eq!(Operation::remove(1, 5).adjust_position(3), 1);
        assert_eq!(Operation::remove(4, 2).adjust_position(3), 3);
    }

    #[test]
    fn test_diff() {
        assert_eq!(Operation::diff("abc", "abc"), None);
        assert_eq!(Operation::diff("abc", "abXc"), Some(Operation::insert(2, "X")));
        assert_eq!(Operation::diff("abcd", "ad"), Some(Operation::remove(1, 2)));

        let op = Operation::diff("hello world", "hello there").unwrap();
        assert_eq!(applied("hello world", &op), "hello there");
    }

    #[test]
    fn test_diff_repeated_chars() {
        for (old, new) in [("aaa", "aa"), ("aa", "aaaa"), ("abab", "ab"), ("", "x"), ("x", "")] {
            let op = Operation::diff(old, new).unwrap();
            assert_eq!(applied(old, &op), new, "{old:?} -> {new:?}");
        }
    }
}
