//! Operational transform over [`Operation`]s.
//!
//! `transform(a, b)` takes two operations computed against the same document
//! and returns `(a', b')` such that applying `a'` after `b` yields the same
//! text as applying `b'` after `a`.
//!
//! ```text
//!          a
//!   D ────────► D·a
//!   │            │
//!   b            b'
//!   ▼            ▼
//!  D·b ───a'──► D·a·b' == D·b·a'
//! ```
//!
//! Equal-position inserts resolve in favour of the left operand: its text
//! ends up first on every replica.
//!
//! Reference: Ellis & Gibbs, "Concurrency Control in Groupware Systems" (1989)

use crate::operation::Operation;

/// An operand pair the case table does not resolve.
///
/// The operands are returned untouched so the caller can decide how to
/// proceed; the periodic drift check repairs any divergence this causes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("uncovered transform case: {left:?} against {right:?}")]
pub struct TransformGap {
    pub left: Operation,
    pub right: Operation,
}

/// Transform two concurrent operations against each other.
pub fn transform(
    left: &Operation,
    right: &Operation,
) -> Result<(Operation, Operation), TransformGap> {
    let left = left.materialize();
    let right = right.materialize();

    let (left, right) = match (left, right) {
        (Operation::Multi { operations }, right) => {
            let mut running = right;
            let mut out = Vec::with_capacity(operations.len());
            for op in &operations {
                let (op, next) = transform(op, &running)?;
                out.push(op);
                running = next;
            }
            (Operation::multi(out), running)
        }
        (left, Operation::Multi { operations }) => {
            let mut running = left;
            let mut out = Vec::with_capacity(operations.len());
            for op in &operations {
                let (next, op) = transform(&running, op)?;
                out.push(op);
                running = next;
            }
            (running, Operation::multi(out))
        }
        (
            Operation::Insert { start: a, text: a_text, .. },
            Operation::Insert { start: b, text: b_text, .. },
        ) => {
            let (a, b) = insert_insert(a, a_text.chars().count(), b, b_text.chars().count());
            (Operation::insert(a, a_text), Operation::insert(b, b_text))
        }
        (Operation::Insert { start, text, .. }, Operation::Remove { start: r_start, len, .. }) => {
            let insert_len = text.chars().count();
            match insert_remove(start, insert_len, r_start, len) {
                Some((at, remove)) => (Operation::insert(at, text), remove),
                None => {
                    return Err(TransformGap {
                        left: Operation::insert(start, text),
                        right: Operation::remove(r_start, len),
                    })
                }
            }
        }
        (Operation::Remove { start: r_start, len, .. }, Operation::Insert { start, text, .. }) => {
            let insert_len = text.chars().count();
            match insert_remove(start, insert_len, r_start, len) {
                Some((at, remove)) => (remove, Operation::insert(at, text)),
                None => {
                    return Err(TransformGap {
                        left: Operation::remove(r_start, len),
                        right: Operation::insert(start, text),
                    })
                }
            }
        }
        (
            Operation::Remove { start: a_start, len: a_len, .. },
            Operation::Remove { start: b_start, len: b_len, .. },
        ) => remove_remove(a_start, a_len, b_start, b_len).ok_or_else(|| TransformGap {
            left: Operation::remove(a_start, a_len),
            right: Operation::remove(b_start, b_len),
        })?,
    };

    Ok((left.finalize(), right.finalize()))
}

/// Returns the new starts of two concurrent inserts. The earlier (or, on a
/// tie, the left) insert keeps its position.
fn insert_insert(a: usize, a_len: usize, b: usize, b_len: usize) -> (usize, usize) {
    if a <= b {
        (a, b + a_len)
    } else {
        (a + b_len, b)
    }
}

/// Resolve an insert at `at` (of `insert_len` chars) against a concurrent
/// removal of `[start, start + len)`.
///
/// Returns the insert's new position (to apply after the removal) and the
/// removal rewritten to apply after the insert. The order of the pair does
/// not matter for this combination, so both directions share it.
fn insert_remove(
    at: usize,
    insert_len: usize,
    start: usize,
    len: usize,
) -> Option<(usize, Operation)> {
    let end = start + len;
    if at <= start {
        // insertion wholly before the removal
        Some((at, Operation::remove(start + insert_len, len)))
    } else if end <= at {
        // insertion wholly after the removal
        Some((at - len, Operation::remove(start, len)))
    } else if start < at && at < end {
        // insertion strictly inside: remove around the inserted text
        let head = at - start;
        let tail = end - at;
        let split = Operation::multi(vec![
            Operation::remove(start, head),
            Operation::remove(start + insert_len, tail),
        ]);
        Some((start, split))
    } else {
        None
    }
}

/// Resolve two concurrent removals of `[a, a + a_len)` and `[b, b + b_len)`.
/// Overlapping characters are removed exactly once.
fn remove_remove(
    a: usize,
    a_len: usize,
    b: usize,
    b_len: usize,
) -> Option<(Operation, Operation)> {
    let a_end = a + a_len;
    let b_end = b + b_len;

    let pair = if a_end <= b {
        (Operation::remove(a, a_len), Operation::remove(b - a_len, b_len))
    } else if b_end <= a {
        (Operation::remove(a - b_len, a_len), Operation::remove(b, b_len))
    } else if a <= b && a_end <= b_end {
        // a overlaps the left part of b
        let overlap = a_end - b;
        (
            Operation::remove(a, a_len - overlap),
            Operation::remove(a, b_len - overlap),
        )
    } else if b <= a && b_end <= a_end {
        // b overlaps the left part of a (or shares its start and is shorter)
        let overlap = b_end - a;
        (
            Operation::remove(b, a_len - overlap),
            Operation::remove(b, b_len - overlap),
        )
    } else if a < b && b_end < a_end {
        // a contains b
        (
            Operation::multi(vec![
                Operation::remove(a, b - a),
                Operation::remove(a, a_end - b_end),
            ]),
            Operation::remove(b, 0),
        )
    } else if b < a && a_end < b_end {
        // b contains a
        (
            Operation::remove(a, 0),
            Operation::multi(vec![
                Operation::remove(b, a - b),
                Operation::remove(b, b_end - a_end),
            ]),
        )
    } else {
        return None;
    };
    Some(pair)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(doc: &str, op: &Operation) -> String {
        let mut text = doc.to_string();
        op.apply_to(&mut text);
        text
    }

    /// Both application orders must produce the same text.
    fn assert_converges(doc: &str, a: &Operation, b: &Operation) -> String {
        let (a2, b2) = transform(a, b).unwrap_or_else(|gap| panic!("{gap}"));
        let left = apply(&apply(doc, a), &b2);
        let right = apply(&apply(doc, b), &a2);
        assert_eq!(left, right, "diverged on {doc:?}: a={a:?} b={b:?}");
        left
    }

    fn all_operations(doc_len: usize) -> Vec<Operation> {
        let mut ops = Vec::new();
        for start in 0..=doc_len {
            ops.push(Operation::insert(start, "x"));
            ops.push(Operation::insert(start, "yz"));
            for len in 0..=(doc_len - start) {
                ops.push(Operation::remove(start, len));
            }
        }
        ops
    }

    #[test]
    fn test_convergence_all_pairs() {
        let doc = "ABCDEFG";
        let ops = all_operations(doc.chars().count());
        for a in &ops {
            for b in &ops {
                assert_converges(doc, a, b);
            }
        }
    }

    #[test]
    fn test_scenario_insert_against_later_remove() {
        let doc = "ABCDE";
        let result = assert_converges(doc, &Operation::insert(1, "X"), &Operation::remove(3, 2));
        assert_eq!(result, "AXBC");
    }

    #[test]
    fn test_equal_position_inserts_prefer_left() {
        let a = Operation::insert(2, "11");
        let b = Operation::insert(2, "22");
        assert_eq!(assert_converges("AB", &a, &b), "AB1122");
        assert_eq!(assert_converges("AB", &b, &a), "AB2211");

        let (a2, b2) = transform(&a, &b).unwrap();
        assert_eq!(a2, a);
        assert_eq!(b2, Operation::insert(4, "22"));
    }

    #[test]
    fn test_insert_inside_remove_splits_and_preserves_text() {
        let insert = Operation::insert(2, "X");
        let remove = Operation::remove(1, 3);

        let (ins2, rem2) = transform(&insert, &remove).unwrap();
        assert_eq!(ins2, Operation::insert(1, "X"));
        assert_eq!(
            rem2,
            Operation::multi(vec![Operation::remove(1, 1), Operation::remove(2, 2)])
        );
        assert_eq!(assert_converges("ABCDE", &insert, &remove), "AXE");
        assert_eq!(assert_converges("ABCDE", &remove, &insert), "AXE");
    }

    #[test]
    fn test_remove_containment_splits() {
        let outer = Operation::remove(1, 5);
        let inner = Operation::remove(2, 2);
        let (outer2, inner2) = transform(&outer, &inner).unwrap();
        assert!(matches!(outer2, Operation::Multi { .. }));
        assert_eq!(inner2, Operation::remove(2, 0));
        assert_eq!(assert_converges("ABCDEFG", &outer, &inner), "AG");
    }

    #[test]
    fn test_identical_removes_do_not_double_remove() {
        let op = Operation::remove(1, 2);
        let (a, b) = transform(&op, &op).unwrap();
        assert!(a.is_noop());
        assert!(b.is_noop());
        assert_eq!(assert_converges("ABCD", &op, &op), "AD");
    }

    #[test]
    fn test_multi_threads_through_fold() {
        let doc = "ABCDEFGH";
        let multi = Operation::multi(vec![Operation::remove(1, 1), Operation::insert(3, "zz")]);
        for other in all_operations(doc.chars().count()) {
            assert_converges(doc, &multi, &other);
            assert_converges(doc, &other, &multi);
        }
    }

    #[test]
    fn test_transform_does_not_mutate_inputs() {
        let a = Operation::Insert {
            start: 1,
            text: "ab".into(),
            len: 0,
            end: 0,
        };
        let b = Operation::remove(0, 1);
        let before = a.clone();
        let _ = transform(&a, &b).unwrap();
        assert_eq!(a, before);
    }

    #[test]
    fn test_results_are_finalized() {
        let (a, b) = transform(&Operation::remove(2, 3), &Operation::insert(0, "xy")).unwrap();
        assert_eq!(a, Operation::remove(4, 3));
        assert_eq!(b, Operation::insert(0, "xy"));
    }
}
