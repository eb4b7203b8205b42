//! Pure planning helpers shared by reorder, trace-out and operator
//! application. These only compute axis bookkeeping; the numeric work
//! lives in [`crate::state_ops`].

use crate::errors::{StateError, StateResult};

/// Compute the axis permutation carrying `current` into `target`.
///
/// `perm[j]` is the position in `current` of `target[j]`. For a state
/// vector the permutation applies to the member axes (the trailing
/// singleton axis is untouched); for a density matrix the caller applies
/// it to the row block and duplicates it onto the column block.
///
/// Fails if `target` is not exactly `current` in some permutation.
pub fn reorder_permutation<T: PartialEq>(current: &[T], target: &[T]) -> StateResult<Vec<usize>> {
    if current.len() != target.len() {
        return Err(StateError::precondition(format!(
            "reorder requires all {} members, {} were given",
            current.len(),
            target.len()
        )));
    }
    let mut perm = Vec::with_capacity(target.len());
    for t in target {
        let pos = current
            .iter()
            .position(|c| c == t)
            .ok_or_else(|| StateError::precondition("reorder target is not a member"))?;
        if perm.contains(&pos) {
            return Err(StateError::precondition("duplicate member in reorder target"));
        }
        perm.push(pos);
    }
    Ok(perm)
}

/// Split the axes of `current` into the ones retained by `keep` (in the
/// order of `keep`, which is authoritative) and the complement (keeping
/// their current relative order).
///
/// Fails if `keep` contains duplicates or members not in `current`.
pub fn retain_axes<T: PartialEq>(
    current: &[T],
    keep: &[T],
) -> StateResult<(Vec<usize>, Vec<usize>)> {
    let mut kept = Vec::with_capacity(keep.len());
    for k in keep {
        let pos = current
            .iter()
            .position(|c| c == k)
            .ok_or_else(|| StateError::precondition("trace target is not a member"))?;
        if kept.contains(&pos) {
            return Err(StateError::precondition("duplicate member in trace target"));
        }
        kept.push(pos);
    }
    let traced = (0..current.len()).filter(|i| !kept.contains(i)).collect();
    Ok((kept, traced))
}

#[cfg(test)]
mod plan_tests {
    use super::*;

    #[test]
    fn test_reorder_permutation() {
        let perm = reorder_permutation(&['a', 'b', 'c'], &['c', 'a', 'b']).unwrap();
        assert_eq!(perm, vec![2, 0, 1]);
    }

    #[test]
    fn test_reorder_rejects_subset() {
        assert!(reorder_permutation(&['a', 'b', 'c'], &['c', 'a']).is_err());
    }

    #[test]
    fn test_reorder_rejects_duplicates() {
        assert!(reorder_permutation(&['a', 'b'], &['a', 'a']).is_err());
    }

    #[test]
    fn test_reorder_rejects_foreign_member() {
        assert!(reorder_permutation(&['a', 'b'], &['a', 'x']).is_err());
    }

    #[test]
    fn test_retain_axes_orders_by_target() {
        let (kept, traced) = retain_axes(&['a', 'b', 'c', 'd'], &['c', 'a']).unwrap();
        assert_eq!(kept, vec![2, 0]);
        assert_eq!(traced, vec![1, 3]);
    }

    #[test]
    fn test_retain_rejects_foreign_member() {
        assert!(retain_axes(&['a', 'b'], &['x']).is_err());
    }
}
