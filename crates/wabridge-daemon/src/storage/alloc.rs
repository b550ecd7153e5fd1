//! Dense identity id allocation.

use wabridge_core::IdentityId;

/// Smallest positive id not present in `sorted_ids`.
///
/// `sorted_ids` must be ascending. Non-positive and repeated entries are
/// skipped, so the result is always `>= 1`:
///
/// - no ids → `1`
/// - first id above `1` → `1`
/// - otherwise the first gap, or `max + 1` when there is none
pub fn smallest_free_id(sorted_ids: &[IdentityId]) -> IdentityId {
    let mut expected: IdentityId = 1;
    for &id in sorted_ids {
        if id < expected {
            continue;
        }
        if id > expected {
            break;
        }
        expected += 1;
    }
    expected
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_catalog_starts_at_one() {
        assert_eq!(smallest_free_id(&[]), 1);
    }

    #[test]
    fn leading_gap_reuses_one() {
        assert_eq!(smallest_free_id(&[2, 3]), 1);
        assert_eq!(smallest_free_id(&[7]), 1);
    }

    #[test]
    fn inner_gap_is_filled_first() {
        assert_eq!(smallest_free_id(&[1, 2, 4, 5]), 3);
        assert_eq!(smallest_free_id(&[1, 3, 4, 6]), 2);
    }

    #[test]
    fn dense_ids_append() {
        assert_eq!(smallest_free_id(&[1, 2, 3]), 4);
    }

    #[test]
    fn duplicates_and_non_positive_are_ignored() {
        assert_eq!(smallest_free_id(&[-3, 0, 1, 1, 2]), 3);
        assert_eq!(smallest_free_id(&[0, 0]), 1);
    }
}
