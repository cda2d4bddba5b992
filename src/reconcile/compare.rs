//! Sorted merge-diff of directory records against the cached snapshot.
//!
//! Both inputs must be strictly ascending by email (byte order, no
//! duplicates). The pass is a classic merge-join: on each step the smaller
//! head is consumed, so the output sequences follow input order and the whole
//! comparison is O(n + m).

use crate::error::{SyncError, SyncResult};
use crate::models::{DiffResult, UserRecord};
use std::cmp::Ordering;

/// Classify `current` (directory) against `cached` into add/update/remove sets.
///
/// Returns [`SyncError::UnsortedInput`] instead of a silently wrong split when
/// either list breaks the ordering contract.
pub fn diff(current: &[UserRecord], cached: &[UserRecord]) -> SyncResult<DiffResult> {
    ensure_sorted("directory", current)?;
    ensure_sorted("cached", cached)?;

    let mut result = DiffResult::default();
    let mut left = current.iter().peekable();
    let mut right = cached.iter().peekable();

    loop {
        match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => match l.email.cmp(&r.email) {
                Ordering::Equal => {
                    if l.attributes_differ(r) {
                        result.to_update.push((*l).clone());
                    }
                    left.next();
                    right.next();
                }
                Ordering::Less => {
                    result.to_add.push((*l).clone());
                    left.next();
                }
                Ordering::Greater => {
                    result.to_remove.push((*r).clone());
                    right.next();
                }
            },
            (Some(l), None) => {
                result.to_add.push((*l).clone());
                left.next();
            }
            (None, Some(r)) => {
                result.to_remove.push((*r).clone());
                right.next();
            }
            (None, None) => break,
        }
    }

    Ok(result)
}

fn ensure_sorted(list: &'static str, records: &[UserRecord]) -> SyncResult<()> {
    for (position, pair) in records.windows(2).enumerate() {
        if pair[0].email >= pair[1].email {
            return Err(SyncError::UnsortedInput {
                list,
                position: position + 1,
                previous: pair[0].email.clone(),
                current: pair[1].email.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(email: &str) -> UserRecord {
        UserRecord::new(format!("id-{email}"), email)
    }

    fn emails(records: &[UserRecord]) -> Vec<&str> {
        records.iter().map(|r| r.email.as_str()).collect()
    }

    #[test]
    fn test_new_directory_entry_is_added() {
        let current = vec![user("a@x.gov").with_status("FED")];
        let result = diff(&current, &[]).unwrap();

        assert_eq!(result.to_add, current);
        assert!(result.to_update.is_empty());
        assert!(result.to_remove.is_empty());
    }

    #[test]
    fn test_missing_directory_entry_is_removed() {
        let cached = vec![user("b@x.gov")];
        let result = diff(&[], &cached).unwrap();

        assert!(result.to_add.is_empty());
        assert!(result.to_update.is_empty());
        assert_eq!(result.to_remove, cached);
    }

    #[test]
    fn test_changed_attribute_is_updated_with_directory_value() {
        let current = vec![user("c@x.gov").with_division("IT")];
        let cached = vec![user("c@x.gov").with_division("HR")];
        let result = diff(&current, &cached).unwrap();

        assert!(result.to_add.is_empty());
        assert!(result.to_remove.is_empty());
        assert_eq!(result.to_update.len(), 1);
        assert_eq!(result.to_update[0].division.as_deref(), Some("IT"));
    }

    #[test]
    fn test_identical_inputs_produce_empty_diff() {
        let records = vec![
            user("a@x.gov").with_status("FED"),
            user("b@x.gov").with_building("BG 31"),
            user("c@x.gov"),
        ];
        let result = diff(&records, &records).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_interleaved_lists_partition_by_email() {
        let current = vec![
            user("a@x.gov"),
            user("c@x.gov").with_status("CONTRACTOR"),
            user("d@x.gov"),
            user("f@x.gov"),
        ];
        let cached = vec![
            user("b@x.gov"),
            user("c@x.gov").with_status("FED"),
            user("d@x.gov"),
            user("e@x.gov"),
        ];

        let result = diff(&current, &cached).unwrap();
        assert_eq!(emails(&result.to_add), vec!["a@x.gov", "f@x.gov"]);
        assert_eq!(emails(&result.to_update), vec!["c@x.gov"]);
        assert_eq!(emails(&result.to_remove), vec!["b@x.gov", "e@x.gov"]);
    }

    #[test]
    fn test_diff_is_deterministic() {
        let current = vec![user("a@x.gov"), user("m@x.gov").with_division("IT")];
        let cached = vec![user("m@x.gov").with_division("HR"), user("z@x.gov")];

        let first = diff(&current, &cached).unwrap();
        let second = diff(&current, &cached).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_comparison_is_case_sensitive() {
        let current = vec![user("A@x.gov")];
        let cached = vec![user("a@x.gov")];
        let result = diff(&current, &cached).unwrap();

        assert_eq!(emails(&result.to_add), vec!["A@x.gov"]);
        assert_eq!(emails(&result.to_remove), vec!["a@x.gov"]);
    }

    #[test]
    fn test_unsorted_input_is_rejected() {
        let current = vec![user("b@x.gov"), user("a@x.gov")];
        let err = diff(&current, &[]).unwrap_err();

        match err {
            SyncError::UnsortedInput { list, position, .. } => {
                assert_eq!(list, "directory");
                assert_eq!(position, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_email_is_rejected() {
        let cached = vec![user("a@x.gov"), user("a@x.gov")];
        assert!(matches!(
            diff(&[], &cached),
            Err(SyncError::UnsortedInput { list: "cached", .. })
        ));
    }
}
