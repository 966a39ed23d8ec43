//! Secondary index manager.
//!
//! Index entries are never the source of truth: [`expected_index_entries`]
//! derives the full set implied by a primary record, and
//! [`reconstruct_indexes`] rebuilds the whole index space from a record scan.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ledger::Ledger;
use crate::model::{LedgerRecord, Role, Status};
use crate::LedgerError;

pub const CHALLENGE_BY_OWNER: &str = "challenge~owner~key";
pub const DATASET_BY_OWNER: &str = "dataset~owner~key";
pub const DATASET_BY_CHALLENGE: &str = "dataset~challenge~key";
pub const CHALLENGE_BY_DATASET: &str = "challenge~dataset~key";
pub const ALGO_BY_CHALLENGE: &str = "algo~challenge~key";
pub const TRAINTUPLE_BY_ALGO: &str = "traintuple~algo~key";
pub const TRAINTUPLE_BY_TRAIN_WORKER: &str = "traintuple~trainWorker~status~key";
pub const TRAINTUPLE_BY_TEST_WORKER: &str = "traintuple~testWorker~status~key";
pub const TRAINTUPLE_BY_END_MODEL: &str = "traintuple~endModel~key";
pub const DATA_BY_DATASET: &str = "data~dataset~key";
pub const DATA_BY_DATASET_TEST_ONLY: &str = "data~dataset~testOnly~key";

#[must_use]
pub fn worker_index(role: Role) -> &'static str {
    match role {
        Role::Train => TRAINTUPLE_BY_TRAIN_WORKER,
        Role::Test => TRAINTUPLE_BY_TEST_WORKER,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IndexEntry {
    pub index: String,
    pub attributes: Vec<String>,
}

impl IndexEntry {
    #[must_use]
    pub fn new(index: &str, attributes: &[&str]) -> Self {
        Self {
            index: index.to_string(),
            attributes: attributes.iter().map(|item| (*item).to_string()).collect(),
        }
    }
}

/// # Errors
/// Propagates ledger failures.
pub fn add_index_entry(
    ledger: &mut dyn Ledger,
    index: &str,
    attributes: &[&str],
) -> Result<(), LedgerError> {
    tracing::trace!(index, ?attributes, "add index entry");
    ledger.add_index_entry(index, attributes)
}

/// # Errors
/// Propagates ledger failures.
pub fn remove_index_entry(
    ledger: &mut dyn Ledger,
    index: &str,
    attributes: &[&str],
) -> Result<(), LedgerError> {
    tracing::trace!(index, ?attributes, "remove index entry");
    ledger.remove_index_entry(index, attributes)
}

/// Replaces the entry at `old` with one at `new`.
///
/// # Errors
/// Returns [`LedgerError::IndexConsistency`] when `old` does not exist: the
/// enclosing operation must abort instead of leaving two live entries for one
/// logical edge.
pub fn move_index_entry(
    ledger: &mut dyn Ledger,
    index: &str,
    old: &[&str],
    new: &[&str],
) -> Result<(), LedgerError> {
    if !ledger.index_entry_exists(index, old)? {
        tracing::warn!(index, ?old, ?new, "index entry missing on move");
        return Err(LedgerError::IndexConsistency(format!(
            "index {index} has no entry ({}) to move",
            old.join(", ")
        )));
    }
    remove_index_entry(ledger, index, old)?;
    add_index_entry(ledger, index, new)
}

/// Publishes the challenge/dataset association in both directions.
///
/// # Errors
/// Propagates ledger failures.
pub fn associate_challenge_dataset(
    ledger: &mut dyn Ledger,
    challenge_key: &str,
    dataset_key: &str,
) -> Result<(), LedgerError> {
    add_index_entry(ledger, DATASET_BY_CHALLENGE, &[challenge_key, dataset_key])?;
    add_index_entry(ledger, CHALLENGE_BY_DATASET, &[dataset_key, challenge_key])
}

/// Moves both worker/status entries of a traintuple from `from` to `to`.
///
/// # Errors
/// Returns [`LedgerError::IndexConsistency`] when either role's entry is missing.
pub fn move_worker_status(
    ledger: &mut dyn Ledger,
    traintuple_key: &str,
    workers: [(Role, &str); 2],
    from: Status,
    to: Status,
) -> Result<(), LedgerError> {
    for (role, worker) in workers {
        move_index_entry(
            ledger,
            worker_index(role),
            &[worker, from.as_str(), traintuple_key],
            &[worker, to.as_str(), traintuple_key],
        )?;
    }
    Ok(())
}

/// Every index entry the primary record at `key` implies.
#[must_use]
pub fn expected_index_entries(key: &str, record: &LedgerRecord) -> Vec<IndexEntry> {
    match record {
        LedgerRecord::Challenge(challenge) => {
            let dataset_key = challenge.test_data.dataset_key.as_str();
            vec![
                IndexEntry::new(CHALLENGE_BY_OWNER, &[&challenge.owner, key]),
                IndexEntry::new(DATASET_BY_CHALLENGE, &[key, dataset_key]),
                IndexEntry::new(CHALLENGE_BY_DATASET, &[dataset_key, key]),
            ]
        }
        LedgerRecord::Dataset(dataset) => {
            let mut entries = vec![IndexEntry::new(DATASET_BY_OWNER, &[&dataset.owner, key])];
            for challenge_key in &dataset.challenge_keys {
                entries.push(IndexEntry::new(DATASET_BY_CHALLENGE, &[challenge_key, key]));
                entries.push(IndexEntry::new(CHALLENGE_BY_DATASET, &[key, challenge_key]));
            }
            entries
        }
        LedgerRecord::Data(data) => vec![
            IndexEntry::new(DATA_BY_DATASET, &[&data.dataset_key, key]),
            IndexEntry::new(
                DATA_BY_DATASET_TEST_ONLY,
                &[&data.dataset_key, bool_attribute(data.test_only), key],
            ),
        ],
        LedgerRecord::Algo(algo) => {
            vec![IndexEntry::new(ALGO_BY_CHALLENGE, &[&algo.challenge_key, key])]
        }
        LedgerRecord::Traintuple(traintuple) => {
            let status = traintuple.status.as_str();
            let mut entries = vec![
                IndexEntry::new(TRAINTUPLE_BY_ALGO, &[&traintuple.algo.hash, key]),
                IndexEntry::new(
                    TRAINTUPLE_BY_TRAIN_WORKER,
                    &[&traintuple.train_data.worker, status, key],
                ),
                IndexEntry::new(
                    TRAINTUPLE_BY_TEST_WORKER,
                    &[&traintuple.test_data.worker, status, key],
                ),
            ];
            if let Some(end_model) = &traintuple.end_model {
                entries.push(IndexEntry::new(TRAINTUPLE_BY_END_MODEL, &[&end_model.hash, key]));
            }
            entries
        }
    }
}

/// Rebuilds the index space implied by a scan of primary records.
///
/// # Errors
/// Returns [`LedgerError::IndexConsistency`] when a stored record matches no
/// known entity shape.
pub fn reconstruct_indexes<'a, I>(records: I) -> Result<BTreeSet<IndexEntry>, LedgerError>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut entries = BTreeSet::new();
    for (key, bytes) in records {
        let record: LedgerRecord = serde_json::from_slice(bytes).map_err(|err| {
            LedgerError::IndexConsistency(format!(
                "record {key} matches no known entity shape: {err}"
            ))
        })?;
        entries.extend(expected_index_entries(key, &record));
    }
    Ok(entries)
}

/// Difference between the expected and the stored index space.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexDiff {
    pub missing: Vec<IndexEntry>,
    pub orphaned: Vec<IndexEntry>,
}

impl IndexDiff {
    #[must_use]
    pub fn compare(expected: &BTreeSet<IndexEntry>, actual: &BTreeSet<IndexEntry>) -> Self {
        Self {
            missing: expected.difference(actual).cloned().collect(),
            orphaned: actual.difference(expected).cloned().collect(),
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.orphaned.is_empty()
    }
}

#[must_use]
pub fn bool_attribute(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::must;
    use crate::ledger::MemoryLedger;
    use crate::model::Data;

    #[test]
    fn move_replaces_entry() {
        let mut ledger = MemoryLedger::new();
        must(add_index_entry(&mut ledger, "idx", &["w", "todo", "k"]));
        must(move_index_entry(
            &mut ledger,
            "idx",
            &["w", "todo", "k"],
            &["w", "training", "k"],
        ));

        assert!(must(ledger.query_index("idx", &["w", "todo"])).is_empty());
        let training = must(ledger.query_index("idx", &["w", "training"]));
        assert_eq!(training, vec!["k"]);
    }

    #[test]
    fn move_without_old_entry_fails_and_adds_nothing() {
        let mut ledger = MemoryLedger::new();
        let err = move_index_entry(
            &mut ledger,
            "idx",
            &["w", "todo", "k"],
            &["w", "training", "k"],
        );

        assert!(matches!(err, Err(LedgerError::IndexConsistency(_))));
        assert!(must(ledger.query_index("idx", &[])).is_empty());
    }

    #[test]
    fn data_record_implies_both_dataset_entries() {
        let record = LedgerRecord::Data(Data {
            dataset_key: "ds".to_string(),
            test_only: true,
        });
        let entries = expected_index_entries("d1", &record);

        assert_eq!(
            entries,
            vec![
                IndexEntry::new(DATA_BY_DATASET, &["ds", "d1"]),
                IndexEntry::new(DATA_BY_DATASET_TEST_ONLY, &["ds", "true", "d1"]),
            ]
        );
    }

    #[test]
    fn unknown_record_shape_is_reported() {
        let records = [("k", br#"{"unexpected":1}"#.as_slice())];
        let err = reconstruct_indexes(records);
        assert!(matches!(
            err,
            Err(LedgerError::IndexConsistency(message)) if message.contains("record k")
        ));
    }

    #[test]
    fn diff_reports_missing_and_orphaned_entries() {
        let expected: BTreeSet<IndexEntry> =
            [IndexEntry::new("a", &["1"]), IndexEntry::new("b", &["2"])].into();
        let actual: BTreeSet<IndexEntry> =
            [IndexEntry::new("b", &["2"]), IndexEntry::new("c", &["3"])].into();

        let diff = IndexDiff::compare(&expected, &actual);
        assert_eq!(diff.missing, vec![IndexEntry::new("a", &["1"])]);
        assert_eq!(diff.orphaned, vec![IndexEntry::new("c", &["3"])]);
        assert!(!diff.is_clean());
    }
}
