#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use asset_ledger_core::index::{reconstruct_indexes, IndexDiff, IndexEntry};
use asset_ledger_core::ledger::{decode_attributes, encode_attributes, target_key};
use asset_ledger_core::{Ledger, LedgerError, Transactional};
use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS ledger_state (
  key TEXT PRIMARY KEY,
  value BLOB NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_ledger_state_no_delete
BEFORE DELETE ON ledger_state
BEGIN
  SELECT RAISE(FAIL, 'ledger_state records are never deleted');
END;

CREATE TABLE IF NOT EXISTS ledger_index (
  index_name TEXT NOT NULL,
  attributes TEXT NOT NULL,
  target_key TEXT NOT NULL,
  PRIMARY KEY (index_name, attributes)
);

CREATE INDEX IF NOT EXISTS idx_ledger_index_target
  ON ledger_index(target_key);
";

pub struct SqliteLedger {
    conn: Connection,
}

/// Comparison of the stored index table against the entries reconstructed
/// from every primary record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IndexCheck {
    pub healthy: bool,
    pub records: usize,
    pub index_entries: usize,
    pub missing: Vec<IndexEntry>,
    pub orphaned: Vec<IndexEntry>,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger schema")?;

        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| anyhow!(err.to_string()))?;
        let applied = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register ledger schema migration")?;
        if applied > 0 {
            tracing::info!(version = LEDGER_MIGRATION_VERSION, "applied ledger schema migration");
        }

        Ok(())
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Every primary record, ordered by key.
    pub fn records(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM ledger_state ORDER BY key ASC")?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            records.push((row.get(0)?, row.get(1)?));
        }

        Ok(records)
    }

    pub fn index_entries(&self) -> Result<BTreeSet<IndexEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT index_name, attributes FROM ledger_index")?;
        let mut rows = stmt.query([])?;
        let mut entries = BTreeSet::new();

        while let Some(row) = rows.next()? {
            let index: String = row.get(0)?;
            let attributes: String = row.get(1)?;
            entries.insert(IndexEntry {
                index,
                attributes: decode_attributes(&attributes),
            });
        }

        Ok(entries)
    }

    pub fn index_check(&self) -> Result<IndexCheck> {
        let records = self.records()?;
        let expected = reconstruct_indexes(
            records
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_slice())),
        )
        .map_err(|err| anyhow!("failed to reconstruct indexes: {err}"))?;
        let actual = self.index_entries()?;
        let diff = IndexDiff::compare(&expected, &actual);

        if !diff.is_clean() {
            tracing::warn!(
                missing = diff.missing.len(),
                orphaned = diff.orphaned.len(),
                "index table disagrees with primary records"
            );
        }

        Ok(IndexCheck {
            healthy: diff.is_clean(),
            records: records.len(),
            index_entries: actual.len(),
            missing: diff.missing,
            orphaned: diff.orphaned,
        })
    }
}

fn write_failure(context: &str) -> impl Fn(rusqlite::Error) -> LedgerError + '_ {
    move |err| LedgerError::LedgerWriteFailure(format!("{context}: {err}"))
}

/// Ledger operations over any connection, including an open transaction.
struct ConnectionLedger<'a> {
    conn: &'a Connection,
}

impl Ledger for ConnectionLedger<'_> {
    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        self.conn
            .query_row(
                "SELECT value FROM ledger_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(write_failure("failed to read ledger state"))
    }

    fn put_state(&mut self, key: &str, value: &[u8]) -> Result<(), LedgerError> {
        self.conn
            .execute(
                "INSERT INTO ledger_state(key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(write_failure("failed to write ledger state"))?;
        Ok(())
    }

    fn add_index_entry(&mut self, index: &str, attributes: &[&str]) -> Result<(), LedgerError> {
        let encoded = encode_attributes(attributes)?;
        let target = target_key(&encoded).unwrap_or_default();
        self.conn
            .execute(
                "INSERT OR IGNORE INTO ledger_index(index_name, attributes, target_key)
                 VALUES (?1, ?2, ?3)",
                params![index, encoded, target],
            )
            .map_err(write_failure("failed to add index entry"))?;
        Ok(())
    }

    fn remove_index_entry(&mut self, index: &str, attributes: &[&str]) -> Result<(), LedgerError> {
        let encoded = encode_attributes(attributes)?;
        self.conn
            .execute(
                "DELETE FROM ledger_index WHERE index_name = ?1 AND attributes = ?2",
                params![index, encoded],
            )
            .map_err(write_failure("failed to remove index entry"))?;
        Ok(())
    }

    fn index_entry_exists(&self, index: &str, attributes: &[&str]) -> Result<bool, LedgerError> {
        let encoded = encode_attributes(attributes)?;
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM ledger_index WHERE index_name = ?1 AND attributes = ?2",
                params![index, encoded],
                |row| row.get(0),
            )
            .optional()
            .map_err(write_failure("failed to read index entry"))?;
        Ok(found.is_some())
    }

    fn query_index(&self, index: &str, prefix: &[&str]) -> Result<Vec<String>, LedgerError> {
        let encoded = encode_attributes(prefix)?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT target_key FROM ledger_index
                 WHERE index_name = ?1 AND substr(attributes, 1, length(?2)) = ?2
                 ORDER BY attributes ASC",
            )
            .map_err(write_failure("failed to prepare index query"))?;
        let rows = stmt
            .query_map(params![index, encoded], |row| row.get(0))
            .map_err(write_failure("failed to query index"))?;

        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(write_failure("failed to read index rows"))
    }
}

impl Ledger for SqliteLedger {
    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        ConnectionLedger { conn: &self.conn }.get_state(key)
    }

    fn put_state(&mut self, key: &str, value: &[u8]) -> Result<(), LedgerError> {
        ConnectionLedger { conn: &self.conn }.put_state(key, value)
    }

    fn add_index_entry(&mut self, index: &str, attributes: &[&str]) -> Result<(), LedgerError> {
        ConnectionLedger { conn: &self.conn }.add_index_entry(index, attributes)
    }

    fn remove_index_entry(&mut self, index: &str, attributes: &[&str]) -> Result<(), LedgerError> {
        ConnectionLedger { conn: &self.conn }.remove_index_entry(index, attributes)
    }

    fn index_entry_exists(&self, index: &str, attributes: &[&str]) -> Result<bool, LedgerError> {
        ConnectionLedger { conn: &self.conn }.index_entry_exists(index, attributes)
    }

    fn query_index(&self, index: &str, prefix: &[&str]) -> Result<Vec<String>, LedgerError> {
        ConnectionLedger { conn: &self.conn }.query_index(index, prefix)
    }
}

impl Transactional for SqliteLedger {
    fn transact<T, F>(&mut self, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut dyn Ledger) -> Result<T, LedgerError>,
    {
        let tx = self
            .conn
            .transaction()
            .map_err(write_failure("failed to start ledger transaction"))?;

        let result = op(&mut ConnectionLedger { conn: &tx });
        match result {
            Ok(value) => {
                tx.commit()
                    .map_err(write_failure("failed to commit ledger transaction"))?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback()
                    .map_err(write_failure("failed to roll back ledger transaction"))?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asset_ledger_core::index::worker_index;
    use asset_ledger_core::{invoke_atomic, LedgerConfig, MemoryLedger, Role, Status};
    use proptest::prelude::*;
    use serde_json::Value;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_ledger<T>(result: Result<T, LedgerError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("ledger failure: {err}"),
        }
    }

    fn fixture_ledger() -> SqliteLedger {
        let ledger = must(SqliteLedger::open(Path::new(":memory:")));
        must(ledger.migrate());
        ledger
    }

    fn hash(seed: char) -> String {
        seed.to_string().repeat(64)
    }

    fn call(
        ledger: &mut SqliteLedger,
        caller: &str,
        function: &str,
        args: &[&str],
    ) -> Result<Vec<u8>, LedgerError> {
        let args: Vec<String> = args.iter().map(|arg| (*arg).to_string()).collect();
        invoke_atomic(ledger, &LedgerConfig::v1(), caller, function, &args)
    }

    fn call_ok(ledger: &mut SqliteLedger, caller: &str, function: &str, args: &[&str]) -> String {
        let payload = must_ledger(call(ledger, caller, function, args));
        String::from_utf8_lossy(&payload).into_owned()
    }

    fn register_dataset(
        ledger: &mut SqliteLedger,
        owner: &str,
        opener: &str,
    ) -> Result<Vec<u8>, LedgerError> {
        call(
            ledger,
            owner,
            "registerDataset",
            &[
                "slides",
                opener,
                "https://storage/opener",
                "images",
                &hash('d'),
                "https://storage/description",
                "",
                "all",
            ],
        )
    }

    #[test]
    fn migrate_is_idempotent() {
        let ledger = fixture_ledger();
        must(ledger.migrate());

        let count: i64 = must(
            ledger
                .connection()
                .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| {
                    row.get(0)
                })
                .map_err(anyhow::Error::from),
        );
        assert_eq!(count, 1);
    }

    #[test]
    fn state_round_trips_and_overwrites() {
        let mut ledger = fixture_ledger();
        must_ledger(ledger.put_state("k", b"one"));
        must_ledger(ledger.put_state("k", b"two"));

        assert_eq!(must_ledger(ledger.get_state("k")), Some(b"two".to_vec()));
        assert_eq!(must_ledger(ledger.get_state("missing")), None);
    }

    #[test]
    fn records_cannot_be_deleted() {
        let mut ledger = fixture_ledger();
        must_ledger(ledger.put_state("k", b"one"));

        let result = ledger
            .connection()
            .execute("DELETE FROM ledger_state WHERE key = 'k'", []);
        assert!(result.is_err());
    }

    #[test]
    fn prefix_query_matches_whole_attributes() {
        let mut ledger = fixture_ledger();
        must_ledger(ledger.add_index_entry("idx", &["org", "todo", "k1"]));
        must_ledger(ledger.add_index_entry("idx", &["org", "todo", "k1"]));
        must_ledger(ledger.add_index_entry("idx", &["org2", "todo", "k2"]));
        must_ledger(ledger.add_index_entry("idx", &["org", "done", "k3"]));

        let by_owner = must_ledger(ledger.query_index("idx", &["org"]));
        assert_eq!(by_owner, vec!["k3", "k1"]);
        let by_status = must_ledger(ledger.query_index("idx", &["org", "todo"]));
        assert_eq!(by_status, vec!["k1"]);
        assert_eq!(must_ledger(ledger.query_index("idx", &[])).len(), 3);

        must_ledger(ledger.remove_index_entry("idx", &["org", "todo", "k1"]));
        assert!(!must_ledger(ledger.index_entry_exists("idx", &["org", "todo", "k1"])));
    }

    #[test]
    fn failed_transaction_is_rolled_back() {
        let mut ledger = fixture_ledger();
        let result: Result<(), LedgerError> = ledger.transact(|tx| {
            tx.put_state("k", b"v")?;
            tx.add_index_entry("idx", &["a", "k"])?;
            Err(LedgerError::NotFound("abort".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(must_ledger(ledger.get_state("k")), None);
        assert!(must(ledger.index_entries()).is_empty());
    }

    #[test]
    fn registration_flow_keeps_index_table_consistent() {
        let mut ledger = fixture_ledger();
        let opener = hash('a');
        let key = must_ledger(register_dataset(&mut ledger, "org-a", &opener));
        assert_eq!(key, opener.as_bytes());
        assert!(matches!(
            register_dataset(&mut ledger, "org-b", &opener),
            Err(LedgerError::AlreadyExists(_))
        ));

        let hashes = format!("{},{}", hash('1'), hash('2'));
        call_ok(
            &mut ledger,
            "org-a",
            "registerData",
            &[&hashes, &opener, "false"],
        );
        call_ok(
            &mut ledger,
            "org-a",
            "registerData",
            &[&hash('3'), &opener, "true"],
        );

        let payload = must_ledger(call(&mut ledger, "org-a", "queryDatasetData", &[&opener]));
        let view: Value = match serde_json::from_slice(&payload) {
            Ok(value) => value,
            Err(err) => panic!("invalid payload: {err}"),
        };
        let train_keys = serde_json::json!([hash('1'), hash('2')]);
        assert_eq!(view["trainDataKeys"], train_keys);
        assert_eq!(view["testDataKeys"], serde_json::json!([hash('3')]));

        let check = must(ledger.index_check());
        assert!(check.healthy, "{check:?}");
        assert_eq!(check.records, 4);
    }

    #[test]
    fn index_check_reports_tampering() {
        let mut ledger = fixture_ledger();
        let opener = hash('a');
        must_ledger(register_dataset(&mut ledger, "org-a", &opener));

        must(
            ledger
                .connection()
                .execute(
                    "DELETE FROM ledger_index WHERE index_name = 'dataset~owner~key'",
                    [],
                )
                .map_err(anyhow::Error::from),
        );
        let stray = hash('b');
        must_ledger(ledger.add_index_entry("dataset~owner~key", &["org-z", &stray]));

        let check = must(ledger.index_check());
        assert!(!check.healthy);
        assert_eq!(
            check.missing,
            vec![IndexEntry::new("dataset~owner~key", &["org-a", &opener])]
        );
        assert_eq!(
            check.orphaned,
            vec![IndexEntry::new("dataset~owner~key", &["org-z", &stray])]
        );
    }

    #[test]
    fn missing_worker_entry_aborts_the_transition() {
        let mut ledger = fixture_ledger();
        let opener = hash('a');
        let sample = hash('1');
        must_ledger(register_dataset(&mut ledger, "org-a", &opener));
        call_ok(
            &mut ledger,
            "org-a",
            "registerData",
            &[&sample, &opener, "false"],
        );
        let test_dataset = hash('b');
        must_ledger(register_dataset(&mut ledger, "org-t", &test_dataset));
        call_ok(
            &mut ledger,
            "org-t",
            "registerData",
            &[&hash('2'), &test_dataset, "true"],
        );
        let challenge = call_ok(
            &mut ledger,
            "org-c",
            "registerChallenge",
            &[
                "skin lesions",
                &hash('c'),
                "https://storage/challenge",
                "recall",
                &hash('e'),
                "https://storage/metrics",
                &hash('2'),
                "all",
            ],
        );
        let algo = call_ok(
            &mut ledger,
            "org-b",
            "registerAlgo",
            &[
                "logistic regression",
                &hash('f'),
                "https://storage/algo",
                &hash('9'),
                "https://storage/algo-description",
                &challenge,
                "all",
            ],
        );
        let traintuple = call_ok(
            &mut ledger,
            "org-b",
            "createTraintuple",
            &[&challenge, &algo, &algo, &sample],
        );

        let index = worker_index(Role::Train);
        let attributes = ["org-a", Status::Todo.as_str(), traintuple.as_str()];
        must_ledger(ledger.remove_index_entry(index, &attributes));
        let record = must_ledger(ledger.get_state(&traintuple));
        let entries = must(ledger.index_entries());

        let err = call(
            &mut ledger,
            "org-a",
            "logStartTrainTest",
            &[&traintuple, "training"],
        );
        assert!(matches!(err, Err(LedgerError::IndexConsistency(_))));
        assert_eq!(must_ledger(ledger.get_state(&traintuple)), record);
        assert_eq!(must(ledger.index_entries()), entries);
        let check = must(ledger.index_check());
        assert_eq!(check.missing, vec![IndexEntry::new(index, &attributes)]);
    }

    proptest! {
        #[test]
        fn prop_prefix_queries_match_memory_ledger(
            entries in prop::collection::vec(
                (prop::sample::select(vec!["org", "org2", "o"]),
                 prop::sample::select(vec!["todo", "training", "done"]),
                 "[a-f0-9]{4}"),
                0..20,
            ),
            worker in prop::sample::select(vec!["org", "org2", "o"]),
            status in prop::sample::select(vec!["todo", "training", "done"]),
        ) {
            let mut sqlite = fixture_ledger();
            let mut memory = MemoryLedger::new();
            for (owner, state, key) in &entries {
                must_ledger(sqlite.add_index_entry("idx", &[owner, state, key]));
                must_ledger(memory.add_index_entry("idx", &[owner, state, key]));
            }

            prop_assert_eq!(
                must_ledger(sqlite.query_index("idx", &[worker])),
                must_ledger(memory.query_index("idx", &[worker]))
            );
            prop_assert_eq!(
                must_ledger(sqlite.query_index("idx", &[worker, status])),
                must_ledger(memory.query_index("idx", &[worker, status]))
            );
        }
    }
}
