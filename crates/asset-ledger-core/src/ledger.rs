//! Boundary with the ledger collaborator.
//!
//! Every operation receives the store as an explicit `&mut dyn Ledger` (or
//! `&dyn Ledger` for reads); there is no ambient handle. Index entries are
//! attribute tuples stored under an index name, and the last attribute of an
//! entry is always the key of the record it points to.

use std::collections::{BTreeMap, BTreeSet};

use crate::index::IndexEntry;
use crate::LedgerError;

/// Separates encoded attributes. Attributes may not contain it.
pub const ATTRIBUTE_SEPARATOR: char = '\u{1f}';

pub trait Ledger {
    /// Reads a primary record.
    ///
    /// # Errors
    /// Returns [`LedgerError::LedgerWriteFailure`] when the store read fails.
    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError>;

    /// Writes a primary record.
    ///
    /// # Errors
    /// Returns [`LedgerError::LedgerWriteFailure`] when the store write fails.
    fn put_state(&mut self, key: &str, value: &[u8]) -> Result<(), LedgerError>;

    /// Adds an index entry. Adding an entry that already exists is a no-op.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidArgument`] for unencodable attributes and
    /// [`LedgerError::LedgerWriteFailure`] when the store write fails.
    fn add_index_entry(&mut self, index: &str, attributes: &[&str]) -> Result<(), LedgerError>;

    /// Removes an index entry. Removing an absent entry is a no-op.
    ///
    /// # Errors
    /// Returns [`LedgerError::LedgerWriteFailure`] when the store write fails.
    fn remove_index_entry(&mut self, index: &str, attributes: &[&str]) -> Result<(), LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::LedgerWriteFailure`] when the store read fails.
    fn index_entry_exists(&self, index: &str, attributes: &[&str]) -> Result<bool, LedgerError>;

    /// Target keys of every entry whose attributes start with `prefix`, in
    /// attribute order.
    ///
    /// # Errors
    /// Returns [`LedgerError::LedgerWriteFailure`] when the store read fails.
    fn query_index(&self, index: &str, prefix: &[&str]) -> Result<Vec<String>, LedgerError>;
}

/// Commit/abort boundary owned by the collaborator: writes issued by `op` are
/// committed when it returns `Ok` and discarded when it returns `Err`.
pub trait Transactional {
    /// # Errors
    /// Returns the error produced by `op`, or [`LedgerError::LedgerWriteFailure`]
    /// when the collaborator cannot open or commit the transaction.
    fn transact<T, F>(&mut self, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut dyn Ledger) -> Result<T, LedgerError>;
}

/// Encodes an attribute tuple so that encoded prefixes match whole attributes.
///
/// # Errors
/// Returns [`LedgerError::InvalidArgument`] when an attribute is empty or
/// contains [`ATTRIBUTE_SEPARATOR`].
pub fn encode_attributes(attributes: &[&str]) -> Result<String, LedgerError> {
    let mut out = String::new();
    for attribute in attributes {
        if attribute.is_empty() {
            return Err(LedgerError::InvalidArgument(
                "index attributes MUST be non-empty".to_string(),
            ));
        }
        if attribute.contains(ATTRIBUTE_SEPARATOR) {
            return Err(LedgerError::InvalidArgument(format!(
                "index attribute {attribute:?} contains a reserved separator"
            )));
        }
        out.push_str(attribute);
        out.push(ATTRIBUTE_SEPARATOR);
    }
    Ok(out)
}

#[must_use]
pub fn decode_attributes(encoded: &str) -> Vec<String> {
    encoded
        .split_terminator(ATTRIBUTE_SEPARATOR)
        .map(str::to_string)
        .collect()
}

/// Target key of an encoded entry (its last attribute).
#[must_use]
pub fn target_key(encoded: &str) -> Option<&str> {
    encoded.split_terminator(ATTRIBUTE_SEPARATOR).next_back()
}

/// In-memory ledger used by tests and embedders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLedger {
    state: BTreeMap<String, Vec<u8>>,
    index: BTreeMap<String, BTreeSet<String>>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.state
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_slice()))
    }

    #[must_use]
    pub fn index_entries(&self) -> BTreeSet<IndexEntry> {
        self.index
            .iter()
            .flat_map(|(name, entries)| {
                entries.iter().map(move |encoded| IndexEntry {
                    index: name.clone(),
                    attributes: decode_attributes(encoded),
                })
            })
            .collect()
    }
}

impl Ledger for MemoryLedger {
    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self.state.get(key).cloned())
    }

    fn put_state(&mut self, key: &str, value: &[u8]) -> Result<(), LedgerError> {
        if key.is_empty() {
            return Err(LedgerError::LedgerWriteFailure(
                "cannot put state under an empty key".to_string(),
            ));
        }
        self.state.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn add_index_entry(&mut self, index: &str, attributes: &[&str]) -> Result<(), LedgerError> {
        let encoded = encode_attributes(attributes)?;
        self.index
            .entry(index.to_string())
            .or_default()
            .insert(encoded);
        Ok(())
    }

    fn remove_index_entry(&mut self, index: &str, attributes: &[&str]) -> Result<(), LedgerError> {
        let encoded = encode_attributes(attributes)?;
        if let Some(entries) = self.index.get_mut(index) {
            entries.remove(&encoded);
        }
        Ok(())
    }

    fn index_entry_exists(&self, index: &str, attributes: &[&str]) -> Result<bool, LedgerError> {
        let encoded = encode_attributes(attributes)?;
        Ok(self
            .index
            .get(index)
            .is_some_and(|entries| entries.contains(&encoded)))
    }

    fn query_index(&self, index: &str, prefix: &[&str]) -> Result<Vec<String>, LedgerError> {
        let encoded_prefix = encode_attributes(prefix)?;
        let Some(entries) = self.index.get(index) else {
            return Ok(Vec::new());
        };

        Ok(entries
            .range(encoded_prefix.clone()..)
            .take_while(|encoded| encoded.starts_with(&encoded_prefix))
            .filter_map(|encoded| target_key(encoded).map(str::to_string))
            .collect())
    }
}

impl Transactional for MemoryLedger {
    fn transact<T, F>(&mut self, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut dyn Ledger) -> Result<T, LedgerError>,
    {
        let snapshot = self.clone();
        let result = op(self);
        if result.is_err() {
            *self = snapshot;
        }
        result
    }
}
