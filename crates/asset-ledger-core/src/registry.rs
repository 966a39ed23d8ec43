//! Entity registry: challenges, datasets, data samples and algos.
//!
//! Every operation validates its inputs and performs all of its reads before
//! it issues the first write, so a rejected call never touches the ledger.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::LedgerConfig;
use crate::identity::{parse_hash_list, parse_key_list, validate_hash};
use crate::index::{
    add_index_entry, associate_challenge_dataset, bool_attribute, ALGO_BY_CHALLENGE,
    CHALLENGE_BY_OWNER, DATASET_BY_OWNER, DATA_BY_DATASET, DATA_BY_DATASET_TEST_ONLY,
};
use crate::ledger::Ledger;
use crate::model::{
    Algo, Challenge, ChallengeTestData, Data, Dataset, ElementType, HashDress, MetricsDress,
};
use crate::permission::authorize;
use crate::LedgerError;

pub const REGISTER_CHALLENGE_FIELDS: [&str; 8] = [
    "name",
    "descriptionHash",
    "descriptionStorageAddress",
    "metricsName",
    "metricsHash",
    "metricsStorageAddress",
    "testDataKeys",
    "permissions",
];
pub const REGISTER_DATASET_FIELDS: [&str; 8] = [
    "name",
    "openerHash",
    "openerStorageAddress",
    "type",
    "descriptionHash",
    "descriptionStorageAddress",
    "challengeKeys",
    "permissions",
];
pub const REGISTER_DATA_FIELDS: [&str; 3] = ["hashes", "datasetKey", "testOnly"];
pub const REGISTER_ALGO_FIELDS: [&str; 7] = [
    "name",
    "hash",
    "storageAddress",
    "descriptionHash",
    "descriptionStorageAddress",
    "challengeKey",
    "permissions",
];
pub const UPDATE_DATASET_FIELDS: [&str; 2] = ["datasetKey", "challengeKeys"];

/// Binds positional arguments to a fixed field list.
pub(crate) fn positional<'a, const N: usize>(
    args: &'a [String],
    fields: &[&str; N],
) -> Result<[&'a str; N], LedgerError> {
    let args: &[String; N] = args
        .try_into()
        .map_err(|_| LedgerError::argument_count(fields))?;
    Ok(args.each_ref().map(String::as_str))
}

/// Reads and decodes the record of type `kind` stored at `key`.
pub(crate) fn load<T: DeserializeOwned>(
    ledger: &dyn Ledger,
    key: &str,
    kind: ElementType,
) -> Result<T, LedgerError> {
    let Some(bytes) = ledger.get_state(key)? else {
        return Err(LedgerError::NotFound(format!("no {kind} with key {key}")));
    };
    serde_json::from_slice(&bytes)
        .map_err(|_| LedgerError::NotFound(format!("key {key} does not hold a {kind}")))
}

/// Like [`load`] for keys obtained from an index: a dangling entry means the
/// index and the primary records disagree.
pub(crate) fn load_indexed<T: DeserializeOwned>(
    ledger: &dyn Ledger,
    index: &str,
    key: &str,
    kind: ElementType,
) -> Result<T, LedgerError> {
    match load(ledger, key, kind) {
        Err(LedgerError::NotFound(message)) => {
            tracing::warn!(index, key, "index entry points to a missing record");
            Err(LedgerError::IndexConsistency(format!("index {index} references {key}: {message}")))
        }
        other => other,
    }
}

pub(crate) fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, LedgerError> {
    serde_json::to_vec(record)
        .map_err(|err| LedgerError::LedgerWriteFailure(format!("cannot encode record: {err}")))
}

pub(crate) fn store<T: Serialize>(
    ledger: &mut dyn Ledger,
    key: &str,
    record: &T,
) -> Result<(), LedgerError> {
    let bytes = encode(record)?;
    ledger.put_state(key, &bytes)
}

pub(crate) fn ensure_absent(
    ledger: &dyn Ledger,
    key: &str,
    kind: ElementType,
) -> Result<(), LedgerError> {
    if ledger.get_state(key)?.is_some() {
        return Err(LedgerError::AlreadyExists(format!(
            "{kind} with key {key} is already registered"
        )));
    }
    Ok(())
}

/// Parses a key list that may legitimately be empty.
fn parse_optional_hash_list(
    field: &str,
    raw: &str,
    max_len: usize,
) -> Result<Vec<String>, LedgerError> {
    if parse_key_list(raw).is_empty() {
        return Ok(Vec::new());
    }
    parse_hash_list(field, raw, max_len)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterChallengeInput {
    pub name: String,
    pub description_hash: String,
    pub description_storage_address: String,
    pub metrics_name: String,
    pub metrics_hash: String,
    pub metrics_storage_address: String,
    pub test_data_keys: Vec<String>,
    pub permissions: String,
}

impl RegisterChallengeInput {
    /// # Errors
    /// Returns [`LedgerError::ArgumentCount`] on arity mismatch and
    /// [`LedgerError::InvalidIdentifier`] for malformed hashes.
    pub fn from_args(args: &[String], config: &LedgerConfig) -> Result<Self, LedgerError> {
        let [
            name,
            description_hash,
            description_storage_address,
            metrics_name,
            metrics_hash,
            metrics_storage_address,
            test_data_keys,
            permissions,
        ] = positional(args, &REGISTER_CHALLENGE_FIELDS)?;
        validate_hash("challenge description hash", description_hash)?;
        validate_hash("challenge metrics hash", metrics_hash)?;
        let test_data_keys = parse_hash_list(
            "challenge test data keys",
            test_data_keys,
            config.max_batch_size,
        )?;

        Ok(Self {
            name: name.to_string(),
            description_hash: description_hash.to_string(),
            description_storage_address: description_storage_address.to_string(),
            metrics_name: metrics_name.to_string(),
            metrics_hash: metrics_hash.to_string(),
            metrics_storage_address: metrics_storage_address.to_string(),
            test_data_keys,
            permissions: permissions.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDatasetInput {
    pub name: String,
    pub opener_hash: String,
    pub opener_storage_address: String,
    pub data_type: String,
    pub description_hash: String,
    pub description_storage_address: String,
    pub challenge_keys: Vec<String>,
    pub permissions: String,
}

impl RegisterDatasetInput {
    /// # Errors
    /// Returns [`LedgerError::ArgumentCount`] on arity mismatch and
    /// [`LedgerError::InvalidIdentifier`] for malformed hashes.
    pub fn from_args(args: &[String], config: &LedgerConfig) -> Result<Self, LedgerError> {
        let [
            name,
            opener_hash,
            opener_storage_address,
            data_type,
            description_hash,
            description_storage_address,
            challenge_keys,
            permissions,
        ] = positional(args, &REGISTER_DATASET_FIELDS)?;
        validate_hash("dataset opener hash", opener_hash)?;
        validate_hash("dataset description hash", description_hash)?;
        let challenge_keys = parse_optional_hash_list(
            "dataset challenge keys",
            challenge_keys,
            config.max_batch_size,
        )?;

        Ok(Self {
            name: name.to_string(),
            opener_hash: opener_hash.to_string(),
            opener_storage_address: opener_storage_address.to_string(),
            data_type: data_type.to_string(),
            description_hash: description_hash.to_string(),
            description_storage_address: description_storage_address.to_string(),
            challenge_keys,
            permissions: permissions.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDataInput {
    pub hashes: Vec<String>,
    pub dataset_key: String,
    pub test_only: bool,
}

impl RegisterDataInput {
    /// # Errors
    /// Returns [`LedgerError::ArgumentCount`] on arity mismatch,
    /// [`LedgerError::InvalidIdentifier`] for malformed hashes and
    /// [`LedgerError::InvalidArgument`] for a bad batch or boolean.
    pub fn from_args(args: &[String], config: &LedgerConfig) -> Result<Self, LedgerError> {
        let [hashes, dataset_key, test_only] = positional(args, &REGISTER_DATA_FIELDS)?;
        let hashes = parse_hash_list("data hashes", hashes, config.max_batch_size)?;
        validate_hash("dataset key", dataset_key)?;
        let test_only = match test_only {
            "true" => true,
            "false" => false,
            other => {
                return Err(LedgerError::InvalidArgument(format!(
                    "testOnly MUST be true or false, got {other:?}"
                )))
            }
        };

        Ok(Self {
            hashes,
            dataset_key: dataset_key.to_string(),
            test_only,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterAlgoInput {
    pub name: String,
    pub hash: String,
    pub storage_address: String,
    pub description_hash: String,
    pub description_storage_address: String,
    pub challenge_key: String,
    pub permissions: String,
}

impl RegisterAlgoInput {
    /// # Errors
    /// Returns [`LedgerError::ArgumentCount`] on arity mismatch and
    /// [`LedgerError::InvalidIdentifier`] for malformed hashes.
    pub fn from_args(args: &[String]) -> Result<Self, LedgerError> {
        let [
            name,
            hash,
            storage_address,
            description_hash,
            description_storage_address,
            challenge_key,
            permissions,
        ] = positional(args, &REGISTER_ALGO_FIELDS)?;
        validate_hash("algo hash", hash)?;
        validate_hash("algo description hash", description_hash)?;
        validate_hash("challenge key", challenge_key)?;

        Ok(Self {
            name: name.to_string(),
            hash: hash.to_string(),
            storage_address: storage_address.to_string(),
            description_hash: description_hash.to_string(),
            description_storage_address: description_storage_address.to_string(),
            challenge_key: challenge_key.to_string(),
            permissions: permissions.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDatasetInput {
    pub dataset_key: String,
    pub challenge_keys: Vec<String>,
}

impl UpdateDatasetInput {
    /// # Errors
    /// Returns [`LedgerError::ArgumentCount`] on arity mismatch and
    /// [`LedgerError::InvalidIdentifier`] for malformed hashes.
    pub fn from_args(args: &[String], config: &LedgerConfig) -> Result<Self, LedgerError> {
        let [dataset_key, challenge_keys] = positional(args, &UPDATE_DATASET_FIELDS)?;
        validate_hash("dataset key", dataset_key)?;
        let challenge_keys = parse_hash_list(
            "dataset challenge keys",
            challenge_keys,
            config.max_batch_size,
        )?;

        Ok(Self {
            dataset_key: dataset_key.to_string(),
            challenge_keys,
        })
    }
}

/// Registers a challenge keyed by its description hash.
///
/// Re-registering a byte-identical challenge succeeds without writing.
///
/// # Errors
/// Returns [`LedgerError::AlreadyExists`] when a different record holds the
/// key, [`LedgerError::NotFound`] for unknown test data,
/// [`LedgerError::InconsistentDataset`] when the test data spans datasets and
/// [`LedgerError::InvalidArgument`] when a test sample is not test-only.
pub fn register_challenge(
    ledger: &mut dyn Ledger,
    caller: &str,
    input: RegisterChallengeInput,
) -> Result<String, LedgerError> {
    let dataset_key = resolve_test_dataset(&*ledger, &input.test_data_keys)?;
    let _: Dataset = load(&*ledger, &dataset_key, ElementType::Dataset)?;

    let key = input.description_hash;
    let challenge = Challenge {
        name: input.name,
        description_storage_address: input.description_storage_address,
        metrics: MetricsDress {
            name: input.metrics_name,
            hash: input.metrics_hash,
            storage_address: input.metrics_storage_address,
        },
        owner: caller.to_string(),
        test_data: ChallengeTestData {
            dataset_key: dataset_key.clone(),
            data_keys: input.test_data_keys,
        },
        permissions: input.permissions,
    };
    let bytes = encode(&challenge)?;

    if let Some(existing) = ledger.get_state(&key)? {
        if existing == bytes {
            tracing::debug!(key = %key, "challenge re-registered unchanged");
            return Ok(key);
        }
        return Err(LedgerError::AlreadyExists(format!(
            "challenge with key {key} is already registered"
        )));
    }

    ledger.put_state(&key, &bytes)?;
    add_index_entry(ledger, CHALLENGE_BY_OWNER, &[caller, &key])?;
    associate_challenge_dataset(ledger, &key, &dataset_key)?;

    tracing::debug!(key = %key, owner = %caller, dataset = %dataset_key, "registered challenge");
    Ok(key)
}

/// Resolves the single dataset holding a challenge's test samples.
fn resolve_test_dataset(ledger: &dyn Ledger, data_keys: &[String]) -> Result<String, LedgerError> {
    let mut dataset_key: Option<String> = None;
    for data_key in data_keys {
        let data: Data = load(ledger, data_key, ElementType::Data)?;
        if !data.test_only {
            return Err(LedgerError::InvalidArgument(format!(
                "challenge test data {data_key} is not registered as test-only"
            )));
        }
        match &dataset_key {
            Some(known) if *known != data.dataset_key => {
                return Err(LedgerError::InconsistentDataset(format!(
                    "test data keys belong to datasets {known} and {}",
                    data.dataset_key
                )));
            }
            Some(_) => {}
            None => dataset_key = Some(data.dataset_key),
        }
    }

    dataset_key.ok_or_else(|| {
        LedgerError::InvalidArgument("challenge test data keys MUST not be empty".to_string())
    })
}

/// Registers a dataset keyed by its opener hash.
///
/// # Errors
/// Returns [`LedgerError::AlreadyExists`] when the opener hash is taken and
/// [`LedgerError::NotFound`] when a listed challenge does not exist.
pub fn register_dataset(
    ledger: &mut dyn Ledger,
    caller: &str,
    input: RegisterDatasetInput,
) -> Result<String, LedgerError> {
    let key = input.opener_hash;
    ensure_absent(&*ledger, &key, ElementType::Dataset)?;
    for challenge_key in &input.challenge_keys {
        let _: Challenge = load(&*ledger, challenge_key, ElementType::Challenge)?;
    }

    let dataset = Dataset {
        name: input.name,
        opener: HashDress {
            hash: key.clone(),
            storage_address: input.opener_storage_address,
        },
        data_type: input.data_type,
        description: HashDress {
            hash: input.description_hash,
            storage_address: input.description_storage_address,
        },
        owner: caller.to_string(),
        challenge_keys: input.challenge_keys,
        permissions: input.permissions,
    };

    store(ledger, &key, &dataset)?;
    add_index_entry(ledger, DATASET_BY_OWNER, &[caller, &key])?;
    for challenge_key in &dataset.challenge_keys {
        associate_challenge_dataset(ledger, challenge_key, &key)?;
    }

    tracing::debug!(key = %key, owner = %caller, "registered dataset");
    Ok(key)
}

/// Registers a batch of data samples against one dataset, all or nothing.
///
/// # Errors
/// Returns [`LedgerError::NotFound`] for an unknown dataset,
/// [`LedgerError::Unauthorized`] when the caller does not own it and
/// [`LedgerError::AlreadyExists`] when any sample is already registered.
pub fn register_data(
    ledger: &mut dyn Ledger,
    caller: &str,
    input: RegisterDataInput,
) -> Result<Vec<String>, LedgerError> {
    let dataset: Dataset = load(&*ledger, &input.dataset_key, ElementType::Dataset)?;
    authorize(caller, &dataset.owner)?;
    for hash in &input.hashes {
        ensure_absent(&*ledger, hash, ElementType::Data)?;
    }

    let data = Data {
        dataset_key: input.dataset_key.clone(),
        test_only: input.test_only,
    };
    let test_only = bool_attribute(input.test_only);
    for hash in &input.hashes {
        store(ledger, hash, &data)?;
        add_index_entry(ledger, DATA_BY_DATASET, &[&input.dataset_key, hash])?;
        add_index_entry(
            ledger,
            DATA_BY_DATASET_TEST_ONLY,
            &[&input.dataset_key, test_only, hash],
        )?;
    }

    tracing::debug!(
        dataset = %input.dataset_key,
        count = input.hashes.len(),
        test_only = input.test_only,
        "registered data"
    );
    Ok(input.hashes)
}

/// Registers an algo keyed by its hash.
///
/// # Errors
/// Returns [`LedgerError::AlreadyExists`] when the hash is taken and
/// [`LedgerError::NotFound`] when the challenge does not exist.
pub fn register_algo(
    ledger: &mut dyn Ledger,
    caller: &str,
    input: RegisterAlgoInput,
) -> Result<String, LedgerError> {
    let key = input.hash;
    ensure_absent(&*ledger, &key, ElementType::Algo)?;
    let _: Challenge = load(&*ledger, &input.challenge_key, ElementType::Challenge)?;

    let algo = Algo {
        name: input.name,
        storage_address: input.storage_address,
        description: HashDress {
            hash: input.description_hash,
            storage_address: input.description_storage_address,
        },
        owner: caller.to_string(),
        challenge_key: input.challenge_key,
        permissions: input.permissions,
    };

    store(ledger, &key, &algo)?;
    add_index_entry(ledger, ALGO_BY_CHALLENGE, &[&algo.challenge_key, &key])?;

    tracing::debug!(
        key = %key,
        owner = %caller,
        challenge = %algo.challenge_key,
        "registered algo"
    );
    Ok(key)
}

/// Associates additional challenges with a dataset. Only the dataset owner
/// may do so; already associated challenges are left as they are.
///
/// # Errors
/// Returns [`LedgerError::NotFound`] for an unknown dataset or challenge and
/// [`LedgerError::Unauthorized`] when the caller does not own the dataset.
pub fn update_dataset(
    ledger: &mut dyn Ledger,
    caller: &str,
    input: UpdateDatasetInput,
) -> Result<String, LedgerError> {
    let mut dataset: Dataset = load(&*ledger, &input.dataset_key, ElementType::Dataset)?;
    authorize(caller, &dataset.owner)?;
    for challenge_key in &input.challenge_keys {
        let _: Challenge = load(&*ledger, challenge_key, ElementType::Challenge)?;
    }

    let added: Vec<String> = input
        .challenge_keys
        .into_iter()
        .filter(|key| !dataset.challenge_keys.contains(key))
        .collect();
    if added.is_empty() {
        return Ok(input.dataset_key);
    }

    dataset.challenge_keys.extend(added.iter().cloned());
    store(ledger, &input.dataset_key, &dataset)?;
    for challenge_key in &added {
        associate_challenge_dataset(ledger, challenge_key, &input.dataset_key)?;
    }

    tracing::debug!(key = %input.dataset_key, added = added.len(), "updated dataset challenges");
    Ok(input.dataset_key)
}
