//! Traintuple creation and lifecycle.
//!
//! ```text
//! todo -> training -> trained -> testing -> done
//!   \________\___________\__________\----> failed
//! ```
//!
//! `todo` and `training` are driven by the training worker, `trained` and
//! `testing` by the testing worker. Every transition moves the
//! `(worker, status)` entry of both role indexes so each role's index always
//! holds exactly one entry per traintuple.

use std::collections::BTreeMap;

use crate::config::LedgerConfig;
use crate::identity::{parse_hash_list, parse_key_list, traintuple_key, validate_hash};
use crate::index::{
    add_index_entry, move_worker_status, worker_index, TRAINTUPLE_BY_ALGO, TRAINTUPLE_BY_END_MODEL,
};
use crate::ledger::Ledger;
use crate::model::{
    Algo, Challenge, Data, Dataset, ElementType, HashDress, Role, Status, Traintuple,
    TraintupleChallenge, TtData,
};
use crate::permission::authorize;
use crate::registry::{ensure_absent, load, load_indexed, positional, store};
use crate::LedgerError;

pub const CREATE_TRAINTUPLE_FIELDS: [&str; 4] = [
    "challengeKey",
    "algoKey",
    "startModelKey",
    "trainDataKeys",
];
pub const LOG_START_TRAIN_TEST_FIELDS: [&str; 2] = ["key", "status"];
pub const LOG_SUCCESS_TRAIN_FIELDS: [&str; 4] = ["key", "endModel", "trainPerf", "log"];
pub const LOG_FAIL_TRAIN_TEST_FIELDS: [&str; 2] = ["key", "log"];
pub const LOG_SUCCESS_TEST_FIELDS: [&str; 4] = ["key", "testPerf", "perf", "log"];

/// Worker role allowed to drive `from -> to`, or `None` when no edge exists.
#[must_use]
pub fn transition_role(from: Status, to: Status) -> Option<Role> {
    match (from, to) {
        (Status::Todo, Status::Training | Status::Failed)
        | (Status::Training, Status::Trained | Status::Failed) => Some(Role::Train),
        (Status::Trained, Status::Testing | Status::Failed)
        | (Status::Testing, Status::Done | Status::Failed) => Some(Role::Test),
        _ => None,
    }
}

/// Checks that `caller` may move `traintuple` to `to`.
///
/// # Errors
/// Returns [`LedgerError::InvalidTransition`] when no edge leads from the
/// current status to `to` and [`LedgerError::Unauthorized`] when `caller` is
/// not the worker of the role driving that edge.
pub fn check_update_traintuple(
    traintuple: &Traintuple,
    caller: &str,
    to: Status,
) -> Result<(), LedgerError> {
    let from = traintuple.status;
    let Some(role) = transition_role(from, to) else {
        return Err(LedgerError::InvalidTransition { from, to });
    };
    authorize(caller, traintuple.worker(role))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTraintupleInput {
    pub challenge_key: String,
    pub algo_key: String,
    pub start_model_key: String,
    pub train_data_keys: Vec<String>,
}

impl CreateTraintupleInput {
    /// # Errors
    /// Returns [`LedgerError::ArgumentCount`] on arity mismatch and
    /// [`LedgerError::InvalidIdentifier`] for malformed keys.
    pub fn from_args(args: &[String], config: &LedgerConfig) -> Result<Self, LedgerError> {
        let [challenge_key, algo_key, start_model_key, train_data_keys] =
            positional(args, &CREATE_TRAINTUPLE_FIELDS)?;
        validate_hash("challenge key", challenge_key)?;
        validate_hash("algo key", algo_key)?;
        validate_hash("start model key", start_model_key)?;
        let train_data_keys =
            parse_hash_list("train data keys", train_data_keys, config.max_batch_size)?;

        Ok(Self {
            challenge_key: challenge_key.to_string(),
            algo_key: algo_key.to_string(),
            start_model_key: start_model_key.to_string(),
            train_data_keys,
        })
    }
}

/// Creates a traintuple in `todo`.
///
/// A start model equal to the algo key starts a fresh lineage tested on the
/// challenge's test data; any other start model must be the end model of an
/// existing traintuple, whose test descriptor is inherited.
///
/// # Errors
/// Returns [`LedgerError::NotFound`] for unknown records,
/// [`LedgerError::InconsistentDataset`] when the training data spans
/// datasets, [`LedgerError::UnknownParentModel`] for an unknown start model
/// and [`LedgerError::AlreadyExists`] when the derived key is taken.
pub fn create_traintuple(
    ledger: &mut dyn Ledger,
    caller: &str,
    input: CreateTraintupleInput,
) -> Result<String, LedgerError> {
    let train_dataset_key = resolve_train_dataset(&*ledger, &input.train_data_keys)?;
    let train_dataset: Dataset = load(&*ledger, &train_dataset_key, ElementType::Dataset)?;

    let algo: Algo = load(&*ledger, &input.algo_key, ElementType::Algo)?;
    if algo.challenge_key != input.challenge_key {
        return Err(LedgerError::InvalidArgument(format!(
            "algo {} targets challenge {}, not {}",
            input.algo_key, algo.challenge_key, input.challenge_key
        )));
    }

    let lineage = if input.start_model_key == input.algo_key {
        fresh_lineage(&*ledger, &input.challenge_key, &input.algo_key, &algo)?
    } else {
        inherited_lineage(&*ledger, &input.challenge_key, &input.start_model_key)?
    };

    let key = traintuple_key(
        &input.challenge_key,
        &input.algo_key,
        &lineage.start_model.hash,
        &input.train_data_keys,
        caller,
    );
    ensure_absent(&*ledger, &key, ElementType::Traintuple)?;

    let traintuple = Traintuple {
        challenge: lineage.challenge,
        algo: HashDress {
            hash: input.algo_key.clone(),
            storage_address: algo.storage_address,
        },
        start_model: lineage.start_model,
        end_model: None,
        train_data: TtData {
            worker: train_dataset.owner,
            keys: input.train_data_keys,
            opener_hash: train_dataset_key,
            perf: BTreeMap::new(),
        },
        test_data: lineage.test_data,
        status: Status::Todo,
        rank: lineage.rank,
        perf: 0.0,
        log: String::new(),
        permissions: "all".to_string(),
        creator: caller.to_string(),
    };

    store(ledger, &key, &traintuple)?;
    add_index_entry(ledger, TRAINTUPLE_BY_ALGO, &[&input.algo_key, &key])?;
    for role in [Role::Train, Role::Test] {
        add_index_entry(
            ledger,
            worker_index(role),
            &[traintuple.worker(role), Status::Todo.as_str(), &key],
        )?;
    }

    tracing::info!(
        key = %key,
        rank = traintuple.rank,
        train_worker = %traintuple.train_data.worker,
        test_worker = %traintuple.test_data.worker,
        "created traintuple"
    );
    Ok(key)
}

/// Fields a new traintuple takes from its challenge or its parent.
struct Lineage {
    challenge: TraintupleChallenge,
    start_model: HashDress,
    test_data: TtData,
    rank: u32,
}

fn fresh_lineage(
    ledger: &dyn Ledger,
    challenge_key: &str,
    algo_key: &str,
    algo: &Algo,
) -> Result<Lineage, LedgerError> {
    let challenge: Challenge = load(ledger, challenge_key, ElementType::Challenge)?;
    let test_dataset_key = challenge.test_data.dataset_key;
    let test_dataset: Dataset = load(ledger, &test_dataset_key, ElementType::Dataset)?;

    Ok(Lineage {
        challenge: TraintupleChallenge {
            key: challenge_key.to_string(),
            metrics: HashDress {
                hash: challenge.metrics.hash,
                storage_address: challenge.metrics.storage_address,
            },
        },
        start_model: HashDress {
            hash: algo_key.to_string(),
            storage_address: algo.storage_address.clone(),
        },
        test_data: TtData {
            worker: test_dataset.owner,
            keys: challenge.test_data.data_keys,
            opener_hash: test_dataset_key,
            perf: BTreeMap::new(),
        },
        rank: 0,
    })
}

fn inherited_lineage(
    ledger: &dyn Ledger,
    challenge_key: &str,
    start_model_key: &str,
) -> Result<Lineage, LedgerError> {
    let parent_key = ledger
        .query_index(TRAINTUPLE_BY_END_MODEL, &[start_model_key])?
        .into_iter()
        .next()
        .ok_or_else(|| {
            LedgerError::UnknownParentModel(format!(
                "no traintuple produced model {start_model_key}"
            ))
        })?;
    let parent: Traintuple = load_indexed(
        ledger,
        TRAINTUPLE_BY_END_MODEL,
        &parent_key,
        ElementType::Traintuple,
    )?;

    if parent.challenge.key != challenge_key {
        return Err(LedgerError::InvalidArgument(format!(
            "model {start_model_key} was trained for challenge {}, not {challenge_key}",
            parent.challenge.key
        )));
    }

    let Some(start_model) = parent.end_model else {
        return Err(LedgerError::IndexConsistency(format!(
            "traintuple {parent_key} is indexed by end model {start_model_key} but has none"
        )));
    };

    Ok(Lineage {
        challenge: parent.challenge,
        start_model,
        test_data: TtData {
            perf: BTreeMap::new(),
            ..parent.test_data
        },
        rank: parent.rank + 1,
    })
}

fn resolve_train_dataset(ledger: &dyn Ledger, data_keys: &[String]) -> Result<String, LedgerError> {
    let mut dataset_key: Option<String> = None;
    for data_key in data_keys {
        let data: Data = load(ledger, data_key, ElementType::Data)?;
        if data.test_only {
            return Err(LedgerError::InvalidArgument(format!(
                "data {data_key} is test-only and cannot be trained on"
            )));
        }
        match &dataset_key {
            Some(known) if *known != data.dataset_key => {
                return Err(LedgerError::InconsistentDataset(format!(
                    "train data keys belong to datasets {known} and {}",
                    data.dataset_key
                )));
            }
            Some(_) => {}
            None => dataset_key = Some(data.dataset_key),
        }
    }

    dataset_key.ok_or_else(|| {
        LedgerError::InvalidArgument("train data keys MUST not be empty".to_string())
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStartTrainTestInput {
    pub key: String,
    pub status: Status,
}

impl LogStartTrainTestInput {
    /// # Errors
    /// Returns [`LedgerError::ArgumentCount`] on arity mismatch and
    /// [`LedgerError::InvalidArgument`] for an unknown status.
    pub fn from_args(args: &[String]) -> Result<Self, LedgerError> {
        let [key, status] = positional(args, &LOG_START_TRAIN_TEST_FIELDS)?;
        let status = Status::parse(status).ok_or_else(|| {
            LedgerError::InvalidArgument(format!("unknown traintuple status {status:?}"))
        })?;

        Ok(Self {
            key: key.to_string(),
            status,
        })
    }
}

/// Moves a traintuple to `training` or `testing`.
///
/// # Errors
/// Returns [`LedgerError::InvalidTransition`] for any other target status or
/// an illegal edge and [`LedgerError::Unauthorized`] for a non-worker caller.
pub fn log_start_train_test(
    ledger: &mut dyn Ledger,
    caller: &str,
    input: LogStartTrainTestInput,
) -> Result<Traintuple, LedgerError> {
    let mut traintuple: Traintuple = load(&*ledger, &input.key, ElementType::Traintuple)?;
    if !matches!(input.status, Status::Training | Status::Testing) {
        return Err(LedgerError::InvalidTransition {
            from: traintuple.status,
            to: input.status,
        });
    }
    check_update_traintuple(&traintuple, caller, input.status)?;

    let from = traintuple.status;
    traintuple.status = input.status;
    commit_transition(ledger, &input.key, &traintuple, from)?;
    Ok(traintuple)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSuccessTrainInput {
    pub key: String,
    pub end_model: HashDress,
    pub train_perf: String,
    pub log: String,
}

impl LogSuccessTrainInput {
    /// # Errors
    /// Returns [`LedgerError::ArgumentCount`] on arity mismatch,
    /// [`LedgerError::InvalidArgument`] when the end model is not a
    /// `hash, storageAddress` pair and [`LedgerError::InvalidIdentifier`] for a
    /// malformed model hash.
    pub fn from_args(args: &[String]) -> Result<Self, LedgerError> {
        let [key, end_model, train_perf, log] = positional(args, &LOG_SUCCESS_TRAIN_FIELDS)?;
        let end_model = match parse_key_list(end_model).as_slice() {
            [hash, storage_address] => {
                validate_hash("end model hash", hash)?;
                HashDress {
                    hash: hash.clone(),
                    storage_address: storage_address.clone(),
                }
            }
            _ => {
                return Err(LedgerError::InvalidArgument(
                    "end model MUST be given as \"hash, storageAddress\"".to_string(),
                ))
            }
        };

        Ok(Self {
            key: key.to_string(),
            end_model,
            train_perf: train_perf.to_string(),
            log: log.to_string(),
        })
    }
}

/// Moves a traintuple from `training` to `trained`, recording its end model
/// and per-sample training performance.
///
/// # Errors
/// Returns [`LedgerError::InvalidTransition`] or [`LedgerError::Unauthorized`]
/// as [`check_update_traintuple`] does, [`LedgerError::AlreadyExists`] when
/// another traintuple already produced the model and
/// [`LedgerError::LogTooLarge`] when the log budget is exceeded.
pub fn log_success_train(
    ledger: &mut dyn Ledger,
    config: &LedgerConfig,
    caller: &str,
    input: LogSuccessTrainInput,
) -> Result<Traintuple, LedgerError> {
    let mut traintuple: Traintuple = load(&*ledger, &input.key, ElementType::Traintuple)?;
    check_update_traintuple(&traintuple, caller, Status::Trained)?;
    let perf = parse_perf("train perf", &input.train_perf, &traintuple.train_data.keys)?;
    append_log(&mut traintuple.log, &input.log, config.max_log_bytes)?;

    if !ledger
        .query_index(TRAINTUPLE_BY_END_MODEL, &[&input.end_model.hash])?
        .is_empty()
    {
        return Err(LedgerError::AlreadyExists(format!(
            "model {} is already the end model of a traintuple",
            input.end_model.hash
        )));
    }

    let from = traintuple.status;
    traintuple.status = Status::Trained;
    traintuple.train_data.perf = perf;
    traintuple.end_model = Some(input.end_model);
    commit_transition(ledger, &input.key, &traintuple, from)?;
    if let Some(end_model) = &traintuple.end_model {
        add_index_entry(
            ledger,
            TRAINTUPLE_BY_END_MODEL,
            &[&end_model.hash, &input.key],
        )?;
    }
    Ok(traintuple)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFailTrainTestInput {
    pub key: String,
    pub log: String,
}

impl LogFailTrainTestInput {
    /// # Errors
    /// Returns [`LedgerError::ArgumentCount`] on arity mismatch.
    pub fn from_args(args: &[String]) -> Result<Self, LedgerError> {
        let [key, log] = positional(args, &LOG_FAIL_TRAIN_TEST_FIELDS)?;
        Ok(Self {
            key: key.to_string(),
            log: log.to_string(),
        })
    }
}

/// Moves a traintuple to `failed`. The worker of the role owning the current
/// status reports the failure.
///
/// # Errors
/// Returns [`LedgerError::InvalidTransition`] from a terminal status,
/// [`LedgerError::Unauthorized`] for a non-worker caller and
/// [`LedgerError::LogTooLarge`] when the log budget is exceeded.
pub fn log_fail_train_test(
    ledger: &mut dyn Ledger,
    config: &LedgerConfig,
    caller: &str,
    input: LogFailTrainTestInput,
) -> Result<Traintuple, LedgerError> {
    let mut traintuple: Traintuple = load(&*ledger, &input.key, ElementType::Traintuple)?;
    check_update_traintuple(&traintuple, caller, Status::Failed)?;
    append_log(&mut traintuple.log, &input.log, config.max_log_bytes)?;

    let from = traintuple.status;
    traintuple.status = Status::Failed;
    commit_transition(ledger, &input.key, &traintuple, from)?;
    Ok(traintuple)
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSuccessTestInput {
    pub key: String,
    pub test_perf: String,
    pub perf: f32,
    pub log: String,
}

impl LogSuccessTestInput {
    /// # Errors
    /// Returns [`LedgerError::ArgumentCount`] on arity mismatch and
    /// [`LedgerError::InvalidArgument`] for a non-finite score.
    pub fn from_args(args: &[String]) -> Result<Self, LedgerError> {
        let [key, test_perf, perf, log] = positional(args, &LOG_SUCCESS_TEST_FIELDS)?;
        Ok(Self {
            key: key.to_string(),
            test_perf: test_perf.to_string(),
            perf: parse_score("perf", perf)?,
            log: log.to_string(),
        })
    }
}

/// Moves a traintuple from `testing` to `done`, recording per-sample test
/// performance and the overall score.
///
/// # Errors
/// Returns [`LedgerError::InvalidTransition`] or [`LedgerError::Unauthorized`]
/// as [`check_update_traintuple`] does and [`LedgerError::LogTooLarge`] when
/// the log budget is exceeded.
pub fn log_success_test(
    ledger: &mut dyn Ledger,
    config: &LedgerConfig,
    caller: &str,
    input: LogSuccessTestInput,
) -> Result<Traintuple, LedgerError> {
    let mut traintuple: Traintuple = load(&*ledger, &input.key, ElementType::Traintuple)?;
    check_update_traintuple(&traintuple, caller, Status::Done)?;
    let perf = parse_perf("test perf", &input.test_perf, &traintuple.test_data.keys)?;
    append_log(&mut traintuple.log, &input.log, config.max_log_bytes)?;

    let from = traintuple.status;
    traintuple.status = Status::Done;
    traintuple.test_data.perf = perf;
    traintuple.perf = input.perf;
    commit_transition(ledger, &input.key, &traintuple, from)?;
    Ok(traintuple)
}

fn commit_transition(
    ledger: &mut dyn Ledger,
    key: &str,
    traintuple: &Traintuple,
    from: Status,
) -> Result<(), LedgerError> {
    store(ledger, key, traintuple)?;
    move_worker_status(
        ledger,
        key,
        [
            (Role::Train, traintuple.train_data.worker.as_str()),
            (Role::Test, traintuple.test_data.worker.as_str()),
        ],
        from,
        traintuple.status,
    )?;

    tracing::info!(key, from = %from, to = %traintuple.status, "traintuple status changed");
    Ok(())
}

fn append_log(log: &mut String, addition: &str, max_log_bytes: usize) -> Result<(), LedgerError> {
    let size = log.len() + addition.len();
    if size > max_log_bytes {
        return Err(LedgerError::LogTooLarge {
            size,
            max: max_log_bytes,
        });
    }
    log.push_str(addition);
    Ok(())
}

fn parse_score(field: &str, raw: &str) -> Result<f32, LedgerError> {
    match raw.trim().parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(LedgerError::InvalidArgument(format!(
            "{field} MUST be a finite number, got {raw:?}"
        ))),
    }
}

/// Parses `dataKey:value` pairs restricted to the descriptor's keys. An empty
/// string records no performance.
fn parse_perf(
    field: &str,
    raw: &str,
    keys: &[String],
) -> Result<BTreeMap<String, f32>, LedgerError> {
    let mut perf = BTreeMap::new();
    let pairs = raw.split(',').map(str::trim);
    for pair in pairs.filter(|pair| !pair.is_empty()) {
        let Some((key, value)) = pair.split_once(':') else {
            return Err(LedgerError::InvalidArgument(format!(
                "{field} entry {pair:?} MUST be dataKey:value"
            )));
        };
        let key = key.trim();
        if !keys.iter().any(|known| known == key) {
            return Err(LedgerError::InvalidArgument(format!(
                "{field} names {key}, which is not part of the traintuple"
            )));
        }
        let value = parse_score(field, value)?;
        if perf.insert(key.to_string(), value).is_some() {
            return Err(LedgerError::InvalidArgument(format!("{field} lists {key} more than once")));
        }
    }
    Ok(perf)
}
