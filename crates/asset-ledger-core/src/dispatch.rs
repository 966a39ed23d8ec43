//! Entry point for the transport collaborator: a function name, positional
//! string arguments and an authenticated caller identity in, opaque payload
//! bytes out.

use std::fmt::{Display, Formatter};

use serde::Serialize;

use crate::config::LedgerConfig;
use crate::ledger::{Ledger, Transactional, ATTRIBUTE_SEPARATOR};
use crate::model::{Algo, Challenge, Data, Dataset, Role, Status, Traintuple};
use crate::query::{
    query, query_all, query_dataset_data, query_model, query_model_traintuples,
    query_worker_traintuples, Listed, QUERY_DATASET_DATA_FIELDS, QUERY_FIELDS, QUERY_MODEL_FIELDS,
    QUERY_WORKER_TRAINTUPLES_FIELDS,
};
use crate::registry::{
    positional, register_algo, register_challenge, register_data, register_dataset, update_dataset,
    RegisterAlgoInput, RegisterChallengeInput, RegisterDataInput, RegisterDatasetInput,
    UpdateDatasetInput,
};
use crate::traintuple::{
    create_traintuple, log_fail_train_test, log_start_train_test, log_success_test,
    log_success_train, CreateTraintupleInput, LogFailTrainTestInput, LogStartTrainTestInput,
    LogSuccessTestInput, LogSuccessTrainInput,
};
use crate::LedgerError;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Function {
    RegisterChallenge,
    RegisterDataset,
    RegisterData,
    RegisterAlgo,
    UpdateDataset,
    CreateTraintuple,
    LogStartTrainTest,
    LogSuccessTrain,
    LogFailTrainTest,
    LogSuccessTest,
    Query,
    QueryChallenges,
    QueryDatasets,
    QueryData,
    QueryAlgos,
    QueryTraintuples,
    QueryDatasetData,
    QueryModel,
    QueryModelTraintuples,
    QueryWorkerTraintuples,
}

impl Function {
    pub const ALL: [Self; 20] = [
        Self::RegisterChallenge,
        Self::RegisterDataset,
        Self::RegisterData,
        Self::RegisterAlgo,
        Self::UpdateDataset,
        Self::CreateTraintuple,
        Self::LogStartTrainTest,
        Self::LogSuccessTrain,
        Self::LogFailTrainTest,
        Self::LogSuccessTest,
        Self::Query,
        Self::QueryChallenges,
        Self::QueryDatasets,
        Self::QueryData,
        Self::QueryAlgos,
        Self::QueryTraintuples,
        Self::QueryDatasetData,
        Self::QueryModel,
        Self::QueryModelTraintuples,
        Self::QueryWorkerTraintuples,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegisterChallenge => "registerChallenge",
            Self::RegisterDataset => "registerDataset",
            Self::RegisterData => "registerData",
            Self::RegisterAlgo => "registerAlgo",
            Self::UpdateDataset => "updateDataset",
            Self::CreateTraintuple => "createTraintuple",
            Self::LogStartTrainTest => "logStartTrainTest",
            Self::LogSuccessTrain => "logSuccessTrain",
            Self::LogFailTrainTest => "logFailTrainTest",
            Self::LogSuccessTest => "logSuccessTest",
            Self::Query => "query",
            Self::QueryChallenges => "queryChallenges",
            Self::QueryDatasets => "queryDatasets",
            Self::QueryData => "queryData",
            Self::QueryAlgos => "queryAlgos",
            Self::QueryTraintuples => "queryTraintuples",
            Self::QueryDatasetData => "queryDatasetData",
            Self::QueryModel => "queryModel",
            Self::QueryModelTraintuples => "queryModelTraintuples",
            Self::QueryWorkerTraintuples => "queryWorkerTraintuples",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|function| function.as_str() == value)
    }

    #[must_use]
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Self::Query
                | Self::QueryChallenges
                | Self::QueryDatasets
                | Self::QueryData
                | Self::QueryAlgos
                | Self::QueryTraintuples
                | Self::QueryDatasetData
                | Self::QueryModel
                | Self::QueryModelTraintuples
                | Self::QueryWorkerTraintuples
        )
    }

    /// False for functions whose payload is a bare key.
    #[must_use]
    pub fn payload_is_json(self) -> bool {
        !matches!(
            self,
            Self::RegisterChallenge
                | Self::RegisterDataset
                | Self::RegisterAlgo
                | Self::UpdateDataset
                | Self::CreateTraintuple
        )
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
struct RegisteredKeys {
    keys: Vec<String>,
}

/// Runs `function` against `ledger` on behalf of `caller`.
///
/// Writes are issued directly to `ledger`; wrap the call in
/// [`invoke_atomic`] (or the collaborator's own transaction) so that a failed
/// call leaves nothing behind.
///
/// # Errors
/// Returns [`LedgerError::InvalidArgument`] for an unknown function or a
/// caller identity that is empty or cannot be stored as an index attribute,
/// and otherwise whatever the selected operation returns.
pub fn invoke(
    ledger: &mut dyn Ledger,
    config: &LedgerConfig,
    caller: &str,
    function: &str,
    args: &[String],
) -> Result<Vec<u8>, LedgerError> {
    if caller.is_empty() {
        return Err(LedgerError::InvalidArgument("caller identity MUST be non-empty".to_string()));
    }
    if caller.contains(ATTRIBUTE_SEPARATOR) {
        return Err(LedgerError::InvalidArgument(format!(
            "caller identity {caller:?} contains a reserved separator"
        )));
    }
    let function = Function::parse(function)
        .ok_or_else(|| LedgerError::InvalidArgument(format!("unknown function {function:?}")))?;

    tracing::debug!(%function, caller, args = args.len(), "invoke");
    let result = run(ledger, config, caller, function, args);
    if let Err(err) = &result {
        if err.may_leave_inconsistent() {
            tracing::warn!(%function, error = %err, "ledger call failed after issuing writes");
        } else {
            tracing::debug!(%function, code = err.code(), "ledger call rejected");
        }
    }
    result
}

/// [`invoke`] inside one ledger transaction: committed on success, discarded
/// on failure.
///
/// # Errors
/// As [`invoke`], plus [`LedgerError::LedgerWriteFailure`] when the
/// transaction itself cannot be opened or committed.
pub fn invoke_atomic<L: Transactional>(
    ledger: &mut L,
    config: &LedgerConfig,
    caller: &str,
    function: &str,
    args: &[String],
) -> Result<Vec<u8>, LedgerError> {
    ledger.transact(|tx| invoke(tx, config, caller, function, args))
}

fn run(
    ledger: &mut dyn Ledger,
    config: &LedgerConfig,
    caller: &str,
    function: Function,
    args: &[String],
) -> Result<Vec<u8>, LedgerError> {
    match function {
        Function::RegisterChallenge => {
            let input = RegisterChallengeInput::from_args(args, config)?;
            register_challenge(ledger, caller, input).map(String::into_bytes)
        }
        Function::RegisterDataset => {
            let input = RegisterDatasetInput::from_args(args, config)?;
            register_dataset(ledger, caller, input).map(String::into_bytes)
        }
        Function::RegisterData => {
            let input = RegisterDataInput::from_args(args, config)?;
            let keys = register_data(ledger, caller, input)?;
            payload(&RegisteredKeys { keys })
        }
        Function::RegisterAlgo => {
            let input = RegisterAlgoInput::from_args(args)?;
            register_algo(ledger, caller, input).map(String::into_bytes)
        }
        Function::UpdateDataset => {
            let input = UpdateDatasetInput::from_args(args, config)?;
            update_dataset(ledger, caller, input).map(String::into_bytes)
        }
        Function::CreateTraintuple => {
            let input = CreateTraintupleInput::from_args(args, config)?;
            create_traintuple(ledger, caller, input).map(String::into_bytes)
        }
        Function::LogStartTrainTest => {
            let input = LogStartTrainTestInput::from_args(args)?;
            payload(&log_start_train_test(ledger, caller, input)?)
        }
        Function::LogSuccessTrain => {
            let input = LogSuccessTrainInput::from_args(args)?;
            payload(&log_success_train(ledger, config, caller, input)?)
        }
        Function::LogFailTrainTest => {
            let input = LogFailTrainTestInput::from_args(args)?;
            payload(&log_fail_train_test(ledger, config, caller, input)?)
        }
        Function::LogSuccessTest => {
            let input = LogSuccessTestInput::from_args(args)?;
            payload(&log_success_test(ledger, config, caller, input)?)
        }
        Function::Query => {
            let [key] = positional(args, &QUERY_FIELDS)?;
            query(&*ledger, key)
        }
        Function::QueryChallenges => list::<Challenge>(&*ledger, args),
        Function::QueryDatasets => list::<Dataset>(&*ledger, args),
        Function::QueryData => list::<Data>(&*ledger, args),
        Function::QueryAlgos => list::<Algo>(&*ledger, args),
        Function::QueryTraintuples => list::<Traintuple>(&*ledger, args),
        Function::QueryDatasetData => {
            let [dataset_key] = positional(args, &QUERY_DATASET_DATA_FIELDS)?;
            payload(&query_dataset_data(&*ledger, dataset_key)?)
        }
        Function::QueryModel => {
            let [model_hash] = positional(args, &QUERY_MODEL_FIELDS)?;
            payload(&query_model(&*ledger, model_hash)?)
        }
        Function::QueryModelTraintuples => {
            let [model_hash] = positional(args, &QUERY_MODEL_FIELDS)?;
            payload(&query_model_traintuples(&*ledger, model_hash)?)
        }
        Function::QueryWorkerTraintuples => {
            let [role, worker, status] = positional(args, &QUERY_WORKER_TRAINTUPLES_FIELDS)?;
            let role = Role::parse(role).ok_or_else(|| {
                LedgerError::InvalidArgument(format!("role MUST be train or test, got {role:?}"))
            })?;
            let status = if status.is_empty() {
                None
            } else {
                Some(Status::parse(status).ok_or_else(|| {
                    LedgerError::InvalidArgument(format!("unknown traintuple status {status:?}"))
                })?)
            };
            payload(&query_worker_traintuples(&*ledger, role, worker, status)?)
        }
    }
}

fn list<T: Listed>(ledger: &dyn Ledger, args: &[String]) -> Result<Vec<u8>, LedgerError> {
    let [] = positional(args, &[])?;
    payload(&query_all::<T>(ledger)?)
}

fn payload<T: Serialize>(value: &T) -> Result<Vec<u8>, LedgerError> {
    serde_json::to_vec(value)
        .map_err(|err| LedgerError::LedgerWriteFailure(format!("cannot encode payload: {err}")))
}
