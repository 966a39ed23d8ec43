//! Read-only views over the ledger. Relationship queries are answered from
//! the secondary indexes; nothing here writes.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::identity::validate_hash;
use crate::index::{
    worker_index, ALGO_BY_CHALLENGE, CHALLENGE_BY_DATASET, CHALLENGE_BY_OWNER, DATASET_BY_OWNER,
    DATA_BY_DATASET, DATA_BY_DATASET_TEST_ONLY, TRAINTUPLE_BY_ALGO, TRAINTUPLE_BY_END_MODEL,
};
use crate::ledger::Ledger;
use crate::model::{Algo, Challenge, Data, Dataset, ElementType, Role, Status, Traintuple};
use crate::registry::{load, load_indexed};
use crate::LedgerError;

pub const QUERY_FIELDS: [&str; 1] = ["key"];
pub const QUERY_DATASET_DATA_FIELDS: [&str; 1] = ["datasetKey"];
pub const QUERY_MODEL_FIELDS: [&str; 1] = ["modelHash"];
pub const QUERY_WORKER_TRAINTUPLES_FIELDS: [&str; 3] = ["role", "worker", "status"];

/// A record type with an index holding every key of that type.
pub trait Listed: DeserializeOwned + Serialize {
    const TYPE: ElementType;
    const LISTING_INDEX: &'static str;
}

impl Listed for Challenge {
    const TYPE: ElementType = ElementType::Challenge;
    const LISTING_INDEX: &'static str = CHALLENGE_BY_OWNER;
}

impl Listed for Dataset {
    const TYPE: ElementType = ElementType::Dataset;
    const LISTING_INDEX: &'static str = DATASET_BY_OWNER;
}

impl Listed for Data {
    const TYPE: ElementType = ElementType::Data;
    const LISTING_INDEX: &'static str = DATA_BY_DATASET;
}

impl Listed for Algo {
    const TYPE: ElementType = ElementType::Algo;
    const LISTING_INDEX: &'static str = ALGO_BY_CHALLENGE;
}

impl Listed for Traintuple {
    const TYPE: ElementType = ElementType::Traintuple;
    const LISTING_INDEX: &'static str = TRAINTUPLE_BY_ALGO;
}

/// A record serialized with its ledger key injected as `key`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Keyed<T> {
    pub key: String,
    #[serde(flatten)]
    pub record: T,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetView {
    pub dataset: Keyed<Dataset>,
    pub challenge_keys: Vec<String>,
    pub train_data_keys: Vec<String>,
    pub test_data_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelView {
    pub algo: Keyed<Algo>,
    pub traintuples: Vec<Keyed<Traintuple>>,
}

/// Raw bytes stored at `key`.
///
/// # Errors
/// Returns [`LedgerError::NotFound`] when nothing is stored there.
pub fn query(ledger: &dyn Ledger, key: &str) -> Result<Vec<u8>, LedgerError> {
    ledger
        .get_state(key)?
        .ok_or_else(|| LedgerError::NotFound(format!("no element with key {key}")))
}

/// Every record of type `T`, in index order.
///
/// # Errors
/// Returns [`LedgerError::IndexConsistency`] when the listing index points to
/// a missing record.
pub fn query_all<T: Listed>(ledger: &dyn Ledger) -> Result<Vec<Keyed<T>>, LedgerError> {
    let keys = ledger.query_index(T::LISTING_INDEX, &[])?;
    resolve(ledger, T::LISTING_INDEX, keys)
}

fn resolve<T: Listed>(
    ledger: &dyn Ledger,
    index: &str,
    keys: Vec<String>,
) -> Result<Vec<Keyed<T>>, LedgerError> {
    keys.into_iter()
        .map(|key| {
            let record = load_indexed(ledger, index, &key, T::TYPE)?;
            Ok(Keyed { key, record })
        })
        .collect()
}

/// A dataset with its associated challenges and its train and test data
/// keys, all resolved from indexes.
///
/// # Errors
/// Returns [`LedgerError::NotFound`] when no dataset has that key.
pub fn query_dataset_data(
    ledger: &dyn Ledger,
    dataset_key: &str,
) -> Result<DatasetView, LedgerError> {
    validate_hash("dataset key", dataset_key)?;
    let dataset: Dataset = load(ledger, dataset_key, ElementType::Dataset)?;

    Ok(DatasetView {
        dataset: Keyed {
            key: dataset_key.to_string(),
            record: dataset,
        },
        challenge_keys: ledger.query_index(CHALLENGE_BY_DATASET, &[dataset_key])?,
        train_data_keys: ledger.query_index(DATA_BY_DATASET_TEST_ONLY, &[dataset_key, "false"])?,
        test_data_keys: ledger.query_index(DATA_BY_DATASET_TEST_ONLY, &[dataset_key, "true"])?,
    })
}

/// The traintuple that produced `model_hash`.
///
/// # Errors
/// Returns [`LedgerError::NotFound`] when no traintuple produced that model.
pub fn query_model(
    ledger: &dyn Ledger,
    model_hash: &str,
) -> Result<Keyed<Traintuple>, LedgerError> {
    validate_hash("model hash", model_hash)?;
    let Some(key) = ledger
        .query_index(TRAINTUPLE_BY_END_MODEL, &[model_hash])?
        .into_iter()
        .next()
    else {
        return Err(LedgerError::NotFound(format!("no traintuple produced model {model_hash}")));
    };

    let record = load_indexed(
        ledger,
        TRAINTUPLE_BY_END_MODEL,
        &key,
        ElementType::Traintuple,
    )?;
    Ok(Keyed { key, record })
}

/// The algo behind `model_hash` and every traintuple sharing that algo.
///
/// # Errors
/// Returns [`LedgerError::NotFound`] when no traintuple produced that model.
pub fn query_model_traintuples(
    ledger: &dyn Ledger,
    model_hash: &str,
) -> Result<ModelView, LedgerError> {
    let traintuple = query_model(ledger, model_hash)?;
    let algo_key = traintuple.record.algo.hash;
    let algo: Algo = load(ledger, &algo_key, ElementType::Algo)?;
    let keys = ledger.query_index(TRAINTUPLE_BY_ALGO, &[&algo_key])?;

    Ok(ModelView {
        traintuples: resolve(ledger, TRAINTUPLE_BY_ALGO, keys)?,
        algo: Keyed {
            key: algo_key,
            record: algo,
        },
    })
}

/// Traintuples where `worker` holds `role`, optionally restricted to one
/// status.
///
/// # Errors
/// Returns [`LedgerError::IndexConsistency`] when the worker index points to
/// a missing record.
pub fn query_worker_traintuples(
    ledger: &dyn Ledger,
    role: Role,
    worker: &str,
    status: Option<Status>,
) -> Result<Vec<Keyed<Traintuple>>, LedgerError> {
    let index = worker_index(role);
    let keys = match status {
        Some(status) => ledger.query_index(index, &[worker, status.as_str()])?,
        None => ledger.query_index(index, &[worker])?,
    };
    resolve(ledger, index, keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::fixtures::{
        add_data, add_dataset, args, hash, must, World, ALGO_OWNER, TEST_OWNER, TRAIN_OWNER,
    };
    use crate::ledger::MemoryLedger;
    use crate::traintuple::{
        create_traintuple, log_start_train_test, log_success_train, CreateTraintupleInput,
        LogStartTrainTestInput, LogSuccessTrainInput,
    };

    fn create(world: &mut World) -> String {
        let input = must(CreateTraintupleInput::from_args(
            &args(&[
                &world.challenge,
                &world.algo,
                &world.algo,
                &world.train_data.join(","),
            ]),
            &world.config,
        ));
        must(create_traintuple(&mut world.ledger, ALGO_OWNER, input))
    }

    #[test]
    fn dataset_view_partitions_data_by_test_flag() {
        let mut world = World::new();
        let extra_test = vec![hash('6')];
        add_data(
            &mut world.ledger,
            &world.config,
            TRAIN_OWNER,
            &world.train_dataset,
            &extra_test,
            true,
        );

        let view = must(query_dataset_data(&world.ledger, &world.train_dataset));
        assert_eq!(view.train_data_keys, world.train_data);
        assert_eq!(view.test_data_keys, extra_test);
        assert!(view.challenge_keys.is_empty());

        let test_view = must(query_dataset_data(&world.ledger, &world.test_dataset));
        assert!(test_view.train_data_keys.is_empty());
        assert_eq!(test_view.test_data_keys, world.test_data);
        assert_eq!(test_view.challenge_keys, vec![world.challenge.clone()]);
    }

    #[test]
    fn dataset_view_serializes_empty_lists_and_key() {
        let mut ledger = MemoryLedger::new();
        let config = LedgerConfig::v1();
        let dataset = add_dataset(&mut ledger, &config, "org-a", &hash('a'));

        let view = must(query_dataset_data(&ledger, &dataset));
        let value = must(serde_json::to_value(&view));
        assert_eq!(value["dataset"]["key"], serde_json::json!(dataset));
        assert_eq!(value["dataset"]["owner"], serde_json::json!("org-a"));
        assert_eq!(value["trainDataKeys"], serde_json::json!([]));
        assert_eq!(value["testDataKeys"], serde_json::json!([]));
        assert_eq!(value["challengeKeys"], serde_json::json!([]));
    }

    #[test]
    fn missing_keys_are_not_found() {
        let world = World::new();
        assert!(matches!(
            query(&world.ledger, &hash('0')),
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            query_dataset_data(&world.ledger, &hash('0')),
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            query_dataset_data(&world.ledger, &world.algo),
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            query_model(&world.ledger, &hash('5')),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn listings_cover_every_registered_record() {
        let mut world = World::new();
        let key = create(&mut world);

        let challenges = must(query_all::<Challenge>(&world.ledger));
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].key, world.challenge);

        let datasets = must(query_all::<Dataset>(&world.ledger));
        assert_eq!(datasets.len(), 2);

        let data = must(query_all::<Data>(&world.ledger));
        assert_eq!(data.len(), 4);

        assert_eq!(must(query_all::<Algo>(&world.ledger)).len(), 1);

        let traintuples = must(query_all::<Traintuple>(&world.ledger));
        assert_eq!(traintuples.len(), 1);
        assert_eq!(traintuples[0].key, key);
    }

    #[test]
    fn empty_ledger_lists_nothing() {
        let ledger = MemoryLedger::new();
        let challenges = must(query_all::<Challenge>(&ledger));
        assert_eq!(must(serde_json::to_string(&challenges)), "[]");
    }

    #[test]
    fn keyed_record_puts_key_first() {
        let world = World::new();
        let algos = must(query_all::<Algo>(&world.ledger));
        let text = must(serde_json::to_string(&algos[0]));
        assert!(text.starts_with(&format!(r#"{{"key":"{}","name":"#, world.algo)));
    }

    #[test]
    fn model_view_lists_sibling_traintuples() {
        let mut world = World::new();
        let first = create(&mut world);
        let input = must(LogStartTrainTestInput::from_args(&args(&[&first, "training"])));
        must(log_start_train_test(&mut world.ledger, TRAIN_OWNER, input));
        let input = must(LogSuccessTrainInput::from_args(&args(&[
            &first,
            &format!("{}, https://storage/model", hash('5')),
            "",
            "",
        ])));
        must(log_success_train(&mut world.ledger, &world.config, TRAIN_OWNER, input));

        let input = must(CreateTraintupleInput::from_args(
            &args(&[
                &world.challenge,
                &world.algo,
                &world.algo,
                &world.train_data[0],
            ]),
            &world.config,
        ));
        let second = must(create_traintuple(&mut world.ledger, ALGO_OWNER, input));

        let model = must(query_model(&world.ledger, &hash('5')));
        assert_eq!(model.key, first);

        let view = must(query_model_traintuples(&world.ledger, &hash('5')));
        assert_eq!(view.algo.key, world.algo);
        let mut keys: Vec<String> = view.traintuples.into_iter().map(|item| item.key).collect();
        keys.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[test]
    fn worker_listing_follows_status_changes() {
        let mut world = World::new();
        let key = create(&mut world);

        let ledger = &world.ledger;
        let status = Some(Status::Todo);
        let todo = must(query_worker_traintuples(ledger, Role::Train, TRAIN_OWNER, status));
        assert_eq!(todo.len(), 1);
        let waiting = must(query_worker_traintuples(ledger, Role::Test, TEST_OWNER, None));
        assert_eq!(waiting[0].key, key);

        let input = must(LogStartTrainTestInput::from_args(&args(&[&key, "training"])));
        must(log_start_train_test(&mut world.ledger, TRAIN_OWNER, input));

        let ledger = &world.ledger;
        let status = Some(Status::Todo);
        let todo = must(query_worker_traintuples(ledger, Role::Train, TRAIN_OWNER, status));
        assert!(todo.is_empty());
        let status = Some(Status::Training);
        let testing = must(query_worker_traintuples(ledger, Role::Test, TEST_OWNER, status));
        assert_eq!(testing.len(), 1);
    }

    #[test]
    fn dangling_index_entry_is_an_index_consistency_error() {
        let mut ledger = MemoryLedger::new();
        must(ledger.add_index_entry(ALGO_BY_CHALLENGE, &[&hash('c'), &hash('f')]));
        assert!(matches!(
            query_all::<Algo>(&ledger),
            Err(LedgerError::IndexConsistency(_))
        ));
    }
}
