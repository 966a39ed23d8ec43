//! Shared ledger setup for unit tests.

use crate::config::LedgerConfig;
use crate::index::reconstruct_indexes;
use crate::ledger::MemoryLedger;
use crate::registry::{
    register_algo, register_challenge, register_data, register_dataset, RegisterAlgoInput,
    RegisterChallengeInput, RegisterDataInput, RegisterDatasetInput,
};

pub const TEST_OWNER: &str = "org-test";
pub const TRAIN_OWNER: &str = "org-train";
pub const CHALLENGE_OWNER: &str = "org-challenge";
pub const ALGO_OWNER: &str = "org-algo";

pub fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

pub fn hash(seed: char) -> String {
    seed.to_string().repeat(64)
}

pub fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

/// A ledger holding a test dataset, a challenge scored on it, a training
/// dataset and one algo.
pub struct World {
    pub ledger: MemoryLedger,
    pub config: LedgerConfig,
    pub test_dataset: String,
    pub test_data: Vec<String>,
    pub challenge: String,
    pub train_dataset: String,
    pub train_data: Vec<String>,
    pub algo: String,
}

impl World {
    pub fn new() -> Self {
        let config = LedgerConfig::v1();
        let mut ledger = MemoryLedger::new();

        let test_dataset = add_dataset(&mut ledger, &config, TEST_OWNER, &hash('a'));
        let test_data = vec![hash('1'), hash('2')];
        add_data(
            &mut ledger,
            &config,
            TEST_OWNER,
            &test_dataset,
            &test_data,
            true,
        );

        let challenge_input = must(RegisterChallengeInput::from_args(
            &args(&[
                "skin lesions",
                &hash('c'),
                "https://storage/challenge",
                "macro-average recall",
                &hash('e'),
                "https://storage/metrics",
                &test_data.join(","),
                "all",
            ]),
            &config,
        ));
        let challenge = must(register_challenge(&mut ledger, CHALLENGE_OWNER, challenge_input));

        let train_dataset = add_dataset(&mut ledger, &config, TRAIN_OWNER, &hash('b'));
        let train_data = vec![hash('3'), hash('4')];
        add_data(
            &mut ledger,
            &config,
            TRAIN_OWNER,
            &train_dataset,
            &train_data,
            false,
        );

        let algo_input = must(RegisterAlgoInput::from_args(&args(&[
            "logistic regression",
            &hash('f'),
            "https://storage/algo",
            &hash('9'),
            "https://storage/algo-description",
            &challenge,
            "all",
        ])));
        let algo = must(register_algo(&mut ledger, ALGO_OWNER, algo_input));

        Self {
            ledger,
            config,
            test_dataset,
            test_data,
            challenge,
            train_dataset,
            train_data,
            algo,
        }
    }

    pub fn assert_indexes_reconstructible(&self) {
        let expected = must(reconstruct_indexes(self.ledger.records()));
        assert_eq!(expected, self.ledger.index_entries());
    }
}

pub fn add_dataset(
    ledger: &mut MemoryLedger,
    config: &LedgerConfig,
    owner: &str,
    opener: &str,
) -> String {
    let input = must(RegisterDatasetInput::from_args(
        &args(&[
            "slides",
            opener,
            "https://storage/opener",
            "images",
            &hash('d'),
            "https://storage/description",
            "",
            "all",
        ]),
        config,
    ));
    must(register_dataset(ledger, owner, input))
}

pub fn add_data(
    ledger: &mut MemoryLedger,
    config: &LedgerConfig,
    owner: &str,
    dataset: &str,
    hashes: &[String],
    test_only: bool,
) {
    let input = must(RegisterDataInput::from_args(
        &args(&[&hashes.join(","), dataset, &test_only.to_string()]),
        config,
    ));
    must(register_data(ledger, owner, input));
}
