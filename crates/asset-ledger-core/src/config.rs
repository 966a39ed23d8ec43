use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::LedgerError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    pub config_version: u32,
    /// Upper bound on a traintuple's accumulated log, in bytes.
    pub max_log_bytes: usize,
    /// Upper bound on the number of keys accepted in one comma-joined list.
    pub max_batch_size: usize,
}

impl LedgerConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            max_log_bytes: 4_096,
            max_batch_size: 1_000,
        }
    }

    /// Validates numeric bounds.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when a field is out of bounds.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.config_version == 0 {
            return Err(LedgerError::Configuration("config_version MUST be >= 1".to_string()));
        }

        if self.max_log_bytes == 0 {
            return Err(LedgerError::Configuration("max_log_bytes MUST be >= 1".to_string()));
        }

        if self.max_batch_size == 0 {
            return Err(LedgerError::Configuration("max_batch_size MUST be >= 1".to_string()));
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when decoding fails or the
    /// decoded values are out of bounds.
    pub fn from_json(value: &Value) -> Result<Self, LedgerError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LedgerError::Configuration(format!("invalid ledger config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::v1()
    }
}
