use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{EngineError, Result};

/// Engine-wide configuration.
///
/// The three distinguished node kinds are configuration rather than
/// hard-coded strings: `validator_kind` marks nodes whose failure triggers
/// the retry/correction protocol, `corrector_kind` marks the synthesized
/// trigger nodes that produce corrected input, and `gate_kind` marks nodes
/// that pause their branch for external approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub validator_kind: String,
    pub corrector_kind: String,
    pub gate_kind: String,
    /// Maximum validator attempts per lineage before the task is failed
    /// outright.
    pub max_retry_attempts: u32,
    /// Sleep between scheduler loop passes.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            validator_kind: "guard".to_string(),
            corrector_kind: "corrector".to_string(),
            gate_kind: "human_gate".to_string(),
            max_retry_attempts: 3,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("validator_kind", &self.validator_kind),
            ("corrector_kind", &self.corrector_kind),
            ("gate_kind", &self.gate_kind),
        ] {
            if value.is_empty() {
                return Err(EngineError::Configuration(format!("{name} must not be empty")));
            }
        }
        if self.validator_kind == self.corrector_kind
            || self.validator_kind == self.gate_kind
            || self.corrector_kind == self.gate_kind
        {
            return Err(EngineError::Configuration(
                "validator_kind, corrector_kind and gate_kind must be distinct".to_string(),
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(EngineError::Configuration(
                "max_retry_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_empty_kind() {
        let mut config = EngineConfig::default();
        config.gate_kind.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_overlapping_kinds() {
        let mut config = EngineConfig::default();
        config.corrector_kind = config.validator_kind.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_retry_cap() {
        let mut config = EngineConfig::default();
        config.max_retry_attempts = 0;
        assert!(config.validate().is_err());
    }
}
