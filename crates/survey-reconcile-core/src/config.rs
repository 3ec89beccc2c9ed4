use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ReconcileError;

pub const SIGNAL_DEVICE: &str = "device";
pub const SIGNAL_TEMPORAL: &str = "temporal";
pub const SIGNAL_RESPONSE_PATTERN: &str = "response_pattern";

const KNOWN_SIGNALS: [&str; 3] = [SIGNAL_DEVICE, SIGNAL_TEMPORAL, SIGNAL_RESPONSE_PATTERN];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub anomaly: AnomalyConfig,
    pub attribution: AttributionConfig,
    pub batch: BatchConfig,
    pub lock: LockConfig,
}

impl EngineConfig {
    /// Check every section before the engine touches any record.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Validation`] naming the first invalid setting.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        self.anomaly.validate()?;
        self.attribution.validate()?;
        if self.batch.workers == 0 {
            return Err(ReconcileError::Validation("batch.workers MUST be >= 1".to_string()));
        }
        if self.lock.stale_after_secs == 0 {
            return Err(ReconcileError::Validation(
                "lock.stale_after_secs MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AnomalyConfig {
    /// A delta this far above the median delta flags the later response.
    pub gap_threshold_secs: f64,
    /// Equal consecutive values collected within this window are duplicates.
    pub duplicate_window_secs: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self { gap_threshold_secs: 60.0, duplicate_window_secs: 1.0 }
    }
}

impl AnomalyConfig {
    fn validate(&self) -> Result<(), ReconcileError> {
        if !self.gap_threshold_secs.is_finite() || self.gap_threshold_secs <= 0.0 {
            return Err(ReconcileError::Validation(
                "anomaly.gap_threshold_secs MUST be a positive number".to_string(),
            ));
        }
        if !self.duplicate_window_secs.is_finite() || self.duplicate_window_secs < 0.0 {
            return Err(ReconcileError::Validation(
                "anomaly.duplicate_window_secs MUST be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AttributionConfig {
    pub weights: BTreeMap<String, f64>,
    /// Top two candidates closer than this are reported as a tie.
    pub ambiguity_margin: f64,
    /// Minimum top score before a candidate is recommended for review.
    pub acceptance_threshold: f64,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            weights: default_signal_weights(),
            ambiguity_margin: 0.05,
            acceptance_threshold: 0.75,
        }
    }
}

impl AttributionConfig {
    fn validate(&self) -> Result<(), ReconcileError> {
        if self.weights.is_empty() {
            return Err(ReconcileError::Validation(
                "attribution.weights MUST configure at least one signal".to_string(),
            ));
        }
        for (name, weight) in &self.weights {
            if !KNOWN_SIGNALS.contains(&name.as_str()) {
                return Err(ReconcileError::Validation(format!(
                    "attribution.weights.{name} is not a known signal (expected one of {})",
                    KNOWN_SIGNALS.join(", ")
                )));
            }
            if !weight.is_finite() || *weight < 0.0 {
                return Err(ReconcileError::Validation(format!(
                    "attribution.weights.{name} MUST be a finite number >= 0"
                )));
            }
        }
        if self.weights.values().all(|weight| *weight == 0.0) {
            return Err(ReconcileError::Validation(
                "attribution.weights MUST include at least one positive weight".to_string(),
            ));
        }
        for (label, value) in [
            ("attribution.ambiguity_margin", self.ambiguity_margin),
            ("attribution.acceptance_threshold", self.acceptance_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ReconcileError::Validation(format!("{label} MUST be in [0.0, 1.0]")));
            }
        }
        Ok(())
    }
}

#[must_use]
pub fn default_signal_weights() -> BTreeMap<String, f64> {
    BTreeMap::from([
        (SIGNAL_DEVICE.to_string(), 0.4),
        (SIGNAL_TEMPORAL.to_string(), 0.3),
        (SIGNAL_RESPONSE_PATTERN.to_string(), 0.3),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    /// Locks older than this are treated as abandoned and reclaimed.
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { stale_after_secs: 900 }
    }
}
