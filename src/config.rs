//! analysis settings, loaded from toml
//!
//! ```toml
//! [survival]
//! group_field = "Sex"
//! min_group_size = 5
//!
//! [hazard]
//! covariates = ["Age", "Work_Stress_Level", "Burnout_Level", "Social_Isolation"]
//! ties = "efron"
//!
//! [classifier]
//! features = ["Age", "Work_Stress_Level", "Hopelessness", "Despair"]
//! outcome_field = "Crisis_Event"
//! n_trees = 100
//! ```
//!
//! every section and key is optional; anything left out takes the default.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    classifier::{BoostingParams, RiskClassifier},
    cohort::fields,
    error::{Result, RiskError},
    model::HazardModel,
    optimization::{OptimizationConfig, TieMethod},
    survival::SurvivalOptions,
};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub survival: SurvivalOptions,
    pub hazard: HazardConfig,
    pub classifier: ClassifierConfig,
}

impl AnalysisConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        log::debug!("loading analysis config from {}", path.as_ref().display());
        Self::from_toml_str(&text)
    }

    /// reject settings no model could run with
    pub fn validate(&self) -> Result<()> {
        if self.survival.min_group_size == 0 {
            return Err(RiskError::invalid_parameter("survival.min_group_size", 0));
        }
        if self.hazard.covariates.is_empty() {
            return Err(RiskError::invalid_parameter("hazard.covariates", "[]"));
        }
        if self.hazard.max_iterations == 0 {
            return Err(RiskError::invalid_parameter("hazard.max_iterations", 0));
        }
        if !(self.hazard.tolerance > 0.0) {
            return Err(RiskError::invalid_parameter("hazard.tolerance", self.hazard.tolerance));
        }
        let classifier = &self.classifier;
        if classifier.features.is_empty() {
            return Err(RiskError::invalid_parameter("classifier.features", "[]"));
        }
        if !(classifier.test_fraction > 0.0 && classifier.test_fraction < 1.0) {
            return Err(RiskError::invalid_parameter("classifier.test_fraction", classifier.test_fraction));
        }
        classifier.boosting.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HazardConfig {
    pub time_field: String,
    pub event_field: String,
    pub covariates: Vec<String>,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub ties: TieMethod,
}

impl Default for HazardConfig {
    fn default() -> Self {
        let optimizer = OptimizationConfig::default();
        Self {
            time_field: fields::TIME_TO_CRISIS.to_string(),
            event_field: fields::CRISIS_EVENT.to_string(),
            covariates: [
                fields::AGE,
                fields::WORK_STRESS_LEVEL,
                fields::BURNOUT_LEVEL,
                fields::SOCIAL_ISOLATION,
            ]
            .map(String::from)
            .to_vec(),
            max_iterations: optimizer.max_iterations,
            tolerance: optimizer.tolerance,
            ties: optimizer.ties,
        }
    }
}

impl HazardConfig {
    pub fn model(&self) -> HazardModel {
        HazardModel::new()
            .with_max_iterations(self.max_iterations)
            .with_tolerance(self.tolerance)
            .with_ties(self.ties)
    }

    pub fn required_fields(&self) -> Vec<&str> {
        let mut required = vec![self.time_field.as_str(), self.event_field.as_str()];
        required.extend(self.covariates.iter().map(String::as_str));
        required
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub features: Vec<String>,
    pub outcome_field: String,
    pub test_fraction: f64,
    pub seed: u64,
    #[serde(flatten)]
    pub boosting: BoostingParams,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            features: [
                fields::AGE,
                fields::WORK_STRESS_LEVEL,
                fields::BURNOUT_LEVEL,
                fields::SOCIAL_ISOLATION,
                fields::HOPELESSNESS,
                fields::DESPAIR,
            ]
            .map(String::from)
            .to_vec(),
            outcome_field: fields::CRISIS_EVENT.to_string(),
            test_fraction: 0.3,
            seed: 42,
            boosting: BoostingParams::default(),
        }
    }
}

impl ClassifierConfig {
    pub fn trainer(&self) -> RiskClassifier {
        RiskClassifier::new()
            .with_params(self.boosting.clone())
            .with_test_fraction(self.test_fraction)
            .with_seed(self.seed)
    }

    pub fn required_fields(&self) -> Vec<&str> {
        let mut required: Vec<&str> = self.features.iter().map(String::as_str).collect();
        required.push(self.outcome_field.as_str());
        required
    }
}
