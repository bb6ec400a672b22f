//! one entry point per model branch, plus an explicit result cache
//!
//! each [`ModelKind`] names its own required fields; [`run`] validates the
//! cohort against them before any numerical work and then hands the clean
//! snapshot to the matching component. branches share nothing but the
//! immutable cohort, so [`run_all`] simply fans them out over rayon and
//! collects one `Result` per branch.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    attribution::{self, AttributionVector},
    classifier::RiskModel,
    cohort::{Cohort, CohortVersion, SubjectId},
    config::AnalysisConfig,
    error::Result,
    model::HazardModelResult,
    survival::{self, SurvivalCurve},
    validate::validate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    KaplanMeier,
    CoxHazards,
    RiskClassifier,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [ModelKind::KaplanMeier, ModelKind::CoxHazards, ModelKind::RiskClassifier];

    /// fields a cohort needs for this branch under `config`
    pub fn required_fields(self, config: &AnalysisConfig) -> Vec<&str> {
        match self {
            ModelKind::KaplanMeier => config.survival.required_fields(),
            ModelKind::CoxHazards => config.hazard.required_fields(),
            ModelKind::RiskClassifier => config.classifier.required_fields(),
        }
    }

    /// hash of the config section this branch reads
    fn parameter_fingerprint(self, config: &AnalysisConfig) -> Result<u64> {
        let section = match self {
            ModelKind::KaplanMeier => serde_json::to_string(&config.survival)?,
            ModelKind::CoxHazards => serde_json::to_string(&config.hazard)?,
            ModelKind::RiskClassifier => serde_json::to_string(&config.classifier)?,
        };
        let mut hasher = DefaultHasher::new();
        section.hash(&mut hasher);
        Ok(hasher.finish())
    }
}

/// classifier plus attributions for every subject it was trained on
#[derive(Debug, Clone)]
pub struct RiskAnalysis {
    pub model: RiskModel,
    pub attributions: BTreeMap<SubjectId, AttributionVector>,
}

#[derive(Debug, Clone)]
pub enum AnalysisOutput {
    Survival(BTreeMap<String, SurvivalCurve>),
    Hazards(HazardModelResult),
    Risk(RiskAnalysis),
}

impl AnalysisOutput {
    pub fn kind(&self) -> ModelKind {
        match self {
            AnalysisOutput::Survival(_) => ModelKind::KaplanMeier,
            AnalysisOutput::Hazards(_) => ModelKind::CoxHazards,
            AnalysisOutput::Risk(_) => ModelKind::RiskClassifier,
        }
    }

    pub fn as_survival(&self) -> Option<&BTreeMap<String, SurvivalCurve>> {
        match self {
            AnalysisOutput::Survival(curves) => Some(curves),
            _ => None,
        }
    }

    pub fn as_hazards(&self) -> Option<&HazardModelResult> {
        match self {
            AnalysisOutput::Hazards(result) => Some(result),
            _ => None,
        }
    }

    pub fn as_risk(&self) -> Option<&RiskAnalysis> {
        match self {
            AnalysisOutput::Risk(risk) => Some(risk),
            _ => None,
        }
    }
}

/// validate, then run one branch on the clean snapshot
pub fn run(cohort: &Cohort, kind: ModelKind, config: &AnalysisConfig) -> Result<AnalysisOutput> {
    let start = Instant::now();
    let result = validate(cohort, &kind.required_fields(config)).and_then(|validated| {
        let clean = &validated.cohort;
        match kind {
            ModelKind::KaplanMeier => survival::estimate_survival(clean, &config.survival).map(AnalysisOutput::Survival),
            ModelKind::CoxHazards => {
                let hazard = &config.hazard;
                hazard
                    .model()
                    .fit_cohort(clean, &hazard.time_field, &hazard.event_field, &hazard.covariates)
                    .map(AnalysisOutput::Hazards)
            }
            ModelKind::RiskClassifier => {
                let classifier = &config.classifier;
                let model = classifier
                    .trainer()
                    .train(clean, &classifier.features, &classifier.outcome_field)?;
                let attributions = attribution::explain(&model, clean)?;
                Ok(AnalysisOutput::Risk(RiskAnalysis { model, attributions }))
            }
        }
    });

    match &result {
        Ok(_) => log::info!("{kind:?} finished in {:.2?}", start.elapsed()),
        Err(e) => log::warn!("{kind:?} failed after {:.2?}: {e}", start.elapsed()),
    }
    result
}

/// every requested branch in parallel; a failing branch never stops the others
pub fn run_all(
    cohort: &Cohort,
    kinds: &[ModelKind],
    config: &AnalysisConfig,
) -> Vec<(ModelKind, Result<AnalysisOutput>)> {
    kinds
        .par_iter()
        .map(|&kind| (kind, run(cohort, kind, config)))
        .collect()
}

/// (snapshot, branch, parameters) a cached result was computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub version: CohortVersion,
    pub kind: ModelKind,
    pub parameters: u64,
}

impl CacheKey {
    pub fn new(cohort: &Cohort, kind: ModelKind, config: &AnalysisConfig) -> Result<Self> {
        Ok(Self {
            version: cohort.version(),
            kind,
            parameters: kind.parameter_fingerprint(config)?,
        })
    }
}

/// caller-owned result store; nothing expires on its own
#[derive(Debug, Default)]
pub struct AnalysisCache {
    entries: HashMap<CacheKey, Arc<AnalysisOutput>>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<AnalysisOutput>> {
        self.entries.get(key).cloned()
    }

    /// cached output, or run and store it. failures are returned, never stored
    pub fn get_or_run(&mut self, cohort: &Cohort, kind: ModelKind, config: &AnalysisConfig) -> Result<Arc<AnalysisOutput>> {
        let key = CacheKey::new(cohort, kind, config)?;
        if let Some(hit) = self.entries.get(&key) {
            log::debug!("cache hit for {kind:?} on {}", key.version);
            return Ok(Arc::clone(hit));
        }
        let output = Arc::new(run(cohort, kind, config)?);
        self.entries.insert(key, Arc::clone(&output));
        Ok(output)
    }

    /// drop everything computed from one snapshot; returns how many entries went
    pub fn invalidate(&mut self, version: CohortVersion) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.version != version);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
