//! # crisis risk
//!
//! time-to-crisis risk modeling for a cohort of subjects - survival curves,
//! hazard regression and boosted risk scores you can actually explain
//!
//! ## what you get
//!
//! - kaplan-meier curves (stratified or not) w/ greenwood bands
//! - cox proportional hazards via newton-raphson, efron or breslow ties
//! - gradient boosted risk classifier with held-out accuracy / auc
//! - treeshap attributions that add up exactly to each prediction
//! - filtering + grouped summaries, csv/json round trips
//! - every branch runs on an immutable snapshot, in parallel if you want
//!
//! ## quick start
//!
//! ```rust
//! use crisis_risk::{AnalysisConfig, ModelKind, run_all, synthetic};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // 300 synthetic healthcare workers
//! let cohort = synthetic::generate(300, 42);
//!
//! let mut config = AnalysisConfig::default();
//! config.classifier.boosting.n_trees = 20;
//!
//! for (kind, result) in run_all(&cohort, &ModelKind::ALL, &config) {
//!     match result {
//!         Ok(output) => assert_eq!(output.kind(), kind),
//!         Err(e) => println!("{kind:?} failed: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod analysis;
pub mod attribution;
pub mod classifier;
pub mod cohort;
pub mod config;
pub mod data;
pub mod error;
pub mod io;
pub mod metrics;
pub mod model;
pub mod optimization;
pub mod survival;
pub mod synthetic;
pub mod tree;
pub mod validate;

pub use aggregate::{AggFn, GroupSummary, Predicate, aggregate, filter};
pub use analysis::{AnalysisCache, AnalysisOutput, ModelKind, run, run_all};
pub use attribution::{AttributionVector, explain, global_importance};
pub use classifier::{RiskClassifier, RiskModel, train_risk_model};
pub use cohort::{Cohort, CohortVersion, Schema, SubjectId, SubjectRecord, Value};
pub use config::AnalysisConfig;
pub use data::SurvivalData;
pub use error::{Result, RiskError};
pub use model::{HazardModel, HazardModelResult, fit_hazards};
pub use survival::{SurvivalCurve, SurvivalOptions, estimate_survival};
pub use validate::{Validated, validate};
