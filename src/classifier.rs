//! gradient-boosted risk classifier
//!
//! newton boosting of shallow regression trees. binary outcomes are fit on
//! the log-odds scale with log-loss, anything else (the 0-10 distress score)
//! with squared error. the cohort is split once with a seeded shuffle and
//! the held-out part is only used for the reported metrics.

use std::fmt;
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::{
    cohort::{Cohort, SubjectRecord},
    error::{Result, RiskError},
    metrics::{self, HeldOutMetrics},
    tree::{RegressionTree, TreeParams},
    validate::validate,
};

/// training loss, picked from the outcome values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    Logistic,
    SquaredError,
}

impl Objective {
    /// 0/1 outcomes get log-loss, everything else squared error
    pub fn detect(targets: &[f64]) -> Self {
        if targets.iter().all(|&y| y == 0.0 || y == 1.0) {
            Objective::Logistic
        } else {
            Objective::SquaredError
        }
    }

    /// margin -> reported prediction
    pub fn transform(self, margin: f64) -> f64 {
        match self {
            Objective::Logistic => sigmoid(margin),
            Objective::SquaredError => margin,
        }
    }

    fn base_score(self, targets: &[f64]) -> f64 {
        let mean = targets.iter().sum::<f64>() / targets.len() as f64;
        match self {
            Objective::Logistic => (mean / (1.0 - mean)).ln(),
            Objective::SquaredError => mean,
        }
    }

    fn gradients(self, margins: &[f64], targets: &[f64]) -> (Vec<f64>, Vec<f64>) {
        margins
            .iter()
            .zip(targets)
            .map(|(&m, &y)| match self {
                Objective::Logistic => {
                    let p = sigmoid(m);
                    (p - y, (p * (1.0 - p)).max(1e-16))
                }
                Objective::SquaredError => (m - y, 1.0),
            })
            .unzip()
    }

    fn loss(self, margins: &[f64], targets: &[f64]) -> f64 {
        let total: f64 = margins
            .iter()
            .zip(targets)
            .map(|(&m, &y)| match self {
                // log(1 + e^m) - y m, stable for large |m|
                Objective::Logistic => m.max(0.0) + (-m.abs()).exp().ln_1p() - y * m,
                Objective::SquaredError => 0.5 * (m - y).powi(2),
            })
            .sum();
        total / targets.len() as f64
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// boosting hyper-parameters (xgboost defaults)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostingParams {
    pub n_trees: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub lambda: f64,
    pub min_child_weight: f64,
    pub min_split_gain: f64,
    /// stop once a round improves training loss by less than this
    pub tolerance: f64,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            learning_rate: 0.3,
            max_depth: 6,
            lambda: 1.0,
            min_child_weight: 1.0,
            min_split_gain: 0.0,
            tolerance: 1e-7,
        }
    }
}

impl BoostingParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_trees == 0 {
            return Err(RiskError::invalid_parameter("n_trees", self.n_trees));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(RiskError::invalid_parameter("learning_rate", self.learning_rate));
        }
        if self.lambda < 0.0 {
            return Err(RiskError::invalid_parameter("lambda", self.lambda));
        }
        if self.min_child_weight < 0.0 {
            return Err(RiskError::invalid_parameter("min_child_weight", self.min_child_weight));
        }
        Ok(())
    }

    fn tree_params(&self) -> TreeParams {
        TreeParams {
            max_depth: self.max_depth,
            lambda: self.lambda,
            min_child_weight: self.min_child_weight,
            min_split_gain: self.min_split_gain,
            learning_rate: self.learning_rate,
        }
    }
}

/// trainer - configure, then `train`
#[derive(Debug, Clone)]
pub struct RiskClassifier {
    params: BoostingParams,
    test_fraction: f64,
    seed: u64,
}

impl Default for RiskClassifier {
    fn default() -> Self {
        Self {
            params: BoostingParams::default(),
            test_fraction: 0.3,
            seed: 42,
        }
    }
}

impl RiskClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(mut self, params: BoostingParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_test_fraction(mut self, fraction: f64) -> Self {
        self.test_fraction = fraction;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_n_trees(mut self, n_trees: usize) -> Self {
        self.params.n_trees = n_trees;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.params.learning_rate = learning_rate;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.params.max_depth = max_depth;
        self
    }

    pub fn params(&self) -> &BoostingParams {
        &self.params
    }

    /// complete-case split, boost on the train part, score the test part
    pub fn train<S: AsRef<str>>(
        &self,
        cohort: &Cohort,
        features: &[S],
        outcome_field: &str,
    ) -> Result<RiskModel> {
        self.params.validate()?;
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(RiskError::invalid_parameter("test_fraction", self.test_fraction));
        }
        let features: Vec<String> = features.iter().map(|f| f.as_ref().to_string()).collect();
        if features.is_empty() {
            return Err(RiskError::invalid_parameter("features", "[]"));
        }

        let (x, y) = design_matrix(cohort, &features, outcome_field)?;
        let n = y.len();
        let n_test = (n as f64 * self.test_fraction).ceil() as usize;
        if n < 2 || n_test >= n {
            return Err(RiskError::insufficient_data(format!(
                "{n} complete rows cannot be split with test fraction {}",
                self.test_fraction
            )));
        }

        let objective = Objective::detect(&y);
        if objective == Objective::Logistic && !has_both_classes(&y) {
            return Err(RiskError::degenerate_split(format!(
                "`{outcome_field}` has a single class in the cohort"
            )));
        }

        let mut shuffled: Vec<usize> = (0..n).collect();
        shuffled.shuffle(&mut StdRng::seed_from_u64(self.seed));
        let (test_idx, train_idx) = shuffled.split_at(n_test);

        let x_train = x.select(Axis(0), train_idx);
        let y_train: Vec<f64> = train_idx.iter().map(|&i| y[i]).collect();
        let x_test = x.select(Axis(0), test_idx);
        let y_test: Vec<f64> = test_idx.iter().map(|&i| y[i]).collect();

        if objective == Objective::Logistic {
            if !has_both_classes(&y_train) {
                return Err(RiskError::degenerate_split("training partition has a single class"));
            }
            if !has_both_classes(&y_test) {
                return Err(RiskError::degenerate_split("test partition has a single class"));
            }
        }

        let base_score = objective.base_score(&y_train);
        let trees = self.boost(objective, base_score, &x_train, &y_train);

        let mut model = RiskModel {
            features,
            objective,
            base_score,
            trees: trees.into(),
            held_out: HeldOutMetrics {
                n_test,
                accuracy: 0.0,
                auc: None,
                log_loss: None,
                rmse: None,
            },
            feature_importances: Vec::new(),
            n_train: y_train.len(),
        };
        model.feature_importances = model.gain_importances();
        model.held_out = model.evaluate(&x_test, &y_test)?;

        log::info!(
            "risk classifier: {} trees ({:?}), train {}, test {}, held-out accuracy {:.3}",
            model.trees.len(),
            objective,
            model.n_train,
            n_test,
            model.held_out.accuracy
        );
        Ok(model)
    }

    fn boost(
        &self,
        objective: Objective,
        base_score: f64,
        x: &Array2<f64>,
        y: &[f64],
    ) -> Vec<RegressionTree> {
        let tree_params = self.params.tree_params();
        let rows: Vec<usize> = (0..y.len()).collect();
        let mut margins = vec![base_score; y.len()];
        let mut loss = objective.loss(&margins, y);
        let mut trees = Vec::with_capacity(self.params.n_trees);

        for round in 0..self.params.n_trees {
            let (grad, hess) = objective.gradients(&margins, y);
            let tree = RegressionTree::fit(x.view(), &grad, &hess, &rows, &tree_params);
            if tree.is_stump() {
                log::debug!("round {round}: no split with positive gain, stopping");
                break;
            }

            for (i, margin) in margins.iter_mut().enumerate() {
                *margin += tree.predict_row(x.row(i));
            }
            trees.push(tree);

            let next = objective.loss(&margins, y);
            log::debug!("round {round}: training loss {next:.6}");
            if loss - next < self.params.tolerance {
                log::debug!("round {round}: loss improvement below tolerance, stopping");
                break;
            }
            loss = next;
        }
        trees
    }
}

/// `train_risk_model(cohort, features, outcome, test_fraction, seed)` with default boosting
pub fn train_risk_model<S: AsRef<str>>(
    cohort: &Cohort,
    features: &[S],
    outcome_field: &str,
    test_fraction: f64,
    seed: u64,
) -> Result<RiskModel> {
    RiskClassifier::new()
        .with_test_fraction(test_fraction)
        .with_seed(seed)
        .train(cohort, features, outcome_field)
}

fn has_both_classes(y: &[f64]) -> bool {
    y.iter().any(|&v| v == 0.0) && y.iter().any(|&v| v == 1.0)
}

/// complete-case feature matrix + outcome vector; every column must be numeric
fn design_matrix(cohort: &Cohort, features: &[String], outcome_field: &str) -> Result<(Array2<f64>, Vec<f64>)> {
    let mut required: Vec<&str> = features.iter().map(String::as_str).collect();
    required.push(outcome_field);
    let clean = validate(cohort, &required)?.cohort;

    let schema = clean.schema();
    let non_numeric: Vec<&str> = required
        .iter()
        .copied()
        .filter(|f| schema.kind(f).is_some_and(|k| !k.is_numeric()))
        .collect();
    if !non_numeric.is_empty() {
        return Err(RiskError::schema(non_numeric, "classifier columns must be numeric"));
    }

    let mut x = Array2::zeros((clean.len(), features.len()));
    let mut y = Vec::with_capacity(clean.len());
    for (i, record) in clean.iter().enumerate() {
        for (j, feature) in features.iter().enumerate() {
            // validated above: present and numeric
            x[[i, j]] = record.number(feature).unwrap_or(f64::NAN);
        }
        y.push(record.number(outcome_field).unwrap_or(f64::NAN));
    }
    Ok((x, y))
}

/// a trained ensemble - opaque, cheap to clone, never mutated
#[derive(Debug, Clone)]
pub struct RiskModel {
    features: Vec<String>,
    objective: Objective,
    base_score: f64,
    trees: Arc<[RegressionTree]>,
    held_out: HeldOutMetrics,
    feature_importances: Vec<(String, f64)>,
    n_train: usize,
}

impl RiskModel {
    pub fn feature_names(&self) -> &[String] {
        &self.features
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn n_train(&self) -> usize {
        self.n_train
    }

    pub(crate) fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    /// initial margin every tree adds onto
    pub fn base_score(&self) -> f64 {
        self.base_score
    }

    /// expected margin over the training rows
    pub fn baseline(&self) -> f64 {
        self.base_score + self.trees.iter().map(RegressionTree::expected_value).sum::<f64>()
    }

    pub fn held_out(&self) -> &HeldOutMetrics {
        &self.held_out
    }

    pub fn accuracy(&self) -> f64 {
        self.held_out.accuracy
    }

    /// (feature, share of total split gain), highest first
    pub fn feature_importances(&self) -> &[(String, f64)] {
        &self.feature_importances
    }

    /// raw ensemble output (log-odds for the logistic objective)
    pub fn predict_margin(&self, record: &SubjectRecord) -> Result<f64> {
        let row = self.feature_row(record).map_err(|field| {
            RiskError::schema([field], format!("subject {} has no numeric value", record.id()))
        })?;
        Ok(self.margin_row(row.view()))
    }

    /// probability (logistic) or predicted value (squared error)
    pub fn predict(&self, record: &SubjectRecord) -> Result<f64> {
        Ok(self.objective.transform(self.predict_margin(record)?))
    }

    /// feature values in training order; Err carries the offending field
    pub(crate) fn feature_row(&self, record: &SubjectRecord) -> std::result::Result<Array1<f64>, &str> {
        self.features
            .iter()
            .map(|f| record.number(f).ok_or(f.as_str()))
            .collect::<std::result::Result<Vec<f64>, &str>>()
            .map(Array1::from)
    }

    pub(crate) fn margin_row(&self, row: ArrayView1<'_, f64>) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
    }

    fn gain_importances(&self) -> Vec<(String, f64)> {
        let mut totals = vec![0.0; self.features.len()];
        for tree in self.trees.iter() {
            tree.accumulate_gain(&mut totals);
        }
        let sum: f64 = totals.iter().sum();
        let mut ranked: Vec<(String, f64)> = self
            .features
            .iter()
            .cloned()
            .zip(totals.into_iter().map(|g| if sum > 0.0 { g / sum } else { 0.0 }))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    fn evaluate(&self, x: &Array2<f64>, y: &[f64]) -> Result<HeldOutMetrics> {
        let predictions: Vec<f64> = x
            .rows()
            .into_iter()
            .map(|row| self.objective.transform(self.margin_row(row)))
            .collect();
        Ok(match self.objective {
            Objective::Logistic => HeldOutMetrics {
                n_test: y.len(),
                accuracy: metrics::accuracy(&predictions, y)?,
                auc: Some(metrics::roc_auc(&predictions, y)?),
                log_loss: Some(metrics::log_loss(&predictions, y)?),
                rmse: None,
            },
            Objective::SquaredError => HeldOutMetrics {
                n_test: y.len(),
                accuracy: metrics::rounded_accuracy(&predictions, y)?,
                auc: None,
                log_loss: None,
                rmse: Some(metrics::rmse(&predictions, y)?),
            },
        })
    }
}

impl fmt::Display for RiskModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "gradient boosted risk model ({:?}, {} trees)", self.objective, self.trees.len())?;
        write!(f, "held-out accuracy: {:.3} (n = {})", self.held_out.accuracy, self.held_out.n_test)?;
        if let Some(auc) = self.held_out.auc {
            write!(f, ", auc: {auc:.3}")?;
        }
        if let Some(rmse) = self.held_out.rmse {
            write!(f, ", rmse: {rmse:.3}")?;
        }
        writeln!(f)?;
        for (name, score) in &self.feature_importances {
            writeln!(f, "  {name:<28} {score:>8.4}")?;
        }
        Ok(())
    }
}
