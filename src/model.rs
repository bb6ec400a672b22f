use std::fmt;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::Serialize;
use statrs::function::erf::erfc;

use crate::{
    cohort::Cohort,
    data::SurvivalData,
    error::{Result, RiskError},
    metrics,
    optimization::{CoxOptimizer, OptimizationConfig, TieMethod},
    validate::validate,
};

/// z for a two-sided 95% interval
const Z_95: f64 = 1.959_963_984_540_054;

/// cox proportional hazards model - configure, then `fit`
#[derive(Debug, Clone)]
pub struct HazardModel {
    max_iterations: usize, // optimization limit
    tolerance: f64,        // convergence threshold (relative loglik change)
    ties: TieMethod,
}

impl Default for HazardModel {
    fn default() -> Self {
        let defaults = OptimizationConfig::default();
        Self {
            max_iterations: defaults.max_iterations,
            tolerance: defaults.tolerance,
            ties: defaults.ties,
        }
    }
}

impl HazardModel {
    /// new cox model w/ defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// max newton iterations before giving up
    pub fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.max_iterations = max_iter;
        self
    }

    /// how close is close enough for convergence
    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    pub fn with_ties(mut self, ties: TieMethod) -> Self {
        self.ties = ties;
        self
    }

    /// complete-case fit over the named covariates of a cohort
    pub fn fit_cohort<S: AsRef<str>>(
        &self,
        cohort: &Cohort,
        time_field: &str,
        event_field: &str,
        covariates: &[S],
    ) -> Result<HazardModelResult> {
        let required: Vec<&str> = [time_field, event_field]
            .into_iter()
            .chain(covariates.iter().map(|s| s.as_ref()))
            .collect();
        let valid = validate(cohort, &required)?.cohort;
        let data = SurvivalData::from_cohort(&valid, time_field, event_field, covariates)?;
        self.fit(&data)
    }

    /// fit the model to data - this does the actual work
    pub fn fit(&self, data: &SurvivalData) -> Result<HazardModelResult> {
        let p = data.n_features();
        if p == 0 {
            return Err(RiskError::invalid_parameter("covariates", "[]"));
        }
        if data.n_samples() < p + 1 {
            return Err(RiskError::insufficient_data(format!(
                "{} complete rows for {p} covariates - need at least {}",
                data.n_samples(),
                p + 1
            )));
        }
        if data.n_events() == 0 {
            return Err(RiskError::insufficient_data("no events observed - nothing to fit"));
        }

        let config = OptimizationConfig {
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            ties: self.ties,
            ..OptimizationConfig::default()
        };
        let fit = CoxOptimizer::new(config).optimize(data)?;

        let covariance = crate::optimization::invert(&fit.information)
            .map_err(|_| RiskError::fit("information matrix is singular at the optimum"))?;

        let mut rows = Vec::with_capacity(p);
        for (j, name) in data.feature_names().iter().enumerate() {
            let coefficient = fit.beta[j];
            let variance = covariance[[j, j]];
            if !(variance.is_finite() && variance > 0.0) {
                return Err(RiskError::fit(format!("non-positive variance for {name}")));
            }
            let standard_error = variance.sqrt();
            let z = coefficient / standard_error;
            rows.push(HazardRow {
                covariate: name.clone(),
                coefficient,
                hazard_ratio: coefficient.exp(),
                standard_error,
                z,
                p_value: two_sided_p(z),
                hr_lower_95: (coefficient - Z_95 * standard_error).exp(),
                hr_upper_95: (coefficient + Z_95 * standard_error).exp(),
            });
        }

        let linear_predictor = data.covariates().dot(&fit.beta);
        let concordance = metrics::harrell_c_index(linear_predictor.view(), data.times(), data.events()).ok();
        let covariate_means = data.covariate_means();
        let baseline = BaselineHazard::breslow(data, &fit.beta)?;

        log::info!(
            "cox fit: {} subjects, {} events, {} iterations, loglik {:.4}",
            data.n_samples(),
            data.n_events(),
            fit.iterations,
            fit.log_likelihood
        );

        Ok(HazardModelResult {
            rows,
            log_likelihood: fit.log_likelihood,
            null_log_likelihood: fit.null_log_likelihood,
            n_subjects: data.n_samples(),
            n_events: data.n_events(),
            iterations: fit.iterations,
            concordance,
            ties: self.ties,
            baseline,
            covariate_means,
        })
    }

    /// what convergence settings are we using?
    pub fn params(&self) -> (usize, f64, TieMethod) {
        (self.max_iterations, self.tolerance, self.ties)
    }
}

/// `fit_hazards(cohort, time, event, covariates)` with default settings
pub fn fit_hazards<S: AsRef<str>>(
    cohort: &Cohort,
    time_field: &str,
    event_field: &str,
    covariates: &[S],
) -> Result<HazardModelResult> {
    HazardModel::new().fit_cohort(cohort, time_field, event_field, covariates)
}

fn two_sided_p(z: f64) -> f64 {
    // P(|Z| > |z|) = erfc(|z| / sqrt 2)
    erfc(z.abs() / std::f64::consts::SQRT_2).clamp(0.0, 1.0)
}

/// one covariate of a fitted model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HazardRow {
    pub covariate: String,
    pub coefficient: f64,
    pub hazard_ratio: f64, // exp(coefficient)
    pub standard_error: f64,
    pub z: f64,
    pub p_value: f64, // wald test
    pub hr_lower_95: f64,
    pub hr_upper_95: f64,
}

/// breslow estimate of the baseline cumulative hazard at the mean covariates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaselineHazard {
    pub times: Vec<f64>,
    pub cumulative: Vec<f64>,
}

impl BaselineHazard {
    fn breslow(data: &SurvivalData, beta: &Array1<f64>) -> Result<Self> {
        let risk = data.centered_covariates().dot(beta).mapv(f64::exp);
        if risk.iter().any(|r| !r.is_finite()) {
            return Err(RiskError::numerical_error("baseline hazard: exp(linear predictor) overflowed"));
        }
        let mut times = Vec::with_capacity(data.risk_sets().len());
        let mut cumulative = Vec::with_capacity(data.risk_sets().len());
        let mut total = 0.0;
        for risk_set in data.risk_sets() {
            let denom: f64 = data.risk_set_members(risk_set).iter().map(|&i| risk[i]).sum();
            total += risk_set.deaths.len() as f64 / denom;
            times.push(risk_set.time);
            cumulative.push(total);
        }
        Ok(Self { times, cumulative })
    }

    /// step-function lookup, 0 before the first event
    pub fn at(&self, t: f64) -> f64 {
        match self.times.partition_point(|&s| s <= t) {
            0 => 0.0,
            k => self.cumulative[k - 1],
        }
    }
}

/// what the model learned
#[derive(Debug, Clone, Serialize)]
pub struct HazardModelResult {
    pub rows: Vec<HazardRow>,
    pub log_likelihood: f64,
    pub null_log_likelihood: f64,
    pub n_subjects: usize,
    pub n_events: usize,
    pub iterations: usize,
    pub concordance: Option<f64>,
    pub ties: TieMethod,
    pub baseline: BaselineHazard,
    /// training means; the baseline and survival predictions are centred on them
    pub covariate_means: Array1<f64>,
}

impl HazardModelResult {
    pub fn coefficients(&self) -> Array1<f64> {
        self.rows.iter().map(|r| r.coefficient).collect()
    }

    pub fn hazard_ratios(&self) -> Array1<f64> {
        self.rows.iter().map(|r| r.hazard_ratio).collect()
    }

    pub fn row(&self, covariate: &str) -> Option<&HazardRow> {
        self.rows.iter().find(|r| r.covariate == covariate)
    }

    /// 2 * (loglik - null loglik)
    pub fn likelihood_ratio(&self) -> f64 {
        2.0 * (self.log_likelihood - self.null_log_likelihood)
    }

    pub fn aic(&self) -> f64 {
        metrics::aic(self.log_likelihood, self.rows.len())
    }

    /// linear predictor for new subjects (rows = subjects, cols = covariates in fit order)
    pub fn linear_predictor(&self, covariates: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        if covariates.ncols() != self.rows.len() {
            return Err(RiskError::invalid_dimensions(format!(
                "feature count mismatch: expected {}, got {}",
                self.rows.len(),
                covariates.ncols()
            )));
        }
        Ok(covariates.dot(&self.coefficients()))
    }

    /// relative hazards exp(x·β)
    pub fn relative_hazard(&self, covariates: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        Ok(self.linear_predictor(covariates)?.mapv(f64::exp))
    }

    /// S(t | x) = exp(-H0(t) · exp((x - x̄)·β)) for each subject & time
    pub fn predict_survival(
        &self,
        covariates: ArrayView2<'_, f64>,
        times: ArrayView1<'_, f64>,
    ) -> Result<Array2<f64>> {
        // (x - x̄)·β, never exponentiating the raw x·β
        let shift = self.covariate_means.dot(&self.coefficients());
        let relative = self.linear_predictor(covariates)?.mapv(|eta| (eta - shift).exp());
        if relative.iter().any(|r| !r.is_finite()) {
            return Err(RiskError::numerical_error("relative hazard overflowed"));
        }
        let mut survival = Array2::zeros((covariates.nrows(), times.len()));
        for (k, &t) in times.iter().enumerate() {
            let h0 = self.baseline.at(t);
            for (i, &r) in relative.iter().enumerate() {
                survival[[i, k]] = (-h0 * r).exp();
            }
        }
        Ok(survival)
    }
}

impl fmt::Display for HazardModelResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cox proportional hazards model ({:?} ties)", self.ties)?;
        writeln!(f, "subjects: {}, events: {}, iterations: {}", self.n_subjects, self.n_events, self.iterations)?;
        writeln!(
            f,
            "{:<28} {:>10} {:>10} {:>10} {:>10}",
            "covariate", "coef", "exp(coef)", "se", "p"
        )?;
        writeln!(f, "{:-<72}", "")?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<28} {:>10.4} {:>10.4} {:>10.4} {:>10.4}",
                row.covariate, row.coefficient, row.hazard_ratio, row.standard_error, row.p_value
            )?;
        }
        write!(
            f,
            "log-likelihood {:.4} (null {:.4}), LR {:.4}",
            self.log_likelihood,
            self.null_log_likelihood,
            self.likelihood_ratio()
        )?;
        if let Some(c) = self.concordance {
            write!(f, ", concordance {c:.4}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array2, array};

    fn create_test_data() -> SurvivalData {
        let times = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let events = vec![true, false, true, true, false, true, true, false];
        let covariates = Array2::from_shape_vec((8, 2), vec![
            1.0, 0.0,
            0.0, 1.0,
            1.0, 1.0,
            -1.0, 0.0,
            0.0, -1.0,
            1.0, -1.0,
            -1.0, 1.0,
            0.0, 0.0,
        ]).unwrap();

        SurvivalData::new(times, events, covariates).unwrap()
            .with_feature_names(vec!["stress".into(), "isolation".into()]).unwrap()
    }

    #[test]
    fn test_model_creation() {
        let model = HazardModel::new()
            .with_max_iterations(20)
            .with_tolerance(1e-6)
            .with_ties(TieMethod::Breslow);

        assert_eq!(model.params(), (20, 1e-6, TieMethod::Breslow));
    }

    #[test]
    fn test_fit_rows_and_ratios() {
        let data = create_test_data();
        let result = HazardModel::new().fit(&data).unwrap();

        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0].covariate, "stress");
        for row in &result.rows {
            assert_relative_eq!(row.hazard_ratio, row.coefficient.exp(), epsilon = 1e-12);
            assert!(row.hazard_ratio > 0.0);
            assert!((0.0..=1.0).contains(&row.p_value));
            assert!(row.hr_lower_95 < row.hazard_ratio && row.hazard_ratio < row.hr_upper_95);
        }
        assert!(result.likelihood_ratio() >= 0.0);
    }

    #[test]
    fn test_too_few_rows() {
        let data = SurvivalData::new(
            vec![1.0, 2.0],
            vec![true, true],
            Array2::from_shape_vec((2, 2), vec![1.0, 0.0, 0.0, 1.0]).unwrap(),
        ).unwrap();
        let err = HazardModel::new().fit(&data).unwrap_err();
        assert!(matches!(err, RiskError::InsufficientData { .. }));
    }

    #[test]
    fn test_no_events() {
        let data = SurvivalData::new(
            vec![1.0, 2.0, 3.0],
            vec![false; 3],
            Array2::from_shape_vec((3, 1), vec![1.0, 0.0, 2.0]).unwrap(),
        ).unwrap();
        assert!(HazardModel::new().fit(&data).is_err());
    }

    #[test]
    fn test_p_value() {
        assert_relative_eq!(two_sided_p(0.0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(two_sided_p(Z_95), 0.05, epsilon = 1e-6);
        assert_relative_eq!(two_sided_p(-Z_95), 0.05, epsilon = 1e-6);
    }

    #[test]
    fn test_prediction_dimension_mismatch() {
        let result = HazardModel::new().fit(&create_test_data()).unwrap();
        let wrong = Array2::zeros((5, 3));
        assert!(result.linear_predictor(wrong.view()).is_err());
    }

    #[test]
    fn test_predicted_survival_non_increasing() {
        let result = HazardModel::new().fit(&create_test_data()).unwrap();
        let x = array![[1.0, 0.0], [0.0, 0.0], [-1.0, 1.0]];
        let times = array![0.0, 1.5, 3.0, 6.5, 10.0];
        let s = result.predict_survival(x.view(), times.view()).unwrap();
        for i in 0..3 {
            assert_relative_eq!(s[[i, 0]], 1.0, epsilon = 1e-12);
            for k in 1..times.len() {
                assert!(s[[i, k]] <= s[[i, k - 1]] + 1e-12);
                assert!((0.0..=1.0).contains(&s[[i, k]]));
            }
        }
    }

    #[test]
    fn test_breslow_likelihood_matches_partial_likelihood() {
        let data = create_test_data();
        let result = HazardModel::new().with_ties(TieMethod::Breslow).fit(&data).unwrap();
        let lp = result.linear_predictor(data.covariates()).unwrap();
        let loglik = metrics::log_partial_likelihood(&data, lp.view()).unwrap();
        assert_relative_eq!(result.log_likelihood, loglik, epsilon = 1e-8);
    }

    #[test]
    fn test_undeclared_covariate_is_schema_error() {
        let cohort = crate::synthetic::generate(60, 1);
        let err = fit_hazards(&cohort, "Time_To_Crisis", "Crisis_Event", &["Age", "Shoe_Size"]).unwrap_err();
        assert!(matches!(err, RiskError::Schema { .. }));
        assert_eq!(err.fields(), ["Shoe_Size"]);
    }

    #[test]
    fn test_survival_prediction_survives_large_covariate_offsets() {
        // shifting a covariate leaves the fit unchanged but makes the raw exp(x·β) overflow
        let data = create_test_data();
        let offset = 1.0e6;
        let mut shifted_x = data.covariates().to_owned();
        shifted_x.column_mut(0).mapv_inplace(|v| v + offset);
        let shifted = SurvivalData::new(data.times().to_vec(), data.events().to_vec(), shifted_x).unwrap();

        let plain = HazardModel::new().fit(&data).unwrap();
        let moved = HazardModel::new().fit(&shifted).unwrap();
        assert_relative_eq!(plain.rows[0].coefficient, moved.rows[0].coefficient, epsilon = 1e-6);

        let x = array![[1.0, 0.0], [0.0, 0.0], [-1.0, 1.0]];
        let mut x_moved = x.clone();
        x_moved.column_mut(0).mapv_inplace(|v| v + offset);
        let times = array![0.0, 1.5, 3.0, 6.5, 10.0];

        let expected = plain.predict_survival(x.view(), times.view()).unwrap();
        let got = moved.predict_survival(x_moved.view(), times.view()).unwrap();
        for (a, b) in expected.iter().zip(got.iter()) {
            assert!(b.is_finite());
            assert_relative_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_summary_display() {
        let result = HazardModel::new().fit(&create_test_data()).unwrap();
        let text = result.to_string();
        assert!(text.contains("stress"));
        assert!(text.contains("isolation"));
    }
}
