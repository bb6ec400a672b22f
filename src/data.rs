use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::cohort::{Cohort, SubjectId};
use crate::error::{Result, RiskError};

/// one distinct event time and who's exposed at it
#[derive(Debug, Clone, PartialEq)]
pub struct RiskSet {
    pub time: f64,
    pub size: usize,        // first `size` rows of the time-descending order
    pub deaths: Vec<usize>, // rows w/ an event exactly at `time`
}

/// survival data - times, events, and subject covariates
#[derive(Debug, Clone)]
pub struct SurvivalData {
    times: Array1<f64>,       // time to event/censoring
    events: Array1<bool>,     // true = event, false = censored
    covariates: Array2<f64>,  // subject features (n_samples x n_features)
    feature_names: Vec<String>,
    ids: Vec<SubjectId>,
    order: Vec<usize>,        // row indices, latest time first
    risk_sets: Vec<RiskSet>,  // precomputed, ascending by time
}

impl SurvivalData {
    /// make new survival data from raw vecs/arrays
    pub fn new(
        times: Vec<f64>,         // survival/censoring times
        events: Vec<bool>,       // true = event occurred, false = censored
        covariates: Array2<f64>, // feature matrix
    ) -> Result<Self> {
        let n_samples = times.len();

        if events.len() != n_samples {
            return Err(RiskError::invalid_dimensions(format!(
                "times len ({}) != events len ({})",
                n_samples,
                events.len()
            )));
        }

        if covariates.nrows() != n_samples {
            return Err(RiskError::invalid_dimensions(format!(
                "covariates rows ({}) != n_samples ({})",
                covariates.nrows(),
                n_samples
            )));
        }

        if times.iter().any(|&t| t < 0.0 || !t.is_finite()) {
            return Err(RiskError::numerical_error(
                "survival times must be non-negative & finite",
            ));
        }

        if covariates.iter().any(|x| !x.is_finite()) {
            return Err(RiskError::numerical_error("covariates must be finite"));
        }

        let feature_names = (0..covariates.ncols()).map(|j| format!("x{j}")).collect();
        let ids = (0..n_samples as u64).map(SubjectId).collect();

        let mut data = Self {
            times: Array1::from(times),
            events: Array1::from(events),
            covariates,
            feature_names,
            ids,
            order: Vec::new(),
            risk_sets: Vec::new(),
        };

        data.compute_risk_sets();
        Ok(data)
    }

    /// complete-case design matrix from a cohort.
    ///
    /// rows missing the time, the event flag or any covariate are dropped;
    /// undeclared fields, text-typed covariates and negative times are
    /// schema errors.
    pub fn from_cohort<S: AsRef<str>>(
        cohort: &Cohort,
        time_field: &str,
        event_field: &str,
        covariates: &[S],
    ) -> Result<Self> {
        let names: Vec<&str> = covariates.iter().map(|s| s.as_ref()).collect();
        let schema = cohort.schema();

        let fields: Vec<&str> = std::iter::once(time_field)
            .chain(std::iter::once(event_field))
            .chain(names.iter().copied())
            .collect();
        let undeclared: Vec<&str> = fields.iter().copied().filter(|f| !schema.contains(f)).collect();
        if !undeclared.is_empty() {
            return Err(RiskError::schema(undeclared, "required field not in schema"));
        }
        let not_numeric: Vec<&str> = fields
            .iter()
            .copied()
            .filter(|f| schema.kind(f).is_some_and(|k| !k.is_numeric()))
            .collect();
        if !not_numeric.is_empty() {
            return Err(RiskError::schema(not_numeric, "field is not numeric"));
        }

        let mut times = Vec::with_capacity(cohort.len());
        let mut events = Vec::with_capacity(cohort.len());
        let mut flat = Vec::with_capacity(cohort.len() * names.len());
        let mut ids = Vec::with_capacity(cohort.len());

        for record in cohort {
            let (Some(time), Some(event)) = (record.number(time_field), record.number(event_field))
            else {
                continue;
            };
            let row: Option<Vec<f64>> = names.iter().map(|f| record.number(f)).collect();
            let Some(row) = row else { continue };

            if time < 0.0 {
                return Err(RiskError::schema(
                    [time_field],
                    format!("subject {} has negative time {time}", record.id()),
                ));
            }
            times.push(time);
            events.push(event != 0.0);
            flat.extend(row);
            ids.push(record.id());
        }

        let excluded = cohort.len() - times.len();
        if excluded > 0 {
            log::debug!("complete-case filter excluded {excluded} rows");
        }

        let covariates = Array2::from_shape_vec((times.len(), names.len()), flat)
            .map_err(|e| RiskError::invalid_dimensions(e.to_string()))?;
        let mut data = Self::new(times, events, covariates)?;
        data.feature_names = names.iter().map(|s| s.to_string()).collect();
        data.ids = ids;
        Ok(data)
    }

    /// label the covariate columns
    pub fn with_feature_names(mut self, names: Vec<String>) -> Result<Self> {
        if names.len() != self.n_features() {
            return Err(RiskError::invalid_dimensions(format!(
                "{} names for {} features",
                names.len(),
                self.n_features()
            )));
        }
        self.feature_names = names;
        Ok(self)
    }

    /// sort once, then every risk set is a prefix of the descending order
    fn compute_risk_sets(&mut self) {
        let mut order: Vec<usize> = (0..self.n_samples()).collect();
        order.sort_by(|&a, &b| self.times[b].total_cmp(&self.times[a]));

        let mut risk_sets = Vec::new();
        let mut i = 0;
        while i < order.len() {
            let time = self.times[order[i]];
            let mut j = i;
            while j < order.len() && self.times[order[j]] == time {
                j += 1;
            }
            let deaths: Vec<usize> = order[i..j]
                .iter()
                .copied()
                .filter(|&r| self.events[r])
                .collect();
            if !deaths.is_empty() {
                risk_sets.push(RiskSet { time, size: j, deaths });
            }
            i = j;
        }
        risk_sets.reverse();

        self.order = order;
        self.risk_sets = risk_sets;
    }

    /// how many subjects
    pub fn n_samples(&self) -> usize {
        self.times.len()
    }

    /// how many features per subject
    pub fn n_features(&self) -> usize {
        self.covariates.ncols()
    }

    pub fn n_events(&self) -> usize {
        self.events.iter().filter(|&&e| e).count()
    }

    /// survival/censoring times
    pub fn times(&self) -> ArrayView1<'_, f64> {
        self.times.view()
    }

    /// event indicators (true = event, false = censored)
    pub fn events(&self) -> ArrayView1<'_, bool> {
        self.events.view()
    }

    /// subject feature matrix
    pub fn covariates(&self) -> ArrayView2<'_, f64> {
        self.covariates.view()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn ids(&self) -> &[SubjectId] {
        &self.ids
    }

    /// precomputed risk sets for optimization
    pub fn risk_sets(&self) -> &[RiskSet] {
        &self.risk_sets
    }

    /// members of a risk set (everyone with time >= its event time)
    pub fn risk_set_members(&self, risk_set: &RiskSet) -> &[usize] {
        &self.order[..risk_set.size]
    }

    /// unique event times in order
    pub fn event_times(&self) -> Vec<f64> {
        self.risk_sets.iter().map(|r| r.time).collect()
    }

    /// grab a subset of subjects by indices
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        if indices.iter().any(|&i| i >= self.n_samples()) {
            return Err(RiskError::invalid_dimensions("subset index out of bounds"));
        }

        let times: Vec<f64> = indices.iter().map(|&i| self.times[i]).collect();
        let events: Vec<bool> = indices.iter().map(|&i| self.events[i]).collect();
        let covariates = self.covariates.select(Axis(0), indices);

        let mut data = Self::new(times, events, covariates)?;
        data.feature_names = self.feature_names.clone();
        data.ids = indices.iter().map(|&i| self.ids[i]).collect();
        Ok(data)
    }

    /// column means - cox is shift invariant so the optimizer works on centred data
    pub fn covariate_means(&self) -> Array1<f64> {
        self.covariates
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.n_features()))
    }

    /// copy of the covariates w/ each column centred on its mean
    pub fn centered_covariates(&self) -> Array2<f64> {
        &self.covariates - &self.covariate_means()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::{Schema, SubjectRecord};
    use approx::assert_relative_eq;

    fn create_test_data() -> SurvivalData {
        let times = vec![1.0, 2.0, 3.0, 3.0, 5.0];
        let events = vec![true, false, true, true, false];
        let covariates = Array2::from_shape_vec((5, 2), vec![
            1.0, 2.0,
            3.0, 4.0,
            5.0, 6.0,
            7.0, 8.0,
            9.0, 10.0,
        ]).unwrap();

        SurvivalData::new(times, events, covariates).unwrap()
    }

    #[test]
    fn test_survival_data_creation() {
        let data = create_test_data();
        assert_eq!(data.n_samples(), 5);
        assert_eq!(data.n_features(), 2);
        assert_eq!(data.n_events(), 3);
        assert_eq!(data.event_times(), vec![1.0, 3.0]);
    }

    #[test]
    fn test_risk_sets_are_prefixes() {
        let data = create_test_data();
        let sets = data.risk_sets();
        assert_eq!(sets.len(), 2);

        // everyone is at risk at t=1
        assert_eq!(sets[0].size, 5);
        assert_eq!(sets[0].deaths, vec![0]);

        // tied deaths at t=3, rows 2,3,4 at risk
        let mut members = data.risk_set_members(&sets[1]).to_vec();
        members.sort();
        assert_eq!(members, vec![2, 3, 4]);
        let mut deaths = sets[1].deaths.clone();
        deaths.sort();
        assert_eq!(deaths, vec![2, 3]);
    }

    #[test]
    fn test_invalid_dimensions() {
        let times = vec![1.0, 2.0];
        let events = vec![true]; // wrong length
        let covariates = Array2::zeros((2, 2));

        assert!(SurvivalData::new(times, events, covariates).is_err());
    }

    #[test]
    fn test_invalid_times() {
        let times = vec![-1.0, 2.0]; // negative time
        let events = vec![true, false];
        let covariates = Array2::zeros((2, 2));

        assert!(SurvivalData::new(times, events, covariates).is_err());
    }

    #[test]
    fn test_zero_time_allowed() {
        let data = SurvivalData::new(vec![0.0, 2.0], vec![true, false], Array2::zeros((2, 1))).unwrap();
        assert_eq!(data.event_times(), vec![0.0]);
    }

    #[test]
    fn test_subset() {
        let data = create_test_data();
        let subset = data.subset(&[0, 2, 4]).unwrap();

        assert_eq!(subset.n_samples(), 3);
        assert_eq!(subset.times()[0], 1.0);
        assert_eq!(subset.times()[1], 3.0);
        assert_eq!(subset.times()[2], 5.0);
        assert_eq!(subset.ids(), &[SubjectId(0), SubjectId(2), SubjectId(4)]);
    }

    #[test]
    fn test_centering() {
        let data = create_test_data();
        let centred = data.centered_covariates();
        for j in 0..data.n_features() {
            assert_relative_eq!(centred.column(j).mean().unwrap(), 0.0, epsilon = 1e-10);
        }
        let means = data.covariate_means();
        assert_relative_eq!(means[0], 5.0, epsilon = 1e-10);
        assert_relative_eq!(means[1], 6.0, epsilon = 1e-10);
    }

    #[test]
    fn test_from_cohort_complete_case() {
        let rows = vec![
            SubjectRecord::new(SubjectId(10)).with("Time_To_Crisis", 5).with("Crisis_Event", true).with("Age", 30),
            SubjectRecord::new(SubjectId(11)).with("Time_To_Crisis", 8).with("Crisis_Event", false),
            SubjectRecord::new(SubjectId(12)).with("Time_To_Crisis", 9).with("Crisis_Event", false).with("Age", 50),
        ];
        let cohort = Cohort::new(Schema::crisis(), rows).unwrap();
        let data = SurvivalData::from_cohort(&cohort, "Time_To_Crisis", "Crisis_Event", &["Age"]).unwrap();

        assert_eq!(data.n_samples(), 2);
        assert_eq!(data.ids(), &[SubjectId(10), SubjectId(12)]);
        assert_eq!(data.feature_names(), &["Age".to_string()]);
        assert_eq!(data.covariates()[[1, 0]], 50.0);
    }

    #[test]
    fn test_from_cohort_rejects_undeclared_field() {
        let rows = vec![SubjectRecord::new(SubjectId(1)).with("Time_To_Crisis", 5).with("Crisis_Event", true)];
        let cohort = Cohort::new(Schema::crisis(), rows).unwrap();
        let err = SurvivalData::from_cohort(&cohort, "Time_To_Crisis", "Crisis_Event", &["Age", "Shoe_Size"]).unwrap_err();
        assert!(matches!(err, RiskError::Schema { .. }));
        assert_eq!(err.fields(), ["Shoe_Size"]);
    }

    #[test]
    fn test_from_cohort_rejects_text_covariate() {
        let rows = vec![SubjectRecord::new(SubjectId(1)).with("Time_To_Crisis", 5).with("Crisis_Event", true)];
        let cohort = Cohort::new(Schema::crisis(), rows).unwrap();
        let err = SurvivalData::from_cohort(&cohort, "Time_To_Crisis", "Crisis_Event", &["Sex"]).unwrap_err();
        assert_eq!(err.fields(), ["Sex"]);
    }
}
