//! Kaplan-Meier survival curves, optionally stratified by a categorical field.
//!
//! A [`SurvivalCurve`] keeps its sorted `(time, event)` observations and
//! produces the step function lazily through [`KaplanMeierSteps`]. The
//! iterator is `Clone`, and calling [`SurvivalCurve::points`] again starts a
//! fresh pass, so consumers can walk a curve as many times as they like.
//!
//! Tied times are batched: every event and censoring at a timestamp is
//! counted before the survival estimate moves. Censoring-only times still
//! get a point (with no drop) so that a cohort without events shows a flat
//! curve over its whole follow-up.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde::Deserialize;

use crate::cohort::Cohort;
use crate::error::{Result, RiskError};
use crate::validate::validate;

const Z_95: f64 = 1.959_963_984_540_054;

/// label of the unstratified curve
pub const OVERALL: &str = "Overall";

/// Parameters of [`estimate_survival`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, Deserialize)]
#[serde(default)]
pub struct SurvivalOptions {
    pub time_field: String,
    pub event_field: String,
    pub group_field: Option<String>,
    /// strata smaller than this are left out of the result
    pub min_group_size: usize,
}

impl Default for SurvivalOptions {
    fn default() -> Self {
        Self {
            time_field: "Time_To_Crisis".to_string(),
            event_field: "Crisis_Event".to_string(),
            group_field: None,
            min_group_size: 5,
        }
    }
}

impl SurvivalOptions {
    pub fn grouped_by(mut self, field: impl Into<String>) -> Self {
        self.group_field = Some(field.into());
        self
    }

    pub fn with_min_group_size(mut self, size: usize) -> Self {
        self.min_group_size = size;
        self
    }

    /// fields a cohort must carry for this analysis
    pub fn required_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.time_field.as_str(), self.event_field.as_str()];
        fields.extend(self.group_field.as_deref());
        fields
    }
}

/// One step of a Kaplan-Meier curve.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct SurvivalPoint {
    pub time: f64,
    pub survival: f64,
    pub at_risk: usize,
    pub events: usize,
    pub censored: usize,
    /// Greenwood standard error of `survival`
    pub std_error: f64,
    /// 95% log-log confidence band
    pub lower_95: f64,
    pub upper_95: f64,
}

/// Kaplan-Meier curve for one stratum.
#[derive(Debug, Clone)]
pub struct SurvivalCurve {
    group_label: String,
    observations: Arc<[(f64, bool)]>, // sorted by time
}

impl SurvivalCurve {
    /// build a curve from `(time, event_occurred)` pairs
    pub fn from_observations(group_label: impl Into<String>, mut observations: Vec<(f64, bool)>) -> Self {
        observations.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self {
            group_label: group_label.into(),
            observations: observations.into(),
        }
    }

    pub fn group_label(&self) -> &str {
        &self.group_label
    }

    pub fn n_subjects(&self) -> usize {
        self.observations.len()
    }

    pub fn n_events(&self) -> usize {
        self.observations.iter().filter(|(_, e)| *e).count()
    }

    /// lazy pass over the steps, starting with the origin (0, 1.0)
    pub fn points(&self) -> KaplanMeierSteps<'_> {
        KaplanMeierSteps {
            observations: &self.observations,
            pos: 0,
            survival: 1.0,
            greenwood: 0.0,
            origin_done: false,
        }
    }

    pub fn to_vec(&self) -> Vec<SurvivalPoint> {
        self.points().collect()
    }

    /// S(t) - right-continuous step lookup
    pub fn survival_at(&self, t: f64) -> f64 {
        self.points()
            .take_while(|p| p.time <= t)
            .last()
            .map_or(1.0, |p| p.survival)
    }

    /// first time the curve reaches 50% or below
    pub fn median_survival(&self) -> Option<f64> {
        self.points().find(|p| p.survival <= 0.5).map(|p| p.time)
    }
}

impl Serialize for SurvivalCurve {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("SurvivalCurve", 2)?;
        state.serialize_field("group", &self.group_label)?;
        state.serialize_field("points", &self.to_vec())?;
        state.end()
    }
}

/// Restartable iterator over the steps of a [`SurvivalCurve`].
#[derive(Debug, Clone)]
pub struct KaplanMeierSteps<'a> {
    observations: &'a [(f64, bool)],
    pos: usize,
    survival: f64,
    greenwood: f64, // running sum of d / (n (n - d))
    origin_done: bool,
}

impl KaplanMeierSteps<'_> {
    fn band(&self) -> (f64, f64, f64) {
        let s = self.survival;
        if s <= 0.0 || s >= 1.0 {
            return (0.0, s, s);
        }
        let std_error = s * self.greenwood.sqrt();
        let log_s = s.ln();
        let c = Z_95 * self.greenwood.sqrt() / log_s.abs();
        (std_error, s.powf(c.exp()), s.powf((-c).exp()))
    }
}

impl Iterator for KaplanMeierSteps<'_> {
    type Item = SurvivalPoint;

    fn next(&mut self) -> Option<SurvivalPoint> {
        let total = self.observations.len();
        if !self.origin_done {
            self.origin_done = true;
            return Some(SurvivalPoint {
                time: 0.0,
                survival: 1.0,
                at_risk: total,
                events: 0,
                censored: 0,
                std_error: 0.0,
                lower_95: 1.0,
                upper_95: 1.0,
            });
        }
        if self.pos >= total {
            return None;
        }

        let time = self.observations[self.pos].0;
        let at_risk = total - self.pos;
        let mut events = 0;
        let mut end = self.pos;
        while end < total && self.observations[end].0 == time {
            if self.observations[end].1 {
                events += 1;
            }
            end += 1;
        }
        let censored = end - self.pos - events;
        self.pos = end;

        if events > 0 {
            let (n, d) = (at_risk as f64, events as f64);
            self.survival *= 1.0 - d / n;
            if at_risk > events {
                self.greenwood += d / (n * (n - d));
            }
        }
        let (std_error, lower_95, upper_95) = self.band();

        Some(SurvivalPoint {
            time,
            survival: self.survival,
            at_risk,
            events,
            censored,
            std_error,
            lower_95,
            upper_95,
        })
    }
}

/// Kaplan-Meier curves keyed by group label (`"Overall"` when unstratified).
///
/// Rows missing the time, event or group value are excluded. Strata with
/// fewer than `min_group_size` subjects are dropped from the result.
pub fn estimate_survival(cohort: &Cohort, options: &SurvivalOptions) -> Result<BTreeMap<String, SurvivalCurve>> {
    let required = options.required_fields();
    let valid = validate(cohort, &required)?.cohort;

    let schema = valid.schema();
    for field in [&options.time_field, &options.event_field] {
        if schema.kind(field).is_some_and(|k| !k.is_numeric()) {
            return Err(RiskError::schema([field.as_str()], "field is not numeric"));
        }
    }

    let mut strata: BTreeMap<String, Vec<(f64, bool)>> = BTreeMap::new();
    for record in &valid {
        let (Some(time), Some(event)) = (
            record.number(&options.time_field),
            record.number(&options.event_field),
        ) else {
            continue;
        };
        if time < 0.0 || !time.is_finite() {
            return Err(RiskError::schema(
                [options.time_field.as_str()],
                format!("subject {} has invalid time {time}", record.id()),
            ));
        }
        let label = match &options.group_field {
            Some(field) => match record.get(field) {
                Some(value) => value.label(),
                None => continue,
            },
            None => OVERALL.to_string(),
        };
        strata.entry(label).or_default().push((time, event != 0.0));
    }

    let grouped = options.group_field.is_some();
    let curves = strata
        .into_iter()
        .filter(|(label, obs)| {
            let keep = !grouped || obs.len() >= options.min_group_size;
            if !keep {
                log::info!(
                    "dropping stratum {label:?}: {} subjects < min_group_size {}",
                    obs.len(),
                    options.min_group_size
                );
            }
            keep
        })
        .map(|(label, obs)| (label.clone(), SurvivalCurve::from_observations(label, obs)))
        .collect();

    Ok(curves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::{Schema, SubjectId, SubjectRecord};
    use approx::assert_relative_eq;

    fn curve(obs: &[(f64, bool)]) -> SurvivalCurve {
        SurvivalCurve::from_observations(OVERALL, obs.to_vec())
    }

    #[test]
    fn test_textbook_example() {
        // 6 subjects: events at 1, 3, 3; censored at 2, 4, 5
        let c = curve(&[(3.0, true), (1.0, true), (2.0, false), (3.0, true), (4.0, false), (5.0, false)]);
        let pts = c.to_vec();

        assert_eq!(pts.len(), 6); // origin + 5 distinct times
        assert_eq!(pts[0].time, 0.0);
        assert_eq!(pts[0].survival, 1.0);

        assert_relative_eq!(pts[1].survival, 5.0 / 6.0, epsilon = 1e-12);
        assert_eq!((pts[1].at_risk, pts[1].events), (6, 1));

        // censoring at t=2 shrinks the risk set w/o a drop
        assert_relative_eq!(pts[2].survival, 5.0 / 6.0, epsilon = 1e-12);
        assert_eq!(pts[2].censored, 1);

        // tied events at t=3 batched: 4 at risk, 2 deaths
        assert_eq!((pts[3].at_risk, pts[3].events), (4, 2));
        assert_relative_eq!(pts[3].survival, 5.0 / 6.0 * 0.5, epsilon = 1e-12);
        assert_relative_eq!(pts[5].survival, 5.0 / 12.0, epsilon = 1e-12);
    }

    #[test]
    fn test_non_increasing_and_bounded() {
        let c = curve(&[(5.0, true), (2.0, true), (9.0, false), (2.0, false), (7.0, true), (1.0, true)]);
        let pts = c.to_vec();
        assert_eq!(pts[0].survival, 1.0);
        for w in pts.windows(2) {
            assert!(w[1].time >= w[0].time);
            assert!(w[1].survival <= w[0].survival);
        }
        for p in &pts {
            assert!((0.0..=1.0).contains(&p.survival));
            assert!(p.lower_95 <= p.survival + 1e-12 && p.survival <= p.upper_95 + 1e-12);
        }
    }

    #[test]
    fn test_no_events_is_flat() {
        let c = curve(&[(4.0, false), (8.0, false), (8.0, false), (15.0, false)]);
        assert!(c.points().all(|p| p.survival == 1.0));
        assert_eq!(c.to_vec().len(), 4);
        assert_eq!(c.median_survival(), None);
    }

    #[test]
    fn test_points_restartable() {
        let c = curve(&[(1.0, true), (2.0, true), (3.0, false)]);
        let mut it = c.points();
        it.next();
        let forked = it.clone();
        assert_eq!(it.collect::<Vec<_>>(), forked.collect::<Vec<_>>());
        assert_eq!(c.points().count(), c.points().count());
    }

    #[test]
    fn test_survival_at_and_median() {
        let c = curve(&[(1.0, true), (2.0, true), (3.0, true), (4.0, true)]);
        assert_eq!(c.survival_at(0.5), 1.0);
        assert_relative_eq!(c.survival_at(2.5), 0.5, epsilon = 1e-12);
        assert_eq!(c.median_survival(), Some(2.0));
    }

    #[test]
    fn test_greenwood() {
        // n=4, one death at t=1: var = S^2 * 1/(4*3)
        let c = curve(&[(1.0, true), (2.0, false), (3.0, false), (4.0, false)]);
        let p = c.to_vec()[1];
        assert_relative_eq!(p.std_error, 0.75 * (1.0_f64 / 12.0).sqrt(), epsilon = 1e-12);
    }

    fn stratified_cohort() -> Cohort {
        let mut rows = Vec::new();
        let mut id = 0;
        for (sex, n) in [("Female", 6), ("Male", 5), ("Other", 3)] {
            for k in 0..n {
                id += 1;
                rows.push(
                    SubjectRecord::new(SubjectId(id))
                        .with("Sex", sex)
                        .with("Time_To_Crisis", 10 * (k as i64 + 1))
                        .with("Crisis_Event", k % 2 == 0),
                );
            }
        }
        // no sex recorded - excluded when stratifying
        rows.push(SubjectRecord::new(SubjectId(99)).with("Time_To_Crisis", 3).with("Crisis_Event", true));
        Cohort::new(Schema::crisis(), rows).unwrap()
    }

    #[test]
    fn test_small_groups_excluded() {
        let options = SurvivalOptions::default().grouped_by("Sex");
        let curves = estimate_survival(&stratified_cohort(), &options).unwrap();
        let labels: Vec<&str> = curves.keys().map(String::as_str).collect();
        assert_eq!(labels, vec!["Female", "Male"]);
        assert_eq!(curves["Female"].n_subjects(), 6);
        assert_eq!(curves["Male"].group_label(), "Male");
    }

    #[test]
    fn test_overall_curve() {
        let curves = estimate_survival(&stratified_cohort(), &SurvivalOptions::default()).unwrap();
        assert_eq!(curves.len(), 1);
        assert_eq!(curves[OVERALL].n_subjects(), 15);
    }

    #[test]
    fn test_missing_field_is_schema_error() {
        let options = SurvivalOptions { time_field: "Days".into(), ..Default::default() };
        let err = estimate_survival(&stratified_cohort(), &options).unwrap_err();
        assert_eq!(err.fields(), ["Days"]);
    }

    #[test]
    fn test_serializes_points() {
        let c = curve(&[(1.0, true), (2.0, false)]);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["group"], "Overall");
        assert_eq!(json["points"].as_array().unwrap().len(), 3);
    }
}
