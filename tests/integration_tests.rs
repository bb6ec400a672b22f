use approx::assert_relative_eq;
use crisis_risk::{
    AggFn, AnalysisConfig, Cohort, HazardModel, ModelKind, Predicate, RiskError, Schema, SubjectId, SubjectRecord,
    SurvivalData, SurvivalOptions, aggregate, estimate_survival, explain, filter, fit_hazards, io, run,
    synthetic, train_risk_model,
    cohort::{FieldKind, FieldSpec},
    optimization::TieMethod,
};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn create_synthetic_data(n_samples: usize, n_features: usize, seed: u64) -> SurvivalData {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut covariates_vec = Vec::with_capacity(n_samples * n_features);
    for _ in 0..(n_samples * n_features) {
        covariates_vec.push(rng.gen_range(-2.0..2.0));
    }
    let covariates = Array2::from_shape_vec((n_samples, n_features), covariates_vec).unwrap();

    let mut times = Vec::with_capacity(n_samples);
    let mut events = Vec::with_capacity(n_samples);

    let true_coefficients = Array1::from(vec![0.5, -0.3, 0.2]); // first 3 features are relevant

    for i in 0..n_samples {
        let linear_pred: f64 = covariates.slice(ndarray::s![i, 0..3]).dot(&true_coefficients);
        let hazard = linear_pred.exp();
        let time = (-rng.r#gen::<f64>().ln() / (0.1 * hazard)).max(0.1);
        let censoring_time = rng.gen_range(1.0..10.0);

        if time < censoring_time {
            times.push(time);
            events.push(true);
        } else {
            times.push(censoring_time);
            events.push(false);
        }
    }

    SurvivalData::new(times, events, covariates).unwrap()
}

fn km_record(id: u64, sex: &str, time: i64, event: bool) -> SubjectRecord {
    SubjectRecord::new(SubjectId(id))
        .with("Sex", sex)
        .with("Time_To_Crisis", time)
        .with("Crisis_Event", event)
}

#[test]
fn test_survival_curves_start_at_one_and_never_rise() {
    let cohort = synthetic::generate(500, 42);
    let options = SurvivalOptions::default().grouped_by("Sex");
    let curves = estimate_survival(&cohort, &options).unwrap();
    assert!(curves.contains_key("Female") && curves.contains_key("Male"));

    for (label, curve) in &curves {
        let points = curve.to_vec();
        assert_eq!(points[0].survival, 1.0, "{label}");
        for pair in points.windows(2) {
            assert!(pair[1].time >= pair[0].time);
            assert!(pair[1].survival <= pair[0].survival, "{label} rises at {}", pair[1].time);
            assert!((0.0..=1.0).contains(&pair[1].survival));
        }
    }
}

#[test]
fn test_zero_events_give_flat_curve() {
    let records = (0..12).map(|i| km_record(i, "Female", 10 + 5 * i as i64, false)).collect();
    let cohort = Cohort::new(Schema::crisis(), records).unwrap();
    let curves = estimate_survival(&cohort, &SurvivalOptions::default()).unwrap();

    let overall = &curves["Overall"];
    assert_eq!(overall.n_events(), 0);
    assert!(overall.points().all(|p| p.survival == 1.0));
    assert_eq!(overall.points().count(), 13);
}

#[test]
fn test_tiny_stratum_is_excluded() {
    let mut records = Vec::new();
    for i in 0..8 {
        records.push(km_record(i, "Female", 20 + i as i64, i % 2 == 0));
    }
    for i in 8..14 {
        records.push(km_record(i, "Male", 15 + i as i64, i % 3 == 0));
    }
    for i in 14..17 {
        records.push(km_record(i, "Other", 30, true));
    }
    let cohort = Cohort::new(Schema::crisis(), records).unwrap();

    let options = SurvivalOptions::default().grouped_by("Sex");
    let curves = estimate_survival(&cohort, &options).unwrap();
    assert_eq!(curves.keys().collect::<Vec<_>>(), ["Female", "Male"]);
}

#[test]
fn test_hazard_ratio_is_exp_coefficient() {
    let cohort = synthetic::generate(400, 11);
    let result = fit_hazards(
        &cohort,
        "Time_To_Crisis",
        "Crisis_Event",
        &["Age", "Work_Stress_Level", "Burnout_Level", "Social_Isolation"],
    )
    .unwrap();

    assert_eq!(result.rows.len(), 4);
    for row in &result.rows {
        assert_relative_eq!(row.hazard_ratio, row.coefficient.exp(), max_relative = 1e-12);
        assert!(row.hazard_ratio > 0.0);
        assert!((0.0..=1.0).contains(&row.p_value));
    }
}

#[test]
fn test_recovers_injected_hazard_ratio() {
    let cohort = synthetic::proportional_hazards(600, 2.0, 2024);
    for ties in [TieMethod::Efron, TieMethod::Breslow] {
        let result = HazardModel::new()
            .with_ties(ties)
            .fit_cohort(&cohort, "Time_To_Crisis", "Crisis_Event", &["History_Suicidal_Ideation"])
            .unwrap();
        let hr = result.rows[0].hazard_ratio;
        assert!((hr - 2.0).abs() <= 0.3, "{ties:?}: fitted hazard ratio {hr}");
        assert!(result.rows[0].p_value < 1e-6);
    }
}

fn create_two_group_data(n_samples: usize, hazard_ratio: f64, seed: u64) -> SurvivalData {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut times = Vec::with_capacity(n_samples);
    let mut events = Vec::with_capacity(n_samples);
    let mut exposed = Vec::with_capacity(n_samples);

    for i in 0..n_samples {
        let x = (i % 2) as f64;
        let rate = 0.1 * hazard_ratio.powf(x);
        let time = -rng.r#gen::<f64>().ln() / rate;
        let censoring_time = rng.gen_range(5.0..40.0);
        times.push(time.min(censoring_time));
        events.push(time < censoring_time);
        exposed.push(x);
    }

    SurvivalData::new(times, events, Array2::from_shape_vec((n_samples, 1), exposed).unwrap()).unwrap()
}

#[test]
fn test_recovers_hazard_ratio_from_independent_draws() {
    for seed in [1, 7, 42] {
        let data = create_two_group_data(600, 2.0, seed);
        let result = HazardModel::new().fit(&data).unwrap();
        let log_hr = result.rows[0].coefficient;
        // ~500 events puts the standard error of log(HR) near 0.09
        assert!((log_hr - 2.0_f64.ln()).abs() < 0.35, "seed {seed}: fitted hazard ratio {}", log_hr.exp());
        assert!(result.rows[0].hr_lower_95 < 2.0 * 1.5 && result.rows[0].hr_upper_95 > 2.0 / 1.5);
    }
}

#[test]
fn test_cox_on_continuous_covariates() {
    let data = create_synthetic_data(300, 5, 42);
    let result = HazardModel::new().with_max_iterations(100).fit(&data).unwrap();

    let beta = result.coefficients();
    assert_eq!(beta.len(), 5);
    assert!(beta[0] > 0.0);
    assert!(beta[1] < 0.0);
    assert!(result.concordance.unwrap() > 0.5);

    let risk = result.relative_hazard(data.covariates()).unwrap();
    assert!(risk.iter().all(|r| r.is_finite() && *r > 0.0));
}

#[test]
fn test_rank_deficient_covariates_fail() {
    // Hopelessness duplicated under another name
    let cohort = synthetic::generate(200, 5);
    let records = cohort
        .iter()
        .map(|r| r.clone().with("Despair", r.number("Hopelessness").unwrap() as i64))
        .collect();
    let cohort = Cohort::new(Schema::crisis(), records).unwrap();
    let err = fit_hazards(&cohort, "Time_To_Crisis", "Crisis_Event", &["Hopelessness", "Despair"]).unwrap_err();
    assert!(matches!(err, RiskError::Fit { .. }), "{err}");
}

fn separable_cohort(n: u64, seed: u64) -> Cohort {
    let schema = Schema::new(1, vec![
        FieldSpec::new("feature_A", FieldKind::Real),
        FieldSpec::new("feature_B", FieldKind::Real),
        FieldSpec::new("outcome", FieldKind::Boolean),
    ]);
    let mut rng = StdRng::seed_from_u64(seed);
    let records = (0..n)
        .map(|i| {
            let a: f64 = rng.gen_range(0.0..10.0);
            SubjectRecord::new(SubjectId(i))
                .with("feature_A", a)
                .with("feature_B", rng.gen_range(0.0..10.0))
                .with("outcome", a > 5.0)
        })
        .collect();
    Cohort::new(schema, records).unwrap()
}

#[test]
fn test_classifier_learns_threshold_rule() {
    let cohort = separable_cohort(400, 17);
    let model = train_risk_model(&cohort, &["feature_A", "feature_B"], "outcome", 0.3, 42).unwrap();

    assert!(model.accuracy() >= 0.9, "held-out accuracy {}", model.accuracy());
    assert_eq!(model.feature_importances()[0].0, "feature_A");
}

#[test]
fn test_partition_missing_a_class_is_degenerate() {
    // a single positive can't be on both sides of the split
    let records = (0..10)
        .map(|i| {
            SubjectRecord::new(SubjectId(i))
                .with("feature_A", i as f64)
                .with("outcome", i == 3)
        })
        .collect();
    let cohort = Cohort::new(separable_cohort(0, 0).schema().clone(), records).unwrap();
    let err = train_risk_model(&cohort, &["feature_A"], "outcome", 0.3, 1).unwrap_err();
    assert!(matches!(err, RiskError::DegenerateSplit { .. }));
}

#[test]
fn test_attributions_add_up_to_prediction() {
    let cohort = synthetic::generate(300, 8);
    let config = AnalysisConfig::default();
    let classifier = &config.classifier;
    let model = train_risk_model(&cohort, &classifier.features, &classifier.outcome_field, 0.3, 42).unwrap();

    let explained = explain(&model, &cohort).unwrap();
    assert_eq!(explained.len(), cohort.len());
    for record in &cohort {
        let v = &explained[&record.id()];
        let margin = model.predict_margin(record).unwrap();
        assert!((v.baseline + v.total() - margin).abs() < 1e-4, "subject {}", record.id());
        assert_eq!(v.contributions.len(), classifier.features.len());
    }
}

#[test]
fn test_filter_is_idempotent() {
    let cohort = synthetic::generate(250, 3);
    let predicates = [
        Predicate::range("Age", 30.0, 55.0),
        Predicate::one_of("Sex", ["Female", "Other"]),
        Predicate::text("nurse"),
    ];
    let once = filter(&cohort, &predicates);
    let twice = filter(&once, &predicates);
    assert!(!once.is_empty());
    assert_eq!(once.records(), twice.records());

    let summary = aggregate(&once, "Healthcare_Role", "Burnout_Level", AggFn::Mean).unwrap();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].group, "Nurse");
    assert_eq!(summary[0].n, once.len());
}

#[test]
fn test_csv_round_trip_of_100_rows() {
    let cohort = synthetic::generate(100, 99);
    let mut buf = Vec::new();
    io::write_csv(&cohort, &mut buf).unwrap();
    let back = io::read_csv(&Schema::crisis(), buf.as_slice()).unwrap();

    assert_eq!(back.len(), 100);
    for record in &cohort {
        assert_eq!(back.get(record.id()), Some(record));
    }
}

#[test]
fn test_missing_required_field_is_schema_error() {
    let schema = Schema::new(1, vec![
        FieldSpec::new("Time_To_Crisis", FieldKind::count()),
        FieldSpec::new("Age", FieldKind::count()),
    ]);
    let records = (0..20)
        .map(|i| {
            SubjectRecord::new(SubjectId(i))
                .with("Time_To_Crisis", 10 * i as i64 + 5)
                .with("Age", 30 + i as i64)
        })
        .collect();
    let cohort = Cohort::new(schema, records).unwrap();

    let config = AnalysisConfig::default();
    let err = run(&cohort, ModelKind::KaplanMeier, &config).unwrap_err();
    assert!(matches!(err, RiskError::Schema { .. }));
    assert_eq!(err.fields(), ["Crisis_Event"]);

    let err = run(&cohort, ModelKind::CoxHazards, &config).unwrap_err();
    assert!(err.fields().contains(&"Crisis_Event".to_string()));
    assert!(err.fields().contains(&"Work_Stress_Level".to_string()));
}

#[test]
fn test_snapshot_unchanged_by_derived_cohorts() {
    let cohort = synthetic::generate(80, 21);
    let version = cohort.version();
    let subset = filter(&cohort, &[Predicate::range("Age", 18.0, 40.0)]);

    assert_eq!(cohort.len(), 80);
    assert_eq!(cohort.version(), version);
    assert_ne!(subset.version(), version);
}
