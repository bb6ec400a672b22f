use crisis_risk::{
    AggFn, AnalysisConfig, ModelKind, Predicate, SurvivalOptions, aggregate, estimate_survival, explain,
    filter, fit_hazards, global_importance, io, run_all, synthetic, train_risk_model,
    validate::{data_quality, validate},
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Crisis Risk Engine - Basic Usage Example");
    println!("========================================\n");

    let cohort = synthetic::generate(500, 42);
    println!("Cohort snapshot {} with {} subjects\n", cohort.version(), cohort.len());

    // Example 1: data quality + validation
    println!("Example 1: Data Quality");
    println!("-----------------------");
    for column in data_quality(&cohort).iter().take(6) {
        println!("  {:<24} missing {:>3} ({:>5.1}%), {} distinct", column.name, column.missing, column.missing_pct, column.unique);
    }
    let validated = validate(&cohort, &["Time_To_Crisis", "Crisis_Event", "Age"])?;
    println!("  complete rows: {}, excluded: {}\n", validated.cohort.len(), validated.excluded);

    // Example 2: Kaplan-Meier by sex
    println!("Example 2: Kaplan-Meier Curves by Sex");
    println!("-------------------------------------");
    let options = SurvivalOptions::default().grouped_by("Sex");
    for (group, curve) in estimate_survival(&cohort, &options)? {
        let median = curve
            .median_survival()
            .map_or("not reached".to_string(), |m| format!("{m} days"));
        println!(
            "  {:<8} n = {:>3}, events = {:>3}, S(180) = {:.3}, median {}",
            group,
            curve.n_subjects(),
            curve.n_events(),
            curve.survival_at(180.0),
            median
        );
    }
    println!();

    // Example 3: Cox regression
    println!("Example 3: Cox Proportional Hazards");
    println!("-----------------------------------");
    let hazards = fit_hazards(
        &cohort,
        "Time_To_Crisis",
        "Crisis_Event",
        &["Age", "Work_Stress_Level", "Burnout_Level", "Social_Isolation", "Hopelessness"],
    )?;
    println!("{hazards}\n");

    // Example 4: boosted risk classifier + attributions
    println!("Example 4: Risk Classifier");
    println!("--------------------------");
    let features = ["Age", "Work_Stress_Level", "Burnout_Level", "Social_Isolation", "Hopelessness", "Despair"];
    let model = train_risk_model(&cohort, &features, "Crisis_Event", 0.3, 42)?;
    println!("{model}");

    let explained = explain(&model, &cohort)?;
    let first = &explained[&cohort.records()[0].id()];
    println!("  subject {}: baseline {:.3} -> margin {:.3}", first.subject_id, first.baseline, first.prediction);
    for (feature, value) in first.ranked() {
        println!("    {feature:<24} {value:+.4}");
    }
    println!("  mean |contribution| over the cohort:");
    for (feature, value) in global_importance(explained.values()) {
        println!("    {feature:<24} {value:.4}");
    }
    println!();

    // Example 5: filter + aggregate for a dashboard panel
    println!("Example 5: Filter and Aggregate");
    println!("-------------------------------");
    let nurses = filter(&cohort, &[Predicate::text("nurse"), Predicate::range("Age", 18.0, 45.0)]);
    println!("  nurses aged 18-45: {}", nurses.len());
    for row in aggregate(&cohort, "Healthcare_Role", "Burnout_Level", AggFn::Mean)? {
        println!("  {:<22} n = {:>3}, mean burnout {:.2}", row.group, row.n, row.value);
    }
    println!();

    // Example 6: every branch at once
    println!("Example 6: All Branches in Parallel");
    println!("-----------------------------------");
    let mut config = AnalysisConfig::default();
    config.hazard.covariates.push("Not_A_Field".to_string());
    for (kind, result) in run_all(&cohort, &ModelKind::ALL, &config) {
        match result {
            Ok(_) => println!("  {kind:?}: ok"),
            Err(e) => println!("  {kind:?}: {e}"),
        }
    }
    println!();

    // Example 7: export
    let mut csv = Vec::new();
    io::write_csv(&nurses, &mut csv)?;
    println!("Exported {} bytes of csv for {} subjects", csv.len(), nurses.len());

    Ok(())
}
