use crisis_risk::{
    HazardModel, RiskClassifier, SurvivalData, metrics::harrell_c_index, optimization::TieMethod, synthetic,
};

const COVARIATES: [&str; 4] = ["Age", "Work_Stress_Level", "Burnout_Level", "Social_Isolation"];
const FEATURES: [&str; 6] = [
    "Age",
    "Work_Stress_Level",
    "Burnout_Level",
    "Social_Isolation",
    "Hopelessness",
    "Despair",
];

fn k_fold_cross_validation(data: &SurvivalData, k: usize, ties: TieMethod) -> crisis_risk::Result<Vec<f64>> {
    let n_samples = data.n_samples();
    let fold_size = n_samples / k;

    let mut c_indices = Vec::new();

    for fold in 0..k {
        println!("  Fold {}/{}", fold + 1, k);

        let test_start = fold * fold_size;
        let test_end = if fold == k - 1 { n_samples } else { (fold + 1) * fold_size };

        let (test_indices, train_indices): (Vec<usize>, Vec<usize>) =
            (0..n_samples).partition(|i| (test_start..test_end).contains(i));

        let train_data = data.subset(&train_indices)?;
        let test_data = data.subset(&test_indices)?;

        let result = HazardModel::new().with_ties(ties).fit(&train_data)?;

        // out-of-fold risk scores
        let test_scores = result.linear_predictor(test_data.covariates())?;
        let c_index = harrell_c_index(test_scores.view(), test_data.times(), test_data.events())?;

        c_indices.push(c_index);
        println!("    Test C-index: {:.4}", c_index);
    }

    Ok(c_indices)
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Cross-Validation of the Crisis Risk Models");
    println!("==========================================\n");

    let cohort = synthetic::generate(800, 2024);
    let data = SurvivalData::from_cohort(&cohort, "Time_To_Crisis", "Crisis_Event", &COVARIATES)?;
    println!("Dataset: {} subjects, {} events, {} covariates\n", data.n_samples(), data.n_events(), data.n_features());

    println!("Cox model, 5-fold CV");
    println!("--------------------");
    println!("{:<10} {:<12} {:<12}", "ties", "Mean C-idx", "Std C-idx");
    let mut summary = Vec::new();
    for ties in [TieMethod::Efron, TieMethod::Breslow] {
        println!("{ties:?}:");
        let scores = k_fold_cross_validation(&data, 5, ties)?;
        summary.push((ties, mean_and_std(&scores)));
    }
    println!();
    for (ties, (mean, std)) in &summary {
        println!("{:<10} {:<12.4} {:<12.4}", format!("{ties:?}"), mean, std);
    }
    println!();

    // the classifier's split is seeded - different seeds = different held-out sets
    println!("Risk classifier, held-out accuracy across split seeds");
    println!("-----------------------------------------------------");
    println!("{:<6} {:<10} {:<10} {:<8}", "seed", "accuracy", "auc", "trees");
    let mut accuracies = Vec::new();
    for seed in 0..5 {
        let model = RiskClassifier::new()
            .with_seed(seed)
            .with_max_depth(3)
            .train(&cohort, &FEATURES, "Crisis_Event")?;
        let held_out = model.held_out();
        println!(
            "{:<6} {:<10.4} {:<10.4} {:<8}",
            seed,
            held_out.accuracy,
            held_out.auc.unwrap_or(f64::NAN),
            model.n_trees()
        );
        accuracies.push(held_out.accuracy);
    }
    let (mean, std) = mean_and_std(&accuracies);
    println!("\nmean accuracy {mean:.4} (sd {std:.4})");

    Ok(())
}
