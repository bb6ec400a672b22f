use ndarray::ArrayView1;
use serde::Serialize;

use crate::{
    data::SurvivalData,
    error::{Result, RiskError},
};

/// Harrell's C-index with tie handling - how often do higher risk scores = shorter survival?
pub fn harrell_c_index(
    risk_scores: ArrayView1<f64>,
    times: ArrayView1<f64>,
    events: ArrayView1<bool>,
) -> Result<f64> {
    let n = risk_scores.len();
    if n != times.len() || n != events.len() {
        return Err(RiskError::invalid_dimensions(
            "All arrays must have same length"
        ));
    }

    let mut concordant = 0.0;
    let mut discordant = 0.0;
    let mut tied_risk = 0.0;

    for i in 0..n {
        if !events[i] {
            continue; // censored obs can't anchor a pair
        }

        for j in 0..n {
            if i == j {
                continue;
            }

            // j is comparable to i if j outlived i (event or censored)
            if times[j] > times[i] || (!events[j] && times[j] >= times[i]) {
                if risk_scores[i] > risk_scores[j] {
                    concordant += 1.0;
                } else if risk_scores[i] < risk_scores[j] {
                    discordant += 1.0;
                } else {
                    tied_risk += 1.0;
                }
            }
        }
    }

    let total_pairs = concordant + discordant + tied_risk;
    if total_pairs == 0.0 {
        return Err(RiskError::numerical_error(
            "No valid pairs for C-index calculation"
        ));
    }

    // (concordant + 0.5 * tied) / total
    Ok((concordant + 0.5 * tied_risk) / total_pairs)
}

/// Breslow log partial likelihood for a given set of risk scores
pub fn log_partial_likelihood(
    data: &SurvivalData,
    risk_scores: ArrayView1<f64>,
) -> Result<f64> {
    if risk_scores.len() != data.n_samples() {
        return Err(RiskError::invalid_dimensions(
            "Risk scores length must match number of samples"
        ));
    }

    let mut loglik = 0.0;

    for risk_set in data.risk_sets() {
        let members = data.risk_set_members(risk_set);

        // log of sum of exponentials (numerically stable)
        let max_risk = members.iter().map(|&i| risk_scores[i]).fold(f64::NEG_INFINITY, f64::max);
        let log_sum_exp = max_risk
            + members.iter()
                .map(|&i| (risk_scores[i] - max_risk).exp())
                .sum::<f64>()
                .ln();

        for &event_idx in &risk_set.deaths {
            loglik += risk_scores[event_idx] - log_sum_exp;
        }
    }

    Ok(loglik)
}

/// AIC (Akaike Information Criterion)
pub fn aic(log_likelihood: f64, n_parameters: usize) -> f64 {
    2.0 * n_parameters as f64 - 2.0 * log_likelihood
}

fn check_lengths(a: usize, b: usize) -> Result<()> {
    if a != b {
        return Err(RiskError::invalid_dimensions(format!("{a} predictions for {b} labels")));
    }
    if a == 0 {
        return Err(RiskError::insufficient_data("no predictions to score"));
    }
    Ok(())
}

/// share of probabilities on the right side of 0.5
pub fn accuracy(probabilities: &[f64], labels: &[f64]) -> Result<f64> {
    check_lengths(probabilities.len(), labels.len())?;
    let hits = probabilities
        .iter()
        .zip(labels)
        .filter(|&(&p, &y)| (p >= 0.5) == (y >= 0.5))
        .count();
    Ok(hits as f64 / labels.len() as f64)
}

/// share of rounded predictions equal to the observed (ordinal) value
pub fn rounded_accuracy(predictions: &[f64], targets: &[f64]) -> Result<f64> {
    check_lengths(predictions.len(), targets.len())?;
    let hits = predictions
        .iter()
        .zip(targets)
        .filter(|&(&p, &y)| p.round() == y.round())
        .count();
    Ok(hits as f64 / targets.len() as f64)
}

/// area under the ROC curve via the rank-sum statistic (ties count half)
pub fn roc_auc(scores: &[f64], labels: &[f64]) -> Result<f64> {
    check_lengths(scores.len(), labels.len())?;
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    // average ranks over tied scores
    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &k in &order[i..=j] {
            ranks[k] = avg;
        }
        i = j + 1;
    }

    let n_pos = labels.iter().filter(|&&y| y >= 0.5).count() as f64;
    let n_neg = labels.len() as f64 - n_pos;
    if n_pos == 0.0 || n_neg == 0.0 {
        return Err(RiskError::degenerate_split("AUC needs both classes"));
    }
    let pos_rank_sum: f64 = ranks
        .iter()
        .zip(labels)
        .filter(|&(_, &y)| y >= 0.5)
        .map(|(r, _)| r)
        .sum();
    Ok((pos_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

/// mean binary cross-entropy, probabilities clipped away from 0/1
pub fn log_loss(probabilities: &[f64], labels: &[f64]) -> Result<f64> {
    check_lengths(probabilities.len(), labels.len())?;
    let eps = 1e-15;
    let total: f64 = probabilities
        .iter()
        .zip(labels)
        .map(|(&p, &y)| {
            let p = p.clamp(eps, 1.0 - eps);
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        })
        .sum();
    Ok(total / labels.len() as f64)
}

pub fn rmse(predictions: &[f64], targets: &[f64]) -> Result<f64> {
    check_lengths(predictions.len(), targets.len())?;
    let sse: f64 = predictions.iter().zip(targets).map(|(p, y)| (p - y).powi(2)).sum();
    Ok((sse / targets.len() as f64).sqrt())
}

/// Held-out evaluation of a risk classifier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeldOutMetrics {
    pub n_test: usize,
    pub accuracy: f64,
    pub auc: Option<f64>,
    pub log_loss: Option<f64>,
    pub rmse: Option<f64>,
}
