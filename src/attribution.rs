//! per-subject feature attributions for the boosted risk model
//!
//! path-dependent TreeSHAP: for every tree we walk all root-to-leaf paths
//! once, tracking the share of subsets that reach each leaf, so the exact
//! Shapley values of the cover-weighted conditional expectation come out in
//! polynomial time. values are on the margin scale (log-odds for the
//! logistic objective), which is where they add up.

use std::collections::BTreeMap;

use ndarray::ArrayView1;
use rayon::prelude::*;
use serde::Serialize;

use crate::{
    classifier::RiskModel,
    cohort::{SubjectId, SubjectRecord},
    error::{Result, RiskError},
    tree::{Node, RegressionTree},
};

/// baseline + sum(contributions) == prediction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributionVector {
    pub subject_id: SubjectId,
    /// expected margin over the training rows
    pub baseline: f64,
    /// model margin for this subject
    pub prediction: f64,
    pub contributions: BTreeMap<String, f64>,
}

impl AttributionVector {
    pub fn total(&self) -> f64 {
        self.contributions.values().sum()
    }

    pub fn contribution(&self, feature: &str) -> Option<f64> {
        self.contributions.get(feature).copied()
    }

    /// features by |contribution|, largest first
    pub fn ranked(&self) -> Vec<(&str, f64)> {
        let mut ranked: Vec<(&str, f64)> = self
            .contributions
            .iter()
            .map(|(name, &value)| (name.as_str(), value))
            .collect();
        ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()).then_with(|| a.0.cmp(b.0)));
        ranked
    }
}

/// attributions for every subject; fails as a whole if any subject lacks a model feature
pub fn explain<'a, I>(model: &RiskModel, subjects: I) -> Result<BTreeMap<SubjectId, AttributionVector>>
where
    I: IntoIterator<Item = &'a SubjectRecord>,
{
    let rows = subjects
        .into_iter()
        .map(|record| {
            model
                .feature_row(record)
                .map(|row| (record.id(), row))
                .map_err(|field| {
                    RiskError::attribution(format!(
                        "subject {} has no numeric `{field}`, model was trained on [{}]",
                        record.id(),
                        model.feature_names().join(", ")
                    ))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    let baseline = model.baseline();
    let explained: Vec<AttributionVector> = rows
        .par_iter()
        .map(|(id, row)| {
            let mut phi = vec![0.0; model.feature_names().len()];
            for tree in model.trees() {
                tree_shap(tree, row.view(), &mut phi);
            }
            AttributionVector {
                subject_id: *id,
                baseline,
                prediction: model.margin_row(row.view()),
                contributions: model.feature_names().iter().cloned().zip(phi).collect(),
            }
        })
        .collect();

    log::debug!("explained {} subjects over {} trees", explained.len(), model.n_trees());
    Ok(explained.into_iter().map(|v| (v.subject_id, v)).collect())
}

/// mean |contribution| per feature, largest first
pub fn global_importance<'a, I>(vectors: I) -> Vec<(String, f64)>
where
    I: IntoIterator<Item = &'a AttributionVector>,
{
    let mut totals: BTreeMap<&str, f64> = BTreeMap::new();
    let mut n = 0usize;
    for vector in vectors {
        n += 1;
        for (name, value) in &vector.contributions {
            *totals.entry(name.as_str()).or_default() += value.abs();
        }
    }
    if n == 0 {
        return Vec::new();
    }
    let mut ranked: Vec<(String, f64)> = totals
        .into_iter()
        .map(|(name, total)| (name.to_string(), total / n as f64))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

#[derive(Debug, Clone, Copy, Default)]
struct PathElement {
    feature: Option<usize>,
    zero_fraction: f64, // share of cover flowing this way
    one_fraction: f64,  // 1 if x itself flows this way
    pweight: f64,
}

/// add one tree's shapley values for `row` into `phi`
pub(crate) fn tree_shap(tree: &RegressionTree, row: ArrayView1<'_, f64>, phi: &mut [f64]) {
    recurse(tree.nodes(), row, phi, 0, &[], 0, 1.0, 1.0, None);
}

#[allow(clippy::too_many_arguments)]
fn recurse(
    nodes: &[Node],
    row: ArrayView1<'_, f64>,
    phi: &mut [f64],
    index: usize,
    parent_path: &[PathElement],
    unique_depth: usize,
    parent_zero: f64,
    parent_one: f64,
    parent_feature: Option<usize>,
) {
    let mut path = parent_path[..unique_depth].to_vec();
    path.resize(unique_depth + 1, PathElement::default());
    extend_path(&mut path, unique_depth, parent_zero, parent_one, parent_feature);

    match &nodes[index] {
        Node::Leaf { value, .. } => {
            for i in 1..=unique_depth {
                let weight = unwound_path_sum(&path, unique_depth, i);
                let el = path[i];
                if let Some(feature) = el.feature {
                    phi[feature] += weight * (el.one_fraction - el.zero_fraction) * value;
                }
            }
        }
        Node::Split { feature, threshold, left, right, cover, .. } => {
            let (hot, cold) = if row[*feature] < *threshold { (*left, *right) } else { (*right, *left) };
            let hot_zero = nodes[hot].cover() / cover;
            let cold_zero = nodes[cold].cover() / cover;

            // a feature seen higher up is undone before being re-added here
            let mut incoming_zero = 1.0;
            let mut incoming_one = 1.0;
            let mut depth = unique_depth;
            if let Some(k) = (1..=depth).find(|&k| path[k].feature == Some(*feature)) {
                incoming_zero = path[k].zero_fraction;
                incoming_one = path[k].one_fraction;
                unwind_path(&mut path, depth, k);
                depth -= 1;
            }

            recurse(nodes, row, phi, hot, &path, depth + 1, hot_zero * incoming_zero, incoming_one, Some(*feature));
            recurse(nodes, row, phi, cold, &path, depth + 1, cold_zero * incoming_zero, 0.0, Some(*feature));
        }
    }
}

fn extend_path(path: &mut [PathElement], unique_depth: usize, zero: f64, one: f64, feature: Option<usize>) {
    path[unique_depth] = PathElement {
        feature,
        zero_fraction: zero,
        one_fraction: one,
        pweight: if unique_depth == 0 { 1.0 } else { 0.0 },
    };
    let d = (unique_depth + 1) as f64;
    for i in (0..unique_depth).rev() {
        path[i + 1].pweight += one * path[i].pweight * (i + 1) as f64 / d;
        path[i].pweight = zero * path[i].pweight * (unique_depth - i) as f64 / d;
    }
}

fn unwind_path(path: &mut [PathElement], unique_depth: usize, path_index: usize) {
    let one = path[path_index].one_fraction;
    let zero = path[path_index].zero_fraction;
    let d = (unique_depth + 1) as f64;
    let mut next_one_portion = path[unique_depth].pweight;

    for i in (0..unique_depth).rev() {
        if one != 0.0 {
            let tmp = path[i].pweight;
            path[i].pweight = next_one_portion * d / ((i + 1) as f64 * one);
            next_one_portion = tmp - path[i].pweight * zero * (unique_depth - i) as f64 / d;
        } else {
            path[i].pweight = path[i].pweight * d / (zero * (unique_depth - i) as f64);
        }
    }

    for i in path_index..unique_depth {
        path[i].feature = path[i + 1].feature;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
}

/// total permutation weight if the element at `path_index` were unwound
fn unwound_path_sum(path: &[PathElement], unique_depth: usize, path_index: usize) -> f64 {
    let one = path[path_index].one_fraction;
    let zero = path[path_index].zero_fraction;
    let d = (unique_depth + 1) as f64;
    let mut next_one_portion = path[unique_depth].pweight;
    let mut total = 0.0;

    for i in (0..unique_depth).rev() {
        if one != 0.0 {
            let tmp = next_one_portion * d / ((i + 1) as f64 * one);
            total += tmp;
            next_one_portion = path[i].pweight - tmp * zero * (unique_depth - i) as f64 / d;
        } else if zero != 0.0 {
            total += path[i].pweight / zero / ((unique_depth - i) as f64 / d);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::train_risk_model;
    use crate::cohort::{Cohort, FieldKind, FieldSpec, Schema};
    use crate::tree::TreeParams;
    use approx::assert_relative_eq;
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn cohort(n: u64, seed: u64) -> Cohort {
        let schema = Schema::new(1, vec![
            FieldSpec::new("a", FieldKind::Real),
            FieldSpec::new("b", FieldKind::Real),
            FieldSpec::new("unused", FieldKind::Real),
            FieldSpec::new("y", FieldKind::Boolean),
        ]);
        let mut rng = StdRng::seed_from_u64(seed);
        let records = (0..n)
            .map(|i| {
                let a: f64 = rng.gen_range(0.0..10.0);
                let b: f64 = rng.gen_range(0.0..10.0);
                let flip = rng.gen_bool(0.1);
                SubjectRecord::new(SubjectId(i))
                    .with("a", a)
                    .with("b", b)
                    .with("unused", 1.0)
                    .with("y", (a + b > 10.0) != flip)
            })
            .collect();
        Cohort::new(schema, records).unwrap()
    }

    /// E[f(x) | x_S] with unseen features averaged by cover
    fn conditional(nodes: &[Node], index: usize, x: &[f64], known: &[bool]) -> f64 {
        match &nodes[index] {
            Node::Leaf { value, .. } => *value,
            Node::Split { feature, threshold, left, right, cover, .. } => {
                if known[*feature] {
                    let next = if x[*feature] < *threshold { *left } else { *right };
                    conditional(nodes, next, x, known)
                } else {
                    (nodes[*left].cover() * conditional(nodes, *left, x, known)
                        + nodes[*right].cover() * conditional(nodes, *right, x, known))
                        / cover
                }
            }
        }
    }

    fn brute_force_shapley(tree: &RegressionTree, x: &[f64]) -> Vec<f64> {
        let m = x.len();
        let factorial = |k: usize| (1..=k).product::<usize>() as f64;
        let mut phi = vec![0.0; m];
        for i in 0..m {
            for mask in 0..(1usize << m) {
                if mask & (1 << i) != 0 {
                    continue;
                }
                let known: Vec<bool> = (0..m).map(|j| mask & (1 << j) != 0).collect();
                let mut with_i = known.clone();
                with_i[i] = true;
                let s = known.iter().filter(|&&k| k).count();
                let weight = factorial(s) * factorial(m - s - 1) / factorial(m);
                phi[i] += weight
                    * (conditional(tree.nodes(), 0, x, &with_i) - conditional(tree.nodes(), 0, x, &known));
            }
        }
        phi
    }

    #[test]
    fn test_matches_exact_shapley_values() {
        let mut rng = StdRng::seed_from_u64(11);
        let n = 40;
        let x = Array2::from_shape_fn((n, 3), |_| rng.gen_range(0.0..1.0));
        let grad: Vec<f64> = (0..n)
            .map(|i| -(x[[i, 0]] * 3.0 + (x[[i, 1]] > 0.5) as u8 as f64 - x[[i, 0]] * x[[i, 2]]))
            .collect();
        let hess = vec![1.0; n];
        let params = TreeParams { max_depth: 4, ..Default::default() };
        let tree = RegressionTree::fit(x.view(), &grad, &hess, &(0..n).collect::<Vec<_>>(), &params);

        for i in [0, 7, 19, 33] {
            let row = x.row(i);
            let mut phi = vec![0.0; 3];
            tree_shap(&tree, row, &mut phi);
            let exact = brute_force_shapley(&tree, row.as_slice().unwrap());
            for (fast, slow) in phi.iter().zip(&exact) {
                assert_relative_eq!(*fast, *slow, epsilon = 1e-10);
            }
            assert_relative_eq!(
                phi.iter().sum::<f64>(),
                tree.predict_row(row) - tree.expected_value(),
                epsilon = 1e-10
            );
        }
    }

    #[test]
    fn test_efficiency_over_ensemble() {
        let cohort = cohort(200, 3);
        let model = train_risk_model(&cohort, &["a", "b", "unused"], "y", 0.3, 42).unwrap();
        let explained = explain(&model, &cohort).unwrap();
        assert_eq!(explained.len(), 200);

        for record in &cohort {
            let v = &explained[&record.id()];
            assert_relative_eq!(v.baseline + v.total(), v.prediction, epsilon = 1e-6);
            assert_relative_eq!(v.prediction, model.predict_margin(record).unwrap(), epsilon = 1e-12);
            // constant column never splits
            assert_eq!(v.contribution("unused"), Some(0.0));
        }
    }

    #[test]
    fn test_symmetric_features_get_equal_credit() {
        // y depends on a and b only through a + b; swapping them mirrors the attributions
        let x = Array2::from_shape_vec((4, 2), vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0]).unwrap();
        let y = [0.0, 1.0, 1.0, 2.0];
        let grad: Vec<f64> = y.iter().map(|v| -v).collect();
        let params = TreeParams { min_child_weight: 0.0, lambda: 0.0, learning_rate: 1.0, ..Default::default() };
        let tree = RegressionTree::fit(x.view(), &grad, &[1.0; 4], &[0, 1, 2, 3], &params);

        let mut phi = vec![0.0; 2];
        tree_shap(&tree, Array1::from(vec![1.0, 1.0]).view(), &mut phi);
        assert_relative_eq!(phi[0], phi[1], epsilon = 1e-12);
        assert_relative_eq!(phi[0] + phi[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_feature_is_attribution_error() {
        let cohort = cohort(100, 4);
        let model = train_risk_model(&cohort, &["a", "b"], "y", 0.3, 1).unwrap();
        let stranger = SubjectRecord::new(SubjectId(500)).with("a", 3.0);
        let err = explain(&model, [&cohort.records()[0], &stranger]).unwrap_err();
        assert!(matches!(err, RiskError::Attribution { .. }));
    }

    #[test]
    fn test_global_importance_ranks_by_mean_abs() {
        let cohort = cohort(150, 5);
        let model = train_risk_model(&cohort, &["a", "b", "unused"], "y", 0.3, 2).unwrap();
        let explained = explain(&model, &cohort).unwrap();
        let ranked = global_importance(explained.values());

        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[2], ("unused".to_string(), 0.0));
        assert!(ranked[0].1 >= ranked[1].1);
        assert!(global_importance(std::iter::empty::<&AttributionVector>()).is_empty());
    }
}
