use ndarray::{ArrayView1, ArrayView2};
use rayon::prelude::*;

/// Growth limits & regularisation for one boosted tree
#[derive(Debug, Clone, PartialEq)]
pub struct TreeParams {
    pub max_depth: usize,
    pub lambda: f64,           // L2 on leaf weights
    pub min_child_weight: f64, // min hessian sum per child
    pub min_split_gain: f64,   // gamma
    pub learning_rate: f64,    // baked into leaf values
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: 6,
            lambda: 1.0,
            min_child_weight: 1.0,
            min_split_gain: 0.0,
            learning_rate: 0.3,
        }
    }
}

/// `cover` is the number of training rows that reached the node
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf {
        value: f64,
        cover: f64,
    },
    Split {
        feature: usize,
        threshold: f64, // x < threshold goes left
        left: usize,
        right: usize,
        gain: f64,
        cover: f64,
    },
}

impl Node {
    pub fn cover(&self) -> f64 {
        match self {
            Node::Leaf { cover, .. } | Node::Split { cover, .. } => *cover,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// second-order regression tree (newton boosting), root at index 0
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    /// grow a tree on `rows` of `x` against per-row gradients & hessians
    pub fn fit(
        x: ArrayView2<'_, f64>,
        grad: &[f64],
        hess: &[f64],
        rows: &[usize],
        params: &TreeParams,
    ) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(x, grad, hess, rows.to_vec(), 0, params);
        tree
    }

    fn grow(
        &mut self,
        x: ArrayView2<'_, f64>,
        grad: &[f64],
        hess: &[f64],
        rows: Vec<usize>,
        depth: usize,
        params: &TreeParams,
    ) -> usize {
        let g: f64 = rows.iter().map(|&i| grad[i]).sum();
        let h: f64 = rows.iter().map(|&i| hess[i]).sum();
        let cover = rows.len() as f64;
        let index = self.nodes.len();
        self.nodes.push(Node::Leaf {
            value: -g / (h + params.lambda) * params.learning_rate,
            cover,
        });

        if depth >= params.max_depth || rows.len() < 2 {
            return index;
        }
        let Some(best) = best_split(x, grad, hess, &rows, g, h, params) else {
            return index;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.iter().partition(|&&i| x[[i, best.feature]] < best.threshold);
        let left = self.grow(x, grad, hess, left_rows, depth + 1, params);
        let right = self.grow(x, grad, hess, right_rows, depth + 1, params);

        self.nodes[index] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
            gain: best.gain,
            cover,
        };
        index
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn is_stump(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| matches!(n, Node::Leaf { .. })).count()
    }

    /// leaf value reached by one feature row
    pub fn predict_row(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { value, .. } => return *value,
                Node::Split { feature, threshold, left, right, .. } => {
                    index = if row[*feature] < *threshold { *left } else { *right };
                }
            }
        }
    }

    /// cover-weighted mean leaf value = mean prediction over training rows
    pub fn expected_value(&self) -> f64 {
        let root = self.nodes[0].cover();
        self.nodes
            .iter()
            .filter_map(|n| match n {
                Node::Leaf { value, cover } => Some(value * cover / root),
                Node::Split { .. } => None,
            })
            .sum()
    }

    /// add this tree's split gains into a per-feature total
    pub fn accumulate_gain(&self, totals: &mut [f64]) {
        for node in &self.nodes {
            if let Node::Split { feature, gain, .. } = node {
                totals[*feature] += gain;
            }
        }
    }
}

/// exact greedy search over every feature, features scanned in parallel
fn best_split(
    x: ArrayView2<'_, f64>,
    grad: &[f64],
    hess: &[f64],
    rows: &[usize],
    g: f64,
    h: f64,
    params: &TreeParams,
) -> Option<Candidate> {
    let parent_score = g * g / (h + params.lambda);

    let per_feature: Vec<Option<Candidate>> = (0..x.ncols())
        .into_par_iter()
        .map(|feature| {
            let mut sorted = rows.to_vec();
            sorted.sort_by(|&a, &b| x[[a, feature]].total_cmp(&x[[b, feature]]));

            let mut best: Option<Candidate> = None;
            let (mut gl, mut hl) = (0.0, 0.0);
            for k in 0..sorted.len() - 1 {
                let i = sorted[k];
                gl += grad[i];
                hl += hess[i];

                let here = x[[i, feature]];
                let next = x[[sorted[k + 1], feature]];
                if here == next {
                    continue;
                }
                let (gr, hr) = (g - gl, h - hl);
                if hl < params.min_child_weight || hr < params.min_child_weight {
                    continue;
                }
                let gain = 0.5
                    * (gl * gl / (hl + params.lambda) + gr * gr / (hr + params.lambda) - parent_score)
                    - params.min_split_gain;
                if gain > 1e-12 && best.is_none_or(|b| gain > b.gain) {
                    best = Some(Candidate {
                        feature,
                        threshold: here + (next - here) / 2.0,
                        gain,
                    });
                }
            }
            best
        })
        .collect();

    // deterministic: highest gain, lowest feature index on ties
    per_feature
        .into_iter()
        .flatten()
        .fold(None, |acc: Option<Candidate>, c| match acc {
            Some(a) if a.gain >= c.gain => Some(a),
            _ => Some(c),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array2, array};

    fn squared_error_inputs(y: &[f64]) -> (Vec<f64>, Vec<f64>) {
        // gradients at a zero prediction
        (y.iter().map(|v| -v).collect(), vec![1.0; y.len()])
    }

    #[test]
    fn test_single_split_found() {
        let x = Array2::from_shape_vec((6, 2), vec![
            1.0, 5.0,
            2.0, 4.0,
            3.0, 6.0,
            7.0, 5.0,
            8.0, 4.0,
            9.0, 6.0,
        ]).unwrap();
        let y = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let (g, h) = squared_error_inputs(&y);
        let params = TreeParams { max_depth: 1, lambda: 0.0, learning_rate: 1.0, ..Default::default() };
        let tree = RegressionTree::fit(x.view(), &g, &h, &[0, 1, 2, 3, 4, 5], &params);

        match &tree.nodes()[0] {
            Node::Split { feature, threshold, .. } => {
                assert_eq!(*feature, 0);
                assert_relative_eq!(*threshold, 5.0, epsilon = 1e-12);
            }
            other => panic!("expected split, got {other:?}"),
        }
        assert_relative_eq!(tree.predict_row(array![2.0, 0.0].view()), 0.0, epsilon = 1e-12);
        assert_relative_eq!(tree.predict_row(array![8.5, 0.0].view()), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_covers_add_up() {
        let x = Array2::from_shape_vec((8, 1), (0..8).map(|v| v as f64).collect()).unwrap();
        let y = [0.0, 1.0, 0.0, 3.0, 2.0, 5.0, 4.0, 7.0];
        let (g, h) = squared_error_inputs(&y);
        let tree = RegressionTree::fit(x.view(), &g, &h, &(0..8).collect::<Vec<_>>(), &TreeParams::default());

        for node in tree.nodes() {
            if let Node::Split { left, right, cover, .. } = node {
                let sum = tree.nodes()[*left].cover() + tree.nodes()[*right].cover();
                assert_relative_eq!(*cover, sum, epsilon = 1e-12);
            }
        }

        // expected value equals the mean prediction over the training rows
        let mean: f64 = (0..8).map(|i| tree.predict_row(x.row(i))).sum::<f64>() / 8.0;
        assert_relative_eq!(tree.expected_value(), mean, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_target_gives_stump() {
        let x = Array2::from_shape_vec((4, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let (g, h) = squared_error_inputs(&[1.0; 4]);
        let tree = RegressionTree::fit(x.view(), &g, &h, &[0, 1, 2, 3], &TreeParams::default());
        assert!(tree.is_stump());
        assert_eq!(tree.n_leaves(), 1);
    }

    #[test]
    fn test_gain_accumulates_on_split_feature() {
        let x = Array2::from_shape_vec((4, 2), vec![0.0, 1.0, 0.0, 2.0, 1.0, 1.0, 1.0, 2.0]).unwrap();
        let (g, h) = squared_error_inputs(&[0.0, 0.0, 5.0, 5.0]);
        let params = TreeParams { min_child_weight: 0.0, ..Default::default() };
        let tree = RegressionTree::fit(x.view(), &g, &h, &[0, 1, 2, 3], &params);
        let mut totals = vec![0.0; 2];
        tree.accumulate_gain(&mut totals);
        assert!(totals[0] > 0.0);
        assert_eq!(totals[1], 0.0);
    }
}
