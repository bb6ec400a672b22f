use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::{
    data::SurvivalData,
    error::{Result, RiskError},
};

/// How tied event times enter the partial likelihood
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieMethod {
    /// Efron's approximation - closer to the exact likelihood under heavy ties
    #[default]
    Efron,
    Breslow,
}

/// Configuration for Cox model optimization
#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub ties: TieMethod,
    pub max_step_halvings: usize,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-9,
            ties: TieMethod::Efron,
            max_step_halvings: 30,
        }
    }
}

/// What Newton-Raphson hands back on success
#[derive(Debug, Clone)]
pub struct NewtonFit {
    pub beta: Array1<f64>,
    /// observed information (negative Hessian) at `beta`
    pub information: Array2<f64>,
    pub log_likelihood: f64,
    pub null_log_likelihood: f64,
    pub iterations: usize,
}

/// Log partial likelihood plus first and second derivatives
#[derive(Debug, Clone)]
pub struct Derivatives {
    pub log_likelihood: f64,
    pub gradient: Array1<f64>,
    pub information: Array2<f64>,
}

/// flat-likelihood iterations with a large step before the fit is declared divergent
const MAX_FLAT_STEPS: usize = 3;

/// Cox proportional hazards maximiser
pub struct CoxOptimizer {
    config: OptimizationConfig,
}

impl CoxOptimizer {
    pub fn new(config: OptimizationConfig) -> Self {
        Self { config }
    }

    /// Newton-Raphson w/ step halving on the centred design.
    ///
    /// Converged once the log-likelihood change and the Newton step are both
    /// below tolerance. Never returns a partial answer: rank deficiency, a
    /// singular information matrix, diverging coefficients (separated data)
    /// or running out of iterations are all errors.
    pub fn optimize(&self, data: &SurvivalData) -> Result<NewtonFit> {
        let n_features = data.n_features();
        let x = data.centered_covariates();

        let gram = x.t().dot(&x);
        let rank = matrix_rank(&gram);
        if rank < n_features {
            return Err(RiskError::fit(format!(
                "covariate matrix is rank deficient (rank {rank} < {n_features}) - collinear or constant covariates"
            )));
        }

        let mut beta = Array1::zeros(n_features);
        let mut current = self.derivatives(data, x.view(), &beta)?;
        let null_log_likelihood = current.log_likelihood;
        let step_tolerance = self.config.tolerance.sqrt();
        let mut flat_steps = 0;

        for iteration in 1..=self.config.max_iterations {
            let step = solve_linear_system(&current.information, &current.gradient)
                .map_err(|_| RiskError::fit(format!("information matrix singular at iteration {iteration}")))?;

            let mut scale = 1.0;
            let mut halvings = 0;
            let (candidate, next) = loop {
                let candidate = &beta + &(scale * &step);
                match self.derivatives(data, x.view(), &candidate) {
                    Ok(next) if next.log_likelihood >= current.log_likelihood - 1e-12 => {
                        break (candidate, next);
                    }
                    _ if halvings < self.config.max_step_halvings => {
                        scale *= 0.5;
                        halvings += 1;
                    }
                    _ => {
                        return Err(RiskError::fit(format!(
                            "step halving exhausted at iteration {iteration}"
                        )));
                    }
                }
            };

            let change = (next.log_likelihood - current.log_likelihood).abs();
            let step_size = scale * step.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            log::debug!(
                "newton iter {iteration}: loglik {:.8} (change {change:.3e}, step {step_size:.3e}, {halvings} halvings)",
                next.log_likelihood
            );

            beta = candidate;
            current = next;

            let flat = change <= self.config.tolerance * (current.log_likelihood.abs() + self.config.tolerance);
            if flat && step_size > step_tolerance {
                // likelihood has levelled off but the coefficients keep moving
                flat_steps += 1;
                if flat_steps >= MAX_FLAT_STEPS {
                    return Err(RiskError::fit(format!(
                        "coefficients diverge (monotone likelihood) after {iteration} iterations"
                    )));
                }
                continue;
            }
            flat_steps = 0;

            if flat {
                log::debug!("newton converged after {iteration} iterations");
                return Ok(NewtonFit {
                    beta,
                    information: current.information,
                    log_likelihood: current.log_likelihood,
                    null_log_likelihood,
                    iterations: iteration,
                });
            }
        }

        Err(RiskError::fit(format!(
            "Newton-Raphson failed to converge in {} iterations",
            self.config.max_iterations
        )))
    }

    /// Log partial likelihood & derivatives at `beta` for design `x`.
    ///
    /// Risk sets are prefixes of the time-descending order, so the weighted
    /// sums are accumulated once while walking event times backwards.
    pub fn derivatives(
        &self,
        data: &SurvivalData,
        x: ArrayView2<'_, f64>,
        beta: &Array1<f64>,
    ) -> Result<Derivatives> {
        let p = x.ncols();
        let eta = x.dot(beta);
        let risk = eta.mapv(f64::exp);
        if risk.iter().any(|r| !r.is_finite()) {
            return Err(RiskError::numerical_error("exp(linear predictor) overflowed"));
        }

        let mut log_likelihood = 0.0;
        let mut gradient = Array1::<f64>::zeros(p);
        let mut information = Array2::<f64>::zeros((p, p));

        // running sums over the current risk set
        let mut s0 = 0.0;
        let mut s1 = Array1::<f64>::zeros(p);
        let mut s2 = Array2::<f64>::zeros((p, p));
        let mut added = 0;

        for risk_set in data.risk_sets().iter().rev() {
            for &i in &data.risk_set_members(risk_set)[added..] {
                let xi = x.row(i);
                s0 += risk[i];
                s1.scaled_add(risk[i], &xi);
                accumulate_outer(&mut s2, risk[i], &xi.to_owned());
            }
            added = risk_set.size;

            // sums over the tied deaths only (needed by Efron)
            let d = risk_set.deaths.len();
            let mut d0 = 0.0;
            let mut d1 = Array1::<f64>::zeros(p);
            let mut d2 = Array2::<f64>::zeros((p, p));
            for &i in &risk_set.deaths {
                let xi = x.row(i);
                log_likelihood += eta[i];
                gradient += &xi;
                if self.config.ties == TieMethod::Efron && d > 1 {
                    d0 += risk[i];
                    d1.scaled_add(risk[i], &xi);
                    accumulate_outer(&mut d2, risk[i], &xi.to_owned());
                }
            }

            for l in 0..d {
                let phi = match self.config.ties {
                    TieMethod::Efron => l as f64 / d as f64,
                    TieMethod::Breslow => 0.0,
                };
                let denom = s0 - phi * d0;
                if denom <= 0.0 || !denom.is_finite() {
                    return Err(RiskError::numerical_error("risk set sum is non-positive"));
                }
                let mean = (&s1 - &(phi * &d1)) / denom;
                log_likelihood -= denom.ln();
                gradient -= &mean;

                let second = (&s2 - &(phi * &d2)) / denom;
                information += &second;
                accumulate_outer(&mut information, -1.0, &mean);
            }
        }

        Ok(Derivatives {
            log_likelihood,
            gradient,
            information,
        })
    }
}

fn accumulate_outer(target: &mut Array2<f64>, weight: f64, v: &Array1<f64>) {
    let p = v.len();
    for j in 0..p {
        let wj = weight * v[j];
        for k in 0..p {
            target[[j, k]] += wj * v[k];
        }
    }
}

/// numerical rank via Gaussian elimination w/ full pivoting
pub fn matrix_rank(a: &Array2<f64>) -> usize {
    let mut m = a.clone();
    let (rows, cols) = m.dim();
    let scale = m.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 {
        return 0;
    }
    let eps = scale * 1e-10 * rows.max(cols) as f64;

    let mut rank = 0;
    let mut row = 0;
    for col in 0..cols {
        if row >= rows {
            break;
        }
        let pivot = (row..rows)
            .max_by(|&i, &j| m[[i, col]].abs().total_cmp(&m[[j, col]].abs()))
            .unwrap_or(row);
        if m[[pivot, col]].abs() <= eps {
            continue;
        }
        for k in 0..cols {
            m.swap([row, k], [pivot, k]);
        }
        for i in row + 1..rows {
            let factor = m[[i, col]] / m[[row, col]];
            for k in col..cols {
                m[[i, k]] -= factor * m[[row, k]];
            }
        }
        row += 1;
        rank += 1;
    }
    rank
}

/// Solve linear system Ax = b (partial pivoting)
pub fn solve_linear_system(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return Err(RiskError::invalid_dimensions("Matrix dimensions mismatch"));
    }

    let mut a_copy = a.clone();
    let mut b_copy = b.clone();
    let scale = a.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())).max(f64::MIN_POSITIVE);

    // forward elimination
    for i in 0..n {
        let mut max_row = i;
        for k in i + 1..n {
            if a_copy[[k, i]].abs() > a_copy[[max_row, i]].abs() {
                max_row = k;
            }
        }

        if a_copy[[max_row, i]].abs() < 1e-12 * scale {
            return Err(RiskError::numerical_error("Matrix is singular"));
        }

        if max_row != i {
            for j in 0..n {
                a_copy.swap([i, j], [max_row, j]);
            }
            b_copy.swap(i, max_row);
        }

        for k in i + 1..n {
            let factor = a_copy[[k, i]] / a_copy[[i, i]];
            for j in i..n {
                a_copy[[k, j]] -= factor * a_copy[[i, j]];
            }
            b_copy[k] -= factor * b_copy[i];
        }
    }

    // back substitution
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        x[i] = b_copy[i];
        for j in i + 1..n {
            x[i] -= a_copy[[i, j]] * x[j];
        }
        x[i] /= a_copy[[i, i]];
    }

    Ok(x)
}

/// Inverse by solving against each unit vector
pub fn invert(a: &Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    let mut inv = Array2::zeros((n, n));
    for j in 0..n {
        let mut e = Array1::zeros(n);
        e[j] = 1.0;
        let col = solve_linear_system(a, &e)?;
        inv.column_mut(j).assign(&col);
    }
    Ok(inv)
}
