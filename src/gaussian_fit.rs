use std::f64::consts::PI;

use nalgebra::{Matrix6, Vector6};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    error::{RfError, RfResult},
    params::FitParams,
    receptive_field::{ReceptiveFieldMap, StimulusGrid},
};

pub const NUM_PARAMS: usize = 6;

const PARAM_NAMES: [&str; NUM_PARAMS] = [
    "offset",
    "center_x",
    "center_y",
    "sigma_x",
    "sigma_y",
    "amplitude",
];

const INITIAL_DAMPING: f64 = 1e-3;
const MIN_DAMPING: f64 = 1e-12;
const MAX_DAMPING: f64 = 1e16;
const MIN_DIAGONAL: f64 = 1e-12;
const PSEUDO_INVERSE_EPS: f64 = 1e-15;

// sigmas stay signed, widths go through the magnitude accessors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianParams {
    pub offset: f64,
    pub center_x: f64,
    pub center_y: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    pub amplitude: f64,
}

impl GaussianParams {
    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        self.amplitude * self.envelope(x, y) + self.offset
    }

    fn envelope(&self, x: f64, y: f64) -> f64 {
        let dx = x - self.center_x;
        let dy = y - self.center_y;
        (-(dx * dx / (2.0 * self.sigma_x * self.sigma_x)
            + dy * dy / (2.0 * self.sigma_y * self.sigma_y)))
            .exp()
    }

    fn jacobian_row(&self, x: f64, y: f64) -> Vector6<f64> {
        let dx = x - self.center_x;
        let dy = y - self.center_y;
        let sigma_x2 = self.sigma_x * self.sigma_x;
        let sigma_y2 = self.sigma_y * self.sigma_y;
        let envelope = self.envelope(x, y);
        let scaled = self.amplitude * envelope;

        Vector6::new(
            1.0,
            scaled * dx / sigma_x2,
            scaled * dy / sigma_y2,
            scaled * dx * dx / (sigma_x2 * self.sigma_x),
            scaled * dy * dy / (sigma_y2 * self.sigma_y),
            envelope,
        )
    }

    pub fn sigma_x_magnitude(&self) -> f64 {
        self.sigma_x.abs()
    }

    pub fn sigma_y_magnitude(&self) -> f64 {
        self.sigma_y.abs()
    }

    pub fn area(&self) -> f64 {
        PI * self.sigma_x_magnitude() * self.sigma_y_magnitude()
    }

    pub fn sample_grid(&self, grid: &StimulusGrid) -> Array2<f64> {
        let xs = grid.x_positions();
        let ys = grid.y_positions();
        Array2::from_shape_fn(grid.shape(), |(y_idx, x_idx)| {
            self.evaluate(xs[x_idx], ys[y_idx])
        })
    }

    fn to_vector(self) -> Vector6<f64> {
        Vector6::new(
            self.offset,
            self.center_x,
            self.center_y,
            self.sigma_x,
            self.sigma_y,
            self.amplitude,
        )
    }

    fn from_vector(v: &Vector6<f64>) -> Self {
        Self {
            offset: v[0],
            center_x: v[1],
            center_y: v[2],
            sigma_x: v[3],
            sigma_y: v[4],
            amplitude: v[5],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateMesh {
    xs: Vec<f64>,
    ys: Vec<f64>,
    shape: (usize, usize),
}

impl CoordinateMesh {
    pub fn from_grid(grid: &StimulusGrid) -> Self {
        let mut xs = Vec::with_capacity(grid.num_cells());
        let mut ys = Vec::with_capacity(grid.num_cells());

        for y in grid.y_positions() {
            for x in grid.x_positions() {
                xs.push(*x);
                ys.push(*y);
            }
        }

        Self {
            xs,
            ys,
            shape: grid.shape(),
        }
    }

    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.xs.iter().copied().zip(self.ys.iter().copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitialGuess {
    pub params: GaussianParams,
    pub degenerate: bool,
}

pub fn initial_guess(map: &ReceptiveFieldMap) -> InitialGuess {
    let values = map.values();
    let grid = map.grid();
    let xs = grid.x_positions();
    let ys = grid.y_positions();

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let total = values.sum();
    let weight_total: f64 = values.iter().map(|value| value - min).sum();

    let degenerate = !(total > 0.0 && weight_total > 0.0);

    let (center_x, center_y) = if degenerate {
        let (y_idx, x_idx) = argmax(values);
        (xs[x_idx], ys[y_idx])
    } else {
        let mut weighted_x = 0.0;
        let mut weighted_y = 0.0;

        for ((y_idx, x_idx), value) in values.indexed_iter() {
            weighted_x += (value - min) * xs[x_idx];
            weighted_y += (value - min) * ys[y_idx];
        }

        (weighted_x / weight_total, weighted_y / weight_total)
    };

    let (x_min, x_max) = grid.x_range();
    let (y_min, y_max) = grid.y_range();
    let width = (x_max - x_min).max(y_max - y_min) / 4.0;

    InitialGuess {
        params: GaussianParams {
            offset: min,
            center_x,
            center_y,
            sigma_x: width,
            sigma_y: width,
            amplitude: max - min,
        },
        degenerate,
    }
}

// first maximum in row-major order
fn argmax(values: &Array2<f64>) -> (usize, usize) {
    let mut best_idx = (0, 0);
    let mut best_value = f64::NEG_INFINITY;

    for (idx, value) in values.indexed_iter() {
        if *value > best_value {
            best_value = *value;
            best_idx = idx;
        }
    }

    best_idx
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamBounds {
    pub lower: GaussianParams,
    pub upper: GaussianParams,
}

impl ParamBounds {
    pub fn for_grid(grid: &StimulusGrid, fit_params: &FitParams) -> Self {
        let (x_min, x_max) = grid.x_range();
        let (y_min, y_max) = grid.y_range();

        Self {
            lower: GaussianParams {
                offset: f64::NEG_INFINITY,
                center_x: x_min,
                center_y: y_min,
                sigma_x: fit_params.sigma_min,
                sigma_y: fit_params.sigma_min,
                amplitude: 0.0,
            },
            upper: GaussianParams {
                offset: f64::INFINITY,
                center_x: x_max,
                center_y: y_max,
                sigma_x: fit_params.sigma_max,
                sigma_y: fit_params.sigma_max,
                amplitude: f64::INFINITY,
            },
        }
    }

    fn check_feasible(&self) -> RfResult<()> {
        let lower = self.lower.to_vector();
        let upper = self.upper.to_vector();

        for i in 0..NUM_PARAMS {
            if lower[i] >= upper[i] {
                return Err(RfError::Optimization(format!(
                    "lower bound {} of {} is not below upper bound {}",
                    lower[i], PARAM_NAMES[i], upper[i]
                )));
            }
        }

        Ok(())
    }

    fn check_contains(&self, params: &GaussianParams) -> RfResult<()> {
        let lower = self.lower.to_vector();
        let upper = self.upper.to_vector();
        let values = params.to_vector();

        for i in 0..NUM_PARAMS {
            if !(lower[i] <= values[i] && values[i] <= upper[i]) {
                return Err(RfError::Optimization(format!(
                    "initial guess {} = {} lies outside [{}, {}]",
                    PARAM_NAMES[i], values[i], lower[i], upper[i]
                )));
            }
        }

        Ok(())
    }

    fn project(&self, values: &Vector6<f64>) -> Vector6<f64> {
        let lower = self.lower.to_vector();
        let upper = self.upper.to_vector();
        Vector6::from_fn(|i, _| values[i].clamp(lower[i], upper[i]))
    }

    // parameters sitting on a bound with the descent pointing outward
    fn blocked(&self, values: &Vector6<f64>, descent: &Vector6<f64>) -> [bool; NUM_PARAMS] {
        let lower = self.lower.to_vector();
        let upper = self.upper.to_vector();

        std::array::from_fn(|i| {
            (values[i] <= lower[i] && descent[i] < 0.0)
                || (values[i] >= upper[i] && descent[i] > 0.0)
        })
    }

    fn projected_gradient_norm(&self, values: &Vector6<f64>, descent: &Vector6<f64>) -> f64 {
        let blocked = self.blocked(values, descent);

        (0..NUM_PARAMS)
            .filter(|i| !blocked[*i])
            .map(|i| descent[i].abs())
            .fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone)]
pub struct GaussianFit {
    pub params: GaussianParams,
    pub covariance: Option<Matrix6<f64>>,
    pub mesh: CoordinateMesh,
    pub initial_guess: InitialGuess,
    pub iterations: usize,
    pub cost: f64,
}

impl GaussianFit {
    pub fn predict(&self) -> Array2<f64> {
        let (_, num_x) = self.mesh.shape();

        Array2::from_shape_fn(self.mesh.shape(), |(y_idx, x_idx)| {
            let flat_idx = y_idx * num_x + x_idx;
            self.params
                .evaluate(self.mesh.xs[flat_idx], self.mesh.ys[flat_idx])
        })
    }

    pub fn parameter_errors(&self) -> Option<GaussianParams> {
        let covariance = self.covariance.as_ref()?;
        let errors = Vector6::from_fn(|i, _| covariance[(i, i)].max(0.0).sqrt());
        Some(GaussianParams::from_vector(&errors))
    }

    pub fn is_degenerate(&self) -> bool {
        self.initial_guess.degenerate
    }
}

pub fn fit_gaussian(map: &ReceptiveFieldMap, fit_params: &FitParams) -> RfResult<GaussianFit> {
    let mesh = CoordinateMesh::from_grid(map.grid());
    let observed: Vec<f64> = map.values().iter().copied().collect();

    if mesh.len() < NUM_PARAMS {
        return Err(RfError::Optimization(format!(
            "{} data points cannot constrain {} parameters",
            mesh.len(),
            NUM_PARAMS
        )));
    }

    if observed.iter().any(|value| !value.is_finite()) {
        return Err(RfError::Optimization(
            "map contains non-finite values".to_string(),
        ));
    }

    let bounds = ParamBounds::for_grid(map.grid(), fit_params);
    bounds.check_feasible()?;

    let guess = initial_guess(map);
    if guess.degenerate {
        log::warn!(
            "map without positive signal (total {}), anchoring the fit at the maximum cell ({}, {})",
            map.total(),
            guess.params.center_x,
            guess.params.center_y
        );
    }
    bounds.check_contains(&guess.params)?;

    let problem = LeastSquaresProblem {
        mesh: &mesh,
        observed: &observed,
        bounds: &bounds,
    };

    let solution = problem.solve(guess.params.to_vector(), fit_params)?;
    let params = GaussianParams::from_vector(&solution.values);

    log::debug!(
        "fit converged after {} iterations with cost {:.3e}: {:?}",
        solution.iterations,
        solution.cost,
        params
    );

    let covariance = problem.covariance(&solution);

    Ok(GaussianFit {
        params,
        covariance,
        mesh,
        initial_guess: guess,
        iterations: solution.iterations,
        cost: solution.cost,
    })
}

struct LeastSquaresProblem<'a> {
    mesh: &'a CoordinateMesh,
    observed: &'a [f64],
    bounds: &'a ParamBounds,
}

struct Solution {
    values: Vector6<f64>,
    iterations: usize,
    cost: f64,
}

impl<'a> LeastSquaresProblem<'a> {
    fn solve(&self, initial: Vector6<f64>, fit_params: &FitParams) -> RfResult<Solution> {
        let mut values = initial;
        let mut cost = self.cost(&values);
        let mut damping = INITIAL_DAMPING;

        if !cost.is_finite() {
            return Err(RfError::Optimization(
                "non-finite cost at the initial guess".to_string(),
            ));
        }

        for iteration in 0..fit_params.max_iterations {
            if cost == 0.0 {
                return Ok(Solution {
                    values,
                    iterations: iteration,
                    cost,
                });
            }

            let (jtj, descent) = self.normal_equations(&values);

            if self.bounds.projected_gradient_norm(&values, &descent) <= fit_params.gtol {
                return Ok(Solution {
                    values,
                    iterations: iteration,
                    cost,
                });
            }

            let mut damped = jtj;
            let mut rhs = descent;
            for i in 0..NUM_PARAMS {
                damped[(i, i)] += damping * jtj[(i, i)].max(MIN_DIAGONAL);
            }

            // blocked parameters stay fixed, the step is solved over the free ones
            for (i, blocked) in self.bounds.blocked(&values, &descent).into_iter().enumerate() {
                if blocked {
                    damped.fill_row(i, 0.0);
                    damped.fill_column(i, 0.0);
                    damped[(i, i)] = 1.0;
                    rhs[i] = 0.0;
                }
            }

            let Some(step) = damped.cholesky().map(|cholesky| cholesky.solve(&rhs)) else {
                damping = self.raise_damping(damping)?;
                continue;
            };

            let candidate = self.bounds.project(&(values + step));
            let applied_step_norm = (candidate - values).norm();
            let small_step =
                applied_step_norm <= fit_params.xtol * (fit_params.xtol + values.norm());
            let candidate_cost = self.cost(&candidate);

            if candidate_cost.is_finite() && candidate_cost < cost {
                let reduction = cost - candidate_cost;
                values = candidate;
                damping = (damping / 10.0).max(MIN_DAMPING);

                let small_reduction = reduction <= fit_params.ftol * cost;
                cost = candidate_cost;

                if small_reduction || small_step {
                    return Ok(Solution {
                        values,
                        iterations: iteration + 1,
                        cost,
                    });
                }
            } else {
                if small_step {
                    return Ok(Solution {
                        values,
                        iterations: iteration + 1,
                        cost,
                    });
                }

                damping = self.raise_damping(damping)?;
            }
        }

        Err(RfError::Optimization(format!(
            "no convergence within {} iterations (cost {:.3e})",
            fit_params.max_iterations, cost
        )))
    }

    fn raise_damping(&self, damping: f64) -> RfResult<f64> {
        let raised = damping * 10.0;
        if raised > MAX_DAMPING {
            return Err(RfError::Optimization(
                "damping diverged without reducing the cost".to_string(),
            ));
        }

        Ok(raised)
    }

    fn cost(&self, values: &Vector6<f64>) -> f64 {
        let params = GaussianParams::from_vector(values);

        0.5 * self
            .mesh
            .points()
            .zip(self.observed)
            .map(|((x, y), observed)| {
                let residual = observed - params.evaluate(x, y);
                residual * residual
            })
            .sum::<f64>()
    }

    // JᵀJ and the descent direction Jᵀr
    fn normal_equations(&self, values: &Vector6<f64>) -> (Matrix6<f64>, Vector6<f64>) {
        let params = GaussianParams::from_vector(values);
        let mut jtj = Matrix6::zeros();
        let mut jtr = Vector6::zeros();

        for ((x, y), observed) in self.mesh.points().zip(self.observed) {
            let row = params.jacobian_row(x, y);
            let residual = observed - params.evaluate(x, y);

            jtj += row * row.transpose();
            jtr += row * residual;
        }

        (jtj, jtr)
    }

    fn covariance(&self, solution: &Solution) -> Option<Matrix6<f64>> {
        let dof = self.mesh.len().checked_sub(NUM_PARAMS)?;
        if dof == 0 {
            return None;
        }

        let (jtj, _) = self.normal_equations(&solution.values);
        let residual_variance = 2.0 * solution.cost / dof as f64;

        jtj.pseudo_inverse(PSEUDO_INVERSE_EPS)
            .ok()
            .map(|inverse| inverse * residual_variance)
    }
}
