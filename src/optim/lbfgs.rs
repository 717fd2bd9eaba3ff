use std::collections::VecDeque;

use burn::config::Config;
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};

use super::{Evaluation, Objective};
use crate::error::Result;

/// Minimum `sᵀy` for a curvature pair to be kept in the history.
const CURVATURE_EPSILON: f64 = 1e-10;

/// L-BFGS configuration.
#[derive(Config, Debug)]
pub struct LbfgsConfig {
    /// Initial step length tried by the line search.
    #[config(default = 1.0)]
    pub learning_rate: f64,
    /// Number of curvature pairs kept to approximate the inverse Hessian.
    #[config(default = 100)]
    pub history_size: usize,
    /// Maximum objective evaluations spent by the line search of one step.
    #[config(default = 25)]
    pub max_evaluations: usize,
    /// A step is skipped when every gradient component is below this value.
    #[config(default = 1e-7)]
    pub tolerance_grad: f64,
    /// A direction whose slope is above `-tolerance_change` is not a descent direction.
    #[config(default = 1e-9)]
    pub tolerance_change: f64,
    /// Armijo constant: accepted steps decrease the loss by at least this fraction of the predicted decrease.
    #[config(default = 1e-4)]
    pub sufficient_decrease: f64,
    /// Factor applied to the step length after each rejected trial.
    #[config(default = 0.5)]
    pub backtrack: f64,
}

impl LbfgsConfig {
    /// Initialize an L-BFGS optimizer with an empty history.
    pub fn init<B: Backend>(&self) -> Lbfgs<B> {
        Lbfgs {
            config: self.clone(),
            history: VecDeque::with_capacity(self.history_size),
            gamma: 1.0,
            current: None,
        }
    }
}

/// Result of one [L-BFGS step](Lbfgs::step).
#[derive(new, Debug, Clone)]
pub struct StepOutcome<B: Backend> {
    /// Parameters after the step.
    pub params: Tensor<B, 1>,
    /// Objective value at `params`.
    pub loss: f64,
    /// Number of objective evaluations the step used.
    pub evaluations: usize,
}

#[derive(Clone)]
struct CurvaturePair<B: Backend> {
    s: Tensor<B, 1>,
    y: Tensor<B, 1>,
    rho: f64,
}

/// Limited-memory BFGS with a backtracking Armijo line search.
///
/// The optimizer remembers the evaluation at the parameters it returned, so
/// each call to [step](Lbfgs::step) must receive the parameters produced by the
/// previous one. Call [reset](Lbfgs::reset) before optimizing anything else.
pub struct Lbfgs<B: Backend> {
    config: LbfgsConfig,
    history: VecDeque<CurvaturePair<B>>,
    gamma: f64,
    current: Option<Evaluation<B>>,
}

impl<B: Backend> Lbfgs<B> {
    /// Forget the curvature history and the cached evaluation.
    pub fn reset(&mut self) {
        self.history.clear();
        self.gamma = 1.0;
        self.current = None;
    }

    /// Number of curvature pairs currently stored.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Perform one quasi-Newton step from `params`.
    ///
    /// The returned loss never exceeds the loss at `params`: when the line
    /// search finds no acceptable point, the parameters are returned unchanged
    /// and the history is dropped.
    pub fn step<O: Objective<B>>(
        &mut self,
        params: Tensor<B, 1>,
        objective: &O,
    ) -> Result<StepOutcome<B>> {
        let mut evaluations = 0;
        let current = match self.current.take() {
            Some(current) => current,
            None => {
                evaluations += 1;
                objective.evaluate(params.clone())?
            }
        };

        if max_abs(&current.grad) <= self.config.tolerance_grad {
            return Ok(self.stay(params, current, evaluations));
        }

        let direction = self.direction(current.grad.clone());
        let slope = dot(&current.grad, &direction);
        if slope > -self.config.tolerance_change {
            log::debug!("L-BFGS direction is not a descent direction, clearing history");
            self.history.clear();
            self.gamma = 1.0;
            return Ok(self.stay(params, current, evaluations));
        }

        let mut step_size = if self.history.is_empty() {
            let grad_l1 = current.grad.clone().abs().sum().into_scalar().elem::<f64>();
            self.config.learning_rate * f64::min(1.0, 1.0 / grad_l1)
        } else {
            self.config.learning_rate
        };

        for _ in 0..self.config.max_evaluations.max(1) {
            let candidate = params.clone() + direction.clone().mul_scalar(step_size);
            let trial = objective.evaluate(candidate.clone())?;
            evaluations += 1;

            let expected = current.loss + self.config.sufficient_decrease * step_size * slope;
            if trial.loss.is_finite() && trial.loss <= expected {
                let s = direction.mul_scalar(step_size);
                let y = trial.grad.clone() - current.grad;
                self.remember(s, y);

                let loss = trial.loss;
                self.current = Some(trial);
                return Ok(StepOutcome::new(candidate, loss, evaluations));
            }

            step_size *= self.config.backtrack;
        }

        log::debug!("L-BFGS line search failed after {evaluations} evaluations, clearing history");
        self.history.clear();
        self.gamma = 1.0;
        Ok(self.stay(params, current, evaluations))
    }

    fn stay(
        &mut self,
        params: Tensor<B, 1>,
        current: Evaluation<B>,
        evaluations: usize,
    ) -> StepOutcome<B> {
        let loss = current.loss;
        self.current = Some(current);
        StepOutcome::new(params, loss, evaluations)
    }

    fn remember(&mut self, s: Tensor<B, 1>, y: Tensor<B, 1>) {
        let ys = dot(&y, &s);
        if ys <= CURVATURE_EPSILON {
            return;
        }

        if self.history.len() == self.config.history_size {
            self.history.pop_front();
        }
        if self.config.history_size > 0 {
            self.gamma = ys / dot(&y, &y);
            self.history.push_back(CurvaturePair { s, y, rho: 1.0 / ys });
        }
    }

    /// Two-loop recursion: approximate `-H⁻¹ g` from the stored curvature pairs.
    fn direction(&self, grad: Tensor<B, 1>) -> Tensor<B, 1> {
        let mut q = grad.neg();
        let mut alphas = Vec::with_capacity(self.history.len());

        for pair in self.history.iter().rev() {
            let alpha = pair.rho * dot(&pair.s, &q);
            q = q - pair.y.clone().mul_scalar(alpha);
            alphas.push(alpha);
        }

        let mut r = q.mul_scalar(self.gamma);
        for (pair, alpha) in self.history.iter().zip(alphas.into_iter().rev()) {
            let beta = pair.rho * dot(&pair.y, &r);
            r = r + pair.s.clone().mul_scalar(alpha - beta);
        }

        r
    }
}

fn dot<B: Backend>(lhs: &Tensor<B, 1>, rhs: &Tensor<B, 1>) -> f64 {
    lhs.clone()
        .mul(rhs.clone())
        .sum()
        .into_scalar()
        .elem::<f64>()
}

fn max_abs<B: Backend>(tensor: &Tensor<B, 1>) -> f64 {
    tensor.clone().abs().max().into_scalar().elem::<f64>()
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;
    use crate::TestBackend;
    use burn::tensor::TensorData;

    /// `sum(scale_i * (x_i - center_i)^2) / 2`
    struct Quadratic {
        scale: Vec<f32>,
        center: Vec<f32>,
        calls: Cell<usize>,
    }

    impl Quadratic {
        fn new(scale: Vec<f32>, center: Vec<f32>) -> Self {
            Self {
                scale,
                center,
                calls: Cell::new(0),
            }
        }
    }

    impl Objective<TestBackend> for Quadratic {
        fn evaluate(&self, params: Tensor<TestBackend, 1>) -> Result<Evaluation<TestBackend>> {
            self.calls.set(self.calls.get() + 1);
            let device = params.device();
            let scale = Tensor::<TestBackend, 1>::from_floats(self.scale.as_slice(), &device);
            let center = Tensor::<TestBackend, 1>::from_floats(self.center.as_slice(), &device);

            let diff = params - center;
            let grad = diff.clone().mul(scale);
            let loss = dot(&diff, &grad) / 2.0;

            Ok(Evaluation::new(loss, grad))
        }
    }

    struct Rosenbrock;

    impl Objective<TestBackend> for Rosenbrock {
        fn evaluate(&self, params: Tensor<TestBackend, 1>) -> Result<Evaluation<TestBackend>> {
            let device = params.device();
            let values = params.into_data().to_vec::<f32>().unwrap();
            let (x, y) = (values[0] as f64, values[1] as f64);

            let loss = (1.0 - x).powi(2) + 100.0 * (y - x * x).powi(2);
            let grad = [
                (-2.0 * (1.0 - x) - 400.0 * x * (y - x * x)) as f32,
                (200.0 * (y - x * x)) as f32,
            ];

            Ok(Evaluation::new(
                loss,
                Tensor::from_data(TensorData::from(grad), &device),
            ))
        }
    }

    fn minimize<O: Objective<TestBackend>>(
        objective: &O,
        start: Tensor<TestBackend, 1>,
        steps: usize,
    ) -> (Tensor<TestBackend, 1>, Vec<f64>) {
        let mut optim = LbfgsConfig::new().init::<TestBackend>();
        let mut params = start;
        let mut losses = Vec::with_capacity(steps);

        for _ in 0..steps {
            let outcome = optim.step(params, objective).unwrap();
            params = outcome.params;
            losses.push(outcome.loss);
        }

        (params, losses)
    }

    #[test]
    fn minimizes_ill_conditioned_quadratic() {
        let device = Default::default();
        let objective = Quadratic::new(vec![1.0, 10.0, 100.0], vec![1.0, -2.0, 3.0]);
        let start = Tensor::<TestBackend, 1>::zeros([3], &device);

        let (params, losses) = minimize(&objective, start, 30);

        let values = params.into_data().to_vec::<f32>().unwrap();
        for (value, expected) in values.iter().zip([1.0, -2.0, 3.0]) {
            assert!((value - expected).abs() < 1e-3, "{values:?}");
        }
        assert!(*losses.last().unwrap() < 1e-6);
    }

    #[test]
    fn minimizes_rosenbrock() {
        let device = Default::default();
        let start = Tensor::<TestBackend, 1>::from_floats([-1.2, 1.0], &device);

        let (params, _) = minimize(&Rosenbrock, start, 300);

        let values = params.into_data().to_vec::<f32>().unwrap();
        assert!((values[0] - 1.0).abs() < 1e-2, "{values:?}");
        assert!((values[1] - 1.0).abs() < 2e-2, "{values:?}");
    }

    #[test]
    fn reported_losses_never_increase() {
        let device = Default::default();
        let start = Tensor::<TestBackend, 1>::from_floats([-1.2, 1.0], &device);

        let (_, losses) = minimize(&Rosenbrock, start, 50);

        for window in losses.windows(2) {
            assert!(window[1] <= window[0], "{losses:?}");
        }
    }

    #[test]
    fn reuses_the_evaluation_of_the_accepted_point() {
        let device = Default::default();
        let objective = Quadratic::new(vec![1.0, 1.0], vec![1.0, 1.0]);
        let mut optim = LbfgsConfig::new().init::<TestBackend>();
        let params = Tensor::<TestBackend, 1>::zeros([2], &device);

        let first = optim.step(params, &objective).unwrap();
        let calls_after_first = objective.calls.get();
        let second = optim.step(first.params, &objective).unwrap();

        // The first step evaluates the start point and one trial; with an
        // identity Hessian the second step lands on the minimum at once.
        assert_eq!(first.evaluations, calls_after_first);
        assert_eq!(first.evaluations, 2);
        assert_eq!(second.evaluations, objective.calls.get() - calls_after_first);
        assert_eq!(second.evaluations, 1);
        assert!(second.loss < 1e-10);
    }

    #[test]
    fn line_search_backtracks_from_oversized_steps() {
        let device = Default::default();
        let objective = Quadratic::new(vec![1.0], vec![0.0]);
        let mut optim = LbfgsConfig::new()
            .with_learning_rate(1e4)
            .init::<TestBackend>();
        let params = Tensor::<TestBackend, 1>::from_floats([1.0], &device);

        let outcome = optim.step(params, &objective).unwrap();

        assert!(outcome.evaluations > 2);
        assert!(outcome.loss < 0.5);
    }

    #[test]
    fn zero_gradient_leaves_parameters_unchanged() {
        let device = Default::default();
        let objective = Quadratic::new(vec![1.0, 1.0], vec![2.0, 3.0]);
        let mut optim = LbfgsConfig::new().init::<TestBackend>();
        let params = Tensor::<TestBackend, 1>::from_floats([2.0, 3.0], &device);

        let outcome = optim.step(params.clone(), &objective).unwrap();

        outcome
            .params
            .into_data()
            .assert_eq(&params.into_data(), true);
        assert_eq!(outcome.evaluations, 1);
        assert_eq!(optim.history_len(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let device = Default::default();
        let objective = Quadratic::new(vec![1.0, 4.0, 9.0, 16.0], vec![1.0, 1.0, 1.0, 1.0]);
        let mut optim = LbfgsConfig::new()
            .with_history_size(2)
            .init::<TestBackend>();
        let mut params = Tensor::<TestBackend, 1>::zeros([4], &device);

        for _ in 0..6 {
            params = optim.step(params, &objective).unwrap().params;
            assert!(optim.history_len() <= 2);
        }
    }
}
