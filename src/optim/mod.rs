mod lbfgs;

pub use lbfgs::*;

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

use crate::error::Result;

/// Loss value and gradient of an [objective](Objective) at one point.
#[derive(new, Debug, Clone)]
pub struct Evaluation<B: Backend> {
    /// Scalar objective value.
    pub loss: f64,
    /// Gradient of the objective with respect to every parameter.
    pub grad: Tensor<B, 1>,
}

/// A differentiable scalar function of a flat parameter vector.
///
/// Optimizers may evaluate the objective several times per step, so
/// implementations must not keep state between calls.
pub trait Objective<B: Backend> {
    /// Compute the loss and a fresh gradient at `params`.
    fn evaluate(&self, params: Tensor<B, 1>) -> Result<Evaluation<B>>;
}
