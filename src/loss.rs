//! Style statistic and the two per-layer losses.

use burn::nn::loss::{MseLoss, Reduction};
use burn::tensor::Tensor;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

/// Which comparison a loss term applies to its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Squared error between style statistics.
    Style,
    /// Squared error between raw activations.
    Content,
}

/// Channel correlation (Gram) matrix of an activation, normalized by its spatial size.
///
/// Entry `(i, j)` is the inner product of the flattened channel maps `i` and
/// `j` divided by `H * W`, which keeps the statistic comparable across image
/// resolutions.
///
/// # Shapes
///
/// - activation: `[batch, C, H, W]`
/// - output: `[batch, C, C]`
pub fn style_statistic<B: Backend>(activation: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, channels, height, width] = activation.dims();
    let features = activation.reshape([batch, channels, height * width]);

    features
        .clone()
        .matmul(features.swap_dims(1, 2))
        .div_scalar((height * width) as f64)
}

/// Mean squared error between the style statistic of `activation` and a frozen target statistic.
pub fn style_loss<B: Backend>(activation: Tensor<B, 4>, target: Tensor<B, 3>) -> Tensor<B, 1> {
    MseLoss::new().forward(style_statistic(activation), target, Reduction::Mean)
}

/// Mean squared error between `activation` and a frozen target activation.
pub fn content_loss<B: Backend>(activation: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    MseLoss::new().forward(activation, target, Reduction::Mean)
}
