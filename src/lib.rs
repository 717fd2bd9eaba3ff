//! Neural style transfer: the pixels of a candidate image are optimized with
//! L-BFGS so that its VGG-19 activations match the content of one image and
//! the feature correlations of another.

#[macro_use]
extern crate derive_new;

pub mod cli;
pub mod data;
pub mod error;
pub mod experiment;
pub mod logger;
pub mod loss;
pub mod model;
pub mod objective;
pub mod optim;
pub mod pipeline;
pub mod transfer;

pub use error::{Result, StyleTransferError};

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;

#[cfg(test)]
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
