//! Weighted multi-layer style/content objective over a candidate image.

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};

use crate::error::Result;
use crate::experiment::ExperimentConfig;
use crate::loss::{LossKind, content_loss, style_loss, style_statistic};
use crate::model::{FeatureExtractor, Layer};
use crate::optim::{Evaluation, Objective};

/// Frozen reference a loss term compares the candidate against.
#[derive(Debug, Clone)]
pub enum LossTarget<B: Backend> {
    /// Style statistic of the style image, `[1, C, C]`.
    Style(Tensor<B, 3>),
    /// Activation of the content image, `[1, C, H, W]`.
    Content(Tensor<B, 4>),
}

impl<B: Backend> LossTarget<B> {
    pub fn kind(&self) -> LossKind {
        match self {
            LossTarget::Style(_) => LossKind::Style,
            LossTarget::Content(_) => LossKind::Content,
        }
    }

    fn loss(&self, activation: Tensor<B, 4>) -> Tensor<B, 1> {
        match self {
            LossTarget::Style(target) => style_loss(activation, target.clone()),
            LossTarget::Content(target) => content_loss(activation, target.clone()),
        }
    }
}

/// One weighted comparison at one layer.
#[derive(new, Debug, Clone)]
pub struct LossTerm<B: Backend> {
    pub layer: Layer,
    pub weight: f64,
    pub target: LossTarget<B>,
}

/// Sums weighted per-layer losses of a candidate image.
///
/// Targets are measured once at construction and detached; every evaluation
/// runs a single forward pass over the union of the configured layers.
pub struct LossAggregator<'a, B: Backend> {
    extractor: &'a FeatureExtractor<B>,
    terms: Vec<LossTerm<B>>,
    layers: Vec<Layer>,
    slots: Vec<usize>,
}

impl<'a, B: Backend> LossAggregator<'a, B> {
    /// Measure the frozen targets of `config` on the style and content images.
    ///
    /// The configuration is validated before any forward pass.
    pub fn new(
        extractor: &'a FeatureExtractor<B>,
        config: &ExperimentConfig,
        style_image: Tensor<B, 4>,
        content_image: Tensor<B, 4>,
    ) -> Result<Self> {
        let terms = config.terms()?;

        let style_targets = extractor
            .extract(style_image, &config.style_layers)?
            .into_iter()
            .map(|activation| LossTarget::Style(style_statistic(activation).detach()));
        let content_targets = extractor
            .extract(content_image, &config.content_layers)?
            .into_iter()
            .map(|activation| LossTarget::Content(activation.detach()));

        let terms = terms
            .into_iter()
            .zip(style_targets.chain(content_targets))
            .map(|((layer, kind, weight), target)| {
                debug_assert_eq!(kind, target.kind());
                LossTerm::new(layer, weight, target)
            })
            .collect();

        Ok(Self::from_terms(extractor, terms))
    }

    /// Build an aggregator from already-measured terms.
    ///
    /// Terms with a zero weight are dropped, so their layers are not computed.
    pub fn from_terms(extractor: &'a FeatureExtractor<B>, terms: Vec<LossTerm<B>>) -> Self {
        let terms: Vec<_> = terms.into_iter().filter(|term| term.weight != 0.0).collect();
        let mut layers = Vec::with_capacity(terms.len());
        let mut slots = Vec::with_capacity(terms.len());

        for term in terms.iter() {
            let slot = match layers.iter().position(|layer| *layer == term.layer) {
                Some(slot) => slot,
                None => {
                    layers.push(term.layer);
                    layers.len() - 1
                }
            };
            slots.push(slot);
        }

        Self {
            extractor,
            terms,
            layers,
            slots,
        }
    }

    pub fn terms(&self) -> &[LossTerm<B>] {
        &self.terms
    }

    /// Distinct layers requested from the extractor on every evaluation.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Weighted loss of every term, in term order.
    pub fn term_losses(&self, candidate: Tensor<B, 4>) -> Result<Vec<Tensor<B, 1>>> {
        let activations = self.extractor.extract(candidate, &self.layers)?;

        Ok(self
            .terms
            .iter()
            .zip(&self.slots)
            .map(|(term, slot)| {
                term.target
                    .loss(activations[*slot].clone())
                    .mul_scalar(term.weight)
            })
            .collect())
    }

    /// Total weighted loss of `candidate`.
    pub fn loss(&self, candidate: Tensor<B, 4>) -> Result<Tensor<B, 1>> {
        let device = candidate.device();
        let total = self
            .term_losses(candidate)?
            .into_iter()
            .reduce(|total, loss| total + loss)
            .unwrap_or_else(|| Tensor::zeros([1], &device));

        Ok(total)
    }
}

/// Exposes a [LossAggregator] as an [objective](Objective) over the flattened candidate pixels.
pub struct ImageObjective<'a, 'b, B: AutodiffBackend> {
    aggregator: &'b LossAggregator<'a, B>,
    shape: [usize; 4],
}

impl<'a, 'b, B: AutodiffBackend> ImageObjective<'a, 'b, B> {
    pub fn new(aggregator: &'b LossAggregator<'a, B>, shape: [usize; 4]) -> Self {
        Self { aggregator, shape }
    }
}

impl<B: AutodiffBackend> Objective<B::InnerBackend> for ImageObjective<'_, '_, B> {
    fn evaluate(&self, params: Tensor<B::InnerBackend, 1>) -> Result<Evaluation<B::InnerBackend>> {
        let [numel] = params.dims();

        if self.aggregator.terms().is_empty() {
            let grad = params.zeros_like();
            return Ok(Evaluation::new(0.0, grad));
        }

        // A fresh leaf per evaluation: gradients never accumulate across calls.
        let candidate = Tensor::<B, 4>::from_inner(params.reshape(self.shape)).require_grad();
        let loss = self.aggregator.loss(candidate.clone())?;
        let value = loss.clone().into_scalar().elem::<f64>();

        let grads = loss.backward();
        let grad = match candidate.grad(&grads) {
            Some(grad) => grad.reshape([numel]),
            None => Tensor::zeros([numel], &candidate.device()),
        };

        Ok(Evaluation::new(value, grad))
    }
}
