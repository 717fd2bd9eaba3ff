//! Pixel-space optimization of a candidate image.
//!
//! A run moves through three types, one per stage, so no stage can be skipped:
//!
//! 1. [ImageOptimizer]: holds the frozen network and the run settings.
//! 2. [PreparedTransfer]: style and content targets have been measured.
//! 3. [TransferOutput]: the iteration budget is exhausted and the image is final.

use burn::config::Config;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};

use crate::error::Result;
use crate::experiment::ExperimentConfig;
use crate::logger::{Logger, LossReport};
use crate::model::FeatureExtractor;
use crate::objective::{ImageObjective, LossAggregator};
use crate::optim::LbfgsConfig;

/// Settings of the optimization loop.
#[derive(Config, Debug)]
pub struct TransferConfig {
    /// Number of outer optimizer steps; the loop never stops earlier.
    #[config(default = 500)]
    pub iterations: usize,
    /// Report the loss every this many iterations, `0` disables reporting.
    #[config(default = 50)]
    pub report_interval: usize,
    /// Quasi-Newton optimizer settings.
    pub optimizer: LbfgsConfig,
}

/// Entry point of a style transfer run over a shared frozen network.
pub struct ImageOptimizer<'a, B: AutodiffBackend> {
    extractor: &'a FeatureExtractor<B>,
    config: TransferConfig,
}

impl<'a, B: AutodiffBackend> ImageOptimizer<'a, B> {
    pub fn new(extractor: &'a FeatureExtractor<B>, config: TransferConfig) -> Self {
        Self { extractor, config }
    }

    /// Measure the frozen targets of `experiment` on both images.
    ///
    /// The candidate starts as a copy of the content image.
    pub fn prepare(
        self,
        experiment: &ExperimentConfig,
        style_image: Tensor<B::InnerBackend, 4>,
        content_image: Tensor<B::InnerBackend, 4>,
    ) -> Result<PreparedTransfer<'a, B>> {
        let aggregator = LossAggregator::new(
            self.extractor,
            experiment,
            Tensor::from_inner(style_image),
            Tensor::from_inner(content_image.clone()),
        )?;
        log::debug!(
            "Targets computed for {} loss terms over layers {:?}",
            aggregator.terms().len(),
            aggregator.layers()
        );

        Ok(PreparedTransfer {
            aggregator,
            candidate: content_image,
            config: self.config,
        })
    }
}

/// A run whose targets are frozen, ready to optimize.
pub struct PreparedTransfer<'a, B: AutodiffBackend> {
    aggregator: LossAggregator<'a, B>,
    candidate: Tensor<B::InnerBackend, 4>,
    config: TransferConfig,
}

impl<B: AutodiffBackend> PreparedTransfer<'_, B> {
    /// Run the full iteration budget, reporting the loss every `report_interval` iterations.
    pub fn run<L: Logger<LossReport>>(
        self,
        logger: &mut L,
    ) -> Result<TransferOutput<B::InnerBackend>> {
        let shape = self.candidate.dims();
        let numel = shape.iter().product::<usize>();
        let objective = ImageObjective::new(&self.aggregator, shape);
        let mut optimizer = self.config.optimizer.init::<B::InnerBackend>();

        let mut params = self.candidate.reshape([numel]);
        let mut loss = f64::NAN;
        let mut evaluations = 0;

        for iteration in 1..=self.config.iterations {
            let outcome = optimizer.step(params, &objective)?;
            params = outcome.params;
            loss = outcome.loss;
            evaluations += outcome.evaluations;

            let interval = self.config.report_interval;
            if interval > 0 && iteration % interval == 0 {
                logger.log(LossReport::new(iteration, loss));
                if log::log_enabled!(log::Level::Debug) {
                    log_term_losses(&self.aggregator, params.clone().reshape(shape))?;
                }
            }
        }

        log::debug!(
            "Finished {} iterations with {evaluations} objective evaluations",
            self.config.iterations
        );

        Ok(TransferOutput {
            image: params.reshape(shape),
            loss,
            evaluations,
        })
    }
}

fn log_term_losses<B: AutodiffBackend>(
    aggregator: &LossAggregator<'_, B>,
    candidate: Tensor<B::InnerBackend, 4>,
) -> Result<()> {
    let losses = aggregator.term_losses(Tensor::from_inner(candidate))?;

    for (term, loss) in aggregator.terms().iter().zip(losses) {
        log::debug!(
            "{:?} loss at {}: {:.6}",
            term.target.kind(),
            term.layer,
            loss.into_scalar().elem::<f64>()
        );
    }

    Ok(())
}

/// Final candidate of a finished run.
#[derive(Debug, Clone)]
pub struct TransferOutput<B: Backend> {
    /// Optimized image, `[1, 3, H, W]`, in the preprocessed value range.
    pub image: Tensor<B, 4>,
    /// Objective value of the final image, `NaN` when no iteration ran.
    pub loss: f64,
    /// Total number of objective evaluations.
    pub evaluations: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Preset;
    use crate::logger::InMemoryLogger;
    use crate::model::{Layer, PoolingKind, Vgg19};
    use crate::{TestAutodiffBackend, TestBackend};
    use burn::tensor::Distribution;

    fn extractor() -> FeatureExtractor<TestAutodiffBackend> {
        let device = Default::default();
        FeatureExtractor::from_network(Vgg19::new(&device), PoolingKind::Max)
    }

    fn image(size: usize) -> Tensor<TestBackend, 4> {
        let device = Default::default();
        Tensor::random([1, 3, size, size], Distribution::Uniform(-100.0, 100.0), &device)
    }

    #[test]
    fn reports_at_every_interval() {
        let extractor = extractor();
        let config = TransferConfig::new(LbfgsConfig::new())
            .with_iterations(6)
            .with_report_interval(2);

        let mut logger = InMemoryLogger::default();
        let output = ImageOptimizer::new(&extractor, config)
            .prepare(&Preset::Narrow.config(), image(32), image(32))
            .unwrap()
            .run(&mut logger)
            .unwrap();

        let iterations: Vec<_> = logger.values.iter().map(|r| r.iteration).collect();
        assert_eq!(iterations, vec![2, 4, 6]);
        assert_eq!(output.image.dims(), [1, 3, 32, 32]);
        assert!(output.evaluations >= 6);
    }

    #[test]
    fn reported_loss_does_not_increase() {
        let extractor = extractor();
        let config = TransferConfig::new(LbfgsConfig::new())
            .with_iterations(8)
            .with_report_interval(1);

        let mut logger = InMemoryLogger::default();
        ImageOptimizer::new(&extractor, config)
            .prepare(&Preset::Narrow.config(), image(32), image(32))
            .unwrap()
            .run(&mut logger)
            .unwrap();

        let losses: Vec<_> = logger.values.iter().map(|r| r.loss).collect();
        for window in losses.windows(2) {
            assert!(window[1] <= window[0], "{losses:?}");
        }
    }

    #[test]
    fn zero_report_interval_stays_silent() {
        let extractor = extractor();
        let config = TransferConfig::new(LbfgsConfig::new())
            .with_iterations(2)
            .with_report_interval(0);

        let mut logger = InMemoryLogger::default();
        ImageOptimizer::new(&extractor, config)
            .prepare(&Preset::Narrow.config(), image(32), image(32))
            .unwrap()
            .run(&mut logger)
            .unwrap();

        assert!(logger.values.is_empty());
    }

    #[test]
    fn content_only_run_keeps_the_content_image() {
        let extractor = extractor();
        let experiment = ExperimentConfig::new(vec![], vec![Layer::R42], vec![], vec![1.0]);
        let content = image(32);
        let config = TransferConfig::new(LbfgsConfig::new())
            .with_iterations(3)
            .with_report_interval(1);

        let mut logger = InMemoryLogger::default();
        let output = ImageOptimizer::new(&extractor, config)
            .prepare(&experiment, image(32), content.clone())
            .unwrap()
            .run(&mut logger)
            .unwrap();

        assert!(output.loss.abs() < 1e-6);
        let drift = (output.image - content).abs().max().into_scalar();
        assert!(drift < 1e-3, "{drift}");
    }
}
