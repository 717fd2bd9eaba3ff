//! End-to-end run: load the network and both images once, then optimize and
//! save one image per experiment.

use std::path::{Path, PathBuf};

use burn::tensor::backend::AutodiffBackend;

use crate::cli::Cli;
use crate::data::{ImageTransform, output_path, save_image};
use crate::error::{Result, StyleTransferError};
use crate::experiment::Experiment;
use crate::logger::ConsoleLogger;
use crate::model::FeatureExtractor;
use crate::transfer::{ImageOptimizer, TransferConfig};

/// Input images of a run and the directory its outputs go to.
#[derive(new, Debug, Clone)]
pub struct TransferPaths {
    pub style: PathBuf,
    pub content: PathBuf,
    pub output_dir: PathBuf,
}

impl TransferPaths {
    /// Fail with [MissingFile](StyleTransferError::MissingFile) unless both inputs exist.
    pub fn check_inputs(&self) -> Result<()> {
        for path in [&self.style, &self.content] {
            if !path.is_file() {
                return Err(StyleTransferError::MissingFile(path.clone()));
            }
        }
        Ok(())
    }

    pub fn output(&self, index: usize) -> PathBuf {
        output_path(&self.output_dir, &self.style, &self.content, index)
    }
}

/// Run every experiment requested on the command line and return the written files.
pub fn run<B: AutodiffBackend>(cli: &Cli, device: &B::Device) -> Result<Vec<PathBuf>> {
    let paths = TransferPaths::new(cli.style_path(), cli.content_path(), cli.output_dir.clone());
    paths.check_inputs()?;
    let experiments = cli.experiments()?;

    let extractor = FeatureExtractor::<B>::from_file(&cli.weights, cli.pooling, device)?;

    transfer_images(
        &extractor,
        &cli.transform(),
        &cli.transfer_config(),
        &paths,
        &experiments,
        device,
    )
}

/// Optimize one image per experiment, sequentially, sharing the extractor and inputs.
///
/// Each experiment starts from a fresh copy of the content image.
pub fn transfer_images<B: AutodiffBackend>(
    extractor: &FeatureExtractor<B>,
    transform: &ImageTransform,
    config: &TransferConfig,
    paths: &TransferPaths,
    experiments: &[Experiment],
    device: &B::Device,
) -> Result<Vec<PathBuf>> {
    paths.check_inputs()?;
    let style = transform.load::<B::InnerBackend>(&paths.style, device)?;
    let content = transform.load::<B::InnerBackend>(&paths.content, device)?;

    let mut outputs = Vec::with_capacity(experiments.len());
    for experiment in experiments {
        log::info!(
            "Running experiment {} ({}) on {} and {}",
            experiment.index,
            experiment.name,
            display_name(&paths.style),
            display_name(&paths.content)
        );

        let output = ImageOptimizer::new(extractor, config.clone())
            .prepare(&experiment.config, style.clone(), content.clone())?
            .run(&mut ConsoleLogger)?;

        let image = transform.to_image(output.image)?;
        let path = paths.output(experiment.index);
        save_image(&image, &path)?;
        log::info!(
            "Saved {} (loss: {:.6}, {} evaluations)",
            path.display(),
            output.loss,
            output.evaluations
        );

        outputs.push(path);
    }

    Ok(outputs)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
