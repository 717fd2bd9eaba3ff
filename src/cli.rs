use std::path::PathBuf;

use burn::config::Config;
use clap::Parser;

use crate::data::ImageTransform;
use crate::error::{Result, StyleTransferError};
use crate::experiment::{Experiment, ExperimentConfig, Preset};
use crate::model::PoolingKind;
use crate::optim::LbfgsConfig;
use crate::transfer::TransferConfig;

/// Repaint a content image in the style of another by optimizing its pixels
/// through a frozen VGG-19.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Style image file name, relative to the input directory
    #[clap(value_name = "STYLE")]
    pub style: String,

    /// Content image file name, relative to the input directory
    #[clap(value_name = "CONTENT")]
    pub content: String,

    /// Directory holding the style and content images
    #[clap(long = "input-dir", default_value = "Images")]
    pub input_dir: PathBuf,

    /// Directory receiving the generated images
    #[clap(long = "output-dir", default_value = "Output_Images")]
    pub output_dir: PathBuf,

    /// VGG-19 weights, either a PyTorch `.pth` state dict or a Burn `.mpk` record
    #[clap(long = "weights", default_value = "vgg_conv.pth")]
    pub weights: PathBuf,

    /// Optimizer steps per experiment
    #[clap(long = "iterations", default_value_t = 500)]
    pub iterations: usize,

    /// Log the loss every this many iterations, 0 to disable
    #[clap(long = "report-interval", default_value_t = 50)]
    pub report_interval: usize,

    /// Length of the shorter image side after resizing
    #[clap(long = "image-size", default_value_t = 512)]
    pub image_size: u32,

    /// Downsampling between network stages
    #[clap(long = "pooling", value_enum, default_value_t = PoolingKind::Max)]
    pub pooling: PoolingKind,

    /// Presets to run, in order; all of them when omitted
    #[clap(long = "preset", value_enum)]
    pub presets: Vec<Preset>,

    /// JSON experiment run after the presets
    #[clap(long = "experiment", value_name = "JSON")]
    pub experiment: Option<PathBuf>,
}

impl Cli {
    pub fn style_path(&self) -> PathBuf {
        self.input_dir.join(&self.style)
    }

    pub fn content_path(&self) -> PathBuf {
        self.input_dir.join(&self.content)
    }

    pub fn transform(&self) -> ImageTransform {
        ImageTransform::new().with_image_size(self.image_size)
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig::new(LbfgsConfig::new())
            .with_iterations(self.iterations)
            .with_report_interval(self.report_interval)
    }

    /// Experiments to run, in order.
    ///
    /// Without any `--preset`, all presets run. A custom experiment is always
    /// numbered after the last preset.
    pub fn experiments(&self) -> Result<Vec<Experiment>> {
        let presets = if self.presets.is_empty() {
            Preset::ALL.to_vec()
        } else {
            self.presets.clone()
        };
        let mut experiments: Vec<Experiment> = presets.into_iter().map(Experiment::from).collect();

        if let Some(path) = &self.experiment {
            let config = ExperimentConfig::load(path).map_err(|err| {
                StyleTransferError::Config(format!(
                    "cannot read experiment `{}`: {err}",
                    path.display()
                ))
            })?;
            config.validate()?;

            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "custom".to_string());
            experiments.push(Experiment::new(name, Preset::ALL.len() + 1, config));
        }

        Ok(experiments)
    }
}
