//! Layer and weight selection for a style transfer run.

use core::fmt;

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StyleTransferError};
use crate::loss::LossKind;
use crate::model::Layer;

/// Style weight for a layer, scaled by the inverse square of its channel count.
///
/// Gram matrices of wide layers have larger norms; without this scaling the
/// deepest layers dominate the objective.
pub fn style_weight(layer: Layer) -> f64 {
    let channels = layer.channels() as f64;
    1e3 / (channels * channels)
}

/// Which layers drive style and content, and how strongly.
///
/// Style weights are parallel to style layers, content weights to content layers.
#[derive(Config, Debug, PartialEq)]
pub struct ExperimentConfig {
    /// Layers whose Gram matrices are matched to the style image.
    pub style_layers: Vec<Layer>,
    /// Layers whose activations are matched to the content image.
    pub content_layers: Vec<Layer>,
    /// One weight per style layer.
    pub style_weights: Vec<f64>,
    /// One weight per content layer.
    pub content_weights: Vec<f64>,
}

impl ExperimentConfig {
    /// Check that both weight lists line up with their layer lists.
    pub fn validate(&self) -> Result<()> {
        if self.style_layers.len() != self.style_weights.len() {
            return Err(StyleTransferError::Config(format!(
                "{} style layers but {} style weights",
                self.style_layers.len(),
                self.style_weights.len()
            )));
        }
        if self.content_layers.len() != self.content_weights.len() {
            return Err(StyleTransferError::Config(format!(
                "{} content layers but {} content weights",
                self.content_layers.len(),
                self.content_weights.len()
            )));
        }
        Ok(())
    }

    /// Flatten into `(layer, kind, weight)` triples, style terms first.
    pub fn terms(&self) -> Result<Vec<(Layer, LossKind, f64)>> {
        self.validate()?;

        let style = self
            .style_layers
            .iter()
            .zip(&self.style_weights)
            .map(|(layer, weight)| (*layer, LossKind::Style, *weight));
        let content = self
            .content_layers
            .iter()
            .zip(&self.content_weights)
            .map(|(layer, weight)| (*layer, LossKind::Content, *weight));

        Ok(style.chain(content).collect())
    }
}

/// An experiment scheduled for a run, with the index naming its output file.
#[derive(new, Debug, Clone)]
pub struct Experiment {
    pub name: String,
    pub index: usize,
    pub config: ExperimentConfig,
}

impl From<Preset> for Experiment {
    fn from(preset: Preset) -> Self {
        Experiment::new(preset.to_string(), preset.index(), preset.config())
    }
}

/// The three documented operating points, from narrow to wide layer coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// Style from `r11`, `r21`; content from `r42`.
    Narrow,
    /// Style from `r11`, `r21`, `r31`; content from `r42`, `r32`.
    Medium,
    /// Style from `r11` to `r51`; content from `r42`, `r32`, `r22`.
    Wide,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Preset::Narrow, Preset::Medium, Preset::Wide];

    /// 1-based index used to name output files.
    pub fn index(self) -> usize {
        match self {
            Preset::Narrow => 1,
            Preset::Medium => 2,
            Preset::Wide => 3,
        }
    }

    pub fn config(self) -> ExperimentConfig {
        let (style_layers, content_layers) = match self {
            Preset::Narrow => (vec![Layer::R11, Layer::R21], vec![Layer::R42]),
            Preset::Medium => (
                vec![Layer::R11, Layer::R21, Layer::R31],
                vec![Layer::R42, Layer::R32],
            ),
            Preset::Wide => (
                vec![Layer::R11, Layer::R21, Layer::R31, Layer::R41, Layer::R51],
                vec![Layer::R42, Layer::R32, Layer::R22],
            ),
        };
        let style_weights = style_layers.iter().copied().map(style_weight).collect();
        let content_weights = vec![1.0; content_layers.len()];

        ExperimentConfig::new(style_layers, content_layers, style_weights, content_weights)
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Preset::Narrow => f.write_str("narrow"),
            Preset::Medium => f.write_str("medium"),
            Preset::Wide => f.write_str("wide"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_preset_matches_documented_values() {
        let config = Preset::Narrow.config();

        assert_eq!(config.style_layers, vec![Layer::R11, Layer::R21]);
        assert_eq!(config.content_layers, vec![Layer::R42]);
        assert_eq!(config.style_weights, vec![1e3 / 64f64.powi(2), 1e3 / 128f64.powi(2)]);
        assert_eq!(config.content_weights, vec![1.0]);
    }

    #[test]
    fn presets_widen_layer_coverage() {
        let sizes: Vec<_> = Preset::ALL
            .iter()
            .map(|preset| {
                let config = preset.config();
                (config.style_layers.len(), config.content_layers.len())
            })
            .collect();

        assert_eq!(sizes, vec![(2, 1), (3, 2), (5, 3)]);
    }

    #[test]
    fn wide_preset_weights_deep_layers_by_width() {
        let config = Preset::Wide.config();

        assert_eq!(config.style_weights[3], 1e3 / 512f64.powi(2));
        assert_eq!(config.style_weights[4], 1e3 / 512f64.powi(2));
        assert_eq!(config.content_layers, vec![Layer::R42, Layer::R32, Layer::R22]);
    }

    #[test]
    fn presets_are_valid() {
        for preset in Preset::ALL {
            preset.config().validate().unwrap();
        }
    }

    #[test]
    fn mismatched_style_weights_are_rejected() {
        let config = ExperimentConfig::new(
            vec![Layer::R11, Layer::R21],
            vec![Layer::R42],
            vec![1.0],
            vec![1.0],
        );

        assert!(matches!(config.validate(), Err(StyleTransferError::Config(_))));
        assert!(matches!(config.terms(), Err(StyleTransferError::Config(_))));
    }

    #[test]
    fn mismatched_content_weights_are_rejected() {
        let config = ExperimentConfig::new(vec![Layer::R11], vec![Layer::R42], vec![1.0], vec![]);

        assert!(matches!(config.validate(), Err(StyleTransferError::Config(_))));
    }

    #[test]
    fn terms_list_style_before_content() {
        let terms = Preset::Medium.config().terms().unwrap();
        let kinds: Vec<_> = terms.iter().map(|(_, kind, _)| *kind).collect();

        assert_eq!(
            kinds,
            vec![
                LossKind::Style,
                LossKind::Style,
                LossKind::Style,
                LossKind::Content,
                LossKind::Content
            ]
        );
        assert_eq!(terms[3].0, Layer::R42);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Preset::Wide.config();
        let json = config.to_string();

        let loaded = ExperimentConfig::load_binary(json.as_bytes()).unwrap();

        assert!(json.contains("\"r51\""));
        assert_eq!(loaded.style_layers, config.style_layers);
        assert_eq!(loaded.content_layers, config.content_layers);
        for (loaded, expected) in loaded.style_weights.iter().zip(&config.style_weights) {
            assert!((loaded - expected).abs() < 1e-12);
        }
    }
}
