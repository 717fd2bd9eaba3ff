//! VGG-19 convolutional trunk exposing every intermediate activation by name.
//!
//! Layer names follow the `r{stage}{index}` / `p{stage}` convention of the
//! `vgg_conv.pth` snapshot: `r11` is the ReLU after `conv1_1`, `p1` the pooling
//! that closes stage 1, and so on.

use core::fmt;
use core::str::FromStr;
use std::path::Path;

use burn::config::Config;
use burn::module::Module;
use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AvgPool2dConfig, MaxPool2dConfig};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::Tensor;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StyleTransferError};

/// A named output of the [VGG-19](Vgg19) trunk, in computation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    R11,
    R12,
    P1,
    R21,
    R22,
    P2,
    R31,
    R32,
    R33,
    R34,
    P3,
    R41,
    R42,
    R43,
    R44,
    P4,
    R51,
    R52,
    R53,
    R54,
    P5,
}

impl Layer {
    /// Every layer, in the order the forward pass produces them.
    pub const ALL: [Layer; 21] = [
        Layer::R11,
        Layer::R12,
        Layer::P1,
        Layer::R21,
        Layer::R22,
        Layer::P2,
        Layer::R31,
        Layer::R32,
        Layer::R33,
        Layer::R34,
        Layer::P3,
        Layer::R41,
        Layer::R42,
        Layer::R43,
        Layer::R44,
        Layer::P4,
        Layer::R51,
        Layer::R52,
        Layer::R53,
        Layer::R54,
        Layer::P5,
    ];

    /// Position of the layer in the forward pass.
    pub fn position(self) -> usize {
        self as usize
    }

    /// Stage (1 to 5) the layer belongs to.
    pub fn stage(self) -> usize {
        match self {
            Layer::R11 | Layer::R12 | Layer::P1 => 1,
            Layer::R21 | Layer::R22 | Layer::P2 => 2,
            Layer::R31 | Layer::R32 | Layer::R33 | Layer::R34 | Layer::P3 => 3,
            Layer::R41 | Layer::R42 | Layer::R43 | Layer::R44 | Layer::P4 => 4,
            Layer::R51 | Layer::R52 | Layer::R53 | Layer::R54 | Layer::P5 => 5,
        }
    }

    /// Whether the layer is the downsampling that closes its stage.
    pub fn is_pool(self) -> bool {
        matches!(
            self,
            Layer::P1 | Layer::P2 | Layer::P3 | Layer::P4 | Layer::P5
        )
    }

    /// Number of feature channels of the activation.
    pub fn channels(self) -> usize {
        match self.stage() {
            1 => 64,
            2 => 128,
            3 => 256,
            _ => 512,
        }
    }

    /// Number of poolings applied up to and including this layer.
    pub fn downsamplings(self) -> usize {
        if self.is_pool() {
            self.stage()
        } else {
            self.stage() - 1
        }
    }

    /// Index of the convolution feeding this layer, `None` for pooling layers.
    fn conv_index(self) -> Option<usize> {
        if self.is_pool() {
            None
        } else {
            // One pooling layer precedes each stage after the first.
            Some(self.position() - (self.stage() - 1))
        }
    }

    fn name(self) -> &'static str {
        match self {
            Layer::R11 => "r11",
            Layer::R12 => "r12",
            Layer::P1 => "p1",
            Layer::R21 => "r21",
            Layer::R22 => "r22",
            Layer::P2 => "p2",
            Layer::R31 => "r31",
            Layer::R32 => "r32",
            Layer::R33 => "r33",
            Layer::R34 => "r34",
            Layer::P3 => "p3",
            Layer::R41 => "r41",
            Layer::R42 => "r42",
            Layer::R43 => "r43",
            Layer::R44 => "r44",
            Layer::P4 => "p4",
            Layer::R51 => "r51",
            Layer::R52 => "r52",
            Layer::R53 => "r53",
            Layer::R54 => "r54",
            Layer::P5 => "p5",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Layer {
    type Err = StyleTransferError;

    fn from_str(s: &str) -> Result<Self> {
        Layer::ALL
            .into_iter()
            .find(|layer| layer.name() == s)
            .ok_or_else(|| StyleTransferError::Config(format!("unknown layer `{s}`")))
    }
}

/// Spatial downsampling closing each stage of the trunk.
#[derive(Config, Debug, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PoolingKind {
    /// 2x2 max pooling with stride 2.
    Max,
    /// 2x2 average pooling with stride 2.
    Avg,
}

impl PoolingKind {
    fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            PoolingKind::Max => MaxPool2dConfig::new([2, 2])
                .with_strides([2, 2])
                .init()
                .forward(x),
            PoolingKind::Avg => AvgPool2dConfig::new([2, 2])
                .with_strides([2, 2])
                .init()
                .forward(x),
        }
    }
}

/// The sixteen 3x3 convolutions of VGG-19, named after the `vgg_conv.pth` keys.
#[derive(Module, Debug)]
pub struct Vgg19<B: Backend> {
    // Block 1
    conv1_1: Conv2d<B>,
    conv1_2: Conv2d<B>,
    // Block 2
    conv2_1: Conv2d<B>,
    conv2_2: Conv2d<B>,
    // Block 3
    conv3_1: Conv2d<B>,
    conv3_2: Conv2d<B>,
    conv3_3: Conv2d<B>,
    conv3_4: Conv2d<B>,
    // Block 4
    conv4_1: Conv2d<B>,
    conv4_2: Conv2d<B>,
    conv4_3: Conv2d<B>,
    conv4_4: Conv2d<B>,
    // Block 5
    conv5_1: Conv2d<B>,
    conv5_2: Conv2d<B>,
    conv5_3: Conv2d<B>,
    conv5_4: Conv2d<B>,
}

/// `[in, out]` channels of every convolution, in forward order.
const CONV_CHANNELS: [[usize; 2]; 16] = [
    [3, 64],
    [64, 64],
    [64, 128],
    [128, 128],
    [128, 256],
    [256, 256],
    [256, 256],
    [256, 256],
    [256, 512],
    [512, 512],
    [512, 512],
    [512, 512],
    [512, 512],
    [512, 512],
    [512, 512],
    [512, 512],
];

impl<B: Backend> Vgg19<B> {
    /// Create a randomly initialized trunk.
    pub fn new(device: &B::Device) -> Self {
        let conv = |index: usize| {
            Conv2dConfig::new(CONV_CHANNELS[index], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(true)
                .init(device)
        };

        Self {
            conv1_1: conv(0),
            conv1_2: conv(1),
            conv2_1: conv(2),
            conv2_2: conv(3),
            conv3_1: conv(4),
            conv3_2: conv(5),
            conv3_3: conv(6),
            conv3_4: conv(7),
            conv4_1: conv(8),
            conv4_2: conv(9),
            conv4_3: conv(10),
            conv4_4: conv(11),
            conv5_1: conv(12),
            conv5_2: conv(13),
            conv5_3: conv(14),
            conv5_4: conv(15),
        }
    }

    fn convs(&self) -> [&Conv2d<B>; 16] {
        [
            &self.conv1_1,
            &self.conv1_2,
            &self.conv2_1,
            &self.conv2_2,
            &self.conv3_1,
            &self.conv3_2,
            &self.conv3_3,
            &self.conv3_4,
            &self.conv4_1,
            &self.conv4_2,
            &self.conv4_3,
            &self.conv4_4,
            &self.conv5_1,
            &self.conv5_2,
            &self.conv5_3,
            &self.conv5_4,
        ]
    }

    /// Run the trunk up to `last`, returning every activation produced on the way.
    ///
    /// The output is indexed by [Layer::position].
    ///
    /// # Shapes
    ///
    /// - input: `[batch, 3, H, W]`
    /// - output: `last.position() + 1` tensors `[batch, C, H', W']`
    pub fn forward_until(
        &self,
        input: Tensor<B, 4>,
        last: Layer,
        pooling: PoolingKind,
    ) -> Vec<Tensor<B, 4>> {
        let convs = self.convs();
        let mut outputs = Vec::with_capacity(last.position() + 1);
        let mut x = input;

        for layer in Layer::ALL.into_iter().take(last.position() + 1) {
            x = match layer.conv_index() {
                Some(index) => relu(convs[index].forward(x)),
                None => pooling.forward(x),
            };
            outputs.push(x.clone());
        }

        outputs
    }
}

/// Load a parameter snapshot keyed by convolution name.
///
/// PyTorch state dicts (`.pth`, `.pt`) are read with the PyTorch recorder,
/// `.mpk` files with Burn's named MessagePack recorder.
pub fn load_weights<B: Backend>(path: &Path, device: &B::Device) -> Result<Vgg19Record<B>> {
    if !path.exists() {
        return Err(StyleTransferError::MissingWeights(format!(
            "snapshot `{}` does not exist",
            path.display()
        )));
    }

    let is_mpk = path.extension().is_some_and(|ext| ext == "mpk");
    let record = if is_mpk {
        NamedMpkFileRecorder::<FullPrecisionSettings>::new().load(path.to_path_buf(), device)
    } else {
        PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(LoadArgs::new(path.to_path_buf()), device)
    };

    record.map_err(|err| {
        StyleTransferError::MissingWeights(format!(
            "snapshot `{}` is incompatible with VGG-19: {err}",
            path.display()
        ))
    })
}

fn check_record<B: Backend>(record: &Vgg19Record<B>) -> Result<()> {
    let convs = [
        ("conv1_1", &record.conv1_1.weight, &record.conv1_1.bias),
        ("conv1_2", &record.conv1_2.weight, &record.conv1_2.bias),
        ("conv2_1", &record.conv2_1.weight, &record.conv2_1.bias),
        ("conv2_2", &record.conv2_2.weight, &record.conv2_2.bias),
        ("conv3_1", &record.conv3_1.weight, &record.conv3_1.bias),
        ("conv3_2", &record.conv3_2.weight, &record.conv3_2.bias),
        ("conv3_3", &record.conv3_3.weight, &record.conv3_3.bias),
        ("conv3_4", &record.conv3_4.weight, &record.conv3_4.bias),
        ("conv4_1", &record.conv4_1.weight, &record.conv4_1.bias),
        ("conv4_2", &record.conv4_2.weight, &record.conv4_2.bias),
        ("conv4_3", &record.conv4_3.weight, &record.conv4_3.bias),
        ("conv4_4", &record.conv4_4.weight, &record.conv4_4.bias),
        ("conv5_1", &record.conv5_1.weight, &record.conv5_1.bias),
        ("conv5_2", &record.conv5_2.weight, &record.conv5_2.bias),
        ("conv5_3", &record.conv5_3.weight, &record.conv5_3.bias),
        ("conv5_4", &record.conv5_4.weight, &record.conv5_4.bias),
    ];

    for ((name, weight, bias), [channels_in, channels_out]) in
        convs.into_iter().zip(CONV_CHANNELS)
    {
        let expected = [channels_out, channels_in, 3, 3];
        let actual = weight.val().dims();
        if actual != expected {
            return Err(StyleTransferError::MissingWeights(format!(
                "`{name}.weight` has shape {actual:?}, expected {expected:?}"
            )));
        }

        let bias = bias.as_ref().map(|bias| bias.val().dims());
        if bias != Some([channels_out]) {
            return Err(StyleTransferError::MissingWeights(format!(
                "`{name}.bias` has shape {bias:?}, expected [{channels_out}]"
            )));
        }
    }

    Ok(())
}

/// A frozen [VGG-19](Vgg19) answering "give me these activations for this image".
///
/// The parameters never require gradients, so backpropagating a loss through
/// [extract](FeatureExtractor::extract) only reaches the input image.
#[derive(Debug, Clone)]
pub struct FeatureExtractor<B: Backend> {
    network: Option<Vgg19<B>>,
    pooling: PoolingKind,
}

impl<B: Backend> FeatureExtractor<B> {
    /// An extractor whose parameters have not been loaded yet.
    pub fn new(pooling: PoolingKind) -> Self {
        Self {
            network: None,
            pooling,
        }
    }

    /// Freeze an already-populated network.
    pub fn from_network(network: Vgg19<B>, pooling: PoolingKind) -> Self {
        Self {
            network: Some(network.no_grad()),
            pooling,
        }
    }

    /// Load the frozen parameters from a snapshot on disk.
    pub fn from_file(path: &Path, pooling: PoolingKind, device: &B::Device) -> Result<Self> {
        let record = load_weights::<B>(path, device)?;
        let extractor = Self::new(pooling).with_record(record, device)?;
        log::info!("Loaded VGG-19 weights from {}", path.display());

        Ok(extractor)
    }

    /// Populate the network from a record, replacing any previous parameters.
    ///
    /// Fails with [MissingWeights](StyleTransferError::MissingWeights) when a
    /// convolution of the record does not have its VGG-19 shape.
    pub fn with_record(self, record: Vgg19Record<B>, device: &B::Device) -> Result<Self> {
        check_record(&record)?;
        let network = Vgg19::new(device).load_record(record);

        Ok(Self::from_network(network, self.pooling))
    }

    /// Run one forward pass and return the activations of `layers`, in request order.
    ///
    /// Every layer up to the deepest requested one is computed, since each
    /// depends on the previous.
    pub fn extract(&self, image: Tensor<B, 4>, layers: &[Layer]) -> Result<Vec<Tensor<B, 4>>> {
        let network = self.network.as_ref().ok_or_else(|| {
            StyleTransferError::MissingWeights("VGG-19 parameters were never loaded".to_string())
        })?;

        let Some(last) = layers.iter().copied().max() else {
            return Ok(Vec::new());
        };
        check_image_shape(&image, last)?;

        let outputs = network.forward_until(image, last, self.pooling);

        Ok(layers
            .iter()
            .map(|layer| outputs[layer.position()].clone())
            .collect())
    }
}

fn check_image_shape<B: Backend>(image: &Tensor<B, 4>, last: Layer) -> Result<()> {
    let [batch, channels, height, width] = image.dims();

    if batch != 1 || channels != 3 {
        return Err(StyleTransferError::Shape(format!(
            "expected an image of shape [1, 3, H, W], got [{batch}, {channels}, {height}, {width}]"
        )));
    }

    let min_size = 1 << last.downsamplings();
    if height < min_size || width < min_size {
        return Err(StyleTransferError::Shape(format!(
            "image of {height}x{width} is too small to reach layer {last}, need at least {min_size}x{min_size}"
        )));
    }

    Ok(())
}
