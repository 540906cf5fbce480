use burn::{
    nn::{
        loss::CrossEntropyLoss,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig,
    },
    prelude::*,
    train::ClassificationOutput,
};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::module::{
    conv_bn::{ConvBn, ConvBnConfig},
    inverted_residual::{InvertedResidual, InvertedResidualConfig},
};

const INVERTED_RESIDUAL_SETTINGS: [[usize; 4]; 7] = [
    // t = expansion factor, c = channels, n = blocks, s = first stride
    // t, c, n, s
    [1, 16, 1, 1],
    [6, 24, 2, 2],
    [6, 32, 3, 2],
    [6, 64, 4, 2],
    [6, 96, 3, 1],
    [6, 160, 3, 2],
    [6, 320, 1, 1],
];

const STEM_CHANNELS: usize = 32;
const HEAD_CHANNELS: usize = 1280;

/// Width presets of the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backbone {
    Small,
    Base,
    Large,
}

impl Backbone {
    pub fn width_multiplier(&self) -> f64 {
        match self {
            Backbone::Small => 0.75,
            Backbone::Base => 1.0,
            Backbone::Large => 1.4,
        }
    }
}

/// Rounds a scaled channel count to a multiple of 8 without dropping more than 10%.
pub fn scaled_channels(channels: usize, width: f64) -> usize {
    let scaled = channels as f64 * width;
    let rounded = (((scaled + 4.0) as usize) / 8 * 8).max(8);
    if (rounded as f64) < 0.9 * scaled {
        rounded + 8
    } else {
        rounded
    }
}

#[derive(Module, Debug)]
struct Classifier<B: Backend> {
    dropout: Dropout,
    linear: Linear<B>,
}

impl<B: Backend> Classifier<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(self.dropout.forward(x))
    }
}

#[derive(Module, Debug)]
enum Stage<B: Backend> {
    Conv(ConvBn<B>),
    InvertedResidual(InvertedResidual<B>),
}

impl<B: Backend> Stage<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Stage::Conv(conv) => conv.forward(x),
            Stage::InvertedResidual(block) => block.forward(x),
        }
    }
}

#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    stages: Vec<Stage<B>>,
    avg_pool: AdaptiveAvgPool2d,
    classifier: Classifier<B>,
}

impl<B: Backend> Model<B> {
    /// `[N, 3, H, W]` images to `[N, classes]` logits.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stages.iter().fold(x, |x, stage| stage.forward(x));
        let x = self.avg_pool.forward(x).flatten(1, 3);
        self.classifier.forward(x)
    }

    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
        criterion: &CrossEntropyLoss<B>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = criterion.forward(output.clone(), targets.clone());
        ClassificationOutput::new(loss, output, targets)
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub classes: usize,

    #[config(default = 0.5)]
    pub dropout: f64,

    #[config(default = "Backbone::Base")]
    pub backbone: Backbone,
}

impl ModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        let width = self.backbone.width_multiplier();
        let mut channels = scaled_channels(STEM_CHANNELS, width);

        let mut stages = vec![Stage::Conv(
            ConvBnConfig::new([3, channels])
                .with_kernel_size([3, 3])
                .with_stride([2, 2])
                .init(device),
        )];

        for [t, c, n, s] in INVERTED_RESIDUAL_SETTINGS {
            let output = scaled_channels(c, width);
            for i in 0..n {
                let stride = if i == 0 { s } else { 1 };
                stages.push(Stage::InvertedResidual(
                    InvertedResidualConfig::new([channels, output], stride, t).init(device),
                ));
                channels = output;
            }
        }

        let head = scaled_channels(HEAD_CHANNELS, width.max(1.0));
        stages.push(Stage::Conv(ConvBnConfig::new([channels, head]).init(device)));

        Model {
            stages,
            avg_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            classifier: Classifier {
                dropout: DropoutConfig::new(self.dropout).init(),
                linear: LinearConfig::new(head, self.classes).init(device),
            },
        }
    }
}
