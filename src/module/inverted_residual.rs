use burn::prelude::*;

use super::conv_bn::{ConvBn, ConvBnConfig};

/// Expand (1x1), depthwise (3x3), project (1x1, linear), with a skip connection when
/// the block keeps both resolution and width.
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvBn<B>>,
    depthwise: ConvBn<B>,
    project: ConvBn<B>,
    residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.project.forward(self.depthwise.forward(x));

        if self.residual {
            input + x
        } else {
            x
        }
    }
}

#[derive(Config, Debug)]
pub struct InvertedResidualConfig {
    pub channels: [usize; 2],
    pub stride: usize,
    pub expand_ratio: usize,
}

impl InvertedResidualConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> InvertedResidual<B> {
        let [input, output] = self.channels;
        let hidden = input * self.expand_ratio;

        let expand = (self.expand_ratio != 1)
            .then(|| ConvBnConfig::new([input, hidden]).init(device));

        InvertedResidual {
            expand,
            depthwise: ConvBnConfig::new([hidden, hidden])
                .with_kernel_size([3, 3])
                .with_stride([self.stride, self.stride])
                .with_groups(hidden)
                .init(device),
            project: ConvBnConfig::new([hidden, output])
                .with_relu6(false)
                .init(device),
            residual: self.stride == 1 && input == output,
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    #[test]
    fn stride_two_halves_the_resolution() {
        let device = Default::default();
        let block = InvertedResidualConfig::new([8, 16], 2, 6).init::<NdArray>(&device);
        let out = block.forward(Tensor::zeros([1, 8, 10, 10], &device));
        assert_eq!(out.dims(), [1, 16, 5, 5]);
    }

    #[test]
    fn matching_shapes_use_the_skip_path() {
        let device = Default::default();
        let block = InvertedResidualConfig::new([8, 8], 1, 1).init::<NdArray>(&device);
        assert!(block.residual);
        assert!(block.expand.is_none());
        let out = block.forward(Tensor::ones([2, 8, 4, 4], &device));
        assert_eq!(out.dims(), [2, 8, 4, 4]);
    }
}
