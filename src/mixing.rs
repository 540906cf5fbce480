//! Batch-level mixup and cutmix. Each pairs a batch with a permutation of itself and
//! returns both label sets plus the weight `lambda` of the original labels.

use burn::{nn::loss::CrossEntropyLoss, prelude::*};
use rand::{seq::SliceRandom, Rng};
use rand_distr::{Beta, Distribution};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixConfig {
    pub mixup_alpha: f64,
    pub cutmix_alpha: f64,
    /// Chance that a batch is mixed at all.
    pub prob: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixKind {
    Mixup,
    CutMix,
}

#[derive(Debug, Clone)]
pub struct MixedBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets_a: Tensor<B, 1, Int>,
    pub targets_b: Tensor<B, 1, Int>,
    pub lambda: f64,
}

impl<B: Backend> MixedBatch<B> {
    pub fn loss(&self, criterion: &CrossEntropyLoss<B>, logits: Tensor<B, 2>) -> Tensor<B, 1> {
        let loss_a = criterion.forward(logits.clone(), self.targets_a.clone());
        let loss_b = criterion.forward(logits, self.targets_b.clone());
        loss_a.mul_scalar(self.lambda) + loss_b.mul_scalar(1.0 - self.lambda)
    }

    /// Lambda-weighted hit count against both label sets.
    pub fn correct(&self, predictions: Tensor<B, 1, Int>) -> f64 {
        let hits_a = count_equal(predictions.clone(), self.targets_a.clone());
        let hits_b = count_equal(predictions, self.targets_b.clone());
        self.lambda * hits_a as f64 + (1.0 - self.lambda) * hits_b as f64
    }
}

pub fn count_equal<B: Backend>(predictions: Tensor<B, 1, Int>, targets: Tensor<B, 1, Int>) -> i64 {
    predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>()
}

/// `Beta(alpha, alpha)`, or 1 when mixing is disabled.
pub fn sample_lambda<R: Rng + ?Sized>(alpha: f64, rng: &mut R) -> f64 {
    if alpha <= 0.0 {
        return 1.0;
    }
    match Beta::new(alpha, alpha) {
        Ok(beta) => beta.sample(rng),
        Err(_) => 1.0,
    }
}

fn permutation<B: Backend, R: Rng + ?Sized>(
    size: usize,
    rng: &mut R,
    device: &B::Device,
) -> Tensor<B, 1, Int> {
    let mut index: Vec<usize> = (0..size).collect();
    index.shuffle(rng);
    let index: Vec<B::IntElem> = index.into_iter().map(|i| (i as i64).elem()).collect();
    Tensor::from_data(TensorData::new(index, [size]), device)
}

pub fn mixup<B: Backend, R: Rng + ?Sized>(
    images: Tensor<B, 4>,
    targets: Tensor<B, 1, Int>,
    alpha: f64,
    rng: &mut R,
) -> MixedBatch<B> {
    let lambda = sample_lambda(alpha, rng);
    let [batch, ..] = images.dims();
    let index = permutation::<B, R>(batch, rng, &images.device());

    let shuffled = images.clone().select(0, index.clone());
    let images = images.mul_scalar(lambda) + shuffled.mul_scalar(1.0 - lambda);

    MixedBatch {
        images,
        targets_b: targets.clone().select(0, index),
        targets_a: targets,
        lambda,
    }
}

/// Box `(y1, x1, y2, x2)` with sides `sqrt(1 - lambda)` of the image, clipped to it.
pub fn random_box<R: Rng + ?Sized>(
    height: usize,
    width: usize,
    lambda: f64,
    rng: &mut R,
) -> (usize, usize, usize, usize) {
    let cut = (1.0 - lambda).max(0.0).sqrt();
    let cut_h = (height as f64 * cut) as i64;
    let cut_w = (width as f64 * cut) as i64;

    let cy = rng.gen_range(0..height) as i64;
    let cx = rng.gen_range(0..width) as i64;

    let clip = |v: i64, hi: usize| v.clamp(0, hi as i64) as usize;
    (
        clip(cy - cut_h / 2, height),
        clip(cx - cut_w / 2, width),
        clip(cy + cut_h / 2, height),
        clip(cx + cut_w / 2, width),
    )
}

pub fn cutmix<B: Backend, R: Rng + ?Sized>(
    images: Tensor<B, 4>,
    targets: Tensor<B, 1, Int>,
    alpha: f64,
    rng: &mut R,
) -> MixedBatch<B> {
    let lambda = sample_lambda(alpha, rng);
    let [batch, channels, height, width] = images.dims();
    let index = permutation::<B, R>(batch, rng, &images.device());
    let (y1, x1, y2, x2) = random_box(height, width, lambda, rng);

    let images = if y2 > y1 && x2 > x1 {
        let region = [0..batch, 0..channels, y1..y2, x1..x2];
        let patch = images.clone().select(0, index.clone()).slice(region.clone());
        images.slice_assign(region, patch)
    } else {
        images
    };
    let lambda = 1.0 - ((y2 - y1) * (x2 - x1)) as f64 / (height * width) as f64;

    MixedBatch {
        images,
        targets_b: targets.clone().select(0, index),
        targets_a: targets,
        lambda,
    }
}

/// Mixes with probability `config.prob`, picking mixup or cutmix evenly.
pub fn maybe_mix<B: Backend, R: Rng + ?Sized>(
    images: Tensor<B, 4>,
    targets: Tensor<B, 1, Int>,
    config: &MixConfig,
    rng: &mut R,
) -> Option<(MixKind, MixedBatch<B>)> {
    if rng.gen::<f64>() >= config.prob {
        return None;
    }
    if rng.gen::<f64>() < 0.5 {
        Some((MixKind::Mixup, mixup(images, targets, config.mixup_alpha, rng)))
    } else {
        Some((MixKind::CutMix, cutmix(images, targets, config.cutmix_alpha, rng)))
    }
}
