use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Linear warmup from `warmup_start_factor * base_lr`, then cosine decay to `min_lr`
/// over the remaining epochs. Evaluated for the epoch about to run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarmupCosine {
    pub base_lr: f64,
    pub min_lr: f64,
    pub warmup_epochs: usize,
    pub warmup_start_factor: f64,
    pub total_epochs: usize,
}

impl WarmupCosine {
    pub fn lr(&self, epoch: usize) -> f64 {
        if epoch < self.warmup_epochs {
            let progress = epoch as f64 / self.warmup_epochs as f64;
            let factor =
                self.warmup_start_factor + (1.0 - self.warmup_start_factor) * progress;
            return self.base_lr * factor;
        }

        let span = self.total_epochs.saturating_sub(self.warmup_epochs).max(1) as f64;
        let progress = ((epoch - self.warmup_epochs) as f64 / span).min(1.0);
        self.min_lr + (self.base_lr - self.min_lr) * (1.0 + (PI * progress).cos()) / 2.0
    }
}

/// Image side per epoch: 192 for the first ten epochs, 208 for the next ten, then 224.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Fixed(u32),
    Progressive,
}

impl Resolution {
    const STAGES: [(usize, u32); 3] = [(0, 192), (10, 208), (20, 224)];

    pub fn new(progressive: bool, image_size: u32) -> Self {
        if progressive {
            Resolution::Progressive
        } else {
            Resolution::Fixed(image_size)
        }
    }

    pub fn size(&self, epoch: usize) -> u32 {
        match self {
            Resolution::Fixed(size) => *size,
            Resolution::Progressive => Self::STAGES
                .iter()
                .rev()
                .find(|(start, _)| epoch >= *start)
                .map(|(_, size)| *size)
                .unwrap_or(Self::STAGES[0].1),
        }
    }
}
