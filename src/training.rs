use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    config::Config,
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::{
            transform::{PartialDataset, ShuffledDataset},
            Dataset,
        },
    },
    module::{AutodiffModule, Module},
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    grad_clipping::GradientClippingConfig,
    optim::{AdamWConfig, GradientsParams, Optimizer},
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{
        Checkpoint, TrainingHistory, CONFIG_FILE, HISTORY_FILE, MODEL_FILE, OPTIMIZER_FILE,
    },
    data::{Cat, CatBatch, CatBatcher, CatDataset, ImageFolder},
    early_stopping::{EarlyStopping, Verdict},
    error::Error,
    mapping::CLASSES_FILE,
    mixing::{count_equal, maybe_mix, MixConfig},
    model::{Model, ModelConfig},
    schedule::{Resolution, WarmupCosine},
    transform::{EvalTransform, TrainTransform, Transform},
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,

    pub optimizer: AdamWConfig,

    #[config(default = 40)]
    pub epoch_count: usize,

    #[config(default = 32)]
    pub batch_size: usize,

    #[config(default = 4)]
    pub worker_count: usize,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 3.0e-4)]
    pub learning_rate: f64,

    #[config(default = 1.0e-6)]
    pub min_learning_rate: f64,

    #[config(default = 3)]
    pub warmup_epochs: usize,

    #[config(default = 0.1)]
    pub warmup_start_factor: f64,

    #[config(default = 10)]
    pub patience: usize,

    #[config(default = 0.6)]
    pub mixup_alpha: f64,

    #[config(default = 1.2)]
    pub cutmix_alpha: f64,

    /// Chance that a training batch goes through mixup or cutmix.
    #[config(default = 0.7)]
    pub mix_prob: f64,

    #[config(default = 0.2)]
    pub label_smoothing: f32,

    #[config(default = false)]
    pub progressive_resize: bool,

    #[config(default = 224)]
    pub image_size: u32,
}

impl TrainingConfig {
    /// AdamW with decoupled weight decay and gradient-norm clipping.
    pub fn optimizer(weight_decay: f32, grad_clip_norm: f32) -> AdamWConfig {
        AdamWConfig::new()
            .with_beta_1(0.9)
            .with_beta_2(0.999)
            .with_weight_decay(weight_decay)
            .with_grad_clipping(Some(GradientClippingConfig::Norm(grad_clip_norm)))
    }

    pub fn schedule(&self) -> WarmupCosine {
        WarmupCosine {
            base_lr: self.learning_rate,
            min_lr: self.min_learning_rate,
            warmup_epochs: self.warmup_epochs,
            warmup_start_factor: self.warmup_start_factor,
            total_epochs: self.epoch_count,
        }
    }

    pub fn mix(&self) -> MixConfig {
        MixConfig {
            mixup_alpha: self.mixup_alpha,
            cutmix_alpha: self.cutmix_alpha,
            prob: self.mix_prob,
        }
    }
}

/// Where data is read from and artifacts are written to.
#[derive(Debug, Clone)]
pub struct TrainingPaths {
    pub train_dir: PathBuf,
    pub validation_dir: PathBuf,
    /// Weights, optimizer state, `classes.json`, `config.json`.
    pub model_dir: PathBuf,
    /// `training_history.json`.
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub loss: f64,
    /// Percent.
    pub accuracy: f64,
    pub steps: usize,
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub best_accuracy: f64,
    pub best_epoch: usize,
    pub early_stopped: bool,
    pub history: TrainingHistory,
    /// Optimizer steps taken in each epoch.
    pub epoch_steps: Vec<usize>,
    /// Image size each epoch trained at.
    pub epoch_sizes: Vec<u32>,
}

fn progress_bar(len: usize, label: &'static str) -> ProgressBar {
    let style = ProgressStyle::with_template("{prefix:>10} [{bar:30}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    ProgressBar::new(len as u64)
        .with_style(style)
        .with_prefix(label)
}

/// Largest worker count up to `max` that splits `batches` evenly. The multi-worker
/// loader hands each worker a contiguous slice, so uneven slices yield partial batches.
fn aligned_workers(batches: usize, max: usize) -> usize {
    (1..=max.max(1))
        .rev()
        .find(|workers| batches % workers == 0)
        .unwrap_or(1)
}

/// Training loader for one epoch: the whole set shuffled with the epoch seed, cut to
/// full batches. Returns the loader and its batch count.
pub fn train_loader<B: Backend>(
    folder: &ImageFolder,
    config: &TrainingConfig,
    size: u32,
    epoch: usize,
    device: &B::Device,
) -> (Arc<dyn DataLoader<CatBatch<B>>>, usize) {
    let epoch_seed = config.seed.wrapping_add(epoch as u64);
    let batch_size = config.batch_size.max(1);
    let dataset = CatDataset::new(
        folder,
        Transform::Train(TrainTransform::new(size)),
        epoch_seed,
    );

    let batches = dataset.len() / batch_size;
    let shuffled: ShuffledDataset<CatDataset, Cat> = ShuffledDataset::with_seed(dataset, epoch_seed);
    let full_batches = PartialDataset::new(shuffled, 0, batches * batch_size);

    let loader = DataLoaderBuilder::new(CatBatcher::<B>::new(device.clone()))
        .batch_size(batch_size)
        .num_workers(aligned_workers(batches, config.worker_count))
        .build(full_batches);
    (loader, batches)
}

pub fn valid_loader<B: Backend>(
    folder: &ImageFolder,
    config: &TrainingConfig,
    size: u32,
    device: &B::Device,
) -> Arc<dyn DataLoader<CatBatch<B>>> {
    let dataset = CatDataset::new(
        folder,
        Transform::Eval(EvalTransform::for_size(size)),
        config.seed,
    );
    DataLoaderBuilder::new(CatBatcher::<B>::new(device.clone()))
        .batch_size(config.batch_size.max(1))
        .num_workers(config.worker_count.max(1))
        .build(dataset)
}

fn train_epoch<B, O>(
    mut model: Model<B>,
    optimizer: &mut O,
    loader: &Arc<dyn DataLoader<CatBatch<B>>>,
    criterion: &CrossEntropyLoss<B>,
    mix: &MixConfig,
    batches: usize,
    lr: f64,
    rng: &mut ChaCha8Rng,
) -> (Model<B>, EpochMetrics)
where
    B: AutodiffBackend,
    O: Optimizer<Model<B>, B>,
{
    let progress = progress_bar(batches, "train");
    let mut running_loss = 0.0;
    let mut correct = 0.0;
    let mut seen = 0usize;
    let mut steps = 0usize;

    for batch in loader.iter() {
        let count = batch.targets.dims()[0];
        let (loss, hits) = match maybe_mix(batch.images.clone(), batch.targets.clone(), mix, rng) {
            Some((kind, mixed)) => {
                let output = model.forward(mixed.images.clone());
                let loss = mixed.loss(criterion, output.clone());
                let hits = mixed.correct(output.argmax(1).squeeze::<1>(1));
                debug!(?kind, lambda = mixed.lambda, "mixed batch");
                (loss, hits)
            }
            None => {
                let output = model.forward(batch.images);
                let loss = criterion.forward(output.clone(), batch.targets.clone());
                let hits = count_equal(output.argmax(1).squeeze::<1>(1), batch.targets) as f64;
                (loss, hits)
            }
        };

        let loss_value = loss.clone().into_scalar().elem::<f64>();
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optimizer.step(lr, model, grads);

        running_loss += loss_value;
        correct += hits;
        seen += count;
        steps += 1;

        progress.inc(1);
        progress.set_message(format!("loss {loss_value:.4}"));
    }
    progress.finish_and_clear();

    let metrics = EpochMetrics {
        loss: running_loss / steps.max(1) as f64,
        accuracy: 100.0 * correct / seen.max(1) as f64,
        steps,
    };
    (model, metrics)
}

pub fn validate<B: Backend>(
    model: &Model<B>,
    loader: &Arc<dyn DataLoader<CatBatch<B>>>,
    criterion: &CrossEntropyLoss<B>,
    batches: usize,
) -> EpochMetrics {
    let progress = progress_bar(batches, "valid");
    let mut running_loss = 0.0;
    let mut correct = 0i64;
    let mut seen = 0usize;
    let mut steps = 0usize;

    for batch in loader.iter() {
        seen += batch.targets.dims()[0];
        let output = model.forward_classification(batch.images, batch.targets, criterion);
        running_loss += output.loss.into_scalar().elem::<f64>();
        correct += count_equal(output.output.argmax(1).squeeze::<1>(1), output.targets);
        steps += 1;
        progress.inc(1);
    }
    progress.finish_and_clear();

    EpochMetrics {
        loss: running_loss / steps.max(1) as f64,
        accuracy: 100.0 * correct as f64 / seen.max(1) as f64,
        steps,
    }
}

fn save_best<B: AutodiffBackend, O: Optimizer<Model<B>, B>>(
    model_dir: &Path,
    model: &Model<B>,
    optimizer: &O,
    checkpoint: &Checkpoint,
) -> crate::Result<()> {
    let recorder = CompactRecorder::new();
    model.clone().save_file(model_dir.join(MODEL_FILE), &recorder)?;
    Recorder::<B>::record(&recorder, optimizer.to_record(), model_dir.join(OPTIMIZER_FILE))?;
    checkpoint.save(model_dir)
}

pub fn train<B: AutodiffBackend>(
    paths: &TrainingPaths,
    mut config: TrainingConfig,
    device: B::Device,
) -> crate::Result<TrainingSummary> {
    for dir in [&paths.train_dir, &paths.validation_dir] {
        if !dir.is_dir() {
            return Err(Error::PathNotFound(dir.clone()));
        }
    }

    let train_folder = ImageFolder::scan(&paths.train_dir)?;
    let valid_folder = ImageFolder::scan(&paths.validation_dir)?;
    if train_folder.mapping != valid_folder.mapping {
        return Err(Error::Dataset(format!(
            "train classes {:?} differ from validation classes {:?}",
            train_folder.mapping.classes, valid_folder.mapping.classes
        )));
    }
    let classes = train_folder.mapping.clone();

    let train_batches = train_folder.len() / config.batch_size.max(1);
    let valid_batches = valid_folder.len().div_ceil(config.batch_size.max(1));
    if train_batches == 0 {
        return Err(Error::Training(format!(
            "{} training images cannot fill a batch of {}",
            train_folder.len(),
            config.batch_size
        )));
    }
    if valid_folder.is_empty() {
        return Err(Error::Dataset("validation set is empty".to_string()));
    }

    info!(
        train = train_folder.len(),
        validation = valid_folder.len(),
        classes = classes.len(),
        per_class = %format!("{:.1}", train_folder.len() as f64 / classes.len() as f64),
        "datasets loaded"
    );

    config.model.classes = classes.len();
    std::fs::create_dir_all(&paths.model_dir)?;
    config.save(paths.model_dir.join(CONFIG_FILE))?;

    B::seed(config.seed);

    let mut model = config.model.init::<B>(&device);
    let mut optimizer = config.optimizer.init::<B, Model<B>>();
    let criterion = CrossEntropyLossConfig::new()
        .with_smoothing(Some(config.label_smoothing))
        .init::<B>(&device);
    let valid_criterion = CrossEntropyLossConfig::new()
        .with_smoothing(Some(config.label_smoothing))
        .init::<B::InnerBackend>(&device);

    let schedule = config.schedule();
    let resolution = Resolution::new(config.progressive_resize, config.image_size);
    let mut stopper = EarlyStopping::new(config.patience);
    let mut history = TrainingHistory::default();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut early_stopped = false;
    let mut saved = false;
    let mut epoch_steps = Vec::new();
    let mut epoch_sizes = Vec::new();
    let mix = config.mix();

    info!(
        backbone = ?config.model.backbone,
        mixup_alpha = config.mixup_alpha,
        cutmix_alpha = config.cutmix_alpha,
        mix_prob = config.mix_prob,
        label_smoothing = config.label_smoothing,
        progressive = config.progressive_resize,
        warmup_epochs = config.warmup_epochs,
        "starting training"
    );

    let mut last_size = None;
    for epoch in 0..config.epoch_count {
        let size = resolution.size(epoch);
        if last_size != Some(size) {
            info!(size, "using image size {size}x{size}");
            last_size = Some(size);
        }
        let (train_data, batches) =
            train_loader::<B>(&train_folder, &config, size, epoch, &device);
        let valid_data = valid_loader::<B::InnerBackend>(&valid_folder, &config, size, &device);

        let lr = schedule.lr(epoch);
        info!("epoch [{}/{}] at {}px", epoch + 1, config.epoch_count, size);

        let (trained, train_metrics) = train_epoch(
            model,
            &mut optimizer,
            &train_data,
            &criterion,
            &mix,
            batches,
            lr,
            &mut rng,
        );
        model = trained;
        epoch_steps.push(train_metrics.steps);
        epoch_sizes.push(size);

        let valid_metrics = validate(
            &model.valid(),
            &valid_data,
            &valid_criterion,
            valid_batches,
        );

        history.push(
            train_metrics.loss,
            train_metrics.accuracy,
            valid_metrics.loss,
            valid_metrics.accuracy,
        );

        info!(
            train_loss = %format!("{:.4}", train_metrics.loss),
            train_acc = %format!("{:.2}%", train_metrics.accuracy),
            val_loss = %format!("{:.4}", valid_metrics.loss),
            val_acc = %format!("{:.2}%", valid_metrics.accuracy),
            gap = %format!("{:+.2}%", train_metrics.accuracy - valid_metrics.accuracy),
            lr = %format!("{lr:.6}"),
            "epoch {} done",
            epoch + 1
        );

        match stopper.update(epoch, valid_metrics.accuracy) {
            Verdict::Improved => {
                info!("new best: {:.2}%", stopper.best_accuracy);
                let checkpoint = Checkpoint {
                    epoch,
                    best_acc: stopper.best_accuracy,
                    classes: classes.classes.clone(),
                    history: history.clone(),
                    config: config.clone(),
                };
                save_best(&paths.model_dir, &model, &optimizer, &checkpoint)?;
                saved = true;
            }
            Verdict::NoImprovement {
                epochs_without_improvement,
            } => {
                info!(
                    "no improvement ({}/{})",
                    epochs_without_improvement, config.patience
                );
            }
            Verdict::Stop => {
                warn!(
                    "early stopping: best {:.2}% at epoch {}",
                    stopper.best_accuracy,
                    stopper.best_epoch + 1
                );
                early_stopped = true;
                break;
            }
        }
    }

    if !saved {
        warn!("validation accuracy never improved; keeping the final weights");
        let checkpoint = Checkpoint {
            epoch: history.epochs().saturating_sub(1),
            best_acc: stopper.best_accuracy,
            classes: classes.classes.clone(),
            history: history.clone(),
            config: config.clone(),
        };
        save_best(&paths.model_dir, &model, &optimizer, &checkpoint)?;
    }

    history.save(&paths.output_dir.join(HISTORY_FILE))?;
    classes.write_json(&paths.model_dir.join(CLASSES_FILE))?;

    let summary = TrainingSummary {
        best_accuracy: stopper.best_accuracy,
        best_epoch: stopper.best_epoch,
        early_stopped,
        history,
        epoch_steps,
        epoch_sizes,
    };
    info!(
        best_val_acc = %format!("{:.2}%", summary.best_accuracy),
        best_epoch = summary.best_epoch + 1,
        final_gap = %format!("{:+.2}%", summary.history.gap(summary.best_epoch).unwrap_or(0.0)),
        "training complete"
    );
    Ok(summary)
}
