use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    tensor::backend::{AutodiffBackend, Backend},
};
use cat_breeds::{
    data::load_image,
    inference::BreedClassifier,
    logging,
    model::{Backbone, ModelConfig},
    prepare::{prepare_dataset, PrepareConfig},
    training::{train, TrainingConfig, TrainingPaths},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

#[derive(ValueEnum, Debug, Clone, Copy)]
enum BackendKind {
    Wgpu,
    NdArray,
}

#[derive(Parser, Debug)]
#[command(name = "cat-breeds", about = "Prepare, train and serve a cat breed classifier")]
struct Cli {
    /// Debug-level logs.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, value_enum, global = true, default_value_t = BackendKind::Wgpu)]
    backend: BackendKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge the raw breed sources into train/validation image folders.
    Prepare(PrepareArgs),
    /// Train the classifier.
    Train(TrainArgs),
    /// Classify images with a trained model directory.
    Predict(PredictArgs),
}

#[derive(Args, Debug)]
struct PrepareArgs {
    #[arg(long, default_value = "ml/data/raw")]
    raw_dir: PathBuf,
    #[arg(long, default_value = "ml/data/processed")]
    output_dir: PathBuf,
    /// Override the Oxford source (defaults to `<raw-dir>/images`).
    #[arg(long)]
    oxford_dir: Option<PathBuf>,
    /// Override the Kaggle source (defaults to `<raw-dir>/cat_breeds_refined/images`).
    #[arg(long)]
    kaggle_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 50)]
    min_images: usize,
    #[arg(long, default_value_t = 0.2)]
    val_ratio: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(long, env = "SM_MODEL_DIR", default_value = "./model")]
    model_dir: PathBuf,
    #[arg(long, env = "SM_CHANNEL_TRAIN", default_value = "./data/train")]
    train: PathBuf,
    #[arg(long, env = "SM_CHANNEL_VALIDATION", default_value = "./data/validation")]
    validation: PathBuf,
    #[arg(long, env = "SM_OUTPUT_DATA_DIR", default_value = "./output")]
    output_data_dir: PathBuf,
    #[arg(long, default_value_t = 40)]
    epochs: usize,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long, default_value_t = 3e-4)]
    lr: f64,
    /// Floor of the cosine decay.
    #[arg(long, default_value_t = 1e-6)]
    min_lr: f64,
    #[arg(long, default_value_t = 3)]
    warmup_epochs: usize,
    /// First warmup epoch runs at `lr * factor`.
    #[arg(long, default_value_t = 0.1)]
    warmup_start_factor: f64,
    #[arg(long, default_value_t = 4)]
    num_workers: usize,
    #[arg(long, default_value_t = 10)]
    patience: usize,
    #[arg(long, default_value_t = 0.6)]
    mixup_alpha: f64,
    #[arg(long, default_value_t = 1.2)]
    cutmix_alpha: f64,
    /// Chance that a batch is mixed.
    #[arg(long, default_value_t = 0.7)]
    mixup_prob: f64,
    #[arg(long, value_enum, default_value_t = Backbone::Base)]
    model: Backbone,
    /// 192px, then 208px from epoch 10, then 224px from epoch 20.
    #[arg(long)]
    progressive_resize: bool,
    #[arg(long, default_value_t = 224)]
    image_size: u32,
    #[arg(long, default_value_t = 0.08)]
    weight_decay: f32,
    #[arg(long, default_value_t = 0.2)]
    label_smoothing: f32,
    #[arg(long, default_value_t = 0.5)]
    dropout: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args, Debug)]
struct PredictArgs {
    #[arg(long, env = "SM_MODEL_DIR", default_value = "./model")]
    model_dir: PathBuf,
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

fn run_prepare(args: PrepareArgs) -> Result<()> {
    let mut config = PrepareConfig::from_raw_root(&args.raw_dir, &args.output_dir);
    if let Some(dir) = args.oxford_dir {
        config.oxford_dir = dir;
    }
    if let Some(dir) = args.kaggle_dir {
        config.kaggle_dir = dir;
    }
    config.min_images = args.min_images;
    config.val_ratio = args.val_ratio;
    config.seed = args.seed;

    let report = prepare_dataset(&config).context("dataset preparation failed")?;
    report.log();
    Ok(())
}

fn training_config(args: &TrainArgs) -> TrainingConfig {
    TrainingConfig::new(
        ModelConfig::new(0)
            .with_backbone(args.model)
            .with_dropout(args.dropout),
        TrainingConfig::optimizer(args.weight_decay, 1.0),
    )
    .with_epoch_count(args.epochs)
    .with_batch_size(args.batch_size)
    .with_learning_rate(args.lr)
    .with_min_learning_rate(args.min_lr)
    .with_warmup_epochs(args.warmup_epochs)
    .with_warmup_start_factor(args.warmup_start_factor)
    .with_worker_count(args.num_workers)
    .with_patience(args.patience)
    .with_mixup_alpha(args.mixup_alpha)
    .with_cutmix_alpha(args.cutmix_alpha)
    .with_mix_prob(args.mixup_prob)
    .with_progressive_resize(args.progressive_resize)
    .with_image_size(args.image_size)
    .with_label_smoothing(args.label_smoothing)
    .with_seed(args.seed)
}

fn run_train<B: AutodiffBackend>(args: TrainArgs, device: B::Device) -> Result<()> {
    info!(weight_decay = args.weight_decay, "optimizer: AdamW, grad norm clip 1.0");
    let config = training_config(&args);
    let paths = TrainingPaths {
        train_dir: args.train,
        validation_dir: args.validation,
        model_dir: args.model_dir,
        output_dir: args.output_data_dir,
    };

    let summary = train::<B>(&paths, config, device).context("training failed")?;
    println!(
        "best validation accuracy {:.2}% at epoch {}{}",
        summary.best_accuracy,
        summary.best_epoch + 1,
        if summary.early_stopped {
            " (stopped early)"
        } else {
            ""
        }
    );
    Ok(())
}

fn run_predict<B: Backend>(args: PredictArgs, device: B::Device) -> Result<()> {
    let classifier = BreedClassifier::<B>::load(&args.model_dir, device)
        .with_context(|| format!("cannot load model from {}", args.model_dir.display()))?;

    for path in &args.images {
        let image = load_image(path)?;
        let prediction = classifier.predict(&image)?;
        println!("{}", serde_json::to_string_pretty(&prediction)?);
    }
    Ok(())
}

fn main() -> Result<()> {
    type WgpuBackend = Wgpu<f32, i32>;
    type CpuBackend = NdArray<f32>;

    let cli = Cli::parse();
    logging::init(cli.verbose).map_err(anyhow::Error::msg)?;

    match (cli.command, cli.backend) {
        (Command::Prepare(args), _) => run_prepare(args),
        (Command::Train(args), BackendKind::Wgpu) => {
            run_train::<Autodiff<WgpuBackend>>(args, WgpuDevice::default())
        }
        (Command::Train(args), BackendKind::NdArray) => {
            run_train::<Autodiff<CpuBackend>>(args, NdArrayDevice::default())
        }
        (Command::Predict(args), BackendKind::Wgpu) => {
            run_predict::<WgpuBackend>(args, WgpuDevice::default())
        }
        (Command::Predict(args), BackendKind::NdArray) => {
            run_predict::<CpuBackend>(args, NdArrayDevice::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train_args(extra: &[&str]) -> TrainArgs {
        let argv = ["cat-breeds", "--backend", "nd-array", "train"]
            .into_iter()
            .chain(extra.iter().copied());
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Train(args) => args,
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn schedule_flags_reach_the_config() {
        let config = training_config(&train_args(&[
            "--warmup-epochs",
            "5",
            "--warmup-start-factor",
            "0.25",
            "--min-lr",
            "1e-5",
            "--model",
            "large",
        ]));
        assert_eq!(config.warmup_epochs, 5);
        assert_eq!(config.warmup_start_factor, 0.25);
        assert_eq!(config.min_learning_rate, 1e-5);
        assert_eq!(config.model.backbone, Backbone::Large);
    }

    #[test]
    fn train_defaults_match_the_config_defaults() {
        let config = training_config(&train_args(&[]));
        let defaults = TrainingConfig::new(ModelConfig::new(0), TrainingConfig::optimizer(0.08, 1.0));
        assert_eq!(config.warmup_epochs, defaults.warmup_epochs);
        assert_eq!(config.warmup_start_factor, defaults.warmup_start_factor);
        assert_eq!(config.min_learning_rate, defaults.min_learning_rate);
        assert_eq!(config.epoch_count, defaults.epoch_count);
        assert_eq!(config.mix_prob, defaults.mix_prob);
    }
}
