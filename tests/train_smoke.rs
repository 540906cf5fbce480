use std::{fs, path::Path};

use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
use cat_breeds::{
    checkpoint::{Checkpoint, CONFIG_FILE, HISTORY_FILE},
    data::load_image,
    inference::{BreedClassifier, IMAGE_CONTENT_TYPE, JSON_CONTENT_TYPE},
    mapping::CLASSES_FILE,
    model::{Backbone, ModelConfig},
    training::{train, TrainingConfig, TrainingPaths},
};
use image::{Rgb, RgbImage};

type Backend = NdArray<f32>;
type ADBackend = Autodiff<Backend>;

fn write_class(root: &Path, class: &str, count: usize, shade: [u8; 3]) {
    let dir = root.join(class);
    fs::create_dir_all(&dir).unwrap();
    for i in 0..count {
        RgbImage::from_fn(40, 40, |x, y| {
            let v = ((x + y + i as u32) % 7) as u8;
            Rgb([shade[0].saturating_add(v), shade[1], shade[2].saturating_sub(v)])
        })
        .save(dir.join(format!("{class}_{i:04}.png")))
        .unwrap();
    }
}

fn paths(root: &Path) -> TrainingPaths {
    TrainingPaths {
        train_dir: root.join("train"),
        validation_dir: root.join("validation"),
        model_dir: root.join("model"),
        output_dir: root.join("output"),
    }
}

fn tiny_config() -> TrainingConfig {
    TrainingConfig::new(
        ModelConfig::new(0).with_backbone(Backbone::Small),
        TrainingConfig::optimizer(0.08, 1.0),
    )
    .with_batch_size(2)
    .with_warmup_epochs(1)
    .with_image_size(32)
}

#[test]
fn trains_and_serves_a_tiny_model() {
    let temp = tempfile::tempdir().unwrap();
    let paths = paths(temp.path());
    // 7 images, batch 2: three steps per epoch, one image left over
    write_class(&paths.train_dir, "Bombay", 4, [20, 20, 20]);
    write_class(&paths.train_dir, "Siamese", 3, [230, 220, 200]);
    write_class(&paths.validation_dir, "Bombay", 2, [25, 25, 25]);
    write_class(&paths.validation_dir, "Siamese", 2, [225, 215, 195]);

    let config = tiny_config().with_epoch_count(2);
    assert_eq!(config.worker_count, 4);

    let summary = train::<ADBackend>(&paths, config, NdArrayDevice::Cpu).unwrap();
    assert!(summary.history.epochs() >= 1 && summary.history.epochs() <= 2);
    assert!(summary.epoch_steps.iter().all(|&steps| steps == 3));
    assert_eq!(summary.epoch_steps.len(), summary.history.epochs());
    assert!((0.0..=100.0).contains(&summary.best_accuracy));

    assert!(paths.model_dir.join("model.mpk").is_file());
    assert!(paths.model_dir.join("optimizer.mpk").is_file());
    assert!(paths.model_dir.join(CONFIG_FILE).is_file());
    assert!(paths.model_dir.join(CLASSES_FILE).is_file());
    assert!(paths.output_dir.join(HISTORY_FILE).is_file());

    let checkpoint = Checkpoint::load(&paths.model_dir).unwrap();
    assert_eq!(checkpoint.classes, vec!["Bombay", "Siamese"]);
    assert_eq!(checkpoint.config.model.classes, 2);

    let classifier = BreedClassifier::<Backend>::load(&paths.model_dir, NdArrayDevice::Cpu).unwrap();
    let image = load_image(&paths.validation_dir.join("Bombay/Bombay_0000.png")).unwrap();
    let prediction = classifier.predict(&image).unwrap();
    assert_eq!(prediction.top_breeds.len(), 2);
    assert!(["Bombay", "Siamese"].contains(&prediction.breed.as_str()));
    let total: f32 = prediction.top_breeds.iter().map(|b| b.confidence).sum();
    assert!((total - 1.0).abs() < 1e-3);

    let body = fs::read(paths.validation_dir.join("Siamese/Siamese_0001.png")).unwrap();
    let (response, content_type) = classifier
        .handle(&body, IMAGE_CONTENT_TYPE, JSON_CONTENT_TYPE)
        .unwrap();
    assert_eq!(content_type, JSON_CONTENT_TYPE);
    let parsed: serde_json::Value = serde_json::from_str(&response).unwrap();
    assert!(parsed["confidence"].as_f64().unwrap() > 0.0);
}

#[test]
fn stops_once_patience_runs_out() {
    let temp = tempfile::tempdir().unwrap();
    let paths = paths(temp.path());
    write_class(&paths.train_dir, "Bombay", 2, [20, 20, 20]);
    write_class(&paths.train_dir, "Siamese", 2, [230, 220, 200]);
    // one validation image: accuracy is 0 or 100, so a second improvement is impossible
    write_class(&paths.validation_dir, "Bombay", 1, [25, 25, 25]);
    write_class(&paths.validation_dir, "Siamese", 0, [0, 0, 0]);

    let config = tiny_config().with_epoch_count(5).with_patience(1);
    let summary = train::<ADBackend>(&paths, config, NdArrayDevice::Cpu).unwrap();

    assert!(summary.early_stopped);
    assert!(summary.history.epochs() <= 2);
    assert!(summary.history.epochs() < 5);
    assert!(paths.model_dir.join("model.mpk").is_file());
    assert!(paths.output_dir.join(HISTORY_FILE).is_file());
}

#[test]
fn keeps_final_weights_when_nothing_improved() {
    let temp = tempfile::tempdir().unwrap();
    let paths = paths(temp.path());
    write_class(&paths.train_dir, "Bombay", 2, [20, 20, 20]);
    write_class(&paths.train_dir, "Siamese", 2, [230, 220, 200]);
    write_class(&paths.validation_dir, "Bombay", 1, [25, 25, 25]);
    write_class(&paths.validation_dir, "Siamese", 1, [225, 215, 195]);

    let summary =
        train::<ADBackend>(&paths, tiny_config().with_epoch_count(0), NdArrayDevice::Cpu).unwrap();
    assert_eq!(summary.history.epochs(), 0);
    assert_eq!(summary.best_accuracy, 0.0);

    assert!(paths.model_dir.join("model.mpk").is_file());
    let checkpoint = Checkpoint::load(&paths.model_dir).unwrap();
    assert_eq!(checkpoint.epoch, 0);
    assert_eq!(checkpoint.classes, vec!["Bombay", "Siamese"]);
    assert!(BreedClassifier::<Backend>::load(&paths.model_dir, NdArrayDevice::Cpu).is_ok());
}

#[test]
fn progressive_resize_switches_size_at_epoch_ten() {
    let temp = tempfile::tempdir().unwrap();
    let paths = paths(temp.path());
    write_class(&paths.train_dir, "Bombay", 1, [20, 20, 20]);
    write_class(&paths.train_dir, "Siamese", 1, [230, 220, 200]);
    write_class(&paths.validation_dir, "Bombay", 1, [25, 25, 25]);
    write_class(&paths.validation_dir, "Siamese", 1, [225, 215, 195]);

    let config = tiny_config()
        .with_epoch_count(11)
        .with_patience(20)
        .with_progressive_resize(true);
    let summary = train::<ADBackend>(&paths, config, NdArrayDevice::Cpu).unwrap();

    assert_eq!(summary.epoch_sizes.len(), 11);
    assert!(summary.epoch_sizes[..10].iter().all(|&size| size == 192));
    assert_eq!(summary.epoch_sizes[10], 208);
    assert_eq!(summary.epoch_steps, vec![1; 11]);
}

#[test]
fn rejects_mismatched_class_folders() {
    let temp = tempfile::tempdir().unwrap();
    let paths = paths(temp.path());
    write_class(&paths.train_dir, "Bengal", 2, [100, 60, 20]);
    write_class(&paths.validation_dir, "Persian", 1, [200, 200, 200]);

    let config = TrainingConfig::new(ModelConfig::new(0), TrainingConfig::optimizer(0.08, 1.0))
        .with_batch_size(2);
    assert!(train::<ADBackend>(&paths, config, NdArrayDevice::Cpu).is_err());
}
