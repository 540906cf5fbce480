//! Builds the `train/` and `validation/` image folders from the raw breed sources.
//!
//! Two layouts are merged:
//! - an Oxford-IIIT style flat folder where the breed is encoded in the file name
//!   (`Maine_Coon_123.jpg`), which also contains dog breeds that must be skipped;
//! - a Kaggle style folder with one sub-directory per breed.
//!
//! Breeds are merged under a normalized name, thin breeds are dropped, and each breed is
//! split on its own so both splits see every class.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    data::is_image_file,
    error::{Error, Result},
    mapping::{BreedMapping, MAPPING_FILE},
};

pub const OXFORD_CAT_BREEDS: [&str; 12] = [
    "Abyssinian",
    "Bengal",
    "Birman",
    "Bombay",
    "British_Shorthair",
    "Egyptian_Mau",
    "Maine_Coon",
    "Persian",
    "Ragdoll",
    "Russian_Blue",
    "Siamese",
    "Sphynx",
];

pub const TRAIN_DIR: &str = "train";
pub const VALIDATION_DIR: &str = "validation";

#[derive(Debug, Clone)]
pub struct PrepareConfig {
    /// Flat folder of `<Breed>_<n>.jpg` files.
    pub oxford_dir: PathBuf,
    /// Folder with one sub-directory per breed.
    pub kaggle_dir: PathBuf,
    pub output_dir: PathBuf,
    pub min_images: usize,
    pub val_ratio: f64,
    pub seed: u64,
}

impl PrepareConfig {
    /// Default layout under a raw data root: `images/` and `cat_breeds_refined/images/`.
    pub fn from_raw_root(raw_dir: &Path, output_dir: &Path) -> Self {
        Self {
            oxford_dir: raw_dir.join("images"),
            kaggle_dir: raw_dir.join("cat_breeds_refined").join("images"),
            output_dir: output_dir.to_path_buf(),
            min_images: 50,
            val_ratio: 0.2,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreedSplit {
    pub breed: String,
    pub train: usize,
    pub validation: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PrepareReport {
    pub breeds: Vec<BreedSplit>,
    pub removed: Vec<(String, usize)>,
}

impl PrepareReport {
    pub fn train_images(&self) -> usize {
        self.breeds.iter().map(|b| b.train).sum()
    }

    pub fn validation_images(&self) -> usize {
        self.breeds.iter().map(|b| b.validation).sum()
    }

    pub fn total_images(&self) -> usize {
        self.train_images() + self.validation_images()
    }

    pub fn log(&self) {
        info!(
            breeds = self.breeds.len(),
            total = self.total_images(),
            train = self.train_images(),
            validation = self.validation_images(),
            "dataset preparation complete"
        );
        for split in &self.breeds {
            let count = split.train + split.validation;
            info!("  {:30} {:4} {}", split.breed, count, "█".repeat(count / 50));
        }
    }
}

/// `Maine_Coon` and `maine-coon` both become `Maine Coon`.
pub fn normalize_breed_name(raw: &str) -> String {
    let spaced = raw.replace(['_', '-'], " ");
    let mut out = String::with_capacity(spaced.len());
    let mut prev_is_letter = false;
    for c in spaced.chars() {
        if c.is_alphabetic() {
            if prev_is_letter {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_is_letter = true;
        } else {
            out.push(c);
            prev_is_letter = false;
        }
    }
    out
}

/// Breed part of an Oxford file name: everything before the last `_` of the stem.
fn oxford_breed(path: &Path) -> Option<&str> {
    let stem = path.file_stem()?.to_str()?;
    stem.rsplit_once('_').map(|(breed, _)| breed)
}

fn has_extension(path: &Path, wanted: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| wanted.iter().any(|w| e.eq_ignore_ascii_case(w)))
}

fn collect_oxford(dir: &Path, breeds: &mut BTreeMap<String, Vec<PathBuf>>) -> Result<()> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "oxford source not found, skipping");
        return Ok(());
    }

    let mut found = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || !has_extension(&path, &["jpg"]) {
            continue;
        }
        let Some(breed) = oxford_breed(&path) else {
            continue;
        };
        if OXFORD_CAT_BREEDS.contains(&breed) {
            breeds
                .entry(normalize_breed_name(breed))
                .or_default()
                .push(path);
            found += 1;
        }
    }

    info!(images = found, "collected oxford cat images");
    Ok(())
}

fn collect_kaggle(dir: &Path, breeds: &mut BTreeMap<String, Vec<PathBuf>>) -> Result<()> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "kaggle source not found, skipping");
        return Ok(());
    }

    let breed_dirs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();

    let per_breed: Vec<(String, Vec<PathBuf>)> = breed_dirs
        .par_iter()
        .map(|breed_dir| -> Result<_> {
            let name = breed_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            let images = fs::read_dir(breed_dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_image_file(p))
                .collect();
            Ok((normalize_breed_name(name), images))
        })
        .collect::<Result<_>>()?;

    let mut found = 0;
    for (breed, images) in per_breed {
        found += images.len();
        breeds.entry(breed).or_default().extend(images);
    }

    info!(images = found, "collected kaggle cat images");
    Ok(())
}

/// Gathers every image from both sources, grouped by normalized breed.
pub fn collect_images(config: &PrepareConfig) -> Result<BTreeMap<String, Vec<PathBuf>>> {
    let mut breeds = BTreeMap::new();
    collect_oxford(&config.oxford_dir, &mut breeds)?;
    collect_kaggle(&config.kaggle_dir, &mut breeds)?;

    for images in breeds.values_mut() {
        images.sort();
    }
    Ok(breeds)
}

/// Drops breeds with fewer than `min_images`, returning the dropped ones with their counts.
pub fn filter_breeds(
    breeds: &mut BTreeMap<String, Vec<PathBuf>>,
    min_images: usize,
) -> Vec<(String, usize)> {
    let removed: Vec<(String, usize)> = breeds
        .iter()
        .filter(|(_, images)| images.len() < min_images)
        .map(|(breed, images)| (breed.clone(), images.len()))
        .collect();

    for (breed, count) in &removed {
        breeds.remove(breed);
        info!(breed = %breed, images = count, "dropping breed with too few images");
    }
    removed
}

/// Shuffles a breed's images with a fixed seed and cuts off `ceil(n * val_ratio)` for validation.
pub fn split_images(
    mut images: Vec<PathBuf>,
    val_ratio: f64,
    seed: u64,
) -> (Vec<PathBuf>, Vec<PathBuf>) {
    images.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
    let val_count = ((images.len() as f64 * val_ratio).ceil() as usize).min(images.len());
    let validation = images.split_off(images.len() - val_count);
    (images, validation)
}

fn copy_split(images: &[PathBuf], dest_dir: &Path, prefix: &str) -> Result<()> {
    fs::create_dir_all(dest_dir)?;
    images
        .par_iter()
        .enumerate()
        .try_for_each(|(idx, src)| -> Result<()> {
            let ext = src
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{e}"))
                .unwrap_or_default();
            fs::copy(src, dest_dir.join(format!("{prefix}_{idx:04}{ext}")))?;
            Ok(())
        })
}

pub fn prepare_dataset(config: &PrepareConfig) -> Result<PrepareReport> {
    let mut breeds = collect_images(config)?;
    if breeds.is_empty() {
        return Err(Error::Dataset(format!(
            "no images found under {} or {}",
            config.oxford_dir.display(),
            config.kaggle_dir.display()
        )));
    }
    info!(
        breeds = breeds.len(),
        images = breeds.values().map(Vec::len).sum::<usize>(),
        "initial collection"
    );

    let removed = filter_breeds(&mut breeds, config.min_images);
    if breeds.is_empty() {
        return Err(Error::Dataset(format!(
            "no breed has at least {} images",
            config.min_images
        )));
    }

    let train_root = config.output_dir.join(TRAIN_DIR);
    let val_root = config.output_dir.join(VALIDATION_DIR);

    let mut report = PrepareReport {
        removed,
        ..Default::default()
    };

    for (breed, images) in &breeds {
        let (train, validation) = split_images(images.clone(), config.val_ratio, config.seed);

        copy_split(&train, &train_root.join(breed), breed)?;
        copy_split(&validation, &val_root.join(breed), &format!("{breed}_val"))?;

        info!(
            breed = %breed,
            train = train.len(),
            validation = validation.len(),
            "split breed"
        );
        report.breeds.push(BreedSplit {
            breed: breed.clone(),
            train: train.len(),
            validation: validation.len(),
        });
    }

    let mapping = BreedMapping::new(breeds.keys().cloned().collect());
    let mapping_path = config.output_dir.join(MAPPING_FILE);
    mapping.write_tsv(&mapping_path)?;
    info!(path = %mapping_path.display(), "breed mapping saved");

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_like_title_case() {
        assert_eq!(normalize_breed_name("British_Shorthair"), "British Shorthair");
        assert_eq!(normalize_breed_name("maine-coon"), "Maine Coon");
        assert_eq!(normalize_breed_name("SPHYNX"), "Sphynx");
        assert_eq!(normalize_breed_name("scottish_fold2x"), "Scottish Fold2X");
    }

    #[test]
    fn oxford_breed_uses_last_underscore() {
        assert_eq!(
            oxford_breed(Path::new("images/Egyptian_Mau_101.jpg")),
            Some("Egyptian_Mau")
        );
        assert_eq!(oxford_breed(Path::new("images/noindex.jpg")), None);
    }

    #[test]
    fn split_rounds_validation_up_and_is_deterministic() {
        let images: Vec<PathBuf> = (0..11).map(|i| PathBuf::from(format!("{i}.jpg"))).collect();
        let (train, validation) = split_images(images.clone(), 0.2, 42);
        assert_eq!(train.len(), 8);
        assert_eq!(validation.len(), 3);

        let (train_again, _) = split_images(images, 0.2, 42);
        assert_eq!(train, train_again);
    }

    #[test]
    fn filter_reports_removed_breeds() {
        let mut breeds = BTreeMap::new();
        breeds.insert("Bengal".to_string(), vec![PathBuf::from("a.jpg"); 3]);
        breeds.insert("Bombay".to_string(), vec![PathBuf::from("b.jpg"); 1]);

        let removed = filter_breeds(&mut breeds, 2);
        assert_eq!(removed, vec![("Bombay".to_string(), 1)]);
        assert!(breeds.contains_key("Bengal"));
    }
}
