use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use image::ImageReader;
use ndarray::Array3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::warn;

use crate::{
    error::{Error, Result},
    mapping::BreedMapping,
    transform::{Transform, CHANNELS},
};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

/// One image on disk and the index of the folder it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub path: PathBuf,
    pub label: usize,
}

/// `root/<class>/<image>` layout; class indices follow the sorted folder names.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    pub root: PathBuf,
    pub mapping: BreedMapping,
    pub entries: Vec<ImageEntry>,
}

impl ImageFolder {
    pub fn scan(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::PathNotFound(root.to_path_buf()));
        }

        let mut classes: Vec<String> = fs::read_dir(root)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        classes.sort();

        if classes.is_empty() {
            return Err(Error::Dataset(format!(
                "no class folders under {}",
                root.display()
            )));
        }

        let per_class: Vec<Vec<ImageEntry>> = classes
            .par_iter()
            .enumerate()
            .map(|(label, class)| -> Result<_> {
                let mut paths: Vec<PathBuf> = fs::read_dir(root.join(class))?
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| p.is_file() && is_image_file(p))
                    .collect();
                paths.sort();
                Ok(paths
                    .into_iter()
                    .map(|path| ImageEntry { path, label })
                    .collect())
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            root: root.to_path_buf(),
            mapping: BreedMapping::new(classes),
            entries: per_class.into_iter().flatten().collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.mapping.len()];
        for entry in &self.entries {
            counts[entry.label] += 1;
        }
        counts
    }
}

pub fn load_image(path: &Path) -> Result<image::DynamicImage> {
    ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|e| Error::Image(path.to_path_buf(), e))
}

#[derive(Debug, Clone)]
pub struct Cat {
    /// `[3, H, W]`, already normalized.
    pub pixels: Array3<f32>,
    pub label: usize,
}

/// Decodes and transforms images on access. Random transforms draw from an RNG seeded
/// with `(seed, index)` so an epoch can be replayed.
pub struct CatDataset {
    entries: Vec<ImageEntry>,
    transform: Transform,
    seed: u64,
}

impl CatDataset {
    pub fn new(folder: &ImageFolder, transform: Transform, seed: u64) -> Self {
        Self {
            entries: folder.entries.clone(),
            transform,
            seed,
        }
    }
}

impl Dataset<Cat> for CatDataset {
    /// An unreadable file is replaced by the next readable one; `None` would end the
    /// loader's iteration early.
    fn get(&self, index: usize) -> Option<Cat> {
        if index >= self.entries.len() {
            return None;
        }

        let (entry, image) = (0..self.entries.len()).find_map(|offset| {
            let entry = &self.entries[(index + offset) % self.entries.len()];
            match load_image(&entry.path) {
                Ok(image) => Some((entry, image)),
                Err(err) => {
                    warn!(%err, "skipping unreadable image");
                    None
                }
            }
        })?;

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(index as u64);

        Some(Cat {
            pixels: self.transform.apply(&image, &mut rng),
            label: entry.label,
        })
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Clone, Debug)]
pub struct CatBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone)]
pub struct CatBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> CatBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<Cat, CatBatch<B>> for CatBatcher<B> {
    fn batch(&self, items: Vec<Cat>) -> CatBatch<B> {
        let (_, height, width) = items
            .first()
            .map(|item| item.pixels.dim())
            .unwrap_or((CHANNELS, 0, 0));

        let mut pixels = Vec::with_capacity(items.len() * CHANNELS * height * width);
        for item in &items {
            pixels.extend(item.pixels.iter().copied());
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [items.len(), CHANNELS, height, width])
                .convert::<B::FloatElem>(),
            &self.device,
        );

        let labels: Vec<B::IntElem> = items
            .iter()
            .map(|item| (item.label as i64).elem::<B::IntElem>())
            .collect();
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [items.len()]), &self.device);

        CatBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::transform::EvalTransform;

    fn write_image(path: &Path, shade: u8) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(20, 16, Rgb([shade, shade, shade]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn scan_orders_classes_and_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("Siamese/b.png"), 10);
        write_image(&dir.path().join("Bengal/a.jpg"), 20);
        write_image(&dir.path().join("Bengal/c.JPG"), 30);
        fs::write(dir.path().join("Bengal/notes.txt"), "x").unwrap();

        let folder = ImageFolder::scan(dir.path()).unwrap();
        assert_eq!(folder.mapping.classes, vec!["Bengal", "Siamese"]);
        assert_eq!(folder.len(), 3);
        assert_eq!(folder.class_counts(), vec![2, 1]);
        assert_eq!(folder.entries[2].label, 1);
    }

    #[test]
    fn scan_rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageFolder::scan(&dir.path().join("nope")),
            Err(Error::PathNotFound(_))
        ));
    }

    #[test]
    fn batcher_stacks_items() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("Bombay/0.png"), 0);
        write_image(&dir.path().join("Persian/0.png"), 255);

        let folder = ImageFolder::scan(dir.path()).unwrap();
        let dataset = CatDataset::new(&folder, Transform::Eval(EvalTransform::for_size(8)), 0);
        let items: Vec<Cat> = (0..dataset.len()).filter_map(|i| dataset.get(i)).collect();

        let batch = CatBatcher::<NdArray>::new(Default::default()).batch(items);
        assert_eq!(batch.images.dims(), [2, 3, 8, 8]);
        assert_eq!(
            batch.targets.into_data().convert::<i64>().to_vec::<i64>().unwrap(),
            vec![0, 1]
        );
    }
}
