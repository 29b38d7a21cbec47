//! Labeled-folder datasets: `<root>/<label>/**/<image>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use walkdir::WalkDir;

pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledImage {
    pub path: PathBuf,
    pub label: String,
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Lists every image under each top-level directory of `root`, labeled with
/// that directory's name. Loose files at the top level are ignored.
pub fn scan_labeled_dir(root: &Path) -> std::io::Result<Vec<LabeledImage>> {
    let mut label_dirs: Vec<(String, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(label) = entry.file_name().to_str() {
            label_dirs.push((label.to_string(), entry.path()));
        }
    }
    label_dirs.sort();

    let mut images = Vec::new();
    for (label, dir) in label_dirs {
        let mut paths: Vec<PathBuf> = WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_image_file(e.path()))
            .map(|e| e.into_path())
            .collect();
        paths.sort();

        images.extend(paths.into_iter().map(|path| LabeledImage {
            path,
            label: label.clone(),
        }));
    }
    Ok(images)
}

#[derive(Debug, Clone, Copy)]
pub struct SplitRatio {
    pub train: f64,
    pub validation: f64,
}

impl Default for SplitRatio {
    /// 80/10/10; the test split takes the remainder.
    fn default() -> Self {
        Self {
            train: 0.8,
            validation: 0.1,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DatasetSplit {
    pub train: Vec<LabeledImage>,
    pub validation: Vec<LabeledImage>,
    pub test: Vec<LabeledImage>,
}

/// Shuffles each label's images with `seed` and cuts them by `ratio`, so every
/// split keeps the label proportions of the whole set.
pub fn split_dataset(images: Vec<LabeledImage>, ratio: SplitRatio, seed: u64) -> DatasetSplit {
    let mut by_label: BTreeMap<String, Vec<LabeledImage>> = BTreeMap::new();
    for image in images {
        by_label.entry(image.label.clone()).or_default().push(image);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut split = DatasetSplit::default();
    for (_, mut group) in by_label {
        group.shuffle(&mut rng);
        let n = group.len();
        let n_train = (n as f64 * ratio.train).floor() as usize;
        let n_val = ((n as f64 * ratio.validation).floor() as usize).min(n - n_train);

        let mut rest = group.split_off(n_train);
        let test = rest.split_off(n_val);
        split.train.extend(group);
        split.validation.extend(rest);
        split.test.extend(test);
    }
    split
}
