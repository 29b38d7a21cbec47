//! Model fitting: the `/retrain/` pass over unprocessed training rows and the
//! offline `train` command over a labeled folder.
//!
//! Training always runs on `TrainingBackend` inside `spawn_blocking`. The new
//! weights only reach disk; the classifier serving requests keeps the copy it
//! loaded at startup.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor, TensorData};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use serde_json::json;

use crate::backend::{Filter, RowId, TableStore, TRAINING_TABLE};
use crate::config::ServiceConfig;
use crate::dataset::{scan_labeled_dir, split_dataset, LabeledImage, SplitRatio};
use crate::error::ServiceError;
use crate::labels::{ShoeClass, NUM_CLASSES};
use crate::model::{
    argmax, images_to_tensor, load_model, save_model, InferenceBackend, ShoeCnn, ShoeCnnConfig,
    TrainingBackend,
};
use crate::preprocess::{preprocess, ImageSource, ImageTensor, IMAGE_SIZE};

#[derive(Debug, Clone)]
pub struct RetrainSettings {
    pub model_path: PathBuf,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl RetrainSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            model_path: config.model_path.clone(),
            epochs: config.retrain_epochs,
            batch_size: config.retrain_batch_size,
            learning_rate: config.learning_rate,
            seed: config.seed,
        }
    }
}

/// One decoded image with its output-neuron index.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: ImageTensor,
    pub class: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrainOutcome {
    pub samples: usize,
    pub labels: Vec<String>,
}

impl RetrainOutcome {
    pub fn message(&self) -> String {
        format!("Retrained on {} samples", self.samples)
    }
}

/// Decodes `path` and pairs it with `label`, logging and skipping anything
/// that cannot be used.
fn load_sample(path: &Path, label: &str) -> Option<Sample> {
    let class = match label.parse::<ShoeClass>().ok().and_then(ShoeClass::index) {
        Some(class) => class,
        None => {
            tracing::warn!("Skipping {}: unknown label '{}'", path.display(), label);
            return None;
        }
    };
    match preprocess(ImageSource::Path(path)) {
        Ok(image) => Some(Sample { image, class }),
        Err(e) => {
            tracing::warn!("Error loading {}: {}", path.display(), e);
            None
        }
    }
}

fn sample_labels(samples: &[Sample]) -> Vec<String> {
    samples
        .iter()
        .filter_map(|s| ShoeClass::from_index(s.class))
        .map(|c| c.as_str().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Largest random translation, as a fraction of the image side.
const SHIFT_RANGE: f32 = 0.2;
/// Random zoom factors are drawn from `1 ± ZOOM_RANGE`.
const ZOOM_RANGE: f32 = 0.2;

/// Random shift, zoom and horizontal mirror of one training image.
fn augment(image: &ImageTensor, rng: &mut ChaCha8Rng) -> ImageTensor {
    let max_shift = (IMAGE_SIZE as f32 * SHIFT_RANGE) as i32;
    let dx = rng.gen_range(-max_shift..=max_shift);
    let dy = rng.gen_range(-max_shift..=max_shift);
    let factor = rng.gen_range(1.0 - ZOOM_RANGE..=1.0 + ZOOM_RANGE);

    let image = image.shift(dx, dy).zoom(factor);
    if rng.gen_bool(0.5) {
        image.flip_horizontal()
    } else {
        image
    }
}

fn batch_tensors<B: AutodiffBackend>(
    batch: &[&Sample],
    rng: Option<&mut ChaCha8Rng>,
    device: &B::Device,
) -> (Tensor<B, 4>, Tensor<B, 2>) {
    let images: Vec<ImageTensor> = match rng {
        Some(rng) => batch.iter().map(|s| augment(&s.image, rng)).collect(),
        None => batch.iter().map(|s| s.image.clone()).collect(),
    };
    let images = images_to_tensor::<B>(&ImageTensor::stack(&images), device);

    let mut one_hot = vec![0.0f32; batch.len() * NUM_CLASSES];
    for (row, sample) in batch.iter().enumerate() {
        one_hot[row * NUM_CLASSES + sample.class] = 1.0;
    }
    let targets = Tensor::<B, 2>::from_data(
        TensorData::new(one_hot, [batch.len(), NUM_CLASSES]),
        device,
    );

    (images, targets)
}

/// Runs `settings.epochs` passes of Adam over `samples` with categorical
/// cross-entropy. With `augment`, each image is randomly shifted, zoomed and
/// mirrored before every step.
pub fn fit<B: AutodiffBackend>(
    mut model: ShoeCnn<B>,
    samples: &[Sample],
    settings: &RetrainSettings,
    augment: bool,
    device: &B::Device,
) -> ShoeCnn<B> {
    let mut optimizer = AdamConfig::new().init();
    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
    let mut order: Vec<usize> = (0..samples.len()).collect();
    let batch_size = settings.batch_size.max(1);

    for epoch in 0..settings.epochs {
        order.shuffle(&mut rng);
        let mut epoch_loss = 0.0f64;
        let mut batches = 0usize;

        for chunk in order.chunks(batch_size) {
            let batch: Vec<&Sample> = chunk.iter().map(|&i| &samples[i]).collect();
            let (images, targets) =
                batch_tensors::<B>(&batch, augment.then_some(&mut rng), device);

            let logits = model.forward(images);
            let loss = (log_softmax(logits, 1) * targets).sum_dim(1).mean().neg();
            epoch_loss += loss.clone().into_scalar().elem::<f64>();
            batches += 1;

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(settings.learning_rate, model, grads);
        }

        tracing::info!(
            "Epoch {}/{}: loss = {:.4}",
            epoch + 1,
            settings.epochs,
            epoch_loss / batches.max(1) as f64
        );
    }
    model
}

/// Fraction of `samples` whose arg-max prediction matches their class.
pub fn accuracy(
    model: &ShoeCnn<InferenceBackend>,
    samples: &[Sample],
    batch_size: usize,
) -> Result<f64, ServiceError> {
    if samples.is_empty() {
        return Ok(0.0);
    }
    let device = Default::default();
    let mut correct = 0usize;

    for chunk in samples.chunks(batch_size.max(1)) {
        let batch = ImageTensor::stack(chunk.iter().map(|s| &s.image));
        let logits = model
            .forward(images_to_tensor::<InferenceBackend>(&batch, &device))
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| ServiceError::Inference(format!("unreadable model output: {:?}", e)))?;

        correct += logits
            .chunks(NUM_CLASSES)
            .zip(chunk)
            .filter(|(row, sample)| argmax(row).map(|(i, _)| i) == Some(sample.class))
            .count();
    }
    Ok(correct as f64 / samples.len() as f64)
}

fn load_or_init(model_path: &Path) -> Result<ShoeCnn<TrainingBackend>, ServiceError> {
    let device = Default::default();
    if model_path.exists() {
        let model = load_model::<TrainingBackend>(model_path, &device)?;
        tracing::info!("Loaded existing model for retraining.");
        Ok(model)
    } else {
        tracing::info!("Built new model for training.");
        Ok(ShoeCnnConfig::new().init::<TrainingBackend>(&device))
    }
}

/// Fits the stored (or a fresh) model on `samples` and overwrites the artifact.
pub fn train_and_save(
    samples: &[Sample],
    settings: &RetrainSettings,
    augment: bool,
) -> Result<ShoeCnn<TrainingBackend>, ServiceError> {
    let model = load_or_init(&settings.model_path)?;
    let model = fit(model, samples, settings, augment, &Default::default());
    save_model(model.clone(), &settings.model_path)?;
    tracing::info!("Saved model to {}", settings.model_path.display());
    Ok(model)
}

/// The columns of a training row that retraining reads.
#[derive(Debug, Deserialize)]
struct PendingRow {
    #[serde(default)]
    id: Option<RowId>,
    image_path: String,
    shoe_class: String,
}

/// Retrains on every unprocessed training row and marks those rows processed.
///
/// Rows are only marked once the new weights are on disk, in one write. Every
/// readable row is marked, including rows whose image could not be loaded;
/// rows missing `image_path` or `shoe_class` are skipped and left unmarked.
pub async fn retrain(
    tables: &dyn TableStore,
    settings: &RetrainSettings,
) -> Result<RetrainOutcome, ServiceError> {
    let records = tables
        .select(TRAINING_TABLE, &Filter::eq("is_processed", false))
        .await
        .map_err(ServiceError::RemoteReadFailure)?;
    if records.is_empty() {
        return Err(ServiceError::NoTrainingData);
    }

    let rows: Vec<PendingRow> = records
        .into_iter()
        .filter_map(|record| match serde_json::from_value(record) {
            Ok(row) => Some(row),
            Err(e) => {
                tracing::warn!("Skipping malformed training row: {}", e);
                None
            }
        })
        .collect();
    tracing::info!("Retraining on {} unprocessed rows", rows.len());

    let jobs: Vec<(PathBuf, String)> = rows
        .iter()
        .map(|r| (PathBuf::from(&r.image_path), r.shoe_class.clone()))
        .collect();
    let settings = settings.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let samples: Vec<Sample> = jobs
            .iter()
            .filter_map(|(path, label)| load_sample(path, label))
            .collect();
        if samples.is_empty() {
            return Err(ServiceError::NoValidImages);
        }

        train_and_save(&samples, &settings, false)?;
        Ok(RetrainOutcome {
            samples: samples.len(),
            labels: sample_labels(&samples),
        })
    })
    .await??;

    let ids: Vec<RowId> = rows.iter().filter_map(|r| r.id).collect();
    tables
        .update(TRAINING_TABLE, &ids, json!({ "is_processed": true }))
        .await
        .map_err(ServiceError::RemoteWriteFailure)?;

    Ok(outcome)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingReport {
    pub train_samples: usize,
    pub validation_accuracy: f64,
    pub test_accuracy: f64,
}

/// Trains from a `<label>/<images>` folder with an 80/10/10 split, augmenting
/// training images at random, and writes the artifact.
pub fn train_from_directory(
    data_dir: &Path,
    settings: &RetrainSettings,
) -> Result<TrainingReport, ServiceError> {
    let images = scan_labeled_dir(data_dir)?;
    let split = split_dataset(images, SplitRatio::default(), settings.seed);
    tracing::info!(
        "Dataset split: {} train, {} validation, {} test",
        split.train.len(),
        split.validation.len(),
        split.test.len()
    );

    let load = |images: &[LabeledImage]| -> Vec<Sample> {
        images
            .iter()
            .filter_map(|i| load_sample(&i.path, &i.label))
            .collect()
    };
    let train = load(&split.train);
    if train.is_empty() {
        return Err(ServiceError::NoValidImages);
    }
    let validation = load(&split.validation);
    let test = load(&split.test);

    let model = train_and_save(&train, settings, true)?.valid();
    let report = TrainingReport {
        train_samples: train.len(),
        validation_accuracy: accuracy(&model, &validation, settings.batch_size)?,
        test_accuracy: accuracy(&model, &test, settings.batch_size)?,
    };
    tracing::info!(
        "Validation accuracy: {:.2}% | Test accuracy: {:.2}%",
        report.validation_accuracy * 100.0,
        report.test_accuracy * 100.0
    );
    Ok(report)
}
