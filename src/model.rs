use std::path::Path;
use std::sync::Mutex;

use burn::{
    backend::{Autodiff, NdArray},
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, Linear, LinearConfig,
        PaddingConfig2d, Relu,
    },
    record::CompactRecorder,
    tensor::{activation::softmax, backend::Backend, Tensor, TensorData},
};
use serde::Serialize;

use crate::error::ServiceError;
use crate::labels::{ShoeClass, NUM_CLASSES};
use crate::preprocess::{ImageTensor, CHANNELS, IMAGE_SIZE};

pub type InferenceBackend = NdArray;
pub type TrainingBackend = Autodiff<NdArray>;

fn he_normal() -> Initializer {
    Initializer::KaimingNormal {
        gain: std::f64::consts::SQRT_2,
        fan_out_only: false,
    }
}

#[derive(Config, Debug)]
pub struct ShoeCnnConfig {
    #[config(default = "3")]
    pub num_classes: usize,

    #[config(default = "0.4")]
    pub dropout: f64,
}

impl ShoeCnnConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ShoeCnn<B> {
        // three 2x2 pools: 128 -> 64 -> 32 -> 16
        let flat = (IMAGE_SIZE / 8) * (IMAGE_SIZE / 8) * 32;

        ShoeCnn {
            block1: ConvBlock::new(CHANNELS, 64, None, device),
            block2: ConvBlock::new(64, 32, Some(self.dropout), device),
            block3: ConvBlock::new(32, 32, Some(self.dropout), device),
            fc1: LinearConfig::new(flat, 220)
                .with_initializer(he_normal())
                .init(device),
            fc2: LinearConfig::new(220, 64).init(device),
            output: LinearConfig::new(64, self.num_classes)
                .with_initializer(he_normal())
                .init(device),
            relu: Relu::new(),
        }
    }
}

/// Conv 3x3 (same) -> ReLU -> MaxPool 2x2 -> BatchNorm -> optional Dropout.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    pool: MaxPool2d,
    norm: BatchNorm<B, 2>,
    dropout: Option<Dropout>,
    relu: Relu,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, out_channels: usize, dropout: Option<f64>, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .with_initializer(he_normal())
                .init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            norm: BatchNormConfig::new(out_channels).init(device),
            dropout: dropout.map(|p| DropoutConfig::new(p).init()),
            relu: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.conv.forward(x));
        let x = self.norm.forward(self.pool.forward(x));
        match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        }
    }
}

/// Three convolutional blocks followed by a 220-64-N dense head.
#[derive(Module, Debug)]
pub struct ShoeCnn<B: Backend> {
    block1: ConvBlock<B>,
    block2: ConvBlock<B>,
    block3: ConvBlock<B>,
    fc1: Linear<B>,
    fc2: Linear<B>,
    output: Linear<B>,
    relu: Relu,
}

impl<B: Backend> ShoeCnn<B> {
    /// Logits of shape `[batch, num_classes]` for `[batch, 3, H, W]` input.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.block1.forward(images);
        let x = self.block2.forward(x);
        let x = self.block3.forward(x);

        let [batch, channels, height, width] = x.dims();
        let x = x.reshape([batch, channels * height * width]);

        let x = self.relu.forward(self.fc1.forward(x));
        let x = self.relu.forward(self.fc2.forward(x));
        self.output.forward(x)
    }

    pub fn forward_softmax(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }
}

/// Moves a host batch onto `device` as `[N, C, H, W]`.
pub fn images_to_tensor<B: Backend>(images: &ImageTensor, device: &B::Device) -> Tensor<B, 4> {
    let data = TensorData::new(images.data().to_vec(), images.shape());
    Tensor::<B, 4>::from_data(data, device).permute([0, 3, 1, 2])
}

/// Extension `CompactRecorder` gives every file it writes or reads.
pub const ARTIFACT_EXTENSION: &str = "mpk";

/// Rejects artifact paths the recorder would silently rename.
pub fn check_artifact_path(path: &Path) -> Result<(), String> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ARTIFACT_EXTENSION) => Ok(()),
        _ => Err(format!(
            "model artifact {} must have the .{} extension",
            path.display(),
            ARTIFACT_EXTENSION
        )),
    }
}

pub fn load_model<B: Backend>(path: &Path, device: &B::Device) -> Result<ShoeCnn<B>, ServiceError> {
    check_artifact_path(path).map_err(ServiceError::ModelUnavailable)?;
    ShoeCnnConfig::new()
        .init::<B>(device)
        .load_file(path.to_path_buf(), &CompactRecorder::new(), device)
        .map_err(|e| ServiceError::ModelUnavailable(format!("{}: {:?}", path.display(), e)))
}

/// Writes weights next to `path` and renames them into place.
pub fn save_model<B: Backend>(model: ShoeCnn<B>, path: &Path) -> Result<(), ServiceError> {
    check_artifact_path(path).map_err(ServiceError::Training)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let staging = path.with_extension("staging.mpk");
    model
        .save_file(staging.clone(), &CompactRecorder::new())
        .map_err(|e| ServiceError::Training(format!("failed to save model: {:?}", e)))?;
    std::fs::rename(&staging, path)?;
    Ok(())
}

/// Index and value of the largest probability.
pub fn argmax<T: PartialOrd + Copy>(values: &[T]) -> Option<(usize, T)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    #[serde(rename = "predicted_class")]
    pub label: ShoeClass,
    pub confidence: f64,
}

impl Classification {
    /// Picks the arg-max class, replacing it with the sentinel when its
    /// probability is below `threshold`.
    pub fn from_probabilities(probabilities: &[f64], threshold: f64) -> Result<Self, ServiceError> {
        let (index, confidence) = argmax(probabilities)
            .ok_or_else(|| ServiceError::Inference("model produced no outputs".into()))?;

        let label = ShoeClass::from_index(index).ok_or_else(|| {
            ServiceError::Inference(format!("model output index {} has no label", index))
        })?;
        let confidence = confidence.clamp(0.0, 1.0);

        let label = if confidence < threshold {
            ShoeClass::NotAShoe
        } else {
            label
        };

        Ok(Self { label, confidence })
    }
}

/// Anything that can label a preprocessed image.
pub trait ImageClassifier: Send + Sync {
    fn classify(&self, image: &ImageTensor) -> Result<Classification, ServiceError>;
}

/// Classifier backed by the CNN weights loaded at startup.
pub struct CnnClassifier {
    model: Mutex<ShoeCnn<InferenceBackend>>,
    device: <InferenceBackend as Backend>::Device,
    threshold: f64,
}

impl CnnClassifier {
    pub fn load(path: &Path, threshold: f64) -> Result<Self, ServiceError> {
        check_artifact_path(path).map_err(ServiceError::ModelUnavailable)?;
        if !path.exists() {
            return Err(ServiceError::ModelUnavailable(format!(
                "no model artifact at {}",
                path.display()
            )));
        }
        let device = Default::default();
        let model = load_model::<InferenceBackend>(path, &device)?;
        tracing::info!("Loaded model weights from {}", path.display());
        Ok(Self::from_model(model, threshold))
    }

    pub fn from_model(model: ShoeCnn<InferenceBackend>, threshold: f64) -> Self {
        Self {
            model: Mutex::new(model),
            device: Default::default(),
            threshold,
        }
    }

    pub fn probabilities(&self, image: &ImageTensor) -> Result<Vec<f32>, ServiceError> {
        let input = images_to_tensor::<InferenceBackend>(image, &self.device);
        let output = {
            let model = self
                .model
                .lock()
                .map_err(|_| ServiceError::ModelUnavailable("model lock poisoned".into()))?;
            model.forward_softmax(input)
        };
        output
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| ServiceError::Inference(format!("unreadable model output: {:?}", e)))
    }
}

impl ImageClassifier for CnnClassifier {
    fn classify(&self, image: &ImageTensor) -> Result<Classification, ServiceError> {
        let probabilities = self.probabilities(image)?;
        if probabilities.len() != NUM_CLASSES {
            return Err(ServiceError::Inference(format!(
                "expected {} outputs, got {}",
                NUM_CLASSES,
                probabilities.len()
            )));
        }
        let probabilities: Vec<f64> = probabilities.into_iter().map(f64::from).collect();
        Classification::from_probabilities(&probabilities, self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::CLASSES;
    use crate::preprocess::{preprocess, ImageSource};

    fn sample_image() -> ImageTensor {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shoe.png");
        image::RgbImage::from_fn(96, 64, |x, y| image::Rgb([(x * 2) as u8, (y * 3) as u8, 90]))
            .save(&path)
            .unwrap();
        preprocess(ImageSource::Path(&path)).unwrap()
    }

    #[test]
    fn confident_prediction_keeps_its_label() {
        let c = Classification::from_probabilities(&[0.05, 0.03, 0.92], 0.7).unwrap();
        assert_eq!(c.label, ShoeClass::Shoe);
        assert_eq!(c.confidence, 0.92);
    }

    #[test]
    fn unconfident_prediction_becomes_sentinel_with_same_confidence() {
        let c = Classification::from_probabilities(&[0.45, 0.35, 0.20], 0.7).unwrap();
        assert_eq!(c.label, ShoeClass::NotAShoe);
        assert_eq!(c.confidence, 0.45);
    }

    #[test]
    fn threshold_boundary_is_accepted() {
        let c = Classification::from_probabilities(&[0.7, 0.2, 0.1], 0.7).unwrap();
        assert_eq!(c.label, ShoeClass::Boot);
    }

    #[test]
    fn empty_output_is_an_error() {
        assert!(Classification::from_probabilities(&[], 0.7).is_err());
    }

    #[test]
    fn classification_serializes_with_wire_names() {
        let c = Classification {
            label: ShoeClass::NotAShoe,
            confidence: 0.5,
        };
        let json = serde_json::to_value(c).unwrap();
        assert_eq!(json["predicted_class"], "Not a Shoe");
        assert_eq!(json["confidence"], 0.5);
    }

    #[test]
    fn argmax_prefers_first_of_ties() {
        assert_eq!(argmax(&[0.2, 0.5, 0.5]), Some((1, 0.5)));
        assert_eq!(argmax::<f32>(&[]), None);
    }

    #[test]
    fn network_outputs_one_row_per_image() {
        let device = Default::default();
        let model = ShoeCnnConfig::new().init::<InferenceBackend>(&device);
        let image = sample_image();
        let batch = ImageTensor::stack([&image, &image]);

        let output = model.forward_softmax(images_to_tensor::<InferenceBackend>(&batch, &device));

        assert_eq!(output.dims(), [2, NUM_CLASSES]);
        let values = output.into_data().to_vec::<f32>().unwrap();
        for row in values.chunks(NUM_CLASSES) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn saved_weights_reload_into_a_classifier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("shoe_cnn.mpk");
        let device = Default::default();
        let model = ShoeCnnConfig::new().init::<InferenceBackend>(&device);
        let image = sample_image();
        let reference = CnnClassifier::from_model(model.clone(), 0.7)
            .probabilities(&image)
            .unwrap();

        save_model(model, &path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("staging.mpk").exists());

        let classifier = CnnClassifier::load(&path, 0.7).unwrap();
        let reloaded = classifier.probabilities(&image).unwrap();
        for (a, b) in reference.iter().zip(&reloaded) {
            assert!((a - b).abs() < 1e-2);
        }

        let classification = classifier.classify(&image).unwrap();
        assert!((0.0..=1.0).contains(&classification.confidence));
        assert!(
            CLASSES.contains(&classification.label) || classification.label == ShoeClass::NotAShoe
        );
    }

    #[test]
    fn missing_artifact_is_model_unavailable() {
        let result = CnnClassifier::load(Path::new("/nonexistent/shoe_cnn.mpk"), 0.7);
        assert!(matches!(result, Err(ServiceError::ModelUnavailable(_))));
    }

    #[test]
    fn artifact_without_mpk_extension_is_refused_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let model = ShoeCnnConfig::new().init::<InferenceBackend>(&Default::default());

        for name in ["shoe_cnn.bin", "shoe_cnn", "shoe_cnn.h5"] {
            let path = dir.path().join(name);
            let saved = save_model(model.clone(), &path);
            assert!(matches!(saved, Err(ServiceError::Training(_))), "{}", name);
            assert!(!path.with_extension("mpk").exists());

            let loaded = CnnClassifier::load(&path, 0.7);
            assert!(matches!(loaded, Err(ServiceError::ModelUnavailable(_))), "{}", name);
        }
        assert!(check_artifact_path(Path::new("models/shoe_cnn.mpk")).is_ok());
    }
}
