//! Image decoding into the network's input layout.
//!
//! Images are decoded to RGB, resized to `IMAGE_SIZE`×`IMAGE_SIZE` and scaled
//! to `[0, 1]`. Tensors are kept channel-last (`[N, H, W, C]`) on the host; the
//! model permutes to channel-first when it builds its input.

use std::path::Path;

use image::imageops::FilterType;
use image::DynamicImage;

use crate::error::ServiceError;

pub const IMAGE_SIZE: usize = 128;
pub const CHANNELS: usize = 3;

const PIXELS_PER_IMAGE: usize = IMAGE_SIZE * IMAGE_SIZE * CHANNELS;

/// Where an image comes from.
#[derive(Debug, Clone, Copy)]
pub enum ImageSource<'a> {
    Path(&'a Path),
    Bytes(&'a [u8]),
}

/// A batch of normalized images in `[N, H, W, C]` order.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
    batch: usize,
}

impl ImageTensor {
    pub fn shape(&self) -> [usize; 4] {
        [self.batch, IMAGE_SIZE, IMAGE_SIZE, CHANNELS]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Concatenates single images (or batches) along the batch axis.
    pub fn stack<'a, I>(images: I) -> Self
    where
        I: IntoIterator<Item = &'a ImageTensor>,
    {
        let mut data = Vec::new();
        let mut batch = 0;
        for image in images {
            data.extend_from_slice(&image.data);
            batch += image.batch;
        }
        Self { data, batch }
    }

    /// Mirrors every image in the batch left-to-right.
    pub fn flip_horizontal(&self) -> Self {
        let row = IMAGE_SIZE * CHANNELS;
        let mut data = Vec::with_capacity(self.data.len());
        for line in self.data.chunks_exact(row) {
            for pixel in line.chunks_exact(CHANNELS).rev() {
                data.extend_from_slice(pixel);
            }
        }
        Self {
            data,
            batch: self.batch,
        }
    }

    /// Translates every image by `(dx, dy)` pixels. Uncovered pixels repeat
    /// the nearest edge.
    pub fn shift(&self, dx: i32, dy: i32) -> Self {
        self.resample(|x, y| (x - dx as f32, y - dy as f32))
    }

    /// Scales every image about its centre; `factor > 1` zooms in.
    pub fn zoom(&self, factor: f32) -> Self {
        let centre = (IMAGE_SIZE - 1) as f32 / 2.0;
        self.resample(|x, y| {
            (
                (x - centre) / factor + centre,
                (y - centre) / factor + centre,
            )
        })
    }

    /// Nearest-neighbour resampling; `source` maps an output pixel to the
    /// input coordinate it reads, clamped to the image.
    fn resample(&self, source: impl Fn(f32, f32) -> (f32, f32)) -> Self {
        let last = (IMAGE_SIZE - 1) as f32;
        let mut data = Vec::with_capacity(self.data.len());
        for image in self.data.chunks_exact(PIXELS_PER_IMAGE) {
            for y in 0..IMAGE_SIZE {
                for x in 0..IMAGE_SIZE {
                    let (sx, sy) = source(x as f32, y as f32);
                    let sx = sx.round().clamp(0.0, last) as usize;
                    let sy = sy.round().clamp(0.0, last) as usize;
                    let at = (sy * IMAGE_SIZE + sx) * CHANNELS;
                    data.extend_from_slice(&image[at..at + CHANNELS]);
                }
            }
        }
        Self {
            data,
            batch: self.batch,
        }
    }
}

/// Decodes `source` into a `[1, 128, 128, 3]` tensor with values in `[0, 1]`.
pub fn preprocess(source: ImageSource<'_>) -> Result<ImageTensor, ServiceError> {
    let image = match source {
        ImageSource::Path(path) => image::open(path)
            .map_err(|e| ServiceError::Decode(format!("{}: {}", path.display(), e)))?,
        ImageSource::Bytes(bytes) => {
            image::load_from_memory(bytes).map_err(|e| ServiceError::Decode(e.to_string()))?
        }
    };
    Ok(to_tensor(&image))
}

fn to_tensor(image: &DynamicImage) -> ImageTensor {
    let rgb = image
        .resize_exact(IMAGE_SIZE as u32, IMAGE_SIZE as u32, FilterType::Triangle)
        .to_rgb8();

    let mut data = Vec::with_capacity(PIXELS_PER_IMAGE);
    for pixel in rgb.pixels() {
        data.push(pixel[0] as f32 / 255.0);
        data.push(pixel[1] as f32 / 255.0);
        data.push(pixel[2] as f32 / 255.0);
    }

    ImageTensor { data, batch: 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 200])
        })
    }

    #[test]
    fn path_source_yields_fixed_shape_in_unit_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        gradient(300, 90).save(&path).unwrap();

        let tensor = preprocess(ImageSource::Path(&path)).unwrap();

        assert_eq!(tensor.shape(), [1, 128, 128, 3]);
        assert_eq!(tensor.data().len(), PIXELS_PER_IMAGE);
        assert!(tensor.data().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn byte_source_matches_path_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tall.png");
        gradient(40, 170).save(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        let from_path = preprocess(ImageSource::Path(&path)).unwrap();
        let from_bytes = preprocess(ImageSource::Bytes(&bytes)).unwrap();

        assert_eq!(from_path, from_bytes);
    }

    #[test]
    fn grayscale_is_expanded_to_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.png");
        GrayImage::from_pixel(64, 64, Luma([255])).save(&path).unwrap();

        let tensor = preprocess(ImageSource::Path(&path)).unwrap();

        assert_eq!(tensor.shape(), [1, 128, 128, 3]);
        assert!(tensor.data().iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn garbage_bytes_fail_with_decode_error() {
        let result = preprocess(ImageSource::Bytes(b"definitely not a jpeg"));
        assert!(matches!(result, Err(ServiceError::Decode(_))));
    }

    #[test]
    fn missing_path_fails_with_decode_error() {
        let result = preprocess(ImageSource::Path(Path::new("/nonexistent/boot.jpg")));
        assert!(matches!(result, Err(ServiceError::Decode(_))));
    }

    #[test]
    fn stack_and_flip_preserve_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.png");
        gradient(128, 128).save(&path).unwrap();
        let one = preprocess(ImageSource::Path(&path)).unwrap();

        let batch = ImageTensor::stack([&one, &one]);
        assert_eq!(batch.shape(), [2, 128, 128, 3]);

        let flipped = one.flip_horizontal();
        let row = &one.data()[..IMAGE_SIZE * CHANNELS];
        let flipped_row = &flipped.data()[..IMAGE_SIZE * CHANNELS];
        assert_eq!(&row[..CHANNELS], &flipped_row[flipped_row.len() - CHANNELS..]);
        assert_eq!(flipped.flip_horizontal(), one);
    }

    fn pixel(image: &ImageTensor, x: usize, y: usize) -> &[f32] {
        let at = (y * IMAGE_SIZE + x) * CHANNELS;
        &image.data()[at..at + CHANNELS]
    }

    #[test]
    fn shift_moves_content_and_repeats_edges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.png");
        gradient(128, 128).save(&path).unwrap();
        let one = preprocess(ImageSource::Path(&path)).unwrap();

        let shifted = one.shift(5, -3);

        assert_eq!(shifted.shape(), one.shape());
        assert_eq!(pixel(&shifted, 40, 20), pixel(&one, 35, 23));
        // left columns are filled from column 0, bottom rows from the last row
        assert_eq!(pixel(&shifted, 2, 20), pixel(&one, 0, 23));
        assert_eq!(pixel(&shifted, 40, 127), pixel(&one, 35, 127));
        assert_eq!(one.shift(0, 0), one);
    }

    #[test]
    fn zoom_keeps_the_centre_and_spreads_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.png");
        gradient(128, 128).save(&path).unwrap();
        let one = preprocess(ImageSource::Path(&path)).unwrap();

        assert_eq!(one.zoom(1.0), one);

        let zoomed_in = one.zoom(2.0);
        assert_eq!(pixel(&zoomed_in, 64, 64), pixel(&one, 64, 64));
        // x = 0 reads from (0 - 63.5) / 2 + 63.5 = 31.75, rounded to 32
        assert_eq!(pixel(&zoomed_in, 0, 64), pixel(&one, 32, 64));

        let zoomed_out = one.zoom(0.5);
        assert_eq!(pixel(&zoomed_out, 0, 0), pixel(&one, 0, 0));
        assert_eq!(pixel(&zoomed_out, 127, 127), pixel(&one, 127, 127));
    }

    #[test]
    fn resampling_applies_to_every_image_in_a_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.png");
        gradient(128, 128).save(&path).unwrap();
        let one = preprocess(ImageSource::Path(&path)).unwrap();
        let batch = ImageTensor::stack([&one, &one]);

        let shifted = batch.shift(7, 7);

        assert_eq!(shifted.shape(), [2, 128, 128, 3]);
        let expected = one.shift(7, 7);
        assert_eq!(ImageTensor::stack([&expected, &expected]), shifted);
    }
}
