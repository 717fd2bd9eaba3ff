//! Conversion between image files and network input tensors.

use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use image::RgbImage;
use image::imageops::{self, FilterType};

use crate::error::{Result, StyleTransferError};

/// Preprocessing the VGG-19 snapshot was trained with.
///
/// Images are resized so their shorter side equals `image_size`, reordered to
/// BGR, centered on `mean_bgr` and scaled back to the `[0, 255]` range.
#[derive(Config, Debug)]
pub struct ImageTransform {
    #[config(default = 512)]
    pub image_size: u32,
    /// Per-channel mean in BGR order, in `[0, 1]` units.
    #[config(default = "[0.40760392, 0.45795686, 0.48501961]")]
    pub mean_bgr: [f32; 3],
    #[config(default = 255.0)]
    pub scale: f32,
}

impl ImageTransform {
    /// Resize so the shorter side equals `image_size`, keeping the aspect ratio.
    ///
    /// The longer side is truncated, images already at the target size are untouched.
    pub fn resize(&self, image: RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        let size = self.image_size;

        if (width <= height && width == size) || (height <= width && height == size) {
            return image;
        }

        let (new_width, new_height) = if width < height {
            (size, (size as u64 * height as u64 / width as u64) as u32)
        } else {
            ((size as u64 * width as u64 / height as u64) as u32, size)
        };

        imageops::resize(
            &image,
            new_width.max(1),
            new_height.max(1),
            FilterType::Triangle,
        )
    }

    /// Convert an RGB image to a `[1, 3, H, W]` BGR tensor in the network value range.
    pub fn to_tensor<B: Backend>(&self, image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
        let (width, height) = image.dimensions();
        let data = TensorData::new(
            image.as_raw().clone(),
            [height as usize, width as usize, 3],
        )
        .convert::<B::FloatElem>();

        let rgb = Tensor::<B, 3>::from_data(data, device)
            .permute([2, 0, 1])
            .div_scalar(255.0);
        let bgr = rgb.flip([0]);

        (bgr - self.mean(device)).mul_scalar(self.scale).unsqueeze()
    }

    /// Convert a `[1, 3, H, W]` tensor back to an RGB image, clipping out-of-range values.
    pub fn to_image<B: Backend>(&self, tensor: Tensor<B, 4>) -> Result<RgbImage> {
        let [batch, channels, height, width] = tensor.dims();
        if batch != 1 || channels != 3 {
            return Err(StyleTransferError::Shape(format!(
                "expected an image of shape [1, 3, H, W], got {:?}",
                tensor.dims()
            )));
        }

        let device = tensor.device();
        let bgr = tensor.reshape([3, height, width]).div_scalar(self.scale) + self.mean(&device);
        let rgb = bgr
            .flip([0])
            .clamp(0.0, 1.0)
            .mul_scalar(255.0)
            .permute([1, 2, 0]);

        let pixels = rgb
            .into_data()
            .iter::<f32>()
            .map(|value| value.round() as u8)
            .collect();

        RgbImage::from_raw(width as u32, height as u32, pixels).ok_or_else(|| {
            StyleTransferError::Shape(format!("cannot build a {width}x{height} image"))
        })
    }

    /// Read, resize and convert the image at `path`.
    pub fn load<B: Backend>(&self, path: &Path, device: &B::Device) -> Result<Tensor<B, 4>> {
        if self.image_size == 0 {
            return Err(StyleTransferError::Config(
                "image size must be positive".to_string(),
            ));
        }
        if !path.exists() {
            return Err(StyleTransferError::MissingFile(path.to_path_buf()));
        }

        let image = image::open(path)?.to_rgb8();
        let image = self.resize(image);
        log::debug!(
            "Loaded {} as a {}x{} image",
            path.display(),
            image.width(),
            image.height()
        );

        Ok(self.to_tensor(&image, device))
    }

    fn mean<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::<B, 1>::from_floats(self.mean_bgr, device).reshape([3, 1, 1])
    }
}

/// Write `image` to `path`, creating the parent directory when needed.
///
/// The encoding is chosen from the file extension.
pub fn save_image(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image.save(path)?;

    Ok(())
}

/// Output file of experiment `index` for a style/content pair:
/// `{style}_{content}_{index}.jpeg`, where names are cut at their first `.`.
pub fn output_path(dir: &Path, style: &Path, content: &Path, index: usize) -> PathBuf {
    dir.join(format!("{}_{}_{index}.jpeg", stem(style), stem(content)))
}

fn stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    match name.split_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;

    fn pattern(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 40) as u8, (y * 30) as u8, ((x + y) * 17) as u8])
        })
    }

    #[test]
    fn tensor_layout_is_bgr_centered_and_scaled() {
        let transform = ImageTransform::new();
        let image = RgbImage::from_pixel(2, 1, image::Rgb([255, 0, 51]));
        let device = Default::default();

        let tensor = transform.to_tensor::<TestBackend>(&image, &device);

        assert_eq!(tensor.dims(), [1, 3, 1, 2]);
        let values = tensor.into_data().iter::<f32>().collect::<Vec<_>>();
        let expected = [
            (0.2 - 0.40760392) * 255.0,
            (0.0 - 0.45795686) * 255.0,
            (1.0 - 0.48501961) * 255.0,
        ];
        for (channel, expected) in expected.iter().enumerate() {
            for pixel in 0..2 {
                let actual = values[channel * 2 + pixel];
                assert!((actual - expected).abs() < 1e-3, "{actual} != {expected}");
            }
        }
    }

    #[test]
    fn image_survives_tensor_round_trip() {
        let transform = ImageTransform::new();
        let image = pattern(6, 4);
        let device = Default::default();

        let tensor = transform.to_tensor::<TestBackend>(&image, &device);
        let restored = transform.to_image(tensor).unwrap();

        assert_eq!(restored, image);
    }

    #[test]
    fn out_of_range_values_are_clipped() {
        let transform = ImageTransform::new();
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 4>::full([1, 3, 2, 2], 1e4, &device);

        let image = transform.to_image(tensor).unwrap();

        assert!(image.pixels().all(|pixel| pixel.0 == [255, 255, 255]));
    }

    #[test]
    fn to_image_rejects_batches() {
        let transform = ImageTransform::new();
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 4>::zeros([2, 3, 2, 2], &device);

        let result = transform.to_image(tensor);

        assert!(matches!(result, Err(StyleTransferError::Shape(_))));
    }

    #[test]
    fn resize_matches_shorter_side() {
        let transform = ImageTransform::new().with_image_size(8);

        assert_eq!(transform.resize(pattern(20, 10)).dimensions(), (16, 8));
        assert_eq!(transform.resize(pattern(10, 25)).dimensions(), (8, 20));
        assert_eq!(transform.resize(pattern(8, 13)).dimensions(), (8, 13));
    }

    #[test]
    fn output_names_join_stems_and_index() {
        let path = output_path(
            Path::new("Output_Images"),
            Path::new("Images/starry.night.jpg"),
            Path::new("Images/tubingen.jpg"),
            2,
        );

        assert_eq!(path, Path::new("Output_Images/starry_tubingen_2.jpeg"));
    }

    #[test]
    fn missing_input_is_reported() {
        let transform = ImageTransform::new();
        let device = Default::default();

        let result = transform.load::<TestBackend>(Path::new("does/not/exist.jpg"), &device);

        assert!(matches!(result, Err(StyleTransferError::MissingFile(_))));
    }
}
