use super::network::{CompactNet, NetworkSpec};
use crate::error::UpscaleError;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageBuffer, Luma, Rgb32FImage, Rgba, Rgba32FImage};
use std::collections::HashMap;
use std::path::Path;

/// State-dict keys tried in order; EMA weights are preferred when present
const STATE_DICT_KEYS: [Option<&str>; 3] = [Some("params_ema"), Some("params"), None];

/// Bytes per pixel of an RGBA f32 buffer
const MAX_BYTES_PER_PIXEL: u64 = 16;

/// Largest intermediate buffer the engine will allocate (8 GiB)
const MAX_OUTPUT_BYTES: u64 = 8 << 30;

/// Runs super-resolution on a decoded image
#[cfg_attr(test, mockall::automock)]
pub trait Enhancer {
    /// Returns `image` magnified by `outscale` relative to its input size
    ///
    /// # Errors
    /// Returns `Inference` if the forward pass fails
    fn enhance(&self, image: &DynamicImage, outscale: u32) -> Result<DynamicImage, UpscaleError>;
}

/// Builds an [`Enhancer`] from a weights file
#[cfg_attr(test, mockall::automock)]
pub trait EngineLoader {
    /// Loads `weights` into a network shaped by `spec`
    ///
    /// # Errors
    /// Returns `Model` if the weights are unreadable or do not fit `spec`
    fn load(
        &self,
        spec: &NetworkSpec,
        weights: &Path,
        half: bool,
    ) -> Result<Box<dyn Enhancer>, UpscaleError>;
}

/// Loads [`Upsampler`]s backed by candle
#[derive(Debug, Default, Clone, Copy)]
pub struct CandleLoader;

impl EngineLoader for CandleLoader {
    fn load(
        &self,
        spec: &NetworkSpec,
        weights: &Path,
        half: bool,
    ) -> Result<Box<dyn Enhancer>, UpscaleError> {
        Ok(Box::new(Upsampler::new(spec, weights, half)?))
    }
}

/// Whole-image super-resolution engine
///
/// The image is processed in one pass (no tiling); output is brought to the
/// requested scale with a Lanczos resize when it differs from the network's
/// internal factor.
pub struct Upsampler {
    net: CompactNet,
    device: Device,
    dtype: DType,
}

impl Upsampler {
    /// Loads a PyTorch state dict into the network
    ///
    /// Half precision is only used on accelerators; CPU inference stays in f32.
    ///
    /// # Errors
    /// Returns `Model` if the file cannot be read or a tensor is missing
    pub fn new(spec: &NetworkSpec, weights: &Path, half: bool) -> Result<Self, UpscaleError> {
        let model_err = |message: String| UpscaleError::Model {
            path: weights.to_path_buf(),
            message,
        };

        let device = Device::cuda_if_available(0).map_err(|e| model_err(e.to_string()))?;
        let dtype = if half && !device.is_cpu() {
            DType::F16
        } else {
            DType::F32
        };

        tracing::info!(
            path = %weights.display(),
            device = ?device,
            dtype = ?dtype,
            "loading super-resolution weights"
        );

        let tensors = read_state_dict(weights).map_err(model_err)?;
        let upsampler =
            Self::from_tensors(spec, tensors, device, dtype).map_err(|e| model_err(e.to_string()))?;

        tracing::info!("super-resolution model loaded successfully");

        Ok(upsampler)
    }

    /// Builds the network from an already loaded state dict
    ///
    /// # Errors
    /// Returns error if a tensor is missing or has the wrong shape
    pub fn from_tensors(
        spec: &NetworkSpec,
        tensors: HashMap<String, Tensor>,
        device: Device,
        dtype: DType,
    ) -> candle_core::Result<Self> {
        let vb = VarBuilder::from_tensors(tensors, dtype, &device);
        let net = CompactNet::load(spec, vb)?;
        Ok(Self { net, device, dtype })
    }

    fn infer(&self, rgb: Rgb32FImage) -> Result<Rgb32FImage, UpscaleError> {
        let (w, h) = rgb.dimensions();
        let input = Tensor::from_vec(rgb.into_raw(), (h as usize, w as usize, 3), &self.device)?
            .permute((2, 0, 1))?
            .unsqueeze(0)?
            .to_dtype(self.dtype)?;

        let output = self
            .net
            .forward(&input)?
            .squeeze(0)?
            .to_dtype(DType::F32)?
            .clamp(0.0, 1.0)?
            .permute((1, 2, 0))?;
        let (out_h, out_w, _) = output.dims3()?;
        let data = output.flatten_all()?.to_vec1::<f32>()?;

        let out_w = u32::try_from(out_w).map_err(|e| UpscaleError::Inference(e.to_string()))?;
        let out_h = u32::try_from(out_h).map_err(|e| UpscaleError::Inference(e.to_string()))?;
        Rgb32FImage::from_raw(out_w, out_h, data)
            .ok_or_else(|| UpscaleError::Inference("output buffer size mismatch".to_owned()))
    }
}

impl Enhancer for Upsampler {
    fn enhance(&self, image: &DynamicImage, outscale: u32) -> Result<DynamicImage, UpscaleError> {
        let (w, h) = image.dimensions();
        let (target_w, target_h) = target_size(w, h, outscale)?;
        let _span = tracing::debug_span!("enhance", w, h, outscale).entered();

        let start = std::time::Instant::now();
        let mut rgb = self.infer(image.to_rgb32f())?;
        let inference_duration = start.elapsed();

        if rgb.dimensions() != (target_w, target_h) {
            rgb = imageops::resize(&rgb, target_w, target_h, FilterType::Lanczos3);
        }

        let color = image.color();
        let upscaled = if color.has_alpha() {
            DynamicImage::ImageRgba32F(attach_alpha(&rgb, image, target_w, target_h))
        } else {
            DynamicImage::ImageRgb32F(rgb)
        };

        tracing::info!(
            out_w = target_w,
            out_h = target_h,
            inference_ms = inference_duration.as_millis(),
            "enhancement completed"
        );

        Ok(match_layout(&upscaled, image))
    }
}

/// Output dimensions for `outscale`, rejecting sizes no buffer could hold
fn target_size(w: u32, h: u32, outscale: u32) -> Result<(u32, u32), UpscaleError> {
    let too_large = || {
        UpscaleError::Inference(format!(
            "output size for {w}x{h} at scale {outscale} is too large"
        ))
    };

    let target_w = w.checked_mul(outscale).ok_or_else(too_large)?;
    let target_h = h.checked_mul(outscale).ok_or_else(too_large)?;

    // The widest intermediate is RGBA f32
    let bytes = u64::from(target_w)
        .checked_mul(u64::from(target_h))
        .and_then(|pixels| pixels.checked_mul(MAX_BYTES_PER_PIXEL))
        .ok_or_else(too_large)?;
    if bytes > MAX_OUTPUT_BYTES {
        return Err(too_large());
    }

    Ok((target_w, target_h))
}

/// Loads the tensors of a `.pth` checkpoint, unwrapping the `params*` dict if any
fn read_state_dict(path: &Path) -> Result<HashMap<String, Tensor>, String> {
    let mut last_error = None;
    for key in STATE_DICT_KEYS {
        match candle_core::pickle::read_all_with_key(path, key) {
            Ok(tensors) if !tensors.is_empty() => {
                tracing::debug!(key = ?key, count = tensors.len(), "read state dict");
                return Ok(tensors.into_iter().collect());
            }
            Ok(_) => {}
            Err(e) => last_error = Some(e.to_string()),
        }
    }
    Err(last_error.unwrap_or_else(|| "checkpoint contains no tensors".to_owned()))
}

/// Upscales the source alpha channel with a linear filter and joins it to `rgb`
fn attach_alpha(
    rgb: &Rgb32FImage,
    source: &DynamicImage,
    width: u32,
    height: u32,
) -> Rgba32FImage {
    let rgba = source.to_rgba32f();
    let alpha: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_fn(rgba.width(), rgba.height(), |x, y| {
            Luma([rgba.get_pixel(x, y)[3]])
        });
    let alpha = imageops::resize(&alpha, width, height, FilterType::Triangle);

    Rgba32FImage::from_fn(width, height, |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        Rgba([r, g, b, alpha.get_pixel(x, y)[0]])
    })
}

/// Converts the float result back to the source's channel layout and bit depth
fn match_layout(upscaled: &DynamicImage, source: &DynamicImage) -> DynamicImage {
    let color = source.color();
    let gray = !color.has_color();
    let alpha = color.has_alpha();
    let wide = color.bytes_per_pixel() / color.channel_count() > 1;

    match (gray, alpha, wide) {
        (true, true, true) => DynamicImage::ImageLumaA16(upscaled.to_luma_alpha16()),
        (true, true, false) => DynamicImage::ImageLumaA8(upscaled.to_luma_alpha8()),
        (true, false, true) => DynamicImage::ImageLuma16(upscaled.to_luma16()),
        (true, false, false) => DynamicImage::ImageLuma8(upscaled.to_luma8()),
        (false, true, true) => DynamicImage::ImageRgba16(upscaled.to_rgba16()),
        (false, true, false) => DynamicImage::ImageRgba8(upscaled.to_rgba8()),
        (false, false, true) => DynamicImage::ImageRgb16(upscaled.to_rgb16()),
        (false, false, false) => DynamicImage::ImageRgb8(upscaled.to_rgb8()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::model::network::zero_state_dict;
    use image::{GrayImage, Rgb, RgbImage, RgbaImage};

    /// Upsampler whose convolutions are all zero, so it acts as a nearest
    /// upscale by `upscale`
    fn zero_upsampler(upscale: usize) -> Upsampler {
        let spec = NetworkSpec::try_from(&NetworkConfig {
            num_in_ch: 3,
            num_out_ch: 3,
            num_feat: 4,
            num_conv: 1,
            upscale,
            act_type: "prelu".to_owned(),
        })
        .unwrap();
        let tensors = zero_state_dict(&spec, &Device::Cpu).unwrap();
        Upsampler::from_tensors(&spec, tensors, Device::Cpu, DType::F32).unwrap()
    }

    fn assert_close(actual: &[u8], expected: &[u8]) {
        for (a, e) in actual.iter().zip(expected) {
            assert!(a.abs_diff(*e) <= 1, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn test_enhance_resizes_network_output_to_scale() {
        let upsampler = zero_upsampler(4);
        let source = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([100, 150, 200])));

        let out = upsampler.enhance(&source, 2).unwrap();

        assert_eq!(out.dimensions(), (6, 4));
        assert_eq!(out.color(), image::ColorType::Rgb8);
        for pixel in out.to_rgb8().pixels() {
            assert_close(&pixel.0, &[100, 150, 200]);
        }
    }

    #[test]
    fn test_enhance_at_network_scale_keeps_layout() {
        let upsampler = zero_upsampler(4);
        let source = RgbImage::from_fn(2, 2, |x, y| {
            let v = u8::try_from(60 * (2 * y + x)).unwrap();
            Rgb([v, 255 - v, 40])
        });

        let out = upsampler
            .enhance(&DynamicImage::ImageRgb8(source.clone()), 4)
            .unwrap()
            .to_rgb8();

        assert_eq!(out.dimensions(), (8, 8));
        for (x, y, pixel) in out.enumerate_pixels() {
            assert_eq!(pixel, source.get_pixel(x / 4, y / 4), "pixel ({x}, {y})");
        }
    }

    #[test]
    fn test_enhance_rgba_keeps_alpha() {
        let upsampler = zero_upsampler(4);
        let source = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 128])));

        let out = upsampler.enhance(&source, 2).unwrap();

        assert_eq!(out.color(), image::ColorType::Rgba8);
        assert_eq!(out.dimensions(), (4, 4));
        for pixel in out.to_rgba8().pixels() {
            assert_close(&pixel.0, &[10, 20, 30, 128]);
        }
    }

    #[test]
    fn test_enhance_gray_stays_gray() {
        let upsampler = zero_upsampler(4);
        let source = DynamicImage::ImageLuma8(GrayImage::from_pixel(2, 3, Luma([90])));

        let out = upsampler.enhance(&source, 3).unwrap();

        assert_eq!(out.color(), image::ColorType::L8);
        assert_eq!(out.dimensions(), (6, 9));
    }

    #[test]
    fn test_enhance_rejects_overflowing_scale() {
        let upsampler = zero_upsampler(4);
        let source = DynamicImage::ImageRgb8(RgbImage::new(2, 2));

        let result = upsampler.enhance(&source, 3_000_000_000);

        assert!(matches!(result, Err(UpscaleError::Inference(_))));
    }

    #[test]
    fn test_target_size() {
        assert_eq!(target_size(4, 3, 2).unwrap(), (8, 6));
        assert!(target_size(u32::MAX, 1, 2).is_err());
        assert!(target_size(100_000, 100_000, 1).is_err());
    }

    #[test]
    fn test_match_layout_preserves_gray() {
        let source = DynamicImage::ImageLuma8(GrayImage::new(2, 2));
        let upscaled = DynamicImage::ImageRgb32F(Rgb32FImage::new(4, 4));

        let out = match_layout(&upscaled, &source);

        assert_eq!(out.color(), image::ColorType::L8);
        assert_eq!(out.dimensions(), (4, 4));
    }

    #[test]
    fn test_match_layout_preserves_depth_and_alpha() {
        let source = DynamicImage::ImageRgba16(ImageBuffer::new(1, 1));
        let upscaled = DynamicImage::ImageRgba32F(Rgba32FImage::new(2, 2));

        assert_eq!(
            match_layout(&upscaled, &source).color(),
            image::ColorType::Rgba16
        );
    }

    #[test]
    fn test_match_layout_rgb8() {
        let source = DynamicImage::ImageRgb8(RgbImage::new(1, 1));
        let upscaled = DynamicImage::ImageRgb32F(Rgb32FImage::new(2, 2));

        assert_eq!(match_layout(&upscaled, &source).color(), image::ColorType::Rgb8);
    }

    #[test]
    fn test_attach_alpha_upscales_alpha_channel() {
        let mut source = RgbaImage::new(2, 2);
        for pixel in source.pixels_mut() {
            *pixel = Rgba([10, 20, 30, 255]);
        }
        let source = DynamicImage::ImageRgba8(source);
        let rgb = Rgb32FImage::from_pixel(4, 4, Rgb([0.5, 0.5, 0.5]));

        let out = attach_alpha(&rgb, &source, 4, 4);

        assert_eq!(out.dimensions(), (4, 4));
        for pixel in out.pixels() {
            assert!((pixel[3] - 1.0).abs() < 1e-4);
            assert!((pixel[0] - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_read_state_dict_rejects_non_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pth");
        std::fs::write(&path, b"not a checkpoint").unwrap();

        assert!(read_state_dict(&path).is_err());
    }

    #[test]
    fn test_loader_reports_model_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pth");
        std::fs::write(&path, b"not a checkpoint").unwrap();
        let spec = NetworkSpec::try_from(&crate::config::NetworkConfig::default()).unwrap();

        let result = CandleLoader.load(&spec, &path, false);

        assert!(matches!(result, Err(UpscaleError::Model { .. })));
    }
}
