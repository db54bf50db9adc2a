use crate::config::ModelConfig;
use crate::error::UpscaleError;
use crate::model::{ensure_weights, EngineLoader, NetworkSpec, WeightsFetcher};
use crate::progress::{Phase, Reporter};
use image::{DynamicImage, ImageFormat, ImageReader};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Output magnification used when the caller gives none
pub const DEFAULT_SCALE: u32 = 2;

/// Printed when the positional arguments are incomplete
pub const USAGE: &str = "Usage: upscale input_path output_path [scale]";

/// One image to upscale
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscaleRequest {
    /// Image to read
    pub input: PathBuf,
    /// Image to write; format follows the extension
    pub output: PathBuf,
    /// Output size relative to the input
    pub scale: u32,
}

/// External collaborators of a run
#[derive(Clone, Copy)]
pub struct Services<'a> {
    /// Fetches weights when absent
    pub fetcher: &'a dyn WeightsFetcher,
    /// Builds the inference engine
    pub loader: &'a dyn EngineLoader,
}

/// Runs every phase in order, stopping at the first failure
///
/// # Errors
/// Returns the failure of whichever phase broke; later phases do not run
pub fn upscale_image<W: Write>(
    request: &UpscaleRequest,
    config: &ModelConfig,
    services: Services<'_>,
    reporter: &mut Reporter<W>,
) -> Result<(), UpscaleError> {
    let _span = tracing::info_span!(
        "upscale",
        input = %request.input.display(),
        output = %request.output.display(),
        scale = request.scale
    )
    .entered();
    let start = Instant::now();

    reporter.phase(Phase::Init);
    let spec = NetworkSpec::try_from(&config.network)?;
    let weights = config
        .weights_path()
        .map_err(|e| UpscaleError::Config(format!("{e:#}")))?;

    ensure_weights(&config.url, &weights, services.fetcher, || {
        reporter.phase(Phase::Download);
    })?;

    reporter.phase(Phase::Load);
    let engine = services.loader.load(&spec, &weights, config.half)?;

    reporter.phase(Phase::Read);
    let image = read_image(&request.input)?;

    reporter.phase(Phase::Process);
    let output = engine.enhance(&image, request.scale)?;

    reporter.phase(Phase::Save);
    write_image(&output, &request.output)?;

    reporter.phase(Phase::Done);
    tracing::info!(
        total_ms = start.elapsed().as_millis(),
        "upscale completed"
    );

    Ok(())
}

/// Runs [`upscale_image`], turning any failure into one `ERROR:` line
///
/// Returns true on success.
pub fn run<W: Write>(
    request: &UpscaleRequest,
    config: &ModelConfig,
    services: Services<'_>,
    reporter: &mut Reporter<W>,
) -> bool {
    match upscale_image(request, config, services, reporter) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = ?e, "upscale failed");
            reporter.error(&e);
            false
        }
    }
}

fn read_image(path: &Path) -> Result<DynamicImage, UpscaleError> {
    let decode_err = |message: String| UpscaleError::Decode {
        path: path.to_path_buf(),
        message,
    };

    let image = ImageReader::open(path)
        .map_err(|e| decode_err(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| decode_err(e.to_string()))?
        .decode()
        .map_err(|e| decode_err(e.to_string()))?;

    tracing::info!(
        width = image.width(),
        height = image.height(),
        color = ?image.color(),
        "image decoded"
    );

    Ok(image)
}

fn write_image(image: &DynamicImage, path: &Path) -> Result<(), UpscaleError> {
    let encode_err = |message: String| UpscaleError::Encode {
        path: path.to_path_buf(),
        message,
    };

    let format = ImageFormat::from_path(path).map_err(|e| encode_err(e.to_string()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| UpscaleError::filesystem(parent, e))?;
    }

    let prepared = prepare_for_format(image, format);
    prepared
        .save_with_format(path, format)
        .map_err(|e| encode_err(e.to_string()))?;

    tracing::info!(path = %path.display(), format = ?format, "image written");
    Ok(())
}

/// Narrows the pixel layout to what the target encoder accepts
fn prepare_for_format(image: &DynamicImage, format: ImageFormat) -> DynamicImage {
    let color = image.color();
    match format {
        ImageFormat::Jpeg if color.has_color() => DynamicImage::ImageRgb8(image.to_rgb8()),
        ImageFormat::Jpeg => DynamicImage::ImageLuma8(image.to_luma8()),
        ImageFormat::WebP if color.has_alpha() => DynamicImage::ImageRgba8(image.to_rgba8()),
        ImageFormat::WebP => DynamicImage::ImageRgb8(image.to_rgb8()),
        _ => image.clone(),
    }
}
