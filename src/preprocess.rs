//! Image preprocessing services for classifier input.
//!
//! Each step is an independent service composed by `PreprocessingPipeline`:
//! decode, EXIF orientation, gray-world color balance, short-side resize,
//! center crop, then conversion to a standardized `1x3xHxW` tensor.
//!
//! The step order is fixed. Only the numbers (sizes, mean/std) come from
//! `PreprocessConfig`, and `PreprocessConfig::imagenet()` matches what the
//! network was trained with.

use std::borrow::Cow;
use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};
use ndarray::{Array4, ArrayView4};
use thiserror::Error;
use tracing::debug;

// ═══════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════

/// Added to every channel mean before computing gray-world gains.
/// Keeps an all-black channel from dividing by zero.
const GRAY_WORLD_EPS: f32 = 1e-6;

/// Largest accepted width or height of an upload, checked before decoding.
pub const MAX_INPUT_DIMENSION: u32 = 10_000;

/// Largest accepted ratio between the long and the short side. Bounds the
/// long side after the short-side resize.
pub const MAX_ASPECT_RATIO: u32 = 32;

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum PreprocessError {
    /// Bytes are empty or not a decodable image. Client-side problem.
    #[error("{0}")]
    Decode(String),

    #[error("Invalid preprocessing configuration: {0}")]
    InvalidConfig(String),

    #[error("Tensor construction failed: {0}")]
    Tensor(String),
}

// ═══════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════

/// Geometry and statistics the classifier expects.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessConfig {
    /// Length of the shorter side after resizing.
    pub resize_short_side: u32,
    /// Side of the square center crop fed to the network.
    pub crop_size: u32,
    /// Per-channel mean (RGB, on the [0, 1] scale).
    pub mean: [f32; 3],
    /// Per-channel standard deviation (RGB, on the [0, 1] scale).
    pub std: [f32; 3],
    /// Uploads wider or taller than this are rejected before decoding.
    pub max_input_dimension: u32,
    /// Uploads whose long side exceeds `max_aspect_ratio` times the short
    /// side are rejected before decoding.
    pub max_aspect_ratio: u32,
}

impl PreprocessConfig {
    /// ImageNet statistics, 256 resize, 224 crop.
    pub fn imagenet() -> Self {
        Self {
            resize_short_side: 256,
            crop_size: 224,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
            max_input_dimension: MAX_INPUT_DIMENSION,
            max_aspect_ratio: MAX_ASPECT_RATIO,
        }
    }

    pub fn validate(&self) -> Result<(), PreprocessError> {
        if self.crop_size == 0 {
            return Err(PreprocessError::InvalidConfig(
                "crop size must be greater than 0".into(),
            ));
        }
        if self.crop_size > self.resize_short_side {
            return Err(PreprocessError::InvalidConfig(format!(
                "crop size {} exceeds resize target {}",
                self.crop_size, self.resize_short_side
            )));
        }
        if self.max_input_dimension == 0 || self.max_aspect_ratio == 0 {
            return Err(PreprocessError::InvalidConfig(
                "input bounds must be greater than 0".into(),
            ));
        }
        for (i, &s) in self.std.iter().enumerate() {
            if !(s.is_finite() && s > 0.0) {
                return Err(PreprocessError::InvalidConfig(format!(
                    "standard deviation at index {i} must be positive, got {s}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self::imagenet()
    }
}

// ═══════════════════════════════════════════════════════════
// Service traits
// ═══════════════════════════════════════════════════════════

/// Fixes image orientation from EXIF metadata.
///
/// Phone photos embed rotation in EXIF tag 0x0112. Without correction a
/// portrait shot reaches the network sideways and gets cropped differently.
pub trait OrientationCorrector: Send + Sync {
    /// `raw_bytes` is the original upload (EXIF lives there, not in the
    /// decoded pixels). No-op if there is no EXIF or orientation is 1.
    fn correct(&self, raw_bytes: &[u8], image: DynamicImage) -> DynamicImage;
}

/// Color-balance step applied before any geometry change.
pub trait ColorBalancer: Send + Sync {
    fn balance(&self, image: RgbImage) -> RgbImage;
}

/// Turns uploaded bytes into a network-ready tensor.
///
/// Pure bytes-to-tensor transform: no I/O, no model calls.
pub trait ImagePreprocessor: Send + Sync {
    fn preprocess(&self, image_bytes: &[u8]) -> Result<InputTensor, PreprocessError>;
}

// ═══════════════════════════════════════════════════════════
// Result type
// ═══════════════════════════════════════════════════════════

/// Standardized `1 x 3 x H x W` float tensor in CHW order.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor(Array4<f32>);

impl InputTensor {
    pub fn from_array(array: Array4<f32>) -> Self {
        Self(array)
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }

    pub fn array(&self) -> &Array4<f32> {
        &self.0
    }

    /// Contiguous data, `None` only for non-standard layouts.
    pub fn as_slice(&self) -> Option<&[f32]> {
        self.0.as_slice()
    }

    /// Mean over every element. Zero for an empty tensor.
    pub fn mean(&self) -> f32 {
        self.0.mean().unwrap_or(0.0)
    }
}

// ═══════════════════════════════════════════════════════════
// PreprocessingPipeline
// ═══════════════════════════════════════════════════════════

/// Pipeline flow:
/// 1. Decode (any mode → 8-bit RGB, grayscale broadcast to 3 channels)
/// 2. `orientation.correct()`: EXIF rotation
/// 3. `balancer.balance()`: gray-world
/// 4. Resize shorter side to `resize_short_side`
/// 5. Center crop `crop_size`
/// 6. Scale to [0, 1] and standardize per channel
pub struct PreprocessingPipeline {
    orientation: Box<dyn OrientationCorrector>,
    balancer: Box<dyn ColorBalancer>,
    config: PreprocessConfig,
}

impl PreprocessingPipeline {
    pub fn new(
        orientation: Box<dyn OrientationCorrector>,
        balancer: Box<dyn ColorBalancer>,
        config: PreprocessConfig,
    ) -> Self {
        Self {
            orientation,
            balancer,
            config,
        }
    }

    /// Production pipeline: EXIF correction, gray-world, ImageNet geometry.
    pub fn standard() -> Self {
        Self::new(
            Box::new(ExifOrientationCorrector),
            Box::new(GrayWorldBalancer),
            PreprocessConfig::imagenet(),
        )
    }
}

impl ImagePreprocessor for PreprocessingPipeline {
    fn preprocess(&self, image_bytes: &[u8]) -> Result<InputTensor, PreprocessError> {
        self.config.validate()?;

        // 1. Decode (dimensions bounded before any pixel buffer exists)
        let img = decode_image(image_bytes, &self.config)?;
        let (orig_w, orig_h) = img.dimensions();

        // 2. Fix EXIF orientation
        let img = self.orientation.correct(image_bytes, img);

        // 3. Gray-world balance on RGB
        let balanced = self.balancer.balance(img.to_rgb8());

        // 4. Resize shorter side
        let resized = resize_short_side(&balanced, self.config.resize_short_side)?;

        // 5. Center crop
        let cropped = center_crop(&resized, self.config.crop_size);

        // 6. Standardize
        let tensor = to_input_tensor(&cropped, &self.config)?;

        debug!(
            original = format!("{orig_w}x{orig_h}"),
            resized = format!("{}x{}", resized.width(), resized.height()),
            shape = ?tensor.shape(),
            "Image preprocessed for classifier"
        );

        Ok(tensor)
    }
}

// ═══════════════════════════════════════════════════════════
// Production implementations
// ═══════════════════════════════════════════════════════════

// ── ExifOrientationCorrector ──────────────────────────────

/// Reads EXIF tag 0x0112 (Orientation) via `kamadak-exif` and applies it.
///
/// EXIF orientation values:
/// 1 = Normal, 2 = Mirrored, 3 = 180deg, 4 = Flipped V,
/// 5 = Mirrored + 90deg CW, 6 = 90deg CW, 7 = Mirrored + 270deg CW, 8 = 270deg CW
pub struct ExifOrientationCorrector;

impl OrientationCorrector for ExifOrientationCorrector {
    fn correct(&self, raw_bytes: &[u8], image: DynamicImage) -> DynamicImage {
        let orientation = read_exif_orientation(raw_bytes);
        if orientation != 1 {
            debug!(orientation, "Applying EXIF orientation");
        }
        apply_orientation(image, orientation)
    }
}

/// Read EXIF orientation tag from raw image bytes.
/// Returns 1 (normal) if no EXIF data or tag not present.
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(r) => r,
        Err(_) => return 1,
    };

    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

/// Apply EXIF orientation transform to a `DynamicImage`.
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        1 => img,
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Returns the image unchanged.
pub struct NoOpOrientationCorrector;

impl OrientationCorrector for NoOpOrientationCorrector {
    fn correct(&self, _raw_bytes: &[u8], image: DynamicImage) -> DynamicImage {
        image
    }
}

// ── GrayWorldBalancer ─────────────────────────────────────

/// Gray-world color constancy: assumes the scene averages to gray.
pub struct GrayWorldBalancer;

impl ColorBalancer for GrayWorldBalancer {
    fn balance(&self, image: RgbImage) -> RgbImage {
        gray_world(image)
    }
}

/// Returns the image unchanged.
pub struct NoOpBalancer;

impl ColorBalancer for NoOpBalancer {
    fn balance(&self, image: RgbImage) -> RgbImage {
        image
    }
}

// ═══════════════════════════════════════════════════════════
// Pure helper functions
// ═══════════════════════════════════════════════════════════

/// Decode raw upload bytes. Every failure is a `Decode` error.
///
/// The header is read first and the image is rejected if its dimensions
/// fall outside `config`'s input bounds, so oversized or extremely thin
/// images never allocate a pixel buffer.
pub fn decode_image(
    bytes: &[u8],
    config: &PreprocessConfig,
) -> Result<DynamicImage, PreprocessError> {
    if bytes.is_empty() {
        return Err(PreprocessError::Decode("Image data is empty".into()));
    }

    let reader = || {
        image::io::Reader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| PreprocessError::Decode(e.to_string()))
    };

    let (width, height) = reader()?
        .into_dimensions()
        .map_err(|e| PreprocessError::Decode(e.to_string()))?;
    check_input_dimensions(width, height, config)?;

    reader()?
        .decode()
        .map_err(|e| PreprocessError::Decode(e.to_string()))
}

/// Reject empty, oversized and extremely elongated images.
pub fn check_input_dimensions(
    width: u32,
    height: u32,
    config: &PreprocessConfig,
) -> Result<(), PreprocessError> {
    if width == 0 || height == 0 {
        return Err(PreprocessError::Decode(format!(
            "Image has no pixels ({width}x{height})"
        )));
    }
    if width > config.max_input_dimension || height > config.max_input_dimension {
        return Err(PreprocessError::Decode(format!(
            "Image is {width}x{height}, the limit is {0}x{0}",
            config.max_input_dimension
        )));
    }
    let (long, short) = (width.max(height), width.min(height));
    if long as u64 > short as u64 * config.max_aspect_ratio as u64 {
        return Err(PreprocessError::Decode(format!(
            "Image is {width}x{height}, aspect ratio exceeds {}:1",
            config.max_aspect_ratio
        )));
    }
    Ok(())
}

/// Scale each channel so its mean equals the mean of the three channel
/// means. Results are clipped to [0, 255] and truncated.
///
/// Gains and pixel products are computed in `f32`. A uniform image comes
/// out unchanged.
pub fn gray_world(mut image: RgbImage) -> RgbImage {
    let pixel_count = image.width() as f64 * image.height() as f64;
    if pixel_count == 0.0 {
        return image;
    }

    let mut sums = [0.0f64; 3];
    for pixel in image.pixels() {
        for (sum, value) in sums.iter_mut().zip(pixel.0) {
            *sum += value as f64;
        }
    }

    let means = sums.map(|s| (s / pixel_count) as f32 + GRAY_WORLD_EPS);
    let target = (means[0] + means[1] + means[2]) / 3.0;
    let gains = means.map(|m| target / m);

    for pixel in image.pixels_mut() {
        for (value, gain) in pixel.0.iter_mut().zip(gains) {
            *value = (*value as f32 * gain).clamp(0.0, 255.0) as u8;
        }
    }

    image
}

/// Output size for a short-side resize: the shorter side becomes
/// `short_side`, the longer one `floor(short_side * long / short)`.
///
/// Fails with `Decode` when the long side does not fit in a `u32`.
pub fn compute_resize_dimensions(
    width: u32,
    height: u32,
    short_side: u32,
) -> Result<(u32, u32), PreprocessError> {
    if width == 0 || height == 0 {
        return Ok((short_side.max(1), short_side.max(1)));
    }

    let scaled = |long: u32, short: u32| -> Result<u32, PreprocessError> {
        let target = (short_side as u64 * long as u64) / short as u64;
        u32::try_from(target.max(1)).map_err(|_| {
            PreprocessError::Decode(format!(
                "Image {width}x{height} cannot be resized to short side {short_side}"
            ))
        })
    };

    if width <= height {
        Ok((short_side, scaled(height, width)?))
    } else {
        Ok((scaled(width, height)?, short_side))
    }
}

/// Bilinear resize so the shorter side equals `short_side`.
/// Borrows the input when it already has that short side.
pub fn resize_short_side(
    img: &RgbImage,
    short_side: u32,
) -> Result<Cow<'_, RgbImage>, PreprocessError> {
    let (w, h) = img.dimensions();
    if w.min(h) == short_side {
        return Ok(Cow::Borrowed(img));
    }

    let (new_w, new_h) = compute_resize_dimensions(w, h, short_side)?;
    Ok(Cow::Owned(image::imageops::resize(
        img,
        new_w,
        new_h,
        FilterType::Triangle,
    )))
}

/// Offset of a centered window of length `crop` inside `dim`.
/// Halves are rounded to even.
pub fn crop_offset(dim: u32, crop: u32) -> u32 {
    (dim.saturating_sub(crop) as f64 / 2.0).round_ties_even() as u32
}

/// Square center crop. Callers guarantee both sides are at least `size`.
pub fn center_crop(img: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let left = crop_offset(w, size);
    let top = crop_offset(h, size);
    image::imageops::crop_imm(img, left, top, size.min(w), size.min(h)).to_image()
}

/// Convert an RGB image to a standardized `1 x 3 x H x W` tensor:
/// `(value / 255 - mean) / std` per channel.
pub fn to_input_tensor(
    img: &RgbImage,
    config: &PreprocessConfig,
) -> Result<InputTensor, PreprocessError> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(PreprocessError::Tensor(format!("empty image {w}x{h}")));
    }

    let alpha: [f32; 3] = std::array::from_fn(|c| 1.0 / (255.0 * config.std[c]));
    let beta: [f32; 3] = std::array::from_fn(|c| -config.mean[c] / config.std[c]);

    let array = Array4::from_shape_fn((1, 3, h as usize, w as usize), |(_, c, y, x)| {
        img.get_pixel(x as u32, y as u32).0[c] as f32 * alpha[c] + beta[c]
    });

    Ok(InputTensor(array))
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
