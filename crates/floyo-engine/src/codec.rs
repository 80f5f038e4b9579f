//! Conversions between host image tensors, encoded files and base64 strings.
//!
//! Tensors are `f32` in `[0, 1]`, laid out `[batch, height, width, channels]`
//! (rank 3 tensors are treated as a single image).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use floyo_contracts::request::OutputFormat;
use floyo_contracts::{Flux2Error, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use ndarray::{Array4, ArrayViewD, Axis, Ix3};
use tracing::warn;

use crate::client::JobTransport;

pub const JPEG_QUALITY: u8 = 95;
/// Edge length of the black image returned when a result cannot be fetched.
pub const PLACEHOLDER_SIZE: usize = 512;

/// First image of a rank 3 or rank 4 tensor as an 8-bit image.
pub fn tensor_to_image(tensor: ArrayViewD<'_, f32>) -> Result<DynamicImage> {
    let image = match tensor.ndim() {
        4 => {
            if tensor.shape()[0] == 0 {
                return Err(Flux2Error::Validation("image batch is empty".to_string()));
            }
            tensor.index_axis_move(Axis(0), 0)
        }
        3 => tensor,
        rank => {
            return Err(Flux2Error::Validation(format!(
                "expected an image tensor of rank 3 or 4 (got rank {rank})"
            )))
        }
    };
    let image = image
        .into_dimensionality::<Ix3>()
        .map_err(|err| Flux2Error::Validation(format!("invalid image tensor: {err}")))?;
    let (height, width, channels) = image.dim();
    if height == 0 || width == 0 {
        return Err(Flux2Error::Validation(format!(
            "image tensor has no pixels ({height}x{width})"
        )));
    }

    let pixels: Vec<u8> = image.iter().copied().map(to_u8).collect();
    let (width, height) = (dimension(width)?, dimension(height)?);
    let built = match channels {
        1 => GrayImage::from_raw(width, height, pixels)
            .map(|gray| DynamicImage::ImageRgb8(DynamicImage::ImageLuma8(gray).to_rgb8())),
        3 => RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgba8),
        other => {
            return Err(Flux2Error::Validation(format!(
                "unsupported channel count {other}; expected 1, 3 or 4"
            )))
        }
    };
    built.ok_or_else(|| Flux2Error::Codec("pixel buffer does not match image size".to_string()))
}

pub fn encode_image(image: &DynamicImage, format: OutputFormat) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    match format {
        OutputFormat::Png => image
            .write_with_encoder(PngEncoder::new(&mut bytes))
            .map_err(|err| Flux2Error::Codec(format!("failed to encode PNG: {err}")))?,
        OutputFormat::Jpeg => {
            let rgb = image.to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
            encoder
                .encode_image(&rgb)
                .map_err(|err| Flux2Error::Codec(format!("failed to encode JPEG: {err}")))?;
        }
    }
    Ok(bytes)
}

/// Encodes the first image of `tensor` and returns it as standard base64.
pub fn tensor_to_base64(tensor: ArrayViewD<'_, f32>, format: OutputFormat) -> Result<String> {
    let image = tensor_to_image(tensor)?;
    Ok(BASE64.encode(encode_image(&image, format)?))
}

/// RGB tensor of shape `[1, height, width, 3]`.
pub fn image_to_tensor(image: &DynamicImage) -> Result<Array4<f32>> {
    let rgb = image.to_rgb8();
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    let values = rgb
        .into_raw()
        .into_iter()
        .map(|value| f32::from(value) / 255.0)
        .collect();
    Array4::from_shape_vec((1, height, width, 3), values)
        .map_err(|err| Flux2Error::Codec(format!("failed to build image tensor: {err}")))
}

pub fn decode_image_tensor(bytes: &[u8]) -> Result<Array4<f32>> {
    let image = image::load_from_memory(bytes)
        .map_err(|err| Flux2Error::Codec(format!("failed to decode image: {err}")))?;
    image_to_tensor(&image)
}

pub fn fetch_image_tensor(transport: &dyn JobTransport, url: &str) -> Result<Array4<f32>> {
    let url = url.trim();
    if url.is_empty() {
        return Err(Flux2Error::Validation("image URL is empty".to_string()));
    }
    decode_image_tensor(&transport.get_bytes(url)?)
}

/// Like [`fetch_image_tensor`], but any failure yields [`blank_image_tensor`].
pub fn url_to_tensor_or_blank(transport: &dyn JobTransport, url: &str) -> Array4<f32> {
    match fetch_image_tensor(transport, url) {
        Ok(tensor) => tensor,
        Err(err) => {
            warn!(url = %url, error = %err, "could not load result image; using placeholder");
            blank_image_tensor()
        }
    }
}

pub fn blank_image_tensor() -> Array4<f32> {
    Array4::zeros((1, PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, 3))
}

fn to_u8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0) as u8
}

fn dimension(value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Flux2Error::Validation(format!("image dimension {value} is too large")))
}
