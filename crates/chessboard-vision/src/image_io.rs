use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};

use crate::{Error, Frame, PixelFormat, Result};

/// Decode an encoded image (JPEG, PNG, BMP, ...).
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| Error::Decode(e.to_string()))?;
    Ok(reader.decode()?)
}

/// Decode a base64 image string, with or without a `data:...;base64,` prefix.
pub fn decode_base64_image(encoded: &str) -> Result<RgbImage> {
    let payload = match encoded.split_once(',') {
        Some((_, rest)) => rest,
        None => encoded,
    };
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| Error::Decode(format!("invalid base64: {e}")))?;
    Ok(decode_image(&bytes)?.to_rgb8())
}

pub fn encode_base64_png(img: &DynamicImage) -> Result<String> {
    Ok(BASE64.encode(encode_png(img)?))
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

pub fn to_gray(img: &DynamicImage) -> GrayImage {
    img.to_luma8()
}

pub fn frame_to_image(frame: &Frame) -> Result<DynamicImage> {
    let size_err = || Error::Decode("frame buffer size mismatch".to_string());
    match frame.pixel_format {
        PixelFormat::Gray8 => GrayImage::from_raw(frame.width, frame.height, frame.data.clone())
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(size_err),
        PixelFormat::Rgb8 => RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(size_err),
        PixelFormat::Bgr8 => {
            let mut data = frame.data.clone();
            for px in data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            RgbImage::from_raw(frame.width, frame.height, data)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(size_err)
        }
    }
}
