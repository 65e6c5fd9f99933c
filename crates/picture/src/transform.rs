// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resizing and re-encoding

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageError, ImageReader, Limits};

use crate::format::ImageFormat;

/// AVIF encoder speed (1 slowest to 10 fastest); transforms happen on request.
const AVIF_SPEED: u8 = 8;

/// Upper bound on bytes per decoded pixel (RGBA with 32-bit float channels).
const MAX_BYTES_PER_PIXEL: u64 = 16;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("could not decode source image: {0}")]
    Decode(#[source] ImageError),
    #[error("could not encode {format} image: {source}")]
    Encode {
        format: ImageFormat,
        source: ImageError,
    },
    #[error("could not encode webp image: {0}")]
    Webp(String),
    #[error("{width}x{height} image exceeds the limit of {max_pixels} pixels")]
    TooLarge {
        width: u32,
        height: u32,
        max_pixels: u64,
    },
    #[error("transform task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Decodes `source`, scales it to `width` (keeping its aspect ratio) and encodes it
/// as `format`.
///
/// `quality` (0 to 100) applies to the lossy encoders: JPEG, WebP and AVIF. PNG is
/// lossless. Neither the source nor the scaled image may hold more than `max_pixels`
/// pixels; larger ones are refused before any buffer for them is allocated.
pub fn transform(
    source: &[u8],
    width: Option<u32>,
    format: ImageFormat,
    quality: u8,
    max_pixels: u64,
) -> Result<Vec<u8>, TransformError> {
    let image = decode_source(source, max_pixels)?;
    check_pixels(image.width(), image.height(), max_pixels)?;
    let image = match width {
        Some(width) if width != image.width() => {
            let height = scaled_height(image.width(), image.height(), width);
            check_pixels(width, height, max_pixels)?;
            image.resize_exact(width, height, FilterType::Lanczos3)
        }
        _ => image,
    };
    encode(&image, format, quality)
}

/// [`transform`] on tokio's blocking thread pool.
pub async fn transform_blocking(
    source: Bytes,
    width: Option<u32>,
    format: ImageFormat,
    quality: u8,
    max_pixels: u64,
) -> Result<Bytes, TransformError> {
    let encoded = tokio::task::spawn_blocking(move || {
        transform(&source, width, format, quality, max_pixels)
    })
    .await??;
    Ok(encoded.into())
}

fn decode_source(source: &[u8], max_pixels: u64) -> Result<DynamicImage, TransformError> {
    let mut reader = ImageReader::new(Cursor::new(source))
        .with_guessed_format()
        .map_err(|err| TransformError::Decode(ImageError::IoError(err)))?;
    let mut limits = Limits::default();
    limits.max_alloc = Some(max_pixels.saturating_mul(MAX_BYTES_PER_PIXEL));
    reader.limits(limits);
    reader.decode().map_err(TransformError::Decode)
}

fn check_pixels(width: u32, height: u32, max_pixels: u64) -> Result<(), TransformError> {
    if u64::from(width) * u64::from(height) > max_pixels {
        return Err(TransformError::TooLarge {
            width,
            height,
            max_pixels,
        });
    }
    Ok(())
}

fn scaled_height(source_width: u32, source_height: u32, width: u32) -> u32 {
    let (w, h) = (u64::from(source_width.max(1)), u64::from(source_height));
    ((h * u64::from(width) + w / 2) / w).clamp(1, u64::from(u32::MAX)) as u32
}

fn encode(
    image: &DynamicImage,
    format: ImageFormat,
    quality: u8,
) -> Result<Vec<u8>, TransformError> {
    let encode_error = |source| TransformError::Encode { format, source };
    // The lossy encoders reject a quality of 0.
    let quality = quality.clamp(1, 100);
    let mut out = Vec::new();
    match format {
        ImageFormat::Png => {
            if matches!(image.color(), ColorType::Rgb32F | ColorType::Rgba32F) {
                DynamicImage::ImageRgba16(image.to_rgba16())
                    .write_with_encoder(PngEncoder::new(&mut out))
                    .map_err(encode_error)?;
            } else {
                image
                    .write_with_encoder(PngEncoder::new(&mut out))
                    .map_err(encode_error)?;
            }
        }
        ImageFormat::Jpeg => {
            DynamicImage::ImageRgb8(image.to_rgb8())
                .write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))
                .map_err(encode_error)?;
        }
        ImageFormat::Webp => {
            let rgba = image.to_rgba8();
            let encoded = webp::Encoder::from_rgba(&rgba, rgba.width(), rgba.height())
                .encode_simple(false, f32::from(quality))
                .map_err(|err| TransformError::Webp(format!("{err:?}")))?;
            out.extend_from_slice(&encoded);
        }
        ImageFormat::Avif => {
            DynamicImage::ImageRgba8(image.to_rgba8())
                .write_with_encoder(AvifEncoder::new_with_speed_quality(
                    &mut out, AVIF_SPEED, quality,
                ))
                .map_err(encode_error)?;
        }
    }
    Ok(out)
}
