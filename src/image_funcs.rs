// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Helpers for getting raw detector frames into and out of
//! [crate::Gray32FImage] buffers. TIFF files go through the `tiff` crate so
//! 32-bit float samples survive untouched; everything else is decoded with
//! the `image` crate, keeping raw integer sample values (no rescaling).

use std::fs::File;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use image::DynamicImage;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};

use crate::Gray32FImage;

/// Loads `path` as a grayscale f32 image.
pub fn load_image(path: &Path) -> Result<Gray32FImage> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match extension.as_str() {
        "tif" | "tiff" => load_tiff(path),
        _ => load_with_image_crate(path),
    }
}

fn load_tiff(path: &Path) -> Result<Gray32FImage> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut decoder = Decoder::new(file)?;
    match decoder.colortype()? {
        tiff::ColorType::Gray(_) => (),
        other => bail!("Unsupported TIFF color type: {:?}", other),
    }
    let (width, height) = decoder.dimensions()?;
    let samples: Vec<f32> = match decoder.read_image()? {
        DecodingResult::U8(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U32(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I16(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I32(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::F32(buf) => buf,
        DecodingResult::F64(buf) => buf.into_iter().map(|v| v as f32).collect(),
        _ => bail!("Unsupported TIFF sample format in {}", path.display()),
    };
    Gray32FImage::from_raw(width, height, samples).ok_or_else(|| {
        anyhow!("TIFF sample count does not match {}x{}", width, height)
    })
}

fn load_with_image_crate(path: &Path) -> Result<Gray32FImage> {
    let img = image::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let gray = match img {
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) =>
            img.to_luma32f(),
        DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_) | DynamicImage::ImageRgba16(_) => {
            let luma = img.to_luma16();
            let (width, height) = luma.dimensions();
            let samples = luma.into_raw().into_iter().map(|v| v as f32).collect();
            Gray32FImage::from_raw(width, height, samples).unwrap()
        }
        _ => {
            let luma = img.to_luma8();
            let (width, height) = luma.dimensions();
            let samples = luma.into_raw().into_iter().map(|v| v as f32).collect();
            Gray32FImage::from_raw(width, height, samples).unwrap()
        }
    };
    Ok(gray)
}

/// Writes `image` to `path` as a grayscale 32-bit float TIFF.
pub fn save_image(image: &Gray32FImage, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut encoder = TiffEncoder::new(file)?;
    let out = encoder
        .new_image::<colortype::Gray32Float>(image.width(), image.height())?;
    out.write_data(image.as_raw())?;
    Ok(())
}
