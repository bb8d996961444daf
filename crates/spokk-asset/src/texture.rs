//! Texture files.
//!
//! Any format the `image` crate can decode is accepted and converted to
//! tightly packed 8-bit RGBA, which uploads as-is into an
//! `R8G8B8A8_UNORM` or `R8G8B8A8_SRGB` image.

use crate::error::{AssetError, Result};
use image::{ImageBuffer, Rgba, RgbaImage};
use std::path::Path;

/// Decoded RGBA8 texels, rows top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl TextureData {
    /// Bytes per texel.
    pub const TEXEL_SIZE: usize = 4;

    /// Wrap texels already in RGBA8 layout.
    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * Self::TEXEL_SIZE;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(AssetError::InvalidTexture(format!(
                "{width}x{height} texture needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Decode an encoded image held in memory.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_image(image::load_from_memory(bytes)?.into_rgba8()))
    }

    /// Decode an image file; the format is guessed from its contents and
    /// extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let texture = Self::from_image(image::open(path)?.into_rgba8());
        tracing::debug!(
            path = %path.display(),
            width = texture.width,
            height = texture.height,
            "Loaded texture"
        );
        Ok(texture)
    }

    /// Encode to a file; the format follows the extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let image: RgbaImage = ImageBuffer::<Rgba<u8>, _>::from_raw(
            self.width,
            self.height,
            self.pixels.clone(),
        )
        .ok_or_else(|| AssetError::InvalidTexture("texel buffer too small".to_string()))?;
        image.save(path)?;
        Ok(())
    }

    fn from_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            pixels: image.into_raw(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Texels, `width * height * 4` bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }
}
