//! Error types for asset files.

use thiserror::Error;

/// Errors from reading or writing asset files.
#[derive(Error, Debug)]
pub enum AssetError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Texture file could not be decoded or encoded
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Texel data does not match the stated dimensions
    #[error("Invalid texture: {0}")]
    InvalidTexture(String),

    /// Manifest is not valid JSON or does not match the expected shape
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File does not start with the mesh magic number
    #[error("Bad magic number: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    /// File ended before all declared data was read
    #[error("Truncated file: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Header fields are inconsistent
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Mesh contents cannot be encoded
    #[error("Invalid mesh: {0}")]
    InvalidMesh(String),

    /// Manifest parsed but describes something unusable
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
}

/// Result type alias using [`AssetError`].
pub type Result<T> = std::result::Result<T, AssetError>;
