//! Asset files for the spokk framework.
//!
//! This crate provides:
//! - The binary mesh file format consumed by the renderer
//! - Texture decoding to tightly packed RGBA8 texels
//! - The asset manifest and its timestamp-based staleness checks

pub mod error;
pub mod manifest;
pub mod mesh;
pub mod texture;

pub use error::{AssetError, Result};
pub use manifest::{
    is_output_out_of_date, AssetClass, AssetEntry, Manifest, ManifestDefaults, ShaderStage,
};
pub use mesh::{
    index_width_for, standard_vertex_layout, MeshFile, MeshFileHeader, VertexAttribute,
    VertexBufferBinding, MESH_FILE_MAGIC_NUMBER,
};
pub use texture::TextureData;
