//! Binary mesh files.
//!
//! A mesh file is a [`MeshFileHeader`], one [`VertexBufferBinding`] per
//! vertex buffer, one [`VertexAttribute`] per attribute, the raw vertex
//! bytes of each buffer in binding order, then the raw index bytes. Header
//! and descriptor fields are little-endian 32-bit words. Format, topology and
//! input-rate fields hold the raw Vulkan enum values.

use crate::error::{AssetError, Result};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::io::{Read, Write};
use std::mem::size_of;
use std::path::Path;

/// First word of every mesh file ("SPOK" in file byte order).
pub const MESH_FILE_MAGIC_NUMBER: u32 = 0x4B4F_5053;

/// `VK_FORMAT_R32G32_SFLOAT`
pub const FORMAT_R32G32_SFLOAT: u32 = 103;
/// `VK_FORMAT_R32G32B32_SFLOAT`
pub const FORMAT_R32G32B32_SFLOAT: u32 = 106;
/// `VK_PRIMITIVE_TOPOLOGY_TRIANGLE_LIST`
pub const TOPOLOGY_TRIANGLE_LIST: u32 = 3;
/// `VK_VERTEX_INPUT_RATE_VERTEX`
pub const INPUT_RATE_VERTEX: u32 = 0;

/// Attribute location the bounding box is computed from.
pub const POSITION_LOCATION: u32 = 0;

/// Fixed-size header at the start of a mesh file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct MeshFileHeader {
    pub magic_number: u32,
    pub vertex_buffer_count: u32,
    pub attribute_count: u32,
    /// 2 or 4
    pub bytes_per_index: u32,
    pub vertex_count: u32,
    pub index_count: u32,
    pub topology: u32,
    pub aabb_min: [f32; 3],
    pub aabb_max: [f32; 3],
}

/// Layout of one vertex buffer (`VkVertexInputBindingDescription`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct VertexBufferBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: u32,
}

/// One vertex attribute (`VkVertexInputAttributeDescription`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: u32,
    pub offset: u32,
}

/// Index width in bytes for a mesh with `vertex_count` vertices.
///
/// 16-bit indices address up to 0x10000 vertices.
#[inline]
pub const fn index_width_for(vertex_count: u32) -> u32 {
    if vertex_count <= 0x1_0000 {
        2
    } else {
        4
    }
}

/// Interleaved position, normal and texture coordinate in one buffer.
pub fn standard_vertex_layout() -> (Vec<VertexBufferBinding>, Vec<VertexAttribute>) {
    let binding = VertexBufferBinding {
        binding: 0,
        stride: 32,
        input_rate: INPUT_RATE_VERTEX,
    };
    let attribute = |location, format, offset| VertexAttribute {
        location,
        binding: 0,
        format,
        offset,
    };
    (
        vec![binding],
        vec![
            attribute(0, FORMAT_R32G32B32_SFLOAT, 0),
            attribute(1, FORMAT_R32G32B32_SFLOAT, 12),
            attribute(2, FORMAT_R32G32_SFLOAT, 24),
        ],
    )
}

/// A mesh ready to be written to or read from disk.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshFile {
    header: MeshFileHeader,
    bindings: Vec<VertexBufferBinding>,
    attributes: Vec<VertexAttribute>,
    vertices: Vec<u8>,
    indices: Vec<u8>,
}

impl MeshFile {
    /// Build a mesh from vertex bytes and indices.
    ///
    /// `vertices` holds each binding's buffer back to back, every buffer
    /// having the same vertex count. The index width is chosen from the
    /// vertex count, and the bounding box is taken from the
    /// `R32G32B32_SFLOAT` attribute at [`POSITION_LOCATION`], if any.
    pub fn new(
        bindings: Vec<VertexBufferBinding>,
        attributes: Vec<VertexAttribute>,
        vertices: Vec<u8>,
        indices: &[u32],
        topology: u32,
    ) -> Result<Self> {
        let total_stride = total_stride(&bindings)
            .ok_or_else(|| AssetError::InvalidMesh("vertex stride overflows".to_string()))?;
        if total_stride == 0 {
            return Err(AssetError::InvalidMesh(
                "mesh needs at least one vertex buffer with a non-zero stride".to_string(),
            ));
        }
        if vertices.len() % total_stride != 0 {
            return Err(AssetError::InvalidMesh(format!(
                "{} vertex bytes is not a multiple of the combined stride {total_stride}",
                vertices.len()
            )));
        }
        let vertex_count = u32::try_from(vertices.len() / total_stride)
            .map_err(|_| AssetError::InvalidMesh("too many vertices".to_string()))?;
        let index_count = u32::try_from(indices.len())
            .map_err(|_| AssetError::InvalidMesh("too many indices".to_string()))?;
        let vertex_buffer_count = u32::try_from(bindings.len())
            .map_err(|_| AssetError::InvalidMesh("too many vertex buffers".to_string()))?;
        let attribute_count = u32::try_from(attributes.len())
            .map_err(|_| AssetError::InvalidMesh("too many attributes".to_string()))?;
        check_attributes(&bindings, &attributes).map_err(AssetError::InvalidMesh)?;

        if let Some(bad) = indices.iter().find(|&&i| i >= vertex_count) {
            return Err(AssetError::InvalidMesh(format!(
                "index {bad} out of range for {vertex_count} vertices"
            )));
        }

        let bytes_per_index = index_width_for(vertex_count);
        let mut index_bytes = Vec::with_capacity(indices.len() * bytes_per_index as usize);
        for &index in indices {
            if bytes_per_index == 2 {
                // Range-checked above: vertex_count <= 0x10000.
                #[allow(clippy::cast_possible_truncation)]
                index_bytes.extend_from_slice(&(index as u16).to_le_bytes());
            } else {
                index_bytes.extend_from_slice(&index.to_le_bytes());
            }
        }

        let (aabb_min, aabb_max) =
            compute_aabb(&bindings, &attributes, &vertices, vertex_count as usize)?;

        Ok(Self {
            header: MeshFileHeader {
                magic_number: MESH_FILE_MAGIC_NUMBER,
                vertex_buffer_count,
                attribute_count,
                bytes_per_index,
                vertex_count,
                index_count,
                topology,
                aabb_min: aabb_min.to_array(),
                aabb_max: aabb_max.to_array(),
            },
            bindings,
            attributes,
            vertices,
            indices: index_bytes,
        })
    }

    pub fn header(&self) -> &MeshFileHeader {
        &self.header
    }

    pub fn bindings(&self) -> &[VertexBufferBinding] {
        &self.bindings
    }

    pub fn attributes(&self) -> &[VertexAttribute] {
        &self.attributes
    }

    pub fn vertex_count(&self) -> u32 {
        self.header.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.header.index_count
    }

    pub fn bytes_per_index(&self) -> u32 {
        self.header.bytes_per_index
    }

    pub fn topology(&self) -> u32 {
        self.header.topology
    }

    /// Bounding box as `(min, max)`.
    pub fn aabb(&self) -> (Vec3, Vec3) {
        (
            Vec3::from_array(self.header.aabb_min),
            Vec3::from_array(self.header.aabb_max),
        )
    }

    /// All vertex bytes, buffers in binding order.
    pub fn vertex_bytes(&self) -> &[u8] {
        &self.vertices
    }

    /// Vertex bytes of the `i`th vertex buffer.
    pub fn vertex_buffer(&self, i: usize) -> Option<&[u8]> {
        let count = self.header.vertex_count as usize;
        let start: usize = self.bindings.get(..i)?.iter().map(|b| b.stride as usize * count).sum();
        let len = self.bindings.get(i)?.stride as usize * count;
        self.vertices.get(start..start + len)
    }

    /// Raw index bytes, [`Self::bytes_per_index`] bytes each.
    pub fn index_bytes(&self) -> &[u8] {
        &self.indices
    }

    /// Indices widened to 32 bits.
    pub fn indices(&self) -> Vec<u32> {
        if self.header.bytes_per_index == 2 {
            self.indices
                .chunks_exact(2)
                .map(|c| u32::from(u16::from_le_bytes([c[0], c[1]])))
                .collect()
        } else {
            self.indices
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        }
    }

    /// Serialize to the on-disk layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            size_of::<MeshFileHeader>()
                + self.bindings.len() * size_of::<VertexBufferBinding>()
                + self.attributes.len() * size_of::<VertexAttribute>()
                + self.vertices.len()
                + self.indices.len(),
        );
        push_words(&mut out, std::slice::from_ref(&self.header));
        push_words(&mut out, &self.bindings);
        push_words(&mut out, &self.attributes);
        out.extend_from_slice(&self.vertices);
        out.extend_from_slice(&self.indices);
        out
    }

    /// Parse the on-disk layout. The input must contain exactly one mesh.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = WordReader::new(bytes);
        let header: MeshFileHeader = reader.read_one()?;
        if header.magic_number != MESH_FILE_MAGIC_NUMBER {
            return Err(AssetError::BadMagic {
                expected: MESH_FILE_MAGIC_NUMBER,
                found: header.magic_number,
            });
        }
        if header.bytes_per_index != 2 && header.bytes_per_index != 4 {
            return Err(AssetError::InvalidHeader(format!(
                "bytes per index must be 2 or 4, found {}",
                header.bytes_per_index
            )));
        }

        let bindings: Vec<VertexBufferBinding> =
            reader.read_many(header.vertex_buffer_count as usize)?;
        let attributes: Vec<VertexAttribute> = reader.read_many(header.attribute_count as usize)?;
        check_attributes(&bindings, &attributes).map_err(AssetError::InvalidHeader)?;

        let vertex_len = total_stride(&bindings)
            .and_then(|stride| stride.checked_mul(header.vertex_count as usize))
            .ok_or_else(|| AssetError::InvalidHeader("vertex data size overflows".to_string()))?;
        let vertices = reader.take(vertex_len)?.to_vec();

        let index_len = (header.index_count as usize)
            .checked_mul(header.bytes_per_index as usize)
            .ok_or_else(|| AssetError::InvalidHeader("index data size overflows".to_string()))?;
        let indices = reader.take(index_len)?.to_vec();

        let trailing = reader.remaining();
        if trailing != 0 {
            return Err(AssetError::InvalidHeader(format!(
                "{trailing} trailing bytes after index data"
            )));
        }

        Ok(Self {
            header,
            bindings,
            attributes,
            vertices,
            indices,
        })
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    /// Write the mesh to `path`, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_bytes())?;
        tracing::debug!(
            path = %path.display(),
            vertices = self.header.vertex_count,
            indices = self.header.index_count,
            "Wrote mesh"
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

fn total_stride(bindings: &[VertexBufferBinding]) -> Option<usize> {
    bindings
        .iter()
        .try_fold(0usize, |acc, b| acc.checked_add(b.stride as usize))
}

fn check_attributes(
    bindings: &[VertexBufferBinding],
    attributes: &[VertexAttribute],
) -> std::result::Result<(), String> {
    for attribute in attributes {
        if !bindings.iter().any(|b| b.binding == attribute.binding) {
            return Err(format!(
                "attribute at location {} refers to missing binding {}",
                attribute.location, attribute.binding
            ));
        }
    }
    Ok(())
}

fn compute_aabb(
    bindings: &[VertexBufferBinding],
    attributes: &[VertexAttribute],
    vertices: &[u8],
    vertex_count: usize,
) -> Result<(Vec3, Vec3)> {
    let Some(position) = attributes
        .iter()
        .find(|a| a.location == POSITION_LOCATION && a.format == FORMAT_R32G32B32_SFLOAT)
    else {
        return Ok((Vec3::ZERO, Vec3::ZERO));
    };
    if vertex_count == 0 {
        return Ok((Vec3::ZERO, Vec3::ZERO));
    }

    let mut buffer_start = 0usize;
    let mut binding = None;
    for b in bindings {
        if b.binding == position.binding {
            binding = Some(b);
            break;
        }
        buffer_start += b.stride as usize * vertex_count;
    }
    let binding = binding.ok_or_else(|| {
        AssetError::InvalidMesh(format!("missing binding {}", position.binding))
    })?;
    let stride = binding.stride as usize;
    if position.offset as usize + 12 > stride {
        return Err(AssetError::InvalidMesh(format!(
            "position at offset {} does not fit in stride {stride}",
            position.offset
        )));
    }

    let read_f32 = |at: usize| {
        f32::from_le_bytes([
            vertices[at],
            vertices[at + 1],
            vertices[at + 2],
            vertices[at + 3],
        ])
    };
    let mut min = Vec3::splat(f32::INFINITY);
    let mut max = Vec3::splat(f32::NEG_INFINITY);
    for v in 0..vertex_count {
        let at = buffer_start + v * stride + position.offset as usize;
        let p = Vec3::new(read_f32(at), read_f32(at + 4), read_f32(at + 8));
        min = min.min(p);
        max = max.max(p);
    }
    Ok((min, max))
}

fn push_words<T: Pod>(out: &mut Vec<u8>, values: &[T]) {
    for word in bytemuck::cast_slice::<T, u32>(values) {
        out.extend_from_slice(&word.to_le_bytes());
    }
}

struct WordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WordReader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(AssetError::Truncated {
                needed: self.pos.saturating_add(len),
                available: self.bytes.len(),
            })?;
        let bytes = self.bytes;
        let slice = &bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_many<T: Pod>(&mut self, count: usize) -> Result<Vec<T>> {
        let len = size_of::<T>()
            .checked_mul(count)
            .ok_or_else(|| AssetError::InvalidHeader("descriptor count overflows".to_string()))?;
        let words: Vec<u32> = self
            .take(len)?
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(bytemuck::cast_slice::<u32, T>(&words).to_vec())
    }

    fn read_one<T: Pod>(&mut self) -> Result<T> {
        let words = self.read_many::<T>(1)?;
        Ok(words[0])
    }
}
