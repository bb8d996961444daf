//! Asset manifests.
//!
//! A manifest is a JSON document listing source assets and where their
//! processed outputs live:
//!
//! ```json
//! {
//!   "defaults": { "output_root": "build", "shader_include_dirs": ["shaders/include"] },
//!   "assets": [
//!     { "class": "image", "input": "textures/brick.png", "output": "brick.png" },
//!     { "class": "shader", "input": "shaders/tri.vert", "output": "tri.vert.spv", "stage": "vert" }
//!   ]
//! }
//! ```
//!
//! Inputs, `output_root` and include directories are relative to the
//! manifest's directory; outputs are relative to `output_root`.

use crate::error::{AssetError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Pipeline stage of a shader asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Geometry,
    TessControl,
    TessEvaluation,
    Compute,
}

impl ShaderStage {
    /// Parse a stage name, accepting both short and long forms.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "vert" | "vertex" => Ok(Self::Vertex),
            "frag" | "fragment" => Ok(Self::Fragment),
            "geom" | "geometry" => Ok(Self::Geometry),
            "tesc" | "tesscontrol" => Ok(Self::TessControl),
            "tese" | "tesseval" => Ok(Self::TessEvaluation),
            "comp" | "compute" => Ok(Self::Compute),
            other => Err(AssetError::InvalidManifest(format!(
                "unrecognized shader stage '{other}'"
            ))),
        }
    }

    /// Stage implied by a conventional GLSL file extension.
    pub fn from_extension(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| Self::parse(ext).ok())
    }
}

/// What kind of processing an asset needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssetClass {
    /// Copied verbatim.
    Image,
    /// Converted to a [`crate::mesh::MeshFile`].
    Mesh,
    /// Compiled to SPIR-V. `stage` is `None` when it should be inferred.
    Shader {
        entry_point: String,
        stage: Option<ShaderStage>,
    },
}

/// One manifest entry with resolved paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetEntry {
    pub class: AssetClass,
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Manifest-wide settings with resolved paths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestDefaults {
    pub output_root: PathBuf,
    pub shader_include_dirs: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    assets: Vec<RawAsset>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize, Default)]
struct RawDefaults {
    output_root: Option<String>,
    #[serde(default)]
    shader_include_dirs: Vec<String>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RawAsset {
    class: String,
    input: String,
    output: String,
    entry: Option<String>,
    stage: Option<String>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_json::Value>,
}

fn warn_unknown(location: &str, unknown: &BTreeMap<String, serde_json::Value>) {
    for tag in unknown.keys() {
        tracing::warn!(location, tag = %tag, "Ignoring unexpected manifest tag");
    }
}

/// A parsed asset manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    modified: SystemTime,
    defaults: ManifestDefaults,
    assets: Vec<AssetEntry>,
}

impl Manifest {
    /// Read and parse the manifest at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let modified = fs::metadata(path)?.modified()?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let manifest = Self::parse(&text, dir, modified)?;
        tracing::info!(
            path = %path.display(),
            assets = manifest.assets.len(),
            "Loaded asset manifest"
        );
        Ok(manifest)
    }

    /// Parse manifest text as if it lived in `manifest_dir` and was last
    /// written at `modified`.
    pub fn parse(text: &str, manifest_dir: &Path, modified: SystemTime) -> Result<Self> {
        let raw: RawManifest = serde_json::from_str(text)?;
        warn_unknown("root", &raw.unknown);
        warn_unknown("defaults", &raw.defaults.unknown);

        let output_root = raw
            .defaults
            .output_root
            .map_or_else(|| manifest_dir.to_path_buf(), |root| manifest_dir.join(root));
        let shader_include_dirs = raw
            .defaults
            .shader_include_dirs
            .iter()
            .map(|dir| manifest_dir.join(dir))
            .collect();

        let mut assets = Vec::with_capacity(raw.assets.len());
        for (i, asset) in raw.assets.into_iter().enumerate() {
            warn_unknown(&format!("assets[{i}]"), &asset.unknown);
            let class = match asset.class.as_str() {
                "image" | "mesh" if asset.entry.is_some() || asset.stage.is_some() => {
                    return Err(AssetError::InvalidManifest(format!(
                        "assets[{i}]: only shader assets take 'entry' or 'stage'"
                    )));
                }
                "image" => AssetClass::Image,
                "mesh" => AssetClass::Mesh,
                "shader" => AssetClass::Shader {
                    entry_point: asset.entry.unwrap_or_else(|| "main".to_string()),
                    stage: asset.stage.as_deref().map(ShaderStage::parse).transpose()?,
                },
                other => {
                    return Err(AssetError::InvalidManifest(format!(
                        "assets[{i}]: unknown asset class '{other}'"
                    )));
                }
            };
            assets.push(AssetEntry {
                class,
                input: manifest_dir.join(&asset.input),
                output: output_root.join(&asset.output),
            });
        }

        Ok(Self {
            modified,
            defaults: ManifestDefaults {
                output_root,
                shader_include_dirs,
            },
            assets,
        })
    }

    pub fn defaults(&self) -> &ManifestDefaults {
        &self.defaults
    }

    pub fn assets(&self) -> &[AssetEntry] {
        &self.assets
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    /// Assets whose outputs need rebuilding.
    pub fn out_of_date_assets(&self) -> Result<Vec<&AssetEntry>> {
        let mut stale = Vec::new();
        for asset in &self.assets {
            if is_output_out_of_date(&asset.input, &asset.output, self.modified)? {
                stale.push(asset);
            }
        }
        Ok(stale)
    }

    /// Copy every out-of-date image asset to its output, creating output
    /// directories as needed. Returns the number of files copied.
    pub fn copy_out_of_date_images(&self) -> Result<usize> {
        let mut copied = 0;
        for asset in self.out_of_date_assets()? {
            if asset.class != AssetClass::Image {
                continue;
            }
            if let Some(parent) = asset.output.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&asset.input, &asset.output)?;
            tracing::info!(
                input = %asset.input.display(),
                output = %asset.output.display(),
                "Copied image asset"
            );
            copied += 1;
        }
        Ok(copied)
    }
}

/// Whether `output` must be rebuilt from `input`.
///
/// A missing input is an error. The output is stale when it is missing, or
/// was last written before either the input or the manifest.
pub fn is_output_out_of_date(
    input: &Path,
    output: &Path,
    manifest_modified: SystemTime,
) -> Result<bool> {
    let input_modified = match fs::metadata(input) {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AssetError::InvalidManifest(format!(
                "input file '{}' does not exist",
                input.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    let output_modified = match fs::metadata(output) {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    Ok(output_modified < input_modified || output_modified < manifest_modified)
}
