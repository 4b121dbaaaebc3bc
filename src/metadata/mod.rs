//! Canonical, format-independent image metadata.
//!
//! Every backend's native description is converted into one [`Metadata`]
//! record whose dimensions are always in `TCZYX` order.

mod native;
mod normalize;

use serde::{Deserialize, Serialize};

pub use native::{
    BridgeNative, CziNative, DvNative, GenericNative, LifNative, NativeChannel, NativeMetadata,
    Nd2Native, TiffFlavor, TiffNative,
};
pub use normalize::{normalize, AxisMapping};

pub(crate) use native::numbered_scenes;
pub(crate) use normalize::to_micrometres;

use crate::format::BackendTag;

/// The canonical dimension order.
pub const DIMENSION_ORDER: &str = "TCZYX";

/// Sample data type of one pixel component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    Uint8,
    Uint16,
    Uint32,
    Int8,
    Int16,
    Int32,
    Float32,
    Float64,
}

impl PixelType {
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            PixelType::Uint8 | PixelType::Int8 => 1,
            PixelType::Uint16 | PixelType::Int16 => 2,
            PixelType::Uint32 | PixelType::Int32 | PixelType::Float32 => 4,
            PixelType::Float64 => 8,
        }
    }

    /// OME `Pixels/@Type` name.
    pub const fn ome_name(self) -> &'static str {
        match self {
            PixelType::Uint8 => "uint8",
            PixelType::Uint16 => "uint16",
            PixelType::Uint32 => "uint32",
            PixelType::Int8 => "int8",
            PixelType::Int16 => "int16",
            PixelType::Int32 => "int32",
            PixelType::Float32 => "float",
            PixelType::Float64 => "double",
        }
    }

    pub fn from_ome_name(name: &str) -> Option<Self> {
        match name {
            "uint8" => Some(PixelType::Uint8),
            "uint16" => Some(PixelType::Uint16),
            "uint32" => Some(PixelType::Uint32),
            "int8" => Some(PixelType::Int8),
            "int16" => Some(PixelType::Int16),
            "int32" => Some(PixelType::Int32),
            "float" => Some(PixelType::Float32),
            "double" => Some(PixelType::Float64),
            _ => None,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, PixelType::Float32 | PixelType::Float64)
    }

    pub const fn is_signed(self) -> bool {
        matches!(self, PixelType::Int8 | PixelType::Int16 | PixelType::Int32)
    }
}

impl std::fmt::Display for PixelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ome_name())
    }
}

/// One of the five canonical axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    T,
    C,
    Z,
    Y,
    X,
}

impl Axis {
    pub const ALL: [Axis; 5] = [Axis::T, Axis::C, Axis::Z, Axis::Y, Axis::X];

    pub const fn index(self) -> usize {
        match self {
            Axis::T => 0,
            Axis::C => 1,
            Axis::Z => 2,
            Axis::Y => 3,
            Axis::X => 4,
        }
    }

    pub const fn letter(self) -> char {
        match self {
            Axis::T => 'T',
            Axis::C => 'C',
            Axis::Z => 'Z',
            Axis::Y => 'Y',
            Axis::X => 'X',
        }
    }
}

/// Canonical sizes; absent axes have size 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub t: usize,
    pub c: usize,
    pub z: usize,
    pub y: usize,
    pub x: usize,
}

impl Dimensions {
    pub const fn new(t: usize, c: usize, z: usize, y: usize, x: usize) -> Self {
        Self { t, c, z, y, x }
    }

    pub const fn shape(&self) -> [usize; 5] {
        [self.t, self.c, self.z, self.y, self.x]
    }

    pub fn get(&self, axis: Axis) -> usize {
        self.shape()[axis.index()]
    }

    pub fn order(&self) -> &'static str {
        DIMENSION_ORDER
    }

    /// Number of (t, c, z) planes.
    pub fn plane_count(&self) -> usize {
        self.t * self.c * self.z
    }

    pub fn is_empty(&self) -> bool {
        self.shape().iter().any(|&n| n == 0)
    }
}

/// Physical voxel size in micrometres. `None` means unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhysicalPixelSizes {
    pub z: Option<f64>,
    pub y: Option<f64>,
    pub x: Option<f64>,
}

impl PhysicalPixelSizes {
    /// Build from raw values, dropping zero, negative and non-finite ones.
    pub fn from_raw(z: Option<f64>, y: Option<f64>, x: Option<f64>) -> Self {
        let keep = |v: Option<f64>| v.filter(|v| v.is_finite() && *v > 0.0);
        Self {
            z: keep(z),
            y: keep(y),
            x: keep(x),
        }
    }
}

/// Per-channel description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub name: Option<String>,

    /// Display colour as packed RGBA
    pub color: Option<u32>,

    /// Emission wavelength in nanometres
    pub emission_wavelength: Option<f64>,
}

/// One independently addressable acquisition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneInfo {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
}

/// Normalized metadata for the current scene of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub dims: Dimensions,
    pub dtype: PixelType,
    pub physical_pixel_sizes: PhysicalPixelSizes,

    /// Always exactly `dims.c` entries
    pub channels: Vec<Channel>,
    pub acquisition_time: Option<String>,
    pub scenes: Vec<SceneInfo>,
    pub format: BackendTag,
    pub current_scene: usize,
}

impl Metadata {
    pub fn dimension_order(&self) -> &'static str {
        DIMENSION_ORDER
    }

    pub fn scene_name(&self) -> Option<&str> {
        self.scenes
            .get(self.current_scene)
            .and_then(|s| s.name.as_deref())
    }
}
