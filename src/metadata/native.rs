//! Backend-native metadata, one variant per format.
//!
//! Values are kept as the file stores them (units, colour encodings, raw
//! header fields). Conversion to canonical form happens only in
//! [`super::normalize`].

use serde_json::Value;

use super::SceneInfo;
use crate::format::BackendTag;

/// Which TIFF dialect the description tag revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiffFlavor {
    Ome,
    ImageJ,
    Plain,
}

/// A channel as described natively.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeChannel {
    pub name: Option<String>,

    /// Colour in the format's own encoding (OME signed RGBA integer,
    /// CZI `#AARRGGBB`, LIF LUT name)
    pub color: Option<String>,

    /// Emission wavelength with its unit symbol
    pub emission_wavelength: Option<(f64, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TiffNative {
    pub flavor: TiffFlavor,
    pub scenes: Vec<SceneInfo>,
    pub acquisition_date: Option<String>,

    /// OME `PhysicalSize{Z,Y,X}` with unit symbols
    pub ome_physical_sizes: [Option<(f64, String)>; 3],

    /// XResolution / YResolution in pixels per `resolution_unit`
    pub x_resolution: Option<f64>,
    pub y_resolution: Option<f64>,
    pub resolution_unit: u16,

    /// ImageJ `spacing=` and `unit=` header entries
    pub imagej_spacing: Option<f64>,
    pub imagej_unit: Option<String>,

    pub channels: Vec<NativeChannel>,

    /// Raw ImageDescription of page 0
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CziNative {
    pub scenes: Vec<SceneInfo>,

    /// `Scaling/Items/Distance` values for Z, Y, X in metres
    pub scaling_m: [Option<f64>; 3],
    pub channels: Vec<NativeChannel>,
    pub acquisition_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifNative {
    pub scenes: Vec<SceneInfo>,

    /// Per-axis (Z, Y, X) `Length` with its unit and the element count
    pub lengths: [Option<(f64, String, usize)>; 3],
    pub channels: Vec<NativeChannel>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Nd2Native {
    pub scenes: Vec<SceneInfo>,

    /// `dCalibration` (µm per pixel in X and Y)
    pub calibration_um: Option<f64>,

    /// Z loop step in µm
    pub z_step_um: Option<f64>,
    pub channels: Vec<NativeChannel>,
    pub acquisition_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DvNative {
    pub scenes: Vec<SceneInfo>,

    /// Header `dx, dy, dz` in µm (0 = unknown)
    pub dx: f32,
    pub dy: f32,
    pub dz: f32,

    /// `wave1..wave5` in nm (0 = unused)
    pub waves: [i16; 5],
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeNative {
    pub scenes: Vec<SceneInfo>,

    /// Metadata object returned by the bridge for the current scene
    pub document: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenericNative {
    pub scenes: Vec<SceneInfo>,
    pub color_type: String,
}

/// Tagged union of native descriptions.
///
/// The normalizer derives canonical metadata from it; callers that need the
/// file's own fields read it through `ImageSource::native_metadata`.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeMetadata {
    Tiff(TiffNative),
    Czi(CziNative),
    Lif(LifNative),
    Nd2(Nd2Native),
    Dv(DvNative),
    Bridge(BridgeNative),
    Generic(GenericNative),
}

impl NativeMetadata {
    pub fn tag(&self) -> BackendTag {
        match self {
            NativeMetadata::Tiff(_) => BackendTag::Tiff,
            NativeMetadata::Czi(_) => BackendTag::Czi,
            NativeMetadata::Lif(_) => BackendTag::Lif,
            NativeMetadata::Nd2(_) => BackendTag::Nd2,
            NativeMetadata::Dv(_) => BackendTag::Dv,
            NativeMetadata::Bridge(_) => BackendTag::Bridge,
            NativeMetadata::Generic(_) => BackendTag::Generic,
        }
    }

    pub fn scenes(&self) -> &[SceneInfo] {
        match self {
            NativeMetadata::Tiff(m) => &m.scenes,
            NativeMetadata::Czi(m) => &m.scenes,
            NativeMetadata::Lif(m) => &m.scenes,
            NativeMetadata::Nd2(m) => &m.scenes,
            NativeMetadata::Dv(m) => &m.scenes,
            NativeMetadata::Bridge(m) => &m.scenes,
            NativeMetadata::Generic(m) => &m.scenes,
        }
    }

    /// Free text the file stores about itself: the TIFF ImageDescription
    /// (OME-XML, ImageJ header or plain text) or the DV header titles.
    pub fn description(&self) -> Option<&str> {
        match self {
            NativeMetadata::Tiff(m) => m.description.as_deref(),
            NativeMetadata::Dv(m) => m.title.as_deref(),
            _ => None,
        }
    }
}

/// Scene list with generated names, for formats without their own.
pub(crate) fn numbered_scenes(count: usize) -> Vec<SceneInfo> {
    (0..count)
        .map(|index| SceneInfo {
            index,
            id: Some(format!("Image:{}", index)),
            name: None,
        })
        .collect()
}
