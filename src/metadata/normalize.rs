//! Conversion from native layouts and metadata to the canonical model.
//!
//! [`AxisMapping`] is the single place where canonical `(scene, t, c, z)`
//! coordinates are turned into a native plane index. Backends receive the
//! mapping with every chunk request and must not compute plane positions on
//! their own.

use tracing::debug;

use super::native::{
    BridgeNative, CziNative, DvNative, GenericNative, LifNative, NativeChannel, NativeMetadata,
    Nd2Native, TiffFlavor, TiffNative,
};
use super::{Channel, Dimensions, Metadata, PhysicalPixelSizes};
use crate::error::FormatError;
use crate::format::NativeLayout;

/// Plane axes a native order may contain.
const KNOWN_PLANE_AXES: [char; 4] = ['S', 'T', 'C', 'Z'];

/// Permutation from canonical coordinates to native plane positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisMapping {
    plane_axes: Vec<(char, usize)>,
    samples_as_channels: bool,
    dims: Dimensions,
}

impl AxisMapping {
    /// Validate a native layout and derive the mapping.
    pub fn from_layout(layout: &NativeLayout) -> Result<Self, FormatError> {
        let mut seen = Vec::with_capacity(layout.plane_axes.len());
        for &(axis, size) in &layout.plane_axes {
            if seen.contains(&axis) {
                return Err(FormatError::corrupt(format!(
                    "axis {} appears twice in native order {}",
                    axis,
                    layout.dimension_order()
                )));
            }
            seen.push(axis);

            if !KNOWN_PLANE_AXES.contains(&axis) && size > 1 {
                return Err(FormatError::corrupt(format!(
                    "unknown axis {} of size {} in native order {}",
                    axis,
                    size,
                    layout.dimension_order()
                )));
            }
        }

        let native_c = layout.axis_size('C');
        let samples = layout.samples_per_pixel.max(1);
        if samples > 1 && native_c > 1 {
            return Err(FormatError::unsupported_variant(format!(
                "{} interleaved samples combined with {} stored channels",
                samples, native_c
            )));
        }

        let samples_as_channels = samples > 1;
        let dims = Dimensions {
            t: layout.axis_size('T'),
            c: if samples_as_channels { samples } else { native_c },
            z: layout.axis_size('Z'),
            y: layout.size_y,
            x: layout.size_x,
        };

        Ok(Self {
            plane_axes: layout.plane_axes.clone(),
            samples_as_channels,
            dims,
        })
    }

    /// Row-major index of a plane over the native plane axes.
    ///
    /// When channels are interleaved samples, `c` does not select a plane.
    pub fn plane_index(&self, scene: usize, t: usize, c: usize, z: usize) -> usize {
        self.plane_axes.iter().fold(0, |index, &(axis, size)| {
            let coord = match axis {
                'S' => scene,
                'T' => t,
                'C' if !self.samples_as_channels => c,
                'Z' => z,
                _ => 0,
            };
            index * size + coord
        })
    }

    pub fn samples_as_channels(&self) -> bool {
        self.samples_as_channels
    }

    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    /// Number of native planes addressed by the mapping.
    pub fn plane_count(&self) -> usize {
        self.plane_axes.iter().map(|&(_, n)| n).product()
    }

    /// Channels carried by one chunk.
    pub fn channels_per_chunk(&self) -> usize {
        if self.samples_as_channels {
            self.dims.c
        } else {
            1
        }
    }
}

/// Produce canonical metadata and the axis mapping for one scene.
pub fn normalize(
    native: &NativeMetadata,
    layout: &NativeLayout,
) -> Result<(Metadata, AxisMapping), FormatError> {
    let mapping = AxisMapping::from_layout(layout)?;
    let dims = mapping.dims();

    let (physical_pixel_sizes, channels, acquisition_time) = match native {
        NativeMetadata::Tiff(m) => convert_tiff(m),
        NativeMetadata::Czi(m) => convert_czi(m),
        NativeMetadata::Lif(m) => convert_lif(m),
        NativeMetadata::Nd2(m) => convert_nd2(m),
        NativeMetadata::Dv(m) => convert_dv(m),
        NativeMetadata::Bridge(m) => convert_bridge(m),
        NativeMetadata::Generic(m) => convert_generic(m),
    };

    let channels = fit_channels(channels, dims.c);

    debug!(
        format = ?native.tag(),
        scene = layout.scene,
        native_order = %layout.dimension_order(),
        ?dims,
        "normalized scene"
    );

    let metadata = Metadata {
        dims,
        dtype: layout.dtype,
        physical_pixel_sizes,
        channels,
        acquisition_time,
        scenes: native.scenes().to_vec(),
        format: native.tag(),
        current_scene: layout.scene,
    };
    Ok((metadata, mapping))
}

type Converted = (PhysicalPixelSizes, Vec<Channel>, Option<String>);

fn fit_channels(mut channels: Vec<Channel>, count: usize) -> Vec<Channel> {
    channels.truncate(count);
    channels.resize_with(count, Channel::default);
    channels
}

// =============================================================================
// Units and colours
// =============================================================================

/// Convert a length to micrometres. Unknown units yield `None`.
pub(crate) fn to_micrometres(value: f64, unit: &str) -> Option<f64> {
    let factor = match unit.trim() {
        "" | "µm" | "um" | "micron" | "microns" | "\u{3bc}m" => 1.0,
        "m" => 1e6,
        "cm" => 1e4,
        "mm" => 1e3,
        "nm" => 1e-3,
        "Å" | "A" => 1e-4,
        "in" | "inch" => 25_400.0,
        _ => return None,
    };
    Some(value * factor)
}

fn wavelength_nm(value: &(f64, String)) -> Option<f64> {
    match value.1.trim() {
        "" | "nm" => Some(value.0),
        unit => to_micrometres(value.0, unit).map(|um| um * 1e3),
    }
}

/// OME stores colours as a signed 32-bit RGBA integer.
fn parse_ome_color(text: &str) -> Option<u32> {
    text.trim().parse::<i64>().ok().map(|v| v as i32 as u32)
}

/// CZI stores `#AARRGGBB` (or `#RRGGBB`).
fn parse_czi_color(text: &str) -> Option<u32> {
    let hex = text.trim().trim_start_matches('#');
    let value = u32::from_str_radix(hex, 16).ok()?;
    match hex.len() {
        8 => {
            let alpha = value >> 24;
            Some((value << 8) | alpha)
        }
        6 => Some((value << 8) | 0xFF),
        _ => None,
    }
}

fn parse_lut_name(text: &str) -> Option<u32> {
    let rgba = match text.trim().to_ascii_lowercase().as_str() {
        "red" => 0xFF0000FF,
        "green" => 0x00FF00FF,
        "blue" => 0x0000FFFF,
        "cyan" => 0x00FFFFFF,
        "magenta" => 0xFF00FFFF,
        "yellow" => 0xFFFF00FF,
        "gray" | "grey" | "white" => 0xFFFFFFFF,
        _ => return None,
    };
    Some(rgba)
}

fn convert_channels(channels: &[NativeChannel], color: fn(&str) -> Option<u32>) -> Vec<Channel> {
    channels
        .iter()
        .map(|ch| Channel {
            name: ch.name.clone().filter(|n| !n.is_empty()),
            color: ch.color.as_deref().and_then(color),
            emission_wavelength: ch.emission_wavelength.as_ref().and_then(wavelength_nm),
        })
        .collect()
}

// =============================================================================
// Per-format conversions
// =============================================================================

fn convert_tiff(m: &TiffNative) -> Converted {
    let sizes = match m.flavor {
        TiffFlavor::Ome => {
            let [z, y, x] = m
                .ome_physical_sizes
                .clone()
                .map(|v| v.and_then(|(value, unit)| to_micrometres(value, &unit)));
            PhysicalPixelSizes::from_raw(z, y, x)
        }
        // Without a calibrated unit ImageJ sizes are in pixels, not lengths.
        TiffFlavor::ImageJ => match m.imagej_unit.as_deref().map(str::trim) {
            None | Some("") | Some("pixel") | Some("pixels") => PhysicalPixelSizes::default(),
            Some(unit) => {
                let per_pixel = |res: Option<f64>| {
                    res.filter(|r| *r > 0.0)
                        .and_then(|r| to_micrometres(1.0 / r, unit))
                };
                PhysicalPixelSizes::from_raw(
                    m.imagej_spacing.and_then(|s| to_micrometres(s, unit)),
                    per_pixel(m.y_resolution),
                    per_pixel(m.x_resolution),
                )
            }
        },
        TiffFlavor::Plain => {
            let unit = match m.resolution_unit {
                2 => Some("inch"),
                3 => Some("cm"),
                _ => None,
            };
            let per_pixel = |res: Option<f64>| {
                let unit = unit?;
                res.filter(|r| *r > 0.0)
                    .and_then(|r| to_micrometres(1.0 / r, unit))
            };
            PhysicalPixelSizes::from_raw(None, per_pixel(m.y_resolution), per_pixel(m.x_resolution))
        }
    };

    (
        sizes,
        convert_channels(&m.channels, parse_ome_color),
        m.acquisition_date.clone(),
    )
}

fn convert_czi(m: &CziNative) -> Converted {
    let [z, y, x] = m.scaling_m.map(|v| v.map(|metres| metres * 1e6));
    (
        PhysicalPixelSizes::from_raw(z, y, x),
        convert_channels(&m.channels, parse_czi_color),
        m.acquisition_time.clone(),
    )
}

fn convert_lif(m: &LifNative) -> Converted {
    let [z, y, x] = m.lengths.clone().map(|v| {
        v.and_then(|(length, unit, count)| {
            if count < 2 {
                return None;
            }
            to_micrometres(length / (count - 1) as f64, &unit)
        })
    });
    (
        PhysicalPixelSizes::from_raw(z, y, x),
        convert_channels(&m.channels, parse_lut_name),
        None,
    )
}

fn convert_nd2(m: &Nd2Native) -> Converted {
    (
        PhysicalPixelSizes::from_raw(m.z_step_um, m.calibration_um, m.calibration_um),
        convert_channels(&m.channels, parse_ome_color),
        m.acquisition_time.clone(),
    )
}

fn convert_dv(m: &DvNative) -> Converted {
    let sizes = PhysicalPixelSizes::from_raw(
        Some(m.dz as f64),
        Some(m.dy as f64),
        Some(m.dx as f64),
    );
    let channels = m
        .waves
        .iter()
        .map(|&w| Channel {
            name: None,
            color: None,
            emission_wavelength: (w > 0).then_some(w as f64),
        })
        .collect();
    (sizes, channels, None)
}

fn convert_bridge(m: &BridgeNative) -> Converted {
    let doc = &m.document;
    let size = |axis: &str| doc["physical_pixel_sizes"][axis].as_f64();
    let sizes = PhysicalPixelSizes::from_raw(size("z"), size("y"), size("x"));

    let channels = doc["channels"]
        .as_array()
        .map(|list| {
            list.iter()
                .map(|ch| Channel {
                    name: ch["name"].as_str().map(str::to_string),
                    color: ch["color"].as_u64().and_then(|c| u32::try_from(c).ok()),
                    emission_wavelength: ch["emission_wavelength"].as_f64(),
                })
                .collect()
        })
        .unwrap_or_default();

    let acquisition_time = doc["acquisition_time"].as_str().map(str::to_string);
    (sizes, channels, acquisition_time)
}

fn convert_generic(m: &GenericNative) -> Converted {
    let names: &[&str] = match m.color_type.as_str() {
        "rgb" => &["Red", "Green", "Blue"],
        "rgba" => &["Red", "Green", "Blue", "Alpha"],
        "gray_alpha" => &["Gray", "Alpha"],
        _ => &[],
    };
    let channels = names
        .iter()
        .map(|n| Channel {
            name: Some(n.to_string()),
            ..Channel::default()
        })
        .collect();
    (PhysicalPixelSizes::default(), channels, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::native::numbered_scenes;
    use crate::metadata::PixelType;

    fn layout(plane_axes: &[(char, usize)], samples: usize) -> NativeLayout {
        NativeLayout {
            scene: 0,
            plane_axes: plane_axes.to_vec(),
            size_y: 4,
            size_x: 6,
            samples_per_pixel: samples,
            dtype: PixelType::Uint16,
            chunk_y: 4,
            chunk_x: 6,
        }
    }

    fn dv_native() -> NativeMetadata {
        NativeMetadata::Dv(DvNative {
            scenes: numbered_scenes(1),
            dx: 0.1,
            dy: 0.1,
            dz: 0.0,
            waves: [520, 600, 0, 0, 0],
            title: None,
        })
    }

    #[test]
    fn test_plane_index_follows_native_order() {
        // Planes stored with Z fastest, then T, then C.
        let mapping = AxisMapping::from_layout(&layout(&[('C', 2), ('T', 3), ('Z', 4)], 1)).unwrap();
        assert_eq!(mapping.dims(), Dimensions::new(3, 2, 4, 4, 6));
        assert_eq!(mapping.plane_index(0, 0, 0, 0), 0);
        assert_eq!(mapping.plane_index(0, 0, 0, 3), 3);
        assert_eq!(mapping.plane_index(0, 1, 0, 0), 4);
        assert_eq!(mapping.plane_index(0, 2, 1, 3), 23);
        assert_eq!(mapping.plane_count(), 24);
    }

    #[test]
    fn test_scene_axis_participates_in_plane_index() {
        let mapping = AxisMapping::from_layout(&layout(&[('T', 2), ('S', 3), ('Z', 2)], 1)).unwrap();
        assert_eq!(mapping.dims().t, 2);
        assert_eq!(mapping.plane_index(1, 0, 0, 1), 3);
        assert_eq!(mapping.plane_index(2, 1, 0, 0), 10);
    }

    #[test]
    fn test_samples_become_channels() {
        let mapping = AxisMapping::from_layout(&layout(&[('Z', 5)], 3)).unwrap();
        assert!(mapping.samples_as_channels());
        assert_eq!(mapping.dims().c, 3);
        assert_eq!(mapping.channels_per_chunk(), 3);
        assert_eq!(mapping.plane_index(0, 0, 2, 4), 4);
    }

    #[test]
    fn test_samples_with_stored_channels_rejected() {
        let err = AxisMapping::from_layout(&layout(&[('C', 2)], 3)).unwrap_err();
        assert!(matches!(err, FormatError::UnsupportedVariant { .. }));
    }

    #[test]
    fn test_unknown_axis() {
        let err = AxisMapping::from_layout(&layout(&[('Q', 2)], 1)).unwrap_err();
        assert!(matches!(err, FormatError::Corrupt { .. }));

        let mapping = AxisMapping::from_layout(&layout(&[('Q', 1), ('Z', 2)], 1)).unwrap();
        assert_eq!(mapping.plane_index(0, 0, 0, 1), 1);
    }

    #[test]
    fn test_normalize_pads_channels_and_drops_zero_sizes() {
        let (meta, _) = normalize(&dv_native(), &layout(&[('C', 3), ('Z', 2)], 1)).unwrap();
        assert_eq!(meta.channels.len(), 3);
        assert_eq!(meta.channels[0].emission_wavelength, Some(520.0));
        assert_eq!(meta.channels[2], Channel::default());
        assert_eq!(meta.physical_pixel_sizes.z, None);
        assert!((meta.physical_pixel_sizes.x.unwrap() - 0.1).abs() < 1e-6);
        assert_eq!(meta.dimension_order(), "TCZYX");
    }

    #[test]
    fn test_normalize_truncates_channels() {
        let (meta, _) = normalize(&dv_native(), &layout(&[('Z', 2)], 1)).unwrap();
        assert_eq!(meta.channels.len(), 1);
    }

    #[test]
    fn test_colour_encodings() {
        assert_eq!(parse_ome_color("-16776961"), Some(0xFF0000FF));
        assert_eq!(parse_czi_color("#FF00FF00"), Some(0x00FF00FF));
        assert_eq!(parse_czi_color("#0000FF"), Some(0x0000FFFF));
        assert_eq!(parse_lut_name("Green"), Some(0x00FF00FF));
        assert_eq!(parse_lut_name("Fire"), None);
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(to_micrometres(2.0, "mm"), Some(2000.0));
        assert_eq!(to_micrometres(0.5, "µm"), Some(0.5));
        assert!((to_micrometres(1.0 / 10_000.0, "cm").unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(to_micrometres(1.0, "parsec"), None);
    }

    fn tiff_native(flavor: TiffFlavor) -> TiffNative {
        TiffNative {
            flavor,
            scenes: numbered_scenes(1),
            acquisition_date: None,
            ome_physical_sizes: [None, None, None],
            x_resolution: None,
            y_resolution: None,
            resolution_unit: 1,
            imagej_spacing: None,
            imagej_unit: None,
            channels: vec![],
            description: None,
        }
    }

    #[test]
    fn test_plain_tiff_resolution() {
        let native = NativeMetadata::Tiff(TiffNative {
            x_resolution: Some(20_000.0),
            y_resolution: Some(20_000.0),
            resolution_unit: 3,
            ..tiff_native(TiffFlavor::Plain)
        });
        let (meta, _) = normalize(&native, &layout(&[('Z', 1)], 1)).unwrap();
        assert!((meta.physical_pixel_sizes.x.unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(meta.physical_pixel_sizes.z, None);
    }

    #[test]
    fn test_imagej_without_unit_has_no_physical_sizes() {
        for unit in [None, Some("pixel")] {
            let native = NativeMetadata::Tiff(TiffNative {
                x_resolution: Some(1.0),
                y_resolution: Some(1.0),
                imagej_spacing: Some(1.0),
                imagej_unit: unit.map(str::to_string),
                ..tiff_native(TiffFlavor::ImageJ)
            });
            let (meta, _) = normalize(&native, &layout(&[('Z', 1)], 1)).unwrap();
            assert_eq!(meta.physical_pixel_sizes, PhysicalPixelSizes::default());
        }

        let native = NativeMetadata::Tiff(TiffNative {
            x_resolution: Some(4.0),
            y_resolution: Some(4.0),
            imagej_unit: Some("µm".to_string()),
            ..tiff_native(TiffFlavor::ImageJ)
        });
        let (meta, _) = normalize(&native, &layout(&[('Z', 1)], 1)).unwrap();
        assert_eq!(meta.physical_pixel_sizes.x, Some(0.25));
    }

    #[test]
    fn test_ome_unit_defaults_to_micrometres() {
        let native = NativeMetadata::Tiff(TiffNative {
            ome_physical_sizes: [None, Some((0.5, String::new())), Some((0.5, String::new()))],
            ..tiff_native(TiffFlavor::Ome)
        });
        let (meta, _) = normalize(&native, &layout(&[('Z', 1)], 1)).unwrap();
        assert_eq!(meta.physical_pixel_sizes.x, Some(0.5));
    }
}
