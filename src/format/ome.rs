//! OME-XML reading and writing.
//!
//! Only the parts of the schema that describe pixel geometry, channels and
//! plane placement are modelled. Everything else in a document is ignored
//! on read and never produced on write.

use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::FormatError;
use crate::metadata::{Metadata, NativeChannel, PixelType};

use super::xml::Element;

/// Namespace written into produced documents.
pub const OME_NAMESPACE: &str = "http://www.openmicroscopy.org/Schemas/OME/2016-06";

// =============================================================================
// Model
// =============================================================================

/// One `TiffData` block: consecutive planes starting at an IFD.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TiffData {
    pub ifd: Option<usize>,
    pub first_z: usize,
    pub first_c: usize,
    pub first_t: usize,
    pub plane_count: Option<usize>,

    /// `UUID/@FileName`, set when planes live in a named file
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OmeChannel {
    pub channel: NativeChannel,
    pub samples_per_pixel: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OmePixels {
    pub dimension_order: String,
    pub dtype: PixelType,
    pub size_x: usize,
    pub size_y: usize,
    pub size_z: usize,
    pub size_c: usize,
    pub size_t: usize,

    /// `PhysicalSize{Z,Y,X}` with their unit symbols
    pub physical_sizes: [Option<(f64, String)>; 3],
    pub channels: Vec<OmeChannel>,
    pub tiff_data: Vec<TiffData>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OmeImage {
    pub id: Option<String>,
    pub name: Option<String>,
    pub acquisition_date: Option<String>,
    pub pixels: OmePixels,
}

impl OmePixels {
    /// Interleaved samples per stored plane (from the first channel).
    pub fn samples_per_pixel(&self) -> usize {
        self.channels
            .first()
            .map(|c| c.samples_per_pixel)
            .unwrap_or(1)
            .max(1)
    }

    /// Plane-stack axes, outermost first, when each stored plane carries
    /// `spp` interleaved channels.
    ///
    /// OME lists dimensions fastest first, so `XYZCT` stores planes with Z
    /// varying fastest and T slowest.
    pub fn plane_axes(&self, spp: usize) -> Result<Vec<(char, usize)>, FormatError> {
        let spp = spp.max(1);
        if self.size_c % spp != 0 {
            return Err(FormatError::corrupt(format!(
                "SizeC {} is not a multiple of SamplesPerPixel {}",
                self.size_c, spp
            )));
        }

        Ok(self.dimension_order[2..]
            .chars()
            .rev()
            .map(|axis| {
                let size = match axis {
                    'Z' => self.size_z,
                    'C' => self.size_c / spp,
                    _ => self.size_t,
                };
                (axis, size)
            })
            .collect())
    }
}

// =============================================================================
// Reading
// =============================================================================

/// Parse the `Image` elements of an OME-XML document.
pub fn parse_ome(document: &str) -> Result<Vec<OmeImage>, FormatError> {
    let root = Element::parse(document)?;
    if root.name != "OME" {
        return Err(FormatError::corrupt(format!(
            "OME-XML root element is {}",
            root.name
        )));
    }

    let images: Vec<OmeImage> = root
        .children_named("Image")
        .map(parse_image)
        .collect::<Result<_, _>>()?;
    if images.is_empty() {
        return Err(FormatError::corrupt("OME-XML declares no Image"));
    }
    Ok(images)
}

fn parse_image(image: &Element) -> Result<OmeImage, FormatError> {
    let pixels = image
        .child("Pixels")
        .ok_or_else(|| FormatError::corrupt("OME Image has no Pixels element"))?;

    let size = |name: &str| -> Result<usize, FormatError> {
        pixels
            .attr_parse::<usize>(name)
            .ok_or_else(|| FormatError::corrupt(format!("Pixels/@{} missing or invalid", name)))
    };

    let dimension_order = pixels.attr("DimensionOrder").unwrap_or("XYZCT").to_string();
    let valid_order = dimension_order.len() == 5
        && dimension_order.starts_with("XY")
        && ['Z', 'C', 'T']
            .iter()
            .all(|&a| dimension_order[2..].contains(a));
    if !valid_order {
        return Err(FormatError::corrupt(format!(
            "invalid DimensionOrder {}",
            dimension_order
        )));
    }

    let type_name = pixels
        .attr("Type")
        .ok_or_else(|| FormatError::corrupt("Pixels/@Type missing"))?;
    let dtype = PixelType::from_ome_name(type_name).ok_or_else(|| {
        FormatError::unsupported_variant(format!("OME pixel type {}", type_name))
    })?;

    let physical = |axis: &str| -> Option<(f64, String)> {
        let value = pixels.attr_parse::<f64>(&format!("PhysicalSize{}", axis))?;
        let unit = pixels
            .attr(&format!("PhysicalSize{}Unit", axis))
            .unwrap_or("µm")
            .to_string();
        Some((value, unit))
    };

    let channels = pixels
        .children_named("Channel")
        .map(|ch| OmeChannel {
            channel: NativeChannel {
                name: ch.attr("Name").map(str::to_string),
                color: ch.attr("Color").map(str::to_string),
                emission_wavelength: ch.attr_parse::<f64>("EmissionWavelength").map(|w| {
                    (
                        w,
                        ch.attr("EmissionWavelengthUnit").unwrap_or("nm").to_string(),
                    )
                }),
            },
            samples_per_pixel: ch.attr_parse("SamplesPerPixel").unwrap_or(1),
        })
        .collect();

    let tiff_data = pixels
        .children_named("TiffData")
        .map(|td| TiffData {
            ifd: td.attr_parse("IFD"),
            first_z: td.attr_parse("FirstZ").unwrap_or(0),
            first_c: td.attr_parse("FirstC").unwrap_or(0),
            first_t: td.attr_parse("FirstT").unwrap_or(0),
            plane_count: td.attr_parse("PlaneCount"),
            file_name: td
                .child("UUID")
                .and_then(|u| u.attr("FileName"))
                .map(str::to_string),
        })
        .collect();

    Ok(OmeImage {
        id: image.attr("ID").map(str::to_string),
        name: image.attr("Name").map(str::to_string),
        acquisition_date: image.find_text("AcquisitionDate").map(str::to_string),
        pixels: OmePixels {
            dimension_order,
            dtype,
            size_x: size("SizeX")?,
            size_y: size("SizeY")?,
            size_z: size("SizeZ")?,
            size_c: size("SizeC")?,
            size_t: size("SizeT")?,
            physical_sizes: [physical("Z"), physical("Y"), physical("X")],
            channels,
            tiff_data,
        },
    })
}

// =============================================================================
// Writing
// =============================================================================

/// Render canonical metadata as a single-image OME-XML document.
///
/// Planes are declared in `XYZCT` order and placed with one `TiffData`
/// block starting at IFD 0.
pub fn build_ome_xml(metadata: &Metadata, creator: &str) -> Result<String, FormatError> {
    let dims = metadata.dims;
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut ome = BytesStart::new("OME");
    ome.push_attribute(("xmlns", OME_NAMESPACE));
    ome.push_attribute(("Creator", creator));
    write(&mut writer, Event::Start(ome))?;

    let mut image = BytesStart::new("Image");
    image.push_attribute(("ID", "Image:0"));
    if let Some(name) = metadata.scene_name() {
        image.push_attribute(("Name", name));
    }
    write(&mut writer, Event::Start(image))?;

    if let Some(date) = &metadata.acquisition_time {
        write(&mut writer, Event::Start(BytesStart::new("AcquisitionDate")))?;
        write(&mut writer, Event::Text(BytesText::new(date)))?;
        write(&mut writer, Event::End(BytesEnd::new("AcquisitionDate")))?;
    }

    let mut pixels = BytesStart::new("Pixels");
    let sizes = [
        ("SizeX", dims.x),
        ("SizeY", dims.y),
        ("SizeZ", dims.z),
        ("SizeC", dims.c),
        ("SizeT", dims.t),
    ];
    pixels.push_attribute(("ID", "Pixels:0"));
    pixels.push_attribute(("DimensionOrder", "XYZCT"));
    pixels.push_attribute(("Type", metadata.dtype.ome_name()));
    for (name, value) in sizes {
        pixels.push_attribute((name, value.to_string().as_str()));
    }
    let physical = [
        ("X", metadata.physical_pixel_sizes.x),
        ("Y", metadata.physical_pixel_sizes.y),
        ("Z", metadata.physical_pixel_sizes.z),
    ];
    for (axis, value) in physical {
        if let Some(value) = value {
            pixels.push_attribute((
                format!("PhysicalSize{}", axis).as_str(),
                value.to_string().as_str(),
            ));
            pixels.push_attribute((format!("PhysicalSize{}Unit", axis).as_str(), "µm"));
        }
    }
    pixels.push_attribute(("Interleaved", "false"));
    write(&mut writer, Event::Start(pixels))?;

    for (index, channel) in metadata.channels.iter().enumerate() {
        let mut element = BytesStart::new("Channel");
        element.push_attribute(("ID", format!("Channel:0:{}", index).as_str()));
        element.push_attribute(("SamplesPerPixel", "1"));
        if let Some(name) = &channel.name {
            element.push_attribute(("Name", name.as_str()));
        }
        if let Some(color) = channel.color {
            element.push_attribute(("Color", (color as i32).to_string().as_str()));
        }
        if let Some(wavelength) = channel.emission_wavelength {
            element.push_attribute(("EmissionWavelength", wavelength.to_string().as_str()));
            element.push_attribute(("EmissionWavelengthUnit", "nm"));
        }
        write(&mut writer, Event::Empty(element))?;
    }

    let mut tiff_data = BytesStart::new("TiffData");
    tiff_data.push_attribute(("IFD", "0"));
    tiff_data.push_attribute(("PlaneCount", dims.plane_count().to_string().as_str()));
    write(&mut writer, Event::Empty(tiff_data))?;

    write(&mut writer, Event::End(BytesEnd::new("Pixels")))?;
    write(&mut writer, Event::End(BytesEnd::new("Image")))?;
    write(&mut writer, Event::End(BytesEnd::new("OME")))?;

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| FormatError::Xml(format!("invalid UTF-8 in generated XML: {}", e)))
}

fn write(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event<'_>) -> Result<(), FormatError> {
    writer
        .write_event(event)
        .map_err(|e| FormatError::Xml(e.to_string()))
}
