//! DeltaVision (Priism) backend.
//!
//! A DV file is a 1024-byte header, an extended header of `next` bytes and
//! then uncompressed sections of `nx * ny` pixels. `nz` counts every
//! section, so the Z size is `nz / (waves * times)`. The header may be in
//! either byte order; the `0xC0A0` magic at byte 96 tells which.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::FormatError;
use crate::io::RangeReader;
use crate::metadata::{numbered_scenes, AxisMapping, DvNative, NativeMetadata, PixelType};

use super::backend::OpenOptions;
use super::layout::{ChunkRequest, NativeLayout};
use super::pixels::{crop_window, to_native_endian};
use super::tiff::ByteOrder;

pub const DV_HEADER_SIZE: usize = 1024;
pub const DV_MAGIC: u16 = 0xC0A0;
pub const DV_MAGIC_OFFSET: usize = 96;

// Header field offsets
const NX: usize = 0;
const NY: usize = 4;
const NZ: usize = 8;
const MODE: usize = 12;
const DX: usize = 40;
const DY: usize = 44;
const DZ: usize = 48;
const NEXT: usize = 92;
const NUM_TIMES: usize = 180;
const IMG_SEQUENCE: usize = 182;
const NUM_WAVES: usize = 196;
const WAVES: usize = 198;
const NUM_TITLES: usize = 220;
const TITLES: usize = 224;
const TITLE_LEN: usize = 80;

/// Byte order of a DV header, `None` when the magic is absent.
pub fn dv_byte_order(header: &[u8]) -> Option<ByteOrder> {
    let magic = header.get(DV_MAGIC_OFFSET..DV_MAGIC_OFFSET + 2)?;
    if ByteOrder::LittleEndian.read_u16(magic) == DV_MAGIC {
        Some(ByteOrder::LittleEndian)
    } else if ByteOrder::BigEndian.read_u16(magic) == DV_MAGIC {
        Some(ByteOrder::BigEndian)
    } else {
        None
    }
}

pub struct DvBackend {
    reader: Arc<dyn RangeReader>,
    byte_order: ByteOrder,
    layout: NativeLayout,
    native: DvNative,
    data_offset: u64,
    plane_bytes: usize,
}

impl DvBackend {
    /// Parse the fixed header.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The magic number is missing
    /// - The pixel mode is not 0, 1, 2 or 6
    /// - `nz` is not a multiple of waves × times
    /// - The file is shorter than its declared sections
    pub async fn open(
        reader: Arc<dyn RangeReader>,
        options: &OpenOptions,
    ) -> Result<Self, FormatError> {
        let cached = options.metadata_reader(&reader);
        let header = cached.read_exact_at(0, DV_HEADER_SIZE).await?;
        let bo = dv_byte_order(&header)
            .ok_or_else(|| FormatError::corrupt("DV magic number missing"))?;

        let dim = |offset: usize| bo.read_i32(&header[offset..offset + 4]).max(0) as usize;
        let short = |offset: usize| bo.read_i16(&header[offset..offset + 2]).max(0) as usize;

        let (nx, ny, nz) = (dim(NX), dim(NY), dim(NZ));
        let dtype = match bo.read_i32(&header[MODE..MODE + 4]) {
            0 => PixelType::Uint8,
            1 => PixelType::Int16,
            2 => PixelType::Float32,
            6 => PixelType::Uint16,
            mode => {
                return Err(FormatError::unsupported_variant(format!(
                    "DV pixel mode {}",
                    mode
                )))
            }
        };

        let waves = short(NUM_WAVES).max(1);
        let times = short(NUM_TIMES).max(1);
        if nx == 0 || ny == 0 || nz == 0 || nz % (waves * times) != 0 {
            return Err(FormatError::corrupt(format!(
                "DV header declares {} sections for {} waves and {} times",
                nz, waves, times
            )));
        }
        let size_z = nz / (waves * times);

        let plane_axes = match bo.read_i16(&header[IMG_SEQUENCE..IMG_SEQUENCE + 2]) {
            0 => vec![('C', waves), ('T', times), ('Z', size_z)],
            1 => vec![('T', times), ('Z', size_z), ('C', waves)],
            2 => vec![('T', times), ('C', waves), ('Z', size_z)],
            other => {
                return Err(FormatError::corrupt(format!(
                    "DV image sequence {}",
                    other
                )))
            }
        };

        let extended = bo.read_i32(&header[NEXT..NEXT + 4]).max(0) as u64;
        let data_offset = DV_HEADER_SIZE as u64 + extended;
        let plane_bytes = nx * ny * dtype.bytes_per_sample();
        let needed = data_offset + (plane_bytes * nz) as u64;
        if needed > reader.size() {
            return Err(FormatError::corrupt(format!(
                "DV file is {} bytes, sections need {}",
                reader.size(),
                needed
            )));
        }

        let mut wave_nm = [0i16; 5];
        for (i, wave) in wave_nm.iter_mut().enumerate() {
            let at = WAVES + i * 2;
            *wave = bo.read_i16(&header[at..at + 2]);
        }

        let title = (bo.read_i32(&header[NUM_TITLES..NUM_TITLES + 4]) > 0)
            .then(|| String::from_utf8_lossy(&header[TITLES..TITLES + TITLE_LEN]).into_owned())
            .map(|t| t.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string())
            .filter(|t| !t.is_empty());

        let float = |offset: usize| bo.read_f32(&header[offset..offset + 4]);
        let native = DvNative {
            scenes: numbered_scenes(1),
            dx: float(DX),
            dy: float(DY),
            dz: float(DZ),
            waves: wave_nm,
            title,
        };

        let layout = NativeLayout {
            scene: 0,
            plane_axes,
            size_y: ny,
            size_x: nx,
            samples_per_pixel: 1,
            dtype,
            chunk_y: ny,
            chunk_x: nx,
        };

        info!(
            identifier = reader.identifier(),
            order = %layout.dimension_order(),
            %dtype,
            "opened DV"
        );

        Ok(Self {
            reader,
            byte_order: bo,
            layout,
            native,
            data_offset,
            plane_bytes,
        })
    }

    pub fn scene_count(&self) -> usize {
        1
    }

    fn check_scene(&self, scene: usize) -> Result<(), FormatError> {
        if scene == 0 {
            Ok(())
        } else {
            Err(FormatError::corrupt(format!(
                "scene {} requested from a single-scene DV",
                scene
            )))
        }
    }

    pub fn scene_layout(&self, scene: usize) -> Result<NativeLayout, FormatError> {
        self.check_scene(scene)?;
        Ok(self.layout.clone())
    }

    pub fn native_metadata(&self, scene: usize) -> Result<NativeMetadata, FormatError> {
        self.check_scene(scene)?;
        Ok(NativeMetadata::Dv(self.native.clone()))
    }

    pub async fn read_chunk(
        &self,
        scene: usize,
        mapping: &AxisMapping,
        request: &ChunkRequest,
    ) -> Result<Bytes, FormatError> {
        self.check_scene(scene)?;
        let plane = mapping.plane_index(scene, request.t, request.c, request.z);
        let offset = self.data_offset + (plane * self.plane_bytes) as u64;
        debug!(plane, offset, "reading DV section");

        let data = self.reader.read_exact_at(offset, self.plane_bytes).await?;
        let bps = self.layout.dtype.bytes_per_sample();
        let mut window = crop_window(
            &data,
            self.layout.size_x,
            bps,
            request.y,
            request.x,
            request.height,
            request.width,
        );
        to_native_endian(
            &mut window,
            bps,
            self.byte_order == ByteOrder::LittleEndian,
        );
        Ok(Bytes::from(window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;
    use crate::metadata::normalize;

    /// Little- or big-endian u16 DV with `waves` x `times` x `z` sections.
    fn build_dv(big_endian: bool, sequence: i16, waves: i16, times: i16, z: i32) -> Vec<u8> {
        let (nx, ny) = (3i32, 2i32);
        let mut header = vec![0u8; DV_HEADER_SIZE];
        let mut put = |offset: usize, bytes: &[u8]| {
            header[offset..offset + bytes.len()].copy_from_slice(bytes);
        };
        macro_rules! enc {
            ($v:expr) => {
                if big_endian {
                    $v.to_be_bytes().to_vec()
                } else {
                    $v.to_le_bytes().to_vec()
                }
            };
        }
        let sections = z * waves as i32 * times as i32;
        put(NX, &enc!(nx));
        put(NY, &enc!(ny));
        put(NZ, &enc!(sections));
        put(MODE, &enc!(6i32));
        put(DX, &enc!(0.1f32));
        put(DY, &enc!(0.1f32));
        put(DZ, &enc!(0.0f32));
        put(NEXT, &enc!(16i32));
        put(DV_MAGIC_OFFSET, &enc!(DV_MAGIC));
        put(NUM_TIMES, &enc!(times));
        put(IMG_SEQUENCE, &enc!(sequence));
        put(NUM_WAVES, &enc!(waves));
        put(WAVES, &enc!(528i16));
        put(WAVES + 2, &enc!(617i16));
        put(NUM_TITLES, &enc!(1i32));
        put(TITLES, b"beads");

        let mut out = header;
        out.extend_from_slice(&[0u8; 16]);
        for section in 0..sections {
            for _ in 0..nx * ny {
                out.extend_from_slice(&enc!(section as u16 * 100));
            }
        }
        out
    }

    async fn open(bytes: Vec<u8>) -> Result<DvBackend, FormatError> {
        let reader: Arc<dyn RangeReader> = Arc::new(MemoryReader::new(bytes, "mem://a.dv"));
        DvBackend::open(reader, &OpenOptions::default()).await
    }

    #[tokio::test]
    async fn test_sequence_orders() {
        for (sequence, order) in [(0, "CTZYX"), (1, "TZCYX"), (2, "TCZYX")] {
            let backend = open(build_dv(false, sequence, 2, 1, 3)).await.unwrap();
            assert_eq!(backend.scene_layout(0).unwrap().dimension_order(), order);
        }
    }

    #[tokio::test]
    async fn test_big_endian_read_and_metadata() {
        let backend = open(build_dv(true, 1, 2, 2, 3)).await.unwrap();
        let layout = backend.scene_layout(0).unwrap();
        let (meta, mapping) = normalize(&backend.native_metadata(0).unwrap(), &layout).unwrap();
        assert_eq!(meta.dims.shape(), [2, 2, 3, 2, 3]);
        assert_eq!(meta.dtype, PixelType::Uint16);
        assert!((meta.physical_pixel_sizes.x.unwrap() - 0.1).abs() < 1e-6);
        assert_eq!(meta.physical_pixel_sizes.z, None);
        assert_eq!(meta.channels[0].emission_wavelength, Some(528.0));
        assert_eq!(meta.channels[1].emission_wavelength, Some(617.0));

        // Sequence 1 stores TZC: t=1, z=2, c=1 is section 1*6 + 2*2 + 1 = 11.
        let request = ChunkRequest {
            t: 1,
            c: 1,
            channels: 1,
            z: 2,
            y: 1,
            x: 0,
            height: 1,
            width: 3,
        };
        let data = backend.read_chunk(0, &mapping, &request).await.unwrap();
        let values: Vec<u16> = data
            .chunks_exact(2)
            .map(|b| u16::from_ne_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(values, vec![1100; 3]);
    }

    #[tokio::test]
    async fn test_rejections() {
        let mut bad_mode = build_dv(false, 0, 1, 1, 2);
        bad_mode[MODE..MODE + 4].copy_from_slice(&4i32.to_le_bytes());
        assert!(matches!(
            open(bad_mode).await,
            Err(FormatError::UnsupportedVariant { .. })
        ));

        let mut truncated = build_dv(false, 0, 1, 1, 2);
        truncated.truncate(DV_HEADER_SIZE + 20);
        assert!(matches!(open(truncated).await, Err(FormatError::Corrupt { .. })));
    }
}
