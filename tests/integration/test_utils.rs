//! Test utilities for integration tests.
//!
//! Mock range readers that record or sabotage requests, plus helpers that
//! build small TIFF, CZI and PNG files in memory.

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use bioimage_streamer::error::IoError;
use bioimage_streamer::io::RangeReader;

// =============================================================================
// Mock Range Reader with Request Tracking
// =============================================================================

/// A mock range reader that tracks all read requests.
///
/// Clones share their counters, so a test can keep one handle while the
/// library owns another.
pub struct TrackingReader {
    data: Bytes,
    identifier: String,
    request_count: Arc<AtomicUsize>,
    requests: Arc<RwLock<Vec<(u64, usize)>>>,
}

impl TrackingReader {
    pub fn new(data: Vec<u8>, identifier: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(data),
            identifier: identifier.into(),
            request_count: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    pub async fn get_requests(&self) -> Vec<(u64, usize)> {
        self.requests.read().await.clone()
    }

    pub async fn reset_tracking(&self) {
        self.request_count.store(0, Ordering::SeqCst);
        self.requests.write().await.clear();
    }
}

impl Clone for TrackingReader {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            identifier: self.identifier.clone(),
            request_count: Arc::clone(&self.request_count),
            requests: Arc::clone(&self.requests),
        }
    }
}

#[async_trait]
impl RangeReader for TrackingReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.requests.write().await.push((offset, len));

        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.data.len() as u64,
            });
        }
        Ok(self.data.slice(start..end))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// Flaky Reader
// =============================================================================

/// How a [`FlakyReader`] misbehaves on its failing calls.
#[derive(Clone)]
pub enum Failure {
    /// Return this error immediately
    Error(IoError),
    /// Hang for this long before answering, to trip an attempt timeout
    Stall(Duration),
}

/// Reader whose first `failures` reads misbehave, then behave.
#[derive(Clone)]
pub struct FlakyReader {
    data: Bytes,
    identifier: String,
    failures: usize,
    failure: Failure,
    calls: Arc<AtomicUsize>,
}

impl FlakyReader {
    pub fn new(data: Vec<u8>, identifier: impl Into<String>, failures: usize, failure: Failure) -> Self {
        Self {
            data: Bytes::from(data),
            identifier: identifier.into(),
            failures,
            failure,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RangeReader for FlakyReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            match &self.failure {
                Failure::Error(e) => return Err(e.clone()),
                Failure::Stall(d) => tokio::time::sleep(*d).await,
            }
        }

        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.data.len() as u64,
            });
        }
        Ok(self.data.slice(start..end))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// Slow Reader
// =============================================================================

/// Reader whose reads all take a configurable delay, zero by default.
///
/// Clones share the delay, so a test can slow down a reader the library
/// already owns.
#[derive(Clone)]
pub struct SlowReader {
    data: Bytes,
    identifier: String,
    delay_ms: Arc<AtomicU64>,
}

impl SlowReader {
    pub fn new(data: Vec<u8>, identifier: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(data),
            identifier: identifier.into(),
            delay_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl RangeReader for SlowReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.data.len() as u64,
            });
        }
        Ok(self.data.slice(start..end))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// TIFF File Builder
// =============================================================================

/// One uncompressed single-strip page.
pub struct TiffPage {
    pub width: u32,
    pub height: u32,
    pub bits: u16,
    /// Pixel bytes, already in the file's byte order
    pub pixels: Vec<u8>,
    pub description: Option<String>,
}

impl TiffPage {
    /// 8-bit grayscale page filled with `value`.
    pub fn gray8(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            bits: 8,
            pixels: vec![value; (width * height) as usize],
            description: None,
        }
    }

    /// 16-bit grayscale page whose pixel `i` is `base + i`.
    pub fn gray16(width: u32, height: u32, base: u16, big_endian: bool) -> Self {
        let pixels = (0..width * height)
            .flat_map(|i| {
                let v = base.wrapping_add(i as u16);
                if big_endian {
                    v.to_be_bytes()
                } else {
                    v.to_le_bytes()
                }
            })
            .collect();
        Self {
            width,
            height,
            bits: 16,
            pixels,
            description: None,
        }
    }

    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }
}

/// Builder for classic or BigTIFF files in either byte order.
pub struct TiffBuilder {
    big_endian: bool,
    bigtiff: bool,
    pages: Vec<TiffPage>,
}

impl TiffBuilder {
    pub fn new() -> Self {
        Self {
            big_endian: false,
            bigtiff: false,
            pages: Vec::new(),
        }
    }

    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    pub fn bigtiff(mut self) -> Self {
        self.bigtiff = true;
        self
    }

    pub fn page(mut self, page: TiffPage) -> Self {
        self.pages.push(page);
        self
    }

    /// Lay out `[pixels][description][IFD]` per page and chain the IFDs.
    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(if self.big_endian { b"MM" } else { b"II" });
        if self.bigtiff {
            self.put(&mut out, 43, 2);
            self.put(&mut out, 8, 2);
            self.put(&mut out, 0, 2);
            self.put(&mut out, 0, 8);
        } else {
            self.put(&mut out, 42, 2);
            self.put(&mut out, 0, 4);
        }
        let mut next_field = out.len() - self.offset_width();

        for page in &self.pages {
            let data_offset = out.len() as u64;
            out.extend_from_slice(&page.pixels);
            pad_even(&mut out);

            let description = page.description.as_ref().map(|text| {
                let offset = out.len() as u64;
                out.extend_from_slice(text.as_bytes());
                out.push(0);
                pad_even(&mut out);
                (offset, text.len() as u64 + 1)
            });

            // (tag, type, count, value); only the description is out of line
            let offset_type = if self.bigtiff { 16 } else { 4 };
            let mut entries: Vec<(u16, u16, u64, u64)> = vec![
                (256, 4, 1, page.width as u64),
                (257, 4, 1, page.height as u64),
                (258, 3, 1, page.bits as u64),
                (259, 3, 1, 1),
                (262, 3, 1, 1),
                (273, offset_type, 1, data_offset),
                (277, 3, 1, 1),
                (278, 4, 1, page.height as u64),
                (279, 4, 1, page.pixels.len() as u64),
            ];
            if let Some((offset, len)) = description {
                entries.push((270, 2, len, offset));
            }
            entries.sort_by_key(|e| e.0);

            let ifd_offset = out.len() as u64;
            self.patch(&mut out, next_field, ifd_offset);

            self.put(&mut out, entries.len() as u64, if self.bigtiff { 8 } else { 2 });
            for (tag, ty, count, value) in entries {
                self.put(&mut out, tag as u64, 2);
                self.put(&mut out, ty as u64, 2);
                self.put(&mut out, count, self.offset_width());
                let width = match ty {
                    3 if count == 1 => 2,
                    16 => 8,
                    _ => 4,
                };
                self.put(&mut out, value, width);
                for _ in width..self.offset_width() {
                    out.push(0);
                }
            }
            next_field = out.len();
            self.put(&mut out, 0, self.offset_width());
        }
        out
    }

    fn offset_width(&self) -> usize {
        if self.bigtiff {
            8
        } else {
            4
        }
    }

    fn put(&self, out: &mut Vec<u8>, value: u64, width: usize) {
        let bytes = if self.big_endian {
            value.to_be_bytes()[8 - width..].to_vec()
        } else {
            value.to_le_bytes()[..width].to_vec()
        };
        out.extend_from_slice(&bytes);
    }

    fn patch(&self, out: &mut [u8], at: usize, value: u64) {
        let mut field = Vec::new();
        self.put(&mut field, value, self.offset_width());
        out[at..at + field.len()].copy_from_slice(&field);
    }
}

impl Default for TiffBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn pad_even(out: &mut Vec<u8>) {
    if out.len() % 2 == 1 {
        out.push(0);
    }
}

// =============================================================================
// CZI File Builder
// =============================================================================

/// Metadata document with scaling, channels and an acquisition date.
pub const CZI_XML: &str = r##"<ImageDocument><Metadata>
    <Scaling><Items>
      <Distance Id="X"><Value>2.5E-07</Value></Distance>
      <Distance Id="Y"><Value>2.5E-07</Value></Distance>
      <Distance Id="Z"><Value>1E-06</Value></Distance>
    </Items></Scaling>
    <Information><Image>
      <AcquisitionDateAndTime>2019-05-06T11:12:13Z</AcquisitionDateAndTime>
      <Dimensions><Channels>
        <Channel Id="Channel:0" Name="DAPI"><EmissionWavelength>465</EmissionWavelength></Channel>
        <Channel Id="Channel:1" Name="AF488"/>
        <Channel Id="Channel:2" Name="AF647"/>
      </Channels></Dimensions>
    </Image></Information>
  </Metadata></ImageDocument>"##;

fn czi_segment(id: &str, body: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 16];
    out[..id.len()].copy_from_slice(id.as_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn czi_entry(position: u64, dims: &[(&str, i32, i32)]) -> Vec<u8> {
    let mut out = b"DV".to_vec();
    out.extend_from_slice(&0i32.to_le_bytes()); // Gray8
    out.extend_from_slice(&position.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&(dims.len() as i32).to_le_bytes());
    for &(name, start, size) in dims {
        let mut id = [0u8; 4];
        id[..name.len()].copy_from_slice(name.as_bytes());
        out.extend_from_slice(&id);
        out.extend_from_slice(&start.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&0f32.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
    }
    out
}

/// Value stored in every pixel of CZI plane (s, t, c, z).
pub fn czi_value(s: usize, t: usize, c: usize, z: usize) -> u8 {
    (s * 60 + t * 20 + c * 5 + z) as u8
}

/// Gray8 CZI with one uncompressed subblock per plane.
pub fn build_czi(scenes: usize, t: usize, c: usize, z: usize, width: usize, height: usize) -> Vec<u8> {
    let mut out = czi_segment("ZISRAWFILE", &[0u8; 512]);
    let mut entries = Vec::new();

    for s in 0..scenes {
        for ti in 0..t {
            for ci in 0..c {
                for zi in 0..z {
                    let dims = [
                        ("X", 0, width as i32),
                        ("Y", 0, height as i32),
                        ("S", s as i32, 1),
                        ("T", ti as i32, 1),
                        ("C", ci as i32, 1),
                        ("Z", zi as i32, 1),
                    ];
                    let entry = czi_entry(out.len() as u64, &dims);
                    let mut body = Vec::new();
                    body.extend_from_slice(&0i32.to_le_bytes());
                    body.extend_from_slice(&0i32.to_le_bytes());
                    body.extend_from_slice(&((width * height) as i64).to_le_bytes());
                    body.extend_from_slice(&entry);
                    body.resize(256, 0);
                    body.extend(std::iter::repeat(czi_value(s, ti, ci, zi)).take(width * height));
                    entries.push(entry);
                    out.extend(czi_segment("ZISRAWSUBBLOCK", &body));
                }
            }
        }
    }

    let directory_position = out.len() as u64;
    let mut directory = (entries.len() as i32).to_le_bytes().to_vec();
    directory.resize(128, 0);
    for entry in &entries {
        directory.extend_from_slice(entry);
    }
    out.extend(czi_segment("ZISRAWDIRECTORY", &directory));

    let metadata_position = out.len() as u64;
    let mut metadata = (CZI_XML.len() as i32).to_le_bytes().to_vec();
    metadata.resize(256, 0);
    metadata.extend_from_slice(CZI_XML.as_bytes());
    out.extend(czi_segment("ZISRAWMETADATA", &metadata));

    out[84..92].copy_from_slice(&directory_position.to_le_bytes());
    out[92..100].copy_from_slice(&metadata_position.to_le_bytes());
    out
}

// =============================================================================
// Test PNG Creation
// =============================================================================

/// RGB PNG where red follows x, green follows y and blue is constant.
pub fn create_test_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 200]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}
