//! Materialized pixel data.

use bytes::Bytes;
use ndarray::Array5;

use crate::error::ImageError;
use crate::metadata::PixelType;

/// Rust sample types that map onto a [`PixelType`].
pub trait Sample: Copy + Send + 'static {
    const PIXEL_TYPE: PixelType;

    /// Decode one native-endian sample.
    fn from_ne_slice(bytes: &[u8]) -> Self;
}

macro_rules! impl_sample {
    ($($ty:ty => $pixel:expr),* $(,)?) => {
        $(
            impl Sample for $ty {
                const PIXEL_TYPE: PixelType = $pixel;

                fn from_ne_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(raw)
                }
            }
        )*
    };
}

impl_sample! {
    u8 => PixelType::Uint8,
    u16 => PixelType::Uint16,
    u32 => PixelType::Uint32,
    i8 => PixelType::Int8,
    i16 => PixelType::Int16,
    i32 => PixelType::Int32,
    f32 => PixelType::Float32,
    f64 => PixelType::Float64,
}

/// A dense 5-D block of samples in `TCZYX` order, native-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    shape: [usize; 5],
    dtype: PixelType,
    data: Bytes,
}

impl ImageData {
    pub(crate) fn new(shape: [usize; 5], dtype: PixelType, data: Bytes) -> Self {
        debug_assert_eq!(
            data.len(),
            shape.iter().product::<usize>() * dtype.bytes_per_sample()
        );
        Self { shape, dtype, data }
    }

    pub fn shape(&self) -> [usize; 5] {
        self.shape
    }

    pub fn dtype(&self) -> PixelType {
        self.dtype
    }

    /// Raw sample bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Typed view as an owned `Array5`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSelection` if `T` does not match the data type.
    pub fn to_ndarray<T: Sample>(&self) -> Result<Array5<T>, ImageError> {
        if T::PIXEL_TYPE != self.dtype {
            return Err(ImageError::InvalidSelection(format!(
                "data is {} but {} was requested",
                self.dtype,
                T::PIXEL_TYPE
            )));
        }

        let values: Vec<T> = self
            .data
            .chunks_exact(self.dtype.bytes_per_sample())
            .map(T::from_ne_slice)
            .collect();
        let [t, c, z, y, x] = self.shape;
        Array5::from_shape_vec((t, c, z, y, x), values)
            .map_err(|e| ImageError::InvalidSelection(e.to_string()))
    }
}
