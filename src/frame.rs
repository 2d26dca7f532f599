//! Sample types and frame geometry.
//!
//! A frame is one catheter rotation. Both modalities are sampled per A-line
//! (one angular position): the fluorescence-lifetime digitizer records
//! `flim_samples_per_aline` pulse samples and the OCT source records
//! `oct_samples_per_aline` fringe samples.
//!
//! # Memory Layout
//!
//! ```text
//! Interleaved (hardware transfer, per A-line):
//!   [flim a0][oct a0][flim a1][oct a1] ... [flim aN-1][oct aN-1]
//!
//! Concatenated (recorded file, per frame):
//!   [flim a0 .. flim aN-1][oct a0 .. oct aN-1]
//! ```

use serde::{Deserialize, Serialize};

/// Primitive element stored in frame buffers.
///
/// Implemented for the digitizer sample widths the pipeline supports.
pub trait Sample: Copy + Default + Send + Sync + PartialEq + std::fmt::Debug + 'static {
    /// Encoded width in bytes.
    const BYTES: usize;

    /// Append the little-endian encoding of `self`.
    fn write_le(self, out: &mut Vec<u8>);

    /// Decode from exactly [`Self::BYTES`] little-endian bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Lossy conversion used by processing engines.
    fn to_f32(self) -> f32;
}

macro_rules! impl_sample {
    ($ty:ty, $bytes:expr) => {
        impl Sample for $ty {
            const BYTES: usize = $bytes;

            #[inline]
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; $bytes];
                raw.copy_from_slice(&bytes[..$bytes]);
                <$ty>::from_le_bytes(raw)
            }

            #[inline]
            fn to_f32(self) -> f32 {
                self as f32
            }
        }
    };
}

impl_sample!(u8, 1);
impl_sample!(u16, 2);
impl_sample!(f32, 4);

/// Encode `samples` as little-endian bytes, appending to `out`.
pub fn encode_samples<T: Sample>(samples: &[T], out: &mut Vec<u8>) {
    out.reserve(samples.len() * T::BYTES);
    for &sample in samples {
        sample.write_le(out);
    }
}

/// Decode little-endian `bytes` into `dst`.
///
/// `bytes.len()` must equal `dst.len() * T::BYTES`; checked by callers.
pub fn decode_samples<T: Sample>(bytes: &[u8], dst: &mut [T]) {
    for (sample, chunk) in dst.iter_mut().zip(bytes.chunks_exact(T::BYTES)) {
        *sample = T::read_le(chunk);
    }
}

/// How the two modalities are arranged inside one raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawLayout {
    /// Per A-line blocks: FLIm samples, then OCT samples.
    #[default]
    Interleaved,
    /// Whole FLIm sub-frame followed by the whole OCT sub-frame.
    Concatenated,
}

/// Per-frame dimensions of both modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    /// A-lines per rotation (the rotational axis).
    pub alines_per_frame: usize,
    /// FLIm pulse samples per A-line.
    pub flim_samples_per_aline: usize,
    /// OCT fringe samples per A-line.
    pub oct_samples_per_aline: usize,
    /// Arrangement of raw frames entering the deinterleave stage.
    #[serde(default)]
    pub raw_layout: RawLayout,
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self {
            alines_per_frame: 1024,
            flim_samples_per_aline: 64,
            oct_samples_per_aline: 1024,
            raw_layout: RawLayout::Interleaved,
        }
    }
}

impl FrameGeometry {
    /// Samples in one FLIm sub-frame.
    #[must_use]
    pub fn flim_frame_len(&self) -> usize {
        self.alines_per_frame * self.flim_samples_per_aline
    }

    /// Samples in one OCT sub-frame.
    #[must_use]
    pub fn oct_frame_len(&self) -> usize {
        self.alines_per_frame * self.oct_samples_per_aline
    }

    /// Samples in one raw (combined) frame.
    #[must_use]
    pub fn raw_frame_len(&self) -> usize {
        self.flim_frame_len() + self.oct_frame_len()
    }

    /// Samples per frame in the recorded file; same count as a raw frame,
    /// always in concatenated order.
    #[must_use]
    pub fn recorded_frame_len(&self) -> usize {
        self.raw_frame_len()
    }

    /// Bytes per recorded frame for sample type `T`.
    #[must_use]
    pub fn recorded_frame_bytes<T: Sample>(&self) -> usize {
        self.recorded_frame_len() * T::BYTES
    }

    /// Geometry of a recorded file replayed through the pipeline.
    #[must_use]
    pub fn as_concatenated(&self) -> Self {
        Self {
            raw_layout: RawLayout::Concatenated,
            ..*self
        }
    }
}

/// A buffer tagged with its pullback frame index.
#[derive(Debug)]
pub struct Tagged<B> {
    /// Pullback frame index (monotonic per acquisition).
    pub index: u64,
    /// Owned frame data.
    pub data: B,
}

impl<B> Tagged<B> {
    /// Tag `data` with `index`.
    pub fn new(index: u64, data: B) -> Self {
        Self { index, data }
    }
}

/// Which imaging subsystem a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Fluorescence-lifetime pulse stream.
    Flim,
    /// OCT fringe stream.
    Oct,
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modality::Flim => write!(f, "flim"),
            Modality::Oct => write!(f, "oct"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_lengths() {
        let geometry = FrameGeometry {
            alines_per_frame: 4,
            flim_samples_per_aline: 2,
            oct_samples_per_aline: 3,
            raw_layout: RawLayout::Interleaved,
        };
        assert_eq!(geometry.flim_frame_len(), 8);
        assert_eq!(geometry.oct_frame_len(), 12);
        assert_eq!(geometry.raw_frame_len(), 20);
        assert_eq!(geometry.recorded_frame_bytes::<u16>(), 40);
        assert_eq!(
            geometry.as_concatenated().raw_layout,
            RawLayout::Concatenated
        );
    }

    #[test]
    fn test_sample_encoding_is_little_endian() {
        let mut out = Vec::new();
        encode_samples(&[0x0102u16, 0xA0B0], &mut out);
        assert_eq!(out, vec![0x02, 0x01, 0xB0, 0xA0]);

        let mut decoded = [0u16; 2];
        decode_samples(&out, &mut decoded);
        assert_eq!(decoded, [0x0102, 0xA0B0]);
    }
}
