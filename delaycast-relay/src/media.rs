//! Raw media frames exchanged with the platform
//!
//! Frames carry uncompressed buffers: interleaved signed 16-bit PCM for audio,
//! planar or packed pixels for video. Encoding and transport stay on the
//! platform side.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [Self; 2] = [Self::Audio, Self::Video];

    /// Stable slot index for per-kind arrays
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Audio => 0,
            Self::Video => 1,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Pixel layout of a raw video buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    I420,
    Nv12,
    Rgba,
}

/// Clock parameters of a published audio track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioShape {
    pub sample_rate: u32,
    pub num_channels: u32,
    pub samples_per_channel: u32,
}

impl AudioShape {
    /// Playout time covered by one frame of this shape
    #[must_use]
    pub fn frame_duration(&self) -> Option<Duration> {
        if self.sample_rate == 0 || self.samples_per_channel == 0 {
            return None;
        }
        let micros = u64::from(self.samples_per_channel) * 1_000_000 / u64::from(self.sample_rate);
        Some(Duration::from_micros(micros))
    }
}

/// Dimensions of a published video track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoShape {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Shape a local track is published with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TrackShape {
    Audio(AudioShape),
    Video(VideoShape),
}

impl TrackShape {
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        match self {
            Self::Audio(_) => MediaKind::Audio,
            Self::Video(_) => MediaKind::Video,
        }
    }
}

/// One block of interleaved s16le PCM
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Bytes,
    pub sample_rate: u32,
    pub num_channels: u32,
    pub samples_per_channel: u32,
}

impl AudioFrame {
    /// Digital silence with the given clock parameters
    #[must_use]
    pub fn silence(shape: AudioShape) -> Self {
        let len = shape.samples_per_channel as usize * shape.num_channels as usize * 2;
        Self {
            data: Bytes::from(vec![0u8; len]),
            sample_rate: shape.sample_rate,
            num_channels: shape.num_channels,
            samples_per_channel: shape.samples_per_channel,
        }
    }

    #[must_use]
    pub const fn shape(&self) -> AudioShape {
        AudioShape {
            sample_rate: self.sample_rate,
            num_channels: self.num_channels,
            samples_per_channel: self.samples_per_channel,
        }
    }

    #[must_use]
    pub fn is_silent(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }
}

/// One raw video picture
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp_us: i64,
}

impl VideoFrame {
    /// A black picture of the given dimensions
    #[must_use]
    pub fn black(shape: VideoShape) -> Self {
        let w = shape.width as usize;
        let h = shape.height as usize;
        let data = match shape.format {
            PixelFormat::I420 | PixelFormat::Nv12 => {
                let chroma = w.div_ceil(2) * h.div_ceil(2) * 2;
                let mut buf = vec![16u8; w * h];
                buf.resize(w * h + chroma, 128);
                buf
            }
            PixelFormat::Rgba => [0u8, 0, 0, 255].repeat(w * h),
        };

        Self {
            data: Bytes::from(data),
            width: shape.width,
            height: shape.height,
            format: shape.format,
            timestamp_us: 0,
        }
    }

    #[must_use]
    pub const fn shape(&self) -> VideoShape {
        VideoShape {
            width: self.width,
            height: self.height,
            format: self.format,
        }
    }
}

/// A frame of either kind
#[derive(Debug, Clone)]
pub enum MediaFrame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl MediaFrame {
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        match self {
            Self::Audio(_) => MediaKind::Audio,
            Self::Video(_) => MediaKind::Video,
        }
    }

    #[must_use]
    pub const fn shape(&self) -> TrackShape {
        match self {
            Self::Audio(frame) => TrackShape::Audio(frame.shape()),
            Self::Video(frame) => TrackShape::Video(frame.shape()),
        }
    }

    #[must_use]
    pub fn data(&self) -> &Bytes {
        match self {
            Self::Audio(frame) => &frame.data,
            Self::Video(frame) => &frame.data,
        }
    }

    /// Copy of this frame backed by a fresh allocation.
    ///
    /// Platform frames may borrow decoder or jitter-buffer storage; a frame
    /// held across a delay must own its bytes.
    #[must_use]
    pub fn detached(&self) -> Self {
        match self {
            Self::Audio(frame) => Self::Audio(AudioFrame {
                data: Bytes::copy_from_slice(&frame.data),
                ..frame.clone()
            }),
            Self::Video(frame) => Self::Video(VideoFrame {
                data: Bytes::copy_from_slice(&frame.data),
                ..frame.clone()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_length() {
        let frame = AudioFrame::silence(AudioShape {
            sample_rate: 48_000,
            num_channels: 2,
            samples_per_channel: 480,
        });
        assert_eq!(frame.data.len(), 480 * 2 * 2);
        assert!(frame.is_silent());
    }

    #[test]
    fn test_audio_frame_duration() {
        let shape = |sample_rate, samples_per_channel| AudioShape {
            sample_rate,
            num_channels: 1,
            samples_per_channel,
        };
        assert_eq!(shape(48_000, 480).frame_duration(), Some(Duration::from_millis(10)));
        assert_eq!(shape(16_000, 320).frame_duration(), Some(Duration::from_millis(20)));
        assert_eq!(shape(0, 480).frame_duration(), None);
    }

    #[test]
    fn test_black_frame_sizes() {
        let i420 = VideoFrame::black(VideoShape { width: 5, height: 3, format: PixelFormat::I420 });
        // 15 luma bytes + 2 chroma planes of 3x2
        assert_eq!(i420.data.len(), 15 + 12);
        assert_eq!(i420.data[0], 16);
        assert_eq!(i420.data[15], 128);

        let rgba = VideoFrame::black(VideoShape { width: 2, height: 2, format: PixelFormat::Rgba });
        assert_eq!(&rgba.data[..], &[0, 0, 0, 255, 0, 0, 0, 255, 0, 0, 0, 255, 0, 0, 0, 255]);
    }

    #[test]
    fn test_detached_owns_buffer() {
        let original = MediaFrame::Video(VideoFrame {
            data: Bytes::from(vec![1u8, 2, 3, 4]),
            width: 2,
            height: 1,
            format: PixelFormat::Rgba,
            timestamp_us: 7,
        });

        let copy = original.detached();
        assert_eq!(copy.data(), original.data());
        assert_ne!(copy.data().as_ptr(), original.data().as_ptr());
        assert_eq!(copy.shape(), original.shape());
    }
}
