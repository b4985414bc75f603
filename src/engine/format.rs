//! Linear PCM format description

use std::time::Duration;

/// Describes the fixed PCM layout of a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Interleaved channel count
    pub channels: u16,

    /// Bits per sample (signed little-endian integer)
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// 16-bit signed little-endian, mono, 16 kHz
    pub const PCM_S16LE_MONO_16K: Self = Self {
        sample_rate: 16_000,
        channels: 1,
        bits_per_sample: 16,
    };

    #[must_use]
    pub const fn bytes_per_frame(&self) -> u32 {
        self.channels as u32 * (self.bits_per_sample as u32 / 8)
    }

    /// One frame per packet for linear PCM
    #[must_use]
    pub const fn bytes_per_packet(&self) -> u32 {
        self.bytes_per_frame()
    }

    /// Playback time covered by `bytes` of audio
    #[must_use]
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let bytes_per_second = u64::from(self.bytes_per_frame()) * u64::from(self.sample_rate);
        if bytes_per_second == 0 {
            return Duration::ZERO;
        }
        let bytes = u64::try_from(bytes).unwrap_or(u64::MAX);
        Duration::from_micros(bytes.saturating_mul(1_000_000) / bytes_per_second)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::PCM_S16LE_MONO_16K
    }
}

/// Decode 16-bit little-endian samples; a trailing odd byte is ignored
pub fn pcm_s16le_samples(bytes: &[u8]) -> impl Iterator<Item = i16> + '_ {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
}

/// Decode 16-bit little-endian samples to `[-1.0, 1.0)` floats
pub fn pcm_s16le_to_f32(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    pcm_s16le_samples(bytes).map(|s| f32::from(s) / 32768.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_format_layout() {
        let format = AudioFormat::PCM_S16LE_MONO_16K;
        assert_eq!(format.bytes_per_frame(), 2);
        assert_eq!(format.bytes_per_packet(), 2);
        assert_eq!(format.duration_of(32_000), Duration::from_secs(1));
        assert_eq!(format.duration_of(512), Duration::from_millis(16));
    }

    #[test]
    fn decodes_little_endian_samples() {
        let bytes = [0x01, 0x00, 0xff, 0x7f, 0x00, 0x80, 0xaa];
        let samples: Vec<i16> = pcm_s16le_samples(&bytes).collect();
        assert_eq!(samples, vec![1, i16::MAX, i16::MIN]);
    }

    #[test]
    fn float_conversion_is_normalized() {
        let bytes = [0x00, 0x80, 0x00, 0x00, 0x00, 0x40];
        let samples: Vec<f32> = pcm_s16le_to_f32(&bytes).collect();
        assert!((samples[0] + 1.0).abs() < f32::EPSILON);
        assert!(samples[1].abs() < f32::EPSILON);
        assert!((samples[2] - 0.5).abs() < f32::EPSILON);
    }
}
