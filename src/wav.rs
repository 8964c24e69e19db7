//! Minimal RIFF/WAVE framing: wrap raw PCM in the standard 44-byte header
//! the wire protocol promises (spec §4.6, §4.9, §6), and read just enough
//! of a header back out to recover the sample rate.

const HEADER_LEN: usize = 44;

/// Wrap mono 16-bit PCM bytes in a standard 44-byte RIFF/WAVE/fmt /data header.
pub fn wrap_pcm16_mono(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * 2; // mono, 16-bit
    let block_align: u16 = 2;
    let bits_per_sample: u16 = 16;
    let riff_len = 36 + data_len;

    let mut out = Vec::with_capacity(HEADER_LEN + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&riff_len.to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes()); // fmt chunk size
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

/// The fields the TTS pipeline needs out of a synthesized WAV blob
/// (spec §4.9 `sendInOrder`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub sample_rate: u32,
}

/// Read the sample rate out of a WAV header. Defaults to 16 000 Hz if the
/// header is missing, truncated, or declares a zero sample rate, matching
/// spec §4.9's `sendInOrder` fallback.
pub fn read_sample_rate(audio: &[u8]) -> WavInfo {
    const DEFAULT_RATE: u32 = 16_000;
    if audio.len() < HEADER_LEN || &audio[0..4] != b"RIFF" || &audio[8..12] != b"WAVE" {
        return WavInfo {
            sample_rate: DEFAULT_RATE,
        };
    }
    let rate = u32::from_le_bytes([audio[24], audio[25], audio[26], audio[27]]);
    WavInfo {
        sample_rate: if rate == 0 { DEFAULT_RATE } else { rate },
    }
}

/// `durationMs = round((len(audio) - 44) / (sampleRate * 2) * 1000)`, per
/// spec §4.9. Returns 0 if `sampleRate` is 0 or the audio is shorter than
/// the header.
pub fn duration_ms(audio: &[u8], sample_rate: u32) -> u64 {
    if sample_rate == 0 || audio.len() <= HEADER_LEN {
        return 0;
    }
    let data_bytes = (audio.len() - HEADER_LEN) as f64;
    let bytes_per_sec = (sample_rate as f64) * 2.0;
    (data_bytes / bytes_per_sec * 1000.0).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_produces_44_byte_header() {
        let pcm = vec![0u8; 100];
        let wav = wrap_pcm16_mono(&pcm, 16_000);
        assert_eq!(wav.len(), HEADER_LEN + 100);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");
    }

    #[test]
    fn round_trip_sample_rate() {
        let pcm = vec![1u8; 40];
        let wav = wrap_pcm16_mono(&pcm, 24_000);
        assert_eq!(read_sample_rate(&wav).sample_rate, 24_000);
    }

    #[test]
    fn missing_header_defaults_to_16k() {
        assert_eq!(read_sample_rate(&[1, 2, 3]).sample_rate, 16_000);
    }

    #[test]
    fn zero_sample_rate_in_header_defaults_to_16k() {
        let mut wav = wrap_pcm16_mono(&[0u8; 10], 16_000);
        wav[24..28].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(read_sample_rate(&wav).sample_rate, 16_000);
    }

    #[test]
    fn duration_ms_matches_formula() {
        // 1 second of 16kHz 16-bit mono PCM = 32000 bytes.
        let pcm = vec![0u8; 32_000];
        let wav = wrap_pcm16_mono(&pcm, 16_000);
        assert_eq!(duration_ms(&wav, 16_000), 1000);
    }

    #[test]
    fn duration_ms_zero_sample_rate() {
        assert_eq!(duration_ms(&[0u8; 100], 0), 0);
    }

    #[test]
    fn duration_ms_header_only() {
        let wav = wrap_pcm16_mono(&[], 16_000);
        assert_eq!(duration_ms(&wav, 16_000), 0);
    }
}
