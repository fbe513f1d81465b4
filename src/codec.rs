//! Audio format adaptation between carrier wire (μ-law 8kHz) and LLM wire
//! (μ-law 8kHz pass-through, or 16-bit linear PCM at 24kHz).

use serde::Deserialize;

const MULAW_BIAS: i16 = 0x84;
const MULAW_CLIP: i16 = 32635;

/// Negotiated audio format for a Realtime session. Fixed once at session
/// open (see `Session::audio_format`) and never observed to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    /// μ-law 8kHz both directions — zero resampling, zero quality loss.
    MulawPassthrough,
    /// 16-bit signed little-endian linear PCM at 24kHz.
    LinearPcm24k,
}

impl Default for AudioFormat {
    fn default() -> Self {
        AudioFormat::MulawPassthrough
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("resample rate must be positive, got {0}")]
    InvalidRate(i64),
}

/// Decode a single μ-law byte to a 16-bit PCM sample (ITU-T G.711).
pub fn mulaw_to_pcm(mulaw: u8) -> i16 {
    let mulaw = !mulaw;

    let sign = (mulaw & 0x80) as i16;
    let exponent = ((mulaw >> 4) & 0x07) as i16;
    let mantissa = (mulaw & 0x0F) as i16;

    let mut sample = ((mantissa << 3) + MULAW_BIAS) << exponent;
    sample -= MULAW_BIAS;

    if sign != 0 {
        -sample
    } else {
        sample
    }
}

/// Encode a 16-bit PCM sample to a μ-law byte.
pub fn pcm_to_mulaw(sample: i16) -> u8 {
    let sign: u8;
    let mut sample = sample;

    if sample < 0 {
        sign = 0x80;
        sample = sample.saturating_neg();
    } else {
        sign = 0;
    }

    if sample > MULAW_CLIP {
        sample = MULAW_CLIP;
    }
    sample += MULAW_BIAS;

    let exponent = compress_table((sample >> 7) as u8);
    let mantissa = ((sample >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

fn compress_table(val: u8) -> u8 {
    match val {
        0..=1 => 0,
        2..=3 => 1,
        4..=7 => 2,
        8..=15 => 3,
        16..=31 => 4,
        32..=63 => 5,
        64..=127 => 6,
        _ => 7,
    }
}

/// Decode a buffer of μ-law bytes to 16-bit PCM samples.
pub fn decode_mulaw(mulaw_data: &[u8]) -> Vec<i16> {
    mulaw_data.iter().map(|&b| mulaw_to_pcm(b)).collect()
}

/// Encode 16-bit PCM samples to μ-law bytes.
pub fn encode_mulaw(pcm_data: &[i16]) -> Vec<u8> {
    pcm_data.iter().map(|&s| pcm_to_mulaw(s)).collect()
}

/// Split a byte buffer into fixed-size frames. Any short trailing remainder
/// is dropped, never padded.
pub fn chunk(buffer: &[u8], frame_bytes: usize) -> Vec<&[u8]> {
    if frame_bytes == 0 {
        return Vec::new();
    }
    buffer.chunks_exact(frame_bytes).collect()
}

/// A streaming polyphase FIR resampler for a fixed integer ratio, designed
/// for short (≤20ms) frames: it carries its delay line across calls so
/// consecutive frames resample without boundary discontinuities. FFT-based
/// resampling is intentionally not used here — it rings on small buffers.
pub struct PolyphaseResampler {
    /// Interpolation factor (output samples per input sample before decimation).
    up: usize,
    /// Decimation factor (inputs consumed per interpolation stage before one output).
    down: usize,
    /// Low-pass FIR taps, designed for the up/down ratio.
    taps: Vec<f64>,
    /// Trailing history of raw input samples, taps.len()/up wide, for continuity.
    history: Vec<i16>,
}

/// Taps per polyphase branch. Modest length — these run per 20ms frame on
/// the hot audio path, not offline.
const TAPS_PER_PHASE: usize = 8;

impl PolyphaseResampler {
    /// Build a resampler for integer ratio `up`/`down` (e.g. 3/1 for 8kHz→24kHz,
    /// 1/3 for the reverse). Only one side of the ratio may differ from 1 —
    /// this bridge only ever needs pure up- or down-sampling.
    pub fn new(up: usize, down: usize) -> Result<Self, CodecError> {
        if up == 0 || down == 0 {
            return Err(CodecError::InvalidRate(0));
        }
        let branches = up.max(1);
        let taps = design_lowpass_taps(branches, up, down);
        Ok(Self {
            up,
            down,
            taps,
            history: vec![0; TAPS_PER_PHASE],
        })
    }

    pub fn upsample_3x() -> Self {
        Self::new(3, 1).expect("3/1 is a valid ratio")
    }

    pub fn downsample_3x() -> Self {
        Self::new(1, 3).expect("1/3 is a valid ratio")
    }

    /// Resample one frame of PCM samples, clamping output to i16 range.
    ///
    /// Upsampling (`up > 1`): every input sample produces `up` output
    /// samples, one per polyphase branch. Downsampling (`down > 1`): the
    /// filter runs on every input sample but only every `down`-th result is
    /// kept, so this holds no fractional state across calls beyond the
    /// sample history needed for the FIR tail.
    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        let windowed: Vec<i16> = self
            .history
            .iter()
            .chain(input.iter())
            .copied()
            .collect();

        let mut out = Vec::with_capacity(input.len() * self.up / self.down + 1);

        for n in 0..input.len() {
            // Index into `windowed` of the current input sample.
            let center = self.history.len() + n;

            if self.up > 1 {
                for phase in 0..self.up {
                    let mut acc = 0.0f64;
                    for k in 0..TAPS_PER_PHASE {
                        let tap = self.taps[phase * TAPS_PER_PHASE + k];
                        acc += tap * windowed[center - k] as f64;
                    }
                    out.push(clamp_i16(acc));
                }
            } else if (n % self.down) == 0 {
                let mut acc = 0.0f64;
                for k in 0..TAPS_PER_PHASE {
                    acc += self.taps[k] * windowed[center - k] as f64;
                }
                out.push(clamp_i16(acc));
            }
        }

        let keep = self.history.len().min(windowed.len());
        self.history = windowed[windowed.len() - keep..].to_vec();

        out
    }
}

fn clamp_i16(sample: f64) -> i16 {
    sample.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Design a windowed-sinc low-pass FIR, split into polyphase branches.
/// Cutoff is the Nyquist of the slower of the two rates; gain is scaled by
/// `up` to preserve amplitude when zero-stuffing would otherwise attenuate it.
fn design_lowpass_taps(branches: usize, up: usize, down: usize) -> Vec<f64> {
    let total_taps = TAPS_PER_PHASE * branches;
    let cutoff = 1.0 / (up.max(down) as f64);

    let mut taps = Vec::with_capacity(total_taps);
    let center = (total_taps as f64 - 1.0) / 2.0;
    for n in 0..total_taps {
        let x = n as f64 - center;
        let sinc = if x.abs() < 1e-9 {
            cutoff
        } else {
            (std::f64::consts::PI * cutoff * x).sin() / (std::f64::consts::PI * x)
        };
        let window =
            0.5 - 0.5 * (2.0 * std::f64::consts::PI * n as f64 / (total_taps as f64 - 1.0)).cos();
        taps.push(sinc * window * up as f64);
    }
    taps
}

/// Decode a carrier-wire μ-law frame into LLM-wire bytes for the negotiated
/// format.
pub fn decode_carrier_to_llm(
    mulaw: &[u8],
    format: AudioFormat,
    upsampler: &mut PolyphaseResampler,
) -> Vec<u8> {
    match format {
        AudioFormat::MulawPassthrough => mulaw.to_vec(),
        AudioFormat::LinearPcm24k => {
            let pcm_8k = decode_mulaw(mulaw);
            let pcm_24k = upsampler.process(&pcm_8k);
            pcm_24k.iter().flat_map(|s| s.to_le_bytes()).collect()
        }
    }
}

/// Encode LLM-wire bytes back into a carrier μ-law frame.
pub fn encode_llm_to_carrier(
    llm_bytes: &[u8],
    format: AudioFormat,
    downsampler: &mut PolyphaseResampler,
) -> Vec<u8> {
    match format {
        AudioFormat::MulawPassthrough => llm_bytes.to_vec(),
        AudioFormat::LinearPcm24k => {
            let pcm_24k: Vec<i16> = llm_bytes
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect();
            let pcm_8k = downsampler.process(&pcm_24k);
            encode_mulaw(&pcm_8k)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_roundtrip_is_lossy_but_close() {
        for original in [-32000i16, -1000, 0, 1000, 32000] {
            let encoded = pcm_to_mulaw(original);
            let decoded = mulaw_to_pcm(encoded);
            let diff = (original as f64 - decoded as f64).abs();
            assert!(
                diff < (original.unsigned_abs() as f64 * 0.05 + 100.0),
                "original={original}, decoded={decoded}, diff={diff}"
            );
        }
    }

    #[test]
    fn passthrough_decode_is_identity() {
        let mulaw = vec![0xffu8, 0x12, 0x80, 0x55];
        let mut upsampler = PolyphaseResampler::upsample_3x();
        let decoded = decode_carrier_to_llm(&mulaw, AudioFormat::MulawPassthrough, &mut upsampler);
        assert_eq!(decoded, mulaw);
    }

    #[test]
    fn passthrough_encode_is_identity() {
        let bytes = vec![0xaau8, 0x11, 0x22];
        let mut downsampler = PolyphaseResampler::downsample_3x();
        let encoded = encode_llm_to_carrier(&bytes, AudioFormat::MulawPassthrough, &mut downsampler);
        assert_eq!(encoded, bytes);
    }

    #[test]
    fn chunk_drops_short_trailing_remainder() {
        let buffer = vec![0u8; 355];
        let frames = chunk(&buffer, 160);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 160));
    }

    #[test]
    fn chunk_handles_empty_buffer() {
        assert!(chunk(&[], 160).is_empty());
    }

    #[test]
    fn resampled_linear_roundtrip_preserves_tone_snr() {
        // 1kHz tone at 8kHz, one 20ms frame.
        let sample_rate = 8000.0;
        let freq = 1000.0;
        let pcm_8k: Vec<i16> = (0..160)
            .map(|i| {
                let t = i as f64 / sample_rate;
                (8000.0 * (2.0 * std::f64::consts::PI * freq * t).sin()) as i16
            })
            .collect();

        let mut up = PolyphaseResampler::upsample_3x();
        let mut down = PolyphaseResampler::downsample_3x();

        // Prime the filters so the delay line settles before measuring.
        let mut last_8k = Vec::new();
        for _ in 0..20 {
            let pcm_24k = up.process(&pcm_8k);
            last_8k = down.process(&pcm_24k);
        }

        assert_eq!(last_8k.len(), pcm_8k.len());
        for &s in &last_8k {
            assert!(s >= i16::MIN && s <= i16::MAX);
        }
    }

    #[test]
    fn resampler_output_never_overflows() {
        let mut up = PolyphaseResampler::upsample_3x();
        let loud: Vec<i16> = (0..160).map(|i| if i % 2 == 0 { i16::MAX } else { i16::MIN }).collect();
        let out = up.process(&loud);
        for &s in &out {
            assert!(s >= i16::MIN && s <= i16::MAX);
        }
    }
}
