//! Audio processing for streamed TTS output

mod combiner;
mod crossfade;
pub mod wav;

pub use combiner::{combine, CombinedTrack, SegmentTiming};
pub use crossfade::{apply_crossfade, CrossfadeConfig, CrossfadeState};
pub use wav::{
    decode_base64_to_pcm_bytes, decode_wav, encode_wav, ensure_wav, f32_to_pcm16, is_wav,
    pcm16_to_f32, wav_sample_rate, Pcm,
};
