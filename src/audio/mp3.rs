//! MP3 encoding via libmp3lame, plus the base64 data-URI wrapper used on the wire.

use base64::Engine;
use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, InterleavedPcm, Quality};

use super::AudioSegment;
use crate::{Error, Result};

/// Prefix of every encoded clip returned to callers.
pub const MP3_DATA_URI_PREFIX: &str = "data:audio/mpeg;base64,";

/// Encode a segment as MP3.
///
/// LAME is always driven in stereo; mono input is duplicated to both channels.
/// The bitrate is 192 kbps at 32 kHz and above, lower for the MPEG-2/2.5 rates.
pub fn encode_mp3(segment: &AudioSegment) -> Result<Vec<u8>> {
    if segment.num_frames() == 0 {
        return Err(Error::EncodingFailed("cannot encode an empty segment".into()));
    }

    let stereo: Vec<f32> = match segment.channels() {
        1 => segment.samples().iter().flat_map(|&s| [s, s]).collect(),
        2 => segment.samples().to_vec(),
        n => {
            return Err(Error::EncodingFailed(format!(
                "MP3 encoder supports mono or stereo, got {n} channels"
            )));
        }
    };

    let mut encoder = Builder::new()
        .ok_or_else(|| Error::EncodingFailed("failed to create LAME encoder".into()))?
        .with_num_channels(2)
        .map_err(|e| Error::EncodingFailed(format!("LAME set_num_channels failed: {e:?}")))?
        .with_sample_rate(segment.sample_rate())
        .map_err(|e| Error::EncodingFailed(format!("LAME set_sample_rate failed: {e:?}")))?
        .with_brate(bitrate_for(segment.sample_rate()))
        .map_err(|e| Error::EncodingFailed(format!("LAME set_brate failed: {e:?}")))?
        .with_quality(Quality::Best)
        .map_err(|e| Error::EncodingFailed(format!("LAME set_quality failed: {e:?}")))?
        .build()
        .map_err(|e| Error::EncodingFailed(format!("LAME build failed: {e:?}")))?;

    let mut buf = Vec::new();
    buf.reserve(mp3lame_encoder::max_required_buffer_size(
        segment.num_frames(),
    ));

    let encoded_size = encoder
        .encode(InterleavedPcm(&stereo), buf.spare_capacity_mut())
        .map_err(|e| Error::EncodingFailed(format!("LAME encode failed: {e:?}")))?;
    // SAFETY: encode filled exactly `encoded_size` bytes into spare capacity.
    unsafe { buf.set_len(encoded_size) };

    let flush_size = encoder
        .flush::<FlushNoGap>(buf.spare_capacity_mut())
        .map_err(|e| Error::EncodingFailed(format!("LAME flush failed: {e:?}")))?;
    // SAFETY: flush filled exactly `flush_size` bytes into spare capacity.
    unsafe { buf.set_len(buf.len() + flush_size) };

    if buf.is_empty() {
        return Err(Error::EncodingFailed("LAME produced no output".into()));
    }
    Ok(buf)
}

fn bitrate_for(sample_rate: u32) -> Bitrate {
    match sample_rate {
        32000.. => Bitrate::Kbps192,
        16000.. => Bitrate::Kbps128,
        _ => Bitrate::Kbps64,
    }
}

/// Encode a segment as MP3 and wrap it as `data:audio/mpeg;base64,<payload>`.
pub fn mp3_data_uri(segment: &AudioSegment) -> Result<String> {
    let bytes = encode_mp3(segment)?;
    let payload = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("{MP3_DATA_URI_PREFIX}{payload}"))
}
