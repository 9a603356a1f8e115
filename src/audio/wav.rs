//! WAV file I/O for [`AudioSegment`]s.

use std::path::Path;

use super::AudioSegment;
use crate::{Error, Result};

/// Read a WAV file into a segment.
///
/// Integer PCM is scaled into [-1, 1]; float PCM is taken as is.
pub fn read_wav(path: impl AsRef<Path>) -> Result<AudioSegment> {
    let path = path.as_ref();
    let reader = hound::WavReader::open(path)
        .map_err(|e| Error::Asset(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>(),
        hound::SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()
        }
    }
    .map_err(|e| Error::Asset(format!("{}: {e}", path.display())))?;

    AudioSegment::new(samples, spec.sample_rate, spec.channels)
}

/// Write a segment as a 32-bit float WAV file.
pub fn write_wav(path: impl AsRef<Path>, segment: &AudioSegment) -> Result<()> {
    let spec = hound::WavSpec {
        channels: segment.channels(),
        sample_rate: segment.sample_rate(),
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in segment.samples() {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wav");
        let original =
            AudioSegment::new(vec![0.0f32, 0.5, -0.5, 1.0, -1.0, 0.25], 44100, 2).unwrap();
        write_wav(&path, &original).unwrap();
        let loaded = read_wav(&path).unwrap();
        assert_eq!(loaded.sample_rate(), 44100);
        assert_eq!(loaded.channels(), 2);
        assert_eq!(loaded.samples().len(), original.samples().len());
        for (a, b) in loaded.samples().iter().zip(original.samples()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_read_int_pcm_is_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("int.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(16384i16).unwrap();
        writer.write_sample(-32768i16).unwrap();
        writer.finalize().unwrap();

        let loaded = read_wav(&path).unwrap();
        assert!((loaded.samples()[0] - 0.5).abs() < 1e-6);
        assert!((loaded.samples()[1] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_file_is_asset_error() {
        let result = read_wav("/nonexistent/clip.wav");
        assert!(matches!(result, Err(Error::Asset(_))));
    }
}
