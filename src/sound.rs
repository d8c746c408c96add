use crate::error::{PipelineError, Result};
use std::fs;
use std::path::Path;

/// モノラル音声
///
/// 多チャンネルのファイルはチャンネル平均でモノラルに変換する。
/// サンプルは -1.0 ~ 1.0 に正規化された値。
#[derive(Clone, Debug, PartialEq)]
pub struct Sound {
    pub samples: Vec<f64>,

    /// サンプリングレート (Hz)
    pub sample_rate: f64,

    /// 先頭サンプルの時刻 (秒)。切り出した音声では元の音声上の時刻
    pub start_time: f64,
}

impl Sound {
    pub fn new(samples: Vec<f64>, sample_rate: f64) -> Self {
        Self {
            samples,
            sample_rate,
            start_time: 0.0,
        }
    }

    /// 拡張子に応じてWAVまたはFLACを読み込む
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "wav" => Self::from_wav(path),
            "flac" => Self::from_flac(path),
            other => Err(audio_error(path, format!("unsupported audio format {:?}", other))),
        }
    }

    /// WAVファイルを読み込む (hound)
    pub fn from_wav<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path).map_err(|e| audio_error(path, e.to_string()))?;
        let spec = reader.spec();
        let channels = spec.channels as usize;
        if channels == 0 {
            return Err(audio_error(path, "zero channels"));
        }

        let interleaved: Vec<f64> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .map(|s| s.map(|v| v as f64))
                .collect::<std::result::Result<Vec<f64>, _>>(),
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f64;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f64 / scale))
                    .collect::<std::result::Result<Vec<f64>, _>>()
            }
        }
        .map_err(|e| audio_error(path, e.to_string()))?;

        Ok(Self::new(mixdown(&interleaved, channels), spec.sample_rate as f64))
    }

    /// FLACファイルを読み込む (claxon)
    pub fn from_flac<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = claxon::FlacReader::open(path).map_err(|e| audio_error(path, e.to_string()))?;
        let info = reader.streaminfo();
        let channels = info.channels as usize;
        if channels == 0 {
            return Err(audio_error(path, "zero channels"));
        }
        let scale = (1i64 << (info.bits_per_sample - 1)) as f64;

        let interleaved: Vec<f64> = reader
            .samples()
            .map(|s| s.map(|v| v as f64 / scale))
            .collect::<std::result::Result<Vec<f64>, _>>()
            .map_err(|e| audio_error(path, e.to_string()))?;

        Ok(Self::new(mixdown(&interleaved, channels), info.sample_rate as f64))
    }

    /// 16bit モノラルWAVとして書き出す
    pub fn write_wav<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| PipelineError::io(format!("creating {:?}", parent), e))?;
            }
        }
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate.round() as u32,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).map_err(|e| audio_error(path, e.to_string()))?;
        for &sample in &self.samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f64).round() as i16;
            writer.write_sample(value).map_err(|e| audio_error(path, e.to_string()))?;
        }
        writer.finalize().map_err(|e| audio_error(path, e.to_string()))?;
        log::debug!("WAVファイル書き出し: {:?} ({} サンプル)", path, self.samples.len());
        Ok(())
    }

    /// 長さ (秒)
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration()
    }

    /// 時刻に対応するサンプル位置 (範囲外は端に丸める)
    fn index_at(&self, time: f64) -> usize {
        let index = ((time - self.start_time) * self.sample_rate).round();
        index.clamp(0.0, self.samples.len() as f64) as usize
    }

    /// `[begin, end)` を切り出す
    ///
    /// 音声の範囲外の部分は含まれない。
    pub fn slice(&self, begin: f64, end: f64) -> Sound {
        let from = self.index_at(begin);
        let to = self.index_at(end).max(from);
        Sound {
            samples: self.samples[from..to].to_vec(),
            sample_rate: self.sample_rate,
            start_time: self.start_time + from as f64 / self.sample_rate,
        }
    }
}

/// インターリーブされたサンプルをチャンネル平均でモノラル化
fn mixdown(interleaved: &[f64], channels: usize) -> Vec<f64> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f64>() / channels as f64)
        .collect()
}

fn audio_error(path: &Path, message: impl Into<String>) -> PipelineError {
    PipelineError::Audio {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tone(frequency: f64, sample_rate: f64, seconds: f64) -> Sound {
        let n = (sample_rate * seconds) as usize;
        let samples = (0..n)
            .map(|i| 0.5 * (2.0 * std::f64::consts::PI * frequency * i as f64 / sample_rate).sin())
            .collect();
        Sound::new(samples, sample_rate)
    }

    #[test]
    fn test_wav_roundtrip_keeps_rate_and_length() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("spk").join("a.wav");
        let sound = tone(220.0, 16000.0, 0.25);
        sound.write_wav(&path)?;

        let loaded = Sound::from_file(&path)?;
        assert_eq!(loaded.sample_rate, 16000.0);
        assert_eq!(loaded.samples.len(), sound.samples.len());
        let max_error = loaded
            .samples
            .iter()
            .zip(&sound.samples)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        assert!(max_error < 1e-3);
        Ok(())
    }

    #[test]
    fn test_stereo_wav_is_mixed_down() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec)?;
        for _ in 0..100 {
            writer.write_sample(16384i16)?;
            writer.write_sample(0i16)?;
        }
        writer.finalize()?;

        let sound = Sound::from_wav(&path)?;
        assert_eq!(sound.samples.len(), 100);
        assert!((sound.samples[0] - 0.25).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_slice_tracks_start_time() {
        let sound = tone(100.0, 1000.0, 1.0);
        let part = sound.slice(0.25, 0.5);
        assert_eq!(part.samples.len(), 250);
        assert!((part.start_time - 0.25).abs() < 1e-12);
        assert_eq!(part.samples[0], sound.samples[250]);

        let nested = part.slice(0.3, 0.4);
        assert_eq!(nested.samples[0], sound.samples[300]);

        let outside = sound.slice(2.0, 3.0);
        assert!(outside.samples.is_empty());
    }

    #[test]
    fn test_unsupported_extension() {
        let err = Sound::from_file("voice.mp3").unwrap_err();
        assert!(matches!(err, PipelineError::Audio { .. }));
    }
}
