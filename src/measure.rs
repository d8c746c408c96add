use crate::config::LpcConfig;
use crate::error::{PipelineError, Result};
use crate::sound::Sound;
use crate::types::{Interval, TrackPoint};
use num_complex::Complex64;
use rubato::{FftFixedIn, Resampler};
use std::f64::consts::PI;

/// 候補の1フレーム
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateFrame {
    /// 音素内の相対時刻 (0.0 ~ 1.0)
    pub time: f64,

    /// F1, F2, ... の順のフォルマント周波数 (Hz)
    pub formants: Vec<f64>,
}

/// フォルマント候補
///
/// 同じ音声区間に対する、フォルマント番号の割り当て方の1つ。
#[derive(Clone, Debug, PartialEq)]
pub struct FormantCandidate {
    /// 識別子 (例: `lpc5`, `lpc5-skip`)
    pub id: String,
    pub frames: Vec<CandidateFrame>,
}

impl FormantCandidate {
    pub fn new(id: impl Into<String>, frames: Vec<CandidateFrame>) -> Self {
        Self {
            id: id.into(),
            frames,
        }
    }

    /// 相対時刻 `time` における第 `n` フォルマント (1始まり)
    ///
    /// 前後のフレームから線形補間する。範囲外は端のフレームの値。
    pub fn formant_at(&self, n: usize, time: f64) -> Option<f64> {
        let points: Vec<(f64, f64)> = self
            .frames
            .iter()
            .filter_map(|f| f.formants.get(n.checked_sub(1)?).map(|&v| (f.time, v)))
            .collect();
        interpolate(&points, time)
    }

    /// `count` 点の等間隔な相対時刻で再サンプリングした軌跡
    pub fn track(&self, count: usize) -> Vec<TrackPoint> {
        (0..count)
            .map(|i| {
                let time = if count > 1 {
                    i as f64 / (count - 1) as f64
                } else {
                    0.5
                };
                TrackPoint {
                    time,
                    f1: self.formant_at(1, time),
                    f2: self.formant_at(2, time),
                    f3: self.formant_at(3, time),
                }
            })
            .collect()
    }
}

/// 時刻順の `(時刻, 値)` 列の線形補間
fn interpolate(points: &[(f64, f64)], time: f64) -> Option<f64> {
    let first = points.first()?;
    let last = points.last()?;
    if time <= first.0 {
        return Some(first.1);
    }
    if time >= last.0 {
        return Some(last.1);
    }
    let after = points.partition_point(|p| p.0 <= time);
    let (t0, v0) = points[after - 1];
    let (t1, v1) = points[after];
    if t1 - t0 <= 0.0 {
        return Some(v0);
    }
    Some(v0 + (v1 - v0) * (time - t0) / (t1 - t0))
}

/// フォルマント測定器の共通トレイト
///
/// 区間ごとに複数の候補を返す。先頭 (インデックス0) の候補は
/// 低い方からN個のピークをF1..FNとする素朴な割り当てであること。
pub trait FormantMeasurer: Send + Sync {
    /// 測定器の名前 (ログ用)
    fn name(&self) -> &str;

    /// `interval` の区間を測定して候補を返す
    ///
    /// # Errors
    ///
    /// 音声が区間を含まない場合などは `MeasurementUnavailable`。
    fn measure(&self, sound: &Sound, interval: &Interval) -> Result<Vec<FormantCandidate>>;
}

/// Burg法LPCによるフォルマント測定器
///
/// # アルゴリズム
///
/// 1. 区間の前後に窓長分の余白を付けて切り出し
/// 2. `2 × max_formant_hz` にリサンプリング (rubato)
/// 3. プリエンファシス
/// 4. 各フレームにガウス窓を掛け、Burg法でLPC係数を推定
/// 5. LPC多項式の根 (上半平面) の偏角をフォルマント周波数とする
///
/// 候補は `num_formants` の各値について1つずつ (先頭が既定値)、
/// さらに既定値について最も低いピークを飛ばした割り当てを1つ加える。
pub struct LpcFormantMeasurer {
    config: LpcConfig,
}

/// rubato に渡す入力チャンクの最大長 (サンプル)
const RESAMPLE_CHUNK: usize = 1024;

/// 探索するフォルマント周波数の下限 (Hz)
const MIN_FORMANT_HZ: f64 = 50.0;

impl LpcFormantMeasurer {
    pub fn new(config: &LpcConfig) -> Result<Self> {
        if config.num_formants.is_empty() || config.num_formants.contains(&0) {
            return Err(PipelineError::configuration(
                "formants.lpc.num_formants must list at least one positive count",
            ));
        }
        if config.max_formant_hz <= MIN_FORMANT_HZ * 2.0 || config.window_length <= 0.0 || config.time_step <= 0.0 {
            return Err(PipelineError::configuration(
                "formants.lpc needs positive window_length/time_step and max_formant_hz > 100",
            ));
        }
        Ok(Self { config: config.clone() })
    }

    /// 1フレーム分のフォルマント周波数 (Hz、昇順)
    fn frame_peaks(&self, frame: &[f64], sample_rate: f64, order: usize) -> Vec<f64> {
        let coefficients = burg_lpc(frame, order);
        root_frequencies(&coefficients, sample_rate, MIN_FORMANT_HZ, self.config.max_formant_hz - MIN_FORMANT_HZ)
    }
}

impl FormantMeasurer for LpcFormantMeasurer {
    fn name(&self) -> &str {
        "lpc-burg"
    }

    fn measure(&self, sound: &Sound, interval: &Interval) -> Result<Vec<FormantCandidate>> {
        if !interval.is_well_formed() {
            return Err(PipelineError::malformed(interval, "begin >= end"));
        }
        let margin = self.config.window_length;
        let excerpt = sound.slice(interval.begin - margin, interval.end + margin);
        if excerpt.samples.is_empty()
            || excerpt.start_time > interval.begin + 1e-3
            || excerpt.end_time() < interval.end - 1e-3
        {
            return Err(PipelineError::unavailable(interval, "interval lies outside the audio"));
        }

        let target_rate = 2.0 * self.config.max_formant_hz;
        let (samples, sample_rate) = if target_rate < excerpt.sample_rate {
            (resample(&excerpt.samples, excerpt.sample_rate, target_rate), target_rate)
        } else {
            (excerpt.samples.clone(), excerpt.sample_rate)
        };
        let emphasized = pre_emphasize(&samples, sample_rate, self.config.pre_emphasis_from);

        // 実際の窓長は設定値の2倍 (ガウス窓の有効長に合わせる)
        let mut window_samples = (2.0 * self.config.window_length * sample_rate).round() as usize;
        if window_samples % 2 == 0 {
            window_samples += 1;
        }
        let window = gaussian_window(window_samples);
        let half = window_samples / 2;

        let duration = interval.duration();
        let n_frames = ((duration / self.config.time_step).floor() as usize).max(1);
        let first = interval.begin + (duration - (n_frames - 1) as f64 * self.config.time_step) / 2.0;

        let frames: Vec<(f64, Vec<f64>)> = (0..n_frames)
            .map(|i| {
                let t = first + i as f64 * self.config.time_step;
                let center = ((t - excerpt.start_time) * sample_rate).round() as isize;
                let windowed: Vec<f64> = (0..window_samples)
                    .map(|k| {
                        let index = center - half as isize + k as isize;
                        let sample = if index >= 0 {
                            emphasized.get(index as usize).copied().unwrap_or(0.0)
                        } else {
                            0.0
                        };
                        sample * window[k]
                    })
                    .collect();
                ((t - interval.begin) / duration, windowed)
            })
            .collect();

        let mut candidates = Vec::new();
        let mut assign = |id: String, order: usize, skip: usize, keep: usize| {
            let candidate_frames: Vec<CandidateFrame> = frames
                .iter()
                .map(|(time, windowed)| CandidateFrame {
                    time: time.clamp(0.0, 1.0),
                    formants: self
                        .frame_peaks(windowed, sample_rate, order)
                        .into_iter()
                        .skip(skip)
                        .take(keep)
                        .collect(),
                })
                .collect();
            if candidate_frames.iter().any(|f| f.formants.len() >= 2) {
                candidates.push(FormantCandidate::new(id, candidate_frames));
            }
        };

        for &count in &self.config.num_formants {
            assign(format!("lpc{}", count), 2 * count, 0, count);
        }
        let default_count = self.config.num_formants[0];
        assign(format!("lpc{}-skip", default_count), 2 * (default_count + 1), 1, default_count);

        Ok(candidates)
    }
}

/// ガウス窓
fn gaussian_window(n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0];
    }
    let alpha = 12.0;
    let mid = (n - 1) as f64 / 2.0;
    (0..n)
        .map(|i| {
            let x = (i as f64 - mid) / mid;
            (-alpha * x * x).exp()
        })
        .collect()
}

/// プリエンファシス: `x'[i] = x[i] - α x[i-1]`, `α = exp(-2π F Δt)`
fn pre_emphasize(samples: &[f64], sample_rate: f64, from_hz: f64) -> Vec<f64> {
    let alpha = (-2.0 * PI * from_hz / sample_rate).exp();
    let mut out = Vec::with_capacity(samples.len());
    let mut previous = 0.0;
    for (i, &s) in samples.iter().enumerate() {
        out.push(if i == 0 { s } else { s - alpha * previous });
        previous = s;
    }
    out
}

/// Burg法によるLPC係数 (`a[0] = 1.0`)
fn burg_lpc(samples: &[f64], order: usize) -> Vec<f64> {
    let n = samples.len();
    let mut a = vec![0.0; order + 1];
    a[0] = 1.0;
    if n <= order {
        return a;
    }

    let mut forward = samples.to_vec();
    let mut backward = samples.to_vec();

    for k in 1..=order {
        let mut num = 0.0;
        let mut den = 0.0;
        for i in k..n {
            num += forward[i] * backward[i - 1];
            den += forward[i] * forward[i] + backward[i - 1] * backward[i - 1];
        }
        if den < 1e-30 {
            break;
        }
        let reflection = -2.0 * num / den;

        // 後ろから更新すれば backward[i - 1] は未更新の値のまま使える
        for i in (k..n).rev() {
            let f = forward[i];
            forward[i] = f + reflection * backward[i - 1];
            backward[i] = backward[i - 1] + reflection * f;
        }

        let previous = a.clone();
        for i in 1..k {
            a[i] = previous[i] + reflection * previous[k - i];
        }
        a[k] = reflection;
    }
    a
}

/// LPC多項式の根からフォルマント周波数を求める
///
/// 上半平面の根 `z` について `arg(z) × fs / 2π` を取り、`[low_hz, high_hz]` の範囲に
/// 入るものを昇順で返す。
fn root_frequencies(a: &[f64], sample_rate: f64, low_hz: f64, high_hz: f64) -> Vec<f64> {
    if a.iter().skip(1).all(|&c| c == 0.0) || high_hz <= low_hz {
        return Vec::new();
    }
    let mut frequencies: Vec<f64> = lpc_roots(a)
        .into_iter()
        .filter(|z| z.im > 0.0)
        .map(|z| z.arg() * sample_rate / (2.0 * PI))
        .filter(|f| (low_hz..=high_hz).contains(f))
        .collect();
    frequencies.sort_by(|x, y| x.total_cmp(y));
    frequencies
}

/// `A(z) = z^p + a[1] z^{p-1} + ... + a[p]` とその導関数の値 (ホーナー法)
fn eval_polynomial(a: &[f64], z: Complex64) -> (Complex64, Complex64) {
    let mut value = Complex64::new(0.0, 0.0);
    let mut derivative = Complex64::new(0.0, 0.0);
    for &c in a {
        derivative = derivative * z + value;
        value = value * z + c;
    }
    (value, derivative)
}

/// LPC多項式の根
///
/// Durand-Kerner 法で全根を同時に求め、ニュートン法で磨いたあと
/// 単位円の外の根は `1 / conj(z)` で内側に折り返す。
fn lpc_roots(a: &[f64]) -> Vec<Complex64> {
    let order = a.len().saturating_sub(1);
    if order == 0 {
        return Vec::new();
    }

    let seed = Complex64::new(0.4, 0.9);
    let mut roots: Vec<Complex64> = (0..order).map(|k| seed.powu(k as u32 + 1)).collect();
    for _ in 0..500 {
        let mut largest_step: f64 = 0.0;
        for k in 0..order {
            let (value, _) = eval_polynomial(a, roots[k]);
            let denominator = (0..order)
                .filter(|&j| j != k)
                .fold(Complex64::new(1.0, 0.0), |acc, j| acc * (roots[k] - roots[j]));
            if denominator.norm() < 1e-300 {
                continue;
            }
            let step = value / denominator;
            roots[k] -= step;
            largest_step = largest_step.max(step.norm());
        }
        if largest_step < 1e-12 {
            break;
        }
    }

    for root in roots.iter_mut() {
        *root = polish_root(a, *root, 10, 1e-10);
        let r = root.norm();
        if r > 1.0 {
            *root = root.conj() / (r * r);
        }
    }
    roots
}

/// ニュートン法による根の改良
fn polish_root(a: &[f64], mut z: Complex64, max_iter: usize, tol: f64) -> Complex64 {
    for _ in 0..max_iter {
        let (value, derivative) = eval_polynomial(a, z);
        if derivative.norm() < 1e-30 {
            break;
        }
        let delta = value / derivative;
        z -= delta;
        if delta.norm() < tol * z.norm() {
            break;
        }
    }
    z
}

/// 帯域制限リサンプリング
///
/// rubato の FFT リサンプラーを使い、出力遅延の分を先頭から捨てて時刻を揃える。
/// リサンプラーを作れない場合は線形補間にフォールバックする。
fn resample(samples: &[f64], old_rate: f64, new_rate: f64) -> Vec<f64> {
    if samples.is_empty() || (old_rate - new_rate).abs() < 1e-6 {
        return samples.to_vec();
    }
    let new_length = (samples.len() as f64 * new_rate / old_rate).floor() as usize;
    if new_length == 0 {
        return Vec::new();
    }

    let mut resampler = match FftFixedIn::<f64>::new(
        old_rate.round() as usize,
        new_rate.round() as usize,
        RESAMPLE_CHUNK.min(samples.len()),
        2,
        1,
    ) {
        Ok(r) => r,
        Err(e) => {
            log::debug!("FFTリサンプラーを作成できないため線形補間を使用: {}", e);
            return linear_resample(samples, new_length);
        }
    };

    let delay = resampler.output_delay();
    let wanted = delay + new_length;
    // 遅延分を押し出すために入力の後ろを無音で延長する (上限付き)
    let input_limit = samples.len() + ((delay + 1) as f64 * old_rate / new_rate).ceil() as usize + 4 * RESAMPLE_CHUNK;

    let mut output = Vec::with_capacity(wanted);
    let mut pos = 0;
    while output.len() < wanted && pos < input_limit {
        let chunk_size = resampler.input_frames_next();
        let mut chunk: Vec<f64> = samples.iter().skip(pos).take(chunk_size).copied().collect();
        chunk.resize(chunk_size, 0.0);
        pos += chunk_size;

        let input = vec![chunk];
        match resampler.process(&input, None) {
            Ok(mut channels) => match channels.first_mut() {
                Some(channel) => output.append(channel),
                None => break,
            },
            Err(e) => {
                log::debug!("FFTリサンプリングに失敗したため線形補間を使用: {}", e);
                return linear_resample(samples, new_length);
            }
        }
    }

    output.drain(..delay.min(output.len()));
    output.resize(new_length, 0.0);
    output
}

/// 線形補間によるリサンプリング (両端のサンプルを保つ)
fn linear_resample(samples: &[f64], new_length: usize) -> Vec<f64> {
    if samples.is_empty() || new_length == 0 {
        return Vec::new();
    }
    let step = (samples.len() - 1) as f64 / (new_length - 1).max(1) as f64;
    (0..new_length)
        .map(|i| {
            let position = i as f64 * step;
            let index = position.floor() as usize;
            let fraction = position - index as f64;
            match (samples.get(index), samples.get(index + 1)) {
                (Some(&x0), Some(&x1)) => x0 + (x1 - x0) * fraction,
                (Some(&x0), None) => x0,
                _ => 0.0,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2つの正弦波と小さな擬似乱数ノイズ
    fn two_tones(f1: f64, f2: f64, sample_rate: f64, seconds: f64) -> Sound {
        let n = (sample_rate * seconds) as usize;
        let mut seed: u32 = 12345;
        let samples = (0..n)
            .map(|i| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
                let noise = ((seed >> 16) as f64 / 32768.0 - 1.0) * 1e-3;
                let t = i as f64 / sample_rate;
                0.4 * (2.0 * PI * f1 * t).sin() + 0.2 * (2.0 * PI * f2 * t).sin() + noise
            })
            .collect();
        Sound::new(samples, sample_rate)
    }

    fn rms(samples: &[f64]) -> f64 {
        (samples.iter().map(|x| x * x).sum::<f64>() / samples.len() as f64).sqrt()
    }

    fn config(num_formants: Vec<usize>) -> LpcConfig {
        LpcConfig {
            num_formants,
            ..LpcConfig::default()
        }
    }

    #[test]
    fn test_burg_recovers_sinusoid_peaks() {
        let sound = two_tones(500.0, 1500.0, 11000.0, 0.3);
        let measurer = LpcFormantMeasurer::new(&config(vec![2])).unwrap();
        let candidates = measurer.measure(&sound, &Interval::new("a", 0.1, 0.2)).unwrap();

        assert_eq!(candidates[0].id, "lpc2");
        let f1 = candidates[0].formant_at(1, 0.5).unwrap();
        let f2 = candidates[0].formant_at(2, 0.5).unwrap();
        assert!((f1 - 500.0).abs() < 40.0, "F1 = {}", f1);
        assert!((f2 - 1500.0).abs() < 60.0, "F2 = {}", f2);
    }

    #[test]
    fn test_silence_yields_no_candidates() {
        let sound = Sound::new(vec![0.0; 11000], 11000.0);
        let measurer = LpcFormantMeasurer::new(&config(vec![5, 4])).unwrap();
        let candidates = measurer.measure(&sound, &Interval::new("a", 0.4, 0.5)).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_interval_outside_audio_is_unavailable() {
        let sound = Sound::new(vec![0.0; 1000], 10000.0);
        let measurer = LpcFormantMeasurer::new(&LpcConfig::default()).unwrap();
        let err = measurer.measure(&sound, &Interval::new("a", 0.5, 0.6)).unwrap_err();
        assert!(matches!(err, PipelineError::MeasurementUnavailable { .. }));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(LpcFormantMeasurer::new(&config(vec![])).is_err());
        assert!(LpcFormantMeasurer::new(&config(vec![5, 0])).is_err());
    }

    #[test]
    fn test_candidate_interpolation_and_track() {
        let candidate = FormantCandidate::new(
            "c",
            vec![
                CandidateFrame { time: 0.0, formants: vec![400.0, 1400.0] },
                CandidateFrame { time: 1.0, formants: vec![600.0, 1600.0, 2500.0] },
            ],
        );
        assert_eq!(candidate.formant_at(1, 0.5), Some(500.0));
        assert_eq!(candidate.formant_at(2, 0.25), Some(1450.0));
        // F3 は1フレームのみ
        assert_eq!(candidate.formant_at(3, 0.0), Some(2500.0));
        assert_eq!(candidate.formant_at(4, 0.5), None);
        assert_eq!(candidate.formant_at(0, 0.5), None);

        let track = candidate.track(21);
        assert_eq!(track.len(), 21);
        assert_eq!(track[0].time, 0.0);
        assert_eq!(track[20].time, 1.0);
        assert_eq!(track[10].f1, Some(500.0));
    }

    #[test]
    fn test_resample_preserves_low_frequency_tone() {
        let rate = 44100.0;
        let samples: Vec<f64> = (0..4410).map(|i| (2.0 * PI * 300.0 * i as f64 / rate).sin()).collect();
        let out = resample(&samples, rate, 11000.0);
        assert_eq!(out.len(), 1100);
        let level = rms(&out[200..900]);
        assert!((level - 0.5f64.sqrt()).abs() < 0.05, "rms = {}", level);
    }

    #[test]
    fn test_resample_removes_tone_above_new_nyquist() {
        let rate = 44100.0;
        let samples: Vec<f64> = (0..4410).map(|i| (2.0 * PI * 8000.0 * i as f64 / rate).sin()).collect();
        let out = resample(&samples, rate, 11000.0);
        assert_eq!(out.len(), 1100);
        assert!(rms(&out[200..900]) < 0.05);
    }

    #[test]
    fn test_linear_resample_keeps_endpoints() {
        let out = linear_resample(&[0.0, 1.0, 2.0, 3.0], 7);
        assert_eq!(out.len(), 7);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[3], 1.5);
        assert_eq!(out[6], 3.0);
    }

    #[test]
    fn test_lpc_roots_of_resonator() {
        // z^2 - 2 r cos(θ) z + r^2 の根は r e^{±iθ}
        let (r, theta): (f64, f64) = (0.95, 0.6);
        let a = [1.0, -2.0 * r * theta.cos(), r * r];
        let roots = lpc_roots(&a);
        assert_eq!(roots.len(), 2);
        let upper = roots.iter().find(|z| z.im > 0.0).unwrap();
        assert!((upper.norm() - r).abs() < 1e-9);
        assert!((upper.arg() - theta).abs() < 1e-9);

        let frequencies = root_frequencies(&a, 10000.0, 50.0, 4950.0);
        assert_eq!(frequencies.len(), 1);
        assert!((frequencies[0] - theta * 10000.0 / (2.0 * PI)).abs() < 1e-6);
    }

    #[test]
    fn test_unstable_roots_are_reflected() {
        // 根 1.25 と 0.5: 1.25 は 0.8 に折り返される
        let a = [1.0, -1.75, 0.625];
        let mut magnitudes: Vec<f64> = lpc_roots(&a).iter().map(|z| z.norm()).collect();
        magnitudes.sort_by(|x, y| x.total_cmp(y));
        assert!((magnitudes[0] - 0.5).abs() < 1e-9);
        assert!((magnitudes[1] - 0.8).abs() < 1e-9);
    }
}
