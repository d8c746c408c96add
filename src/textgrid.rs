use crate::error::{PipelineError, Result};
use crate::types::Interval;
use regex_lite::Regex;
use std::fs;
use std::path::Path;

/// ティアの種類
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierClass {
    IntervalTier,
    TextTier,
}

/// TextGridのティア
///
/// `TextTier` (点ティア) の点は読み飛ばすため `intervals` は空になる。
#[derive(Clone, Debug, PartialEq)]
pub struct Tier {
    pub name: String,
    pub class: TierClass,
    pub intervals: Vec<Interval>,
}

/// Praat TextGrid (long形式)
#[derive(Clone, Debug, PartialEq)]
pub struct TextGrid {
    pub xmin: f64,
    pub xmax: f64,
    pub tiers: Vec<Tier>,
}

impl TextGrid {
    /// ファイルから読み込み (UTF-8 / BOM付きUTF-16)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).map_err(|e| PipelineError::io(format!("reading {:?}", path), e))?;
        let content = decode_text(&bytes);
        Self::parse(&content).map_err(|message| PipelineError::TextGrid {
            path: path.to_path_buf(),
            message,
        })
    }

    /// long形式のTextGridをパース
    ///
    /// 空ラベルの区間もそのまま保持する (ラベルは空文字列)。
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        // `key = value` 形式の行
        let assignment = Regex::new(r#"^([A-Za-z ]+?)\s*=\s*(.*?)\s*$"#).map_err(|e| e.to_string())?;

        let mut xmin: Option<f64> = None;
        let mut xmax: Option<f64> = None;
        let mut tiers: Vec<Tier> = Vec::new();

        let mut in_item = false;
        let mut in_interval = false;
        let mut cur_xmin: Option<f64> = None;
        let mut cur_xmax: Option<f64> = None;
        let mut saw_header = false;

        for (line_no, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with("item [") && line.ends_with(':') && line != "item []:" {
                in_item = true;
                in_interval = false;
                tiers.push(Tier {
                    name: String::new(),
                    class: TierClass::IntervalTier,
                    intervals: Vec::new(),
                });
                continue;
            }

            if line.starts_with("intervals [") {
                in_interval = true;
                cur_xmin = None;
                cur_xmax = None;
                continue;
            }

            if line.starts_with("points [") || line.starts_with("intervals:") || line.starts_with("points:") {
                in_interval = false;
                continue;
            }

            let Some(caps) = assignment.captures(line) else {
                continue;
            };
            let key = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let value = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

            match key {
                "Object class" => {
                    if !unquote(value).starts_with("TextGrid") {
                        return Err(format!("not a TextGrid object: {}", value));
                    }
                    saw_header = true;
                }
                "xmin" | "xmax" => {
                    let number = parse_number(value)
                        .ok_or_else(|| format!("line {}: invalid {} value {:?}", line_no + 1, key, value))?;
                    let slot = match (in_item, in_interval, key) {
                        (false, _, "xmin") => &mut xmin,
                        (false, _, _) => &mut xmax,
                        (true, true, "xmin") => &mut cur_xmin,
                        (true, true, _) => &mut cur_xmax,
                        // ティア自体の範囲は使わない
                        (true, false, _) => continue,
                    };
                    *slot = Some(number);
                }
                "class" if in_item => {
                    if let Some(tier) = tiers.last_mut() {
                        tier.class = if unquote(value) == "TextTier" {
                            TierClass::TextTier
                        } else {
                            TierClass::IntervalTier
                        };
                    }
                }
                "name" if in_item => {
                    if let Some(tier) = tiers.last_mut() {
                        tier.name = unquote(value);
                    }
                }
                "text" if in_interval => {
                    let (Some(begin), Some(end)) = (cur_xmin, cur_xmax) else {
                        return Err(format!("line {}: text before xmin/xmax", line_no + 1));
                    };
                    if let Some(tier) = tiers.last_mut() {
                        tier.intervals
                            .push(Interval::new(unquote(value).trim(), begin, end));
                    }
                    in_interval = false;
                }
                _ => {}
            }
        }

        if !saw_header {
            return Err("missing `Object class = \"TextGrid\"` header".to_string());
        }

        Ok(Self {
            xmin: xmin.unwrap_or(0.0),
            xmax: xmax.unwrap_or(0.0),
            tiers,
        })
    }

    /// 名前でティアを検索 (大文字小文字を区別しない)
    pub fn tier(&self, name: &str) -> Option<&Tier> {
        self.tiers
            .iter()
            .find(|t| t.class == TierClass::IntervalTier && t.name.eq_ignore_ascii_case(name))
    }

    /// MFAの複数話者形式 (`<話者> - words`) のティアを話者ごとに列挙
    ///
    /// 戻り値は `(話者名, 単語ティア, 音素ティア)`。
    /// 単一話者形式 (`words` / `phones`) の場合は `default_speaker` を使う。
    pub fn speaker_tiers<'a>(
        &'a self,
        words_tier: &str,
        phones_tier: &str,
        default_speaker: &str,
    ) -> Vec<(String, &'a Tier, &'a Tier)> {
        if let (Some(words), Some(phones)) = (self.tier(words_tier), self.tier(phones_tier)) {
            return vec![(default_speaker.to_string(), words, phones)];
        }

        let suffix = format!(" - {}", words_tier);
        let mut out = Vec::new();
        for tier in &self.tiers {
            if tier.class != TierClass::IntervalTier {
                continue;
            }
            let lower = tier.name.to_lowercase();
            if !lower.ends_with(&suffix.to_lowercase()) {
                continue;
            }
            let Some(speaker) = tier
                .name
                .len()
                .checked_sub(suffix.len())
                .and_then(|end| tier.name.get(..end))
            else {
                continue;
            };
            let speaker = speaker.trim().to_string();
            if let Some(phones) = self.tier(&format!("{} - {}", speaker, phones_tier)) {
                out.push((speaker, tier, phones));
            }
        }
        out
    }
}

fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok()
}

/// `"..."` を外し、`""` エスケープを戻す
fn unquote(value: &str) -> String {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(trimmed);
    inner.replace("\"\"", "\"")
}

fn decode_text(bytes: &[u8]) -> String {
    let utf16 = |data: &[u8], big_endian: bool| -> String {
        let units: Vec<u16> = data
            .chunks_exact(2)
            .map(|c| {
                if big_endian {
                    u16::from_be_bytes([c[0], c[1]])
                } else {
                    u16::from_le_bytes([c[0], c[1]])
                }
            })
            .collect();
        String::from_utf16_lossy(&units)
    };

    match bytes {
        [0xFE, 0xFF, rest @ ..] => utf16(rest, true),
        [0xFF, 0xFE, rest @ ..] => utf16(rest, false),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// テスト用にlong形式のTextGridを生成
    pub fn long_textgrid(xmax: f64, tiers: &[(&str, &[(f64, f64, &str)])]) -> String {
        let mut out = String::new();
        out.push_str("File type = \"ooTextFile\"\nObject class = \"TextGrid\"\n\n");
        out.push_str(&format!("xmin = 0\nxmax = {}\ntiers? <exists>\nsize = {}\nitem []:\n", xmax, tiers.len()));
        for (i, (name, intervals)) in tiers.iter().enumerate() {
            out.push_str(&format!("    item [{}]:\n", i + 1));
            out.push_str("        class = \"IntervalTier\"\n");
            out.push_str(&format!("        name = \"{}\"\n", name));
            out.push_str(&format!("        xmin = 0\n        xmax = {}\n", xmax));
            out.push_str(&format!("        intervals: size = {}\n", intervals.len()));
            for (j, (b, e, text)) in intervals.iter().enumerate() {
                out.push_str(&format!("        intervals [{}]:\n", j + 1));
                out.push_str(&format!("            xmin = {}\n            xmax = {}\n", b, e));
                out.push_str(&format!("            text = \"{}\"\n", text));
            }
        }
        out
    }
}
