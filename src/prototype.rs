use crate::error::{PipelineError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// 母音ラベル1つ分の事前分布 (F1/F2 の平均と標準偏差)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Prototype {
    pub mean: [f64; 2],
    pub sd: [f64; 2],
}

/// 母音プロトタイプ表
///
/// 区切り文字 (カンマまたはタブ) で区切られたヘッダー付きの表。
/// 列名は大文字小文字を区別せず、余分な列は無視する。
///
/// ```text
/// vowel,F1,F2,F1_sd,F2_sd
/// a,750,1400,90,160
/// i,300,2200,40,200
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PrototypeTable {
    entries: BTreeMap<String, Prototype>,
}

impl PrototypeTable {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::configuration(format!("cannot read prototype table {:?}: {}", path, e))
        })?;
        let table = Self::parse(&content)
            .map_err(|message| PipelineError::configuration(format!("prototype table {:?}: {}", path, message)))?;
        log::info!("プロトタイプ表を読み込みました: {:?} ({} 母音)", path, table.len());
        Ok(table)
    }

    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let mut lines = content
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

        let (_, header) = lines.next().ok_or("empty table")?;
        let delimiter = if header.contains('\t') { '\t' } else { ',' };
        let columns: Vec<String> = header
            .split(delimiter)
            .map(|c| c.trim().to_lowercase())
            .collect();
        let find = |names: &[&str]| {
            columns
                .iter()
                .position(|c| names.contains(&c.as_str()))
                .ok_or_else(|| format!("missing column {:?}", names[0]))
        };
        let label_col = find(&["vowel", "phone", "label"])?;
        let value_cols = [find(&["f1"])?, find(&["f2"])?, find(&["f1_sd"])?, find(&["f2_sd"])?];

        let mut entries = BTreeMap::new();
        for (line_no, line) in lines {
            let fields: Vec<&str> = line.split(delimiter).map(str::trim).collect();
            let label = fields
                .get(label_col)
                .filter(|l| !l.is_empty())
                .ok_or_else(|| format!("line {}: missing vowel label", line_no))?;
            let mut values = [0.0; 4];
            for (value, &col) in values.iter_mut().zip(&value_cols) {
                let field = fields
                    .get(col)
                    .ok_or_else(|| format!("line {}: missing column {}", line_no, col + 1))?;
                *value = field
                    .parse::<f64>()
                    .map_err(|_| format!("line {}: {:?} is not a number", line_no, field))?;
                if !value.is_finite() || *value <= 0.0 {
                    return Err(format!("line {}: values must be positive, got {}", line_no, field));
                }
            }
            let prototype = Prototype {
                mean: [values[0], values[1]],
                sd: [values[2], values[3]],
            };
            if entries.insert(label.to_string(), prototype).is_some() {
                log::warn!("プロトタイプ表で母音 {:?} が重複しています (後の行を使用)", label);
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, label: &str) -> Option<&Prototype> {
        self.entries.get(label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, label: impl Into<String>, prototype: Prototype) {
        self.entries.insert(label.into(), prototype);
    }
}
