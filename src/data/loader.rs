use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use super::model::{Block, RawChannel, Sample};
use super::BlockSource;
use crate::session::SessionState;

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load a session file (JSON `SessionState`).
pub fn load_session_file(path: &Path) -> Result<SessionState> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading session file {}", path.display()))?;
    let state: SessionState = serde_json::from_str(&text)
        .with_context(|| format!("parsing session file {}", path.display()))?;
    log::info!(
        "session {}: {} blocks, {} constants, {} steps",
        path.display(),
        state.blocks.len(),
        state.constants.len(),
        state.steps.len()
    );
    Ok(state)
}

/// Write a session file (pretty JSON).
pub fn save_session_file(path: &Path, state: &SessionState) -> Result<()> {
    let text = serde_json::to_string_pretty(state).context("serializing session")?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

/// Load raw blocks from a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.json` – `[{ "number": 1, "channels": { "Pb206": {...} } }, ...]`
/// * `.csv`  – one row per cycle, see [`load_csv`]
pub fn load_blocks_file(path: &Path) -> Result<Vec<Block>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let blocks = match ext.as_str() {
        "json" => load_json(path),
        "csv" => load_csv(path),
        other => bail!("Unsupported file extension: .{other}"),
    }?;
    log::info!("{}: {} blocks", path.display(), blocks.len());
    Ok(blocks)
}

/// Blocks stored on disk. A directory holds one `<session_id>.json` or
/// `<session_id>.csv` per session; a file path is used as is.
#[derive(Debug, Clone)]
pub struct FileBlockSource {
    pub path: PathBuf,
}

impl FileBlockSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BlockSource for FileBlockSource {
    fn load_blocks(&self, session_id: &str) -> Result<Vec<Block>> {
        if !self.path.is_dir() {
            return load_blocks_file(&self.path);
        }
        for ext in ["json", "csv"] {
            let candidate = self.path.join(format!("{session_id}.{ext}"));
            if candidate.is_file() {
                return load_blocks_file(&candidate);
            }
        }
        bail!(
            "no blocks for session '{session_id}' in {}",
            self.path.display()
        )
    }
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

fn load_json(path: &Path) -> Result<Vec<Block>> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let blocks: Vec<Block> = serde_json::from_str(&text).context("parsing JSON blocks")?;
    for block in &blocks {
        block.check()?;
    }
    Ok(blocks)
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

/// CSV layout: one row per cycle.
///
/// ```text
/// block,cycle,time,Pb204,Pb206,Pb206_sigma
/// 1,1,0.0,1520.3,28001.9,16.7
/// ```
///
/// `block`, `cycle` and `time` are required. Every other column is a
/// channel, except `<channel>_sigma`, which holds that channel's one-sigma
/// uncertainty. A channel left empty for a whole block is absent from that
/// block; a channel empty in only some of a block's rows is an error, since
/// its samples would no longer line up with the other channels' cycles.
fn load_csv(path: &Path) -> Result<Vec<Block>> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .with_context(|| format!("CSV missing '{name}' column"))
    };
    let block_idx = column("block")?;
    let cycle_idx = column("cycle")?;
    let time_idx = column("time")?;

    // (channel name, value column, sigma column)
    let channels: Vec<(String, usize, Option<usize>)> = headers
        .iter()
        .enumerate()
        .filter(|(i, h)| ![block_idx, cycle_idx, time_idx].contains(i) && !h.ends_with("_sigma"))
        .map(|(i, h)| {
            let sigma = headers.iter().position(|s| *s == format!("{h}_sigma"));
            (h.clone(), i, sigma)
        })
        .collect();
    if channels.is_empty() {
        bail!("CSV has no channel columns");
    }

    // block number → channel name → (samples, sigmas)
    let mut tables: BTreeMap<usize, BTreeMap<String, (Vec<Sample>, Vec<f64>)>> = BTreeMap::new();
    let mut row_counts: BTreeMap<usize, usize> = BTreeMap::new();

    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;
        let field = |idx: usize| record.get(idx).unwrap_or("").trim();

        let block: usize = field(block_idx)
            .parse()
            .with_context(|| format!("CSV row {row_no}: bad block number '{}'", field(block_idx)))?;
        let cycle: usize = field(cycle_idx)
            .parse()
            .with_context(|| format!("CSV row {row_no}: bad cycle number '{}'", field(cycle_idx)))?;
        let time = parse_float(field(time_idx), row_no, "time")?;

        *row_counts.entry(block).or_default() += 1;
        let table = tables.entry(block).or_default();
        for (name, value_idx, sigma_idx) in &channels {
            let raw = field(*value_idx);
            if raw.is_empty() {
                continue;
            }
            let intensity = parse_float(raw, row_no, name)?;
            let sigma = match sigma_idx {
                Some(idx) if !field(*idx).is_empty() => parse_float(field(*idx), row_no, "sigma")?,
                _ => 0.0,
            };
            let (samples, sigmas) = table.entry(name.clone()).or_default();
            samples.push(Sample {
                cycle,
                intensity,
                time,
            });
            sigmas.push(sigma);
        }
    }

    for (number, table) in &tables {
        let rows = row_counts.get(number).copied().unwrap_or(0);
        for (name, (samples, _)) in table {
            if samples.len() != rows {
                bail!(
                    "Block {number}, channel {name}: values in {} of {rows} rows",
                    samples.len()
                );
            }
        }
    }

    Ok(tables
        .into_iter()
        .map(|(number, table)| {
            let channels = table.into_iter().map(|(name, (samples, sigmas))| {
                let channel = RawChannel::new(name, samples);
                if sigmas.iter().all(|&s| s == 0.0) {
                    channel
                } else {
                    channel.with_sigmas(sigmas)
                }
            });
            Block::new(number, channels)
        })
        .collect())
}

fn parse_float(s: &str, row: usize, col: &str) -> Result<f64> {
    s.parse::<f64>()
        .with_context(|| format!("Row {row}, {col}: '{s}' is not a number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        path
    }

    #[test]
    fn csv_groups_rows_into_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "run.csv",
            "block,cycle,time,Pb204,Pb206,Pb206_sigma\n\
             1,1,0.0,10,200,2\n\
             1,2,1.0,11,201,2\n\
             2,1,0.0,,300,3\n",
        );
        let blocks = load_blocks_file(&path).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].cycle_count(), 2);
        let pb206 = blocks[0].channel("Pb206").unwrap();
        assert_eq!(pb206.samples[1].intensity, 201.0);
        assert_eq!(pb206.sigma(1), 2.0);
        assert!(blocks[0].channel("Pb204").unwrap().sigmas.is_none());
        // empty column: channel absent in block 2
        assert!(blocks[1].channel("Pb204").is_none());
    }

    #[test]
    fn csv_errors_name_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "bad.csv", "block,cycle,time,Pb206\n1,1,0.0,abc\n");
        let err = format!("{:#}", load_blocks_file(&path).unwrap_err());
        assert!(err.contains("Row 0"), "{err}");

        let path = write(dir.path(), "nocycle.csv", "block,time,Pb206\n1,0.0,1\n");
        assert!(load_blocks_file(&path).is_err());
    }

    #[test]
    fn csv_rejects_channel_with_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "gaps.csv",
            "block,cycle,time,Pb204,Pb206\n\
             1,1,0.0,,100\n\
             1,2,1.0,10,200\n\
             1,3,2.0,20,300\n",
        );
        let err = format!("{:#}", load_blocks_file(&path).unwrap_err());
        assert!(err.contains("Block 1, channel Pb204"), "{err}");
    }

    #[test]
    fn directory_source_finds_session_file() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "s1.json",
            r#"[{"number":4,"channels":{"Pb206":{"name":"Pb206","samples":[{"cycle":1,"intensity":5.0,"time":0.0}]}}}]"#,
        );
        let source = FileBlockSource::new(dir.path());
        let blocks = source.load_blocks("s1").unwrap();
        assert_eq!(blocks[0].number, 4);
        assert!(source.load_blocks("s2").is_err());
    }

    #[test]
    fn unsupported_extension() {
        assert!(load_blocks_file(Path::new("data.parquet")).is_err());
    }
}
