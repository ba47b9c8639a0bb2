use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

// ---------------------------------------------------------------------------
// RawChannel – one detector's series within one block
// ---------------------------------------------------------------------------

/// A single measured intensity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Cycle number as recorded by the instrument.
    pub cycle: usize,
    pub intensity: f64,
    /// Acquisition time, seconds from block start.
    pub time: f64,
}

/// One detector's samples for one block, in cycle order. Immutable once
/// ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChannel {
    pub name: String,
    pub samples: Vec<Sample>,
    /// Optional one-sigma uncertainty per sample; absent means exact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigmas: Option<Vec<f64>>,
}

impl RawChannel {
    pub fn new(name: impl Into<String>, samples: Vec<Sample>) -> Self {
        Self {
            name: name.into(),
            samples,
            sigmas: None,
        }
    }

    pub fn with_sigmas(mut self, sigmas: Vec<f64>) -> Self {
        self.sigmas = Some(sigmas);
        self
    }

    /// Uncertainty of the sample at `position`.
    pub fn sigma(&self, position: usize) -> f64 {
        self.sigmas
            .as_ref()
            .and_then(|s| s.get(position))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Block – one analytical segment
// ---------------------------------------------------------------------------

/// Cycles of one analytical segment. Cycles are addressed by position
/// (0-based) within the block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub number: usize,
    pub channels: BTreeMap<String, RawChannel>,
    /// User flag: excluded from session aggregation, never deleted.
    #[serde(default)]
    pub rejected: bool,
    /// User-rejected cycle positions.
    #[serde(default)]
    pub rejected_cycles: BTreeSet<usize>,
}

impl Block {
    pub fn new(number: usize, channels: impl IntoIterator<Item = RawChannel>) -> Self {
        Self {
            number,
            channels: channels.into_iter().map(|c| (c.name.clone(), c)).collect(),
            rejected: false,
            rejected_cycles: BTreeSet::new(),
        }
    }

    /// Number of cycles: the longest channel.
    pub fn cycle_count(&self) -> usize {
        self.channels.values().map(RawChannel::len).max().unwrap_or(0)
    }

    pub fn channel(&self, name: &str) -> Option<&RawChannel> {
        self.channels.get(name)
    }

    pub fn is_cycle_rejected(&self, position: usize) -> bool {
        self.rejected_cycles.contains(&position)
    }

    /// Every channel must be stored under its own name and carry one sigma
    /// per sample when it carries sigmas at all.
    pub fn check(&self) -> Result<(), DefinitionError> {
        for (key, channel) in &self.channels {
            let malformed = |message: String| DefinitionError::MalformedBlock {
                block: self.number,
                channel: key.clone(),
                message,
            };
            if key != &channel.name {
                return Err(malformed(format!("stored under a channel named '{}'", channel.name)));
            }
            if let Some(sigmas) = &channel.sigmas {
                if sigmas.len() != channel.len() {
                    return Err(malformed(format!(
                        "{} samples but {} sigmas",
                        channel.len(),
                        sigmas.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Constant – a named value with uncertainty
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub sigma: f64,
}

impl Constant {
    pub fn new(name: impl Into<String>, value: f64, sigma: f64) -> Self {
        Self {
            name: name.into(),
            value,
            sigma,
        }
    }
}

// ---------------------------------------------------------------------------
// Dataset – all blocks of a session
// ---------------------------------------------------------------------------

/// The loaded blocks with a stable channel index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub blocks: Vec<Block>,
    /// Sorted union of channel names across blocks. A channel's position
    /// here identifies its samples as uncertainty sources.
    pub channel_names: Vec<String>,
}

impl Dataset {
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        let names: BTreeSet<String> = blocks
            .iter()
            .flat_map(|b| b.channels.keys().cloned())
            .collect();
        Dataset {
            blocks,
            channel_names: names.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
