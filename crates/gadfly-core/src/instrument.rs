//! Instrumentation metadata and per-request coverage feedback.
//!
//! The target is compiled with instrumentation that reports, for every
//! request, which basic blocks (or edges) ran and how often. The report
//! arrives either as `I-<label>` response headers or as a per-worker file
//! under `/var/instr/`. Hit counts are log2-quantised into buckets so that
//! small fluctuations do not register as new coverage.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::ConfigError;

/// An instrumentation point identifier (basic block or edge).
pub type Label = u32;

/// A log2-quantised hit count, 0 through [`MAX_BUCKET`].
pub type Bucket = u8;

/// A per-request control-flow map: label to hit bucket.
pub type Cfg = HashMap<Label, Bucket>;

/// Highest bucket; hit counts of 129 and above all land here.
pub const MAX_BUCKET: Bucket = 8;

/// Prefix of instrumentation feedback headers.
const HEADER_PREFIX: &str = "i-";

/// Directory holding per-worker feedback files under the `file` transport.
const FEEDBACK_DIR: &str = "/var/instr";

/// Quantise a hit count into its bucket: `ceil(log2(hits))`, clamped to 8.
///
/// The nine buckets cover 1, 2, 3-4, 5-8, 9-16, 17-32, 33-64, 65-128, >=129.
pub fn to_bucket(hit_count: u32) -> Bucket {
    match hit_count {
        0 | 1 => 0,
        h if h >= 256 => MAX_BUCKET,
        h => ((h - 1).ilog2() + 1) as Bucket,
    }
}

/// How the target emits its feedback map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum OutputMethod {
    /// One `label-value` line per entry in `/var/instr/map.<worker_id>`.
    #[serde(rename = "file")]
    File,
    /// One `I-<label>` response header per entry.
    #[serde(rename = "http")]
    Http,
}

/// Which instrumentation units the target counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Policy {
    /// Basic blocks only.
    #[serde(rename = "node")]
    Node,
    /// Edges only.
    #[serde(rename = "edge")]
    Edge,
    /// Both, with header values encoded as `"xor-single"`.
    #[serde(rename = "node-edge")]
    NodeEdge,
}

/// The two per-request coverage maps.
///
/// `xor` holds edge-style labels, `single` node-style labels. Which one is
/// populated depends on the [`Policy`]; under [`Policy::NodeEdge`] both are.
#[derive(Debug, Clone, Default)]
pub struct CfgPair {
    /// Edge-style coverage map.
    pub xor: Cfg,
    /// Node-style coverage map.
    pub single: Cfg,
}

/// Instrumentation metadata loaded from `instr.meta`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentMeta {
    /// Number of instrumented basic blocks in the target.
    #[serde(rename = "basic-block-count")]
    pub basic_blocks: u64,
    /// Feedback transport.
    #[serde(rename = "output-method")]
    pub output_method: OutputMethod,
    /// Instrumentation unit policy.
    #[serde(rename = "instrument-policy")]
    pub policy: Policy,
    /// Number of instrumented edges; required unless the policy is `node`.
    #[serde(rename = "edge-count")]
    pub edges: Option<u64>,
}

impl InstrumentMeta {
    /// Load and validate instrumentation metadata from a JSON file.
    ///
    /// Fatal at startup: a missing file, malformed JSON, or a non-`node`
    /// policy without `edge-count` all fail the run before any worker spawns.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::MetaFileNotFound {
            path: path.to_string(),
        })?;
        let meta: Self =
            serde_json::from_str(&raw).map_err(|source| ConfigError::MetaParseError { source })?;

        if meta.policy != Policy::Node && meta.edges.is_none() {
            return Err(ConfigError::MetaMissingKey {
                key: "edge-count".to_string(),
            });
        }

        Ok(meta)
    }

    /// Denominator for coverage percentages: edges under the edge policy,
    /// basic blocks otherwise.
    pub fn score_denominator(&self) -> u64 {
        match self.policy {
            Policy::Edge => self.edges.unwrap_or(self.basic_blocks).max(1),
            Policy::Node | Policy::NodeEdge => self.basic_blocks.max(1),
        }
    }

    /// Parse the feedback for one completed request.
    ///
    /// Reads response headers or the worker's feedback file depending on the
    /// configured transport. Malformed entries, like an unreadable file, are
    /// treated as absent feedback; the request will simply not look
    /// interesting to the corpus.
    pub fn collect(&self, headers: &reqwest::header::HeaderMap, worker_id: &str) -> CfgPair {
        match self.output_method {
            OutputMethod::Http => self.bucketize(header_entries(headers)),
            OutputMethod::File => {
                let path = format!("{FEEDBACK_DIR}/map.{worker_id}");
                match std::fs::read_to_string(&path) {
                    Ok(raw) => self.bucketize(file_entries(&raw)),
                    Err(e) => {
                        tracing::warn!(path = %path, error = %e, "Feedback file unreadable, treating as empty");
                        CfgPair::default()
                    }
                }
            }
        }
    }

    /// Bucket raw `(label, value)` entries into the policy's map(s).
    fn bucketize(&self, entries: impl Iterator<Item = (Label, String)>) -> CfgPair {
        let mut pair = CfgPair::default();

        for (label, value) in entries {
            match self.policy {
                Policy::Node | Policy::Edge => {
                    let Ok(hits) = value.parse::<u32>() else {
                        tracing::debug!(label, value = %value, "Skipping malformed feedback entry");
                        continue;
                    };
                    if hits == 0 {
                        continue;
                    }
                    let cfg = if self.policy == Policy::Edge {
                        &mut pair.xor
                    } else {
                        &mut pair.single
                    };
                    cfg.insert(label, to_bucket(hits));
                }
                Policy::NodeEdge => {
                    let Some((xor_raw, single_raw)) = value.split_once('-') else {
                        tracing::debug!(label, value = %value, "Skipping malformed feedback entry");
                        continue;
                    };
                    let (Ok(xor), Ok(single)) = (xor_raw.parse::<u32>(), single_raw.parse::<u32>())
                    else {
                        tracing::debug!(label, value = %value, "Skipping malformed feedback entry");
                        continue;
                    };
                    if xor > 0 {
                        pair.xor.insert(label, to_bucket(xor));
                    }
                    if single > 0 {
                        pair.single.insert(label, to_bucket(single));
                    }
                }
            }
        }

        pair
    }
}

/// Yield `(label, value)` pairs from `I-<label>` response headers.
///
/// Header names reach us lowercased, so the prefix test is on `i-`.
fn header_entries(
    headers: &reqwest::header::HeaderMap,
) -> impl Iterator<Item = (Label, String)> + '_ {
    headers.iter().filter_map(|(name, value)| {
        let label = name.as_str().strip_prefix(HEADER_PREFIX)?.parse().ok()?;
        let value = value.to_str().ok()?.to_string();
        Some((label, value))
    })
}

/// Yield `(label, value)` pairs from `label-value` feedback file lines.
fn file_entries(raw: &str) -> impl Iterator<Item = (Label, String)> + '_ {
    raw.lines().filter_map(|line| {
        let line = line.trim_end();
        if line.is_empty() {
            return None;
        }
        let (label, value) = line.split_once('-')?;
        Some((label.parse().ok()?, value.to_string()))
    })
}

/// Read a feedback file's entries with the given meta; test seam for the
/// `file` transport without touching `/var/instr`.
#[cfg(test)]
pub(crate) fn collect_from_file(meta: &InstrumentMeta, path: &std::path::Path) -> CfgPair {
    match std::fs::read_to_string(path) {
        Ok(raw) => meta.bucketize(file_entries(&raw)),
        Err(_) => CfgPair::default(),
    }
}
