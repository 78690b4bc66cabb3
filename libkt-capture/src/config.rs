// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capture configuration: the tag registry supplied by the host (category
//! ingestion itself lives outside this crate) and the textual argument form
//! accepted by `open_trace`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, warn};

use crate::types::DEFAULT_FILE_SIZE_KB;

/// Inclusive bounds accepted for `buffer_size_kb`, matching the kernel-side
/// per-CPU ring buffer limits.
pub const MIN_BUFFER_SIZE_KB: u64 = 256;
pub const MAX_BUFFER_SIZE_KB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    /// OR'd into the process-wide enable-flags value read by producers.
    User,
    /// Toggles ftrace event enable nodes.
    Kernel,
}

/// One capture category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceTag {
    pub kind: TagKind,
    /// User-tag bit for `TagKind::User`; zero for kernel tags.
    #[serde(default)]
    pub bit: u64,
    /// ftrace enable nodes, relative to the tracefs root.
    #[serde(default)]
    pub enable_paths: Vec<String>,
    /// Event format files contributing to the saved events format.
    #[serde(default)]
    pub format_paths: Vec<String>,
}

/// The registry handed in by the configuration supplier:
/// `{tag → paths/bits}` and `{group → [tag…]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagRegistry {
    pub tags: BTreeMap<String, TraceTag>,
    pub groups: BTreeMap<String, Vec<String>>,
    /// Format files every capture carries regardless of enabled tags.
    #[serde(default)]
    pub base_format_paths: Vec<String>,
    #[serde(default = "default_snapshot_buffer_kb")]
    pub snapshot_default_buffer_kb: u64,
}

fn default_snapshot_buffer_kb() -> u64 {
    12 * 1024
}

impl TagRegistry {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn check_tags(&self, tags: &[String]) -> bool {
        for tag in tags {
            if !self.tags.contains_key(tag) {
                error!(tag, "tag is not provided by the registry");
                return false;
            }
        }
        true
    }

    pub fn check_groups(&self, groups: &[String]) -> bool {
        for group in groups {
            if !self.groups.contains_key(group) {
                error!(group, "tag group is not provided by the registry");
                return false;
            }
        }
        true
    }

    /// Resolves tags plus groups into the enabled user bitmask, the ftrace
    /// enable nodes to toggle and the format files the enabled set
    /// contributes.
    pub fn resolve(&self, params: &TraceParams) -> ResolvedTags {
        let mut names: Vec<&String> = params.tags.iter().collect();
        for group in &params.tag_groups {
            if let Some(members) = self.groups.get(group) {
                names.extend(members.iter());
            }
        }
        names.sort();
        names.dedup();

        let mut resolved = ResolvedTags::default();
        for name in names {
            let Some(tag) = self.tags.get(name) else {
                warn!(tag = %name, "skipping unknown tag");
                continue;
            };
            match tag.kind {
                TagKind::User => resolved.user_bits |= tag.bit,
                TagKind::Kernel => {
                    resolved.enable_paths.extend(tag.enable_paths.iter().cloned());
                }
            }
            resolved.format_paths.extend(tag.format_paths.iter().cloned());
        }
        resolved
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedTags {
    pub user_bits: u64,
    pub enable_paths: Vec<String>,
    pub format_paths: Vec<String>,
}

/// Parsed capture parameters. Immutable once `open_trace` succeeds.
#[derive(Debug, Clone)]
pub struct TraceParams {
    pub tags: Vec<String>,
    pub tag_groups: Vec<String>,
    pub filter_pids: Vec<String>,
    pub buffer_size_kb: Option<u64>,
    pub clock_type: String,
    pub overwrite: bool,
    pub output_file: Option<PathBuf>,
    pub file_limit: usize,
    pub file_size_kb: u64,
}

impl Default for TraceParams {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            tag_groups: Vec::new(),
            filter_pids: Vec::new(),
            buffer_size_kb: None,
            clock_type: String::new(),
            overwrite: true,
            output_file: None,
            file_limit: 0,
            file_size_kb: DEFAULT_FILE_SIZE_KB,
        }
    }
}

impl TraceParams {
    /// Parses the textual argument form:
    /// `tags:a,b tagGroups:g1 clockType:boot bufferSize:1024 overwrite:1
    /// output:file fileSize:N fileLimit:N filterPids:1,2`.
    ///
    /// Unknown keys fail the parse; items without a colon are skipped, both
    /// matching the established command-line behavior.
    pub fn parse_args(args: &str) -> Option<TraceParams> {
        let mut params = TraceParams::default();
        for item in normalize_args(args).split_whitespace() {
            let Some((key, value)) = item.split_once(':') else {
                error!(item, "argument without colon, skipping");
                continue;
            };
            match key {
                "tags" => params.tags = split_list(value),
                "tagGroups" => params.tag_groups = split_list(value),
                "clockType" => params.clock_type = value.to_string(),
                "bufferSize" => match value.parse::<u64>() {
                    Ok(kb) => params.buffer_size_kb = Some(kb),
                    Err(_) => {
                        error!(value, "bufferSize must be a number");
                        return None;
                    }
                },
                "overwrite" => params.overwrite = value != "0",
                "output" => params.output_file = Some(PathBuf::from(value)),
                "fileSize" => params.file_size_kb = parse_positive(value),
                "fileLimit" => params.file_limit = parse_positive(value) as usize,
                "filterPids" => params.filter_pids = split_list(value),
                _ => {
                    error!(key, "unknown capture argument");
                    return None;
                }
            }
        }
        if params.file_size_kb == 0 {
            params.file_size_kb = DEFAULT_FILE_SIZE_KB;
        }
        Some(params)
    }

    /// Whether the configured buffer size (if any) falls inside the
    /// accepted bounds.
    pub fn buffer_size_in_bounds(&self) -> bool {
        match self.buffer_size_kb {
            Some(kb) => (MIN_BUFFER_SIZE_KB..=MAX_BUFFER_SIZE_KB).contains(&kb),
            None => true,
        }
    }
}

/// Collapses `"tag1, tag2"` / `"tags : a"` into the canonical spaced form
/// before splitting.
fn normalize_args(args: &str) -> String {
    let mut out = args.to_string();
    for symbol in [":", ","] {
        let spaced = format!("{symbol} ");
        while out.contains(&spaced) {
            out = out.replace(&spaced, symbol);
        }
    }
    out
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_positive(value: &str) -> u64 {
    match value.parse::<i64>() {
        Ok(n) if n > 0 => n as u64,
        _ => {
            warn!(value, "illegal numeric input, falling back to default");
            0
        }
    }
}
