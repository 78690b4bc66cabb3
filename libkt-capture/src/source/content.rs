// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Framed segment writers for every stream except the CPU raw pages (those
//! live in [`super::cpu_raw`]).
//!
//! Each segment is written as `SegmentHeader{type, length}` followed by the
//! payload. The header goes out first with a zero length, the payload is
//! copied through a scratch buffer, and the header is patched in place once
//! the final byte count is known.

use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use tracing::{debug, info, warn};

use super::{KernelFlavor, TraceSource};
use crate::config::TagRegistry;
use crate::file_utils::SAVED_EVENTS_FORMAT;
use libkt_common::time::{self, MS_TO_NS};
use libkt_common::tracefs::{self, TraceFs, PAGE_SIZE};

pub const TRACE_FILE_MAGIC: u16 = 0xDF49;
pub const TRACE_FILE_VERSION: u16 = 1;
pub const FILE_RAW_TRACE: u8 = 0;
pub const HM_FILE_RAW_TRACE: u8 = 1;

/// On-disk sizes of the 4-byte-aligned header records.
pub const FILE_HEADER_SIZE: usize = 12;
pub const SEGMENT_HEADER_SIZE: usize = 8;

pub const CONTENT_TYPE_DEFAULT: u8 = 0;
pub const CONTENT_TYPE_EVENTS_FORMAT: u8 = 1;
pub const CONTENT_TYPE_CMDLINES: u8 = 2;
pub const CONTENT_TYPE_TGIDS: u8 = 3;
pub const CONTENT_TYPE_CPU_RAW: u8 = 4;
pub const CONTENT_TYPE_HEADER_PAGE: u8 = 30;
pub const CONTENT_TYPE_PRINTK_FORMATS: u8 = 31;
pub const CONTENT_TYPE_KALLSYMS: u8 = 32;
pub const CONTENT_TYPE_BASE_INFO: u8 = 33;

const MAX_CPU_NR: usize = 24;

/// Scratch buffer shared by the copy loops: 1 MiB, page aligned.
pub(crate) const COPY_BUFFER_SIZE: usize = 256 * PAGE_SIZE;

pub(crate) fn encode_segment_header(content_type: u8, length: u32) -> [u8; SEGMENT_HEADER_SIZE] {
    let mut buf = [0u8; SEGMENT_HEADER_SIZE];
    buf[0] = content_type;
    buf[4..8].copy_from_slice(&length.to_le_bytes());
    buf
}

/// Reads one chunk, treating EINTR as retryable and a drained non-blocking
/// source as EOF.
pub(crate) fn read_chunk(src: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match src.read(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
            Err(err) => return Err(err),
        }
    }
}

impl TraceSource {
    /// Emits the unframed container header:
    /// `{magic, fileType, version, reserved}` where `reserved` carries the
    /// pointer width in bit 0 and the CPU count in bits 1..5.
    pub fn write_file_header(&self) -> anyhow::Result<()> {
        let cpu_count = tracefs::cpu_processors();
        anyhow::ensure!(
            (1..=MAX_CPU_NR).contains(&cpu_count),
            "unsupported cpu count {cpu_count}"
        );
        let mut reserved: u32 = 0;
        if usize::BITS == 32 {
            reserved |= 1;
        }
        reserved |= (cpu_count as u32) << 1;

        let mut header = [0u8; FILE_HEADER_SIZE];
        header[0..2].copy_from_slice(&TRACE_FILE_MAGIC.to_le_bytes());
        header[2] = self.flavor().file_type();
        header[4..6].copy_from_slice(&TRACE_FILE_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&reserved.to_le_bytes());
        self.out()
            .write_all(&header)
            .context("write trace file header")?;
        self.add_output_size(FILE_HEADER_SIZE as u64);
        Ok(())
    }

    /// Text key/value pairs describing the capture environment.
    pub fn write_base_info(&self) -> anyhow::Result<()> {
        let body = format!(
            "unix_time_ms: {}\nboot_time_ms: {}\nkernel_version: {}\n",
            time::unix_time_ms(),
            time::boot_time_ns() / MS_TO_NS,
            tracefs::kernel_release()
        );
        let header_pos = self.begin_segment(CONTENT_TYPE_BASE_INFO)?;
        self.out()
            .write_all(body.as_bytes())
            .context("write base info payload")?;
        self.end_segment(header_pos, CONTENT_TYPE_BASE_INFO, body.len() as u32)
    }

    /// The event format schema consumers need to decode the CPU raw pages.
    /// Built once per device into `saved_events_format` and copied from
    /// there on later dumps.
    pub fn write_events_format(&self, registry: &TagRegistry) -> anyhow::Result<()> {
        let saved = self.trace_dir().join(SAVED_EVENTS_FORMAT);
        if !saved.exists() {
            pre_write_events_format(self.tracefs(), registry, &saved)?;
        }
        self.copy_file_segment(CONTENT_TYPE_EVENTS_FORMAT, &saved)
    }

    pub fn write_cmd_lines(&self) -> anyhow::Result<()> {
        self.copy_node_segment(CONTENT_TYPE_CMDLINES, "saved_cmdlines")
    }

    pub fn write_tgids(&self) -> anyhow::Result<()> {
        self.copy_node_segment(CONTENT_TYPE_TGIDS, "saved_tgids")
    }

    /// No-op on HM: the coalesced ring buffer has no header_page node.
    pub fn write_header_page(&self) -> anyhow::Result<()> {
        if self.flavor() == KernelFlavor::Hm {
            return Ok(());
        }
        self.copy_node_segment(CONTENT_TYPE_HEADER_PAGE, "events/header_page")
    }

    /// No-op on HM.
    pub fn write_printk_formats(&self) -> anyhow::Result<()> {
        if self.flavor() == KernelFlavor::Hm {
            return Ok(());
        }
        self.copy_node_segment(CONTENT_TYPE_PRINTK_FORMATS, "printk_formats")
    }

    fn copy_node_segment(&self, content_type: u8, node: &str) -> anyhow::Result<()> {
        let path = self.tracefs().node_path(node);
        self.copy_file_segment(content_type, &path)
    }

    fn copy_file_segment(&self, content_type: u8, path: &Path) -> anyhow::Result<()> {
        anyhow::ensure!(self.output_still_exists(), "trace output file is gone");
        let mut src = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        let header_pos = self.begin_segment(content_type)?;
        let mut scratch = vec![0u8; COPY_BUFFER_SIZE];
        let mut write_len: u64 = 0;
        loop {
            let n = read_chunk(&mut src, &mut scratch).context("read segment source")?;
            if n == 0 {
                break;
            }
            self.out()
                .write_all(&scratch[..n])
                .context("write segment payload")?;
            write_len += n as u64;
        }
        debug!(content_type, write_len, "segment copied");
        self.end_segment(header_pos, content_type, write_len as u32)
    }

    /// Writes the placeholder segment header and returns its file offset
    /// for the later patch.
    pub(crate) fn begin_segment(&self, content_type: u8) -> anyhow::Result<u64> {
        use std::io::Seek;
        let mut out = self.out();
        let header_pos = out.stream_position().context("segment header position")?;
        out.write_all(&encode_segment_header(content_type, 0))
            .context("write segment header")?;
        Ok(header_pos)
    }

    /// Patches the header with the final payload length and folds the
    /// framed bytes into the running file size.
    pub(crate) fn end_segment(
        &self,
        header_pos: u64,
        content_type: u8,
        write_len: u32,
    ) -> anyhow::Result<()> {
        self.out()
            .write_all_at(&encode_segment_header(content_type, write_len), header_pos)
            .context("patch segment header")?;
        self.add_output_size(SEGMENT_HEADER_SIZE as u64 + write_len as u64);
        Ok(())
    }
}

/// Concatenates the base format list plus every registered tag's format
/// files into the persistent cache, skipping unreadable entries.
pub(crate) fn pre_write_events_format(
    tracefs: &TraceFs,
    registry: &TagRegistry,
    saved: &Path,
) -> anyhow::Result<()> {
    let mut out = File::create(saved).with_context(|| format!("create {}", saved.display()))?;
    let mut format_paths = registry.base_format_paths.clone();
    for tag in registry.tags.values() {
        format_paths.extend(tag.format_paths.iter().cloned());
    }
    for format in &format_paths {
        let path = tracefs.node_path(format);
        let mut src = match File::open(&path) {
            Ok(src) => src,
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unreadable format file");
                continue;
            }
        };
        let mut scratch = vec![0u8; PAGE_SIZE];
        loop {
            let n = read_chunk(&mut src, &mut scratch).context("read format file")?;
            if n == 0 {
                break;
            }
            out.write_all(&scratch[..n]).context("append format file")?;
        }
    }
    info!(saved = %saved.display(), formats = format_paths.len(), "saved events format written");
    Ok(())
}

/// Parsed counterpart of the on-disk layout, used by tests and kept close
/// to the writer so the two stay in sync.
#[cfg(test)]
pub(crate) mod parse {
    use super::*;

    #[derive(Debug, PartialEq)]
    pub(crate) struct ParsedHeader {
        pub magic: u16,
        pub file_type: u8,
        pub version: u16,
        pub pointer_32bit: bool,
        pub cpu_count: u32,
    }

    #[derive(Debug)]
    pub(crate) struct ParsedSegment {
        pub content_type: u8,
        pub payload: Vec<u8>,
    }

    /// Parses `FileHeader · (SegmentHeader · payload)*`, consuming every
    /// byte or failing.
    pub(crate) fn parse_container(data: &[u8]) -> Option<(ParsedHeader, Vec<ParsedSegment>)> {
        if data.len() < FILE_HEADER_SIZE {
            return None;
        }
        let reserved = u32::from_le_bytes(data[8..12].try_into().ok()?);
        let header = ParsedHeader {
            magic: u16::from_le_bytes(data[0..2].try_into().ok()?),
            file_type: data[2],
            version: u16::from_le_bytes(data[4..6].try_into().ok()?),
            pointer_32bit: reserved & 1 != 0,
            cpu_count: (reserved >> 1) & 0x1F,
        };
        let mut segments = Vec::new();
        let mut pos = FILE_HEADER_SIZE;
        while pos < data.len() {
            if pos + SEGMENT_HEADER_SIZE > data.len() {
                return None;
            }
            let content_type = data[pos];
            let length =
                u32::from_le_bytes(data[pos + 4..pos + 8].try_into().ok()?) as usize;
            pos += SEGMENT_HEADER_SIZE;
            if pos + length > data.len() {
                return None;
            }
            segments.push(ParsedSegment {
                content_type,
                payload: data[pos..pos + length].to_vec(),
            });
            pos += length;
        }
        Some((header, segments))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::FakeCapture;
    use super::parse::parse_container;
    use super::*;
    use crate::config::test_support::sample_registry;

    #[test]
    fn test_file_header_layout() {
        let fixture = FakeCapture::new(1);
        let source = fixture.source("trace_hdr.sys");
        source.write_file_header().unwrap();
        let data = std::fs::read(source.trace_file_path()).unwrap();
        assert_eq!(data.len(), FILE_HEADER_SIZE);
        let (header, segments) = parse_container(&data).unwrap();
        assert_eq!(header.magic, TRACE_FILE_MAGIC);
        assert_eq!(header.file_type, FILE_RAW_TRACE);
        assert_eq!(header.version, TRACE_FILE_VERSION);
        assert_eq!(header.cpu_count as usize, tracefs::cpu_processors());
        assert_eq!(header.pointer_32bit, usize::BITS == 32);
        assert!(segments.is_empty());
    }

    #[test]
    fn test_base_info_segment_contents() {
        let fixture = FakeCapture::new(1);
        let source = fixture.source("trace_base.sys");
        source.write_file_header().unwrap();
        source.write_base_info().unwrap();
        let data = std::fs::read(source.trace_file_path()).unwrap();
        let (_, segments) = parse_container(&data).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].content_type, CONTENT_TYPE_BASE_INFO);
        let text = String::from_utf8(segments[0].payload.clone()).unwrap();
        assert!(text.contains("unix_time_ms: "));
        assert!(text.contains("boot_time_ms: "));
        assert!(text.contains("kernel_version: "));
    }

    #[test]
    fn test_cmdlines_and_tgids_copied_verbatim() {
        let fixture = FakeCapture::new(1);
        let source = fixture.source("trace_tables.sys");
        source.write_file_header().unwrap();
        source.write_cmd_lines().unwrap();
        source.write_tgids().unwrap();
        let data = std::fs::read(source.trace_file_path()).unwrap();
        let (_, segments) = parse_container(&data).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].content_type, CONTENT_TYPE_CMDLINES);
        assert_eq!(segments[0].payload, b"1 init\n2 kthreadd\n");
        assert_eq!(segments[1].content_type, CONTENT_TYPE_TGIDS);
        assert_eq!(segments[1].payload, b"1 1\n2 2\n");
    }

    #[test]
    fn test_segment_length_matches_payload() {
        let fixture = FakeCapture::new(1);
        let source = fixture.source("trace_len.sys");
        source.write_file_header().unwrap();
        source.write_header_page().unwrap();
        let data = std::fs::read(source.trace_file_path()).unwrap();
        let (_, segments) = parse_container(&data).unwrap();
        let expected = std::fs::read(fixture.tracefs().node_path("events/header_page")).unwrap();
        assert_eq!(segments[0].payload, expected);
        // parse_container consumed all bytes, so the patched length is
        // consistent with the payload that follows it.
    }

    #[test]
    fn test_missing_node_is_an_error() {
        let fixture = FakeCapture::new(1);
        let source = fixture.source("trace_missing.sys");
        std::fs::remove_file(fixture.tracefs().node_path("saved_cmdlines")).unwrap();
        assert!(source.write_cmd_lines().is_err());
    }

    #[test]
    fn test_events_format_builds_and_reuses_cache() {
        let fixture = FakeCapture::new(1);
        let registry = sample_registry();
        let root = fixture.tracefs_dir.path();
        std::fs::create_dir_all(root.join("events/ftrace/print")).unwrap();
        std::fs::create_dir_all(root.join("events/sched/sched_switch")).unwrap();
        std::fs::write(root.join("events/ftrace/print/format"), "print fmt\n").unwrap();
        std::fs::write(
            root.join("events/sched/sched_switch/format"),
            "sched_switch fmt\n",
        )
        .unwrap();

        let source = fixture.source("trace_fmt.sys");
        source.write_file_header().unwrap();
        source.write_events_format(&registry).unwrap();

        let saved = fixture.out_dir.path().join(SAVED_EVENTS_FORMAT);
        let cache = std::fs::read_to_string(&saved).unwrap();
        assert!(cache.contains("print fmt"));
        assert!(cache.contains("sched_switch fmt"));

        let data = std::fs::read(source.trace_file_path()).unwrap();
        let (_, segments) = parse_container(&data).unwrap();
        assert_eq!(segments[0].content_type, CONTENT_TYPE_EVENTS_FORMAT);
        assert_eq!(segments[0].payload, cache.as_bytes());

        // Second capture reuses the cache even when tracefs formats vanish.
        std::fs::remove_file(root.join("events/ftrace/print/format")).unwrap();
        let second = fixture.source("trace_fmt2.sys");
        second.write_file_header().unwrap();
        second.write_events_format(&registry).unwrap();
        let data = std::fs::read(second.trace_file_path()).unwrap();
        let (_, segments) = parse_container(&data).unwrap();
        assert_eq!(segments[0].payload, cache.as_bytes());
    }

    #[test]
    fn test_hm_skips_header_page_and_printk() {
        let fixture = FakeCapture::new(1);
        let source = TraceSource::create(
            KernelFlavor::Hm,
            fixture.tracefs(),
            fixture.out_dir.path(),
            fixture.out_dir.path().join("trace_hm.sys"),
        )
        .unwrap();
        source.write_file_header().unwrap();
        source.write_header_page().unwrap();
        source.write_printk_formats().unwrap();
        let data = std::fs::read(source.trace_file_path()).unwrap();
        let (header, segments) = parse_container(&data).unwrap();
        assert_eq!(header.file_type, HM_FILE_RAW_TRACE);
        assert!(segments.is_empty());
    }
}
