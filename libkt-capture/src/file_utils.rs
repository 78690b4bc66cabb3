// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace-file lifecycle: name generation bound to in-trace timestamps,
//! window parsing from names, directory scans, ageing/recycling policies and
//! the final rename step publishing a finished dump.
//!
//! Name format: `<dir>/{trace_|record_trace_|cache_trace_}<YYYYMMDDhhmmss>@
//! <bootSec>-<durationMs>.sys`. The pair after `@` is monotonically
//! meaningful and enables offline time alignment.

use chrono::{Local, NaiveDateTime, TimeZone};
use nix::fcntl::{Flock, FlockArg};
use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::types::TraceDumpType;
use libkt_common::time::{self, MS_TO_NS, S_TO_MS, S_TO_NS};

pub const TRACE_SNAPSHOT_PREFIX: &str = "trace_";
pub const TRACE_RECORDING_PREFIX: &str = "record_trace_";
pub const TRACE_CACHE_PREFIX: &str = "cache_trace_";
pub const CACHE_FILE_PREFIX: &str = "cache_";
pub const SAVED_EVENTS_FORMAT: &str = "saved_events_format";

/// Cache files older than this relative to now are considered drifted and
/// recycled.
pub const DEFAULT_CACHE_TRACE_DURATION_S: u64 = 30;
/// Snapshot files kept by the ageing pass before a new dump.
pub const DEFAULT_SNAPSHOT_KEEP_COUNT: usize = 20;
/// Recording files kept when the caller does not limit the count.
pub const DEFAULT_RECORD_FILE_LIMIT: usize = 15;

const TIME_LABEL_FORMAT: &str = "%Y%m%d%H%M%S";
const XATTR_LINK_NAME: &str = "user.trace.link";

/// Metadata for one published trace file. `trace_start_ut_ms` /
/// `trace_end_ut_ms` derive from in-file page timestamps, not file mtime.
#[derive(Debug, Clone, Default)]
pub struct TraceFileInfo {
    pub filename: PathBuf,
    pub ctime: i64,
    pub file_size: u64,
    pub trace_start_ut_ms: u64,
    pub trace_end_ut_ms: u64,
    pub is_new_file: bool,
}

pub fn trace_file_prefix(dump_type: TraceDumpType) -> &'static str {
    match dump_type {
        TraceDumpType::Snapshot => TRACE_SNAPSHOT_PREFIX,
        TraceDumpType::Recording => TRACE_RECORDING_PREFIX,
        TraceDumpType::Cache => TRACE_CACHE_PREFIX,
    }
}

/// Names a fresh output file from the current wall and boot clocks.
pub fn generate_trace_file_name(dir: &Path, dump_type: TraceDumpType) -> PathBuf {
    let label = Local::now().format(TIME_LABEL_FORMAT);
    let boot_ns = time::boot_time_ns();
    let name = format!(
        "{}{}@{}-{}.sys",
        trace_file_prefix(dump_type),
        label,
        boot_ns / S_TO_NS,
        boot_ns % S_TO_NS
    );
    dir.join(name)
}

/// Names an output file from the first/last page timestamps of the capture
/// it holds. Rejects inverted intervals.
pub fn generate_trace_file_name_by_trace_time(
    dir: &Path,
    dump_type: TraceDumpType,
    first_page_ns: u64,
    last_page_ns: u64,
) -> Option<PathBuf> {
    if first_page_ns >= last_page_ns {
        error!(first_page_ns, last_page_ns, "inverted page time interval");
        return None;
    }
    let duration_ms = (last_page_ns - first_page_ns) / MS_TO_NS;
    let label = wall_label_for_page_time(first_page_ns)?;
    let name = format!(
        "{}{}@{}-{}.sys",
        trace_file_prefix(dump_type),
        label,
        first_page_ns / S_TO_NS,
        duration_ms
    );
    Some(dir.join(name))
}

fn wall_label_for_page_time(page_time_ns: u64) -> Option<String> {
    let ut_ms = time::boot_ns_to_unix_ms(page_time_ns);
    let stamp = Local.timestamp_millis_opt(ut_ms as i64).single()?;
    Some(stamp.format(TIME_LABEL_FORMAT).to_string())
}

/// Renames a finished dump so its label carries the capture window. The
/// portion of the file name before `trace_` (`record_`, `cache_`, the
/// directory) is preserved.
pub fn rename_trace_file(
    old_path: &Path,
    first_page_ns: u64,
    last_page_ns: u64,
) -> Option<PathBuf> {
    if first_page_ns >= last_page_ns {
        error!(
            first_page_ns,
            last_page_ns, "refusing rename for inverted page time interval"
        );
        return None;
    }
    let old_name = old_path.to_string_lossy();
    let index = old_name.find(TRACE_SNAPSHOT_PREFIX)?;
    let duration_ms = (last_page_ns - first_page_ns) / MS_TO_NS;
    let label = wall_label_for_page_time(first_page_ns)?;
    let new_name = format!(
        "{}{}{}@{}-{}.sys",
        &old_name[..index],
        TRACE_SNAPSHOT_PREFIX,
        label,
        first_page_ns / S_TO_NS,
        duration_ms
    );
    let new_path = PathBuf::from(new_name);
    if let Err(err) = std::fs::rename(old_path, &new_path) {
        error!(
            old = %old_path.display(),
            new = %new_path.display(),
            %err,
            "failed to rename trace file"
        );
        return None;
    }
    info!(old = %old_path.display(), new = %new_path.display(), "renamed trace file");
    Some(new_path)
}

/// Recovers the `[traceStartUtMs, traceEndUtMs]` window from a file name
/// produced by this module.
pub fn parse_window_from_file_name(path: &Path) -> Option<(u64, u64)> {
    let name = path.file_name()?.to_string_lossy();
    let index = name.find(TRACE_SNAPSHOT_PREFIX)?;
    let rest = &name[index + TRACE_SNAPSHOT_PREFIX.len()..];
    let (label, rest) = rest.split_at_checked(14)?;
    let naive = NaiveDateTime::parse_from_str(label, TIME_LABEL_FORMAT).ok()?;
    let start_ms = Local
        .from_local_datetime(&naive)
        .earliest()?
        .timestamp() as u64
        * S_TO_MS;
    let duration_ms: u64 = rest
        .strip_prefix('@')?
        .strip_suffix(".sys")?
        .rsplit_once('-')?
        .1
        .parse()
        .ok()?;
    Some((start_ms, start_ms + duration_ms))
}

/// Files in `dir` with the prefix of `dump_type`, sorted by ctime ascending.
pub fn trace_files_in_dir(dir: &Path, dump_type: TraceDumpType) -> Vec<TraceFileInfo> {
    let prefix = trace_file_prefix(dump_type);
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            info!(dir = %dir.display(), %err, "trace directory not readable");
            return files;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        if let Ok(meta) = std::fs::metadata(&path) {
            files.push(TraceFileInfo {
                filename: path,
                ctime: meta.ctime(),
                file_size: meta.size(),
                trace_start_ut_ms: 0,
                trace_end_ut_ms: 0,
                is_new_file: false,
            });
        }
    }
    files.sort_by_key(|f| f.ctime);
    files
}

/// Scans `dir` and keeps only the files whose names parse into a capture
/// window, populating `trace_start_ut_ms`/`trace_end_ut_ms`.
pub fn refresh_trace_vec(dir: &Path, dump_type: TraceDumpType) -> Vec<TraceFileInfo> {
    let mut out = Vec::new();
    for mut info in trace_files_in_dir(dir, dump_type) {
        let Some((start_ms, end_ms)) = parse_window_from_file_name(&info.filename) else {
            continue;
        };
        info.trace_start_ut_ms = start_ms;
        info.trace_end_ut_ms = end_ms;
        out.push(info);
    }
    out
}

/// Deletes cache files whose end falls outside `[now − 30 s, now]`; such a
/// file is either drifted or left over from an earlier boot.
pub fn clear_cache_trace_file_by_duration(cache_files: &mut Vec<TraceFileInfo>) {
    let now_ms = time::unix_time_ms();
    let low = now_ms.saturating_sub(DEFAULT_CACHE_TRACE_DURATION_S * S_TO_MS);
    cache_files.retain(|info| {
        let stale = info.trace_end_ut_ms < low || info.trace_end_ut_ms > now_ms;
        if stale {
            match std::fs::remove_file(&info.filename) {
                Ok(()) => info!(file = %info.filename.display(), "deleted stale cache file"),
                Err(err) => {
                    error!(file = %info.filename.display(), %err, "failed to delete stale cache file")
                }
            }
        }
        !stale
    });
}

/// Deletes oldest cache files until the total size fits `file_size_limit`
/// bytes.
pub fn clear_cache_trace_file_by_size(cache_files: &mut Vec<TraceFileInfo>, file_size_limit: u64) {
    let mut total: u64 = cache_files.iter().map(|f| f.file_size).sum();
    while total > file_size_limit && !cache_files.is_empty() {
        let oldest = cache_files.remove(0);
        match std::fs::remove_file(&oldest.filename) {
            Ok(()) => {
                total -= oldest.file_size;
                info!(file = %oldest.filename.display(), "deleted cache file over size limit");
            }
            Err(err) => {
                error!(file = %oldest.filename.display(), %err, "failed to delete cache file");
                total -= oldest.file_size;
            }
        }
    }
}

/// Snapshot ageing before a new dump: keep the newest `keep_count` files.
pub fn handle_snapshot_ageing(snapshot_files: &mut Vec<TraceFileInfo>, keep_count: usize) {
    while snapshot_files.len() > keep_count {
        let oldest = snapshot_files.remove(0);
        if remove_file(&oldest.filename) {
            info!(file = %oldest.filename.display(), "aged out snapshot file");
        }
    }
}

/// Recording ageing between loop rotations: keep the newest `file_limit`
/// files (defaulting when zero).
pub fn del_old_record_trace_files(record_files: &mut Vec<TraceFileInfo>, file_limit: usize) {
    let keep = if file_limit == 0 {
        DEFAULT_RECORD_FILE_LIMIT
    } else {
        file_limit
    };
    while record_files.len() > keep {
        let oldest = record_files.remove(0);
        if remove_file(&oldest.filename) {
            info!(file = %oldest.filename.display(), "aged out recording file");
        }
    }
}

/// Removes a file, skipping it when another process holds the advisory
/// lock (a reader may be copying it out).
pub fn remove_file(path: &Path) -> bool {
    let file = match OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
    {
        Ok(file) => file,
        Err(err) => {
            warn!(file = %path.display(), %err, "open for removal failed");
            return false;
        }
    };
    let _lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock,
        Err((_, err)) => {
            warn!(file = %path.display(), %err, "file is locked, skip removal");
            return false;
        }
    };
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(file = %path.display(), "deleted trace file");
            true
        }
        Err(err) => {
            warn!(file = %path.display(), %err, "failed to delete trace file");
            false
        }
    }
}

pub fn file_size(path: &Path) -> u64 {
    match std::fs::metadata(path) {
        Ok(meta) => meta.size(),
        Err(err) => {
            error!(file = %path.display(), %err, "failed to stat trace file");
            0
        }
    }
}

/// Final step of a successful dump: rename the output to its window-bound
/// name (when it exists on disk) and populate the published metadata.
/// Returns `None` when the rename fails; the caller removes the orphan.
pub fn set_file_info(
    is_file_exist: bool,
    out_path: &Path,
    first_page_ns: u64,
    last_page_ns: u64,
) -> Option<TraceFileInfo> {
    let filename = if is_file_exist {
        rename_trace_file(out_path, first_page_ns, last_page_ns)?
    } else {
        out_path.to_path_buf()
    };
    Some(TraceFileInfo {
        file_size: if is_file_exist { file_size(&filename) } else { 0 },
        filename,
        ctime: 0,
        trace_start_ut_ms: time::boot_ns_to_unix_ms(first_page_ns),
        trace_end_ut_ms: time::boot_ns_to_unix_ms(last_page_ns),
        is_new_file: true,
    })
}

/// Promotes a cached slice into the snapshot pool by stripping the
/// `cache_` name prefix. Returns the original path when nothing was done.
pub fn rename_cache_file(cache_file: &Path) -> PathBuf {
    let Some(name) = cache_file.file_name().map(|n| n.to_string_lossy().to_string()) else {
        return cache_file.to_path_buf();
    };
    let Some(stripped) = name.strip_prefix(CACHE_FILE_PREFIX) else {
        return cache_file.to_path_buf();
    };
    let new_path = cache_file.with_file_name(stripped);
    match std::fs::rename(cache_file, &new_path) {
        Ok(()) => {
            info!(old = %cache_file.display(), new = %new_path.display(), "promoted cache file");
            new_path
        }
        Err(err) => {
            error!(old = %cache_file.display(), %err, "failed to promote cache file");
            cache_file.to_path_buf()
        }
    }
}

/// Drops the persisted events-format cache so the next capture rebuilds it
/// against the current tag set.
pub fn del_saved_events_format(dir: &Path) {
    let path = dir.join(SAVED_EVENTS_FORMAT);
    if !path.exists() {
        return;
    }
    match std::fs::remove_file(&path) {
        Ok(()) => info!("deleted saved_events_format"),
        Err(err) => error!(%err, "failed to delete saved_events_format"),
    }
}

fn xattr_cstrings(path: &Path) -> anyhow::Result<(CString, CString)> {
    use std::os::unix::ffi::OsStrExt;
    let path = CString::new(path.as_os_str().as_bytes())?;
    let name = CString::new(XATTR_LINK_NAME)?;
    Ok((path, name))
}

fn read_link_xattr(path: &CString, name: &CString) -> Option<u32> {
    let mut buf = [0u8; 32];
    // SAFETY: path and name are NUL-terminated; buf is a valid out-buffer.
    let len = unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if len < 0 {
        return None;
    }
    std::str::from_utf8(&buf[..len as usize])
        .ok()?
        .parse()
        .ok()
}

fn write_link_xattr(path: &CString, name: &CString, value: u32) -> anyhow::Result<()> {
    let text = value.to_string();
    // SAFETY: all pointers are valid for the duration of the call.
    let rc = unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            text.as_ptr().cast(),
            text.len(),
            0,
        )
    };
    if rc != 0 {
        anyhow::bail!("setxattr failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

/// Increments the symlink reference count carried in an extended attribute
/// on the output file, initialising it to 1.
pub fn add_symlink_xattr(file: &Path) -> anyhow::Result<()> {
    let (path, name) = xattr_cstrings(file)?;
    let next = read_link_xattr(&path, &name).map_or(1, |n| n + 1);
    write_link_xattr(&path, &name, next)
}

/// Decrements the symlink reference count, removing the attribute at zero.
/// A missing or unreadable counter is an error; a file moved across
/// filesystems loses its xattrs and must not silently drop links.
pub fn remove_symlink_xattr(file: &Path) -> anyhow::Result<()> {
    let (path, name) = xattr_cstrings(file)?;
    let Some(current) = read_link_xattr(&path, &name) else {
        anyhow::bail!(
            "symlink refcount missing on {} (moved across filesystems?)",
            file.display()
        );
    };
    match current {
        0 => anyhow::bail!("illegal symlink refcount 0 on {}", file.display()),
        1 => {
            // SAFETY: path and name are NUL-terminated.
            let rc = unsafe { libc::removexattr(path.as_ptr(), name.as_ptr()) };
            if rc != 0 {
                anyhow::bail!("removexattr failed: {}", std::io::Error::last_os_error());
            }
            Ok(())
        }
        n => write_link_xattr(&path, &name, n - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::OpenOptionsExt;
    use tempfile::TempDir;

    fn label_of(path: &Path) -> String {
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        let at = name.find('@').unwrap();
        name[at - 14..at].to_string()
    }

    #[test]
    fn test_generate_trace_file_name_shape() {
        let dir = TempDir::new().unwrap();
        let path = generate_trace_file_name(dir.path(), TraceDumpType::Snapshot);
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(TRACE_SNAPSHOT_PREFIX));
        assert!(name.ends_with(".sys"));
        assert!(name.contains('@'));
        assert_eq!(label_of(&path).len(), 14);
        assert!(label_of(&path).chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_generate_by_trace_time_rejects_inverted_interval() {
        let dir = TempDir::new().unwrap();
        assert!(generate_trace_file_name_by_trace_time(
            dir.path(),
            TraceDumpType::Snapshot,
            100,
            100
        )
        .is_none());
        assert!(generate_trace_file_name_by_trace_time(
            dir.path(),
            TraceDumpType::Snapshot,
            200,
            100
        )
        .is_none());
    }

    #[test]
    fn test_generate_by_trace_time_encodes_duration() {
        let dir = TempDir::new().unwrap();
        let first = libkt_common::time::boot_time_ns();
        let last = first + 5 * S_TO_NS;
        let path = generate_trace_file_name_by_trace_time(
            dir.path(),
            TraceDumpType::Cache,
            first,
            last,
        )
        .unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(TRACE_CACHE_PREFIX));
        assert!(name.ends_with("-5000.sys"));
    }

    #[test]
    fn test_parse_window_round_trip() {
        let path = Path::new("/tmp/trace_20250101120000@123-45000.sys");
        let (start, end) = parse_window_from_file_name(path).unwrap();
        assert_eq!(end - start, 45000);
        let expected = Local
            .from_local_datetime(
                &NaiveDateTime::parse_from_str("20250101120000", TIME_LABEL_FORMAT).unwrap(),
            )
            .earliest()
            .unwrap()
            .timestamp() as u64
            * S_TO_MS;
        assert_eq!(start, expected);
    }

    #[test]
    fn test_parse_window_rejects_malformed_names() {
        assert!(parse_window_from_file_name(Path::new("/tmp/other.sys")).is_none());
        assert!(parse_window_from_file_name(Path::new("/tmp/trace_x.sys")).is_none());
        assert!(
            parse_window_from_file_name(Path::new("/tmp/trace_20250101120000@1.sys")).is_none()
        );
    }

    #[test]
    fn test_rename_preserves_recording_prefix() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("record_trace_20250101120000@1-2.sys");
        fs::write(&old, b"x").unwrap();
        let first = libkt_common::time::boot_time_ns();
        let renamed = rename_trace_file(&old, first, first + 3 * S_TO_NS).unwrap();
        let name = renamed.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(TRACE_RECORDING_PREFIX));
        assert!(name.ends_with("-3000.sys"));
        assert!(!old.exists());
        assert!(renamed.exists());
    }

    #[test]
    fn test_trace_files_in_dir_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("trace_a.sys"), b"1").unwrap();
        fs::write(dir.path().join("record_trace_b.sys"), b"22").unwrap();
        fs::write(dir.path().join("cache_trace_c.sys"), b"333").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"").unwrap();

        let snapshots = trace_files_in_dir(dir.path(), TraceDumpType::Snapshot);
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].filename.ends_with("trace_a.sys"));

        let recordings = trace_files_in_dir(dir.path(), TraceDumpType::Recording);
        assert_eq!(recordings.len(), 1);
        let caches = trace_files_in_dir(dir.path(), TraceDumpType::Cache);
        assert_eq!(caches.len(), 1);
    }

    #[test]
    fn test_refresh_trace_vec_parses_windows() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("trace_20250101120000@9-2000.sys"),
            b"payload",
        )
        .unwrap();
        fs::write(dir.path().join("trace_garbage.sys"), b"").unwrap();
        let vec = refresh_trace_vec(dir.path(), TraceDumpType::Snapshot);
        assert_eq!(vec.len(), 1);
        assert_eq!(
            vec[0].trace_end_ut_ms - vec[0].trace_start_ut_ms,
            2000
        );
        assert_eq!(vec[0].file_size, 7);
    }

    #[test]
    fn test_clear_cache_by_duration_removes_stale() {
        let dir = TempDir::new().unwrap();
        let now_ms = time::unix_time_ms();
        let fresh = dir.path().join("cache_trace_fresh.sys");
        let stale = dir.path().join("cache_trace_stale.sys");
        fs::write(&fresh, b"").unwrap();
        fs::write(&stale, b"").unwrap();
        let mut files = vec![
            TraceFileInfo {
                filename: fresh.clone(),
                trace_end_ut_ms: now_ms.saturating_sub(S_TO_MS),
                ..Default::default()
            },
            TraceFileInfo {
                filename: stale.clone(),
                trace_end_ut_ms: now_ms.saturating_sub(120 * S_TO_MS),
                ..Default::default()
            },
        ];
        clear_cache_trace_file_by_duration(&mut files);
        assert_eq!(files.len(), 1);
        assert!(fresh.exists());
        assert!(!stale.exists());
    }

    #[test]
    fn test_clear_cache_by_size_deletes_oldest_first() {
        let dir = TempDir::new().unwrap();
        let mut files = Vec::new();
        for i in 0..3 {
            let path = dir.path().join(format!("cache_trace_{i}.sys"));
            fs::write(&path, vec![0u8; 100]).unwrap();
            files.push(TraceFileInfo {
                filename: path,
                file_size: 100,
                ..Default::default()
            });
        }
        clear_cache_trace_file_by_size(&mut files, 150);
        assert_eq!(files.len(), 1);
        assert!(files[0].filename.ends_with("cache_trace_2.sys"));
    }

    #[test]
    fn test_snapshot_ageing_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let mut files = Vec::new();
        for i in 0..4 {
            let path = dir.path().join(format!("trace_{i}.sys"));
            fs::write(&path, b"x").unwrap();
            files.push(TraceFileInfo {
                filename: path,
                ..Default::default()
            });
        }
        handle_snapshot_ageing(&mut files, 2);
        assert_eq!(files.len(), 2);
        assert!(files[0].filename.ends_with("trace_2.sys"));
        assert!(!dir.path().join("trace_0.sys").exists());
    }

    #[test]
    fn test_remove_file_skips_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace_locked.sys");
        fs::write(&path, b"x").unwrap();
        let holder = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .unwrap();
        let _held = Flock::lock(holder, FlockArg::LockExclusiveNonblock).unwrap();
        assert!(!remove_file(&path));
        assert!(path.exists());
    }

    #[test]
    fn test_rename_cache_file_strips_prefix() {
        let dir = TempDir::new().unwrap();
        let cached = dir.path().join("cache_trace_20250101120000@1-2.sys");
        fs::write(&cached, b"x").unwrap();
        let promoted = rename_cache_file(&cached);
        assert!(promoted.ends_with("trace_20250101120000@1-2.sys"));
        assert!(promoted.exists());
        assert!(!cached.exists());
        // A non-cache file passes through untouched.
        let plain = dir.path().join("trace_plain.sys");
        fs::write(&plain, b"x").unwrap();
        assert_eq!(rename_cache_file(&plain), plain);
    }

    #[test]
    fn test_set_file_info_populates_window() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("trace_raw.sys");
        fs::write(&out, vec![0u8; 64]).unwrap();
        let first = libkt_common::time::boot_time_ns();
        let info = set_file_info(true, &out, first, first + S_TO_NS).unwrap();
        assert!(info.is_new_file);
        assert_eq!(info.file_size, 64);
        assert_eq!(info.trace_end_ut_ms - info.trace_start_ut_ms, S_TO_MS);
        assert!(info.filename.exists());
    }

    #[test]
    fn test_set_file_info_rejects_bad_interval() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("trace_raw.sys");
        fs::write(&out, b"x").unwrap();
        assert!(set_file_info(true, &out, 10, 10).is_none());
    }

    #[test]
    fn test_symlink_xattr_counting() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace_linked.sys");
        fs::write(&path, b"x").unwrap();
        if add_symlink_xattr(&path).is_err() {
            // Filesystem without user xattr support; nothing to verify here.
            return;
        }
        add_symlink_xattr(&path).unwrap();
        remove_symlink_xattr(&path).unwrap();
        remove_symlink_xattr(&path).unwrap();
        // Third removal finds no counter and must surface the error.
        assert!(remove_symlink_xattr(&path).is_err());
    }
}
