// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Policy-driven log rotation.
//!
//! Rotated generations live next to the live file as `<path>.1`, `<path>.2`
//! and so on, `1` being the most recent. With compression every generation
//! from `2` up is stored as `<path>.<n>.gz`; generation `1` stays plain so a
//! writer that still holds it open keeps appending to an uncompressed file.
//!
//! A rotation runs these steps and aborts on the first filesystem error:
//!
//! 1. shift generations `keep-1 ..= 1` up by one
//! 2. move the live content into generation `1`
//! 3. recreate an empty live file with the original mode and owner
//! 4. gzip generations `2 ..= keep`

mod timestamp;

pub use timestamp::{parse_line_timestamp, time_window};

use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::{debug, info};

use crate::policy::RotatePolicy;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum RotateError {
    #[error("{0} does not exist")]
    NotFound(PathBuf),
    #[error("rotation of {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl Fn(io::Error) -> RotateError + '_ {
    move |source| RotateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Path of generation `n`, compressed or not.
#[must_use]
pub fn generation_path(path: &Path, n: u32, gz: bool) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    if gz {
        name.push(".gz");
    }
    PathBuf::from(name)
}

/// True when the file reached the size threshold or is older than the age
/// threshold. Disabled thresholds never match.
#[must_use]
pub fn should_rotate(metadata: &Metadata, policy: &RotatePolicy, now: SystemTime) -> bool {
    if let Some(max_bytes) = policy.max_size_bytes() {
        if metadata.len() >= max_bytes {
            return true;
        }
    }
    if policy.max_age_days > 0 {
        let max_age = Duration::from_secs(policy.max_age_days.saturating_mul(SECS_PER_DAY));
        if let Ok(modified) = metadata.modified() {
            if now.duration_since(modified).unwrap_or_default() >= max_age {
                return true;
            }
        }
    }
    false
}

/// Rotates `path` when [`should_rotate`] says so. A missing file is an error
/// the caller is expected to skip.
pub fn rotate_if_needed(path: &Path, policy: &RotatePolicy) -> Result<bool, RotateError> {
    let metadata = stat(path)?.ok_or_else(|| RotateError::NotFound(path.to_path_buf()))?;
    if policy.keep < 1 || !should_rotate(&metadata, policy, SystemTime::now()) {
        return Ok(false);
    }
    rotate_whole(path, policy, &metadata)?;
    Ok(true)
}

/// Rotates `path` unconditionally. A missing file is not rotated and not an
/// error.
pub fn force_rotate(path: &Path, policy: &RotatePolicy) -> Result<bool, RotateError> {
    let Some(metadata) = stat(path)? else {
        debug!("Skipping forced rotation of missing {}", path.display());
        return Ok(false);
    };
    if policy.keep < 1 {
        return Ok(false);
    }
    rotate_whole(path, policy, &metadata)?;
    Ok(true)
}

/// Splits `path` at the first line stamped at or after `cutoff`: the lines
/// before it become generation 1, the rest stays live.
///
/// Without a layout this is a [`force_rotate`]. Nothing before the cutoff
/// means nothing to rotate; nothing after it rotates the whole file.
pub fn rotate_by_timestamp_cut<Tz: TimeZone>(
    path: &Path,
    policy: &RotatePolicy,
    layout: &str,
    cutoff: &DateTime<Tz>,
) -> Result<bool, RotateError> {
    if layout.trim().is_empty() {
        return force_rotate(path, policy);
    }
    let Some(metadata) = stat(path)? else {
        debug!("Skipping timestamp rotation of missing {}", path.display());
        return Ok(false);
    };
    if policy.keep < 1 {
        return Ok(false);
    }

    let cutoff = cutoff.with_timezone(&Utc);
    let mut file = File::open(path).map_err(io_error(path))?;
    let cut = find_cut_offset(&mut file, layout, &cutoff).map_err(io_error(path))?;
    let size = metadata.len();
    if cut == 0 {
        debug!("Nothing in {} predates {cutoff}", path.display());
        return Ok(false);
    }
    if cut >= size {
        rotate_whole(path, policy, &metadata)?;
        return Ok(true);
    }

    split_at(path, policy, &metadata, &mut file, cut)?;
    info!(
        "Rotated {} at byte {cut} of {size} ({} kept live)",
        path.display(),
        size - cut
    );
    Ok(true)
}

fn stat(path: &Path) -> Result<Option<Metadata>, RotateError> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path)(e)),
    }
}

/// Byte offset of the first line stamped at or after `cutoff`, or the number
/// of bytes read when no such line exists. Unparseable lines count as before.
fn find_cut_offset(file: &mut File, layout: &str, cutoff: &DateTime<Utc>) -> io::Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&*file);
    let mut offset = 0u64;
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            return Ok(offset);
        }
        let text = String::from_utf8_lossy(&line);
        if parse_line_timestamp(&text, layout).is_some_and(|ts| ts >= *cutoff) {
            return Ok(offset);
        }
        offset += read as u64;
    }
}

fn rotate_whole(path: &Path, policy: &RotatePolicy, metadata: &Metadata) -> Result<(), RotateError> {
    shift_generations(path, policy)?;
    move_file(path, &generation_path(path, 1, false))?;
    recreate_live(path, metadata)?;
    if policy.compress {
        compress_generations(path, policy.keep)?;
    }
    info!("Rotated {} ({} bytes)", path.display(), metadata.len());
    Ok(())
}

fn split_at(
    path: &Path,
    policy: &RotatePolicy,
    metadata: &Metadata,
    file: &mut File,
    cut: u64,
) -> Result<(), RotateError> {
    let err = io_error(path);
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut rotated = tempfile::Builder::new()
        .prefix(".logrelay-rotated")
        .tempfile_in(dir)
        .map_err(&err)?;
    let mut remaining = tempfile::Builder::new()
        .prefix(".logrelay-remaining")
        .tempfile_in(dir)
        .map_err(&err)?;

    file.seek(SeekFrom::Start(0)).map_err(&err)?;
    io::copy(&mut Read::by_ref(file).take(cut), &mut rotated).map_err(&err)?;
    io::copy(file, &mut remaining).map_err(&err)?;

    apply_ownership(rotated.path(), metadata).map_err(&err)?;
    apply_ownership(remaining.path(), metadata).map_err(&err)?;

    shift_generations(path, policy)?;
    rotated
        .persist(generation_path(path, 1, false))
        .map_err(|e| err(e.error))?;
    remaining.persist(path).map_err(|e| err(e.error))?;

    if policy.compress {
        compress_generations(path, policy.keep)?;
    }
    Ok(())
}

fn shift_generations(path: &Path, policy: &RotatePolicy) -> Result<(), RotateError> {
    for n in (1..policy.keep).rev() {
        if policy.compress && n >= 2 {
            move_file(
                &generation_path(path, n, true),
                &generation_path(path, n + 1, true),
            )?;
        }
        move_file(
            &generation_path(path, n, false),
            &generation_path(path, n + 1, false),
        )?;
    }
    Ok(())
}

/// Renames `from` over `to`. A missing `from` is a no-op.
fn move_file(from: &Path, to: &Path) -> Result<(), RotateError> {
    if fs::symlink_metadata(from).is_err() {
        return Ok(());
    }
    match fs::remove_file(to) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(io_error(to)(e)),
    }
    fs::rename(from, to).map_err(io_error(from))
}

fn recreate_live(path: &Path, metadata: &Metadata) -> Result<(), RotateError> {
    // no truncate: the writer may already have reopened the path
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(io_error(path))?;
    apply_ownership(path, metadata).map_err(io_error(path))
}

/// Copies mode bits, then owner and group on a best-effort basis.
fn apply_ownership(path: &Path, metadata: &Metadata) -> io::Result<()> {
    fs::set_permissions(path, metadata.permissions())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Err(e) = std::os::unix::fs::chown(path, Some(metadata.uid()), Some(metadata.gid()))
        {
            debug!("Could not chown {}: {e}", path.display());
        }
    }
    Ok(())
}

fn compress_generations(path: &Path, keep: u32) -> Result<(), RotateError> {
    for n in 2..=keep {
        let plain = generation_path(path, n, false);
        if !plain.exists() {
            continue;
        }
        let gz = generation_path(path, n, true);
        gzip_file(&plain, &gz).map_err(io_error(&plain))?;
        fs::remove_file(&plain).map_err(io_error(&plain))?;
        debug!("Compressed {}", gz.display());
    }
    Ok(())
}

fn gzip_file(from: &Path, to: &Path) -> io::Result<()> {
    let mut input = File::open(from)?;
    let metadata = input.metadata()?;
    let output = File::create(to)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.sync_all()?;
    apply_ownership(to, &metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    const LAYOUT: &str = "%Y-%m-%dT%H:%M:%S%z";

    fn policy(max_size_mb: u64, keep: u32, compress: bool) -> RotatePolicy {
        RotatePolicy {
            max_size_mb,
            keep,
            compress,
            max_age_days: 0,
        }
    }

    fn gunzip(path: &Path) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn stamped(minute: u32, msg: &str) -> String {
        format!("2024-05-14T10:{minute:02}:00+0000 {msg}\n")
    }

    #[test]
    fn test_under_thresholds_does_not_rotate() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        fs::write(&path, b"small\n").unwrap();
        assert!(!rotate_if_needed(&path, &policy(1, 3, true)).unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"small\n");
        assert!(!generation_path(&path, 1, false).exists());
    }

    #[test]
    fn test_size_threshold_rotates_with_compression() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        let content = vec![b'x'; 2 * 1024 * 1024];
        fs::write(&path, &content).unwrap();
        fs::write(generation_path(&path, 1, false), b"previous\n").unwrap();

        assert!(rotate_if_needed(&path, &policy(1, 2, true)).unwrap());

        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(fs::read(generation_path(&path, 1, false)).unwrap(), content);
        assert_eq!(gunzip(&generation_path(&path, 2, true)), b"previous\n");
        assert!(!generation_path(&path, 2, false).exists());
        assert!(!generation_path(&path, 1, true).exists());
    }

    #[test]
    fn test_generation_one_matches_prior_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        fs::write(&path, b"line1\nline2\n").unwrap();
        assert!(force_rotate(&path, &policy(0, 3, false)).unwrap());
        assert_eq!(fs::read(generation_path(&path, 1, false)).unwrap(), b"line1\nline2\n");
        assert!(fs::read(&path).unwrap().is_empty());
    }

    #[test]
    fn test_retention_over_many_rotations() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        let keep = 3;
        for round in 1..=6 {
            fs::write(&path, format!("round {round}\n")).unwrap();
            assert!(force_rotate(&path, &policy(0, keep, true)).unwrap());
        }

        assert_eq!(fs::read(generation_path(&path, 1, false)).unwrap(), b"round 6\n");
        assert_eq!(gunzip(&generation_path(&path, 2, true)), b"round 5\n");
        assert_eq!(gunzip(&generation_path(&path, 3, true)), b"round 4\n");
        for n in 2..=keep {
            assert!(!generation_path(&path, n, false).exists());
        }
        assert!(!generation_path(&path, 4, false).exists());
        assert!(!generation_path(&path, 4, true).exists());
    }

    #[test]
    fn test_missing_file_asymmetry() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("absent.log");
        assert!(matches!(
            rotate_if_needed(&path, &policy(1, 3, true)),
            Err(RotateError::NotFound(_))
        ));
        assert!(!force_rotate(&path, &policy(1, 3, true)).unwrap());
        assert!(!rotate_by_timestamp_cut(&path, &policy(1, 3, true), LAYOUT, &Utc::now()).unwrap());
    }

    #[test]
    fn test_keep_zero_never_rotates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        fs::write(&path, vec![b'x'; 2 * 1024 * 1024]).unwrap();
        assert!(!rotate_if_needed(&path, &policy(1, 0, true)).unwrap());
        assert!(!force_rotate(&path, &policy(1, 0, true)).unwrap());
        assert!(!generation_path(&path, 1, false).exists());
    }

    #[test]
    fn test_age_threshold() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        fs::write(&path, b"old\n").unwrap();
        let metadata = fs::metadata(&path).unwrap();
        let aged = RotatePolicy {
            max_age_days: 1,
            ..policy(0, 3, false)
        };
        let modified = metadata.modified().unwrap();
        assert!(!should_rotate(&metadata, &aged, modified + Duration::from_secs(3600)));
        assert!(should_rotate(
            &metadata,
            &aged,
            modified + Duration::from_secs(2 * SECS_PER_DAY)
        ));
        assert!(!should_rotate(
            &metadata,
            &policy(0, 3, false),
            modified + Duration::from_secs(365 * SECS_PER_DAY)
        ));
    }

    #[test]
    fn test_timestamp_cut_splits_on_line_boundary() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        let original = [
            stamped(0, "first"),
            "continuation without timestamp\n".to_string(),
            stamped(1, "second"),
            stamped(2, "third"),
            stamped(3, "fourth"),
        ]
        .concat();
        fs::write(&path, &original).unwrap();
        let cutoff = Utc.with_ymd_and_hms(2024, 5, 14, 10, 2, 0).unwrap();

        assert!(rotate_by_timestamp_cut(&path, &policy(0, 3, true), LAYOUT, &cutoff).unwrap());

        let old = fs::read_to_string(generation_path(&path, 1, false)).unwrap();
        let live = fs::read_to_string(&path).unwrap();
        assert_eq!(
            old,
            [
                stamped(0, "first"),
                "continuation without timestamp\n".to_string(),
                stamped(1, "second")
            ]
            .concat()
        );
        assert_eq!(live, [stamped(2, "third"), stamped(3, "fourth")].concat());
        assert_eq!(format!("{old}{live}"), original);
    }

    #[test]
    fn test_timestamp_cut_with_nothing_before_cutoff() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        fs::write(&path, stamped(5, "late")).unwrap();
        let cutoff = Utc.with_ymd_and_hms(2024, 5, 14, 10, 0, 0).unwrap();
        assert!(!rotate_by_timestamp_cut(&path, &policy(0, 3, true), LAYOUT, &cutoff).unwrap());
        assert!(!generation_path(&path, 1, false).exists());
    }

    #[test]
    fn test_timestamp_cut_with_everything_before_cutoff() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        let content = [stamped(0, "a"), stamped(1, "b")].concat();
        fs::write(&path, &content).unwrap();
        let cutoff = Utc.with_ymd_and_hms(2024, 5, 14, 11, 0, 0).unwrap();
        assert!(rotate_by_timestamp_cut(&path, &policy(0, 3, true), LAYOUT, &cutoff).unwrap());
        assert_eq!(fs::read_to_string(generation_path(&path, 1, false)).unwrap(), content);
        assert!(fs::read(&path).unwrap().is_empty());
    }

    #[test]
    fn test_empty_layout_forces_rotation() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        fs::write(&path, stamped(5, "late")).unwrap();
        assert!(rotate_by_timestamp_cut(&path, &policy(0, 3, true), "", &Utc::now()).unwrap());
        assert_eq!(
            fs::read_to_string(generation_path(&path, 1, false)).unwrap(),
            stamped(5, "late")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_mode_is_preserved() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        fs::write(&path, [stamped(0, "a"), stamped(9, "b")].concat()).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
        let cutoff = Utc.with_ymd_and_hms(2024, 5, 14, 10, 5, 0).unwrap();

        assert!(rotate_by_timestamp_cut(&path, &policy(0, 3, false), LAYOUT, &cutoff).unwrap());
        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&path), 0o640);
        assert_eq!(mode(&generation_path(&path, 1, false)), 0o640);

        assert!(force_rotate(&path, &policy(0, 3, false)).unwrap());
        assert_eq!(mode(&path), 0o640);
    }

    #[test]
    fn test_generation_path() {
        let path = Path::new("/var/log/app.log");
        assert_eq!(generation_path(path, 1, false), PathBuf::from("/var/log/app.log.1"));
        assert_eq!(generation_path(path, 3, true), PathBuf::from("/var/log/app.log.3.gz"));
    }
}
