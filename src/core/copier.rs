use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{Instrument, debug, info, info_span};

use crate::error::CopyError;

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
}

/// Result of scanning a version directory
struct ScanResult {
    /// All files found (absolute paths)
    files: Vec<PathBuf>,
    /// All directories found, parents before children
    directories: Vec<PathBuf>,
}

/// Copy `source_root/version` onto the root of `target`.
///
/// The first failing item aborts the copy. Files already written stay on
/// the target.
pub async fn copy_version(source_root: &Path, version: &str, target: &Path) -> Result<CopyStats, CopyError> {
    let source = source_root.join(version);
    let target = target.to_path_buf();

    if !source.is_dir() {
        return Err(CopyError::SourceMissing(source));
    }

    let span = info_span!(
        "copy_version",
        version = %version,
        target = %target.display()
    );

    async move {
        info!("Starting version copy");
        let start_time = Instant::now();

        let stats = tokio::task::spawn_blocking(move || {
            let scan = scan_tree(&source)?;
            debug!(
                files = scan.files.len(),
                directories = scan.directories.len(),
                "Scan complete"
            );
            copy_tree(&source, &target, &scan)
        })
        .await
        .map_err(|e| CopyError::Task(e.to_string()))??;

        info!(
            files = stats.files,
            directories = stats.directories,
            total_bytes = stats.bytes,
            duration_ms = start_time.elapsed().as_millis() as u64,
            "Version copy complete"
        );
        Ok(stats)
    }
    .instrument(span)
    .await
}

fn scan_tree(source: &Path) -> Result<ScanResult, CopyError> {
    let mut scan = ScanResult {
        files: Vec::new(),
        directories: Vec::new(),
    };
    scan_recursive(source, &mut scan)?;
    Ok(scan)
}

fn scan_recursive(current: &Path, scan: &mut ScanResult) -> Result<(), CopyError> {
    let io_err = |action: &'static str, path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| CopyError::Io { action, path, source }
    };

    let entries = fs::read_dir(current).map_err(io_err("Failed to read directory", current))?;
    let mut children = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err("Failed to read directory entry in", current))?;
        children.push(entry.path());
    }
    children.sort();

    for path in children {
        // Follow symlinks so linked content lands on the card as regular files.
        let metadata = fs::metadata(&path).map_err(io_err("Failed to read metadata of", &path))?;
        if metadata.is_dir() {
            scan.directories.push(path.clone());
            scan_recursive(&path, scan)?;
        } else if metadata.is_file() {
            scan.files.push(path);
        }
    }
    Ok(())
}

fn copy_tree(source: &Path, target: &Path, scan: &ScanResult) -> Result<CopyStats, CopyError> {
    let mut stats = CopyStats::default();

    for dir in &scan.directories {
        let dest_dir = target.join(relative(source, dir));
        fs::create_dir_all(&dest_dir).map_err(|e| CopyError::Io {
            action: "Failed to create directory",
            path: dest_dir.clone(),
            source: e,
        })?;
        stats.directories += 1;
    }

    for file in &scan.files {
        let dest = target.join(relative(source, file));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| CopyError::Io {
                action: "Failed to create directory",
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        debug!(file = %dest.display(), "Copying file");
        stats.bytes += copy_single_file(file, &dest)?;
        stats.files += 1;
    }

    Ok(stats)
}

fn relative<'a>(base: &Path, path: &'a Path) -> &'a Path {
    path.strip_prefix(base).unwrap_or(path)
}

/// Copy a single file, then carry over permissions and timestamps
fn copy_single_file(source: &Path, dest: &Path) -> Result<u64, CopyError> {
    let read_err = |action: &'static str| {
        move |e: io::Error| CopyError::Io {
            action,
            path: source.to_path_buf(),
            source: e,
        }
    };
    let write_err = |action: &'static str| {
        move |e: io::Error| CopyError::Io {
            action,
            path: dest.to_path_buf(),
            source: e,
        }
    };

    let source_metadata = fs::metadata(source).map_err(read_err("Failed to read source metadata of"))?;
    let source_file = File::open(source).map_err(read_err("Failed to open source file"))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

    let dest_file = File::create(dest).map_err(write_err("Failed to create destination file"))?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;
    loop {
        let bytes_read = reader.read(&mut buffer).map_err(read_err("Failed to read from"))?;
        if bytes_read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..bytes_read])
            .map_err(write_err("Failed to write to"))?;
        bytes_written += bytes_read as u64;
    }

    let inner = writer
        .into_inner()
        .map_err(|e| write_err("Failed to flush")(e.into_error()))?;
    // Removable media is pulled right after a write; make sure data hit the card.
    inner.sync_all().map_err(write_err("Failed to sync"))?;
    drop(inner);

    if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
        // FAT/exFAT have no permission bits
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }

    let atime = filetime::FileTime::from_last_access_time(&source_metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&source_metadata);
    filetime::set_file_times(dest, atime, mtime).map_err(write_err("Failed to set timestamps on"))?;

    Ok(bytes_written)
}
