//! ZIP archiving of the export tree.

use std::fs::File;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Compress the contents of `source` into a new archive at `archive_path`.
///
/// Entry names are relative to `source`; empty directories are kept.
/// Returns the number of files written.
pub async fn compress_dir(source: &Path, archive_path: &Path) -> Result<usize> {
    let source = source.to_path_buf();
    let archive_path = archive_path.to_path_buf();

    tokio::task::spawn_blocking(move || compress_dir_blocking(&source, &archive_path))
        .await
        .context("archive task failed")?
}

fn compress_dir_blocking(source: &Path, archive_path: &Path) -> Result<usize> {
    let file = File::create(archive_path)
        .with_context(|| format!("creating archive {}", archive_path.display()))?;
    let mut zip = ZipWriter::new(file);
    let files = add_tree(&mut zip, source)?;

    let mut file = zip.finish().context("finalising archive")?;
    file.flush().context("flushing archive")?;
    file.sync_all().context("syncing archive")?;

    Ok(files)
}

fn add_tree<W: Write + Seek>(zip: &mut ZipWriter<W>, root: &Path) -> Result<usize> {
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);
    let mut files = 0;

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        let path = entry.path();
        if path == root {
            continue;
        }
        let relative = entry_name(root, path);

        if entry.file_type().is_file() {
            zip.start_file(relative.as_str(), options)
                .with_context(|| format!("adding {relative}"))?;
            let mut input =
                File::open(path).with_context(|| format!("opening {}", path.display()))?;
            std::io::copy(&mut input, zip).with_context(|| format!("compressing {relative}"))?;
            files += 1;
        } else if entry.file_type().is_dir() {
            zip.add_directory(format!("{relative}/").as_str(), options)
                .with_context(|| format!("adding directory {relative}"))?;
        }
    }

    Ok(files)
}

/// Archive entry name: `/`-separated path relative to `root`.
fn entry_name(root: &Path, path: &Path) -> String {
    let relative: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
