use std::fs::{self, File};
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};
use zip::ZipArchive;

/// Unpacks a zip archive into `dest`, returning the number of files written.
///
/// Entries whose path would land outside `dest` abort the extraction.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive)
        .with_context(|| format!("failed to open archive {}", archive.display()))?;
    let mut zip = ZipArchive::new(file)
        .with_context(|| format!("failed to read archive {}", archive.display()))?;
    fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;

    let mut files = 0;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| anyhow!("archive entry {} escapes the destination", entry.name()))?;
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)
            .with_context(|| format!("failed to create {}", target.display()))?;
        io::copy(&mut entry, &mut out)?;
        debug!(file = %target.display(), "extracted");
        files += 1;
    }
    info!(files, archive = %archive.display(), dest = %dest.display(), "extracted archive");
    Ok(files)
}
