// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Joins two linker output regions into one flat image.
//!
//! Some toolchains emit a directory instead of a binary when the image spans
//! internal flash and an external flash window. The directory holds one file
//! per region; we pad the internal region out to its full size and append the
//! external one, then put the result where the directory was.
//!
//! The swap is ordered so that a failure never loses both the regions and the
//! combined image: the directory is moved aside, the image is moved into its
//! place, and only then is the old directory deleted. If the image cannot be
//! moved in, the directory is moved back.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tempfile::NamedTempFile;

use crate::report::Reporter;
use crate::FILL_BYTE;

/// Size of the internal flash region; the external region starts here.
pub const REGION_BOUNDARY: usize = 512 * 1024;

/// Read size used when copying the external region.
pub const CHUNK_SIZE: usize = 128 * 1024;

pub const INTERNAL_REGION: &str = "ER_IROM1";
pub const EXTERNAL_REGION: &str = "ER_IROM2";

/// Replaces the region directory at `output` with a flat binary. A regular
/// file at `output` is already flat and is left alone.
///
/// The result is staged in a temporary file next to `output`; if anything
/// fails, the region directory is left (or put back) where it was and the
/// temporary is removed.
pub fn compose(output: &Path, reporter: &dyn Reporter) -> Result<()> {
    if !output.is_dir() {
        return Ok(());
    }

    let internal_path = output.join(INTERNAL_REGION);
    let external_path = output.join(EXTERNAL_REGION);

    let mut data = std::fs::read(&internal_path).with_context(|| {
        format!("failed to read internal region {}", internal_path.display())
    })?;
    if data.len() > REGION_BOUNDARY {
        bail!(
            "internal region {} is {} bytes, which does not fit in {} bytes",
            internal_path.display(),
            data.len(),
            REGION_BOUNDARY
        );
    }
    data.resize(REGION_BOUNDARY, FILL_BYTE);

    let mut external = File::open(&external_path).with_context(|| {
        format!("failed to open external region {}", external_path.display())
    })?;

    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut staged = NamedTempFile::new_in(parent).with_context(|| {
        format!("failed to create temporary file in {}", parent.display())
    })?;
    staged.write_all(&data)?;

    let mut chunk = Vec::with_capacity(CHUNK_SIZE);
    loop {
        chunk.clear();
        let n = (&mut external)
            .take(CHUNK_SIZE as u64)
            .read_to_end(&mut chunk)
            .with_context(|| {
                format!("failed to read {}", external_path.display())
            })?;
        staged.write_all(&chunk)?;
        if n < CHUNK_SIZE {
            break;
        }
    }
    drop(external);

    replace_dir(staged, output, reporter)?;
    reporter.debug("Generated custom binary file (internal flash + SPIFI)");
    Ok(())
}

/// Puts `staged` where the region directory `output` was.
///
/// A leftover directory after a successful swap is reported but is not an
/// error; the combined image is already in place.
fn replace_dir(
    staged: NamedTempFile,
    output: &Path,
    reporter: &dyn Reporter,
) -> Result<()> {
    staged.as_file().sync_all().with_context(|| {
        format!("failed to sync {}", staged.path().display())
    })?;

    let aside = aside_path(output)?;
    if std::fs::symlink_metadata(&aside).is_ok() {
        bail!(
            "cannot move region directory {} aside: {} already exists",
            output.display(),
            aside.display()
        );
    }
    std::fs::rename(output, &aside).with_context(|| {
        format!("failed to move region directory {} aside", output.display())
    })?;

    if let Err(e) = staged.persist(output) {
        let err = anyhow::Error::new(e).context(format!(
            "failed to move combined image to {}",
            output.display()
        ));
        return match std::fs::rename(&aside, output) {
            Ok(()) => Err(err),
            Err(back) => Err(err.context(format!(
                "region directory left at {}: {}",
                aside.display(),
                back
            ))),
        };
    }

    if let Err(e) = std::fs::remove_dir_all(&aside) {
        reporter.error(&format!(
            "failed to remove old region directory {}: {}",
            aside.display(),
            e
        ));
    }
    Ok(())
}

/// Sibling of `output` that holds the region directory during the swap.
fn aside_path(output: &Path) -> Result<PathBuf> {
    let mut name = match output.file_name() {
        Some(n) => n.to_os_string(),
        None => bail!("{} does not name a directory", output.display()),
    };
    name.push(".regions");
    Ok(output.with_file_name(name))
}
