// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Combines a vendor stack image (e.g. a SoftDevice) with the application.
//!
//! Two artifacts come out of one merge:
//!
//! - a hex file next to the application binary holding stack and application
//!   together, and
//! - the application binary itself, overwritten with stack code, fill up to
//!   [`APPCODE_OFFSET`], then the original application bytes.
//!
//! The flat binary path needs the stack's configuration record (UICR) to
//! locate the end of the stack code: everything below the populated address
//! that precedes [`UICR_START`] is taken to be contiguous stack code.
//!
//! The binary is rewritten in place. If the process dies partway through
//! that write, the application binary is left truncated or half-written and
//! must be rebuilt.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::image::Image;
use crate::report::Reporter;
use crate::FILL_BYTE;

/// Load address of the application within the combined image.
pub const APPCODE_OFFSET: u32 = 0x14000;

/// Address of the configuration record owned by the stack image.
pub const UICR_START: u32 = 0x1000_1000;

/// Merges the first image in `hex_files` whose file name contains
/// `signature` with the application binary at `output`. Does nothing if no
/// image matches.
pub fn compose(
    signature: &str,
    output: &Path,
    hex_files: &[PathBuf],
    reporter: &dyn Reporter,
) -> Result<()> {
    let stack_path = match find_stack_image(signature, hex_files) {
        Some(p) => p,
        None => return Ok(()),
    };

    let app = std::fs::read(output)
        .with_context(|| format!("failed to read {}", output.display()))?;
    let stack = Image::from_hex_file(stack_path)?;

    let mut combined = stack.clone();
    combined
        .merge(&Image::from_binary(&app, APPCODE_OFFSET)?)
        .with_context(|| {
            format!(
                "{} and {} cannot be combined",
                stack_path.display(),
                output.display()
            )
        })?;
    let hex_path = output.with_extension("hex");
    combined.write_hex(&hex_path)?;
    reporter.debug(&format!(
        "Generated stack-enabled image in '{}'",
        hex_path.display()
    ));

    let code_size = stack_code_size(&stack)
        .with_context(|| format!("{}", stack_path.display()))?;
    reporter.debug(&format!("stack code size is {} bytes", code_size));

    let flat = flat_image(&stack, code_size, &app);
    overwrite(output, &flat)?;
    reporter.debug(&format!(
        "Generated concatenated binary of {} bytes",
        flat.len()
    ));
    Ok(())
}

fn find_stack_image<'a>(
    signature: &str,
    hex_files: &'a [PathBuf],
) -> Option<&'a Path> {
    hex_files
        .iter()
        .find(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().contains(signature))
        })
        .map(PathBuf::as_path)
}

/// Number of bytes of stack code at the bottom of the image, i.e. one past
/// the last populated address below the configuration record.
///
/// Addresses from zero up to that point are assumed to be contiguous.
pub fn stack_code_size(stack: &Image) -> Result<u32> {
    match stack.max_address() {
        Some(top) if top >= UICR_START => (),
        _ => bail!(
            "stack image does not have a configuration (UICR) area, aborting"
        ),
    }
    if !stack.contains(UICR_START) {
        bail!(
            "UICR start address {:#010x} not found in stack image, aborting",
            UICR_START
        );
    }
    let last = match stack.address_before(UICR_START) {
        Some(a) => a,
        None => bail!("stack image has no code below its UICR area"),
    };
    let size = last + 1;
    if size > APPCODE_OFFSET {
        bail!(
            "stack code ({} bytes) runs past the application offset {:#x}",
            size,
            APPCODE_OFFSET
        );
    }
    Ok(size)
}

/// Stack code, fill up to `APPCODE_OFFSET`, then the application.
fn flat_image(stack: &Image, code_size: u32, app: &[u8]) -> Vec<u8> {
    let mut out = stack.to_binary(0, code_size as usize, FILL_BYTE);
    out.resize(APPCODE_OFFSET as usize, FILL_BYTE);
    out.extend_from_slice(app);
    out
}

/// Rewrites `path` with `data` without staging. `data` is always at least as
/// long as the existing contents, but we set the length anyway.
fn overwrite(path: &Path, data: &[u8]) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    f.write_all(data)
        .and_then(|_| f.set_len(data.len() as u64))
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::testing::Recorder;

    const SIGNATURE: &str = "s110_nrf51822_6.0.0_softdevice.hex";

    fn app_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// A stack image with `code_len` bytes of code at zero, and a UICR record
    /// if requested.
    fn stack_image(code_len: usize, uicr: bool) -> Image {
        let code: Vec<u8> = (0..code_len).map(|i| (i * 7) as u8).collect();
        let mut image = Image::from_binary(&code, 0).unwrap();
        if uicr {
            image.insert(UICR_START, &[0x00, 0x80, 0x01, 0x00]).unwrap();
        }
        image
    }

    struct Fixture {
        dir: tempfile::TempDir,
        bin: PathBuf,
        hex_files: Vec<PathBuf>,
    }

    fn fixture(stack: &Image, app: &[u8]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("app.bin");
        std::fs::write(&bin, app).unwrap();

        let other = dir.path().join("unrelated.hex");
        Image::from_binary(&[1, 2, 3], 0x5000)
            .unwrap()
            .write_hex(&other)
            .unwrap();
        let sd = dir.path().join(SIGNATURE);
        stack.write_hex(&sd).unwrap();

        Fixture {
            bin,
            hex_files: vec![other, sd],
            dir,
        }
    }

    fn run(fx: &Fixture) -> Result<()> {
        compose(SIGNATURE, &fx.bin, &fx.hex_files, &Recorder::default())
    }

    #[test]
    fn merges_stack_and_application() {
        let code_len = 0x1_0c00;
        let stack = stack_image(code_len, true);
        let app = app_bytes(3000);
        let fx = fixture(&stack, &app);

        let rec = Recorder::default();
        compose(SIGNATURE, &fx.bin, &fx.hex_files, &rec).unwrap();

        let flat = std::fs::read(&fx.bin).unwrap();
        assert_eq!(flat.len(), APPCODE_OFFSET as usize + app.len());
        assert_eq!(flat[..code_len], stack.to_binary(0, code_len, 0)[..]);
        assert!(flat[code_len..APPCODE_OFFSET as usize]
            .iter()
            .all(|&b| b == FILL_BYTE));
        assert_eq!(&flat[APPCODE_OFFSET as usize..], &app[..]);

        let hex = Image::from_hex_file(&fx.dir.path().join("app.hex")).unwrap();
        let mut expected = stack.clone();
        expected.insert(APPCODE_OFFSET, &app).unwrap();
        assert_eq!(hex, expected);

        let debug = rec.debug.borrow();
        assert!(debug.iter().any(|m| m == "stack code size is 68608 bytes"));
        let done =
            format!("Generated concatenated binary of {} bytes", flat.len());
        assert!(debug.iter().any(|m| *m == done));
    }

    #[test]
    fn code_size_follows_last_address_before_uicr() {
        // A hole in the middle is tolerated; only the address right before
        // the UICR record matters.
        let mut stack = Image::new();
        stack.insert(0, &[0xaa; 0x100]).unwrap();
        stack.insert(0x200, &[0xbb; 0x10]).unwrap();
        stack.insert(UICR_START, &[0; 4]).unwrap();
        assert_eq!(stack_code_size(&stack).unwrap(), 0x210);

        let flat = flat_image(&stack, 0x210, b"app");
        assert_eq!(flat.len(), APPCODE_OFFSET as usize + 3);
        assert_eq!(flat[0xff], 0xaa);
        assert_eq!(flat[0x100], FILL_BYTE);
        assert_eq!(flat[0x20f], 0xbb);
        assert_eq!(flat[0x210], FILL_BYTE);
        assert_eq!(&flat[APPCODE_OFFSET as usize..], b"app");
    }

    #[test]
    fn missing_uicr_leaves_binary_untouched() {
        let stack = stack_image(0x8000, false);
        let app = app_bytes(100);
        let fx = fixture(&stack, &app);

        let err = run(&fx).unwrap_err();
        assert!(format!("{:#}", err).contains("UICR"), "{err:#}");
        assert_eq!(std::fs::read(&fx.bin).unwrap(), app);
        // The hex image does not depend on the UICR record.
        assert!(fx.dir.path().join("app.hex").is_file());
    }

    #[test]
    fn uicr_start_absent_but_area_present() {
        let mut stack = stack_image(0x8000, false);
        stack.insert(UICR_START + 0x14, &[0; 4]).unwrap();
        let app = app_bytes(100);
        let fx = fixture(&stack, &app);

        let err = run(&fx).unwrap_err();
        assert!(
            format!("{:#}", err)
                .contains("UICR start address 0x10001000 not found"),
            "{err:#}"
        );
        assert_eq!(std::fs::read(&fx.bin).unwrap(), app);
    }

    #[test]
    fn oversized_stack_is_rejected() {
        let stack = stack_image(APPCODE_OFFSET as usize + 1, true);
        assert!(stack_code_size(&stack).is_err());
    }

    #[test]
    fn overlap_is_fatal() {
        // Stack code reaching into the application's space.
        let stack = stack_image(APPCODE_OFFSET as usize + 0x10, true);
        let app = app_bytes(64);
        let fx = fixture(&stack, &app);

        let err = run(&fx).unwrap_err();
        assert!(format!("{:#}", err).contains("overlap"), "{err:#}");
        assert!(!fx.dir.path().join("app.hex").exists());
        assert_eq!(std::fs::read(&fx.bin).unwrap(), app);
    }

    #[test]
    fn no_matching_stack_is_a_no_op() {
        let stack = stack_image(0x100, true);
        let app = app_bytes(10);
        let fx = fixture(&stack, &app);
        let before = std::fs::read_dir(fx.dir.path()).unwrap().count();

        let rec = Recorder::default();
        let others = vec![fx.hex_files[0].clone()];
        compose(SIGNATURE, &fx.bin, &others, &rec).unwrap();

        assert_eq!(std::fs::read_dir(fx.dir.path()).unwrap().count(), before);
        assert_eq!(std::fs::read(&fx.bin).unwrap(), app);
        assert!(rec.debug.borrow().is_empty());
    }

    #[test]
    fn no_files_are_read_without_a_match() {
        // The output path does not even exist; no match means nothing is
        // opened.
        compose(
            SIGNATURE,
            Path::new("/nonexistent/app.bin"),
            &[PathBuf::from("/nonexistent/other.hex")],
            &Recorder::default(),
        )
        .unwrap();
    }

    #[test]
    fn signature_matches_file_name_only() {
        let files = vec![
            PathBuf::from(format!("/build/{SIGNATURE}/other.hex")),
            PathBuf::from(format!("/build/nrf/{SIGNATURE}")),
        ];
        assert_eq!(
            find_stack_image(SIGNATURE, &files),
            Some(files[1].as_path())
        );
        assert_eq!(find_stack_image(SIGNATURE, &files[..1]), None);
    }
}
