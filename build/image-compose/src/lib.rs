// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Post-build image composition for firmware targets.
//!
//! After linking, the build pipeline looks up the active target in the
//! [`TargetTable`], builds its [`HookRegistry`], and dispatches
//! [`Phase::PostBinary`] with the toolchain that produced the output. Targets
//! that need it carry a [`Composer`], which turns the raw linker output into
//! the image that actually gets flashed:
//!
//! - [`Composer::RegionConcat`] flattens a directory of flash regions into
//!   one binary ([`concat`]).
//! - [`Composer::FirmwareMerge`] splices a vendor stack image with the
//!   application ([`merge`]).
//!
//! Composers assume exclusive access to the output path while they run and
//! report through the pipeline's [`Reporter`].

pub mod composer;
pub mod concat;
pub mod hooks;
pub mod image;
pub mod merge;
pub mod report;
pub mod target;

pub use composer::Composer;
pub use hooks::{Hook, HookContext, HookRegistry, Phase, ToolchainFilter};
pub use image::Image;
pub use report::{LogReporter, Reporter};
pub use target::{Core, TargetProfile, TargetTable};

/// Erased flash; used for all padding.
pub const FILL_BYTE: u8 = 0xff;
