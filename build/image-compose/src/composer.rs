// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Result;

use crate::hooks::{Hook, HookContext};
use crate::{concat, merge};

/// Post-binary processing a target can ask for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Composer {
    /// Flatten an internal + external flash region directory.
    RegionConcat,
    /// Combine a vendor stack hex image, picked out of the auxiliary hex
    /// files by `signature`, with the application binary.
    FirmwareMerge { signature: String },
}

impl Hook for Composer {
    fn run(&self, ctx: &HookContext<'_>) -> Result<()> {
        match self {
            Composer::RegionConcat => concat::compose(ctx.output, ctx.reporter),
            Composer::FirmwareMerge { signature } => merge::compose(
                signature,
                ctx.output,
                ctx.hex_files,
                ctx.reporter,
            ),
        }
    }
}
