// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-phase hooks.
//!
//! A [`HookRegistry`] is an ordered list of callbacks, each keyed by the
//! build [`Phase`] it runs in and a [`ToolchainFilter`] saying which
//! toolchains activate it. The build pipeline calls
//! [`HookRegistry::dispatch`] at each phase; hooks run synchronously in
//! registration order, and a phase with no matching hooks does nothing.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::report::Reporter;
use crate::target::TargetProfile;

/// Points in the build at which hooks may run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    PreCompile,
    PostCompile,
    PreLink,
    PostLink,
    PreBinary,
    /// After the raw binary has been extracted from the linked image. Image
    /// composers run here.
    PostBinary,
}

/// Selects the toolchains for which a hook fires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolchainFilter {
    Any,
    OneOf(Vec<String>),
}

impl ToolchainFilter {
    pub fn matches(&self, toolchain: &str) -> bool {
        match self {
            ToolchainFilter::Any => true,
            ToolchainFilter::OneOf(names) => {
                names.iter().any(|n| n == toolchain)
            }
        }
    }
}

/// Everything a hook may touch. Paths are owned by the pipeline; hooks have
/// exclusive use of them for the duration of the call.
pub struct HookContext<'a> {
    pub target: &'a TargetProfile,
    /// Raw build output: a flat binary, or a directory of region files.
    pub output: &'a Path,
    /// Auxiliary hex images discovered by the pipeline. Read-only.
    pub hex_files: &'a [PathBuf],
    pub reporter: &'a dyn Reporter,
}

pub trait Hook {
    fn run(&self, ctx: &HookContext<'_>) -> Result<()>;
}

impl<F> Hook for F
where
    F: Fn(&HookContext<'_>) -> Result<()>,
{
    fn run(&self, ctx: &HookContext<'_>) -> Result<()> {
        self(ctx)
    }
}

struct Entry {
    phase: Phase,
    filter: ToolchainFilter,
    hook: Box<dyn Hook>,
}

#[derive(Default)]
pub struct HookRegistry {
    entries: Vec<Entry>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry for one target, containing its composer if it has
    /// one.
    pub fn for_target(target: &TargetProfile) -> Self {
        let mut hooks = Self::new();
        target.init_hooks(&mut hooks);
        hooks
    }

    pub fn register(
        &mut self,
        phase: Phase,
        filter: ToolchainFilter,
        hook: impl Hook + 'static,
    ) {
        self.entries.push(Entry {
            phase,
            filter,
            hook: Box::new(hook),
        });
    }

    /// Registers a closure; provides the signature the closure needs for
    /// its argument lifetimes to be inferred.
    pub fn register_fn<F>(
        &mut self,
        phase: Phase,
        filter: ToolchainFilter,
        f: F,
    ) where
        F: Fn(&HookContext<'_>) -> Result<()> + 'static,
    {
        self.register(phase, filter, f);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of hooks that would fire for `phase` under `toolchain`.
    pub fn matching(&self, phase: Phase, toolchain: &str) -> usize {
        self.active(phase, toolchain).count()
    }

    /// Runs every hook registered for `phase` whose filter accepts
    /// `toolchain`, in registration order.
    ///
    /// The first failure is reported on the context's error channel and
    /// returned; later hooks for the phase do not run.
    pub fn dispatch(
        &self,
        phase: Phase,
        toolchain: &str,
        ctx: &HookContext<'_>,
    ) -> Result<()> {
        for entry in self.active(phase, toolchain) {
            if let Err(e) = entry.hook.run(ctx) {
                ctx.reporter.error(&format!(
                    "{} {:?} hook failed: {:#}",
                    ctx.target.id, phase, e
                ));
                return Err(e);
            }
        }
        Ok(())
    }

    fn active<'a>(
        &'a self,
        phase: Phase,
        toolchain: &'a str,
    ) -> impl Iterator<Item = &'a Entry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.phase == phase && e.filter.matches(toolchain))
    }
}
