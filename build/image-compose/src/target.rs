// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use indexmap::{IndexMap, IndexSet};
use serde::Deserialize;

use crate::composer::Composer;
use crate::hooks::{HookRegistry, Phase, ToolchainFilter};

/// The target table shipped with the crate.
const BUILTIN_TARGETS: &str = include_str!("../targets.toml");

/// ARM cores that targets may be built around.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Core {
    Arm7tdmiS,
    CortexM0,
    CortexM0Plus,
    CortexM3,
    CortexM4,
}

impl Core {
    pub const ALL: [Core; 5] = [
        Core::Arm7tdmiS,
        Core::CortexM0,
        Core::CortexM0Plus,
        Core::CortexM3,
        Core::CortexM4,
    ];

    /// Name as written in the target table.
    pub fn name(self) -> &'static str {
        match self {
            Core::Arm7tdmiS => "ARM7TDMI-S",
            Core::CortexM0 => "Cortex-M0",
            Core::CortexM0Plus => "Cortex-M0+",
            Core::CortexM3 => "Cortex-M3",
            Core::CortexM4 => "Cortex-M4",
        }
    }

    /// Short label contributed to a target's label list.
    pub fn short_label(self) -> &'static str {
        match self {
            Core::Arm7tdmiS => "ARM7",
            Core::CortexM0 => "M0",
            Core::CortexM0Plus => "M0P",
            Core::CortexM3 => "M3",
            Core::CortexM4 => "M4",
        }
    }
}

impl FromStr for Core {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Core::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| anyhow!("unknown core '{}'", s))
    }
}

/// A `RawTarget` is one `[targets.*]` entry as it appears in the table,
/// before the core and composer have been checked.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawTarget {
    core: String,
    #[serde(default)]
    extra_labels: Vec<String>,
    supported_toolchains: Vec<String>,
    #[serde(default)]
    disk_virtual: bool,
    composer: Option<RawComposer>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawComposer {
    kind: String,
    signature: Option<String>,
    hook_toolchains: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawTable {
    targets: IndexMap<String, RawTarget>,
}

/// Static description of one board variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetProfile {
    pub id: String,
    pub core: Core,
    pub extra_labels: Vec<String>,
    pub supported_toolchains: IndexSet<String>,
    /// Whether the interface chip presents a virtual disk for flashing.
    pub disk_virtual: bool,
    /// Post-processing applied to the raw binary, if any.
    pub composer: Option<Composer>,
    /// Toolchain names whose output activates `composer`.
    pub hook_toolchains: Vec<String>,
}

impl TargetProfile {
    fn from_raw(id: &str, raw: RawTarget) -> Result<Self> {
        let core = raw.core.parse()?;
        let (composer, hook_toolchains) = match raw.composer {
            Some(c) => {
                if c.hook_toolchains.is_empty() {
                    bail!("composer has no hook-toolchains");
                }
                let composer = match (c.kind.as_str(), c.signature) {
                    ("region-concat", None) => Composer::RegionConcat,
                    ("firmware-merge", Some(signature)) => {
                        Composer::FirmwareMerge { signature }
                    }
                    ("region-concat", Some(_)) => {
                        bail!("region-concat does not take a signature")
                    }
                    ("firmware-merge", None) => {
                        bail!("firmware-merge requires a signature")
                    }
                    (kind, _) => bail!("unknown composer kind '{}'", kind),
                };
                (Some(composer), c.hook_toolchains)
            }
            None => (None, vec![]),
        };

        Ok(TargetProfile {
            id: id.to_owned(),
            core,
            extra_labels: raw.extra_labels,
            supported_toolchains: raw
                .supported_toolchains
                .into_iter()
                .collect(),
            disk_virtual: raw.disk_virtual,
            composer,
            hook_toolchains,
        })
    }

    /// `[id, core label, extra labels...]`, in that order.
    pub fn labels(&self) -> Vec<String> {
        let mut labels = vec![self.id.clone(), self.core.short_label().into()];
        labels.extend(self.extra_labels.iter().cloned());
        labels
    }

    /// How long a flashing tool should wait after copying an image before
    /// the target is usable.
    pub fn program_cycle(&self) -> Duration {
        if self.disk_virtual {
            Duration::from_secs(4)
        } else {
            Duration::from_millis(1500)
        }
    }

    pub fn supports(&self, toolchain: &str) -> bool {
        self.supported_toolchains.contains(toolchain)
    }

    /// Registers this target's composer, if any, as a post-binary hook.
    pub fn init_hooks(&self, hooks: &mut HookRegistry) {
        if let Some(composer) = &self.composer {
            hooks.register(
                Phase::PostBinary,
                ToolchainFilter::OneOf(self.hook_toolchains.clone()),
                composer.clone(),
            );
        }
    }
}

/// Read-only map from target id to profile, in table order.
#[derive(Clone, Debug)]
pub struct TargetTable {
    targets: IndexMap<String, TargetProfile>,
}

impl TargetTable {
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_TARGETS)
            .context("failed to load built-in target table")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("failed to load {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: RawTable = toml::from_str(text)?;
        let mut targets = IndexMap::new();
        for (id, t) in raw.targets {
            let profile = TargetProfile::from_raw(&id, t)
                .with_context(|| format!("target {}", id))?;
            targets.insert(id, profile);
        }
        Ok(TargetTable { targets })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.targets.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetProfile> + '_ {
        self.targets.values()
    }

    pub fn get(&self, id: &str) -> Option<&TargetProfile> {
        self.targets.get(id)
    }

    /// Like `get`, but an unknown id is an error that suggests the closest
    /// known one.
    pub fn lookup(&self, id: &str) -> Result<&TargetProfile> {
        self.get(id)
            .ok_or_else(|| anyhow!("{}", self.name_suggestion(id)))
    }

    fn name_suggestion(&self, name: &str) -> String {
        // Suggest only for very small differences
        const MAX_DISTANCE: usize = 3;

        let mut scored: Vec<_> = self
            .names()
            .filter_map(|s| {
                let distance = strsim::damerau_levenshtein(name, s);
                if distance <= MAX_DISTANCE {
                    Some((distance, s))
                } else {
                    None
                }
            })
            .collect();
        scored.sort();
        let mut out = format!("'{}' is not a known target.", name);
        if let Some((_, s)) = scored.first() {
            out.push_str(&format!(" Did you mean '{}'?", s));
        }
        out
    }
}
