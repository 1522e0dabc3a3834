use std::{fs, path::Path};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// How `enqueue` treats a request identical to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SentencePolicy {
    /// Later generations: drop `a == b` requests and immediate repeats.
    #[default]
    Coalesce,
    /// Earlier generations: every request is queued.
    Legacy,
}

/// What happens when a slot holding a cutscene override is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CutsceneStopPolicy {
    /// Record a violation and stop the slot anyway.
    #[default]
    Degrade,
    /// Abort the tick with `VmError::ConsistencyViolation`.
    Strict,
}

/// Global variable indices the runtime itself reads or writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WellKnownVars {
    pub override_var: Option<u16>,
    pub cutscene_start_script: Option<u16>,
    pub cutscene_end_script: Option<u16>,
    pub sentence_script: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub slot_count: usize,
    pub max_nesting: usize,
    pub cutscene_depth: usize,
    pub sentence_capacity: usize,
    pub num_variables: usize,
    pub num_bit_variables: usize,
    pub num_locals: usize,
    pub num_global_scripts: u16,
    pub sentence_policy: SentencePolicy,
    pub cutscene_stop_policy: CutsceneStopPolicy,
    pub well_known: WellKnownVars,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            slot_count: 25,
            max_nesting: 15,
            cutscene_depth: 5,
            sentence_capacity: 6,
            num_variables: 800,
            num_bit_variables: 4096,
            num_locals: 25,
            num_global_scripts: 200,
            sentence_policy: SentencePolicy::default(),
            cutscene_stop_policy: CutsceneStopPolicy::default(),
            well_known: WellKnownVars::default(),
        }
    }
}

impl VmConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read vm config: {}", path.display()))?;
        let config: VmConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse vm config json: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid vm config: {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.slot_count > 0, "slot_count must be non-zero");
        ensure!(self.max_nesting > 0, "max_nesting must be non-zero");
        ensure!(self.cutscene_depth > 0, "cutscene_depth must be non-zero");
        ensure!(self.sentence_capacity > 0, "sentence_capacity must be non-zero");
        ensure!(
            self.num_variables <= 0x1000,
            "num_variables {} does not fit the 12-bit global address space",
            self.num_variables
        );
        ensure!(
            self.num_bit_variables <= 0x8000,
            "num_bit_variables {} does not fit the 15-bit flag address space",
            self.num_bit_variables
        );
        for (name, index) in [
            ("override_var", self.well_known.override_var),
            ("cutscene_start_script", self.well_known.cutscene_start_script),
            ("cutscene_end_script", self.well_known.cutscene_end_script),
            ("sentence_script", self.well_known.sentence_script),
        ] {
            if let Some(index) = index {
                ensure!(
                    (index as usize) < self.num_variables,
                    "{name} points at variable {index} beyond num_variables {}",
                    self.num_variables
                );
            }
        }
        Ok(())
    }
}
