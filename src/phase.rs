//! Phase definitions and JSON loading.
//!
//! A run's phases come from `phases.json`:
//!
//! ```json
//! {
//!   "phases": [
//!     { "phase_id": "scaffold", "phase_number": 1, "name": "Scaffold",
//!       "instructions": "...", "deliverables": ["src/lib.rs"],
//!       "dependencies": [], "max_attempts": 3, "scope": ["src/"] }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use ratchet_common::{OutputFormat, Phase};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

/// One phase as written in `phases.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDefinition {
    pub phase_id: String,
    pub phase_number: u32,
    pub name: String,
    /// What the agent is asked to do in this phase
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Falls back to the executor's default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default, deserialize_with = "lenient_format")]
    pub output_format: OutputFormat,
}

impl PhaseDefinition {
    pub fn new(phase_id: &str, phase_number: u32, name: &str) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            phase_number,
            name: name.to_string(),
            instructions: String::new(),
            deliverables: Vec::new(),
            dependencies: Vec::new(),
            max_attempts: None,
            scope: Vec::new(),
            output_format: OutputFormat::default(),
        }
    }

    /// Build the runtime phase record for `run_id`.
    pub fn to_phase(&self, run_id: &str, default_max_attempts: u32) -> Phase {
        let mut phase = Phase::new(
            run_id,
            &self.phase_id,
            self.phase_number,
            &self.name,
            self.max_attempts.unwrap_or(default_max_attempts),
        );
        phase.dependencies = self.dependencies.clone();
        phase.instructions = self.instructions.clone();
        phase.deliverables = self.deliverables.clone();
        phase.scope = self.scope.clone();
        phase.output_format = self.output_format;
        phase
    }
}

fn lenient_format<'de, D>(deserializer: D) -> std::result::Result<OutputFormat, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "diff" | "unified_diff" => OutputFormat::Diff,
        "full_file" | "full_files" | "json" => OutputFormat::FullFile,
        "ndjson" | "jsonl" => OutputFormat::Ndjson,
        other => {
            warn!(format = other, "unknown output format, using diff");
            OutputFormat::Diff
        }
    })
}

/// The full `phases.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasesFile {
    pub phases: Vec<PhaseDefinition>,
}

impl PhasesFile {
    /// Load and validate phases from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phases file: {}", path.display()))?;
        let file = Self::parse(&content)
            .with_context(|| format!("Invalid phases file: {}", path.display()))?;
        Ok(file)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: PhasesFile =
            serde_json::from_str(content).context("Failed to parse phases JSON")?;
        file.validate()?;
        Ok(file)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize phases to JSON")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write phases file: {}", path.display()))?;
        Ok(())
    }

    /// Reject duplicate ids, self-dependencies and unknown dependencies.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for def in &self.phases {
            if def.phase_id.trim().is_empty() {
                bail!("Phase {} has an empty phase_id", def.phase_number);
            }
            if !seen.insert(def.phase_id.as_str()) {
                bail!("Duplicate phase_id '{}'", def.phase_id);
            }
            if def.max_attempts == Some(0) {
                bail!("Phase '{}' has max_attempts = 0", def.phase_id);
            }
        }
        for def in &self.phases {
            for dep in &def.dependencies {
                if dep == &def.phase_id {
                    bail!("Phase '{}' depends on itself", def.phase_id);
                }
                if !seen.contains(dep.as_str()) {
                    bail!("Phase '{}' depends on unknown phase '{}'", def.phase_id, dep);
                }
            }
        }
        Ok(())
    }

    pub fn get_phase(&self, phase_id: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.phase_id == phase_id)
    }

    /// Runtime phase records in `phase_number` order.
    pub fn to_phases(&self, run_id: &str, default_max_attempts: u32) -> Vec<Phase> {
        let mut phases: Vec<Phase> = self
            .phases
            .iter()
            .map(|d| d.to_phase(run_id, default_max_attempts))
            .collect();
        phases.sort_by_key(|p| p.phase_number);
        phases
    }
}
