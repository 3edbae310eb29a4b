//! Runs convolution scenarios described by TOML manifests.
//!
//! # Example Manifest
//!
//! ```toml
//! [scenario]
//! name = "n16_k3_ramp"
//! description = "ramp image, ramp kernel, light tx backpressure"
//! n = 16
//! k = 3
//! array_size = 8          # optional, defaults to the loaded config
//!
//! [image]
//! type = "ramp"
//! start = 0
//! step = 1
//!
//! [kernel]
//! type = "constant"
//! value = 1
//!
//! [tx_ready]              # optional, defaults to always ready
//! type = "periodic"
//! period = 4
//! stalled = 1
//!
//! [expected]
//! type = "reference"      # or "constant" with `value`, or "values"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::host::{run_job, ConvJob, Pattern, RunReport, TxReady};
use crate::config::Config;
use crate::device::geometry::RunConfig;
use crate::emu::Accelerator;

/// One scenario manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub scenario: ScenarioInfo,
    pub image: Pattern,
    pub kernel: Pattern,
    #[serde(default)]
    pub tx_ready: TxReady,
    pub expected: Expected,
}

/// Run parameters and metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub n: usize,
    pub k: usize,
    #[serde(default)]
    pub array_size: Option<usize>,
}

/// What the output image should be.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Expected {
    /// Match the direct convolution of the inputs.
    Reference,
    /// Every output equals `value`.
    Constant { value: u32 },
    /// Explicit row-major outputs.
    Values { values: Vec<u32> },
}

/// Result of running a scenario.
#[derive(Debug)]
pub struct ScenarioResult {
    pub name: String,
    pub passed: bool,
    pub correct_count: usize,
    pub total_count: usize,
    pub first_mismatch: Option<Mismatch>,
    pub report: RunReport,
}

/// First output that differed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub row: usize,
    pub col: usize,
    pub expected: u32,
    pub actual: u32,
}

impl Scenario {
    /// Load a scenario from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse scenario {}", path.display()))
    }

    /// Parse a scenario from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Find every `*.toml` scenario in a directory, sorted by path.
    pub fn discover(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub fn job(&self) -> Result<ConvJob> {
        Ok(ConvJob::from_patterns(self.scenario.n, self.scenario.k, self.image, self.kernel)?)
    }

    /// Expected output image for this scenario.
    pub fn expected_outputs(&self, job: &ConvJob) -> Result<Vec<u32>> {
        let out_dim = job.n + 1 - job.k;
        let total = out_dim * out_dim;
        match &self.expected {
            Expected::Reference => Ok(job.reference()),
            Expected::Constant { value } => Ok(vec![*value; total]),
            Expected::Values { values } => {
                if values.len() != total {
                    bail!(
                        "scenario {}: {} expected values for {} outputs",
                        self.scenario.name,
                        values.len(),
                        total
                    );
                }
                Ok(values.clone())
            }
        }
    }

    /// Run the scenario on a fresh accelerator built from `config`.
    pub fn run(&self, config: &Config) -> Result<ScenarioResult> {
        let mut config = config.clone();
        if let Some(size) = self.scenario.array_size {
            config.array_size = Some(size);
        }

        RunConfig::new(self.scenario.n, self.scenario.k)
            .with_array_size(config.array_size())
            .validate()
            .with_context(|| format!("scenario {} is not runnable", self.scenario.name))?;
        let job = self.job()?;
        let expected = self.expected_outputs(&job)?;

        let mut acc = Accelerator::from_config(&config)?;
        log::info!(
            "scenario {}: N={} K={} on {}x{}",
            self.scenario.name,
            job.n,
            job.k,
            config.array_size(),
            config.array_size()
        );
        let report = run_job(&mut acc, &job, self.tx_ready)
            .with_context(|| format!("scenario {} failed to run", self.scenario.name))?;

        let mismatches = report.mismatches(&expected);
        let total_count = expected.len();
        let first_mismatch = mismatches.first().map(|&(row, col, expected, actual)| Mismatch {
            row,
            col,
            expected,
            actual,
        });

        Ok(ScenarioResult {
            name: self.scenario.name.clone(),
            passed: mismatches.is_empty() && report.violations.is_empty() && report.outputs.len() == total_count,
            correct_count: total_count - mismatches.len(),
            total_count,
            first_mismatch,
            report,
        })
    }
}

impl ScenarioResult {
    pub fn print_summary(&self) {
        let verdict = if self.passed { "PASS" } else { "FAIL" };
        println!(
            "[{}] {}: {}/{} outputs correct in {} cycles",
            verdict, self.name, self.correct_count, self.total_count, self.report.cycles
        );
        if let Some(m) = self.first_mismatch {
            println!(
                "  first mismatch at ({}, {}): expected {}, got {}",
                m.row, m.col, m.expected, m.actual
            );
        }
        for violation in &self.report.violations {
            println!("  {}", violation);
        }
    }
}
