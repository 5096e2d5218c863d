use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::dtype::DataType;
use crate::igemm::GemmBackend;
use crate::problem::{ConvProblem, Direction};

/// Settings for running one problem through the harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Storage format of every tensor.
    pub data_type: DataType,
    /// Which pass to compute.
    pub direction: Direction,
    /// GEMM consumer checked against the naive reference.
    pub backend: GemmBackend,
    /// Seed for the operand fill.
    pub seed: u64,
    /// Overrides the per-format default tolerance.
    pub tolerance: Option<f64>,
    /// Where to write reference/result dumps, if anywhere.
    pub dump_dir: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            data_type: DataType::Fp32,
            direction: Direction::Forward,
            backend: GemmBackend::Implicit,
            seed: 0x5eed,
            tolerance: None,
            dump_dir: None,
        }
    }
}

impl HarnessConfig {
    /// Effective tolerance for this run.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
            .unwrap_or_else(|| crate::verify::default_tolerance(self.data_type))
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(tol) = self.tolerance {
            anyhow::ensure!(
                tol.is_finite() && tol > 0.0,
                "tolerance must be a positive finite number, got {tol}"
            );
        }
        if let Some(dir) = &self.dump_dir {
            anyhow::ensure!(
                !dir.is_file(),
                "dump directory {} is an existing file",
                dir.display()
            );
        }
        Ok(())
    }
}

/// One problem in a sweep file. Per-axis vectors may be omitted (defaults),
/// hold one value (broadcast to every axis) or one value per axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemEntry {
    pub n: usize,
    pub c: usize,
    pub k: usize,
    #[serde(default = "one")]
    pub group: usize,
    pub input: Vec<usize>,
    pub filter: Vec<usize>,
    #[serde(default)]
    pub stride: Vec<usize>,
    #[serde(default)]
    pub dilation: Vec<usize>,
    /// Symmetric padding; `left_pad` / `right_pad` override one side.
    #[serde(default)]
    pub pad: Vec<usize>,
    #[serde(default)]
    pub left_pad: Vec<usize>,
    #[serde(default)]
    pub right_pad: Vec<usize>,
}

fn one() -> usize {
    1
}

/// Broadcast a per-axis setting to `rank` entries.
pub fn expand_axes(name: &str, values: &[usize], rank: usize, default: usize) -> anyhow::Result<Vec<usize>> {
    match values.len() {
        0 => Ok(vec![default; rank]),
        1 => Ok(vec![values[0]; rank]),
        len if len == rank => Ok(values.to_vec()),
        len => anyhow::bail!("{name} has {len} entries, expected 1 or {rank}"),
    }
}

impl ProblemEntry {
    pub fn to_problem(&self) -> anyhow::Result<ConvProblem> {
        let rank = self.input.len();
        let pad = expand_axes("pad", &self.pad, rank, 0)?;
        let left = if self.left_pad.is_empty() {
            pad.clone()
        } else {
            expand_axes("left_pad", &self.left_pad, rank, 0)?
        };
        let right = if self.right_pad.is_empty() {
            pad
        } else {
            expand_axes("right_pad", &self.right_pad, rank, 0)?
        };
        let problem = ConvProblem::new(self.n, self.c, self.k, &self.input, &self.filter)
            .with_group(self.group)
            .with_strides(&expand_axes("stride", &self.stride, rank, 1)?)
            .with_dilations(&expand_axes("dilation", &self.dilation, rank, 1)?)
            .with_left_pads(&left)
            .with_right_pads(&right);
        problem.validate()?;
        Ok(problem)
    }
}

fn all_directions() -> Vec<Direction> {
    Direction::ALL.to_vec()
}

/// A JSON sweep: shared settings, directions and a list of problems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepFile {
    #[serde(default)]
    pub config: HarnessConfig,
    #[serde(default = "all_directions")]
    pub directions: Vec<Direction>,
    pub problems: Vec<ProblemEntry>,
}

impl SweepFile {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let sweep: Self = serde_json::from_str(text).context("invalid sweep JSON")?;
        sweep.config.validate()?;
        anyhow::ensure!(!sweep.problems.is_empty(), "sweep lists no problems");
        anyhow::ensure!(!sweep.directions.is_empty(), "sweep lists no directions");
        Ok(sweep)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read sweep file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("in sweep file {}", path.display()))
    }

    /// Every problem, validated, in file order.
    pub fn problems(&self) -> anyhow::Result<Vec<ConvProblem>> {
        self.problems
            .iter()
            .enumerate()
            .map(|(i, entry)| entry.to_problem().with_context(|| format!("problem #{i}")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = HarnessConfig::default();
        config.validate().unwrap();
        assert_eq!(config.tolerance(), 1.5e-6);
    }

    #[test]
    fn bad_tolerance_is_rejected() {
        let config = HarnessConfig {
            tolerance: Some(-1.0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sweep_json_with_broadcast_axes() {
        let sweep = SweepFile::from_json(
            r#"{
                "config": { "data_type": "bf16", "backend": "materialized" },
                "directions": ["backward_data"],
                "problems": [
                    { "n": 2, "c": 4, "k": 4, "group": 2, "input": [6, 6], "filter": [3, 3],
                      "stride": [2], "pad": [1], "right_pad": [0, 1] }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(sweep.config.data_type, DataType::Bf16);
        assert_eq!(sweep.config.backend, GemmBackend::Materialized);
        assert_eq!(sweep.config.seed, HarnessConfig::default().seed);
        assert_eq!(sweep.directions, vec![Direction::BackwardData]);
        let problems = sweep.problems().unwrap();
        let p = &problems[0];
        assert_eq!(p.strides, vec![2, 2]);
        assert_eq!(p.dilations, vec![1, 1]);
        assert_eq!(p.left_pads, vec![1, 1]);
        assert_eq!(p.right_pads, vec![0, 1]);
    }

    #[test]
    fn directions_default_to_all() {
        let sweep = SweepFile::from_json(
            r#"{ "problems": [ { "n": 1, "c": 1, "k": 1, "input": [4], "filter": [3] } ] }"#,
        )
        .unwrap();
        assert_eq!(sweep.directions.len(), 3);
    }

    #[test]
    fn invalid_problem_is_reported_with_index() {
        let sweep = SweepFile::from_json(
            r#"{ "problems": [
                { "n": 1, "c": 1, "k": 1, "input": [4], "filter": [3] },
                { "n": 1, "c": 3, "k": 2, "group": 2, "input": [4], "filter": [3] }
            ] }"#,
        )
        .unwrap();
        let err = sweep.problems().unwrap_err();
        assert!(format!("{err:#}").contains("problem #1"));
    }

    #[test]
    fn axis_count_mismatch() {
        assert!(expand_axes("stride", &[1, 2, 3], 2, 1).is_err());
        assert_eq!(expand_axes("stride", &[], 3, 1).unwrap(), vec![1, 1, 1]);
    }
}
