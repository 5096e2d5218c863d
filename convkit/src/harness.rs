//! Correctness harness: fill operands, run the naive kernel and a GEMM
//! backend on identical inputs, compare the results.

use std::path::Path;

use anyhow::{Context, Result};
use half::f16;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{HarnessConfig, SweepFile};
use crate::dtype::{Bf16, DataType, Element};
use crate::dump::{TensorData, TensorDump};
use crate::igemm::{ConvTensors, GemmBackend};
use crate::problem::{ConvProblem, Direction, TensorRole};
use crate::reference::naive_conv;
use crate::verify::{compare, VerificationReport};

/// Outcome of one problem in one direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub problem: ConvProblem,
    pub direction: Direction,
    pub data_type: DataType,
    pub backend: GemmBackend,
    pub verification: VerificationReport,
    /// SHA-256 of the naive kernel's result.
    pub reference_fingerprint: String,
    pub result_fingerprint: String,
    pub timestamp: String,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.verification.passed
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} [{}]: {}",
            self.direction, self.data_type, self.backend, self.problem, self.verification
        )
    }
}

/// Run `problem` once with the settings in `config`.
pub fn run_problem(problem: &ConvProblem, config: &HarnessConfig) -> Result<RunReport> {
    config.validate()?;
    problem.validate()?;
    match config.data_type {
        DataType::Fp32 => run_typed::<f32>(problem, config),
        DataType::Fp16 => run_typed::<f16>(problem, config),
        DataType::Bf16 => run_typed::<Bf16>(problem, config),
    }
}

fn role_index(role: TensorRole) -> usize {
    match role {
        TensorRole::Input => 0,
        TensorRole::Weight => 1,
        TensorRole::Output => 2,
    }
}

/// Uniform values in `[-1, 1)`, already rounded to the storage format.
fn random_buffer<E: Element>(rng: &mut StdRng, len: usize) -> Vec<E> {
    (0..len).map(|_| E::from_f32(rng.gen_range(-1.0f32..1.0))).collect()
}

fn run_typed<E: Element>(problem: &ConvProblem, config: &HarnessConfig) -> Result<RunReport> {
    let direction = config.direction;
    let result_slot = role_index(direction.result_role());

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut operands: [Vec<E>; 3] = [
        random_buffer(&mut rng, problem.input_len()),
        random_buffer(&mut rng, problem.weight_len()),
        random_buffer(&mut rng, problem.output_len()),
    ];
    operands[result_slot].iter_mut().for_each(|v| *v = E::default());

    let mut reference = operands.clone();
    {
        let [input, weight, output] = &mut reference;
        naive_conv(problem, ConvTensors::for_direction(direction, input, weight, output))
            .with_context(|| format!("naive {direction} failed for {problem}"))?;
    }

    let mut result = operands;
    {
        let [input, weight, output] = &mut result;
        config
            .backend
            .run(problem, ConvTensors::for_direction(direction, input, weight, output))
            .with_context(|| format!("{} {direction} failed for {problem}", config.backend))?;
    }

    let reference = &reference[result_slot];
    let result = &result[result_slot];
    let verification = compare(
        &crate::dtype::convert_to_f32(reference),
        &crate::dtype::convert_to_f32(result),
        config.tolerance(),
    );
    log::debug!("{direction} {} {problem}: {verification}", E::DATA_TYPE);

    let shape = problem.lengths(direction.result_role());
    let reference_dump = TensorDump::new(&shape, TensorData::from_elements(reference))?;
    let result_dump = TensorDump::new(&shape, TensorData::from_elements(result))?;

    if let Some(dir) = &config.dump_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create dump directory {}", dir.display()))?;
        let stem = dump_stem(problem, direction, E::DATA_TYPE);
        reference_dump.write(&dir.join(format!("{stem}-naive.ckt")))?;
        result_dump.write(&dir.join(format!("{stem}-{}.ckt", config.backend)))?;
    }

    Ok(RunReport {
        problem: problem.clone(),
        direction,
        data_type: E::DATA_TYPE,
        backend: config.backend,
        verification,
        reference_fingerprint: reference_dump.fingerprint()?,
        result_fingerprint: result_dump.fingerprint()?,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// File name stem identifying a run, e.g. `fwd-fp32-n2c4k8g1-i8x8-f3x3-s1x1-d1x1-p1x1-1x1`.
fn dump_stem(problem: &ConvProblem, direction: Direction, data_type: DataType) -> String {
    let axes = |v: &[usize]| {
        v.iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join("x")
    };
    format!(
        "{direction}-{data_type}-n{}c{}k{}g{}-i{}-f{}-s{}-d{}-p{}-{}",
        problem.n,
        problem.c,
        problem.k,
        problem.group,
        axes(&problem.input_spatial),
        axes(&problem.filter_spatial),
        axes(&problem.strides),
        axes(&problem.dilations),
        axes(&problem.left_pads),
        axes(&problem.right_pads)
    )
}

// ── Sweeps ───────────────────────────────────────────────────────────────────

/// Run every problem of `sweep` in every listed direction.
pub fn run_sweep(sweep: &SweepFile) -> Result<SweepStats> {
    let problems = sweep.problems()?;
    let total = problems.len() * sweep.directions.len();
    log::debug!("sweep of {} problems, {total} runs", problems.len());

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("=>-"),
    );

    let mut stats = SweepStats::default();
    for (i, problem) in problems.iter().enumerate() {
        for &direction in &sweep.directions {
            pb.set_message(format!("#{i} {direction}"));
            let config = HarnessConfig {
                direction,
                ..sweep.config.clone()
            };
            match run_problem(problem, &config) {
                Ok(report) => {
                    if report.passed() {
                        stats.passed += 1;
                    } else {
                        log::warn!("Problem #{i} {direction} failed: {}", report.verification);
                        stats.failed += 1;
                    }
                    stats.worst_rms = stats.worst_rms.max(report.verification.rms);
                    stats.reports.push(report);
                }
                Err(e) => {
                    log::warn!("Error running problem #{i} {direction}: {e:#}");
                    stats.errors += 1;
                }
            }
            pb.inc(1);
        }
    }

    pb.finish_with_message("done");
    Ok(stats)
}

/// Totals from a sweep.
#[derive(Debug, Default, Serialize)]
pub struct SweepStats {
    pub passed: u64,
    pub failed: u64,
    pub errors: u64,
    pub worst_rms: f64,
    pub reports: Vec<RunReport>,
}

impl SweepStats {
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }

    /// Write the per-run reports as pretty JSON.
    pub fn write_reports(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.reports)?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
    }
}

impl std::fmt::Display for SweepStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "Sweep Complete")?;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "  Passed:            {}", self.passed)?;
        writeln!(f, "  Failed:            {}", self.failed)?;
        if self.errors > 0 {
            writeln!(f, "  Errors:            {}", self.errors)?;
        }
        if !self.reports.is_empty() {
            writeln!(f, "  Worst rms:         {:.3e}", self.worst_rms)?;
        }
        Ok(())
    }
}
