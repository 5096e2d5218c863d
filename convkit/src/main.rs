use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use convkit::config::{HarnessConfig, SweepFile};
use convkit::dtype::DataType;
use convkit::dump::TensorDump;
use convkit::harness::{run_problem, run_sweep};
use convkit::igemm::GemmBackend;
use convkit::layers::{check_activation, check_batch_norm, LayerReport};
use convkit::problem::{ConvProblem, Direction};
use convkit::reference::{ActivationDescriptor, ActivationMode, BatchNorm, BatchNormMode};
use convkit::verify::{compare, default_tolerance};

/// Implicit-GEMM convolution checker.
///
/// Runs a convolution through a GEMM backend and through the naive
/// reference kernel on the same seeded operands, then compares the two with
/// a relative RMS tolerance (fp32 1.5e-6, fp16 8.2e-3, bf16 6.56e-2).
#[derive(Parser)]
#[command(name = "convkit", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a single convolution problem.
    Run {
        /// Batch size.
        #[arg(short = 'n', long, default_value_t = 1)]
        n: usize,

        /// Input channels.
        #[arg(short = 'c', long)]
        c: usize,

        /// Output channels.
        #[arg(short = 'k', long)]
        k: usize,

        /// Input depth (enables 3-D).
        #[arg(long)]
        di: Option<usize>,

        /// Input height.
        #[arg(long)]
        hi: usize,

        /// Input width.
        #[arg(long)]
        wi: usize,

        /// Filter depth (3-D only, default 1).
        #[arg(long)]
        z: Option<usize>,

        /// Filter height.
        #[arg(long, default_value_t = 3)]
        y: usize,

        /// Filter width.
        #[arg(long, default_value_t = 3)]
        x: usize,

        /// Stride, one value or one per spatial axis.
        #[arg(long, value_delimiter = ',', default_value = "1")]
        stride: Vec<usize>,

        /// Dilation, one value or one per spatial axis.
        #[arg(long, value_delimiter = ',', default_value = "1")]
        dilation: Vec<usize>,

        /// Symmetric padding, one value or one per spatial axis.
        #[arg(long, value_delimiter = ',', default_value = "0")]
        pad: Vec<usize>,

        /// Number of channel groups.
        #[arg(short = 'g', long, default_value_t = 1)]
        group: usize,

        #[arg(long, default_value = "forward", value_enum)]
        direction: Direction,

        #[arg(long, default_value = "fp32", value_enum)]
        dtype: DataType,

        #[arg(long, default_value = "implicit", value_enum)]
        backend: GemmBackend,

        #[arg(long, default_value_t = 0x5eed)]
        seed: u64,

        /// Override the per-format tolerance.
        #[arg(long)]
        tolerance: Option<f64>,

        /// Write the reference and backend results here.
        #[arg(long)]
        dump_dir: Option<PathBuf>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check every problem of a JSON sweep file.
    Sweep {
        /// Sweep file.
        path: PathBuf,

        /// Write per-run reports as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Check an activation's gradient against central differences.
    Activ {
        #[arg(long, value_enum)]
        mode: ActivationMode,

        #[arg(long, default_value_t = 1.0)]
        alpha: f32,

        #[arg(long, default_value_t = 1.0)]
        beta: f32,

        #[arg(long, default_value_t = 1.0)]
        power: f32,

        /// Number of elements.
        #[arg(long, default_value_t = 4096)]
        len: usize,

        #[arg(long, default_value_t = 0x5eed)]
        seed: u64,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check batch norm training, inference and backward against each other.
    Bnorm {
        #[arg(long, default_value = "spatial", value_enum)]
        mode: BatchNormMode,

        #[arg(short = 'n', long, default_value_t = 2)]
        n: usize,

        #[arg(short = 'c', long)]
        c: usize,

        #[arg(long)]
        hi: usize,

        #[arg(long)]
        wi: usize,

        #[arg(long, default_value_t = convkit::reference::batchnorm::DEFAULT_EPSILON)]
        epsilon: f64,

        #[arg(long, default_value_t = 0x5eed)]
        seed: u64,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Compare two tensor dumps.
    Compare {
        reference: PathBuf,
        result: PathBuf,

        /// Defaults to the tolerance of the reference's format.
        #[arg(long)]
        tolerance: Option<f64>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            n,
            c,
            k,
            di,
            hi,
            wi,
            z,
            y,
            x,
            stride,
            dilation,
            pad,
            group,
            direction,
            dtype,
            backend,
            seed,
            tolerance,
            dump_dir,
            json,
        } => {
            let (input, filter) = match di {
                Some(di) => (vec![di, hi, wi], vec![z.unwrap_or(1), y, x]),
                None => {
                    anyhow::ensure!(z.is_none(), "--z needs --di");
                    (vec![hi, wi], vec![y, x])
                }
            };
            let rank = input.len();
            let axes = |name: &str, values: &[usize], default: usize| {
                convkit::config::expand_axes(name, values, rank, default)
            };
            let problem = ConvProblem::new(n, c, k, &input, &filter)
                .with_group(group)
                .with_strides(&axes("stride", &stride, 1)?)
                .with_dilations(&axes("dilation", &dilation, 1)?)
                .with_pads(&axes("pad", &pad, 0)?);
            let config = HarnessConfig {
                data_type: dtype,
                direction,
                backend,
                seed,
                tolerance,
                dump_dir,
            };

            let report = run_problem(&problem, &config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{report}");
            }
            if !report.passed() {
                anyhow::bail!("verification failed");
            }
        }

        Commands::Sweep { path, report } => {
            let sweep = SweepFile::load(&path)?;
            eprintln!(
                "Running {} problems x {} directions ({}, {} backend)",
                sweep.problems.len(),
                sweep.directions.len(),
                sweep.config.data_type,
                sweep.config.backend
            );
            let stats = run_sweep(&sweep)?;
            println!("{stats}");
            if let Some(report) = report {
                stats.write_reports(&report)?;
                eprintln!("Reports written to {}", report.display());
            }
            if !stats.all_passed() {
                anyhow::bail!(
                    "{} failed, {} errors out of {} runs",
                    stats.failed,
                    stats.errors,
                    stats.passed + stats.failed + stats.errors
                );
            }
        }

        Commands::Activ {
            mode,
            alpha,
            beta,
            power,
            len,
            seed,
            json,
        } => {
            let desc = ActivationDescriptor::new(mode)
                .with_alpha(alpha)
                .with_beta(beta)
                .with_power(power);
            let report = check_activation(&desc, len, seed)?;
            print_layer_report(&report, json)?;
        }

        Commands::Bnorm {
            mode,
            n,
            c,
            hi,
            wi,
            epsilon,
            seed,
            json,
        } => {
            let bn = BatchNorm::new(mode, [n, c, hi, wi]).with_epsilon(epsilon);
            let report = check_batch_norm(&bn, seed)?;
            print_layer_report(&report, json)?;
        }

        Commands::Compare {
            reference,
            result,
            tolerance,
        } => {
            let reference = TensorDump::read(&reference)?;
            let result = TensorDump::read(&result)?;
            anyhow::ensure!(
                reference.shape == result.shape,
                "shape mismatch: {:?} vs {:?}",
                reference.shape,
                result.shape
            );
            let tolerance = tolerance.unwrap_or_else(|| default_tolerance(reference.data.data_type()));
            let report = compare(&reference.data.to_f32(), &result.data.to_f32(), tolerance);
            println!("{report}");
            if !report.passed {
                anyhow::bail!("verification failed");
            }
        }
    }

    Ok(())
}

fn print_layer_report(report: &LayerReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{report}");
    }
    if !report.passed() {
        anyhow::bail!("verification failed");
    }
    Ok(())
}
