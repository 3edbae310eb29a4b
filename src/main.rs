//! systolic-emu: cycle-accurate systolic-array convolution model

use std::env;
use std::path::Path;

use anyhow::{bail, Context};
use systolic_emu::config::Config;
use systolic_emu::device::RunConfig;
use systolic_emu::emu::Accelerator;
use systolic_emu::testing::{run_job, ConvJob, Pattern, Scenario, TxReady};

const USAGE: &str = "\
Usage:
  systolic-emu run --n N --k K [--array A] [--pixel V | --ramp] [--weight W | --ramp-weights]
                   [--tx-stall PERIOD] [--status]
  systolic-emu scenario FILE|DIR
  systolic-emu config";

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("run") => run_convolution(&args[2..]),
        Some("scenario") => {
            let path = args.get(2).context("scenario needs a file or directory")?;
            run_scenarios(Path::new(path))
        }
        Some("config") => {
            show_config();
            Ok(())
        }
        _ => {
            println!("{}", USAGE);
            Ok(())
        }
    }
}

/// Options for the `run` command.
struct RunOptions {
    n: usize,
    k: usize,
    array_size: Option<usize>,
    image: Pattern,
    kernel: Pattern,
    tx_ready: TxReady,
    status: bool,
}

fn parse_run_options(args: &[String]) -> anyhow::Result<RunOptions> {
    let mut n = None;
    let mut k = None;
    let mut opts = RunOptions {
        n: 0,
        k: 0,
        array_size: None,
        image: Pattern::Constant { value: 1 },
        kernel: Pattern::Constant { value: 1 },
        tx_ready: TxReady::Always,
        status: false,
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| -> anyhow::Result<usize> {
            let raw = iter.next().with_context(|| format!("{} needs a value", name))?;
            raw.parse().with_context(|| format!("{}: '{}' is not a number", name, raw))
        };

        match arg.as_str() {
            "--n" => n = Some(value("--n")?),
            "--k" => k = Some(value("--k")?),
            "--array" => opts.array_size = Some(value("--array")?),
            "--pixel" => opts.image = Pattern::Constant { value: byte(value("--pixel")?)? },
            "--weight" => opts.kernel = Pattern::Constant { value: byte(value("--weight")?)? },
            "--tx-stall" => {
                let period = value("--tx-stall")? as u32;
                opts.tx_ready = TxReady::Periodic { period, stalled: 1 };
            }
            "--ramp" => opts.image = Pattern::Ramp { start: 0, step: 1 },
            "--ramp-weights" => opts.kernel = Pattern::Ramp { start: 1, step: 1 },
            "--status" => opts.status = true,
            other => bail!("unknown option '{}'\n{}", other, USAGE),
        }
    }

    opts.n = n.context("--n is required")?;
    opts.k = k.context("--k is required")?;
    Ok(opts)
}

fn byte(value: usize) -> anyhow::Result<u8> {
    u8::try_from(value).with_context(|| format!("{} does not fit in a byte", value))
}

/// Run one convolution and check it against the direct computation.
fn run_convolution(args: &[String]) -> anyhow::Result<()> {
    let opts = parse_run_options(args)?;

    let mut config = Config::get().clone();
    if opts.array_size.is_some() {
        config.array_size = opts.array_size;
    }

    let mut acc = Accelerator::from_config(&config)?;
    RunConfig::new(opts.n, opts.k)
        .with_array_size(config.array_size())
        .validate()?;
    let job = ConvJob::from_patterns(opts.n, opts.k, opts.image, opts.kernel)?;

    println!(
        "Convolving {}x{} input with {}x{} kernel on a {}x{} array",
        opts.n,
        opts.n,
        opts.k,
        opts.k,
        config.array_size(),
        config.array_size()
    );
    println!();

    let report = run_job(&mut acc, &job, opts.tx_ready)?;
    report.print_summary();

    if opts.status {
        println!();
        acc.print_status();
    }

    let mismatches = report.mismatches(&job.reference());
    println!();
    if mismatches.is_empty() {
        println!("Output matches direct convolution ({} values)", report.outputs.len());
        Ok(())
    } else {
        for (row, col, expected, actual) in mismatches.iter().take(10) {
            println!("  ({:2},{:2}) expected {} got {}", row, col, expected, actual);
        }
        bail!("{} of {} outputs differ", mismatches.len(), report.outputs.len())
    }
}

/// Run one scenario file or every scenario in a directory.
fn run_scenarios(path: &Path) -> anyhow::Result<()> {
    let files = if path.is_dir() {
        Scenario::discover(path)?
    } else {
        vec![path.to_path_buf()]
    };

    let config = Config::get();
    let mut failed = 0;
    for file in &files {
        let scenario = Scenario::from_file(file)?;
        match scenario.run(config) {
            Ok(result) => {
                result.print_summary();
                if !result.passed {
                    failed += 1;
                }
            }
            Err(e) => {
                println!("[ERROR] {}: {:#}", scenario.scenario.name, e);
                failed += 1;
            }
        }
    }

    println!();
    println!("{} scenario(s), {} failed", files.len(), failed);
    if failed > 0 {
        bail!("{} scenario(s) failed", failed);
    }
    Ok(())
}

/// Show the effective configuration and where it can live.
fn show_config() {
    let config = Config::get();
    println!("Array size: {}x{}", config.array_size(), config.array_size());
    println!("Cycle budget: {}", config.max_cycles());
    match config.memory_layout() {
        Ok(layout) => {
            println!("Memory: {} words", layout.total_words);
            for region in layout.regions() {
                println!("  {:<12} 0x{:04X}..0x{:04X}", region.name, region.base, region.end());
            }
        }
        Err(e) => println!("Memory layout invalid: {}", e),
    }

    println!();
    if let Some(path) = Config::user_config_path() {
        println!("User config: {}", path.display());
    }
    println!("Sample config:");
    println!();
    print!("{}", Config::sample_config());
}
