//! modpack CLI — optimize, compress and convert ProTracker/P61A modules.
//!
//! Arguments are processed from left to right, so one invocation can
//! load a module, run optimizer passes and write several outputs.

use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::process::ExitCode;

use log::{error, info, LevelFilter};
use mp_formats::{load_mod, load_p61a, save_mod, save_p61a, FormatError, Options};
use mp_ir::Module;
use mp_optimize::{
    clean_effects, compact_sample_indexes, remove_identical_samples, remove_unused_patterns,
    remove_unused_samples, trim_samples,
};

const HELP: &str = "\
modpack - Optimize, compress and convert ProTracker/P61A modules
================================================================
Arguments are processed from left to right. This means you can write more
than one output if needed.

Importing / exporting modules:
  -in:FORMAT NAME      Load module in specified format.
  -out:FORMAT NAME     Save module in specified format.

  Available formats:
    mod                ProTracker
    p61a               The Player 6.1A

  If NAME is -, standard input/output will be utilized.

  -opts:OPTIONS        Set import/export options

  P61A export options:
    sign                  Add signature when exporting ('P61A') (disabled)
    4bit[RANGE]           Compress specified samples to 4-bit (disabled)
    delta                 Delta-encode samples (disabled)
    [-]compress_patterns  Compress pattern data (enabled)
    [-]song               Write song data to output (enabled)
    [-]samples            Write sample data to output (enabled)

  Preceding a boolean option with a minus ('-') will disable the option.

  Range examples:
    [1]                Apply to sample 1
    [4-7]              Apply to sample 4-7
    [1-4:8-12]         Apply to sample 1-4 and 8-12 (5-7 is not affected)

Optimization options:
  -optimize OPTIONS

  Available options:
    unused_patterns    Remove unused patterns
    unused_samples     Remove unused samples
                       (sample index is preserved)
    trim               Trim trailing null data in samples
                       (not looped samples)
    trim_loops         Also trim looped samples
                       (implies 'trim')
    identical_samples  Merge identical samples
                       (pattern data is rewritten to match)
    compact_samples    Remove empty space in the sample table
    clean              Clean effects in pattern data
    clean:e8           Remove E8x from pattern data
                       (implies 'clean', not enabled by 'all')
    all                Apply all available optimizations
                       (where applicable)

Miscellaneous:
  -d N                 Set log level (0 = info, 1 = debug, 2 = trace)
  -q                   Quiet mode

Remove unused patterns and samples, and re-save as MOD:
  modpack -in:mod in.mod -optimize unused_patterns,unused_samples
    -out:mod out.mod

Fully optimize module and export P61A (song and samples separately):
  modpack -in:mod test.mod -optimize all -opts:-samples -out:p61a test.p61
    -opts:-song -out:p61a test.smp
";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{HELP}");
        return ExitCode::SUCCESS;
    }

    env_logger::Builder::new()
        .filter_level(log_level(&args))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let mut module: Option<Module> = None;
    let mut options = Options::default();

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];

        if let Some(format) = arg.strip_prefix("-in:") {
            let Some(name) = args.get(i + 1) else {
                error!("no filename specified");
                break;
            };
            info!("Loading '{}'...", name);
            match load_module(name, format) {
                Ok(loaded) => module = Some(loaded),
                Err(err) => {
                    error!("failed to load module '{}': {}", name, err);
                    break;
                }
            }
            i += 2;
        } else if let Some(format) = arg.strip_prefix("-out:") {
            let Some(name) = args.get(i + 1) else {
                error!("no filename specified");
                break;
            };
            let Some(module) = module.as_ref() else {
                error!("no module loaded");
                break;
            };
            if let Err(err) = save_module(module, name, format, &options) {
                error!("failed to write '{}': {}", name, err);
                break;
            }
            i += 2;
        } else if let Some(opts) = arg.strip_prefix("-opts:") {
            options = Options::parse(opts);
            i += 1;
        } else if arg == "-optimize" {
            let Some(opt) = args.get(i + 1) else {
                error!("no options specified for optimization");
                break;
            };
            let Some(module) = module.as_mut() else {
                error!("no module loaded");
                break;
            };
            optimize(module, &Options::parse(opt));
            i += 2;
        } else if arg == "-d" {
            if args.get(i + 1).is_none() {
                error!("no argument specified for debug info");
                break;
            }
            // consumed by the log-level prescan
            i += 2;
        } else if arg == "-q" {
            i += 1;
        } else {
            // unrecognized arguments are skipped
            i += 1;
        }
    }

    if i == args.len() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// `-q` and `-d N` decide the log level before anything is loaded.
fn log_level(args: &[String]) -> LevelFilter {
    let mut level = LevelFilter::Info;
    let mut i = 0;
    while i < args.len() {
        if args[i] == "-q" {
            level = LevelFilter::Off;
        } else if args[i] == "-d" {
            if let Some(n) = args.get(i + 1).and_then(|v| v.parse::<u32>().ok()) {
                level = match n {
                    0 => LevelFilter::Info,
                    1 => LevelFilter::Debug,
                    _ => LevelFilter::Trace,
                };
            }
            i += 1;
        }
        i += 1;
    }
    level
}

enum DriverError {
    Io(io::Error),
    Format(FormatError),
    UnknownFormat(String),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Io(err) => err.fmt(f),
            DriverError::Format(err) => err.fmt(f),
            DriverError::UnknownFormat(name) => write!(f, "unknown format '{}'", name),
        }
    }
}

impl From<io::Error> for DriverError {
    fn from(err: io::Error) -> Self {
        DriverError::Io(err)
    }
}

impl From<FormatError> for DriverError {
    fn from(err: FormatError) -> Self {
        DriverError::Format(err)
    }
}

fn load_module(name: &str, format: &str) -> Result<Module, DriverError> {
    let data = if name == "-" {
        let mut buffer = Vec::new();
        io::stdin().read_to_end(&mut buffer)?;
        buffer
    } else {
        fs::read(name)?
    };

    let module = match format {
        "mod" => load_mod(&data)?,
        "p61a" => load_p61a(&data)?,
        other => return Err(DriverError::UnknownFormat(other.to_string())),
    };
    Ok(module)
}

fn save_module(
    module: &Module,
    name: &str,
    format: &str,
    options: &Options,
) -> Result<(), DriverError> {
    let mut buffer = Vec::new();
    match format {
        "mod" => save_mod(module, &mut buffer),
        "p61a" => save_p61a(module, options, &mut buffer)?,
        other => return Err(DriverError::UnknownFormat(other.to_string())),
    }

    info!("Writing result to '{}'...", name);
    if name == "-" {
        io::stdout().write_all(&buffer)?;
    } else {
        fs::write(name, &buffer)?;
    }
    info!("done.");
    Ok(())
}

fn optimize(module: &mut Module, opts: &Options) {
    let all = opts.has("all", false);

    if opts.has("unused_patterns", false) || all {
        remove_unused_patterns(module);
    }

    let trim_loops = opts.has("trim_loops", false);
    if opts.has("trim", false) || trim_loops || all {
        trim_samples(module, trim_loops);
    }

    if opts.has("unused_samples", false) || all {
        remove_unused_samples(module);
    }

    if opts.has("identical_samples", false) || all {
        remove_identical_samples(module);
    }

    if opts.has("compact_samples", false) || all {
        compact_sample_indexes(module);
    }

    let e8 = opts.has("clean:e8", false);
    if opts.has("clean", false) || e8 || all {
        clean_effects(module, e8);
    }
}
