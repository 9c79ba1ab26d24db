use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use track_gpx::{
    assemble, load_or_build, map_interpolation_to_velodrome, read_fit_heart_rate,
    read_transponder, write_gpx_file, write_laps_csv, HeartRateSeries, InterpolationParams,
    LapRecord, LogSink, TransponderOptions, Velodrome, VelodromeConfig,
};

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT_HASH"), ")");

#[derive(Parser, Debug)]
#[command(
    author,
    version = VERSION,
    about = "Velodrome transponder laps to GPX",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interpolate a transponder export onto the velodrome and write GPX
    Convert(ConvertArgs),
    /// Write the normalised lap table as CSV
    Laps(LapsArgs),
}

#[derive(Parser, Debug)]
struct InputArgs {
    /// UTF-16LE transponder CSV export
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Sessions to keep (e.g. `1,3` or `2-4`); all when omitted
    #[arg(short, long)]
    sessions: Option<String>,

    /// IANA timezone the export's wall-clock times are in
    #[arg(long, default_value = "Europe/Brussels", value_parser = parse_timezone)]
    timezone: Tz,

    /// Enable debug logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ConvertArgs {
    #[command(flatten)]
    source: InputArgs,

    /// Output GPX path
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// FIT activity to take heart rate from
    #[arg(long, value_hint = ValueHint::FilePath)]
    fit: Option<PathBuf>,

    /// Velodrome parameters JSON (defaults to Eddy Merckx Wielercentrum)
    #[arg(long, value_hint = ValueHint::FilePath)]
    velodrome: Option<PathBuf>,

    /// Geometry cache CSV (overrides the per-parameter default name)
    #[arg(long, value_hint = ValueHint::FilePath)]
    geometry_cache: Option<PathBuf>,

    /// Directory for default-named geometry caches
    #[arg(long, default_value = ".cache/velodromes", value_hint = ValueHint::DirPath)]
    cache_dir: PathBuf,

    /// Seconds between emitted track points
    #[arg(long, default_value_t = 1.0)]
    interval: f64,

    /// Seconds a lap end may miss the next lap start and still join it
    #[arg(long, default_value_t = 1.0)]
    tolerance: f64,

    /// Optional run summary JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    summary: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct LapsArgs {
    #[command(flatten)]
    source: InputArgs,

    /// Output CSV path (stdout when omitted)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Convert(args) => args.source.verbose,
        Command::Laps(args) => args.source.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Convert(args) => handle_convert(args),
        Command::Laps(args) => handle_laps(args),
    }
}

fn read_laps(args: &InputArgs) -> Result<Vec<LapRecord>> {
    let sessions = args
        .sessions
        .as_deref()
        .map(parse_session_list)
        .transpose()?;
    let options = TransponderOptions {
        timezone: args.timezone,
        sessions,
    };
    let laps = read_transponder(&args.input, &options, &mut LogSink)
        .with_context(|| format!("failed to parse {}", args.input.display()))?;
    if laps.is_empty() {
        warn!("No laps found in {}", args.input.display());
    } else {
        let sessions = 1 + laps.windows(2).filter(|w| w[0].session != w[1].session).count();
        info!(
            "Read {} laps in {} sessions from {}",
            laps.len(),
            sessions,
            args.input.display()
        );
    }
    Ok(laps)
}

fn handle_convert(args: ConvertArgs) -> Result<()> {
    let laps = read_laps(&args.source)?;

    let config = match &args.velodrome {
        Some(path) => VelodromeConfig::load(path)
            .with_context(|| format!("failed to load velodrome {}", path.display()))?,
        None => VelodromeConfig::default(),
    };
    let cache_path = match &args.geometry_cache {
        Some(path) => path.clone(),
        None => config.default_cache_path(&args.cache_dir)?,
    };
    let velodrome = load_or_build(&config, &cache_path, &mut LogSink)
        .with_context(|| format!("failed to prepare velodrome '{}'", config.name))?;
    info!(
        "Velodrome {}: {:.3} m loop, finish line at {:.1} m",
        velodrome.name(),
        velodrome.length_m(),
        velodrome.start_finish_m()
    );

    let params = InterpolationParams {
        sample_interval_s: args.interval,
        contiguity_tolerance_s: args.tolerance,
    };
    let trace = map_interpolation_to_velodrome(&laps, velodrome.as_ref(), &params, &mut LogSink)?;
    if let Some((start, end)) = trace.time_range() {
        info!(
            "Trace {} to {} ({} points)",
            start.to_rfc3339(),
            end.to_rfc3339(),
            trace.summary.points
        );
    }

    let heart_rate = match &args.fit {
        Some(path) => Some(load_heart_rate(path)?.with_timezone(trace.timezone())),
        None => None,
    };
    let segments = assemble(&trace, heart_rate.as_ref());
    if heart_rate.is_some() {
        let total: usize = segments.iter().map(Vec::len).sum();
        let covered = segments
            .iter()
            .flatten()
            .filter(|p| p.heart_rate.is_some())
            .count();
        if covered == 0 && total > 0 {
            warn!("FIT heart rate does not overlap the lap times");
        } else {
            info!("Heart rate on {}/{} points", covered, total);
        }
    }

    write_gpx_file(&args.output, velodrome.name(), &segments)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!(
        "Wrote GPX: {} ({} segments)",
        args.output.display(),
        segments.len()
    );

    if let Some(path) = &args.summary {
        let text = serde_json::to_string_pretty(&trace.summary)?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote summary: {}", path.display());
    }
    Ok(())
}

fn load_heart_rate(path: &Path) -> Result<HeartRateSeries> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let series =
        read_fit_heart_rate(&data).with_context(|| format!("failed to parse {}", path.display()))?;
    if series.is_empty() {
        warn!("{} has no heart-rate records", path.display());
    }
    Ok(series)
}

fn handle_laps(args: LapsArgs) -> Result<()> {
    let laps = read_laps(&args.source)?;
    match &args.output {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            write_laps_csv(&laps, &mut writer)?;
            writer
                .flush()
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Wrote lap table: {}", path.display());
        }
        None => {
            let stdout = io::stdout();
            write_laps_csv(&laps, stdout.lock())?;
        }
    }
    Ok(())
}

fn parse_timezone(input: &str) -> Result<Tz, String> {
    input
        .trim()
        .parse::<Tz>()
        .map_err(|e| format!("unknown timezone '{}': {}", input, e))
}

/// Comma separated session numbers and inclusive ranges (`1,3,5-7`).
fn parse_session_list(input: &str) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    for token in input.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parse = |s: &str| -> Result<u32> {
            let value: u32 = s
                .trim()
                .parse()
                .with_context(|| format!("invalid session '{}': expected a number", trimmed))?;
            if value == 0 {
                return Err(anyhow!("invalid session '{}': sessions start at 1", trimmed));
            }
            Ok(value)
        };
        match trimmed.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (parse(lo)?, parse(hi)?);
                if hi < lo {
                    return Err(anyhow!("invalid session range '{}'", trimmed));
                }
                out.extend(lo..=hi);
            }
            None => out.push(parse(trimmed)?),
        }
    }
    if out.is_empty() {
        return Err(anyhow!("session list '{}' is empty", input));
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}
