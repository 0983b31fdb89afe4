use compaction::{CompactionConfig, CompactionEngine, CompactionReport};
use ranking::is_similarity_threshold;
use std::{
    env,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use store::{FileLedgerStorage, Ledger, SystemClock};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

const DEFAULT_TICK_INTERVAL_MS: u64 = 60_000;
const LOG_ENV: &str = "CURATOR_LOG";

#[derive(Debug, Clone, PartialEq)]
struct Config {
    root_dir: PathBuf,
    interval: Duration,
    once: bool,
    force: bool,
    compaction: CompactionConfig,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("compaction-daemon failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        println!("{}", usage_text());
        return Ok(());
    }
    let config = config_from_inputs(args, |key| env::var(key).ok())?;
    init_tracing();
    let engine = CompactionEngine::new(config.compaction.clone());

    if config.once {
        let started_at = now_rfc3339();
        let report = run_tick(&engine, &config)?;
        print_tick_snapshot(&started_at, &config, Some(&report), None);
        return Ok(());
    }

    loop {
        let tick_started_at = now_rfc3339();
        let tick_timer = Instant::now();
        match run_tick(&engine, &config) {
            Ok(report) => print_tick_snapshot(&tick_started_at, &config, Some(&report), None),
            Err(err) => {
                tracing::error!(error = %err, "compaction tick failed");
                print_tick_snapshot(&tick_started_at, &config, None, Some(&err));
            }
        }

        let sleep_for = config.interval.saturating_sub(tick_timer.elapsed());
        if !sleep_for.is_zero() {
            thread::sleep(sleep_for);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_tick(engine: &CompactionEngine, config: &Config) -> Result<CompactionReport, String> {
    let mut ledger = Ledger::new(
        FileLedgerStorage::new(&config.root_dir),
        Arc::new(SystemClock),
    );
    engine
        .compact(&mut ledger, config.force)
        .map_err(|err| err.to_string())
}

fn usage_text() -> &'static str {
    "Usage: compaction-daemon [--once] [--force] [--root PATH] [--threshold N] [--similarity F] [--archive-after-days N] [--interval-ms N]\n\
Defaults:\n\
  --root from CURATOR_ROOT\n\
  --threshold from CURATOR_COMPACTION_THRESHOLD, default 25\n\
  --similarity from CURATOR_SIMILARITY_THRESHOLD, default 0.85\n\
  --archive-after-days from CURATOR_ARCHIVE_AFTER_DAYS, default 1\n\
  --interval-ms from CURATOR_TICK_INTERVAL_MS, default 60000\n\
  summary negative window from CURATOR_SUMMARY_NEGATIVE_WINDOW, default 20\n\
  summarizer timeout from CURATOR_SUMMARIZER_TIMEOUT_MS, default 10000\n\
  log filter from CURATOR_LOG, default info"
}

fn print_tick_snapshot(
    started_at: &str,
    config: &Config,
    report: Option<&CompactionReport>,
    error: Option<&str>,
) {
    let snapshot = serde_json::json!({
        "ts": started_at,
        "root_dir": config.root_dir.to_string_lossy(),
        "forced": config.force,
        "report": report,
        "error": error,
    });
    println!("{snapshot}");
}

fn config_from_inputs<I, F>(args: I, env_lookup: F) -> Result<Config, String>
where
    I: IntoIterator<Item = String>,
    F: Fn(&str) -> Option<String>,
{
    let mut once = false;
    let mut force = false;
    let mut root_dir_override: Option<String> = None;
    let mut threshold_override: Option<u64> = None;
    let mut similarity_override: Option<f64> = None;
    let mut archive_days_override: Option<u64> = None;
    let mut interval_ms_override: Option<u64> = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--once" => once = true,
            "--force" => force = true,
            "--root" => {
                root_dir_override = Some(
                    args.next()
                        .ok_or_else(|| "--root requires a value".to_string())?,
                );
            }
            "--threshold" => {
                threshold_override = Some(parse_u64_arg(
                    "--threshold",
                    &args
                        .next()
                        .ok_or_else(|| "--threshold requires a value".to_string())?,
                )?);
            }
            "--similarity" => {
                similarity_override = Some(parse_f64_arg(
                    "--similarity",
                    &args
                        .next()
                        .ok_or_else(|| "--similarity requires a value".to_string())?,
                )?);
            }
            "--archive-after-days" => {
                archive_days_override = Some(parse_u64_arg(
                    "--archive-after-days",
                    &args
                        .next()
                        .ok_or_else(|| "--archive-after-days requires a value".to_string())?,
                )?);
            }
            "--interval-ms" => {
                interval_ms_override = Some(parse_u64_arg(
                    "--interval-ms",
                    &args
                        .next()
                        .ok_or_else(|| "--interval-ms requires a value".to_string())?,
                )?);
            }
            _ => {
                if let Some(value) = arg.strip_prefix("--root=") {
                    root_dir_override = Some(value.to_string());
                } else if let Some(value) = arg.strip_prefix("--threshold=") {
                    threshold_override = Some(parse_u64_arg("--threshold", value)?);
                } else if let Some(value) = arg.strip_prefix("--similarity=") {
                    similarity_override = Some(parse_f64_arg("--similarity", value)?);
                } else if let Some(value) = arg.strip_prefix("--archive-after-days=") {
                    archive_days_override = Some(parse_u64_arg("--archive-after-days", value)?);
                } else if let Some(value) = arg.strip_prefix("--interval-ms=") {
                    interval_ms_override = Some(parse_u64_arg("--interval-ms", value)?);
                } else {
                    return Err(format!("unknown option '{arg}'"));
                }
            }
        }
    }

    let root_dir = root_dir_override
        .or_else(|| env_lookup("CURATOR_ROOT"))
        .ok_or_else(|| "ledger root is required (--root or CURATOR_ROOT)".to_string())?;
    if root_dir.trim().is_empty() {
        return Err("ledger root is empty".to_string());
    }
    let root_dir = PathBuf::from(root_dir);
    let mut compaction = CompactionConfig::for_root(&root_dir);

    let threshold = match threshold_override {
        Some(value) => Some(value),
        None => parse_env_u64(&env_lookup, "CURATOR_COMPACTION_THRESHOLD")?,
    };
    if let Some(threshold) = threshold {
        if threshold == 0 {
            return Err("compaction threshold must be > 0".to_string());
        }
        compaction.compaction_threshold = threshold as usize;
    }

    let similarity = match similarity_override {
        Some(value) => Some(value),
        None => parse_env_f64(&env_lookup, "CURATOR_SIMILARITY_THRESHOLD")?,
    };
    if let Some(similarity) = similarity {
        if !is_similarity_threshold(similarity) {
            return Err(format!("similarity threshold must be in [0, 1], got {similarity}"));
        }
        compaction.similarity_threshold = similarity;
    }

    let days = match archive_days_override {
        Some(value) => Some(value),
        None => parse_env_u64(&env_lookup, "CURATOR_ARCHIVE_AFTER_DAYS")?,
    };
    if let Some(days) = days {
        compaction.archive_after_days = u32::try_from(days)
            .map_err(|_| format!("archive retention is too large: {days}"))?;
    }

    if let Some(window) = parse_env_u64(&env_lookup, "CURATOR_SUMMARY_NEGATIVE_WINDOW")? {
        compaction.summary_negative_window = window as usize;
    }
    if let Some(timeout_ms) = parse_env_u64(&env_lookup, "CURATOR_SUMMARIZER_TIMEOUT_MS")? {
        compaction.summarizer_timeout = Duration::from_millis(timeout_ms.max(1));
    }

    let interval_ms = match interval_ms_override {
        Some(value) => value,
        None => parse_env_u64(&env_lookup, "CURATOR_TICK_INTERVAL_MS")?
            .unwrap_or(DEFAULT_TICK_INTERVAL_MS),
    };
    if !once && interval_ms == 0 {
        return Err("tick interval must be > 0 in daemon loop mode".to_string());
    }

    Ok(Config {
        root_dir,
        interval: Duration::from_millis(interval_ms.max(1)),
        once,
        force,
        compaction,
    })
}

fn parse_env_u64<F>(env_lookup: &F, key: &str) -> Result<Option<u64>, String>
where
    F: Fn(&str) -> Option<String>,
{
    env_lookup(key)
        .map(|raw| parse_u64_arg(key, raw.trim()))
        .transpose()
}

fn parse_env_f64<F>(env_lookup: &F, key: &str) -> Result<Option<f64>, String>
where
    F: Fn(&str) -> Option<String>,
{
    env_lookup(key)
        .map(|raw| parse_f64_arg(key, raw.trim()))
        .transpose()
}

fn parse_u64_arg(flag: &str, raw: &str) -> Result<u64, String> {
    raw.parse::<u64>()
        .map_err(|_| format!("{flag} expects an integer, got '{raw}'"))
}

fn parse_f64_arg(flag: &str, raw: &str) -> Result<f64, String> {
    raw.parse::<f64>()
        .map_err(|_| format!("{flag} expects a number, got '{raw}'"))
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
