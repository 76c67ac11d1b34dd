use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};

use herdwatch::alert::TracingSink;
use herdwatch::config::LoggingConfig;
use herdwatch::ingest::{import, parse_timestamp};
use herdwatch::scheduler::{run_daemon, Scheduler};
use herdwatch::sim::{HerdSimulator, OutbreakSpec, SimConfig};
use herdwatch::storage::Store;
use herdwatch::EngineConfig;

#[derive(Parser)]
#[command(
    name = "herdwatch",
    about = "Offline livestock outbreak detection from per-animal health telemetry",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults: $HERDWATCH_CONFIG, /etc/herdwatch/herdwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overriding storage.db_path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import readings from a JSON or JSON-lines file
    Import {
        /// Input file
        file: PathBuf,
    },

    /// Run one detection batch now
    Run {
        /// Window close (RFC 3339 or YYYY-MM-DD); defaults to now
        #[arg(long)]
        at: Option<String>,
    },

    /// Run batches on the configured cron schedule until interrupted
    Daemon,

    /// Preview when the daemon will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },

    /// List outbreak clusters
    Clusters {
        /// Include expired clusters
        #[arg(long)]
        all: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List anomaly events
    Events {
        /// Only events at or after this time (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,

        /// Maximum number of events
        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Generate synthetic herd readings as JSON lines
    Simulate {
        #[arg(long, default_value = "3")]
        farms: usize,

        #[arg(long, default_value = "20")]
        animals: usize,

        #[arg(long, default_value = "30")]
        days: u32,

        /// First simulated day (YYYY-MM-DD); defaults to `days` ago
        #[arg(long)]
        start: Option<String>,

        #[arg(long, default_value = "42")]
        seed: u64,

        /// Farm to inject an outbreak into
        #[arg(long)]
        outbreak_farm: Option<String>,

        /// Outbreak start, as a day offset
        #[arg(long, default_value = "20")]
        outbreak_start: u32,

        #[arg(long, default_value = "7")]
        outbreak_days: u32,

        #[arg(long, default_value = "0.3")]
        outbreak_fraction: f64,

        /// Output file (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_time_arg(value: Option<&str>, default: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match value {
        Some(s) => parse_timestamp(s).with_context(|| format!("invalid time '{s}'")),
        None => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::resolve(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Import { file } => {
            let raws = import::read_file(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let runner = herdwatch::open_runner(config, cli.db.as_deref(), Arc::new(TracingSink))?;
            let report = runner.ingest(&raws).await?;
            println!(
                "Imported {}: accepted={} rejected={} duplicates={} suspect={}",
                file.display(),
                report.accepted,
                report.rejected,
                report.duplicates,
                report.suspect
            );
        }
        Commands::Run { at } => {
            let window_close = parse_time_arg(at.as_deref(), Utc::now())?;
            let runner = herdwatch::open_runner(config, cli.db.as_deref(), Arc::new(TracingSink))?;
            let report = runner.run(window_close).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Daemon => {
            let scheduler = Scheduler::new(&config.schedule.cron)?;
            let runner = herdwatch::open_runner(config, cli.db.as_deref(), Arc::new(TracingSink))?;
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            };
            run_daemon(&runner, &scheduler, shutdown).await;
        }
        Commands::DryRun { hours } => {
            let scheduler = Scheduler::new(&config.schedule.cron)?;
            let preview = scheduler.preview_next_runs(Utc::now(), hours);
            if preview.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours, cron '{}'):", hours, scheduler.expr());
                for time in preview {
                    println!("{}", time.to_rfc3339());
                }
            }
        }
        Commands::Clusters { all, json } => {
            let runner = herdwatch::open_runner(config, cli.db.as_deref(), Arc::new(TracingSink))?;
            let clusters = runner.store().list_clusters(all)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&clusters)?);
            } else if clusters.is_empty() {
                println!("No clusters found.");
            } else {
                println!(
                    "{:<36} | {:<9} | {:<6} | {:<20} | {:>5} | {:>8} | Significance",
                    "Cluster", "Status", "Sev", "Window start", "Obs", "Exp"
                );
                println!("{:-<36}-|-{:-<9}-|-{:-<6}-|-{:-<20}-|-{:-<5}-|-{:-<8}-|-{:-<12}", "", "", "", "", "", "", "");
                for c in clusters {
                    println!(
                        "{:<36} | {:<9} | {:<6} | {:<20} | {:>5} | {:>8.2} | {:.2e}",
                        c.cluster_id,
                        c.status.as_str(),
                        c.severity.as_str(),
                        c.time_window.start.format("%Y-%m-%d %H:%M"),
                        c.observed_count,
                        c.expected_count,
                        c.significance_score
                    );
                    println!(
                        "    farms: {}",
                        c.farm_ids.iter().cloned().collect::<Vec<_>>().join(", ")
                    );
                }
            }
        }
        Commands::Events { since, limit } => {
            let since = parse_time_arg(since.as_deref(), DateTime::<Utc>::MIN_UTC)?;
            let runner = herdwatch::open_runner(config, cli.db.as_deref(), Arc::new(TracingSink))?;
            for e in runner.store().list_events(since, limit)? {
                println!("{}", serde_json::to_string(&e)?);
            }
        }
        Commands::Simulate {
            farms,
            animals,
            days,
            start,
            seed,
            outbreak_farm,
            outbreak_start,
            outbreak_days,
            outbreak_fraction,
            output,
        } => {
            let default_start = (Utc::now() - Duration::days(i64::from(days)))
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|t| t.and_utc())
                .unwrap_or_else(Utc::now);
            let start = parse_time_arg(start.as_deref(), default_start)?;
            let outbreak = outbreak_farm.map(|farm_id| OutbreakSpec {
                farm_id,
                start_day: outbreak_start,
                duration_days: outbreak_days,
                affected_fraction: outbreak_fraction,
            });

            let readings = HerdSimulator::new(SimConfig {
                farms,
                animals_per_farm: animals,
                days,
                start,
                seed,
                outbreak,
            })
            .generate();

            let mut out: Box<dyn Write> = match &output {
                Some(path) => Box::new(std::io::BufWriter::new(
                    std::fs::File::create(path)
                        .with_context(|| format!("creating {}", path.display()))?,
                )),
                None => Box::new(std::io::BufWriter::new(std::io::stdout().lock())),
            };
            for r in &readings {
                serde_json::to_writer(&mut out, r)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            tracing::info!(readings = readings.len(), "simulation written");
        }
    }

    Ok(())
}
