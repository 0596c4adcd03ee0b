use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use link_prober::{
    cycle::{CycleDriver, CycleReport, Lifecycle},
    proxy::{LinkParser, RankPolicy, SelectionMode},
    registry::SourceRegistry,
    tui::ProbeMonitorApp,
    Config, GeoLookup,
};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Decode subscription links, probe them through a transport engine and
/// queue the best ones for publishing
#[derive(Parser)]
#[command(name = "link-prober")]
#[command(about = "Decode, probe and select proxy subscription links")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    settings: Settings,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "LOG_FILE", global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Args)]
struct Settings {
    /// SQLite file holding sources and settings
    #[arg(long, env = "DB_PATH", default_value = "prober.sqlite", global = true)]
    db_path: PathBuf,

    /// Transport engine binary
    #[arg(long, env = "ENGINE_PATH", default_value = "./xray", global = true)]
    engine_path: PathBuf,

    /// Directory for temporary engine configs
    #[arg(long, env = "TMP_DIR", default_value = "./tmp", global = true)]
    tmp_dir: PathBuf,

    /// Directory publish batches are written to
    #[arg(long, env = "RESULTS_DIR", default_value = "./results", global = true)]
    results_dir: PathBuf,

    /// Overflow pool file
    #[arg(long, env = "POOL_FILE", default_value = "./pool.json", global = true)]
    pool_file: PathBuf,

    /// Number of probes run at the same time
    #[arg(short = 'n', long, env = "CONCURRENT_TESTS", default_value = "10", global = true)]
    concurrency: usize,

    /// First local port used by probes
    #[arg(long, env = "BASE_PORT", default_value = "20800", global = true)]
    base_port: u16,

    /// Latency budget per probe in milliseconds
    #[arg(long, env = "MAX_LATENCY_MS", default_value = "3000", global = true)]
    max_latency_ms: u64,

    /// Default cycle interval in minutes
    #[arg(long, env = "TEST_INTERVAL_MINUTES", default_value = "30", global = true)]
    interval_minutes: u64,

    /// Delay between engine launch and the first request in milliseconds
    #[arg(long, env = "WARMUP_MS", default_value = "300", global = true)]
    warmup_ms: u64,

    /// URL fetched through each link to prove it works
    #[arg(
        long,
        env = "TEST_URL",
        default_value = link_prober::DEFAULT_TEST_URL,
        global = true
    )]
    test_url: String,

    /// Measure throughput of working links
    #[arg(long, env = "ENABLE_SPEED_TEST", global = true)]
    speed_test: bool,

    #[arg(
        long,
        env = "SPEED_TEST_URL",
        default_value = link_prober::DEFAULT_SPEED_TEST_URL,
        global = true
    )]
    speed_test_url: String,

    /// Check auxiliary services through working links
    #[arg(
        long,
        env = "ENABLE_SERVICE_TESTS",
        default_value = "true",
        action = clap::ArgAction::Set,
        global = true
    )]
    service_tests: bool,

    /// Results per publish batch
    #[arg(long, env = "PUBLISH_BATCH_SIZE", default_value = "5", global = true)]
    batch_size: usize,

    /// Marker embedded in published labels
    #[arg(long, env = "CHANNEL_TAG", default_value = "", global = true)]
    channel_tag: String,

    #[arg(long, env = "SELECTION_MODE", value_enum, default_value_t = SelectionMode::PerSource, global = true)]
    selection_mode: SelectionMode,

    #[arg(long, env = "RANK_POLICY", value_enum, default_value_t = RankPolicy::ServicesFirst, global = true)]
    rank_policy: RankPolicy,

    /// Hours a pooled result stays eligible
    #[arg(long, env = "POOL_TTL_HOURS", default_value = "24", global = true)]
    pool_ttl_hours: u64,

    /// MaxMind country database
    #[arg(long, env = "MMDB_PATH", global = true)]
    mmdb_path: Option<PathBuf>,

    #[arg(long, env = "GEO_LOOKUP", value_enum, default_value_t = GeoLookup::IpApi, global = true)]
    geo_lookup: GeoLookup,
}

impl Settings {
    fn to_config(&self) -> Config {
        Config {
            db_path: self.db_path.clone(),
            engine_path: self.engine_path.clone(),
            temp_dir: self.tmp_dir.clone(),
            results_dir: self.results_dir.clone(),
            pool_file: self.pool_file.clone(),
            concurrency: self.concurrency,
            base_port: self.base_port,
            max_latency: Duration::from_millis(self.max_latency_ms),
            interval: Duration::from_secs(self.interval_minutes * 60),
            warmup: Duration::from_millis(self.warmup_ms),
            test_url: self.test_url.clone(),
            speed_test: self.speed_test,
            speed_test_url: self.speed_test_url.clone(),
            service_tests: self.service_tests,
            batch_size: self.batch_size,
            channel_tag: self.channel_tag.clone(),
            selection_mode: self.selection_mode,
            rank_policy: self.rank_policy,
            pool_ttl: Duration::from_secs(self.pool_ttl_hours * 60 * 60),
            mmdb_path: self.mmdb_path.clone(),
            geo_lookup: self.geo_lookup,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run test cycles on a schedule (default)
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Probe every link in a local file
    Check {
        /// File containing links
        input: PathBuf,
        /// Show live progress in a TUI
        #[arg(long)]
        tui: bool,
    },
    /// Decode links from a file without probing them
    Parse {
        /// File containing links
        input: PathBuf,
    },
    /// Manage subscription sources
    Sources {
        #[command(subcommand)]
        action: SourceAction,
    },
    /// Show or change the cycle interval
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    /// Register a feed URL
    Add { url: String },
    /// Remove a source by id
    Remove { id: i64 },
    /// List registered sources
    List,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Print the cycle interval in seconds
    Get,
    /// Set the cycle interval in seconds (minimum 60)
    Set { seconds: u64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let tui = matches!(cli.command, Some(Commands::Check { tui: true, .. }));
    init_logging(&cli.log_level, cli.log_file.as_deref(), tui)?;

    let config = cli.settings.to_config();
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run { once: false }) {
        Commands::Run { once } => {
            config.check_engine()?;
            let registry = SourceRegistry::connect(&config.db_path).await?;
            let driver = CycleDriver::from_config(&config)?;
            let (lifecycle, interval_rx) = Lifecycle::new(driver, registry, config.interval);

            if once {
                let report = lifecycle.run_once().await?;
                print_report(&report);
            } else {
                lifecycle.run(interval_rx).await?;
            }
        }
        Commands::Check { input, tui } => {
            config.check_engine()?;
            let driver = CycleDriver::from_config(&config)?;
            if tui {
                check_with_tui(driver, input).await?;
            } else {
                let report = driver.check_file(&input).await?;
                print_report(&report);
            }
        }
        Commands::Parse { input } => {
            let targets = LinkParser::parse_file(&input)?;
            for target in &targets {
                println!(
                    "{}\t{}\t{}",
                    target.params.protocol(),
                    target.params.endpoint(),
                    target.label
                );
            }
            println!("Decoded {} links from {:?}", targets.len(), input);
        }
        Commands::Sources { action } => {
            let registry = SourceRegistry::connect(&config.db_path).await?;
            match action {
                SourceAction::Add { url } => {
                    let source = registry.add_source(&url).await?;
                    println!("Added source {}: {} ({})", source.id, source.url, source.name());
                }
                SourceAction::Remove { id } => {
                    if registry.remove_source(id).await? {
                        println!("Removed source {}", id);
                    } else {
                        eprintln!("Source not found: {}", id);
                    }
                }
                SourceAction::List => {
                    let sources = registry.list_sources().await?;
                    if sources.is_empty() {
                        println!("No sources registered.");
                    }
                    for source in sources {
                        println!(
                            "{}\t{}\t{}\t{}",
                            source.id,
                            source.name(),
                            source.url,
                            source.added_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
            }
        }
        Commands::Schedule { action } => {
            let registry = SourceRegistry::connect(&config.db_path).await?;
            match action {
                ScheduleAction::Get => {
                    let interval = registry.interval(config.interval).await?;
                    println!("Cycle interval: {}s", interval.as_secs());
                }
                ScheduleAction::Set { seconds } => {
                    registry.set_interval(seconds).await?;
                    println!("Cycle interval set to {}s", seconds);
                }
            }
        }
    }

    Ok(())
}

/// Probe `input` in the background while the TUI shows progress
async fn check_with_tui(driver: CycleDriver, input: PathBuf) -> Result<()> {
    let total = LinkParser::parse_file(&input)?.len();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let driver = driver.with_events(tx);

    let handle = tokio::spawn(async move { driver.check_file(&input).await });
    let mut app = ProbeMonitorApp::new(total, rx);
    app.run().await?;

    if handle.is_finished() {
        let report = handle.await??;
        print_report(&report);
    } else {
        handle.abort();
        println!("Check interrupted.");
    }
    Ok(())
}

fn print_report(report: &CycleReport) {
    println!(
        "Sources: {} ({} failed) | Links: {} | Probed: {} | Passed: {} | Published: {} | Pooled: {}",
        report.sources,
        report.failed_sources,
        report.candidates,
        report.probed,
        report.passed,
        report.published,
        report.pooled
    );
}

/// Set up tracing. In TUI mode logs only go to a file, if one is given.
fn init_logging(level: &str, log_file: Option<&Path>, tui: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .init();
        }
        None if tui => {}
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false))
                .init();
        }
    }

    info!("Logging initialised at {}", level);
    Ok(())
}
