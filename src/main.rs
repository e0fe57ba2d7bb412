use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use lyrics_enrich::batch::{BatchConfig, Cooldown, ThreadSleep, WriteMode};
use lyrics_enrich::language::TrigramDetector;
use lyrics_enrich::lookup::{Enricher, LanguageCaller, MetadataCaller, Projection};
use lyrics_enrich::pipeline::{self, RunPlan, RunSummary, Variant};
use lyrics_enrich::progress::{format_duration, set_log_only};
use lyrics_enrich::safety::validate_output_path;
use lyrics_enrich::spotify::{Credentials, SpotifyClient};
use lyrics_enrich::store::MergePolicy;

#[derive(Parser)]
#[command(name = "lyrics-enrich")]
#[command(about = "Incrementally enrich a song lyrics CSV with Spotify metadata and lyrics language")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Hide progress bars and log periodic progress lines instead
    #[arg(long, global = true)]
    log_only: bool,
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Original dataset (ARTIST_NAME, SONG_NAME, LYRICS, ...)
    input: PathBuf,

    /// Enriched output; resumed from if it already exists
    output: PathBuf,

    /// Never replace a populated field with an empty lookup result
    #[arg(long)]
    keep_existing: bool,

    /// Also reprocess rows whose enrichment fields are all empty
    #[arg(long)]
    retry_unmatched: bool,

    /// Skip the <output>.lock single-writer guard
    #[arg(long)]
    no_lock: bool,

    /// Write a JSON run summary to this path
    #[arg(long)]
    stats: Option<PathBuf>,
}

#[derive(clap::Args)]
struct SpotifyArgs {
    #[arg(long, env = "SPOTIFY_CLIENT_ID", hide_env_values = true)]
    client_id: Option<String>,

    #[arg(long, env = "SPOTIFY_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// URL-encode the search query before sending it
    #[arg(long)]
    encode_query: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Add track URL, album, release date, duration, popularity and preview URL
    Metadata {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        spotify: SpotifyArgs,

        /// Seconds to wait between requests
        #[arg(long, default_value = "0.1")]
        wait_time: f64,

        /// Rows processed between saves
        #[arg(long, default_value = "500")]
        save_interval: u64,

        /// Requests per run (0 = unlimited)
        #[arg(long, default_value = "35000")]
        max_requests: u64,

        /// Append result rows and fold duplicates on save instead of updating in place
        #[arg(long)]
        append: bool,
    },

    /// Add only the Spotify track URL
    Urls {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        spotify: SpotifyArgs,

        #[arg(long, default_value = "0.2")]
        wait_time: f64,

        #[arg(long, default_value = "500")]
        save_interval: u64,

        #[arg(long, default_value = "35000")]
        max_requests: u64,
    },

    /// Detect the language of the lyrics
    Language {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, default_value = "1000")]
        save_interval: u64,

        /// Rows processed between cooldown pauses
        #[arg(long, default_value = "5000")]
        pause_interval: u64,

        /// Cooldown length in seconds
        #[arg(long, default_value = "30")]
        pause_secs: u64,

        /// Accepted for parity with seeded detectors; detection is deterministic
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Report detections below this confidence as unknown
        #[arg(long, default_value = "0.0")]
        min_confidence: f64,
    },
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("Invalid {}: {}", flag, value))
}

fn budget(max_requests: u64) -> Option<u64> {
    (max_requests > 0).then_some(max_requests)
}

fn spotify_client(args: &SpotifyArgs) -> Result<SpotifyClient> {
    let client_id = args
        .client_id
        .clone()
        .context("SPOTIFY_CLIENT_ID is not set (environment, .env or --client-id)")?;
    let client_secret = args
        .client_secret
        .clone()
        .context("SPOTIFY_CLIENT_SECRET is not set (environment, .env or --client-secret)")?;

    let client = SpotifyClient::new(Credentials {
        client_id,
        client_secret,
    })
    .context("Failed to build HTTP client")?;
    client.authenticate().context("Spotify authentication failed")?;
    Ok(client)
}

fn build_plan(variant: Variant, common: &CommonArgs, batch: BatchConfig) -> Result<RunPlan> {
    validate_output_path(&common.output, &common.input)?;
    Ok(RunPlan {
        variant,
        input: common.input.clone(),
        output: common.output.clone(),
        batch: BatchConfig {
            merge_policy: if common.keep_existing {
                MergePolicy::KeepExisting
            } else {
                MergePolicy::Overwrite
            },
            ..batch
        },
        retry_empty: common.retry_unmatched || variant == Variant::Language,
        lock_output: !common.no_lock,
    })
}

fn execute<E: Enricher>(plan: &RunPlan, enricher: &E, stats: Option<&PathBuf>) -> Result<i32> {
    let (outcome, pending) = pipeline::run(plan, enricher, &mut ThreadSleep);

    if let Some(path) = stats {
        RunSummary::new(plan, pending, &outcome)
            .write(path)
            .with_context(|| format!("Failed to write stats to {}", path.display()))?;
    }
    Ok(outcome.exit_code())
}

fn main() -> Result<()> {
    let dotenv = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match dotenv {
        Ok(path) => debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => warn!("Ignoring malformed .env file: {}", e),
    }

    let args = Args::parse();
    set_log_only(args.log_only);

    let start = Instant::now();

    let code = match args.command {
        Command::Metadata {
            common,
            spotify,
            wait_time,
            save_interval,
            max_requests,
            append,
        } => {
            let batch = BatchConfig {
                wait_time: seconds(wait_time, "--wait-time")?,
                save_interval,
                max_requests: budget(max_requests),
                write_mode: if append { WriteMode::Append } else { WriteMode::InPlace },
                ..Default::default()
            };
            let plan = build_plan(Variant::Metadata, &common, batch)?;
            let client = spotify_client(&spotify)?;
            let caller = MetadataCaller::new(client).with_encoded_query(spotify.encode_query);
            execute(&plan, &caller, common.stats.as_ref())?
        }
        Command::Urls {
            common,
            spotify,
            wait_time,
            save_interval,
            max_requests,
        } => {
            let batch = BatchConfig {
                wait_time: seconds(wait_time, "--wait-time")?,
                save_interval,
                max_requests: budget(max_requests),
                ..Default::default()
            };
            let plan = build_plan(Variant::Urls, &common, batch)?;
            let client = spotify_client(&spotify)?;
            let caller = MetadataCaller::new(client)
                .with_encoded_query(spotify.encode_query)
                .with_projection(Projection::UrlOnly);
            execute(&plan, &caller, common.stats.as_ref())?
        }
        Command::Language {
            common,
            save_interval,
            pause_interval,
            pause_secs,
            seed,
            min_confidence,
        } => {
            let batch = BatchConfig {
                wait_time: Duration::ZERO,
                save_interval,
                max_requests: None,
                cooldown: Some(Cooldown {
                    every: pause_interval,
                    duration: Duration::from_secs(pause_secs),
                }),
                ..Default::default()
            };
            info!("Language detection seed {} (detector is deterministic)", seed);
            let plan = build_plan(Variant::Language, &common, batch)?;
            let caller = LanguageCaller::new(TrigramDetector::new().with_min_confidence(min_confidence));
            execute(&plan, &caller, common.stats.as_ref())?
        }
    };

    info!("Finished in {}", format_duration(start.elapsed()));
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
