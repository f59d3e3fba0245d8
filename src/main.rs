mod analyze;
mod collect;
mod config;
mod dedup;
mod enrich;
mod github;
mod record;
mod sample;
mod stats;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, info_span};
use tracing_subscriber::EnvFilter;

/// VRT Pipeline — collects GitHub pull requests that use visual regression
/// testing, samples a comparable non-VRT cohort, and compares the two on
/// review time, size, activity, and acceptance rate.
#[derive(Parser, Debug)]
#[command(name = "vrt-pipeline", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search for PRs with VRT marker comments and write one row per comment
    Collect {
        /// Date-range settings file (one `start,end` pair per line)
        #[arg(short, long, default_value = "settings.txt")]
        settings: PathBuf,

        /// Output CSV path
        #[arg(short, long, default_value = "list-vrt-comments.csv")]
        output: PathBuf,
    },

    /// Collapse collector rows to one per PR and aggregate per-repo counts
    Dedup {
        /// Collector output CSV
        #[arg(short, long, default_value = "list-vrt-comments.csv")]
        input: PathBuf,

        /// Directory for the partition and count files
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Fetch candidate non-VRT PRs for every repository with VRT PRs
    Pool {
        /// Per-repository counts CSV from the dedup stage
        #[arg(short, long, default_value = "vrt-counts-without-open.csv")]
        counts: PathBuf,

        /// Date-range settings file
        #[arg(short, long, default_value = "settings.txt")]
        settings: PathBuf,

        /// Directory for the per-repository pr_details files
        #[arg(short, long, default_value = "candidate-pools")]
        output_dir: PathBuf,
    },

    /// Draw the counterfactual sample from the candidate pools
    Sample {
        /// Per-repository counts CSV (sample sizes)
        #[arg(short, long, default_value = "vrt-counts-merged.csv")]
        counts: PathBuf,

        /// Collector output CSV (per-repo date floors)
        #[arg(long, default_value = "list-vrt-comments.csv")]
        collector: PathBuf,

        /// Directory holding the per-repository pool files
        #[arg(short, long, default_value = "candidate-pools")]
        pool_dir: PathBuf,

        /// Output CSV path
        #[arg(short, long, default_value = "visual-prs-sampled.csv")]
        output: PathBuf,
    },

    /// Attach size and activity metrics to the sampled PRs
    Enrich {
        /// Sampler output CSV
        #[arg(short, long, default_value = "visual-prs-sampled.csv")]
        input: PathBuf,

        /// Output CSV path
        #[arg(short, long, default_value = "visual-prs-with-metrics.csv")]
        output: PathBuf,
    },

    /// Compare the VRT and visual cohorts and write the result table
    Analyze {
        /// VRT rows (dedup partition output)
        #[arg(long, default_value = "unique-vrt-without-open.csv")]
        vrt: PathBuf,

        /// Enriched visual rows
        #[arg(long, default_value = "visual-prs-with-metrics.csv")]
        visual: PathBuf,

        /// Separate visual file for the acceptance-rate tallies
        #[arg(long)]
        visual_states: Option<PathBuf>,

        /// Output CSV path
        #[arg(short, long, default_value = "result-effectsize.csv")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::Config::load()?;

    match cli.command {
        Command::Collect { settings, output } => {
            let _span = info_span!("collect").entered();
            let client = authenticated_client(&config)?;
            collect::run(&client, &config, &settings, &output).await?;
        }
        Command::Dedup { input, output_dir } => {
            let _span = info_span!("dedup").entered();
            dedup::run(&input, &output_dir)?;
        }
        Command::Pool {
            counts,
            settings,
            output_dir,
        } => {
            let _span = info_span!("pool").entered();
            let client = authenticated_client(&config)?;
            sample::pool::run(&client, &config, &counts, &settings, &output_dir).await?;
        }
        Command::Sample {
            counts,
            collector,
            pool_dir,
            output,
        } => {
            let _span = info_span!("sample").entered();
            let client = authenticated_client(&config)?;
            sample::run(&client, &config, &counts, &collector, &pool_dir, &output).await?;
        }
        Command::Enrich { input, output } => {
            let _span = info_span!("enrich").entered();
            let client = Arc::new(authenticated_client(&config)?);
            enrich::run(client, &input, &output).await?;
        }
        Command::Analyze {
            vrt,
            visual,
            visual_states,
            output,
        } => {
            let _span = info_span!("analyze").entered();
            analyze::run(&vrt, &visual, visual_states.as_deref(), &output)?;
        }
    }

    info!("done");
    Ok(())
}

fn authenticated_client(
    config: &config::Config,
) -> Result<github::GithubClient, github::GithubError> {
    let token = config
        .github_token()
        .ok_or(github::GithubError::MissingToken)?;
    github::GithubClient::new(&token)
}
