//! glideinctl
//!
//! Submits jobs to a glidein controller and observes its pool: advertised
//! glideins, aggregated metrics and uploaded log bundles.

use anyhow::Result;
use clap::{Parser, Subcommand};
use glidein_ctl::{
    client::{ApiClient, GlideinQuery},
    commands::{glideins, jobs, observe},
    config::Config,
    output::{self, print_error, print_success},
};
use glidein_lib::{models::JobSpec, registry::RetryPolicy};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "glideinctl")]
#[command(author, version, about = "CLI for a glidein pool", long_about = None)]
pub struct Cli {
    /// Controller API URL; overrides the config file
    #[arg(long, env = "GLIDEINCTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a cluster of identical jobs
    Submit {
        executable: String,

        /// Arguments, split on whitespace
        #[arg(default_value = "")]
        arguments: String,

        /// File receiving the job's stdout
        #[arg(long)]
        output: Option<String>,

        /// Requested memory in MB
        #[arg(long, default_value_t = 0)]
        memory: u64,

        /// Capability that must be advertised (repeatable)
        #[arg(long = "require")]
        requirements: Vec<String>,

        #[arg(long, short, default_value_t = 1)]
        count: u32,
    },

    /// Show finished jobs
    History {
        #[arg(long)]
        cluster: Option<u64>,

        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Remove queued and running jobs
    Remove {
        /// Only this cluster
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        cluster: Option<u64>,

        /// Every job in the queue
        #[arg(long)]
        all: bool,
    },

    /// List advertised glideins
    Glideins {
        #[arg(long)]
        site: Option<String>,

        #[arg(long)]
        partition: Option<String>,

        /// Capability that must be true (repeatable)
        #[arg(long = "resource")]
        resources: Vec<String>,

        /// Withdrawn and expired glideins instead of live ones
        #[arg(long)]
        retired: bool,
    },

    /// Wait until a matching glidein is advertised
    Wait {
        #[arg(long)]
        site: Option<String>,

        #[arg(long, default_value_t = 6)]
        attempts: u32,

        /// Initial backoff in seconds, doubled per attempt
        #[arg(long, default_value_t = 1)]
        backoff: u64,
    },

    /// Render aggregated series and check them for data
    Metrics {
        /// Dotted series pattern, `*` matching one component
        target: String,

        #[arg(long, default_value = "-10min")]
        from: String,
    },

    /// Fetch and extract a log bundle from its URL
    Logs {
        url: String,

        /// Destination directory; the config's log_dir or the current directory
        #[arg(long, short)]
        dest: Option<PathBuf>,
    },

    /// Store the API URL and default site in the config file
    Configure {
        #[arg(long)]
        api_url: Option<String>,

        #[arg(long)]
        site: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            print_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load()?;
    let client = ApiClient::new(&config.api_url(cli.api_url.as_deref()))?;
    let format = cli.format;

    match cli.command {
        Commands::Submit {
            executable,
            arguments,
            output,
            memory,
            requirements,
            count,
        } => {
            let mut spec = JobSpec::new(executable, arguments).with_memory(memory);
            spec.output = output;
            spec.requirements = requirements;
            jobs::submit(&client, spec, count, format).await?;
        }
        Commands::History { cluster, limit } => {
            jobs::history(&client, cluster, limit, format).await?;
        }
        Commands::Remove { cluster, all: _ } => {
            jobs::remove(&client, cluster, format).await?;
        }
        Commands::Glideins {
            site,
            partition,
            resources,
            retired,
        } => {
            let query = GlideinQuery {
                site: site.or_else(|| config.default_site.clone()),
                partition,
                resources,
                retired,
            };
            glideins::list(&client, &query, format).await?;
        }
        Commands::Wait {
            site,
            attempts,
            backoff,
        } => {
            let query = GlideinQuery {
                site: site.or_else(|| config.default_site.clone()),
                ..Default::default()
            };
            let policy = RetryPolicy {
                max_attempts: attempts,
                initial_backoff: Duration::from_secs(backoff),
                ..Default::default()
            };
            glideins::wait(&client, &query, &policy, format).await?;
        }
        Commands::Metrics { target, from } => {
            let flagged = observe::metrics(&client, &target, &from, format).await?;
            if flagged > 0 {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Logs { url, dest } => {
            let dest = dest
                .or_else(|| config.log_dir.clone())
                .unwrap_or_else(|| PathBuf::from("."));
            observe::fetch_logs(&client, &url, &dest, format).await?;
        }
        Commands::Configure { api_url, site } => {
            if api_url.is_some() {
                config.api_url = api_url;
            }
            if site.is_some() {
                config.default_site = site;
            }
            config.save()?;
            print_success(&format!("Saved {}", Config::config_path()?.display()));
        }
    }

    Ok(ExitCode::SUCCESS)
}
