use std::path::PathBuf;

use anyhow::{Context, Result};
use binsync_common::config::BinsyncConfig;
use binsync_common::logging::setup_tracing;
use binsync_core::auth::{discover_ssh_agent, AuthHints};
use binsync_core::client::{AttachOptions, Client};
use binsync_core::state::toml_state::TomlState;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Synchronize reverse-engineering annotations across analyst branches", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Emit structured JSON logs instead of pretty-printed ones.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct RepoArgs {
    /// Local path to the repository working tree.
    #[arg(long)]
    repo_root: Option<PathBuf>,
    /// Analyst identity attaching to this repository.
    #[arg(long)]
    user: String,
    /// Opaque identifier of the analyzed binary.
    #[arg(long)]
    binary_hash: String,
    /// Remote URL to clone from, for the first attach against a shared repo.
    #[arg(long)]
    remote_url: Option<String>,
    /// Name of the configured Git remote.
    #[arg(long, env = "BINSYNC_REMOTE")]
    remote_name: Option<String>,
    /// Discover SSH agent credentials before attaching.
    #[arg(long)]
    discover_ssh_agent: bool,
}

impl RepoArgs {
    fn auth_hints(&self) -> AuthHints {
        if self.discover_ssh_agent {
            discover_ssh_agent()
        } else {
            AuthHints::default()
        }
    }

    fn attach_options(&self, init: bool, config: &BinsyncConfig) -> AttachOptions {
        AttachOptions {
            master_user: self.user.clone(),
            repo_root: self.repo_root.clone(),
            binary_hash: self.binary_hash.clone(),
            remote_url: self.remote_url.clone(),
            init,
            remote_name: self
                .remote_name
                .clone()
                .unwrap_or_else(|| config.repo.remote.clone()),
            auth_hints: self.auth_hints(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a brand-new binsync repository and attach to it.
    Init {
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Attach to an existing binsync repository.
    Attach {
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Commit the working analyst's current annotations.
    Commit {
        #[command(flatten)]
        repo: RepoArgs,
        /// Commit message.
        #[arg(long, default_value = "binsync commit")]
        message: String,
        /// Path to a TOML file with the annotation payload to merge into metadata.toml.
        #[arg(long)]
        payload_file: Option<PathBuf>,
    },
    /// Pull and reconcile with the remote.
    Pull {
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Push the root and user branch to the remote.
    Push {
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Commit-if-dirty, pull, then push, in one step.
    Update {
        #[command(flatten)]
        repo: RepoArgs,
        #[arg(long, default_value = "binsync update")]
        message: String,
        #[arg(long)]
        payload_file: Option<PathBuf>,
    },
    /// List all participating analysts.
    Users {
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Print the attached repository's state: warnings and timestamps.
    Status {
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Run `update` on a timer until interrupted (Ctrl-C).
    Watch {
        #[command(flatten)]
        repo: RepoArgs,
        #[arg(long, default_value = "binsync watch")]
        message: String,
        /// Override the configured commit interval, in seconds.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

fn load_payload(path: &Option<PathBuf>) -> Result<toml::Value> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading payload file {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing payload file {}", path.display()))
        }
        None => Ok(toml::Value::Table(toml::value::Table::new())),
    }
}

fn print_users(client: &Client<TomlState>) -> Result<()> {
    let users = client.users()?;
    for user in users.iter() {
        match &user.display_name {
            Some(name) => println!("{} ({name})", user.username),
            None => println!("{}", user.username),
        }
    }
    Ok(())
}

fn print_status(client: &Client<TomlState>) {
    println!("master user: {}", client.master_user());
    println!("connection warnings: {:?}", client.connection_warnings());
    println!("last_commit_ts: {:?}", client.last_commit_ts());
    println!("last_pull_ts: {:?}", client.last_pull_ts());
    println!("last_push_ts: {:?}", client.last_push_ts());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BinsyncConfig::load().unwrap_or_default();
    setup_tracing(cli.json_logs || config.logging.json);

    match cli.command {
        Commands::Watch { repo, message, interval_secs } => {
            run_watch(repo, message, interval_secs, config).await
        }
        other => run_one_shot(other, config),
    }
}

/// Runs `update` on a fixed interval until Ctrl-C, attaching once and
/// reusing the same `Client` for every tick (§4.4's `update` is exactly
/// this composition, driven periodically by the host application).
async fn run_watch(
    repo: RepoArgs,
    message: String,
    interval_secs: Option<u64>,
    config: BinsyncConfig,
) -> Result<()> {
    let interval_secs = interval_secs.unwrap_or(config.repo.commit_interval_secs).max(1);
    let client = tokio::task::spawn_blocking(move || -> Result<Client<TomlState>> {
        Client::<TomlState>::attach(repo.attach_options(false, &config))
            .context("attaching to binsync repository")
    })
    .await??;

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let state = client.get_state(Some(client.master_user()), None)?;
                let state = (*state).clone();
                if let Err(e) = client.update(state, &message) {
                    tracing::warn!(error = %e, "watch: update cycle failed, retrying next tick");
                } else {
                    print_status(&client);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("watch: received interrupt, shutting down");
                return Ok(());
            }
        }
    }
}

fn run_one_shot(command: Commands, config: BinsyncConfig) -> Result<()> {
    match command {
        Commands::Init { repo } => {
            let client = Client::<TomlState>::attach(repo.attach_options(true, &config))
                .context("initializing binsync repository")?;
            print_status(&client);
        }
        Commands::Attach { repo } => {
            let client = Client::<TomlState>::attach(repo.attach_options(false, &config))
                .context("attaching to binsync repository")?;
            print_status(&client);
        }
        Commands::Commit { repo, message, payload_file } => {
            let client = Client::<TomlState>::attach(repo.attach_options(false, &config))
                .context("attaching to binsync repository")?;
            let payload = load_payload(&payload_file)?;
            let state = TomlState::new(repo.user.clone(), payload);
            client.commit_state(state, &message).context("committing state")?;
            print_status(&client);
        }
        Commands::Pull { repo } => {
            let client = Client::<TomlState>::attach(repo.attach_options(false, &config))
                .context("attaching to binsync repository")?;
            client.pull().context("pulling from remote")?;
            print_status(&client);
        }
        Commands::Push { repo } => {
            let client = Client::<TomlState>::attach(repo.attach_options(false, &config))
                .context("attaching to binsync repository")?;
            client.push().context("pushing to remote")?;
            print_status(&client);
        }
        Commands::Update { repo, message, payload_file } => {
            let client = Client::<TomlState>::attach(repo.attach_options(false, &config))
                .context("attaching to binsync repository")?;
            let state = match &payload_file {
                Some(_) => TomlState::new(repo.user.clone(), load_payload(&payload_file)?),
                None => (*client.get_state(Some(&repo.user), None)?).clone(),
            };
            client.update(state, &message).context("running update cycle")?;
            print_status(&client);
        }
        Commands::Users { repo } => {
            let client = Client::<TomlState>::attach(repo.attach_options(false, &config))
                .context("attaching to binsync repository")?;
            print_users(&client)?;
        }
        Commands::Status { repo } => {
            let client = Client::<TomlState>::attach(repo.attach_options(false, &config))
                .context("attaching to binsync repository")?;
            print_status(&client);
        }
        Commands::Watch { .. } => unreachable!("Watch is dispatched to run_watch before reaching run_one_shot"),
    }

    Ok(())
}
