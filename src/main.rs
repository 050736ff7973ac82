use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use gator::commands::{self, State};
use gator::config::Config;
use gator::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "gator", about = "Command-line RSS aggregator", version)]
struct Args {
    /// Config file (default: ~/.config/gator/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a user and log in as them
    Register { name: String },
    /// Switch the current user
    Login { name: String },
    /// List users
    Users,
    /// Delete all users, feeds, follows and posts
    Reset,
    /// Register a feed and follow it
    Addfeed { name: String, url: String },
    /// List all feeds
    Feeds,
    /// Follow a registered feed
    Follow { url: String },
    /// Stop following a feed
    Unfollow { url: String },
    /// List feeds the current user follows
    Following,
    /// Show the newest posts from followed feeds
    Browse {
        /// Number of posts to show
        limit: Option<i64>,
    },
    /// Collect feeds every INTERVAL (e.g. 30s, 1m, 1h30m); without INTERVAL,
    /// fetch one feed once and print it
    Agg {
        interval: Option<String>,
        /// Feed to fetch in one-off mode instead of the next one in rotation
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },
}

/// Get the default config file path (~/.config/gator/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("gator")
        .join("config.toml"))
}

fn ensure_config_dir(config_path: &Path) -> Result<()> {
    let Some(dir) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    if dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create config directory {}", dir.display()))?;

    // SEC-007: User-only access to the directory holding config and database
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Couldn't listen for Ctrl-C; stop with SIGTERM instead");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gator=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    ensure_config_dir(&config_path)?;

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = config.resolve_db_path(&config_path);
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = Database::open(db_path_str)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    let mut state = State::new(db, config, config_path);
    let mut out = std::io::stdout();

    match args.command {
        Command::Register { name } => commands::register(&mut state, &name, &mut out).await,
        Command::Login { name } => commands::login(&mut state, &name, &mut out).await,
        Command::Users => commands::users(&state, &mut out).await,
        Command::Reset => commands::reset(&state, &mut out).await,
        Command::Addfeed { name, url } => commands::add_feed(&state, &name, &url, &mut out).await,
        Command::Feeds => commands::feeds(&state, &mut out).await,
        Command::Follow { url } => commands::follow(&state, &url, &mut out).await,
        Command::Unfollow { url } => commands::unfollow(&state, &url, &mut out).await,
        Command::Following => commands::following(&state, &mut out).await,
        Command::Browse { limit } => commands::browse(&state, limit, &mut out).await,
        Command::Agg { interval, url } => {
            commands::agg(
                &state,
                interval.as_deref(),
                url.as_deref(),
                shutdown_signal(),
                &mut out,
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_agg_interval() {
        let args = Args::try_parse_from(["gator", "agg", "1m"]).unwrap();
        match args.command {
            Command::Agg { interval, url } => {
                assert_eq!(interval.as_deref(), Some("1m"));
                assert_eq!(url, None);
            }
            other => panic!("Expected Agg, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_global_config_after_subcommand() {
        let args =
            Args::try_parse_from(["gator", "browse", "5", "--config", "/tmp/c.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(args.command, Command::Browse { limit: Some(5) }));
    }

    #[test]
    fn test_cli_addfeed_requires_url() {
        assert!(Args::try_parse_from(["gator", "addfeed", "name-only"]).is_err());
    }
}
