//! Reel: comment tooling
//!
//! Operator binary with subcommands:
//! - `count` / `recount`: read or repair post comment counters
//! - `thread`: print a post's comment thread page by page
//! - `post` / `delete` / `like`: write through the comment repository
//! - `watch`: follow a thread live until interrupted
//! - `demo`: run a session against a seeded in-memory store

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result, WrapErr};
use reel_comments::{CommentRepository, CommentsConfig, PageCache};
use reel_store::{DocumentStore, MemoryStore, RestStore};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod demo;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "reel")]
#[command(about = "Inspect and maintain Reel comment threads", long_about = None)]
struct Cli {
    /// Document store base URL. Without one, an empty in-memory store is used.
    #[arg(long, global = true, env = "REEL_STORE_URL")]
    store_url: Option<String>,

    /// Bearer token for the document store
    #[arg(long, global = true, env = "REEL_STORE_TOKEN", hide_env_values = true)]
    store_token: Option<String>,

    /// JSON file with comment settings
    #[arg(long, global = true, env = "REEL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured page size
    #[arg(long, global = true, env = "REEL_PAGE_SIZE")]
    page_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a post's top-level comment count
    Count {
        /// Post id
        post: String,
    },

    /// Recompute comment counters from the comments themselves
    Recount {
        /// Post ids
        #[arg(required = true)]
        posts: Vec<String>,
    },

    /// Print a post's comment thread
    Thread {
        /// Post id
        post: String,

        /// Number of pages to print
        #[arg(long, default_value = "1")]
        pages: usize,

        /// Skip the page cache
        #[arg(long, env = "REEL_FRESH", value_parser = parse_bool_env, default_value = "false")]
        fresh: bool,
    },

    /// Post a comment or reply
    Post {
        /// Post id
        post: String,

        /// Comment text
        text: String,

        /// Author id
        #[arg(long, env = "REEL_AUTHOR_ID")]
        author_id: String,

        /// Author display name
        #[arg(long, env = "REEL_AUTHOR_NAME")]
        author_name: String,

        /// Reply to this top-level comment
        #[arg(long)]
        parent: Option<String>,
    },

    /// Delete a comment and its replies
    Delete {
        /// Post id
        post: String,

        /// Comment id
        comment: String,
    },

    /// Like or unlike a comment
    Like {
        /// Post id
        post: String,

        /// Comment id
        comment: String,

        /// Remove a like instead
        #[arg(long)]
        undo: bool,
    },

    /// Follow a thread live until Ctrl-C
    Watch {
        /// Post id
        post: String,
    },

    /// Run a session against a seeded in-memory store
    Demo {
        /// Simulate an unreachable backend
        #[arg(long)]
        offline: bool,
    },
}

fn load_config(path: Option<&PathBuf>, page_size: Option<usize>) -> Result<CommentsConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&raw)
                .into_diagnostic()
                .wrap_err("invalid comment config")?
        }
        None => CommentsConfig::default(),
    };
    if let Some(page_size) = page_size {
        config.page_size = page_size;
    }
    config.validate().map_err(|e| miette::miette!("{}", e))?;
    Ok(config)
}

fn open_store(url: Option<&str>, token: Option<String>) -> Result<Arc<dyn DocumentStore>> {
    match url {
        Some(url) => {
            let store = RestStore::new(url, token)
                .map_err(|e| miette::miette!("failed to create store client: {}", e))?;
            info!(url, "using remote document store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("no store URL configured, using an empty in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "reel=info,reel_comments=info,reel_store=warn".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref(), cli.page_size)?;

    if let Commands::Demo { offline } = cli.command {
        return demo::run(config, offline).await;
    }

    let store = open_store(cli.store_url.as_deref(), cli.store_token)?;
    let cache = PageCache::new(config.cache_ttl());
    let repo = Arc::new(CommentRepository::new(store, cache, config));

    match cli.command {
        Commands::Count { post } => commands::count(&repo, &post).await,
        Commands::Recount { posts } => commands::recount(&repo, &posts).await,
        Commands::Thread { post, pages, fresh } => {
            commands::thread(&repo, &post, pages, fresh).await
        }
        Commands::Post {
            post,
            text,
            author_id,
            author_name,
            parent,
        } => {
            commands::post(
                &repo,
                &post,
                &text,
                &author_id,
                &author_name,
                parent.as_deref(),
            )
            .await
        }
        Commands::Delete { post, comment } => commands::delete(&repo, &post, &comment).await,
        Commands::Like {
            post,
            comment,
            undo,
        } => commands::like(&repo, &post, &comment, undo).await,
        Commands::Watch { post } => commands::watch(repo, &post).await,
        Commands::Demo { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_env_values() {
        assert_eq!(parse_bool_env("YES"), Ok(true));
        assert_eq!(parse_bool_env(""), Ok(false));
        assert!(parse_bool_env("maybe").is_err());
    }

    #[test]
    fn page_size_override_applies() {
        let config = load_config(None, Some(5)).unwrap();
        assert_eq!(config.page_size, 5);
        assert!(load_config(None, Some(0)).is_err());
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["reel", "thread", "p1", "--pages", "3", "--page-size", "7"])
            .unwrap();
        assert_eq!(cli.page_size, Some(7));
        assert!(matches!(cli.command, Commands::Thread { pages: 3, .. }));
    }
}
