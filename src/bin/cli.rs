//! CLI for inspecting and operating on coordination state

use anyhow::Context;
use clap::{Parser, Subcommand};
use kvcoord::common::utils::{format_duration, parse_duration};
use kvcoord::{
    CacheManager, Config, DistributedLock, KvClient, LockoutManager, OpContext, TaggedCache, Ttl,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kvcoord")]
#[command(about = "kvcoord coordination primitives CLI")]
#[command(version)]
struct Cli {
    /// TOML config file (KVCOORD_* environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store URL, overrides store.url
    #[arg(long, global = true)]
    url: Option<String>,

    /// Per-command timeout, overrides store.op_timeout
    #[arg(long, global = true, value_parser = parse_ttl)]
    timeout: Option<Duration>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a raw key
    Get {
        key: String,
    },

    /// Write a raw key
    Set {
        key: String,

        value: String,

        /// Expiry, e.g. 30s, 5m (no expiry if omitted)
        #[arg(long, value_parser = parse_ttl)]
        ttl: Option<Duration>,
    },

    /// Delete raw keys
    Del {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Show a key's remaining lifetime
    Ttl {
        key: String,
    },

    /// List keys matching a glob pattern
    Keys {
        #[arg(default_value = "*")]
        pattern: String,
    },

    /// Distributed lock operations
    Lock {
        #[command(subcommand)]
        action: LockCommands,
    },

    /// Invalidate cache entries by tag
    InvalidateTag {
        #[arg(required = true)]
        tags: Vec<String>,
    },

    /// Delete cache entries whose logical key matches a pattern
    DeletePattern {
        pattern: String,
    },

    /// Hash a password for provisioning (reads stdin if omitted)
    HashPassword {
        password: Option<String>,
    },
}

#[derive(Subcommand)]
enum LockCommands {
    /// Acquire a lock and print its owner token
    Acquire {
        key: String,

        /// Lock TTL (lock.default_ttl if omitted)
        #[arg(long, value_parser = parse_ttl)]
        ttl: Option<Duration>,
    },

    /// Release a lock held by TOKEN
    Release {
        key: String,

        token: String,
    },

    /// Extend a lock held by TOKEN
    Extend {
        key: String,

        token: String,

        #[arg(long, value_parser = parse_ttl)]
        ttl: Duration,
    },
}

fn parse_ttl(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(url) = cli.url {
        config.store.url = url;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Needs no store connection
    let command = match cli.command {
        Commands::HashPassword { password } => return hash_password(&config, password),
        command => command,
    };

    let ctx = OpContext::with_timeout(cli.timeout.unwrap_or(config.store.op_timeout));
    let client = KvClient::connect(&config.store)
        .await
        .with_context(|| format!("failed to connect to {}", config.store.url))?;

    let result = run(command, &config, &client, &ctx).await;
    client.close().await?;
    result
}

async fn run(
    command: Commands,
    config: &Config,
    client: &KvClient,
    ctx: &OpContext,
) -> anyhow::Result<()> {
    match command {
        Commands::Get { key } => {
            let value = client.get_with_retry(ctx, &key, None).await?;
            println!("{}", String::from_utf8_lossy(&value));
        }

        Commands::Set { key, value, ttl } => {
            client
                .set_with_retry(ctx, &key, value.as_bytes(), ttl, None)
                .await?;
            println!("OK");
        }

        Commands::Del { keys } => {
            let removed = client.delete(ctx, &keys[..]).await?;
            println!("{}", removed);
        }

        Commands::Ttl { key } => match client.ttl(ctx, &key).await? {
            Ttl::Persistent => println!("persistent"),
            Ttl::Expires(d) => println!("{}", format_duration(d)),
        },

        Commands::Keys { pattern } => {
            for key in client.keys(ctx, &pattern).await? {
                println!("{}", key);
            }
        }

        Commands::Lock { action } => {
            let locks = DistributedLock::new(client.clone(), &config.lock);
            match action {
                LockCommands::Acquire { key, ttl } => {
                    let guard = locks.acquire(ctx, &key, ttl).await?;
                    println!("{}", serde_json::to_string_pretty(&guard.info())?);
                }
                LockCommands::Release { key, token } => {
                    locks.release_token(ctx, &key, &token).await?;
                    println!("released {}", key);
                }
                LockCommands::Extend { key, token, ttl } => {
                    locks.extend_token(ctx, &key, &token, ttl).await?;
                    println!("extended {} by {}", key, format_duration(ttl));
                }
            }
        }

        Commands::InvalidateTag { tags } => {
            let tagged = TaggedCache::new(CacheManager::new(client.clone(), config.cache.clone()));
            let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
            let processed = tagged.invalidate_by_tags(ctx, &tags).await?;
            println!("invalidated {} entries", processed);
        }

        Commands::DeletePattern { pattern } => {
            let cache = CacheManager::new(client.clone(), config.cache.clone());
            let removed = cache.delete_pattern(ctx, &pattern).await?;
            println!("deleted {} entries", removed);
        }

        Commands::HashPassword { password } => hash_password(config, password)?,
    }

    Ok(())
}

fn hash_password(config: &Config, password: Option<String>) -> anyhow::Result<()> {
    let password = match password {
        Some(p) => p,
        None => read_stdin_line()?,
    };
    let hash = LockoutManager::new(config.lockout.clone()).hash_password(&password)?;
    println!("{}", hash);
    Ok(())
}

fn read_stdin_line() -> anyhow::Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    anyhow::ensure!(!password.is_empty(), "password cannot be empty");
    Ok(password)
}
