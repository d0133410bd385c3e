//! autopost-queue - Inspect and steer the publishing queue
//!
//! Unix-style admin tool: quota status, post listing, approval, withdrawal,
//! cycle renewal and one-off enforcement passes.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use libautopost::logging::{LoggingConfig, LEVEL_ENV};
use libautopost::types::{
    now_ms, ConnectionKey, Content, Credential, CycleRenewed, NewPost, PlanTier, Platform, Post,
    PostState, QuotaStatus,
};
use libautopost::{AutopostError, AutopostService, Config, PostFilter};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "autopost-queue")]
#[command(version)]
#[command(about = "Inspect and steer the publishing queue")]
#[command(long_about = "\
autopost-queue - Inspect and steer the publishing queue

DESCRIPTION:
    autopost-queue manages subscribers, their quota cycles and their posts
    in the autopost database. Publishing itself is done by autopost-send.

COMMANDS:
    subscriber  Register a subscriber on a plan
    connect     Store a platform credential for a subscriber
    draft       Create a draft post
    approve     Approve a draft (reserves one unit of quota)
    cancel      Withdraw an approved or queued post (releases its quota)
    list        List posts
    status      Show a subscriber's quota for the current cycle
    renew       Start the next quota cycle
    enforce     Run one enforcement pass

USAGE EXAMPLES:
    autopost-queue subscriber sub-1 --plan growth
    autopost-queue draft sub-1 linkedin \"Launch day\" --in 2h
    autopost-queue approve <POST_ID>
    autopost-queue list --state queued --format json
    autopost-queue status sub-1

CONFIGURATION:
    Configuration file: ~/.config/autopost/config.toml
    Database location: ~/.local/share/autopost/autopost.db

    Override with environment variables:
        AUTOPOST_CONFIG    - Path to config file
        AUTOPOST_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Authorization error
    3 - Invalid input or unknown id
    4 - Quota exhausted or cycle ended
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: $AUTOPOST_CONFIG or the XDG config dir)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a subscriber; the allocation comes from the plan
    Subscriber {
        subscriber_id: String,

        /// starter, growth or professional
        #[arg(long, default_value = "starter")]
        plan: PlanTier,

        /// Cycle start as RFC 3339 (default: now)
        #[arg(long)]
        start: Option<String>,
    },

    /// Store a platform credential obtained from an OAuth flow
    Connect {
        subscriber_id: String,
        platform: Platform,

        #[arg(long, env = "AUTOPOST_ACCESS_TOKEN", hide_env_values = true)]
        access_token: String,

        #[arg(long, env = "AUTOPOST_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: Option<String>,

        /// Lifetime of the access token, e.g. "2h" or "60days"
        #[arg(long, value_parser = humantime::parse_duration)]
        expires_in: Option<Duration>,
    },

    /// Create a draft post
    Draft {
        subscriber_id: String,
        platform: Platform,
        text: String,

        /// Target time as RFC 3339
        #[arg(long, conflicts_with = "delay")]
        at: Option<String>,

        /// Target time relative to now, e.g. "90m" or "2days"
        #[arg(long = "in", value_name = "DURATION", value_parser = humantime::parse_duration)]
        delay: Option<Duration>,

        /// Hosted media reference (repeatable)
        #[arg(long = "media")]
        media: Vec<String>,
    },

    /// Approve a draft
    Approve { post_id: String },

    /// Withdraw an approved or queued post
    Cancel {
        post_id: String,

        #[arg(long, default_value = "Withdrawn by operator")]
        reason: String,
    },

    /// List posts by target time
    List {
        #[arg(long)]
        subscriber: Option<String>,

        #[arg(long)]
        state: Option<PostState>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show a subscriber's quota for the current cycle
    Status { subscriber_id: String },

    /// Start the next quota cycle (normally driven by billing)
    Renew {
        subscriber_id: String,

        #[arg(long)]
        allocation: i64,

        /// New cycle start as RFC 3339 (default: now)
        #[arg(long)]
        start: Option<String>,
    },

    /// Run one enforcement pass
    Enforce,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env(cli.verbose);
    if !cli.verbose && std::env::var(LEVEL_ENV).is_err() {
        logging.level = "error".to_string();
    }
    logging.init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<AutopostError>()
        .map(|e| e.exit_code() as u8)
        .unwrap_or(1)
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::load()?,
    };
    let service = AutopostService::from_config(config).await?;
    let format = cli.format;

    match cli.command {
        Commands::Subscriber {
            subscriber_id,
            plan,
            start,
        } => {
            let cycle_start = parse_time_or_now(start.as_deref())?;
            let subscriber = service.add_subscriber(&subscriber_id, plan, cycle_start).await?;
            output(format, &subscriber, || {
                format!("{} ({}, {} posts per cycle)", subscriber.id, subscriber.plan, plan.quota())
            })?;
        }
        Commands::Connect {
            subscriber_id,
            platform,
            access_token,
            refresh_token,
            expires_in,
        } => {
            if service.db().get_subscriber(&subscriber_id).await?.is_none() {
                return Err(AutopostError::NotFound(format!("subscriber {}", subscriber_id)).into());
            }
            let key = ConnectionKey::new(subscriber_id, platform);
            let expires_at = expires_in.map(|d| now_ms() + d.as_millis() as i64);
            let credential = Credential::new(access_token, refresh_token, expires_at);
            service.tokens().upsert_connection(&key, &credential).await?;
            let stored = serde_json::json!({
                "subscriber_id": key.subscriber_id,
                "platform": key.platform,
                "expires_at": expires_at,
            });
            output(format, &stored, || format!("{} connected", key))?;
        }
        Commands::Draft {
            subscriber_id,
            platform,
            text,
            at,
            delay,
            media,
        } => {
            let target_at = match (at, delay) {
                (Some(at), _) => parse_time(&at)?,
                (None, Some(offset)) => now_ms() + offset.as_millis() as i64,
                (None, None) => now_ms(),
            };
            let content = media.into_iter().fold(Content::text(text), Content::with_media);
            let post = service
                .lifecycle()
                .create_draft(NewPost::new(subscriber_id, platform, content, target_at))
                .await?;
            output(format, &post, || post.id.clone())?;
        }
        Commands::Approve { post_id } => {
            validate_post_id(&post_id)?;
            let post = service.approve(&post_id).await?;
            output(format, &post, || {
                format!("{} approved for cycle {}", post.id, post.cycle_id.unwrap_or_default())
            })?;
        }
        Commands::Cancel { post_id, reason } => {
            validate_post_id(&post_id)?;
            let post = service.cancel(&post_id, &reason).await?;
            output(format, &post, || format!("{} cancelled", post.id))?;
        }
        Commands::List {
            subscriber,
            state,
            limit,
        } => {
            let posts = service
                .lifecycle()
                .list(&PostFilter {
                    subscriber_id: subscriber,
                    state,
                    limit: Some(limit),
                })
                .await?;
            output(format, &posts, || list_text(&posts))?;
        }
        Commands::Status { subscriber_id } => {
            let status = service.get_quota_status(&subscriber_id).await?;
            output(format, &status, || status_text(&status, now_ms()))?;
        }
        Commands::Renew {
            subscriber_id,
            allocation,
            start,
        } => {
            let renewal = CycleRenewed {
                subscriber_id,
                new_allocation: allocation,
                new_cycle_start: parse_time_or_now(start.as_deref())?,
            };
            let report = service.renew(&renewal).await?;
            output(format, &report, || match &report {
                Some(r) => format!(
                    "{} moved from cycle {} to {} ({} post(s) cancelled)",
                    r.subscriber_id, r.previous_cycle_id, r.cycle_id, r.cancelled
                ),
                None => format!("{}: renewal ignored, cycle already current", renewal.subscriber_id),
            })?;
        }
        Commands::Enforce => {
            let report = service.enforce().await?;
            output(format, &report, || {
                format!(
                    "admitted {}, cancelled {}, warnings {}, mismatches {}",
                    report.admitted, report.cancelled, report.warnings, report.mismatches
                )
            })?;
        }
    }

    Ok(())
}

/// Print `value` as JSON, or the text rendering (skipped when empty)
fn output<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => {
            let text = text();
            if !text.is_empty() {
                println!("{}", text);
            }
        }
    }
    Ok(())
}

fn validate_post_id(post_id: &str) -> Result<()> {
    uuid::Uuid::parse_str(post_id)
        .map_err(|_| AutopostError::InvalidInput(format!("Invalid post ID: '{}'", post_id)))?;
    Ok(())
}

fn parse_time(value: &str) -> Result<i64> {
    let parsed = DateTime::parse_from_rfc3339(value).map_err(|e| {
        AutopostError::InvalidInput(format!("Invalid time '{}': {} (expected RFC 3339)", value, e))
    })?;
    Ok(parsed.timestamp_millis())
}

fn parse_time_or_now(value: Option<&str>) -> Result<i64> {
    value.map(parse_time).unwrap_or_else(|| Ok(now_ms()))
}

fn format_ms(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(t) => t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        None => ms.to_string(),
    }
}

/// Truncate content to `max_chars` characters with ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let head: String = content.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

fn list_text(posts: &[Post]) -> String {
    posts
        .iter()
        .map(|post| {
            format!(
                "{} | {} | {} | {} | {}",
                post.id,
                post.platform,
                post.state,
                format_ms(post.target_at),
                truncate_content(&post.content.text, 40)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn status_text(status: &QuotaStatus, now: i64) -> String {
    let ends = if status.cycle_end > now {
        // Minute precision is plenty for a human reading this
        let left = Duration::from_secs(((status.cycle_end - now) / 60_000 * 60) as u64);
        format!("ends in {}", humantime::format_duration(left))
    } else {
        "ended".to_string()
    };

    format!(
        "subscriber: {}\n\
         cycle:      {} ({} to {}, {})\n\
         allocated:  {}\n\
         reserved:   {}\n\
         committed:  {}\n\
         released:   {}\n\
         remaining:  {}",
        status.subscriber_id,
        status.cycle_id,
        format_ms(status.cycle_start),
        format_ms(status.cycle_end),
        ends,
        status.allocated,
        status.reserved,
        status.committed,
        status.released,
        status.remaining
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_truncate_content() {
        assert_eq!(truncate_content("short", 10), "short");
        assert_eq!(truncate_content("exactly ten", 11), "exactly ten");
        assert_eq!(truncate_content("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("1970-01-01T00:00:01Z").unwrap(), 1000);
        assert_eq!(parse_time("2026-01-01T02:00:00+02:00").unwrap(), 1_767_225_600_000);

        let err = parse_time("tomorrow").unwrap_err();
        assert_eq!(exit_code(&err), 3);
    }

    #[test]
    fn test_validate_post_id() {
        assert!(validate_post_id("6f1c1e1a-3b0a-4f57-9a8e-2f2c3b8d9e10").is_ok());
        let err = validate_post_id("not-a-uuid").unwrap_err();
        assert_eq!(exit_code(&err), 3);
    }

    #[test]
    fn test_status_text() {
        let status = QuotaStatus {
            subscriber_id: "sub-1".to_string(),
            cycle_id: 2,
            cycle_start: 0,
            cycle_end: 2 * 3_600_000,
            allocated: 30,
            reserved: 2,
            committed: 5,
            released: 1,
            remaining: 23,
        };

        let text = status_text(&status, 3_600_000);
        assert!(text.contains("subscriber: sub-1"));
        assert!(text.contains("ends in 1h"));
        assert!(text.contains("remaining:  23"));

        assert!(status_text(&status, 3 * 3_600_000).contains("ended"));
    }

    #[test]
    fn test_draft_time_flags_conflict() {
        let result = Cli::try_parse_from([
            "autopost-queue",
            "draft",
            "sub-1",
            "x",
            "hello",
            "--at",
            "2026-01-01T00:00:00Z",
            "--in",
            "2h",
        ]);
        assert!(result.is_err());
    }
}
