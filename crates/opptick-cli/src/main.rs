use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use opptick_core::config::{self, OppTickConfig};
use opptick_core::dispatch::DispatchWorker;
use opptick_core::intake::IntakeEngine;
use opptick_core::locks::KeyedLocks;
use opptick_core::model::*;
use opptick_core::notify::{InboundMessage, LogNotifier};
use opptick_core::storage::{create_backend, SqliteStorage, StorageBackend};
use opptick_core::summary::{format_countdown, format_deadline, DailySummaryJob};
use opptick_core::sweep::MissedDeadlineSweeper;
use opptick_core::tracker::Tracker;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Conversation id used by `opptick chat`.
const CLI_CONVERSATION: &str = "cli";
const SUMMARY_POLL_SECS: u64 = 60;
const SESSION_PURGE_SECS: u64 = 300;

#[derive(Parser)]
#[command(name = "opptick", about = "OppTick: deadline tracking with reminders", version)]
struct Cli {
    /// Act as this user (default: config identity, then $USER)
    #[arg(long, global = true)]
    user: Option<String>,
    /// SQLite database path (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture opportunities interactively (one message per line)
    Chat,
    /// List active opportunities
    List {
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },
    /// List done and archived opportunities
    Archived {
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Show an opportunity and its reminders
    Show {
        /// Opportunity ID (full UUID or prefix)
        id: String,
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete an opportunity and its reminders
    Delete {
        /// Opportunity ID (full UUID or prefix)
        id: String,
    },
    /// Archive an opportunity (stops its reminders)
    Archive {
        /// Opportunity ID (full UUID or prefix)
        id: String,
    },
    /// Mark an opportunity done (stops its reminders)
    Done {
        /// Opportunity ID (full UUID or prefix)
        id: String,
    },
    /// Change the deadline and reschedule reminders
    Edit {
        /// Opportunity ID (full UUID or prefix)
        id: String,
        /// New deadline, e.g. "2026-03-15", "March 15", "in 2 weeks"
        #[arg(required = true, num_args = 1..)]
        deadline: Vec<String>,
    },
    /// Show active opportunities grouped by deadline
    Summary {
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Show or change daily summary settings
    Settings {
        /// Enable the daily summary
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        /// Disable the daily summary
        #[arg(long)]
        disable: bool,
        /// Daily summary time (HH:MM, UTC)
        #[arg(long)]
        time: Option<String>,
    },
    /// Run the reminder daemon until Ctrl-C
    Run,
    /// Run one dispatch tick now
    Tick {
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Show system status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut config = OppTickConfig::load(Some(&std::env::current_dir()?))
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "config not loaded, using defaults");
            OppTickConfig::default_config()
        });
    if let Some(ref db) = cli.db {
        config.storage.path = Some(db.display().to_string());
    }
    let owner_id = config::resolve_owner_id(cli.user.as_deref(), &config.identity);

    run(cli.command, &config, &owner_id).await
}

async fn run(command: Command, config: &OppTickConfig, owner_id: &str) -> Result<()> {
    let storage = make_storage(config)?;
    let locks = Arc::new(KeyedLocks::new());
    let tracker = Tracker::new(Arc::clone(&storage), Arc::clone(&locks), config);

    match command {
        Command::Chat => cmd_chat(&storage, &tracker, config, owner_id).await,
        Command::List { json } => {
            let items = tracker.list_active(owner_id).await?;
            print_list(&items, json, "No active opportunities.")
        }
        Command::Archived { json } => {
            let items = tracker.list_archived(owner_id).await?;
            print_list(&items, json, "No archived opportunities.")
        }
        Command::Show { id, json } => cmd_show(&tracker, owner_id, &id, json).await,
        Command::Delete { id } => {
            let opp = tracker.delete(owner_id, &id).await?;
            println!("{} {}", "Deleted".red(), opp.title);
            Ok(())
        }
        Command::Archive { id } => {
            let opp = tracker.archive(owner_id, &id).await?;
            println!("{} {}", "Archived".yellow(), opp.title);
            Ok(())
        }
        Command::Done { id } => {
            let opp = tracker.mark_done(owner_id, &id).await?;
            println!("{} {}", "Done".green(), opp.title);
            Ok(())
        }
        Command::Edit { id, deadline } => {
            let text = deadline.join(" ");
            let (opp, reminders) = tracker
                .edit_deadline(owner_id, &id, &text, Utc::now())
                .await
                .context("failed to change deadline")?;
            println!(
                "{} {} -> {}",
                "Rescheduled".green(),
                opp.title,
                format_deadline(opp.deadline).cyan()
            );
            print_reminders(&reminders);
            Ok(())
        }
        Command::Summary { json } => {
            let now = Utc::now();
            let summary = tracker.summary(owner_id, now).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary.render(now));
            }
            Ok(())
        }
        Command::Settings {
            enable,
            disable,
            time,
        } => {
            let enabled = match (enable, disable) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let settings = if enabled.is_some() || time.is_some() {
                tracker
                    .update_settings(owner_id, enabled, time.as_deref())
                    .await?
            } else {
                tracker.settings(owner_id).await?
            };
            print_settings(&settings);
            Ok(())
        }
        Command::Run => cmd_run(storage, locks, config).await,
        Command::Tick { json } => {
            let worker = DispatchWorker::new(
                Arc::clone(&storage),
                Arc::new(LogNotifier),
                locks,
                &config.reminders,
            );
            let report = worker.tick(Utc::now()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} delivered, {} skipped, {} retrying, {} failed",
                    report.delivered, report.skipped, report.retrying, report.failed
                );
            }
            Ok(())
        }
        Command::Status => cmd_status(&storage, owner_id).await,
    }
}

fn make_storage(config: &OppTickConfig) -> Result<Arc<SqliteStorage>> {
    create_backend(config)
        .map(Arc::new)
        .context("failed to open storage")
}

// ---------------------------------------------------------------------------
// chat
// ---------------------------------------------------------------------------

async fn cmd_chat(
    storage: &Arc<SqliteStorage>,
    tracker: &Tracker<SqliteStorage>,
    config: &OppTickConfig,
    owner_id: &str,
) -> Result<()> {
    let engine = IntakeEngine::new(Arc::clone(storage), config);
    println!(
        "{}",
        "Paste or type an opportunity, then an empty line. /cancel aborts, Ctrl-D exits."
            .dimmed()
    );

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    // A new opportunity may span several pasted lines; dialog answers are one line.
    let mut expect_forward = true;
    loop {
        print!("{} ", ">".cyan());
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else { break };
        let mut line = line.context("failed to read stdin")?;

        // Action values from notifications can be typed back directly.
        if is_action(&line) {
            match tracker.handle_action(owner_id, line.trim()).await {
                Ok(outcome) => println!("{}", outcome.message().green()),
                Err(e) => println!("{}", e.to_string().red()),
            }
            continue;
        }
        if expect_forward && !line.trim().is_empty() && !line.trim_start().starts_with('/') {
            line = read_block(line, &mut lines)?;
        }

        let message = InboundMessage::new(owner_id, CLI_CONVERSATION, line, Utc::now());
        let reply = engine.handle(&message).await?;
        expect_forward = matches!(reply.state, IntakeState::AwaitingForward | IntakeState::Saved);
        println!("{}", reply.text);
        if !reply.actions.is_empty() {
            let choices: Vec<String> = reply
                .actions
                .iter()
                .map(|a| format!("[{}] {}", a.value, a.label))
                .collect();
            println!("{}", choices.join("  ").dimmed());
        }
        println!();
    }
    Ok(())
}

/// Join `first` with the lines after it, up to a blank line or end of input.
fn read_block<I>(first: String, lines: &mut I) -> Result<String>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    let mut block = first;
    for line in lines {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            break;
        }
        block.push('\n');
        block.push_str(&line);
    }
    Ok(block)
}

fn is_action(line: &str) -> bool {
    let line = line.trim();
    ["done:", "archive:", "keep:"]
        .iter()
        .any(|p| line.starts_with(p))
}

// ---------------------------------------------------------------------------
// list / show
// ---------------------------------------------------------------------------

fn print_list(items: &[Opportunity], json: bool, empty: &str) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("{}", empty.dimmed());
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{:<10} {:<8} {:<12} {:<18} {}",
        "ID".dimmed(),
        "Priority".dimmed(),
        "Type".dimmed(),
        "Time left".dimmed(),
        "Title".dimmed()
    );
    for opp in items {
        println!(
            "{:<10} {:<8} {:<12} {:<18} {}",
            opp.short_id().cyan(),
            priority_label(opp.priority),
            opp.category.to_string().magenta(),
            countdown_label(opp, now),
            opp.title
        );
    }
    Ok(())
}

fn priority_label(priority: Priority) -> String {
    let text = format!("{:<8}", priority.to_string());
    match priority {
        Priority::High => text.red().to_string(),
        Priority::Medium => text.yellow().to_string(),
        Priority::Low => text.dimmed().to_string(),
    }
}

fn countdown_label(opp: &Opportunity, now: DateTime<Utc>) -> String {
    let text = format!("{:<18}", format_countdown(opp.deadline, now));
    if !opp.is_active() {
        text.dimmed().to_string()
    } else if opp.deadline < now {
        text.red().to_string()
    } else {
        text
    }
}

async fn cmd_show(tracker: &Tracker<SqliteStorage>, owner_id: &str, id: &str, json: bool) -> Result<()> {
    let opp = tracker.get(owner_id, id).await?;
    let reminders = tracker.reminders(owner_id, &opp.id.to_string()).await?;

    if json {
        let value = serde_json::json!({
            "opportunity": opp,
            "reminders": reminders,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let now = Utc::now();
    println!("{}", opp.title.bold());
    println!(
        "{} {} {}",
        opp.category.to_string().magenta(),
        priority_label(opp.priority),
        opp.status.to_string().dimmed()
    );
    println!();
    println!("{}", "--- Details ---".dimmed());
    println!("  {}        {}", "ID:".dimmed(), opp.id.to_string().cyan());
    println!(
        "  {}  {} ({})",
        "Deadline:".dimmed(),
        format_deadline(opp.deadline),
        format_countdown(opp.deadline, now)
    );
    println!(
        "  {}   {}",
        "Created:".dimmed(),
        opp.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(ref source) = opp.source_ref {
        println!("  {}    {}", "Source:".dimmed(), source);
    }
    println!();
    println!("{}", "--- Reminders ---".dimmed());
    for r in &reminders {
        let state = if r.sent {
            "sent".green().to_string()
        } else if r.cancelled {
            "cancelled".dimmed().to_string()
        } else if r.failed {
            format!("failed after {} attempts", r.attempts).red().to_string()
        } else {
            "pending".yellow().to_string()
        };
        println!("  {:<5} {}  {}", r.kind.as_str(), format_deadline(r.fire_at), state);
    }
    if reminders.is_empty() {
        println!("  {}", "none".dimmed());
    }
    Ok(())
}

fn print_reminders(reminders: &[Reminder]) {
    if reminders.is_empty() {
        println!("  {}", "No reminders left before the deadline.".dimmed());
    }
    for r in reminders {
        println!("  {:<16} {}", r.kind.describe(), format_deadline(r.fire_at).dimmed());
    }
}

fn print_settings(settings: &UserSettings) {
    let state = if settings.daily_summary_enabled {
        "enabled".green().to_string()
    } else {
        "disabled".red().to_string()
    };
    println!("  {} {}", "Daily summary:".dimmed(), state);
    println!(
        "  {}          {} UTC",
        "Time:".dimmed(),
        settings.daily_summary_time.format("%H:%M")
    );
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(storage: Arc<SqliteStorage>, locks: Arc<KeyedLocks<uuid::Uuid>>, config: &OppTickConfig) -> Result<()> {
    let notifier = Arc::new(LogNotifier);
    let shutdown = CancellationToken::new();

    let worker = DispatchWorker::new(
        Arc::clone(&storage),
        Arc::clone(&notifier),
        Arc::clone(&locks),
        &config.reminders,
    );
    let sweeper = MissedDeadlineSweeper::new(
        Arc::clone(&storage),
        Arc::clone(&notifier),
        locks,
        &config.sweeper,
    )
    .with_delivery_timeout(config.reminders.delivery_timeout());
    let daily = DailySummaryJob::new(
        Arc::clone(&storage),
        Arc::clone(&notifier),
        StdDuration::from_secs(SUMMARY_POLL_SECS),
    )
    .with_delivery_timeout(config.reminders.delivery_timeout());
    let engine = IntakeEngine::new(Arc::clone(&storage), config);

    let mut tasks = Vec::new();
    let token = shutdown.clone();
    tasks.push(tokio::spawn(async move { worker.run(token).await }));
    let token = shutdown.clone();
    tasks.push(tokio::spawn(async move { sweeper.run(token).await }));
    let token = shutdown.clone();
    tasks.push(tokio::spawn(async move { daily.run(token).await }));
    let token = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(StdDuration::from_secs(SESSION_PURGE_SECS));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = engine.purge_expired(Utc::now()).await {
                tracing::warn!(error = %e, "session purge failed");
            }
        }
    }));

    tracing::info!(
        tick_secs = config.reminders.tick_secs,
        db = %storage.path().display(),
        "reminder daemon started"
    );
    println!("{}", "OppTick daemon running. Ctrl-C to stop.".green());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    println!("{}", "Shutting down...".dimmed());
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

async fn cmd_status(storage: &SqliteStorage, owner_id: &str) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    println!("{}", format!("OppTick Status v{version}").bold());
    println!("  {}    {}", "Version:".dimmed(), version);
    println!("  {}       {}", "User:".dimmed(), owner_id);
    println!("  {}   {}", "Database:".dimmed(), storage.path().display());

    let (schema_ver, writer_ver) = storage.schema_info()?;
    let writer = writer_ver
        .map(|v| format!(", last written by {v}"))
        .unwrap_or_default();
    println!("  {}     schema v{schema_ver}{writer}", "Schema:".dimmed());

    match storage.stats(Some(owner_id)).await {
        Ok(stats) => {
            println!(
                "  {}   {} ({} active)",
                "Tracked:".dimmed(),
                stats.opportunities,
                stats.active
            );
            println!("  {}   {}", "Pending:".dimmed(), stats.pending_reminders);
            println!("  {}  {}", "Sessions:".dimmed(), stats.sessions);
        }
        Err(e) => println!("  {}   {}", "Tracked:".dimmed(), format!("unknown ({e})").yellow()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(lines: &[&str]) -> impl Iterator<Item = std::io::Result<String>> {
        lines
            .iter()
            .map(|l| Ok(l.to_string()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn read_block_stops_at_blank_line() {
        let mut rest = input(&["Acme Corp", "Deadline: 2026-04-01", "", "yes"]);
        let block = read_block("Research internship".into(), &mut rest).unwrap();
        assert_eq!(block, "Research internship\nAcme Corp\nDeadline: 2026-04-01");
        assert_eq!(rest.next().unwrap().unwrap(), "yes");
    }

    #[test]
    fn read_block_ends_at_eof() {
        let mut rest = input(&["second line"]);
        let block = read_block("first".into(), &mut rest).unwrap();
        assert_eq!(block, "first\nsecond line");
        assert!(rest.next().is_none());
    }

    #[test]
    fn action_values_are_recognized() {
        assert!(is_action(" done:0192abcd"));
        assert!(is_action("keep:0192abcd"));
        assert!(!is_action("Deadline: done soon"));
    }
}
