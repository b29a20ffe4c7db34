use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use perkwise_app::{Expiring, Settings, Tracker};
use perkwise_core::{BenefitSnapshot, BenefitStatus, Money, Stats, StoredTransaction};
use perkwise_import::{ImportOutcome, PreviewKind, PreviewRow};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "perkwise", version, about = "Track credit card benefit credits against your statements.")]
struct Cli {
    /// Config file (default: platform config directory)
    #[arg(long, global = true, env = "PERKWISE_CONFIG")]
    config: Option<PathBuf>,
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List benefits with their usage and status.
    Benefits {
        /// Only benefits of this card
        #[arg(long)]
        card: Option<String>,
        /// View a specific calendar year
        #[arg(long, value_parser = clap::value_parser!(i32).range(1900..=9999))]
        year: Option<i32>,
        /// Include ignored benefits
        #[arg(long)]
        all: bool,
    },
    /// Summary figures across visible benefits.
    Stats {
        /// Only benefits of this card
        #[arg(long)]
        card: Option<String>,
        #[arg(long, value_parser = clap::value_parser!(i32).range(1900..=9999))]
        year: Option<i32>,
    },
    /// Preview a statement CSV and, with --yes, record its credits.
    Import {
        /// Card the statement belongs to (e.g. amex-platinum)
        card: String,
        /// Path to the statement CSV
        file: PathBuf,
        /// Record the matched credits
        #[arg(long)]
        yes: bool,
    },
    /// Record a credit by hand.
    Record {
        benefit: String,
        /// Date of the credit: YYYY-MM-DD
        #[arg(long)]
        date: NaiveDate,
        /// Credit amount, e.g. 15 or 12.95
        #[arg(long)]
        amount: Money,
        #[arg(long, default_value = "Manual credit")]
        description: String,
        /// Attribute to this period id (e.g. q2, h1, m03)
        #[arg(long)]
        period: Option<String>,
    },
    /// Toggle enrollment for a benefit.
    Enroll { benefit: String },
    /// Hide a benefit from lists and totals.
    Ignore {
        benefit: String,
        /// Show it again
        #[arg(long)]
        undo: bool,
    },
    /// Toggle the activation acknowledgement for a benefit.
    Activate { benefit: String },
    /// Show or set the import note for a card.
    Note {
        card: String,
        /// New note; an empty string clears it
        text: Option<String>,
    },
    /// Pending benefits whose current window closes soon.
    Expiring {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Delete all recorded user state.
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    init_tracing(&settings);

    let now = Utc::now();
    let tracker = Tracker::open(&settings).context("Failed to open benefit tracker")?;
    let json = cli.json;

    match cli.command {
        Commands::Benefits { card, year, all } => {
            let snapshots = tracker.benefits(card.as_deref(), all, year, now)?;
            if json {
                print_json(&snapshots)?;
            } else {
                print_benefits(&snapshots);
            }
        }
        Commands::Stats { card, year } => {
            let stats = tracker.stats(card.as_deref(), year, now)?;
            if json {
                print_json(&stats)?;
            } else {
                print_stats(&stats);
            }
        }
        Commands::Import { card, file, yes } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            match tracker.preview_import(&text, &card)? {
                ImportOutcome::NoCredits {
                    transaction_count, ..
                } => {
                    println!("No benefit credits found in {transaction_count} transactions.");
                }
                ImportOutcome::Ready(import) => {
                    let preview = import.preview();
                    if json {
                        print_json(&preview)?;
                    } else {
                        print_preview(&preview);
                    }
                    if yes {
                        let summary = tracker.confirm_import(&import, now)?;
                        println!(
                            "Recorded {} new credits, saved {} statement rows.",
                            summary.credits_recorded, summary.rows_saved
                        );
                    } else {
                        println!(
                            "{} credits found, {} matched. Run again with --yes to record them.",
                            import.credit_count(),
                            import.result.total_matched()
                        );
                    }
                }
            }
        }
        Commands::Record {
            benefit,
            date,
            amount,
            description,
            period,
        } => {
            let date = date.and_time(NaiveTime::MIN).and_utc();
            let transaction = StoredTransaction::new(date, description, amount.abs());
            if tracker.record(&benefit, transaction, period.as_deref())? {
                println!("Recorded {} for {benefit}.", amount.abs());
            } else {
                println!("Already recorded.");
            }
        }
        Commands::Enroll { benefit } => {
            let enrolled = tracker.toggle_enrollment(&benefit)?;
            println!("{benefit}: {}", if enrolled { "enrolled" } else { "not enrolled" });
        }
        Commands::Ignore { benefit, undo } => {
            tracker.set_ignored(&benefit, !undo)?;
            println!("{benefit}: {}", if undo { "visible" } else { "ignored" });
        }
        Commands::Activate { benefit } => {
            let acknowledged = tracker.toggle_activation(&benefit, now)?;
            println!(
                "{benefit}: activation {}",
                if acknowledged { "acknowledged" } else { "cleared" }
            );
        }
        Commands::Note { card, text } => match text {
            Some(text) => tracker.set_note(&card, &text)?,
            None => match tracker.note(&card)? {
                Some(note) => println!("{note}"),
                None => println!("No note for {card}."),
            },
        },
        Commands::Expiring { days } => {
            let expiring = tracker.upcoming_expirations(days, now)?;
            if json {
                print_json(&expiring)?;
            } else {
                print_expiring(&expiring, days);
            }
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("This deletes all recorded usage; pass --yes to confirm.");
            }
            tracker.reset()?;
            println!("User state cleared.");
        }
    }
    Ok(())
}

/// `RUST_LOG` wins, then the configured filter, then `info`. Logs go to
/// stderr so JSON output stays clean.
fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(settings.log_filter.as_deref().unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn status_mark(status: BenefitStatus) -> &'static str {
    match status {
        BenefitStatus::Completed => "✓",
        BenefitStatus::Pending => "·",
        BenefitStatus::Missed => "✗",
    }
}

fn print_benefits(snapshots: &[BenefitSnapshot]) {
    let mut card = "";
    for s in snapshots {
        if s.card_id != card {
            card = &s.card_id;
            println!("\n{card}");
            println!("{}", "─".repeat(card.len()));
        }
        let mut flags = Vec::new();
        if s.enrollment_required && !s.enrolled {
            flags.push("not enrolled".to_string());
        }
        if s.ignored {
            flags.push("ignored".to_string());
        }
        if let Some(year) = s.claimed_elsewhere_year {
            flags.push(format!("claimed in {year}"));
        }
        if !s.unattributed.is_zero() {
            flags.push(format!("{} unattributed", s.unattributed));
        }
        println!(
            "  {:<36} {:>10} / {:<10} {:<9} {}",
            s.name,
            s.current_used.to_string(),
            s.credit_amount.to_string(),
            s.status.to_string(),
            flags.join(", ")
        );
        if s.has_periods() {
            let periods: Vec<String> = s
                .periods
                .iter()
                .map(|p| format!("{}{}", p.id, status_mark(p.status)))
                .collect();
            println!("      {}", periods.join(" "));
        }
    }
}

fn print_stats(stats: &Stats) {
    println!("Benefits:          {}", stats.total_benefits);
    println!("Used:              {} of {}", stats.used_value, stats.total_value);
    println!(
        "Periods this year: {} of {} completed",
        stats.ytd_completed_periods, stats.ytd_total_periods
    );
    println!("Current periods:   {} completed", stats.current_period_completed_count);
    println!("Pending:           {}", stats.pending_count);
    println!("Missed:            {}", stats.missed_count);
}

fn print_preview(rows: &[PreviewRow]) {
    for row in rows {
        let tag = match &row.kind {
            PreviewKind::Matched { benefit_name, .. } => format!("→ {benefit_name}"),
            PreviewKind::Credit => "credit (unmatched)".to_string(),
            PreviewKind::Transaction => String::new(),
        };
        println!(
            "{}  {:<40} {:>12}  {}",
            format_date(row.date),
            row.description,
            row.amount.to_string(),
            tag
        );
    }
}

fn print_expiring(expiring: &[Expiring], days: i64) {
    if expiring.is_empty() {
        println!("Nothing pending expires in the next {days} days.");
        return;
    }
    for e in expiring {
        println!(
            "{}  {:<36} {:>10} left  ({} days)",
            format_date(e.ends_at),
            e.snapshot.name,
            e.remaining.to_string(),
            e.days_remaining
        );
    }
}

fn format_date(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}
