//! Credit ledger admin tool.
//!
//! Operator commands against the PostgreSQL ledger: migrations, balance and
//! history lookups, reversals, rounding changes, and estimates. Output is JSON.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use credit_ledger_core::{DateRange, DeductionId, PricingTable, TokenCounts, UserId};
use credit_ledger_engine::{CreditLedger, LedgerConfig};
use credit_ledger_store::{LedgerStore, PgLedgerStore};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "credit-ledger-admin")]
#[command(about = "Credit ledger administration", long_about = None)]
struct Cli {
    /// PostgreSQL connection string (overrides `DATABASE_URL`)
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Show a user's balance
    Balance {
        /// User ID
        #[arg(long)]
        user: UserId,
    },

    /// List a user's deductions, newest first
    History {
        /// User ID
        #[arg(long)]
        user: UserId,
        /// Inclusive lower bound (RFC 3339)
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Exclusive upper bound (RFC 3339)
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        /// Maximum entries
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one deduction with its usage record
    Show {
        /// Deduction ID
        deduction: DeductionId,
    },

    /// Reverse a deduction
    Reverse {
        /// Deduction ID
        #[arg(long)]
        deduction: DeductionId,
        /// Why the deduction is being reversed
        #[arg(long)]
        reason: String,
        /// Acting administrator
        #[arg(long)]
        admin: UserId,
    },

    /// Daily usage rollups for a user
    Usage {
        /// User ID
        #[arg(long)]
        user: UserId,
        /// First day (inclusive)
        #[arg(long)]
        from: NaiveDate,
        /// Last day (inclusive)
        #[arg(long)]
        to: NaiveDate,
    },

    /// Inspect or change the rounding increment
    Rounding {
        #[command(subcommand)]
        command: RoundingCommand,
    },

    /// Estimate the credits a request would cost
    Estimate {
        /// User ID
        #[arg(long)]
        user: UserId,
        /// Model ID
        #[arg(long)]
        model: String,
        /// Provider name
        #[arg(long)]
        provider: String,
        /// Estimated input tokens
        #[arg(long)]
        input: u64,
        /// Estimated output tokens
        #[arg(long)]
        output: u64,
    },
}

#[derive(Subcommand)]
enum RoundingCommand {
    /// Print the persisted increment
    Show,
    /// Set the increment (0.01, 0.1 or 1)
    Set {
        /// New increment
        increment: Decimal,
        /// Acting administrator
        #[arg(long)]
        admin: Option<UserId>,
    },
}

#[derive(Serialize)]
struct BalanceView {
    user_id: UserId,
    balance: Decimal,
}

#[derive(Serialize)]
struct RoundingView {
    increment: Decimal,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,credit_ledger=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = LedgerConfig::from_env();
    if cli.database_url.is_some() {
        config.database_url = cli.database_url;
    }

    let database_url = config
        .database_url
        .clone()
        .ok_or("DATABASE_URL is not set")?;
    let store = PgLedgerStore::connect(&database_url, config.max_connections).await?;

    if matches!(cli.command, Commands::Migrate) {
        store.migrate().await?;
        return Ok(());
    }

    let store: Arc<dyn LedgerStore> = Arc::new(store);
    let ledger = CreditLedger::new(
        Arc::clone(&store),
        Arc::new(PricingTable::with_defaults()),
        config,
    )
    .await?;

    match cli.command {
        Commands::Migrate => {}
        Commands::Balance { user } => {
            let balance = ledger.get_current_balance(&user).await?;
            print_json(&BalanceView {
                user_id: user,
                balance,
            })?;
        }
        Commands::History {
            user,
            from,
            to,
            limit,
        } => {
            let range = match (from, to) {
                (Some(start), Some(end)) => DateRange::between(start, end)?,
                (start, end) => DateRange { start, end },
            };
            let entries = ledger.get_deduction_history(&user, &range, limit).await?;
            print_json(&entries)?;
        }
        Commands::Show { deduction } => {
            let entry = ledger.get_deduction(&deduction).await?;
            let usage = ledger.get_usage_for(&deduction).await?;
            print_json(&serde_json::json!({ "deduction": entry, "usage": usage }))?;
        }
        Commands::Reverse {
            deduction,
            reason,
            admin,
        } => {
            let receipt = ledger.reverse(&deduction, &reason, admin).await?;
            print_json(&receipt)?;
        }
        Commands::Usage { user, from, to } => {
            let rollups = ledger.get_daily_usage(&user, from, to).await?;
            print_json(&rollups)?;
        }
        Commands::Rounding { command } => match command {
            RoundingCommand::Show => {
                let persisted = store.load_rounding_increment().await?;
                let increment = persisted.unwrap_or_else(|| ledger.current_increment());
                print_json(&RoundingView {
                    increment: increment.as_decimal(),
                })?;
            }
            RoundingCommand::Set { increment, admin } => {
                let applied = ledger.update_rounding_increment(increment, admin).await?;
                print_json(&RoundingView {
                    increment: applied.as_decimal(),
                })?;
            }
        },
        Commands::Estimate {
            user,
            model,
            provider,
            input,
            output,
        } => {
            let estimate = ledger
                .estimate_detailed(&user, &model, &provider, TokenCounts::new(input, output))
                .await?;
            print_json(&estimate)?;
        }
    }

    Ok(())
}
