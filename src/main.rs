//! TraderEdge risk service
//!
//! Guards subscriber accounts against lot-size spikes and keeps the
//! unrealized P&L of open signal allocations in sync with live prices.

mod config;
mod db;
mod models;
mod pnl;
mod prices;
mod risk;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::{AppConfig, LotSizeOverrides, DEFAULT_BIND_ADDR, DEFAULT_DATABASE_URL};
use crate::db::Database;
use crate::models::{Account, Direction, Signal, TradeAllocation};
use crate::pnl::{FlatPipValue, PnlSynchronizer, SyncScope};
use crate::prices::{HttpPriceSource, PriceSource, StaticPriceSource};
use crate::risk::{ConsistencyOutcome, LotSizeGuard, LotSizeRequest};
use crate::server::AppState;

/// TraderEdge risk service CLI.
#[derive(Parser)]
#[command(name = "traderedge-risk")]
#[command(about = "Lot-size consistency checks and live P&L sync for signal allocations", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Live price endpoint base URL
    #[arg(long, env = "PRICE_API_URL", global = true)]
    price_api_url: Option<String>,

    /// Allocations forming the lot-size baseline
    #[arg(long, env = "LOT_SIZE_HISTORY_WINDOW", global = true)]
    history_window: Option<u32>,

    /// Allocations required before spikes are evaluated
    #[arg(long, env = "LOT_SIZE_MIN_HISTORY", global = true)]
    min_history: Option<u32>,

    /// Spike threshold as a multiple of the average lot size
    #[arg(long, env = "LOT_SIZE_SPIKE_MULTIPLIER", global = true)]
    spike_multiplier: Option<Decimal>,

    /// Address the HTTP server binds to
    #[arg(long, env = "BIND_ADDR", default_value = DEFAULT_BIND_ADDR, global = true)]
    bind: SocketAddr,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the risk functions over HTTP
    Serve,

    /// Run a lot-size consistency check
    Check {
        #[arg(long)]
        account: String,

        #[arg(long)]
        user: String,

        /// Requested lot size
        #[arg(long)]
        lot: Decimal,

        /// Block the order instead of warning when it is a spike
        #[arg(long)]
        hard_block: bool,
    },

    /// Recalculate unrealized P&L of open allocations
    Sync {
        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        account: Option<String>,

        /// Manual price, SYMBOL=PRICE (repeatable). Overrides the price API.
        #[arg(long = "price")]
        prices: Vec<String>,

        /// Keep syncing until Ctrl+C
        #[arg(long)]
        watch: bool,

        /// Seconds between passes with --watch
        #[arg(short, long, default_value = "60")]
        interval: u64,
    },

    /// Manage trading accounts
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },

    /// Manage trading signals
    Signal {
        #[command(subcommand)]
        command: SignalCommands,
    },

    /// Allocate a signal to an account
    Allocate {
        #[arg(long)]
        account: String,

        #[arg(long)]
        user: String,

        #[arg(long)]
        signal: String,

        #[arg(long)]
        lot: Decimal,

        /// Entry price (defaults to the signal's entry)
        #[arg(long)]
        entry: Option<Decimal>,

        /// Run the consistency check first
        #[arg(long)]
        check: bool,

        /// With --check, refuse the allocation when it is a spike
        #[arg(long, requires = "check")]
        hard_block: bool,
    },

    /// Close an open allocation at an exit price
    Close {
        allocation: String,

        #[arg(long)]
        price: Decimal,
    },

    /// Cancel an open allocation
    Cancel { allocation: String },

    /// Show recent lot-size alerts for an account
    Alerts {
        account: String,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show accounts and open allocations
    Status {
        #[arg(long)]
        user: Option<String>,
    },

    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Register an account
    Add {
        #[arg(long)]
        user: String,

        #[arg(long, default_value = "")]
        name: String,

        /// Starting balance in USD
        #[arg(long)]
        balance: Decimal,

        /// Account id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// List accounts
    List {
        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(Subcommand)]
enum SignalCommands {
    /// Publish a signal
    Add {
        symbol: String,

        /// BUY or SELL
        direction: String,

        #[arg(long)]
        entry: Decimal,

        #[arg(long)]
        stop_loss: Decimal,

        #[arg(long)]
        take_profit: Decimal,
    },

    /// Show a signal
    Show { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let overrides = LotSizeOverrides {
        history_window: cli.history_window,
        min_history: cli.min_history,
        spike_multiplier: cli.spike_multiplier,
    };
    let config = AppConfig {
        database_url: cli.database.clone(),
        price_api_url: cli.price_api_url.clone(),
        bind_addr: cli.bind,
        lot_size: overrides.resolve()?,
        pip_value: FlatPipValue::default(),
    };

    let db = Database::new(&config.database_url).await?;

    match cli.command {
        Commands::Serve => {
            let prices: Arc<dyn PriceSource> = match &config.price_api_url {
                Some(url) => Arc::new(HttpPriceSource::new(url)?),
                None => {
                    warn!("PRICE_API_URL not set, P&L sync will skip every allocation");
                    Arc::new(StaticPriceSource::default())
                }
            };

            let state = AppState::new(
                LotSizeGuard::new(db.clone(), config.lot_size.clone()),
                PnlSynchronizer::new(db, prices, config.pip_value.clone()),
            );

            println!("\n=== TraderEdge Risk Service ===");
            println!("Listening on: http://{}", config.bind_addr);
            println!("\nPress Ctrl+C to stop.\n");

            server::serve(config.bind_addr, state).await?;
        }

        Commands::Check {
            account,
            user,
            lot,
            hard_block,
        } => {
            let request = LotSizeRequest::new(Some(account), Some(user), Some(lot), Some(hard_block))?;
            let guard = LotSizeGuard::new(db, config.lot_size.clone());
            let outcome = guard.check(&request).await?;
            print_outcome(&outcome);
        }

        Commands::Sync {
            user,
            account,
            prices,
            watch,
            interval,
        } => {
            let source: Arc<dyn PriceSource> = if !prices.is_empty() {
                Arc::new(StaticPriceSource::from_pairs(&prices)?)
            } else {
                let url = config
                    .price_api_url
                    .as_deref()
                    .context("No prices given: pass --price SYMBOL=PRICE or set PRICE_API_URL")?;
                Arc::new(HttpPriceSource::new(url)?)
            };

            let synchronizer = PnlSynchronizer::new(db, source, config.pip_value.clone());
            let scope = SyncScope {
                user_id: user,
                account_id: account,
            };

            if !watch {
                let report = synchronizer.sync(&scope).await?;
                print_sync_report(&report);
                return Ok(());
            }

            info!(interval = interval, "Starting P&L sync loop");
            println!("Syncing every {}s. Press Ctrl+C to stop.\n", interval);

            let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!("\nStopping P&L sync...");
                        break;
                    }
                    _ = ticker.tick() => {
                        match synchronizer.sync(&scope).await {
                            Ok(report) => println!(
                                "[{}] Updated: {} | Skipped: {}",
                                chrono::Local::now().format("%H:%M:%S"),
                                report.updated,
                                report.skipped
                            ),
                            Err(e) => warn!(error = %e, "Sync pass failed"),
                        }
                    }
                }
            }
        }

        Commands::Account { command } => match command {
            AccountCommands::Add {
                user,
                name,
                balance,
                id,
            } => {
                let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let account = Account::new(&id, &user, &name, balance);
                db.create_account(&account).await?;
                info!(account_id = %account.id, user_id = %user, "Account created");
                println!("Created account: {}", account.id);
            }

            AccountCommands::List { user } => {
                let accounts = db.list_accounts(user.as_deref()).await?;
                if accounts.is_empty() {
                    println!("No accounts. Use 'traderedge-risk account add' to create one.");
                    return Ok(());
                }
                print_accounts(&accounts);
            }
        },

        Commands::Signal { command } => match command {
            SignalCommands::Add {
                symbol,
                direction,
                entry,
                stop_loss,
                take_profit,
            } => {
                let direction: Direction = direction.parse()?;
                let signal = Signal::new(&symbol, direction, entry, stop_loss, take_profit);
                db.create_signal(&signal).await?;
                info!(signal_id = %signal.id, symbol = %signal.symbol, "Signal published");
                println!("Created signal: {}", signal.id);
            }

            SignalCommands::Show { id } => {
                let signal = db
                    .get_signal(&id)
                    .await?
                    .with_context(|| format!("Signal {} not found", id))?;

                println!("\n=== Signal: {} ===", signal.id);
                println!("Symbol:       {}", signal.symbol);
                println!("Direction:    {}", signal.direction);
                println!("Entry:        {}", signal.entry_price);
                println!("Stop Loss:    {}", signal.stop_loss);
                println!("Take Profit:  {}", signal.take_profit);
                println!("Published:    {}", signal.created_at);
            }
        },

        Commands::Allocate {
            account,
            user,
            signal,
            lot,
            entry,
            check,
            hard_block,
        } => {
            let signal = db
                .get_signal(&signal)
                .await?
                .with_context(|| format!("Signal {} not found", signal))?;

            if check {
                let request = LotSizeRequest::new(
                    Some(account.clone()),
                    Some(user.clone()),
                    Some(lot),
                    Some(hard_block),
                )?;
                let guard = LotSizeGuard::new(db.clone(), config.lot_size.clone());
                let outcome = guard.check(&request).await?;
                print_outcome(&outcome);

                if !outcome.allowed() {
                    println!("\nAllocation not created.");
                    return Ok(());
                }
            }

            let allocation = TradeAllocation::new(
                &user,
                &account,
                &signal.id,
                lot,
                entry.unwrap_or(signal.entry_price),
            )?;
            db.create_allocation(&allocation).await?;

            info!(
                allocation_id = %allocation.id,
                account_id = %account,
                lot_size = %lot,
                "Allocation created"
            );
            println!(
                "Allocated {} lots of {} {} to {}: {}",
                lot, signal.direction, signal.symbol, account, allocation.id
            );
        }

        Commands::Close { allocation, price } => {
            let synchronizer = PnlSynchronizer::new(
                db,
                Arc::new(StaticPriceSource::default()),
                config.pip_value.clone(),
            );
            let closed = synchronizer.close(&allocation, price).await?;
            println!(
                "Closed {} at {} (realized P&L: ${:.2})",
                closed.id,
                price,
                closed.realized_pnl.unwrap_or_default()
            );
        }

        Commands::Cancel { allocation } => {
            let synchronizer = PnlSynchronizer::new(
                db,
                Arc::new(StaticPriceSource::default()),
                config.pip_value.clone(),
            );
            let cancelled = synchronizer.cancel(&allocation).await?;
            println!("Cancelled {}", cancelled.id);
        }

        Commands::Alerts { account, limit } => {
            let alerts = db.recent_alerts(&account, limit).await?;
            if alerts.is_empty() {
                println!("No lot-size alerts for {}.", account);
                return Ok(());
            }

            println!(
                "\n{:<20} {:<8} {:>10} {:>10} {:>8}",
                "TIME", "SEVERITY", "REQUESTED", "AVERAGE", "LIMIT"
            );
            println!("{}", "-".repeat(60));
            for alert in alerts {
                println!(
                    "{:<20} {:<8} {:>10} {:>10} {:>7}%",
                    alert.created_at.format("%Y-%m-%d %H:%M:%S"),
                    alert.severity,
                    alert.observed_value,
                    alert.expected_value,
                    alert.threshold_pct.normalize()
                );
            }
        }

        Commands::Status { user } => {
            let accounts = db.list_accounts(user.as_deref()).await?;
            let positions = db.get_open_allocations(user.as_deref(), None).await?;

            println!("\n=== Accounts ({}) ===", accounts.len());
            print_accounts(&accounts);

            println!("\n=== Open Allocations ({}) ===", positions.len());
            for p in &positions {
                let a = &p.allocation;
                let pnl_sign = if a.unrealized_pnl >= Decimal::ZERO { "+" } else { "" };
                println!(
                    "  {} {} {} x{} @ {} -> {} ({:.1} pips, {}${:.2}, {:.0}%)",
                    truncate(&a.id, 12),
                    p.signal.direction,
                    p.signal.symbol,
                    a.lot_size,
                    a.entry_price,
                    a.current_price
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    a.pips_moved,
                    pnl_sign,
                    a.unrealized_pnl,
                    a.progress_pct
                );
            }
        }

        Commands::Config => {
            println!("{}", config);
        }
    }

    Ok(())
}

fn print_outcome(outcome: &ConsistencyOutcome) {
    println!("\n=== Lot Size Consistency ===");
    println!("Status:       {}", outcome.status());
    println!("Requested:    {}", outcome.requested_lot_size());
    println!("Allowed:      {}", if outcome.allowed() { "Yes" } else { "No" });
    println!("Spike:        {}", if outcome.is_spike() { "Yes" } else { "No" });

    if let Some(check) = outcome.check() {
        println!("Average:      {}", check.avg_lot_size);
        println!("Max Allowed:  {}", check.max_allowed_lot_size);
        println!("Of Average:   {}%", check.spike_percentage);
        println!("Analyzed:     {} allocations", check.trades_analyzed);
    }
    if let Some(message) = outcome.message() {
        println!("\n{}", message);
    }
    if let Some(recommendation) = outcome.check().and_then(|c| c.recommendation.as_deref()) {
        println!("{}", recommendation);
    }
}

fn print_sync_report(report: &pnl::SyncReport) {
    println!("\nUpdated: {} | Skipped: {}", report.updated, report.skipped);
    if report.allocations.is_empty() {
        return;
    }

    println!(
        "\n{:<38} {:>12} {:>8} {:>12} {:>8}",
        "ALLOCATION", "PRICE", "PIPS", "P&L", "PROG%"
    );
    println!("{}", "-".repeat(82));
    for u in &report.allocations {
        println!(
            "{:<38} {:>12} {:>8.1} {:>12.2} {:>8.2}",
            u.id, u.current_price, u.pips_moved, u.unrealized_pnl, u.progress_pct
        );
    }
}

fn print_accounts(accounts: &[Account]) {
    println!(
        "\n{:<38} {:<16} {:>12} {:>10} {:>12} {:>12}",
        "ACCOUNT", "NAME", "BALANCE", "AVG LOT", "UNREALIZED", "EQUITY"
    );
    println!("{}", "-".repeat(104));
    for a in accounts {
        println!(
            "{:<38} {:<16} {:>12.2} {:>10} {:>12.2} {:>12.2}",
            a.id,
            truncate(&a.name, 14),
            a.starting_balance,
            a.avg_lot_size
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
            a.unrealized_pnl,
            a.theoretical_equity
        );
    }
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
