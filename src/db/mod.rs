//! Database persistence for the risk core.
//!
//! Stores:
//! - Trading accounts and their derived aggregates (running lot size, synced P&L)
//! - Signals referenced by allocations
//! - Trade allocations and their live P&L figures
//! - The append-only consistency alert log
//!
//! Amounts are kept as REAL columns and converted to `Decimal` at this boundary.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{
    Account, AlertSeverity, AllocationStatus, AllocationWithSignal, ConsistencyAlert, Signal,
    TradeAllocation,
};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Stored account record.
#[derive(Debug, Clone, sqlx::FromRow)]
struct AccountRow {
    id: String,
    user_id: String,
    name: String,
    starting_balance: f64,
    avg_lot_size: Option<f64>,
    unrealized_pnl: f64,
    theoretical_equity: f64,
    last_synced_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

/// Stored allocation record.
#[derive(Debug, Clone, sqlx::FromRow)]
struct AllocationRow {
    id: String,
    user_id: String,
    account_id: String,
    signal_id: String,
    lot_size: f64,
    entry_price: f64,
    status: String,
    current_price: Option<f64>,
    unrealized_pnl: f64,
    pips_moved: f64,
    progress_pct: f64,
    realized_pnl: Option<f64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

/// Allocation joined with its signal's reference prices.
#[derive(Debug, Clone, sqlx::FromRow)]
struct AllocationSignalRow {
    #[sqlx(flatten)]
    allocation: AllocationRow,
    signal_symbol: String,
    signal_direction: String,
    signal_entry_price: f64,
    signal_stop_loss: f64,
    signal_take_profit: f64,
    signal_created_at: DateTime<Utc>,
}

/// Stored signal record.
#[derive(Debug, Clone, sqlx::FromRow)]
struct SignalRow {
    id: String,
    symbol: String,
    direction: String,
    entry_price: f64,
    stop_loss: f64,
    take_profit: f64,
    created_at: DateTime<Utc>,
}

/// Stored consistency alert record.
#[derive(Debug, Clone, sqlx::FromRow)]
struct AlertRow {
    id: String,
    user_id: String,
    account_id: String,
    alert_type: String,
    severity: String,
    observed_value: f64,
    expected_value: f64,
    threshold_pct: f64,
    was_blocked: bool,
    message: String,
    created_at: DateTime<Utc>,
}

/// Live P&L figures written back onto an open allocation.
#[derive(Debug, Clone)]
pub struct AllocationPnl {
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub pips_moved: Decimal,
    pub progress_pct: Decimal,
    pub updated_at: DateTime<Utc>,
}

const ALLOCATION_WITH_SIGNAL: &str = r#"
    SELECT a.*,
           s.symbol AS signal_symbol,
           s.direction AS signal_direction,
           s.entry_price AS signal_entry_price,
           s.stop_loss AS signal_stop_loss,
           s.take_profit AS signal_take_profit,
           s.created_at AS signal_created_at
    FROM trade_allocations a
    JOIN signals s ON s.id = a.signal_id
"#;

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or(Decimal::ZERO)
}

impl TryFrom<AllocationRow> for TradeAllocation {
    type Error = anyhow::Error;

    fn try_from(row: AllocationRow) -> Result<Self> {
        Ok(Self {
            status: row.status.parse()?,
            id: row.id,
            user_id: row.user_id,
            account_id: row.account_id,
            signal_id: row.signal_id,
            lot_size: to_decimal(row.lot_size),
            entry_price: to_decimal(row.entry_price),
            current_price: row.current_price.map(to_decimal),
            unrealized_pnl: to_decimal(row.unrealized_pnl),
            pips_moved: to_decimal(row.pips_moved),
            progress_pct: to_decimal(row.progress_pct),
            realized_pnl: row.realized_pnl.map(to_decimal),
            created_at: row.created_at,
            updated_at: row.updated_at,
            closed_at: row.closed_at,
        })
    }
}

impl TryFrom<AllocationSignalRow> for AllocationWithSignal {
    type Error = anyhow::Error;

    fn try_from(row: AllocationSignalRow) -> Result<Self> {
        let signal = Signal {
            id: row.allocation.signal_id.clone(),
            symbol: row.signal_symbol,
            direction: row.signal_direction.parse()?,
            entry_price: to_decimal(row.signal_entry_price),
            stop_loss: to_decimal(row.signal_stop_loss),
            take_profit: to_decimal(row.signal_take_profit),
            created_at: row.signal_created_at,
        };

        Ok(Self {
            allocation: row.allocation.try_into()?,
            signal,
        })
    }
}

impl TryFrom<SignalRow> for Signal {
    type Error = anyhow::Error;

    fn try_from(row: SignalRow) -> Result<Self> {
        Ok(Self {
            direction: row.direction.parse()?,
            id: row.id,
            symbol: row.symbol,
            entry_price: to_decimal(row.entry_price),
            stop_loss: to_decimal(row.stop_loss),
            take_profit: to_decimal(row.take_profit),
            created_at: row.created_at,
        })
    }
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            starting_balance: to_decimal(row.starting_balance),
            avg_lot_size: row.avg_lot_size.map(to_decimal),
            unrealized_pnl: to_decimal(row.unrealized_pnl),
            theoretical_equity: to_decimal(row.theoretical_equity),
            last_synced_at: row.last_synced_at,
            created_at: row.created_at,
        }
    }
}

impl TryFrom<AlertRow> for ConsistencyAlert {
    type Error = anyhow::Error;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Self {
            severity: row.severity.parse::<AlertSeverity>()?,
            id: row.id,
            user_id: row.user_id,
            account_id: row.account_id,
            alert_type: row.alert_type,
            observed_value: to_decimal(row.observed_value),
            expected_value: to_decimal(row.expected_value),
            threshold_pct: to_decimal(row.threshold_pct),
            was_blocked: row.was_blocked,
            message: row.message,
            created_at: row.created_at,
        })
    }
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Single-connection in-memory database. The pool must never recycle the
    /// connection or the schema disappears with it.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                starting_balance REAL NOT NULL DEFAULT 0,
                avg_lot_size REAL,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                theoretical_equity REAL NOT NULL DEFAULT 0,
                last_synced_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL CHECK (direction IN ('BUY', 'SELL')),
                entry_price REAL NOT NULL,
                stop_loss REAL NOT NULL,
                take_profit REAL NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_allocations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                signal_id TEXT NOT NULL,
                lot_size REAL NOT NULL CHECK (lot_size > 0),
                entry_price REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'open'
                    CHECK (status IN ('open', 'closed', 'cancelled')),
                current_price REAL,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                pips_moved REAL NOT NULL DEFAULT 0,
                progress_pct REAL NOT NULL DEFAULT 0,
                realized_pnl REAL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                closed_at TEXT,
                FOREIGN KEY (account_id) REFERENCES accounts(id),
                FOREIGN KEY (signal_id) REFERENCES signals(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Append-only: nothing in this module updates or deletes alerts
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS consistency_alerts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                severity TEXT NOT NULL CHECK (severity IN ('warning', 'blocked')),
                observed_value REAL NOT NULL,
                expected_value REAL NOT NULL,
                threshold_pct REAL NOT NULL,
                was_blocked INTEGER NOT NULL DEFAULT 0,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_allocations_account ON trade_allocations(user_id, account_id, created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_allocations_status ON trade_allocations(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_alerts_account ON consistency_alerts(account_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Accounts ====================

    /// Insert a new account.
    pub async fn create_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, user_id, name, starting_balance, avg_lot_size,
                unrealized_pnl, theoretical_equity, last_synced_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.user_id)
        .bind(&account.name)
        .bind(to_f64(account.starting_balance))
        .bind(account.avg_lot_size.map(to_f64))
        .bind(to_f64(account.unrealized_pnl))
        .bind(to_f64(account.theoretical_equity))
        .bind(account.last_synced_at)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create account {}", account.id))?;

        Ok(())
    }

    /// Get an account by id.
    pub async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch account")?;

        Ok(row.map(Account::from))
    }

    /// List accounts, optionally for one user.
    pub async fn list_accounts(&self, user_id: Option<&str>) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(
            "SELECT * FROM accounts WHERE (?1 IS NULL OR user_id = ?1) ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch accounts")?;

        Ok(rows.into_iter().map(Account::from).collect())
    }

    /// Overwrite the account's running average lot size.
    pub async fn update_account_avg_lot_size(&self, account_id: &str, avg: Decimal) -> Result<()> {
        sqlx::query("UPDATE accounts SET avg_lot_size = ? WHERE id = ?")
            .bind(to_f64(avg))
            .bind(account_id)
            .execute(&self.pool)
            .await
            .context("Failed to update account lot size baseline")?;

        Ok(())
    }

    /// Record the outcome of a scoped P&L sync on the account.
    pub async fn update_account_sync(
        &self,
        account_id: &str,
        unrealized_pnl: Decimal,
        theoretical_equity: Decimal,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts SET
                unrealized_pnl = ?,
                theoretical_equity = ?,
                last_synced_at = ?
            WHERE id = ?
            "#,
        )
        .bind(to_f64(unrealized_pnl))
        .bind(to_f64(theoretical_equity))
        .bind(synced_at)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .context("Failed to update account sync figures")?;

        Ok(())
    }

    /// Starting balance plus realized P&L of finalized allocations plus
    /// unrealized P&L of open ones.
    pub async fn theoretical_equity(&self, account_id: &str) -> Result<Decimal> {
        let (equity,): (f64,) = sqlx::query_as(
            r#"
            SELECT acc.starting_balance
                 + COALESCE((SELECT SUM(realized_pnl) FROM trade_allocations
                             WHERE account_id = acc.id AND status != 'open'), 0)
                 + COALESCE((SELECT SUM(unrealized_pnl) FROM trade_allocations
                             WHERE account_id = acc.id AND status = 'open'), 0)
            FROM accounts acc
            WHERE acc.id = ?
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to compute equity for account {}", account_id))?;

        Ok(to_decimal(equity))
    }

    // ==================== Signals ====================

    /// Insert a new signal.
    pub async fn create_signal(&self, signal: &Signal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO signals (id, symbol, direction, entry_price, stop_loss, take_profit, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&signal.id)
        .bind(&signal.symbol)
        .bind(signal.direction.as_str())
        .bind(to_f64(signal.entry_price))
        .bind(to_f64(signal.stop_loss))
        .bind(to_f64(signal.take_profit))
        .bind(signal.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create signal {}", signal.id))?;

        Ok(())
    }

    /// Get a signal by id.
    pub async fn get_signal(&self, signal_id: &str) -> Result<Option<Signal>> {
        let row = sqlx::query_as::<_, SignalRow>("SELECT * FROM signals WHERE id = ?")
            .bind(signal_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch signal")?;

        row.map(Signal::try_from).transpose()
    }

    // ==================== Allocations ====================

    /// Insert a new allocation.
    pub async fn create_allocation(&self, allocation: &TradeAllocation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_allocations (
                id, user_id, account_id, signal_id, lot_size, entry_price, status,
                current_price, unrealized_pnl, pips_moved, progress_pct, realized_pnl,
                created_at, updated_at, closed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&allocation.id)
        .bind(&allocation.user_id)
        .bind(&allocation.account_id)
        .bind(&allocation.signal_id)
        .bind(to_f64(allocation.lot_size))
        .bind(to_f64(allocation.entry_price))
        .bind(allocation.status.as_str())
        .bind(allocation.current_price.map(to_f64))
        .bind(to_f64(allocation.unrealized_pnl))
        .bind(to_f64(allocation.pips_moved))
        .bind(to_f64(allocation.progress_pct))
        .bind(allocation.realized_pnl.map(to_f64))
        .bind(allocation.created_at)
        .bind(allocation.updated_at)
        .bind(allocation.closed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create allocation {}", allocation.id))?;

        Ok(())
    }

    /// Lot sizes of the most recent allocations for a user/account, newest first.
    pub async fn recent_lot_sizes(
        &self,
        user_id: &str,
        account_id: &str,
        limit: u32,
    ) -> Result<Vec<Decimal>> {
        let rows: Vec<(f64,)> = sqlx::query_as(
            r#"
            SELECT lot_size FROM trade_allocations
            WHERE user_id = ? AND account_id = ? AND lot_size IS NOT NULL
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(account_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch lot size history")?;

        Ok(rows.into_iter().map(|(lot,)| to_decimal(lot)).collect())
    }

    /// Get one allocation with its signal.
    pub async fn get_allocation_with_signal(
        &self,
        allocation_id: &str,
    ) -> Result<Option<AllocationWithSignal>> {
        let query = format!("{} WHERE a.id = ?", ALLOCATION_WITH_SIGNAL);
        let row = sqlx::query_as::<_, AllocationSignalRow>(&query)
            .bind(allocation_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch allocation")?;

        row.map(AllocationWithSignal::try_from).transpose()
    }

    /// Get all open allocations with their signals, optionally scoped.
    pub async fn get_open_allocations(
        &self,
        user_id: Option<&str>,
        account_id: Option<&str>,
    ) -> Result<Vec<AllocationWithSignal>> {
        let query = format!(
            "{} WHERE a.status = 'open' AND (?1 IS NULL OR a.user_id = ?1) AND (?2 IS NULL OR a.account_id = ?2) ORDER BY a.created_at",
            ALLOCATION_WITH_SIGNAL
        );
        let rows = sqlx::query_as::<_, AllocationSignalRow>(&query)
            .bind(user_id)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch open allocations")?;

        rows.into_iter().map(AllocationWithSignal::try_from).collect()
    }

    /// Write live P&L figures onto an open allocation.
    pub async fn update_allocation_pnl(&self, allocation_id: &str, pnl: &AllocationPnl) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE trade_allocations SET
                current_price = ?,
                unrealized_pnl = ?,
                pips_moved = ?,
                progress_pct = ?,
                updated_at = ?
            WHERE id = ? AND status = 'open'
            "#,
        )
        .bind(to_f64(pnl.current_price))
        .bind(to_f64(pnl.unrealized_pnl))
        .bind(to_f64(pnl.pips_moved))
        .bind(to_f64(pnl.progress_pct))
        .bind(pnl.updated_at)
        .bind(allocation_id)
        .execute(&self.pool)
        .await
        .context("Failed to update allocation P&L")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Allocation {} is no longer open", allocation_id);
        }

        Ok(())
    }

    /// Persist a finalized allocation. Only succeeds while the stored row is
    /// still open, so a status can never be reopened or overwritten.
    pub async fn finalize_allocation(&self, allocation: &TradeAllocation) -> Result<()> {
        if allocation.status == AllocationStatus::Open {
            anyhow::bail!("Allocation {} has not been finalized", allocation.id);
        }

        let result = sqlx::query(
            r#"
            UPDATE trade_allocations SET
                status = ?,
                current_price = ?,
                unrealized_pnl = 0,
                realized_pnl = ?,
                updated_at = ?,
                closed_at = ?
            WHERE id = ? AND status = 'open'
            "#,
        )
        .bind(allocation.status.as_str())
        .bind(allocation.current_price.map(to_f64))
        .bind(allocation.realized_pnl.map(to_f64))
        .bind(allocation.updated_at)
        .bind(allocation.closed_at)
        .bind(&allocation.id)
        .execute(&self.pool)
        .await
        .context("Failed to finalize allocation")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Allocation {} is not open", allocation.id);
        }

        Ok(())
    }

    // ==================== Consistency Alerts ====================

    /// Append an alert to the audit log.
    pub async fn insert_consistency_alert(&self, alert: &ConsistencyAlert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO consistency_alerts (
                id, user_id, account_id, alert_type, severity, observed_value,
                expected_value, threshold_pct, was_blocked, message, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alert.id)
        .bind(&alert.user_id)
        .bind(&alert.account_id)
        .bind(&alert.alert_type)
        .bind(alert.severity.as_str())
        .bind(to_f64(alert.observed_value))
        .bind(to_f64(alert.expected_value))
        .bind(to_f64(alert.threshold_pct))
        .bind(alert.was_blocked)
        .bind(&alert.message)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert consistency alert")?;

        Ok(())
    }

    /// Most recent alerts for an account, newest first.
    pub async fn recent_alerts(&self, account_id: &str, limit: i64) -> Result<Vec<ConsistencyAlert>> {
        let rows = sqlx::query_as::<_, AlertRow>(
            "SELECT * FROM consistency_alerts WHERE account_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch consistency alerts")?;

        rows.into_iter().map(ConsistencyAlert::try_from).collect()
    }

    /// Get the connection pool (for advanced queries).
    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, LOT_SIZE_SPIKE};
    use rust_decimal_macros::dec;

    async fn seeded() -> (Database, Signal) {
        let db = Database::in_memory().await.unwrap();
        db.create_account(&Account::new("acc-1", "user-1", "Main", dec!(10000)))
            .await
            .unwrap();
        let signal = Signal::new("EURUSD", Direction::Buy, dec!(1.1), dec!(1.095), dec!(1.11));
        db.create_signal(&signal).await.unwrap();
        (db, signal)
    }

    #[tokio::test]
    async fn test_account_round_trip() {
        let (db, _) = seeded().await;

        let account = db.get_account("acc-1").await.unwrap().unwrap();
        assert_eq!(account.user_id, "user-1");
        assert_eq!(account.starting_balance, dec!(10000));
        assert_eq!(account.avg_lot_size, None);

        db.update_account_avg_lot_size("acc-1", dec!(1.1667)).await.unwrap();
        let account = db.get_account("acc-1").await.unwrap().unwrap();
        assert_eq!(account.avg_lot_size, Some(dec!(1.1667)));

        assert!(db.get_account("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recent_lot_sizes_newest_first_and_limited() {
        let (db, signal) = seeded().await;

        for lot in [dec!(0.1), dec!(0.2), dec!(0.3), dec!(0.4)] {
            let alloc = TradeAllocation::new("user-1", "acc-1", &signal.id, lot, dec!(1.1)).unwrap();
            db.create_allocation(&alloc).await.unwrap();
        }
        // Another user's allocation on the same account id is not history
        let foreign = TradeAllocation::new("user-2", "acc-1", &signal.id, dec!(9), dec!(1.1)).unwrap();
        db.create_allocation(&foreign).await.unwrap();

        let lots = db.recent_lot_sizes("user-1", "acc-1", 3).await.unwrap();
        assert_eq!(lots, vec![dec!(0.4), dec!(0.3), dec!(0.2)]);
    }

    #[tokio::test]
    async fn test_open_allocations_scoped_and_joined() {
        let (db, signal) = seeded().await;
        db.create_account(&Account::new("acc-2", "user-2", "Other", dec!(5000)))
            .await
            .unwrap();

        let mine = TradeAllocation::new("user-1", "acc-1", &signal.id, dec!(1), dec!(1.1)).unwrap();
        let theirs = TradeAllocation::new("user-2", "acc-2", &signal.id, dec!(2), dec!(1.1)).unwrap();
        db.create_allocation(&mine).await.unwrap();
        db.create_allocation(&theirs).await.unwrap();

        let all = db.get_open_allocations(None, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let scoped = db.get_open_allocations(Some("user-1"), None).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].allocation.id, mine.id);
        assert_eq!(scoped[0].signal.symbol, "EURUSD");
        assert_eq!(scoped[0].signal.direction, Direction::Buy);
        assert_eq!(scoped[0].signal.stop_loss, dec!(1.095));

        let scoped = db.get_open_allocations(None, Some("acc-2")).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].allocation.id, theirs.id);
    }

    #[tokio::test]
    async fn test_finalize_only_once() {
        let (db, signal) = seeded().await;
        let mut alloc = TradeAllocation::new("user-1", "acc-1", &signal.id, dec!(1), dec!(1.1)).unwrap();
        db.create_allocation(&alloc).await.unwrap();

        alloc.finalize(AllocationStatus::Closed, dec!(25)).unwrap();
        db.finalize_allocation(&alloc).await.unwrap();

        // Second write is rejected by the stored status
        assert!(db.finalize_allocation(&alloc).await.is_err());

        let stored = db.get_allocation_with_signal(&alloc.id).await.unwrap().unwrap();
        assert_eq!(stored.allocation.status, AllocationStatus::Closed);
        assert_eq!(stored.allocation.realized_pnl, Some(dec!(25)));
        assert!(db.get_open_allocations(None, None).await.unwrap().is_empty());

        // Closed allocations no longer take live P&L
        let pnl = AllocationPnl {
            current_price: dec!(1.2),
            unrealized_pnl: dec!(1000),
            pips_moved: dec!(1000),
            progress_pct: dec!(100),
            updated_at: Utc::now(),
        };
        assert!(db.update_allocation_pnl(&alloc.id, &pnl).await.is_err());
    }

    #[tokio::test]
    async fn test_theoretical_equity() {
        let (db, signal) = seeded().await;

        let mut closed = TradeAllocation::new("user-1", "acc-1", &signal.id, dec!(1), dec!(1.1)).unwrap();
        db.create_allocation(&closed).await.unwrap();
        closed.finalize(AllocationStatus::Closed, dec!(-120)).unwrap();
        db.finalize_allocation(&closed).await.unwrap();

        let open = TradeAllocation::new("user-1", "acc-1", &signal.id, dec!(1), dec!(1.1)).unwrap();
        db.create_allocation(&open).await.unwrap();
        let pnl = AllocationPnl {
            current_price: dec!(1.105),
            unrealized_pnl: dec!(500),
            pips_moved: dec!(50),
            progress_pct: dec!(66.67),
            updated_at: Utc::now(),
        };
        db.update_allocation_pnl(&open.id, &pnl).await.unwrap();

        assert_eq!(db.theoretical_equity("acc-1").await.unwrap(), dec!(10380));
        assert!(db.theoretical_equity("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_alerts_append_and_list() {
        let (db, _) = seeded().await;

        let alert = ConsistencyAlert::lot_size_spike(
            "user-1",
            "acc-1",
            dec!(2),
            dec!(1),
            dec!(150),
            true,
            "blocked".to_string(),
        );
        db.insert_consistency_alert(&alert).await.unwrap();

        let alerts = db.recent_alerts("acc-1", 10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, LOT_SIZE_SPIKE);
        assert_eq!(alerts[0].severity, AlertSeverity::Blocked);
        assert_eq!(alerts[0].observed_value, dec!(2));
        assert!(alerts[0].was_blocked);
    }
}
