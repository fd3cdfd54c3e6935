//! Trade P&L synchronization: marks open allocations to live prices.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{AllocationPnl, Database};
use crate::models::{AllocationStatus, TradeAllocation};
use crate::prices::PriceSource;

use super::calculator::PnlCalculator;
use super::pip::PipValueModel;

/// Which allocations a sync pass covers. Both `None` sweeps every open allocation.
#[derive(Debug, Clone, Default)]
pub struct SyncScope {
    pub user_id: Option<String>,
    pub account_id: Option<String>,
}

/// Figures written onto one allocation.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationUpdate {
    pub id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub unrealized_pnl: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub current_price: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub pips_moved: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub progress_pct: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub success: bool,
    /// Allocations written successfully
    pub updated: usize,
    /// Allocations left untouched (no price, or the write failed)
    pub skipped: usize,
    pub allocations: Vec<AllocationUpdate>,
}

/// Recomputes unrealized P&L of open allocations against a price source.
pub struct PnlSynchronizer<M: PipValueModel> {
    db: Database,
    prices: Arc<dyn PriceSource>,
    calculator: PnlCalculator<M>,
}

impl<M: PipValueModel> PnlSynchronizer<M> {
    pub fn new(db: Database, prices: Arc<dyn PriceSource>, model: M) -> Self {
        Self {
            db,
            prices,
            calculator: PnlCalculator::new(model),
        }
    }

    /// Run one sync pass.
    ///
    /// Fails only when the open allocations cannot be loaded. Missing prices
    /// and failed writes are skipped allocation by allocation.
    pub async fn sync(&self, scope: &SyncScope) -> Result<SyncReport> {
        let open = self
            .db
            .get_open_allocations(scope.user_id.as_deref(), scope.account_id.as_deref())
            .await?;

        let symbols: Vec<String> = open
            .iter()
            .map(|p| p.signal.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let prices = if symbols.is_empty() {
            HashMap::new()
        } else {
            match self.prices.fetch_prices(&symbols).await {
                Ok(prices) => prices,
                Err(e) => {
                    warn!(error = %e, symbols = symbols.len(), "Price source unavailable, skipping all allocations");
                    HashMap::new()
                }
            }
        };

        debug!(
            allocations = open.len(),
            symbols = symbols.len(),
            priced = prices.len(),
            "Starting P&L sync"
        );

        let mut updates = Vec::with_capacity(open.len());
        let mut skipped = 0usize;

        for position in &open {
            let Some(&current_price) = prices.get(&position.signal.symbol) else {
                debug!(
                    allocation_id = %position.allocation.id,
                    symbol = %position.signal.symbol,
                    "No live price, skipping"
                );
                skipped += 1;
                continue;
            };

            let Some(snapshot) = self.calculator.evaluate(position, current_price) else {
                warn!(
                    allocation_id = %position.allocation.id,
                    symbol = %position.signal.symbol,
                    price = %current_price,
                    "P&L out of range, skipping"
                );
                skipped += 1;
                continue;
            };
            let snapshot = snapshot.rounded();
            let pnl = AllocationPnl {
                current_price,
                unrealized_pnl: snapshot.unrealized_pnl,
                pips_moved: snapshot.pips,
                progress_pct: snapshot.progress_pct,
                updated_at: Utc::now(),
            };

            if let Err(e) = self.db.update_allocation_pnl(&position.allocation.id, &pnl).await {
                warn!(allocation_id = %position.allocation.id, error = %e, "Failed to update allocation P&L");
                skipped += 1;
                continue;
            }

            updates.push(AllocationUpdate {
                id: position.allocation.id.clone(),
                unrealized_pnl: pnl.unrealized_pnl,
                current_price: pnl.current_price,
                pips_moved: pnl.pips_moved,
                progress_pct: pnl.progress_pct,
                updated_at: pnl.updated_at,
            });
        }

        if let Some(account_id) = &scope.account_id {
            let total = saturating_total(updates.iter().map(|u| u.unrealized_pnl));
            self.record_account_totals(account_id, total).await;
        }

        info!(
            updated = updates.len(),
            skipped = skipped,
            user_id = ?scope.user_id,
            account_id = ?scope.account_id,
            "P&L sync complete"
        );

        Ok(SyncReport {
            success: true,
            updated: updates.len(),
            skipped,
            allocations: updates,
        })
    }

    /// Write the account aggregate. Failures are logged; the per-allocation
    /// updates already stand.
    async fn record_account_totals(&self, account_id: &str, unrealized_pnl: Decimal) {
        let equity = match self.db.theoretical_equity(account_id).await {
            Ok(equity) => equity,
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "Failed to compute theoretical equity");
                return;
            }
        };

        if let Err(e) = self
            .db
            .update_account_sync(account_id, unrealized_pnl, equity, Utc::now())
            .await
        {
            warn!(account_id = %account_id, error = %e, "Failed to update account P&L totals");
        }
    }

    /// Close an open allocation at `exit_price`, fixing its realized P&L.
    pub async fn close(&self, allocation_id: &str, exit_price: Decimal) -> Result<TradeAllocation> {
        let position = self
            .db
            .get_allocation_with_signal(allocation_id)
            .await?
            .with_context(|| format!("Allocation {} not found", allocation_id))?;

        let realized = self
            .calculator
            .evaluate(&position, exit_price)
            .with_context(|| format!("Exit price {} is out of range for {}", exit_price, allocation_id))?
            .rounded()
            .unrealized_pnl;

        let mut allocation = position.allocation;
        allocation.finalize(AllocationStatus::Closed, realized)?;
        allocation.current_price = Some(exit_price);
        self.db.finalize_allocation(&allocation).await?;

        info!(allocation_id = %allocation_id, realized_pnl = %realized, "Allocation closed");
        Ok(allocation)
    }

    /// Cancel an open allocation. Realized P&L is zero.
    pub async fn cancel(&self, allocation_id: &str) -> Result<TradeAllocation> {
        let position = self
            .db
            .get_allocation_with_signal(allocation_id)
            .await?
            .with_context(|| format!("Allocation {} not found", allocation_id))?;

        let mut allocation = position.allocation;
        allocation.finalize(AllocationStatus::Cancelled, Decimal::ZERO)?;
        self.db.finalize_allocation(&allocation).await?;

        info!(allocation_id = %allocation_id, "Allocation cancelled");
        Ok(allocation)
    }
}

/// Sum that pins at `Decimal::MAX`/`MIN` instead of overflowing.
fn saturating_total(values: impl Iterator<Item = Decimal>) -> Decimal {
    values.fold(Decimal::ZERO, |total, v| {
        total.checked_add(v).unwrap_or(if v.is_sign_negative() {
            Decimal::MIN
        } else {
            Decimal::MAX
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, Direction, Signal};
    use crate::pnl::FlatPipValue;
    use crate::prices::StaticPriceSource;
    use futures::future::BoxFuture;
    use rust_decimal_macros::dec;
    use tokio_test::assert_err;

    struct FailingPriceSource;

    impl PriceSource for FailingPriceSource {
        fn fetch_prices<'a>(
            &'a self,
            _symbols: &'a [String],
        ) -> BoxFuture<'a, Result<HashMap<String, Decimal>>> {
            let result: Result<HashMap<String, Decimal>> = Err(anyhow::anyhow!("feed down"));
            Box::pin(futures::future::ready(result))
        }
    }

    /// Cancels one allocation after the pass has loaded it, so its write fails.
    struct CancellingPriceSource {
        db: Database,
        allocation_id: String,
        prices: StaticPriceSource,
    }

    impl PriceSource for CancellingPriceSource {
        fn fetch_prices<'a>(
            &'a self,
            symbols: &'a [String],
        ) -> BoxFuture<'a, Result<HashMap<String, Decimal>>> {
            Box::pin(async move {
                let mut allocation = self
                    .db
                    .get_allocation_with_signal(&self.allocation_id)
                    .await
                    .unwrap()
                    .unwrap()
                    .allocation;
                allocation.finalize(AllocationStatus::Cancelled, Decimal::ZERO).unwrap();
                self.db.finalize_allocation(&allocation).await.unwrap();

                self.prices.fetch_prices(symbols).await
            })
        }
    }

    struct Fixture {
        db: Database,
        eurusd: Signal,
        gbpusd: Signal,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        db.create_account(&Account::new("acc-1", "user-1", "Main", dec!(10000)))
            .await
            .unwrap();
        db.create_account(&Account::new("acc-2", "user-2", "Other", dec!(5000)))
            .await
            .unwrap();

        let eurusd = Signal::new("EURUSD", Direction::Buy, dec!(1.1000), dec!(1.0950), dec!(1.1100));
        let gbpusd = Signal::new("GBPUSD", Direction::Sell, dec!(1.2700), dec!(1.2750), dec!(1.2600));
        db.create_signal(&eurusd).await.unwrap();
        db.create_signal(&gbpusd).await.unwrap();

        Fixture { db, eurusd, gbpusd }
    }

    async fn allocate(db: &Database, user: &str, account: &str, signal: &Signal, lot: Decimal) -> TradeAllocation {
        let alloc = TradeAllocation::new(user, account, &signal.id, lot, signal.entry_price).unwrap();
        db.create_allocation(&alloc).await.unwrap();
        alloc
    }

    fn synchronizer(db: &Database, prices: &[&str]) -> PnlSynchronizer<FlatPipValue> {
        let pairs: Vec<String> = prices.iter().map(|s| s.to_string()).collect();
        let source = StaticPriceSource::from_pairs(&pairs).unwrap();
        PnlSynchronizer::new(db.clone(), Arc::new(source), FlatPipValue::default())
    }

    #[tokio::test]
    async fn test_sync_updates_priced_allocations() {
        let f = fixture().await;
        let buy = allocate(&f.db, "user-1", "acc-1", &f.eurusd, dec!(1)).await;

        let sync = synchronizer(&f.db, &["EURUSD=1.1050"]);
        let report = sync.sync(&SyncScope::default()).await.unwrap();

        assert!(report.success);
        assert_eq!(report.updated, 1);
        assert_eq!(report.allocations[0].id, buy.id);
        assert_eq!(report.allocations[0].pips_moved, dec!(50));
        assert_eq!(report.allocations[0].unrealized_pnl, dec!(500));
        assert_eq!(report.allocations[0].progress_pct, dec!(66.67));

        let stored = f.db.get_allocation_with_signal(&buy.id).await.unwrap().unwrap();
        assert_eq!(stored.allocation.current_price, Some(dec!(1.105)));
        assert_eq!(stored.allocation.pips_moved, dec!(50));
        assert_eq!(stored.allocation.unrealized_pnl, dec!(500));
        assert_eq!(stored.allocation.progress_pct, dec!(66.67));
    }

    #[tokio::test]
    async fn test_unpriced_symbols_left_untouched() {
        let f = fixture().await;
        allocate(&f.db, "user-1", "acc-1", &f.eurusd, dec!(1)).await;
        let unpriced = allocate(&f.db, "user-1", "acc-1", &f.gbpusd, dec!(1)).await;

        let sync = synchronizer(&f.db, &["EURUSD=1.1050"]);
        let report = sync.sync(&SyncScope::default()).await.unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped, 1);
        assert!(report.allocations.iter().all(|u| u.id != unpriced.id));

        let stored = f.db.get_allocation_with_signal(&unpriced.id).await.unwrap().unwrap();
        assert_eq!(stored.allocation.current_price, None);
        assert_eq!(stored.allocation.unrealized_pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_sell_allocation_pips() {
        let f = fixture().await;
        let sell = allocate(&f.db, "user-1", "acc-1", &f.gbpusd, dec!(0.5)).await;

        // Price fell 30 pips: good for a short
        let sync = synchronizer(&f.db, &["GBPUSD=1.2670"]);
        let report = sync.sync(&SyncScope::default()).await.unwrap();

        assert_eq!(report.allocations[0].id, sell.id);
        assert_eq!(report.allocations[0].pips_moved, dec!(30));
        assert_eq!(report.allocations[0].unrealized_pnl, dec!(150));
    }

    #[tokio::test]
    async fn test_account_scope_writes_totals() {
        let f = fixture().await;
        allocate(&f.db, "user-1", "acc-1", &f.eurusd, dec!(1)).await;
        allocate(&f.db, "user-1", "acc-1", &f.eurusd, dec!(2)).await;
        let other = allocate(&f.db, "user-2", "acc-2", &f.eurusd, dec!(1)).await;

        let sync = synchronizer(&f.db, &["EURUSD=1.0980"]);
        let scope = SyncScope {
            user_id: None,
            account_id: Some("acc-1".to_string()),
        };
        let report = sync.sync(&scope).await.unwrap();
        assert_eq!(report.updated, 2);

        // -20 pips on 3 lots
        let account = f.db.get_account("acc-1").await.unwrap().unwrap();
        assert_eq!(account.unrealized_pnl, dec!(-600));
        assert_eq!(account.theoretical_equity, dec!(9400));
        assert!(account.last_synced_at.is_some());

        // Out of scope
        let stored = f.db.get_allocation_with_signal(&other.id).await.unwrap().unwrap();
        assert_eq!(stored.allocation.current_price, None);
        let untouched = f.db.get_account("acc-2").await.unwrap().unwrap();
        assert!(untouched.last_synced_at.is_none());
    }

    #[tokio::test]
    async fn test_user_scope_does_not_touch_accounts() {
        let f = fixture().await;
        allocate(&f.db, "user-1", "acc-1", &f.eurusd, dec!(1)).await;

        let sync = synchronizer(&f.db, &["EURUSD=1.1050"]);
        let scope = SyncScope {
            user_id: Some("user-1".to_string()),
            account_id: None,
        };
        assert_eq!(sync.sync(&scope).await.unwrap().updated, 1);

        let account = f.db.get_account("acc-1").await.unwrap().unwrap();
        assert!(account.last_synced_at.is_none());
    }

    #[tokio::test]
    async fn test_price_source_failure_skips_everything() {
        let f = fixture().await;
        allocate(&f.db, "user-1", "acc-1", &f.eurusd, dec!(1)).await;

        let sync = PnlSynchronizer::new(f.db.clone(), Arc::new(FailingPriceSource), FlatPipValue::default());
        let report = sync.sync(&SyncScope::default()).await.unwrap();

        assert!(report.success);
        assert_eq!(report.updated, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_absurd_price_skips_only_that_allocation() {
        let f = fixture().await;
        let bogus = allocate(&f.db, "user-1", "acc-1", &f.eurusd, dec!(1)).await;
        let sibling = allocate(&f.db, "user-1", "acc-1", &f.gbpusd, dec!(1)).await;

        let sync = synchronizer(
            &f.db,
            &["EURUSD=10000000000000000000000000", "GBPUSD=1.2670"],
        );
        let scope = SyncScope {
            user_id: None,
            account_id: Some("acc-1".to_string()),
        };
        let report = sync.sync(&scope).await.unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.allocations[0].id, sibling.id);

        let stored = f.db.get_allocation_with_signal(&bogus.id).await.unwrap().unwrap();
        assert_eq!(stored.allocation.current_price, None);

        // Totals still written from the allocations that priced
        let account = f.db.get_account("acc-1").await.unwrap().unwrap();
        assert_eq!(account.unrealized_pnl, dec!(300));
        assert!(account.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_write_skips_only_that_allocation() {
        let f = fixture().await;
        let lost = allocate(&f.db, "user-1", "acc-1", &f.eurusd, dec!(1)).await;
        let kept = allocate(&f.db, "user-1", "acc-1", &f.eurusd, dec!(2)).await;

        let source = CancellingPriceSource {
            db: f.db.clone(),
            allocation_id: lost.id.clone(),
            prices: StaticPriceSource::from_pairs(&["EURUSD=1.1050".to_string()]).unwrap(),
        };
        let sync = PnlSynchronizer::new(f.db.clone(), Arc::new(source), FlatPipValue::default());
        let report = sync.sync(&SyncScope::default()).await.unwrap();

        assert!(report.success);
        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.allocations[0].id, kept.id);
        assert_eq!(report.allocations[0].unrealized_pnl, dec!(1000));

        let stored = f.db.get_allocation_with_signal(&lost.id).await.unwrap().unwrap();
        assert_eq!(stored.allocation.status, AllocationStatus::Cancelled);
        assert_eq!(stored.allocation.current_price, None);
    }

    #[test]
    fn test_saturating_total() {
        assert_eq!(saturating_total([dec!(1.5), dec!(-0.5)].into_iter()), dec!(1));
        assert_eq!(saturating_total([Decimal::MAX, dec!(1)].into_iter()), Decimal::MAX);
        assert_eq!(saturating_total([Decimal::MIN, dec!(-1)].into_iter()), Decimal::MIN);
    }

    #[tokio::test]
    async fn test_close_rejects_out_of_range_exit() {
        let f = fixture().await;
        let alloc = allocate(&f.db, "user-1", "acc-1", &f.eurusd, dec!(1)).await;
        let sync = synchronizer(&f.db, &[]);

        let absurd: Decimal = "10000000000000000000000000".parse().unwrap();
        assert_err!(sync.close(&alloc.id, absurd).await);

        let stored = f.db.get_allocation_with_signal(&alloc.id).await.unwrap().unwrap();
        assert_eq!(stored.allocation.status, AllocationStatus::Open);
    }

    #[tokio::test]
    async fn test_allocation_fetch_failure_fails_call() {
        let f = fixture().await;
        sqlx::query("DROP TABLE trade_allocations")
            .execute(f.db.pool())
            .await
            .unwrap();

        let sync = synchronizer(&f.db, &["EURUSD=1.1050"]);
        assert_err!(sync.sync(&SyncScope::default()).await);
    }

    #[tokio::test]
    async fn test_close_and_cancel() {
        let f = fixture().await;
        let winner = allocate(&f.db, "user-1", "acc-1", &f.eurusd, dec!(1)).await;
        let scratched = allocate(&f.db, "user-1", "acc-1", &f.eurusd, dec!(1)).await;
        let sync = synchronizer(&f.db, &[]);

        let closed = sync.close(&winner.id, dec!(1.1100)).await.unwrap();
        assert_eq!(closed.status, AllocationStatus::Closed);
        assert_eq!(closed.realized_pnl, Some(dec!(1000)));

        let cancelled = sync.cancel(&scratched.id).await.unwrap();
        assert_eq!(cancelled.status, AllocationStatus::Cancelled);
        assert_eq!(cancelled.realized_pnl, Some(Decimal::ZERO));

        // No reopening, no second close
        assert_err!(sync.close(&winner.id, dec!(1.2)).await);
        assert_err!(sync.cancel(&winner.id).await);
        assert_err!(sync.close("missing", dec!(1.1)).await);

        assert_eq!(f.db.theoretical_equity("acc-1").await.unwrap(), dec!(11000));
    }
}
