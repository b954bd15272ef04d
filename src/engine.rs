//! Engine wiring and the scheduler driver loop.
//!
//! [`AutomationEngine`] constructs the three components once with their
//! injected collaborators (no package-level globals) and owns the single
//! driver loop that pops due tasks from the shared [`TaskQueue`] and
//! dispatches them sequentially. Long-running collaborator calls happen
//! inside the dispatched tick while the task's dispatch permit is held;
//! component state is only touched under its own lock.

use crate::billing::BillingScheduler;
use crate::clock::Clock;
use crate::config::AutomationConfig;
use crate::expiration::{ExpirationGovernor, ExpirationSummary};
use crate::ports::{
    AccountRepository, EnforcementHook, InvoiceGenerator, InvoiceStore, NotificationSink,
    UsageSource,
};
use crate::scheduler::{TaskKey, TaskKind, TaskQueue};
use crate::usage::UsageMonitor;
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// How long the driver parks when no task is armed.
const IDLE_PARK: std::time::Duration = std::time::Duration::from_secs(60);

/// Everything external the engine needs, injected at construction.
pub struct Collaborators {
    pub accounts: Arc<dyn AccountRepository>,
    pub usage_source: Arc<dyn UsageSource>,
    pub invoices: Arc<dyn InvoiceGenerator>,
    pub invoice_store: Arc<dyn InvoiceStore>,
    pub notifications: Arc<dyn NotificationSink>,
}

/// One engine instance per process, passed by handle to all call sites.
pub struct AutomationEngine {
    config: AutomationConfig,
    clock: Arc<dyn Clock>,
    queue: Arc<TaskQueue>,
    accounts: Arc<dyn AccountRepository>,
    usage: Arc<UsageMonitor>,
    billing: Arc<BillingScheduler>,
    expiration: Arc<ExpirationGovernor>,
}

impl AutomationEngine {
    pub fn new(
        config: AutomationConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = Arc::new(TaskQueue::new());
        let usage = Arc::new(UsageMonitor::new(
            &config,
            Arc::clone(&collaborators.usage_source),
            Arc::clone(&collaborators.notifications),
            Arc::clone(&clock),
            Arc::clone(&queue),
        ));
        let billing = Arc::new(BillingScheduler::new(
            &config,
            Arc::clone(&collaborators.invoices),
            Arc::clone(&collaborators.invoice_store),
            Arc::clone(&collaborators.notifications),
            Arc::clone(&clock),
            Arc::clone(&queue),
        ));
        let expiration = Arc::new(ExpirationGovernor::new(
            &config,
            Arc::clone(&collaborators.notifications),
            Arc::clone(&clock),
        ));
        Self {
            config,
            clock,
            queue,
            accounts: collaborators.accounts,
            usage,
            billing,
            expiration,
        }
    }

    pub fn config(&self) -> &AutomationConfig {
        &self.config
    }

    pub fn usage(&self) -> &Arc<UsageMonitor> {
        &self.usage
    }

    pub fn billing(&self) -> &Arc<BillingScheduler> {
        &self.billing
    }

    pub fn expiration(&self) -> &Arc<ExpirationGovernor> {
        &self.expiration
    }

    /// Armed-task count, for health reporting.
    pub fn armed_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Drive the shared scheduler until `shutdown` flips to `true`.
    ///
    /// Due tasks are claimed and dispatched one at a time on this loop, so
    /// within one account automation actions are strictly ordered; there is
    /// no ordering guarantee across accounts.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("automation driver started");
        loop {
            // Drain everything currently due.
            loop {
                let now = self.clock.now_utc();
                let Some(due) = self.queue.claim_due(now) else {
                    break;
                };
                let Some(permit) = self.queue.begin_dispatch(&due).await else {
                    // Cancelled or superseded between claim and dispatch.
                    continue;
                };
                self.dispatch(&due.key).await;
                drop(permit);
            }

            let sleep_for = match self.queue.next_fire_at() {
                Some(at) => (at - self.clock.now_utc())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO),
                None => IDLE_PARK,
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.queue.wait_rearm() => {
                    debug!("driver woken by new deadline");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("automation driver stopped");
    }

    async fn dispatch(&self, key: &TaskKey) {
        match key.kind {
            TaskKind::UsageSample => {
                let Some(plan) = self.usage.sampling_plan(&key.account_id) else {
                    return;
                };
                self.usage
                    .check_account_usage(&key.account_id, plan.quota_mb)
                    .await;
                let next = self.clock.now_utc()
                    + Duration::from_std(plan.interval).unwrap_or_else(|_| Duration::seconds(1));
                self.queue.rearm(TaskKey::usage(&key.account_id), next);
            }
            TaskKind::BillingCycle => {
                self.billing.run_billing_tick(&key.account_id).await;
            }
        }
    }

    /// Convenience batch pass for cron-style drivers: list the fleet and
    /// process expirations with the configured grace period.
    pub async fn expiration_pass(
        &self,
        hook: &dyn EnforcementHook,
    ) -> anyhow::Result<ExpirationSummary> {
        let accounts = self.accounts.list().await?;
        Ok(self
            .expiration
            .process_expirations(&accounts, self.config.grace_period_days, hook)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, AccountStatus};
    use crate::clock::ManualClock;
    use crate::ports::{
        EnforcementOutcome, NullNotificationSink, UnpaidInvoice, UsageReading,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Route driver log output through the test harness (`RUST_LOG` aware).
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    struct FleetRepo {
        accounts: Vec<Account>,
    }

    #[async_trait]
    impl AccountRepository for FleetRepo {
        async fn get(&self, account_id: &str) -> anyhow::Result<Account> {
            self.accounts
                .iter()
                .find(|a| a.id == account_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such account {account_id}"))
        }

        async fn list(&self) -> anyhow::Result<Vec<Account>> {
            Ok(self.accounts.clone())
        }

        async fn update_status(
            &self,
            _account_id: &str,
            _status: AccountStatus,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn update_billing_date(
            &self,
            _account_id: &str,
            _next_billing_date: chrono::NaiveDate,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct CountingSource {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl UsageSource for CountingSource {
        async fn sample(&self, _account_id: &str) -> anyhow::Result<UsageReading> {
            *self.calls.lock() += 1;
            Ok(UsageReading {
                download_mbps: 12.0,
                upload_mbps: 3.0,
                total_download_mb: 500.0,
                total_upload_mb: 50.0,
            })
        }
    }

    struct NoInvoices;

    #[async_trait]
    impl InvoiceGenerator for NoInvoices {
        async fn generate(&self, account_id: &str) -> anyhow::Result<String> {
            Ok(format!("INV-{account_id}"))
        }
    }

    struct EmptyStore;

    #[async_trait]
    impl InvoiceStore for EmptyStore {
        async fn list_overdue(&self, _overdue_days: u32) -> anyhow::Result<Vec<UnpaidInvoice>> {
            Ok(vec![])
        }

        async fn mark_overdue(&self, _invoice_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn credit_balance(&self, _account_id: &str) -> anyhow::Result<f64> {
            Ok(0.0)
        }

        async fn unpaid_invoices(&self, _account_id: &str) -> anyhow::Result<Vec<UnpaidInvoice>> {
            Ok(vec![])
        }

        async fn apply_credit(&self, _invoice_id: &str, _amount: f64) -> anyhow::Result<f64> {
            Ok(0.0)
        }
    }

    struct AlwaysApplied;

    #[async_trait]
    impl EnforcementHook for AlwaysApplied {
        async fn suspend(
            &self,
            _account_id: &str,
            _account: &Account,
        ) -> anyhow::Result<EnforcementOutcome> {
            Ok(EnforcementOutcome::Applied)
        }

        async fn resume(
            &self,
            _account_id: &str,
            _account: &Account,
        ) -> anyhow::Result<EnforcementOutcome> {
            Ok(EnforcementOutcome::Applied)
        }
    }

    fn account(id: &str, status: AccountStatus, next_billing: &str) -> Account {
        Account {
            id: id.into(),
            account_number: format!("NV-{id}"),
            customer_name: "Test Customer".into(),
            customer_phone: "+254700000002".into(),
            status,
            monthly_fee: 2500.0,
            data_quota_gb: None,
            next_billing_date: next_billing.parse().unwrap(),
            balance: 0.0,
            total_paid: 0.0,
            outstanding_balance: 0.0,
        }
    }

    fn engine_with(
        accounts: Vec<Account>,
        source: Arc<CountingSource>,
        clock: Arc<ManualClock>,
    ) -> AutomationEngine {
        AutomationEngine::new(
            AutomationConfig::default(),
            Collaborators {
                accounts: Arc::new(FleetRepo { accounts }),
                usage_source: source,
                invoices: Arc::new(NoInvoices),
                invoice_store: Arc::new(EmptyStore),
                notifications: Arc::new(NullNotificationSink),
            },
            clock,
        )
    }

    #[tokio::test]
    async fn driver_dispatches_due_sampling_tick_and_re_arms() {
        init_tracing();
        let clock = Arc::new(ManualClock::at("2024-01-15T10:00:00Z"));
        let source = Arc::new(CountingSource {
            calls: Mutex::new(0),
        });
        let engine = Arc::new(engine_with(vec![], Arc::clone(&source), Arc::clone(&clock)));

        engine
            .usage()
            .start_monitoring("acc-1", None, std::time::Duration::from_secs(300))
            .unwrap();
        // Make the armed tick due before the driver starts.
        clock.advance(Duration::minutes(6));

        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run(stop_rx).await })
        };

        // The driver drains due work on startup; give it a few yields.
        for _ in 0..20 {
            if *source.calls.lock() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(*source.calls.lock(), 1);
        assert_eq!(engine.usage().usage_history("acc-1", 24).len(), 1);
        // Re-armed for the next interval.
        assert_eq!(engine.armed_tasks(), 1);

        stop_tx.send(true).unwrap();
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn stopped_account_never_fires_after_cancel() {
        init_tracing();
        let clock = Arc::new(ManualClock::at("2024-01-15T10:00:00Z"));
        let source = Arc::new(CountingSource {
            calls: Mutex::new(0),
        });
        let engine = engine_with(vec![], Arc::clone(&source), Arc::clone(&clock));

        engine
            .usage()
            .start_monitoring("acc-1", None, std::time::Duration::from_secs(300))
            .unwrap();
        engine.usage().stop_monitoring("acc-1").await;
        clock.advance(Duration::hours(1));

        // Nothing is armed, so a drain pass finds nothing to claim.
        assert!(engine.queue.claim_due(clock.now_utc()).is_none());
        assert_eq!(*source.calls.lock(), 0);
    }

    #[tokio::test]
    async fn expiration_pass_uses_configured_grace() {
        // Default grace is 3 days; Jan 5 is past 2024-01-01 + 3.
        let clock = Arc::new(ManualClock::at("2024-01-05T10:00:00Z"));
        let source = Arc::new(CountingSource {
            calls: Mutex::new(0),
        });
        let engine = engine_with(
            vec![
                account("acc-due", AccountStatus::Active, "2024-01-01"),
                account("acc-fresh", AccountStatus::Active, "2024-02-01"),
            ],
            source,
            clock,
        );

        let summary = engine.expiration_pass(&AlwaysApplied).await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.suspended, 1);
        assert_eq!(summary.skipped, 1);
    }
}
