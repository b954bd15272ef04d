//! Account expiration enforcement and renewal handling.
//!
//! The governor decides *whether* an account should be suspended or
//! resumed; the real-world effect (disabling or enabling the PPPoE secret)
//! is performed by the caller-injected [`EnforcementHook`]. Account records
//! are never mutated here.
//!
//! ## Design
//! - Expiry is date-only: an account expires the day *after*
//!   `next_billing_date + grace_period`.
//! - Batch passes isolate per-account failures: one bad callback never
//!   aborts the remaining accounts.
//! - Renewal outcomes keep "decided to resume", "attempted to resume", and
//!   "successfully resumed" as separate fields, so a decision-only pass is
//!   never reported as a completed resumption.

use crate::account::{Account, AccountStatus};
use crate::clock::Clock;
use crate::config::AutomationConfig;
use crate::log::{ActionStatus, AutomationAction, AutomationLog, AutomationLogEntry};
use crate::ports::{EnforcementHook, EnforcementOutcome, LifecycleEvent, NotificationSink};
use chrono::{DateTime, Days, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

// ── Evaluation types ─────────────────────────────────────────────

/// Cached result of one expiration evaluation for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirationCheck {
    pub account_id: String,
    pub is_expired: bool,
    pub days_overdue: i64,
    /// Expired *and* currently active — the only combination that drives a
    /// suspension.
    pub should_be_suspended: bool,
    pub checked_at: DateTime<Utc>,
}

/// Tally of one `process_expirations` batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationSummary {
    /// Accounts examined.
    pub processed: usize,
    /// Suspensions that took effect.
    pub suspended: usize,
    /// Suspensions decided but not applied (hook rejected or errored).
    pub failed: usize,
    /// Accounts not expired or not active; the hook was never invoked.
    pub skipped: usize,
}

/// Resume strategy for [`ExpirationGovernor::process_renewal`]: either a
/// real enforcement hook runs, or the renewal is recorded with no
/// state-changing side effect attempted.
pub enum ResumePolicy<'a> {
    Enforce(&'a dyn EnforcementHook),
    DecisionOnly,
}

/// Outcome of one renewal. `resume_decided` (policy says the account should
/// come back), `resume_attempted` (a hook actually ran), and `resumed` (the
/// hook succeeded) are distinct on purpose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalOutcome {
    pub resume_decided: bool,
    pub resume_attempted: bool,
    pub resumed: bool,
    pub message: String,
}

/// Why `detect_renewals` flagged an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalSignal {
    /// Status moved from suspended/closed/paused to active.
    StatusReactivated,
    /// Balance or total paid increased while the account stayed active.
    PaymentObserved,
}

/// Advisory renewal candidate for the caller to act on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalCandidate {
    pub account_id: String,
    pub signal: RenewalSignal,
}

/// Snapshot for the admin view: cached checks plus the recent log tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationStatus {
    pub cached_checks: Vec<ExpirationCheck>,
    pub recent_log: Vec<AutomationLogEntry>,
    pub log_len: usize,
}

// ── Governor ─────────────────────────────────────────────────────

struct GovernorState {
    checks: HashMap<String, ExpirationCheck>,
    log: AutomationLog,
}

/// Decides suspensions and resumptions over the account fleet.
pub struct ExpirationGovernor {
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    state: Mutex<GovernorState>,
}

impl ExpirationGovernor {
    pub fn new(
        config: &AutomationConfig,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sink,
            clock,
            state: Mutex::new(GovernorState {
                checks: HashMap::new(),
                log: AutomationLog::new(config.log_capacity),
            }),
        }
    }

    fn grace_deadline(account: &Account, grace_period_days: u32) -> NaiveDate {
        account
            .next_billing_date
            .checked_add_days(Days::new(u64::from(grace_period_days)))
            .unwrap_or(NaiveDate::MAX)
    }

    /// An account is expired iff today (date-only) is strictly past
    /// `next_billing_date + grace_period_days`.
    pub fn is_account_expired(&self, account: &Account, grace_period_days: u32) -> bool {
        self.clock.today() > Self::grace_deadline(account, grace_period_days)
    }

    /// Whole days since the grace deadline; 0 while not past it.
    pub fn days_overdue(&self, account: &Account, grace_period_days: u32) -> i64 {
        let deadline = Self::grace_deadline(account, grace_period_days);
        let today = self.clock.today();
        if today <= deadline {
            0
        } else {
            (today - deadline).num_days()
        }
    }

    fn evaluate(&self, account: &Account, grace_period_days: u32) -> ExpirationCheck {
        let is_expired = self.is_account_expired(account, grace_period_days);
        ExpirationCheck {
            account_id: account.id.clone(),
            is_expired,
            days_overdue: self.days_overdue(account, grace_period_days),
            should_be_suspended: is_expired && account.status == AccountStatus::Active,
            checked_at: self.clock.now_utc(),
        }
    }

    /// Pure evaluation pass: one check per account, cached (overwriting any
    /// prior check for the same account) for later inspection through
    /// [`Self::automation_status`].
    pub fn check_account_expirations(
        &self,
        accounts: &[Account],
        grace_period_days: u32,
    ) -> Vec<ExpirationCheck> {
        let checks: Vec<ExpirationCheck> = accounts
            .iter()
            .map(|account| self.evaluate(account, grace_period_days))
            .collect();
        let mut state = self.state.lock();
        for check in &checks {
            state.checks.insert(check.account_id.clone(), check.clone());
        }
        checks
    }

    /// Suspend every expired, currently active account through the hook.
    /// Per-account failures are caught, logged with status=failed, and
    /// never abort the remaining accounts.
    pub async fn process_expirations(
        &self,
        accounts: &[Account],
        grace_period_days: u32,
        hook: &dyn EnforcementHook,
    ) -> ExpirationSummary {
        let mut summary = ExpirationSummary::default();

        for account in accounts {
            summary.processed += 1;
            let check = self.evaluate(account, grace_period_days);
            self.state
                .lock()
                .checks
                .insert(account.id.clone(), check.clone());

            if !check.should_be_suspended {
                summary.skipped += 1;
                continue;
            }

            let now = self.clock.now_utc();
            match hook.suspend(&account.id, account).await {
                Ok(EnforcementOutcome::Applied) => {
                    summary.suspended += 1;
                    self.state.lock().log.push(AutomationLogEntry::new(
                        now,
                        &account.id,
                        AutomationAction::AutoSuspended,
                        ActionStatus::Success,
                        format!("{} day(s) past grace deadline", check.days_overdue),
                    ));
                    info!(account_id = %account.id, days_overdue = check.days_overdue, "account auto-suspended");
                    let event = LifecycleEvent::Suspended {
                        account_id: account.id.clone(),
                        days_overdue: check.days_overdue,
                    };
                    if let Err(err) = self.sink.lifecycle_event(&event).await {
                        warn!(account_id = %account.id, error = %err, "suspension notice delivery failed");
                    }
                }
                Ok(EnforcementOutcome::Rejected) => {
                    summary.failed += 1;
                    self.state.lock().log.push(AutomationLogEntry::new(
                        now,
                        &account.id,
                        AutomationAction::SuspendFailed,
                        ActionStatus::Failed,
                        "enforcement rejected the suspension",
                    ));
                    warn!(account_id = %account.id, "suspension rejected by enforcement");
                }
                Err(err) => {
                    summary.failed += 1;
                    self.state.lock().log.push(AutomationLogEntry::new(
                        now,
                        &account.id,
                        AutomationAction::SuspendFailed,
                        ActionStatus::Failed,
                        err.to_string(),
                    ));
                    warn!(account_id = %account.id, error = %err, "suspension failed");
                }
            }
        }

        summary
    }

    /// Handle a detected renewal for one account. With
    /// [`ResumePolicy::Enforce`] and a suspended/closed account, the hook
    /// runs and the outcome is logged `AUTO_RESUMED`/`RENEWAL_DETECTED`.
    /// With [`ResumePolicy::DecisionOnly`] the renewal is only recorded.
    pub async fn process_renewal(
        &self,
        account_id: &str,
        account: &Account,
        new_next_billing_date: NaiveDate,
        policy: ResumePolicy<'_>,
    ) -> RenewalOutcome {
        let resume_decided = matches!(
            account.status,
            AccountStatus::Suspended | AccountStatus::Closed
        );
        let now = self.clock.now_utc();

        let hook = match policy {
            ResumePolicy::Enforce(hook) if resume_decided => hook,
            _ => {
                self.state.lock().log.push(AutomationLogEntry::new(
                    now,
                    account_id,
                    AutomationAction::RenewalProcessed,
                    ActionStatus::Success,
                    format!(
                        "renewal recorded (status {}, next billing {new_next_billing_date}); no resume action attempted",
                        account.status
                    ),
                ));
                info!(account_id, "renewal recorded without resume action");
                return RenewalOutcome {
                    resume_decided,
                    resume_attempted: false,
                    resumed: false,
                    message: "renewal recorded; no resume action attempted".into(),
                };
            }
        };

        match hook.resume(account_id, account).await {
            Ok(EnforcementOutcome::Applied) => {
                self.state.lock().log.push(AutomationLogEntry::new(
                    now,
                    account_id,
                    AutomationAction::AutoResumed,
                    ActionStatus::Success,
                    format!("service resumed, next billing {new_next_billing_date}"),
                ));
                info!(account_id, %new_next_billing_date, "account auto-resumed");
                let event = LifecycleEvent::Resumed {
                    account_id: account_id.to_string(),
                    next_billing_date: new_next_billing_date,
                };
                if let Err(err) = self.sink.lifecycle_event(&event).await {
                    warn!(account_id, error = %err, "resume notice delivery failed");
                }
                RenewalOutcome {
                    resume_decided: true,
                    resume_attempted: true,
                    resumed: true,
                    message: "service resumed".into(),
                }
            }
            Ok(EnforcementOutcome::Rejected) => {
                self.state.lock().log.push(AutomationLogEntry::new(
                    now,
                    account_id,
                    AutomationAction::RenewalDetected,
                    ActionStatus::Failed,
                    "enforcement rejected the resume",
                ));
                warn!(account_id, "resume rejected by enforcement");
                RenewalOutcome {
                    resume_decided: true,
                    resume_attempted: true,
                    resumed: false,
                    message: "resume rejected by enforcement".into(),
                }
            }
            Err(err) => {
                self.state.lock().log.push(AutomationLogEntry::new(
                    now,
                    account_id,
                    AutomationAction::RenewalDetected,
                    ActionStatus::Failed,
                    err.to_string(),
                ));
                warn!(account_id, error = %err, "resume failed");
                RenewalOutcome {
                    resume_decided: true,
                    resume_attempted: true,
                    resumed: false,
                    message: format!("resume failed: {err}"),
                }
            }
        }
    }

    /// Heuristic diff over two snapshots of the same accounts. Flags an
    /// account when (a) its status moved from suspended/closed/paused to
    /// active, or (b) its balance or total paid increased while it stayed
    /// active. Advisory output only — no state is mutated.
    pub fn detect_renewals(
        &self,
        current: &[Account],
        previous: &[Account],
    ) -> Vec<RenewalCandidate> {
        let prior: HashMap<&str, &Account> =
            previous.iter().map(|a| (a.id.as_str(), a)).collect();

        let mut candidates = Vec::new();
        for account in current {
            let Some(before) = prior.get(account.id.as_str()) else {
                continue;
            };
            let signal = if before.status.is_resumable()
                && account.status == AccountStatus::Active
            {
                Some(RenewalSignal::StatusReactivated)
            } else if before.status == AccountStatus::Active
                && account.status == AccountStatus::Active
                && (account.balance > before.balance || account.total_paid > before.total_paid)
            {
                Some(RenewalSignal::PaymentObserved)
            } else {
                None
            };

            if let Some(signal) = signal {
                let now = self.clock.now_utc();
                self.state.lock().log.push(AutomationLogEntry::new(
                    now,
                    &account.id,
                    AutomationAction::RenewalDetected,
                    ActionStatus::Pending,
                    match signal {
                        RenewalSignal::StatusReactivated => {
                            format!("status moved {} -> active", before.status)
                        }
                        RenewalSignal::PaymentObserved => format!(
                            "payment observed (balance {:.2} -> {:.2}, total paid {:.2} -> {:.2})",
                            before.balance, account.balance, before.total_paid, account.total_paid
                        ),
                    },
                ));
                candidates.push(RenewalCandidate {
                    account_id: account.id.clone(),
                    signal,
                });
            }
        }
        candidates
    }

    /// Cached checks plus the recent log tail, for the admin view.
    pub fn automation_status(&self) -> AutomationStatus {
        let state = self.state.lock();
        let mut cached_checks: Vec<ExpirationCheck> = state.checks.values().cloned().collect();
        cached_checks.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        AutomationStatus {
            cached_checks,
            recent_log: state.log.tail(50),
            log_len: state.log.len(),
        }
    }

    /// Automation log snapshot, oldest first.
    pub fn log_entries(&self) -> Vec<AutomationLogEntry> {
        self.state.lock().log.entries()
    }

    /// Drop all log entries and cached checks (memory management hook).
    pub fn clear_logs(&self) {
        let mut state = self.state.lock();
        state.log.clear();
        state.checks.clear();
    }
}
