//! Recurring billing cycle scheduling.
//!
//! Each scheduled account gets a one-shot deadline at local midnight on its
//! billing cycle day. When the deadline fires, the tick generates an invoice
//! and re-arms itself for the following cycle — a self-rescheduling one-shot
//! rather than a fixed-period repeat, because calendar months vary in
//! length.
//!
//! ## Design
//! - Cycle days past the end of a month clamp to that month's last day
//!   (day 31 bills on Feb 29 in a leap year).
//! - Invoice generation failure is logged (`BILLING_FAILED`) and returned
//!   as a structured outcome; the cycle still re-arms so the next month
//!   retries naturally.
//! - The batch reconciliation hooks (`process_overdue_invoices`,
//!   `auto_apply_credits`) isolate per-invoice failures.

use crate::clock::Clock;
use crate::config::AutomationConfig;
use crate::error::AutomationError;
use crate::log::{ActionStatus, AutomationAction, AutomationLog, AutomationLogEntry};
use crate::ports::{InvoiceGenerator, InvoiceStore, LifecycleEvent, NotificationSink};
use crate::scheduler::{TaskKey, TaskQueue};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

// ── Schedule types ───────────────────────────────────────────────

/// The live billing registration for one account. Superseded, never
/// duplicated, on reschedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingScheduleEntry {
    pub account_id: String,
    /// Next armed fire instant (UTC; local midnight in `timezone`).
    pub next_billing_date: DateTime<Utc>,
    /// Day of month the cycle bills on (1–31, clamped to month length).
    pub billing_cycle_day: u8,
    pub monthly_fee: f64,
    /// When false, the schedule is dropped after its next fire.
    pub auto_renew: bool,
    pub timezone: Tz,
}

/// Structured outcome of one billing cycle run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub success: bool,
    pub message: String,
    pub invoice_id: Option<String>,
}

/// Tally of one overdue-invoice reconciliation pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OverdueSummary {
    pub processed: usize,
    pub flagged: usize,
    pub failed: usize,
}

/// Outcome of applying an account's credit balance to unpaid invoices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditOutcome {
    pub success: bool,
    pub applied_total: f64,
    pub invoices_settled: usize,
    pub remaining_credit: f64,
    pub message: String,
}

// ── Cycle date math ──────────────────────────────────────────────

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Local midnight of `cycle_day` (clamped to the month's length) in `tz`,
/// as a UTC instant. Falls forward to 01:00 when a DST gap swallows
/// midnight.
fn local_midnight_on(tz: Tz, year: i32, month: u32, cycle_day: u8) -> Option<DateTime<Utc>> {
    let day = u32::from(cycle_day).min(last_day_of_month(year, month));
    let midnight = tz
        .with_ymd_and_hms(year, month, day, 0, 0, 0)
        .earliest()
        .or_else(|| tz.with_ymd_and_hms(year, month, day, 1, 0, 0).earliest())?;
    Some(midnight.with_timezone(&Utc))
}

/// Next occurrence of `cycle_day` strictly after `now`: this month's
/// occurrence if it has not passed yet, otherwise next month's.
pub fn next_cycle_instant(
    now: DateTime<Utc>,
    cycle_day: u8,
    tz: Tz,
) -> Result<DateTime<Utc>, AutomationError> {
    let local_now = now.with_timezone(&tz);
    let (mut year, mut month) = (local_now.year(), local_now.month());

    for _ in 0..2 {
        match local_midnight_on(tz, year, month, cycle_day) {
            Some(instant) if instant > now => return Ok(instant),
            Some(_) | None => {
                if month == 12 {
                    year += 1;
                    month = 1;
                } else {
                    month += 1;
                }
            }
        }
    }
    Err(AutomationError::validation(format!(
        "no upcoming occurrence of billing cycle day {cycle_day}"
    )))
}

// ── Scheduler ────────────────────────────────────────────────────

struct BillingState {
    schedules: HashMap<String, BillingScheduleEntry>,
    log: AutomationLog,
}

/// Arms and runs per-account recurring billing deadlines.
pub struct BillingScheduler {
    invoices: Arc<dyn InvoiceGenerator>,
    store: Arc<dyn InvoiceStore>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    queue: Arc<TaskQueue>,
    state: Mutex<BillingState>,
}

impl BillingScheduler {
    pub fn new(
        config: &AutomationConfig,
        invoices: Arc<dyn InvoiceGenerator>,
        store: Arc<dyn InvoiceStore>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            invoices,
            store,
            sink,
            clock,
            queue,
            state: Mutex::new(BillingState {
                schedules: HashMap::new(),
                log: AutomationLog::new(config.log_capacity),
            }),
        }
    }

    /// Arm the recurring billing deadline for an account. Returns the fire
    /// instant. Calling this again before the deadline fires is a no-op
    /// that returns the already-armed instant.
    pub fn schedule_billing(
        &self,
        account_id: &str,
        billing_cycle_day: u8,
        timezone: Tz,
        monthly_fee: f64,
        auto_renew: bool,
    ) -> Result<DateTime<Utc>, AutomationError> {
        if account_id.trim().is_empty() {
            return Err(AutomationError::validation("account id must not be empty"));
        }
        if !(1..=31).contains(&billing_cycle_day) {
            return Err(AutomationError::validation(format!(
                "billing_cycle_day must be 1-31, got {billing_cycle_day}"
            )));
        }
        if monthly_fee < 0.0 {
            return Err(AutomationError::validation(
                "monthly_fee must not be negative",
            ));
        }

        let now = self.clock.now_utc();
        let fire_at = next_cycle_instant(now, billing_cycle_day, timezone)?;

        let mut state = self.state.lock();
        if let Some(existing) = state.schedules.get(account_id) {
            return Ok(existing.next_billing_date);
        }
        state.schedules.insert(
            account_id.to_string(),
            BillingScheduleEntry {
                account_id: account_id.to_string(),
                next_billing_date: fire_at,
                billing_cycle_day,
                monthly_fee,
                auto_renew,
                timezone,
            },
        );
        state.log.push(AutomationLogEntry::new(
            now,
            account_id,
            AutomationAction::BillingScheduled,
            ActionStatus::Pending,
            format!("next cycle at {fire_at} (day {billing_cycle_day}, {timezone})"),
        ));
        drop(state);

        self.queue.arm(TaskKey::billing(account_id), fire_at);
        info!(account_id, %fire_at, billing_cycle_day, "billing scheduled");
        Ok(fire_at)
    }

    /// Run one billing cycle: generate the invoice and log the outcome.
    /// Never panics or propagates the generator error.
    pub async fn process_billing_cycle(&self, account_id: &str) -> CycleOutcome {
        let now = self.clock.now_utc();
        match self.invoices.generate(account_id).await {
            Ok(invoice_id) => {
                self.state.lock().log.push(AutomationLogEntry::new(
                    now,
                    account_id,
                    AutomationAction::InvoiceGenerated,
                    ActionStatus::Success,
                    format!("invoice {invoice_id}"),
                ));
                info!(account_id, invoice_id, "invoice generated");
                let event = LifecycleEvent::InvoiceIssued {
                    account_id: account_id.to_string(),
                    invoice_id: invoice_id.clone(),
                };
                if let Err(err) = self.sink.lifecycle_event(&event).await {
                    warn!(account_id, error = %err, "invoice notification delivery failed");
                }
                CycleOutcome {
                    success: true,
                    message: format!("invoice {invoice_id} generated"),
                    invoice_id: Some(invoice_id),
                }
            }
            Err(err) => {
                self.state.lock().log.push(AutomationLogEntry::new(
                    now,
                    account_id,
                    AutomationAction::BillingFailed,
                    ActionStatus::Failed,
                    err.to_string(),
                ));
                warn!(account_id, error = %err, "billing cycle failed");
                CycleOutcome {
                    success: false,
                    message: format!("invoice generation failed: {err}"),
                    invoice_id: None,
                }
            }
        }
    }

    /// Engine driver tick: run the cycle, then re-arm for the following
    /// cycle (or drop the schedule when auto-renew is off).
    pub(crate) async fn run_billing_tick(&self, account_id: &str) {
        self.process_billing_cycle(account_id).await;

        let now = self.clock.now_utc();
        let mut state = self.state.lock();
        let Some(entry) = state.schedules.get(account_id).cloned() else {
            return;
        };
        if !entry.auto_renew {
            state.schedules.remove(account_id);
            info!(account_id, "billing schedule completed (auto_renew off)");
            return;
        }
        match next_cycle_instant(now, entry.billing_cycle_day, entry.timezone) {
            Ok(next) => {
                if let Some(live) = state.schedules.get_mut(account_id) {
                    live.next_billing_date = next;
                }
                let day = entry.billing_cycle_day;
                state.log.push(AutomationLogEntry::new(
                    now,
                    account_id,
                    AutomationAction::BillingScheduled,
                    ActionStatus::Pending,
                    format!("rescheduled: next cycle at {next}"),
                ));
                drop(state);
                self.queue.rearm(TaskKey::billing(account_id), next);
                info!(account_id, %next, day, "billing cycle re-armed");
            }
            Err(err) => {
                state.schedules.remove(account_id);
                warn!(account_id, error = %err, "could not re-arm billing cycle");
            }
        }
    }

    /// Cancel the armed billing deadline. After this returns, no further
    /// billing tick for the account runs. No-op if nothing is armed.
    pub async fn cancel_billing(&self, account_id: &str) -> bool {
        self.queue.cancel(&TaskKey::billing(account_id)).await;
        let now = self.clock.now_utc();
        let mut state = self.state.lock();
        let removed = state.schedules.remove(account_id).is_some();
        if removed {
            state.log.push(AutomationLogEntry::new(
                now,
                account_id,
                AutomationAction::BillingCancelled,
                ActionStatus::Success,
                "billing schedule cancelled",
            ));
            info!(account_id, "billing cancelled");
        }
        removed
    }

    // ── Batch reconciliation hooks ───────────────────────────────

    /// Flag invoices unpaid for more than `overdue_days` as overdue.
    /// Per-invoice failures are isolated and tallied.
    pub async fn process_overdue_invoices(&self, overdue_days: u32) -> OverdueSummary {
        let overdue = match self.store.list_overdue(overdue_days).await {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "overdue invoice listing failed");
                return OverdueSummary::default();
            }
        };

        let mut summary = OverdueSummary::default();
        for invoice in &overdue {
            summary.processed += 1;
            let now = self.clock.now_utc();
            match self.store.mark_overdue(&invoice.invoice_id).await {
                Ok(()) => {
                    summary.flagged += 1;
                    self.state.lock().log.push(AutomationLogEntry::new(
                        now,
                        &invoice.account_id,
                        AutomationAction::OverdueProcessed,
                        ActionStatus::Success,
                        format!(
                            "invoice {} overdue since {} ({:.2} due)",
                            invoice.invoice_id, invoice.due_date, invoice.amount_due
                        ),
                    ));
                }
                Err(err) => {
                    summary.failed += 1;
                    self.state.lock().log.push(AutomationLogEntry::new(
                        now,
                        &invoice.account_id,
                        AutomationAction::OverdueProcessed,
                        ActionStatus::Failed,
                        format!("invoice {}: {err}", invoice.invoice_id),
                    ));
                    warn!(invoice_id = %invoice.invoice_id, error = %err, "overdue flag failed");
                }
            }
        }
        summary
    }

    /// Apply the account's available credit balance to its unpaid invoices,
    /// oldest due date first.
    pub async fn auto_apply_credits(&self, account_id: &str) -> CreditOutcome {
        let fail = |message: String| CreditOutcome {
            success: false,
            applied_total: 0.0,
            invoices_settled: 0,
            remaining_credit: 0.0,
            message,
        };

        let mut credit = match self.store.credit_balance(account_id).await {
            Ok(balance) => balance,
            Err(err) => return fail(format!("credit balance lookup failed: {err}")),
        };
        if credit <= 0.0 {
            return CreditOutcome {
                success: true,
                applied_total: 0.0,
                invoices_settled: 0,
                remaining_credit: credit.max(0.0),
                message: "no credit available".into(),
            };
        }

        let unpaid = match self.store.unpaid_invoices(account_id).await {
            Ok(list) => list,
            Err(err) => return fail(format!("unpaid invoice lookup failed: {err}")),
        };

        let mut applied_total = 0.0;
        let mut settled = 0;
        for invoice in &unpaid {
            if credit <= f64::EPSILON {
                break;
            }
            let portion = credit.min(invoice.amount_due);
            match self.store.apply_credit(&invoice.invoice_id, portion).await {
                Ok(applied) => {
                    credit -= applied;
                    applied_total += applied;
                    if applied >= invoice.amount_due {
                        settled += 1;
                    }
                }
                Err(err) => {
                    // Isolated: remaining invoices still get a chance.
                    warn!(invoice_id = %invoice.invoice_id, error = %err, "credit application failed");
                }
            }
        }

        let now = self.clock.now_utc();
        self.state.lock().log.push(AutomationLogEntry::new(
            now,
            account_id,
            AutomationAction::CreditsApplied,
            ActionStatus::Success,
            format!("applied {applied_total:.2} across {settled} settled invoice(s)"),
        ));
        CreditOutcome {
            success: true,
            applied_total,
            invoices_settled: settled,
            remaining_credit: credit,
            message: format!("applied {applied_total:.2}, {credit:.2} credit remaining"),
        }
    }

    // ── Read accessors ───────────────────────────────────────────

    /// The live schedule entry for an account, if any.
    pub fn schedule_for(&self, account_id: &str) -> Option<BillingScheduleEntry> {
        self.state.lock().schedules.get(account_id).cloned()
    }

    /// Automation log snapshot, oldest first.
    pub fn log_entries(&self) -> Vec<AutomationLogEntry> {
        self.state.lock().log.entries()
    }
}
