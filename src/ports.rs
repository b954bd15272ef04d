//! Collaborator ports.
//!
//! Everything outside the automation engine — the account repository, the
//! network-device usage source, the invoice system, the enforcement RPC
//! (PPPoE secret enable/disable), and the notification gateway — is reached
//! through these traits. Concrete backends live in the embedding
//! application; tests substitute hand-rolled doubles at the same seams.
//!
//! All methods return `anyhow::Result`: transient I/O failures are expected
//! and are consumed (logged, tallied) at the call site, never propagated out
//! of the engine.

use crate::account::Account;
use crate::usage::QuotaAlert;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ── Account repository ───────────────────────────────────────────

/// External system of record for accounts. Per-record updates are atomic;
/// the engine never assumes cross-account transactions.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn get(&self, account_id: &str) -> anyhow::Result<Account>;
    async fn list(&self) -> anyhow::Result<Vec<Account>>;
    async fn update_status(
        &self,
        account_id: &str,
        status: crate::account::AccountStatus,
    ) -> anyhow::Result<()>;
    async fn update_billing_date(
        &self,
        account_id: &str,
        next_billing_date: NaiveDate,
    ) -> anyhow::Result<()>;
}

// ── Usage source ─────────────────────────────────────────────────

/// One bandwidth reading from the usage source (e.g. a RouterOS client).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageReading {
    /// Instantaneous download rate.
    pub download_mbps: f64,
    /// Instantaneous upload rate.
    pub upload_mbps: f64,
    /// Cumulative download for the current day, in MB.
    pub total_download_mb: f64,
    /// Cumulative upload for the current day, in MB.
    pub total_upload_mb: f64,
}

/// Produces bandwidth readings for an account. Transient I/O errors are
/// expected; the monitor retries on the next sampling tick.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn sample(&self, account_id: &str) -> anyhow::Result<UsageReading>;
}

// ── Invoice system ───────────────────────────────────────────────

/// Creates an invoice for an account's current billing cycle.
#[async_trait]
pub trait InvoiceGenerator: Send + Sync {
    /// Returns the new invoice id.
    async fn generate(&self, account_id: &str) -> anyhow::Result<String>;
}

/// A not-yet-settled invoice as seen by the reconciliation hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpaidInvoice {
    pub invoice_id: String,
    pub account_id: String,
    pub amount_due: f64,
    pub due_date: NaiveDate,
}

/// Read/write access to the external invoice and payment store, used only
/// by the batch reconciliation hooks (`process_overdue_invoices`,
/// `auto_apply_credits`).
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Unpaid invoices whose due date is more than `overdue_days` ago.
    async fn list_overdue(&self, overdue_days: u32) -> anyhow::Result<Vec<UnpaidInvoice>>;

    /// Flag an invoice as overdue (triggers dunning in the billing system).
    async fn mark_overdue(&self, invoice_id: &str) -> anyhow::Result<()>;

    /// Available credit balance for an account.
    async fn credit_balance(&self, account_id: &str) -> anyhow::Result<f64>;

    /// Unpaid invoices for one account, oldest due date first.
    async fn unpaid_invoices(&self, account_id: &str) -> anyhow::Result<Vec<UnpaidInvoice>>;

    /// Apply `amount` of credit to an invoice; returns the amount actually
    /// applied (may be less if the invoice settled concurrently).
    async fn apply_credit(&self, invoice_id: &str, amount: f64) -> anyhow::Result<f64>;
}

// ── Enforcement ──────────────────────────────────────────────────

/// Result of a real-world enforcement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementOutcome {
    /// The device-side action took effect.
    Applied,
    /// The device reported the action did not take effect. Distinct in the
    /// logs from "no action attempted".
    Rejected,
}

/// Caller-injected strategy that performs the real-world side of a
/// suspend/resume decision (typically toggling a PPPoE secret). `Rejected`
/// or an `Err` both mean the action did not take effect even though policy
/// decided it should.
#[async_trait]
pub trait EnforcementHook: Send + Sync {
    async fn suspend(
        &self,
        account_id: &str,
        account: &Account,
    ) -> anyhow::Result<EnforcementOutcome>;

    async fn resume(
        &self,
        account_id: &str,
        account: &Account,
    ) -> anyhow::Result<EnforcementOutcome>;
}

// ── Notifications ────────────────────────────────────────────────

/// Lifecycle event handed to the notification gateway for templated
/// SMS/chat delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    InvoiceIssued {
        account_id: String,
        invoice_id: String,
    },
    Suspended {
        account_id: String,
        days_overdue: i64,
    },
    Resumed {
        account_id: String,
        next_billing_date: NaiveDate,
    },
}

/// Delivery gateway for alerts and lifecycle events. Delivery failure never
/// rolls back the state decision that produced the message — callers log
/// the error and move on.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn quota_alert(&self, alert: &QuotaAlert) -> anyhow::Result<()>;
    async fn lifecycle_event(&self, event: &LifecycleEvent) -> anyhow::Result<()>;
}

/// Sink that drops every message. Useful for backends that run the
/// automation decisions without customer messaging.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotificationSink;

#[async_trait]
impl NotificationSink for NullNotificationSink {
    async fn quota_alert(&self, _alert: &QuotaAlert) -> anyhow::Result<()> {
        Ok(())
    }

    async fn lifecycle_event(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
        Ok(())
    }
}
