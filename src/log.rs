//! In-memory automation audit log.
//!
//! Both the billing scheduler and the expiration governor keep their own
//! [`AutomationLog`]: an append-only FIFO capped at
//! [`DEFAULT_LOG_CAPACITY`] entries (oldest evicted first). The log is the
//! admin-facing record of every automation decision; it is transient and
//! rebuilt on restart — the external billing system stays the system of
//! record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Default per-subsystem log cap.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// What an automation log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutomationAction {
    // Billing scheduler vocabulary.
    BillingScheduled,
    InvoiceGenerated,
    BillingFailed,
    BillingCancelled,
    OverdueProcessed,
    CreditsApplied,
    // Expiration governor vocabulary.
    AutoSuspended,
    SuspendFailed,
    AutoResumed,
    RenewalDetected,
    RenewalProcessed,
}

impl AutomationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BillingScheduled => "BILLING_SCHEDULED",
            Self::InvoiceGenerated => "INVOICE_GENERATED",
            Self::BillingFailed => "BILLING_FAILED",
            Self::BillingCancelled => "BILLING_CANCELLED",
            Self::OverdueProcessed => "OVERDUE_PROCESSED",
            Self::CreditsApplied => "CREDITS_APPLIED",
            Self::AutoSuspended => "AUTO_SUSPENDED",
            Self::SuspendFailed => "SUSPEND_FAILED",
            Self::AutoResumed => "AUTO_RESUMED",
            Self::RenewalDetected => "RENEWAL_DETECTED",
            Self::RenewalProcessed => "RENEWAL_PROCESSED",
        }
    }
}

/// Outcome attached to a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Pending,
    Failed,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }
}

/// One automation decision or outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationLogEntry {
    /// Row key for admin views.
    pub entry_id: Uuid,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Account the action concerns.
    pub account_id: String,
    pub action: AutomationAction,
    pub status: ActionStatus,
    /// Free-text detail (invoice id, error message, days overdue, ...).
    pub details: String,
}

impl AutomationLogEntry {
    pub fn new(
        timestamp: DateTime<Utc>,
        account_id: impl Into<String>,
        action: AutomationAction,
        status: ActionStatus,
        details: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            timestamp,
            account_id: account_id.into(),
            action,
            status,
            details: details.into(),
        }
    }
}

/// Bounded FIFO of [`AutomationLogEntry`] values.
#[derive(Debug)]
pub struct AutomationLog {
    entries: VecDeque<AutomationLogEntry>,
    capacity: usize,
}

impl AutomationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry, evicting the oldest if the cap is hit.
    pub fn push(&mut self, entry: AutomationLogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> Vec<AutomationLogEntry> {
        self.entries.iter().cloned().collect()
    }

    /// The most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<AutomationLogEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for AutomationLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(account: &str, details: &str) -> AutomationLogEntry {
        AutomationLogEntry::new(
            Utc::now(),
            account,
            AutomationAction::InvoiceGenerated,
            ActionStatus::Success,
            details,
        )
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut log = AutomationLog::new(3);
        for i in 0..5 {
            log.push(entry("acc-1", &format!("entry {i}")));
        }
        assert_eq!(log.len(), 3);
        let entries = log.entries();
        assert_eq!(entries[0].details, "entry 2");
        assert_eq!(entries[2].details, "entry 4");
    }

    #[test]
    fn tail_returns_most_recent() {
        let mut log = AutomationLog::new(10);
        for i in 0..6 {
            log.push(entry("acc-1", &format!("entry {i}")));
        }
        let tail = log.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].details, "entry 4");
        assert_eq!(tail[1].details, "entry 5");
    }

    #[test]
    fn action_serializes_screaming_snake() {
        let json = serde_json::to_string(&AutomationAction::AutoSuspended).unwrap();
        assert_eq!(json, "\"AUTO_SUSPENDED\"");
        assert_eq!(AutomationAction::AutoSuspended.as_str(), "AUTO_SUSPENDED");
    }

    #[test]
    fn clear_empties_log() {
        let mut log = AutomationLog::default();
        log.push(entry("acc-1", "x"));
        assert!(!log.is_empty());
        log.clear();
        assert!(log.is_empty());
    }
}
