//! Subscriber account view shared by all automation components.
//!
//! The account record is owned by the external repository. This crate only
//! reads its fields and requests status/date mutations through injected
//! callbacks (see [`crate::ports`]) — it never writes an account directly.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Service status of a subscriber account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    /// Service is up; the account is billable and monitorable.
    Active,
    /// Service disabled by automation or an operator (non-payment, abuse).
    Suspended,
    /// Account terminated; only an explicit resume action reopens it.
    Closed,
    /// Voluntarily on hold (e.g. customer travelling); not billed.
    Paused,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Closed => "closed",
            Self::Paused => "paused",
        }
    }

    /// Statuses a detected renewal can bring back to [`Active`](Self::Active).
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Suspended | Self::Closed | Self::Paused)
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-mostly view of a subscriber account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Repository identifier.
    pub id: String,
    /// Human-facing account number (printed on invoices).
    pub account_number: String,
    /// Customer display name.
    pub customer_name: String,
    /// Customer phone in E.164 form (SMS/WhatsApp delivery target).
    pub customer_phone: String,
    /// Current service status.
    pub status: AccountStatus,
    /// Recurring fee charged each billing cycle.
    pub monthly_fee: f64,
    /// Data ceiling per billing period in GB; `None` means unmetered.
    pub data_quota_gb: Option<f64>,
    /// Due date of the next (or most recently missed) invoice.
    pub next_billing_date: NaiveDate,
    /// Current balance (credit if positive).
    pub balance: f64,
    /// Lifetime total paid.
    pub total_paid: f64,
    /// Sum of unpaid invoice amounts.
    pub outstanding_balance: f64,
}

impl Account {
    /// Data quota converted to MB, the unit usage samples report in.
    pub fn quota_mb(&self) -> Option<f64> {
        self.data_quota_gb.map(|gb| gb * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_serde() {
        for status in [
            AccountStatus::Active,
            AccountStatus::Suspended,
            AccountStatus::Closed,
            AccountStatus::Paused,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            let back: AccountStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn resumable_statuses() {
        assert!(!AccountStatus::Active.is_resumable());
        assert!(AccountStatus::Suspended.is_resumable());
        assert!(AccountStatus::Closed.is_resumable());
        assert!(AccountStatus::Paused.is_resumable());
    }

    #[test]
    fn quota_gb_to_mb() {
        let account = Account {
            id: "acc-1".into(),
            account_number: "NV-0001".into(),
            customer_name: "Test Customer".into(),
            customer_phone: "+254700000001".into(),
            status: AccountStatus::Active,
            monthly_fee: 2_500.0,
            data_quota_gb: Some(10.0),
            next_billing_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            balance: 0.0,
            total_paid: 0.0,
            outstanding_balance: 0.0,
        };
        assert_eq!(account.quota_mb(), Some(10_240.0));
    }
}
