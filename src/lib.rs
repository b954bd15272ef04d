//! netvigil — account lifecycle automation for ISP subscriber management.
//!
//! Three peer components operate over the same read-mostly [`Account`]
//! entity, none talking to the others directly:
//!
//! - [`UsageMonitor`](usage::UsageMonitor): samples bandwidth against data
//!   quotas, keeps a bounded 24h rolling history, and raises at most one
//!   live quota alert per account.
//! - [`BillingScheduler`](billing::BillingScheduler): arms a
//!   self-rescheduling one-shot deadline per account that fires at local
//!   midnight on the configured billing cycle day and generates an invoice.
//! - [`ExpirationGovernor`](expiration::ExpirationGovernor): decides
//!   suspensions once an account is past its billing date plus grace
//!   period, and handles renewals that should resume service.
//!
//! Everything outside the engine — the account repository, the usage
//! source, the invoice system, enforcement (PPPoE secret toggling), and
//! notifications — is injected through the traits in [`ports`]. All timers
//! live in one shared min-heap [`scheduler::TaskQueue`] driven by a single
//! loop in [`engine::AutomationEngine::run`]; tests drive the same code
//! paths with a [`clock::ManualClock`] instead of real timers.

pub mod account;
pub mod billing;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod expiration;
pub mod log;
pub mod ports;
pub mod scheduler;
pub mod usage;

pub use account::{Account, AccountStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AutomationConfig;
pub use engine::{AutomationEngine, Collaborators};
pub use error::AutomationError;
pub use log::{ActionStatus, AutomationAction, AutomationLog, AutomationLogEntry};
pub use ports::{
    AccountRepository, EnforcementHook, EnforcementOutcome, InvoiceGenerator, InvoiceStore,
    LifecycleEvent, NotificationSink, NullNotificationSink, UnpaidInvoice, UsageReading,
    UsageSource,
};
