//! Bandwidth usage monitoring against data quotas.
//!
//! The monitor keeps a bounded 24h rolling sample history per account and
//! at most one live quota alert per account. Sampling timers live in the
//! shared [`TaskQueue`]; the engine driver calls back into
//! [`UsageMonitor::check_account_usage`] on each tick and re-arms the task.
//!
//! ## Design
//! - Usage-source errors are caught per tick: the tick yields `None`, the
//!   timer stays armed, and the next tick retries naturally.
//! - Threshold evaluation replaces the prior alert for the account; an
//!   evaluation below the warning threshold clears it.
//! - Read-side reductions return zero-valued results (not errors) when the
//!   history window is empty.

use crate::clock::Clock;
use crate::config::AutomationConfig;
use crate::error::AutomationError;
use crate::ports::{NotificationSink, UsageSource};
use crate::scheduler::{TaskKey, TaskQueue};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Alert types ──────────────────────────────────────────────────

/// Severity of a quota alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational notice (not raised by threshold evaluation).
    Info,
    /// Usage at or past the warning threshold (default 80%).
    Warning,
    /// Usage at or past the quota (default 100%).
    Critical,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// The single live quota alert for an account. Each threshold evaluation
/// replaces the previous alert rather than appending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaAlert {
    pub account_id: String,
    pub current_usage_mb: f64,
    pub quota_mb: f64,
    pub percentage_used: f64,
    pub alert_level: AlertLevel,
    pub timestamp: DateTime<Utc>,
}

// ── Sample types ─────────────────────────────────────────────────

/// One bandwidth sample retained in the rolling history window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSample {
    pub account_id: String,
    pub timestamp: DateTime<Utc>,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    /// Cumulative download for the day at capture time, in MB.
    pub cumulative_download_mb: f64,
    /// Cumulative upload for the day at capture time, in MB.
    pub cumulative_upload_mb: f64,
    /// Quota standing at capture time: "normal", "warning" or "critical".
    pub status: String,
}

/// Busiest moment in the inspected window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeakUsage {
    /// When the peak occurred; `None` when the window is empty.
    pub timestamp: Option<DateTime<Utc>>,
    /// Combined download+upload rate at the peak.
    pub peak_mbps: f64,
    pub sample_count: usize,
}

/// Mean rates over the inspected window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AverageUsage {
    pub avg_download_mbps: f64,
    pub avg_upload_mbps: f64,
    /// Latest cumulative day total (download+upload) seen in the window.
    pub total_mb: f64,
    pub sample_count: usize,
}

/// Sampling registration for one account.
#[derive(Debug, Clone, Copy)]
pub struct SamplingPlan {
    pub quota_mb: Option<f64>,
    pub interval: std::time::Duration,
}

#[derive(Default)]
struct MonitorState {
    plans: HashMap<String, SamplingPlan>,
    history: HashMap<String, VecDeque<UsageSample>>,
    alerts: HashMap<String, QuotaAlert>,
}

// ── Monitor ──────────────────────────────────────────────────────

/// Per-account bandwidth monitor with quota alerting.
pub struct UsageMonitor {
    source: Arc<dyn UsageSource>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    queue: Arc<TaskQueue>,
    warning_pct: f64,
    critical_pct: f64,
    history_window: Duration,
    state: Mutex<MonitorState>,
}

impl UsageMonitor {
    pub fn new(
        config: &AutomationConfig,
        source: Arc<dyn UsageSource>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            source,
            sink,
            clock,
            queue,
            warning_pct: config.warning_threshold_pct,
            critical_pct: config.critical_threshold_pct,
            history_window: Duration::hours(i64::from(config.usage_history_hours)),
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Register a repeating sampling task for the account. Idempotent:
    /// returns `Ok(false)` without touching the existing timer when the
    /// account is already monitored.
    pub fn start_monitoring(
        &self,
        account_id: &str,
        quota_mb: Option<f64>,
        interval: std::time::Duration,
    ) -> Result<bool, AutomationError> {
        if account_id.trim().is_empty() {
            return Err(AutomationError::validation("account id must not be empty"));
        }
        if interval.is_zero() {
            return Err(AutomationError::validation(
                "sampling interval must be non-zero",
            ));
        }
        if let Some(quota) = quota_mb {
            if quota <= 0.0 {
                return Err(AutomationError::validation("quota_mb must be positive"));
            }
        }

        {
            let mut state = self.state.lock();
            if state.plans.contains_key(account_id) {
                debug!(account_id, "already monitored; start_monitoring is a no-op");
                return Ok(false);
            }
            state
                .plans
                .insert(account_id.to_string(), SamplingPlan { quota_mb, interval });
        }

        let first_tick = self.clock.now_utc()
            + Duration::from_std(interval).unwrap_or_else(|_| Duration::seconds(1));
        self.queue.arm(TaskKey::usage(account_id), first_tick);
        info!(account_id, interval_secs = interval.as_secs(), "usage monitoring started");
        Ok(true)
    }

    /// Cancel the account's sampling task. After this returns, no further
    /// sampling tick for the account runs. No-op if not monitored.
    pub async fn stop_monitoring(&self, account_id: &str) -> bool {
        self.queue.cancel(&TaskKey::usage(account_id)).await;
        let removed = self.state.lock().plans.remove(account_id).is_some();
        if removed {
            info!(account_id, "usage monitoring stopped");
        }
        removed
    }

    /// Fetch one sample, append it to the rolling history, and evaluate
    /// quota thresholds. Returns `None` (logged, not propagated) when the
    /// usage source fails; the timer is untouched and the next tick retries.
    pub async fn check_account_usage(
        &self,
        account_id: &str,
        quota_mb: Option<f64>,
    ) -> Option<UsageSample> {
        let reading = match self.source.sample(account_id).await {
            Ok(reading) => reading,
            Err(err) => {
                warn!(account_id, error = %err, "usage sample fetch failed");
                return None;
            }
        };

        let now = self.clock.now_utc();
        let used_mb = reading.total_download_mb + reading.total_upload_mb;
        let level = quota_mb.filter(|q| *q > 0.0).and_then(|quota| {
            let pct = used_mb / quota * 100.0;
            if pct >= self.critical_pct {
                Some((AlertLevel::Critical, pct, quota))
            } else if pct >= self.warning_pct {
                Some((AlertLevel::Warning, pct, quota))
            } else {
                None
            }
        });

        let sample = UsageSample {
            account_id: account_id.to_string(),
            timestamp: now,
            download_mbps: reading.download_mbps,
            upload_mbps: reading.upload_mbps,
            cumulative_download_mb: reading.total_download_mb,
            cumulative_upload_mb: reading.total_upload_mb,
            status: match level {
                Some((AlertLevel::Critical, ..)) => "critical".into(),
                Some((AlertLevel::Warning, ..)) => "warning".into(),
                _ => "normal".into(),
            },
        };

        let alert = {
            let mut state = self.state.lock();
            let history = state.history.entry(account_id.to_string()).or_default();
            history.push_back(sample.clone());
            let cutoff = now - self.history_window;
            while history.front().is_some_and(|s| s.timestamp < cutoff) {
                history.pop_front();
            }

            match level {
                Some((alert_level, percentage_used, quota)) => {
                    let alert = QuotaAlert {
                        account_id: account_id.to_string(),
                        current_usage_mb: used_mb,
                        quota_mb: quota,
                        percentage_used,
                        alert_level,
                        timestamp: now,
                    };
                    // Replaces any prior alert for this account.
                    state.alerts.insert(account_id.to_string(), alert.clone());
                    Some(alert)
                }
                None => {
                    state.alerts.remove(account_id);
                    None
                }
            }
        };

        if let Some(alert) = alert {
            info!(
                account_id,
                level = alert.alert_level.as_str(),
                pct = alert.percentage_used,
                "quota alert raised"
            );
            if let Err(err) = self.sink.quota_alert(&alert).await {
                warn!(account_id, error = %err, "quota alert delivery failed");
            }
        }

        Some(sample)
    }

    // ── Read-side reductions ─────────────────────────────────────

    /// Samples within the last `hours`, oldest first.
    pub fn usage_history(&self, account_id: &str, hours: u32) -> Vec<UsageSample> {
        let cutoff = self.clock.now_utc() - Duration::hours(i64::from(hours));
        self.state
            .lock()
            .history
            .get(account_id)
            .map(|h| h.iter().filter(|s| s.timestamp >= cutoff).cloned().collect())
            .unwrap_or_default()
    }

    /// Moment of highest combined throughput in the window. Zero-valued
    /// when no samples exist.
    pub fn peak_usage_time(&self, account_id: &str, hours: u32) -> PeakUsage {
        let samples = self.usage_history(account_id, hours);
        let mut peak = PeakUsage {
            sample_count: samples.len(),
            ..PeakUsage::default()
        };
        for sample in &samples {
            let combined = sample.download_mbps + sample.upload_mbps;
            if combined > peak.peak_mbps || peak.timestamp.is_none() {
                peak.peak_mbps = combined;
                peak.timestamp = Some(sample.timestamp);
            }
        }
        peak
    }

    /// Mean rates over the window. Zero-valued when no samples exist.
    pub fn average_usage(&self, account_id: &str, hours: u32) -> AverageUsage {
        let samples = self.usage_history(account_id, hours);
        if samples.is_empty() {
            return AverageUsage::default();
        }
        let n = samples.len() as f64;
        AverageUsage {
            avg_download_mbps: samples.iter().map(|s| s.download_mbps).sum::<f64>() / n,
            avg_upload_mbps: samples.iter().map(|s| s.upload_mbps).sum::<f64>() / n,
            total_mb: samples
                .last()
                .map(|s| s.cumulative_download_mb + s.cumulative_upload_mb)
                .unwrap_or(0.0),
            sample_count: samples.len(),
        }
    }

    /// The live alert for an account, if one exists.
    pub fn active_alert(&self, account_id: &str) -> Option<QuotaAlert> {
        self.state.lock().alerts.get(account_id).cloned()
    }

    pub fn is_monitoring(&self, account_id: &str) -> bool {
        self.state.lock().plans.contains_key(account_id)
    }

    /// Account ids currently registered for sampling.
    pub fn monitored_accounts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().plans.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Registration details for the engine driver tick.
    pub(crate) fn sampling_plan(&self, account_id: &str) -> Option<SamplingPlan> {
        self.state.lock().plans.get(account_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ports::{LifecycleEvent, NullNotificationSink, UsageReading};
    use async_trait::async_trait;
    use std::time::Duration as StdDuration;

    /// Scripted usage source: pops one result per sample() call.
    struct ScriptedSource {
        readings: Mutex<VecDeque<anyhow::Result<UsageReading>>>,
    }

    impl ScriptedSource {
        fn new(readings: Vec<anyhow::Result<UsageReading>>) -> Self {
            Self {
                readings: Mutex::new(readings.into()),
            }
        }
    }

    #[async_trait]
    impl UsageSource for ScriptedSource {
        async fn sample(&self, _account_id: &str) -> anyhow::Result<UsageReading> {
            self.readings
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted")))
        }
    }

    /// Sink whose deliveries always fail.
    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn quota_alert(&self, _alert: &QuotaAlert) -> anyhow::Result<()> {
            anyhow::bail!("sms gateway unreachable")
        }

        async fn lifecycle_event(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
            anyhow::bail!("sms gateway unreachable")
        }
    }

    fn reading(total_down_mb: f64, total_up_mb: f64) -> anyhow::Result<UsageReading> {
        Ok(UsageReading {
            download_mbps: 20.0,
            upload_mbps: 5.0,
            total_download_mb: total_down_mb,
            total_upload_mb: total_up_mb,
        })
    }

    fn monitor_with(
        source: ScriptedSource,
        clock: Arc<ManualClock>,
    ) -> UsageMonitor {
        UsageMonitor::new(
            &AutomationConfig::default(),
            Arc::new(source),
            Arc::new(NullNotificationSink),
            clock,
            Arc::new(TaskQueue::new()),
        )
    }

    #[test]
    fn start_monitoring_is_idempotent() {
        let clock = Arc::new(ManualClock::at("2024-01-15T10:00:00Z"));
        let monitor = monitor_with(ScriptedSource::new(vec![]), clock);

        let first = monitor
            .start_monitoring("acc-1", Some(1000.0), StdDuration::from_secs(300))
            .unwrap();
        assert!(first);
        let second = monitor
            .start_monitoring("acc-1", Some(1000.0), StdDuration::from_secs(60))
            .unwrap();
        assert!(!second);
        // The original plan is untouched.
        assert_eq!(
            monitor.sampling_plan("acc-1").unwrap().interval,
            StdDuration::from_secs(300)
        );
    }

    #[test]
    fn start_monitoring_rejects_bad_input() {
        let clock = Arc::new(ManualClock::at("2024-01-15T10:00:00Z"));
        let monitor = monitor_with(ScriptedSource::new(vec![]), clock);

        assert!(monitor
            .start_monitoring("  ", None, StdDuration::from_secs(60))
            .is_err());
        assert!(monitor
            .start_monitoring("acc-1", None, StdDuration::ZERO)
            .is_err());
        assert!(monitor
            .start_monitoring("acc-1", Some(-5.0), StdDuration::from_secs(60))
            .is_err());
        assert!(!monitor.is_monitoring("acc-1"));
    }

    #[tokio::test]
    async fn stop_monitoring_twice_is_safe() {
        let clock = Arc::new(ManualClock::at("2024-01-15T10:00:00Z"));
        let monitor = monitor_with(ScriptedSource::new(vec![]), clock);

        monitor
            .start_monitoring("acc-1", None, StdDuration::from_secs(300))
            .unwrap();
        monitor
            .start_monitoring("acc-2", None, StdDuration::from_secs(300))
            .unwrap();

        assert!(monitor.stop_monitoring("acc-1").await);
        assert!(!monitor.stop_monitoring("acc-1").await);
        // Other account's registration is unaffected.
        assert!(monitor.is_monitoring("acc-2"));
    }

    #[tokio::test]
    async fn alert_sequence_none_warning_critical() {
        // Quota 1000 MB; cumulative usage 700 -> 850 -> 1050.
        let clock = Arc::new(ManualClock::at("2024-01-15T10:00:00Z"));
        let source = ScriptedSource::new(vec![
            reading(600.0, 100.0),
            reading(700.0, 150.0),
            reading(850.0, 200.0),
        ]);
        let monitor = monitor_with(source, Arc::clone(&clock));

        monitor.check_account_usage("acc-1", Some(1000.0)).await;
        assert!(monitor.active_alert("acc-1").is_none());

        clock.advance(Duration::minutes(5));
        monitor.check_account_usage("acc-1", Some(1000.0)).await;
        let alert = monitor.active_alert("acc-1").unwrap();
        assert_eq!(alert.alert_level, AlertLevel::Warning);
        assert_eq!(alert.current_usage_mb, 850.0);

        clock.advance(Duration::minutes(5));
        monitor.check_account_usage("acc-1", Some(1000.0)).await;
        let alert = monitor.active_alert("acc-1").unwrap();
        assert_eq!(alert.alert_level, AlertLevel::Critical);
        assert!(alert.percentage_used >= 100.0);
    }

    #[tokio::test]
    async fn below_threshold_clears_prior_alert() {
        // A new day resets cumulative counters; the warning must clear.
        let clock = Arc::new(ManualClock::at("2024-01-15T23:55:00Z"));
        let source = ScriptedSource::new(vec![reading(800.0, 100.0), reading(10.0, 2.0)]);
        let monitor = monitor_with(source, Arc::clone(&clock));

        monitor.check_account_usage("acc-1", Some(1000.0)).await;
        assert!(monitor.active_alert("acc-1").is_some());

        clock.advance(Duration::minutes(10));
        monitor.check_account_usage("acc-1", Some(1000.0)).await;
        assert!(monitor.active_alert("acc-1").is_none());
    }

    #[tokio::test]
    async fn sink_failure_keeps_sample_and_alert() {
        // 950/1000 MB trips the warning; delivery failure must not roll
        // back the evaluation or swallow the sample.
        let clock = Arc::new(ManualClock::at("2024-01-15T10:00:00Z"));
        let monitor = UsageMonitor::new(
            &AutomationConfig::default(),
            Arc::new(ScriptedSource::new(vec![reading(900.0, 50.0)])),
            Arc::new(FailingSink),
            clock,
            Arc::new(TaskQueue::new()),
        );

        let sample = monitor.check_account_usage("acc-1", Some(1000.0)).await;
        assert!(sample.is_some());
        let alert = monitor.active_alert("acc-1").unwrap();
        assert_eq!(alert.alert_level, AlertLevel::Warning);
        assert_eq!(monitor.usage_history("acc-1", 24).len(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_returns_none_and_keeps_history() {
        let clock = Arc::new(ManualClock::at("2024-01-15T10:00:00Z"));
        let source = ScriptedSource::new(vec![
            reading(100.0, 10.0),
            Err(anyhow::anyhow!("router unreachable")),
            reading(120.0, 12.0),
        ]);
        let monitor = monitor_with(source, Arc::clone(&clock));

        assert!(monitor.check_account_usage("acc-1", None).await.is_some());
        assert!(monitor.check_account_usage("acc-1", None).await.is_none());
        assert!(monitor.check_account_usage("acc-1", None).await.is_some());
        assert_eq!(monitor.usage_history("acc-1", 24).len(), 2);
    }

    #[tokio::test]
    async fn history_prunes_past_24h_window() {
        let clock = Arc::new(ManualClock::at("2024-01-15T00:00:00Z"));
        let source = ScriptedSource::new(vec![
            reading(10.0, 1.0),
            reading(20.0, 2.0),
            reading(30.0, 3.0),
        ]);
        let monitor = monitor_with(source, Arc::clone(&clock));

        monitor.check_account_usage("acc-1", None).await;
        clock.advance(Duration::hours(20));
        monitor.check_account_usage("acc-1", None).await;
        clock.advance(Duration::hours(5));
        monitor.check_account_usage("acc-1", None).await;

        // The first sample is now 25h old and must be gone.
        let history = monitor.usage_history("acc-1", 48);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].cumulative_download_mb, 20.0);
    }

    #[tokio::test]
    async fn reductions_are_zero_valued_on_empty_history() {
        let clock = Arc::new(ManualClock::at("2024-01-15T10:00:00Z"));
        let monitor = monitor_with(ScriptedSource::new(vec![]), clock);

        assert!(monitor.usage_history("ghost", 24).is_empty());
        let peak = monitor.peak_usage_time("ghost", 24);
        assert!(peak.timestamp.is_none());
        assert_eq!(peak.peak_mbps, 0.0);
        let avg = monitor.average_usage("ghost", 24);
        assert_eq!(avg.sample_count, 0);
        assert_eq!(avg.total_mb, 0.0);
    }

    #[tokio::test]
    async fn average_and_peak_over_window() {
        let clock = Arc::new(ManualClock::at("2024-01-15T10:00:00Z"));
        let source = ScriptedSource::new(vec![
            Ok(UsageReading {
                download_mbps: 10.0,
                upload_mbps: 2.0,
                total_download_mb: 100.0,
                total_upload_mb: 10.0,
            }),
            Ok(UsageReading {
                download_mbps: 40.0,
                upload_mbps: 8.0,
                total_download_mb: 300.0,
                total_upload_mb: 30.0,
            }),
        ]);
        let monitor = monitor_with(source, Arc::clone(&clock));

        monitor.check_account_usage("acc-1", None).await;
        let peak_at = clock.now_utc() + Duration::minutes(5);
        clock.advance(Duration::minutes(5));
        monitor.check_account_usage("acc-1", None).await;

        let peak = monitor.peak_usage_time("acc-1", 1);
        assert_eq!(peak.timestamp, Some(peak_at));
        assert_eq!(peak.peak_mbps, 48.0);

        let avg = monitor.average_usage("acc-1", 1);
        assert_eq!(avg.avg_download_mbps, 25.0);
        assert_eq!(avg.avg_upload_mbps, 5.0);
        assert_eq!(avg.total_mb, 330.0);
        assert_eq!(avg.sample_count, 2);
    }
}
