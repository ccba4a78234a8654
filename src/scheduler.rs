use crate::auth::TokenSource;
use crate::config::AppConfig;
use crate::gcp::GcpBilling;
use crate::rate::RateGate;
use crate::reconciler::{run_cycle, CycleStats, IdentitySnapshot, ReconcileSettings};
use crate::store::Store;
use eyre::Result;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Everything the scheduler threads through to per-identity work. No
/// module-level state: config and the rate-gate map live here.
#[derive(Clone)]
pub struct SchedulerCtx {
    pub cfg: Arc<AppConfig>,
    pub store: Store,
    pub gate: Arc<RateGate>,
}

/// How one scheduler cycle went across all identities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl CycleReport {
    pub fn clean(&self) -> bool {
        self.failed == 0
    }
}

/// Run the reconcile loop until `shutdown` flips. One cycle reconciles
/// every configured identity in parallel under the worker cap, bounded by
/// the cycle deadline.
pub async fn run(ctx: SchedulerCtx, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut consecutive_failures = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let names = ctx.cfg.account_names.clone();
        let started = Instant::now();

        // Per-identity errors are counted inside the report; a panic that
        // escapes the cycle machinery itself must not kill the loop.
        let cycle = std::panic::AssertUnwindSafe(cycle_once(&ctx, &names)).catch_unwind();
        let report = match cycle.await {
            Ok(report) => report,
            Err(_panic) => {
                let wait = (2 * ctx.cfg.update_interval).min(Duration::from_secs(600));
                tracing::error!(wait_s = wait.as_secs(), "scheduler cycle panicked");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => continue,
                    _ = shutdown.changed() => break,
                }
            }
        };

        if report.clean() {
            consecutive_failures = 0;
        } else {
            consecutive_failures += 1;
        }

        let elapsed = started.elapsed();
        tracing::info!(
            identities = names.len(),
            succeeded = report.succeeded,
            failed = report.failed,
            timed_out = report.timed_out,
            consecutive_failures,
            elapsed_s = elapsed.as_secs(),
            "cycle complete"
        );

        if consecutive_failures >= 5 {
            if let Some(url) = ctx.cfg.alert_webhook_url.clone() {
                let text = format!(
                    "billing-keeper: {consecutive_failures} consecutive cycles had failures \
                     (last cycle: {} failed of {})",
                    report.failed,
                    names.len()
                );
                // Best effort; never blocks the loop.
                tokio::spawn(send_alert(url, text));
            }
        }

        if ctx.cfg.once {
            break;
        }

        let extra = if consecutive_failures >= 3 {
            Duration::from_secs((consecutive_failures as u64 * 60).min(300))
        } else {
            Duration::ZERO
        };
        let base = ctx
            .cfg
            .update_interval
            .saturating_sub(elapsed)
            .max(Duration::from_secs(30));
        let sleep = base + extra;
        tracing::debug!(sleep_s = sleep.as_secs(), "sleeping until next cycle");

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("scheduler stopped");
}

async fn cycle_once(ctx: &SchedulerCtx, names: &[String]) -> CycleReport {
    if names.is_empty() {
        tracing::debug!("no identities configured; nothing to reconcile");
        return CycleReport::default();
    }
    let workers = ctx.cfg.max_workers.min(names.len().max(2));
    let ctx = ctx.clone();
    run_identities_bounded(
        names.to_vec(),
        workers,
        ctx.cfg.task_timeout,
        move |name| {
            let ctx = ctx.clone();
            async move {
                let result = reconcile_identity(&ctx, &name).await;
                (name, result)
            }
        },
    )
    .await
}

/// Reconcile every identity through a bounded concurrent stream, abandoning
/// whatever is still in flight when the deadline passes. Dropping the
/// stream cancels unfinished reconcilers before they reach persistence, so
/// a timed-out identity never writes a partial audit trail for work that
/// did not happen.
pub(crate) async fn run_identities_bounded<F, Fut>(
    names: Vec<String>,
    workers: usize,
    deadline: Duration,
    run: F,
) -> CycleReport
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = (String, Result<CycleStats>)>,
{
    let total = names.len();
    let deadline_at = Instant::now() + deadline;
    let mut report = CycleReport::default();

    let mut results = stream::iter(names.into_iter().map(&run)).buffer_unordered(workers.max(1));

    loop {
        match tokio::time::timeout_at(deadline_at, results.next()).await {
            Ok(Some((name, Ok(stats)))) => {
                tracing::info!(identity = %name, ?stats, "identity reconciled");
                report.succeeded += 1;
            }
            Ok(Some((name, Err(err)))) => {
                tracing::warn!(identity = %name, error = %err, "identity reconcile failed");
                report.failed += 1;
            }
            Ok(None) => break,
            Err(_) => {
                report.timed_out = total - report.succeeded - report.failed;
                report.failed += report.timed_out;
                tracing::warn!(
                    timed_out = report.timed_out,
                    deadline_s = deadline.as_secs(),
                    "cycle deadline passed; cancelling unfinished identities"
                );
                break;
            }
        }
    }
    report
}

/// One identity, one cycle: credentials, snapshot, provider calls, apply.
async fn reconcile_identity(ctx: &SchedulerCtx, name: &str) -> Result<CycleStats> {
    let credentials_file = ctx.cfg.credentials_dir.join(format!("{name}.json"));
    let auth = TokenSource::from_file(&credentials_file)?;
    let email = auth.email().to_string();

    let identity_id = ctx
        .store
        .ensure_identity(name, &email, &credentials_file.to_string_lossy())
        .await?;
    let stored_bindings = ctx.store.stored_bindings(identity_id).await?;

    let provider = GcpBilling::new(
        name.to_string(),
        auth,
        ctx.gate.clone(),
        ctx.cfg.retry_policy(),
        ctx.cfg.gate_acquire_timeout,
    );
    let snapshot = IdentitySnapshot {
        name: name.to_string(),
        stored_bindings,
    };
    let settings = ReconcileSettings {
        auto_switch: ctx.cfg.enable_auto_switch,
        max_projects_per_billing: ctx.cfg.max_projects_per_billing,
    };

    let outcome = run_cycle(&provider, &snapshot, &settings).await?;
    let report = ctx
        .store
        .apply_cycle(
            identity_id,
            &outcome.billing_accounts,
            &outcome.projects,
            &outcome.events,
        )
        .await?;
    if report.audit_log_failures > 0 {
        tracing::error!(
            identity = name,
            audit_log_failures = report.audit_log_failures,
            "audit events were lost; the operation log is incomplete for this cycle"
        );
    }
    Ok(outcome.stats)
}

async fn send_alert(url: String, text: String) {
    let client = reqwest::Client::new();
    let result = client
        .post(&url)
        .timeout(Duration::from_secs(10))
        .json(&serde_json::json!({ "text": text }))
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => {
            tracing::info!("alert webhook delivered");
        }
        Ok(response) => {
            tracing::warn!(status = %response.status(), "alert webhook rejected");
        }
        Err(err) => {
            tracing::warn!(error = %err, "alert webhook failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::eyre;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("sa-{i}")).collect()
    }

    #[tokio::test]
    async fn all_identities_complete_under_the_deadline() {
        let report = run_identities_bounded(names(4), 2, Duration::from_secs(5), |name| async {
            (name, Ok(CycleStats::default()))
        })
        .await;
        assert_eq!(report.succeeded, 4);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let report = run_identities_bounded(names(3), 2, Duration::from_secs(5), |name| async {
            if name == "sa-1" {
                (name, Err(eyre!("boom")))
            } else {
                (name, Ok(CycleStats::default()))
            }
        })
        .await;
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert!(!report.clean());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_counts_stuck_identities_as_failed() {
        // Both identities sleep well past the 1s deadline.
        let report = run_identities_bounded(names(2), 2, Duration::from_secs(1), |name| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            (name, Ok(CycleStats::default()))
        })
        .await;
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 2);
        assert_eq!(report.timed_out, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_cap_limits_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let report = {
            let running = running.clone();
            let peak = peak.clone();
            run_identities_bounded(names(6), 2, Duration::from_secs(60), move |name| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    (name, Ok(CycleStats::default()))
                }
            })
            .await
        };
        assert_eq!(report.succeeded, 6);
        assert!(peak.load(Ordering::SeqCst) <= 2, "worker cap exceeded");
    }
}
