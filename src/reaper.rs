//! Background task that reclaims sandboxes whose TTL has run out.

use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;

use crate::orchestrator::SandboxOrchestrator;
use crate::Result;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub failed: usize,
    /// Containers removed because no running instance owned them.
    pub strays: usize,
}

/// Run [`sweep`] every `interval` until the runtime shuts down.
pub fn spawn(orchestrator: Arc<SandboxOrchestrator>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match sweep(&orchestrator, Utc::now()).await {
                Ok(report) if report.expired > 0 || report.failed > 0 || report.strays > 0 => {
                    log::info!(
                        "Reaper expired {} instances ({} failures), removed {} stray containers",
                        report.expired,
                        report.failed,
                        report.strays
                    )
                }
                Ok(_) => {}
                Err(e) => log::warn!("Reaper sweep failed: {}", e),
            }
        }
    })
}

/// Expire every running instance whose `expires_at` is before `now`, then
/// remove sandbox containers no running instance owns.
///
/// A failure on one instance is logged and counted; the sweep carries on with
/// the rest.
pub async fn sweep(orchestrator: &SandboxOrchestrator, now: DateTime<Utc>) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    for instance in orchestrator.all_instances().await? {
        if !instance.is_expired_at(now) {
            continue;
        }

        log::info!(
            "Expiring {} ({} on {}), expired at {}",
            instance.instance_id,
            instance.username,
            instance.exercise_id,
            instance.expires_at
        );

        match orchestrator.expire(&instance).await {
            Ok(true) => report.expired += 1,
            Ok(false) => {}
            Err(e) => {
                log::warn!("Unable to expire {}: {}", instance.instance_id, e);
                report.failed += 1;
            }
        }
    }

    match orchestrator.remove_stray_containers().await {
        Ok(strays) => report.strays = strays,
        Err(e) => log::warn!("Unable to look for stray containers: {}", e),
    }

    Ok(report)
}
