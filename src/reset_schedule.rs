//! Monthly rollover.
//!
//! One job per calendar month in the configured offset: capture each
//! community's monthly top list, store those lists, zero monthly points and
//! move the rollover marker in a single ledger mutation, then announce the
//! captured lists. The job keys off `last_monthly_reset`, so running it twice
//! for a period is a no-op and a period missed while the process was down is
//! caught up on the next check.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::KujiError;
use crate::ledger::Committed;
use crate::models::RankEntry;
use crate::service::KujiService;

/// Receives each community's final monthly ranking, as it stood when cleared.
pub trait RankingNotifier: Send + Sync {
    fn announce(&self, community_id: &str, ranking: &[RankEntry]) -> Result<(), String>;
}

/// Writes the ranking to the log. Used when no chat integration is wired up.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl RankingNotifier for LogNotifier {
    fn announce(&self, community_id: &str, ranking: &[RankEntry]) -> Result<(), String> {
        log::info!("[Rollover] Final ranking for {} ({} entries)", community_id, ranking.len());
        for (i, entry) in ranking.iter().enumerate() {
            log::info!("[Rollover]   {}. {} {}pt", i + 1, entry.member_id, entry.points);
        }
        Ok(())
    }
}

// --- Period boundaries ---

/// First instant of the month containing `now`, in `offset`.
pub fn period_start(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local = now.with_timezone(&offset);
    let into_month = Duration::days(i64::from(local.day0()))
        + Duration::seconds(i64::from(local.num_seconds_from_midnight()))
        + Duration::nanoseconds(i64::from(local.nanosecond()));
    now - into_month
}

/// First instant of the month after the one containing `now`.
pub fn next_period_start(now: DateTime<Utc>, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let local = now.with_timezone(&offset);
    let (year, month) = match local.month() {
        12 => (local.year() + 1, 1),
        m => (local.year(), m + 1),
    };
    let midnight = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
    offset
        .from_local_datetime(&midnight)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

// --- Outcome ---

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RolloverOutcome {
    /// No marker existed; it now points at the current period.
    Initialized { period_start: DateTime<Utc> },
    /// The current period was already rolled over.
    NotDue,
    RolledOver {
        period_start: DateTime<Utc>,
        communities: usize,
        failed_announcements: usize,
    },
}

// ============================================================================
// SCHEDULER
// ============================================================================

pub struct ResetScheduler {
    service: Arc<KujiService>,
    notifier: Arc<dyn RankingNotifier>,
    recheck: std::time::Duration,
    /// Held for the whole check so announcements are not doubled.
    run_lock: Mutex<()>,
}

impl ResetScheduler {
    pub fn new(
        service: Arc<KujiService>,
        notifier: Arc<dyn RankingNotifier>,
        recheck: std::time::Duration,
    ) -> Self {
        Self {
            service,
            notifier,
            recheck,
            run_lock: Mutex::new(()),
        }
    }

    /// Runs the rollover if the current period has not had one yet.
    pub fn run_due(&self) -> Committed<RolloverOutcome> {
        let _guard = self.run_lock.lock().unwrap_or_else(|e| e.into_inner());
        let ledger = self.service.ledger();
        let offset = self.service.utc_offset();
        let current = period_start(self.service.clock().now(), offset);

        let last = match ledger.last_monthly_reset() {
            None => {
                log::info!("[Rollover] No rollover marker, starting from {}", current);
                return ledger
                    .mark_rollover(current)
                    .map(|_| RolloverOutcome::Initialized {
                        period_start: current,
                    });
            }
            Some(last) => last,
        };
        if last >= current {
            return Committed {
                value: RolloverOutcome::NotDue,
                persist_error: None,
            };
        }

        log::info!("[Rollover] Rolling over period {} (last: {})", current, last);
        let Committed {
            value: rankings,
            persist_error,
        } = ledger.complete_rollover(current, self.service.leaderboard_size());
        let rankings = match rankings {
            Some(rankings) => rankings,
            None => {
                return Committed {
                    value: RolloverOutcome::NotDue,
                    persist_error: None,
                }
            }
        };
        log::info!("[Rollover] Cleared monthly points in {} communities", rankings.len());

        // Announced after the clear, so activity in the new period while
        // these calls are in flight is kept.
        let mut failed_announcements = 0;
        for (community_id, top) in &rankings {
            if let Err(e) = self.notifier.announce(community_id, top) {
                failed_announcements += 1;
                log::warn!("⚠️ [Rollover] Announcement for {} failed: {}", community_id, e);
            }
        }

        Committed {
            value: RolloverOutcome::RolledOver {
                period_start: current,
                communities: rankings.len(),
                failed_announcements,
            },
            persist_error,
        }
    }

    fn sleep_duration(&self) -> std::time::Duration {
        let now = self.service.clock().now();
        next_period_start(now, self.service.utc_offset())
            .and_then(|next| (next - now).to_std().ok())
            .map_or(self.recheck, |until| until.min(self.recheck))
    }

    /// Spawns the check loop on the current tokio runtime. The first check
    /// runs immediately, which catches up a missed rollover.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            log::info!("[Rollover] Scheduler started (recheck every {:?})", self.recheck);
            loop {
                let scheduler = self.clone();
                match tokio::task::spawn_blocking(move || scheduler.run_due()).await {
                    Ok(committed) => log_persist_error(committed.persist_error),
                    Err(e) => log::error!("❌ [Rollover] Check aborted: {}", e),
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(self.sleep_duration()) => {}
                }
            }
            log::info!("[Rollover] Scheduler stopped");
        });

        SchedulerHandle { shutdown_tx, task }
    }
}

fn log_persist_error(error: Option<KujiError>) {
    if let Some(e) = error {
        log::warn!("⚠️ [Rollover] Rollover applied but not persisted: {}", e);
    }
}

pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the loop and waits for it to exit. A check already in progress
    /// finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            log::error!("❌ [Rollover] Scheduler task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::KujiConfig;
    use crate::models::MemberKey;
    use crate::service::AdjustMode;
    use crate::storage::MemoryStore;

    fn jst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(String, Vec<RankEntry>)>>,
        fail: bool,
    }

    impl RankingNotifier for RecordingNotifier {
        fn announce(&self, community_id: &str, ranking: &[RankEntry]) -> Result<(), String> {
            self.calls
                .lock()
                .unwrap()
                .push((community_id.to_string(), ranking.to_vec()));
            if self.fail {
                Err("channel unavailable".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn setup(
        now: DateTime<Utc>,
        notifier: Arc<RecordingNotifier>,
    ) -> (Arc<ManualClock>, Arc<KujiService>, ResetScheduler) {
        let clock = Arc::new(ManualClock::new(now));
        let service = Arc::new(
            KujiService::new(&KujiConfig::default(), Arc::new(MemoryStore::new()), clock.clone())
                .unwrap(),
        );
        let scheduler =
            ResetScheduler::new(service.clone(), notifier, std::time::Duration::from_secs(60));
        (clock, service, scheduler)
    }

    #[test]
    fn period_start_uses_local_month() {
        // 2024-05-31 16:00 UTC is already June 1st in JST.
        let now = Utc.with_ymd_and_hms(2024, 5, 31, 16, 0, 0).unwrap();
        assert_eq!(
            period_start(now, jst()),
            Utc.with_ymd_and_hms(2024, 5, 31, 15, 0, 0).unwrap()
        );
        assert_eq!(
            period_start(now, FixedOffset::east_opt(0).unwrap()),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_period_start_wraps_the_year() {
        let now = Utc.with_ymd_and_hms(2024, 12, 10, 0, 0, 0).unwrap();
        assert_eq!(
            next_period_start(now, jst()),
            Some(Utc.with_ymd_and_hms(2024, 12, 31, 15, 0, 0).unwrap())
        );
    }

    #[test]
    fn missing_marker_is_initialized_without_clearing() {
        let notifier = Arc::new(RecordingNotifier::default());
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap();
        let (_, service, scheduler) = setup(now, notifier.clone());
        service.admin_adjust("g1", "alice", 20, AdjustMode::Add);

        let outcome = scheduler.run_due().value;
        let expected = Utc.with_ymd_and_hms(2024, 5, 31, 15, 0, 0).unwrap();
        assert_eq!(outcome, RolloverOutcome::Initialized { period_start: expected });
        assert_eq!(service.ledger().last_monthly_reset(), Some(expected));
        assert_eq!(service.ledger().monthly_points("g1"), vec![("alice".to_string(), 20)]);
        assert!(notifier.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn announces_then_clears_once_per_period() {
        let notifier = Arc::new(RecordingNotifier::default());
        let may = Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap();
        let (clock, service, scheduler) = setup(may, notifier.clone());
        scheduler.run_due();

        service.admin_adjust("g1", "alice", 40, AdjustMode::Set);
        service.admin_adjust("g1", "bob", 70, AdjustMode::Set);
        assert_eq!(scheduler.run_due().value, RolloverOutcome::NotDue);

        clock.set(Utc.with_ymd_and_hms(2024, 5, 31, 15, 1, 0).unwrap());
        let outcome = scheduler.run_due().value;
        assert_eq!(
            outcome,
            RolloverOutcome::RolledOver {
                period_start: Utc.with_ymd_and_hms(2024, 5, 31, 15, 0, 0).unwrap(),
                communities: 1,
                failed_announcements: 0,
            }
        );

        let calls = notifier.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1[0], RankEntry { member_id: "bob".into(), points: 70 });

        let alice = service.ledger().record(&MemberKey::new("g1", "alice")).unwrap();
        assert_eq!(alice.monthly_points, 0);
        assert!(service.last_monthly_ranking("g1").is_ok());

        assert_eq!(scheduler.run_due().value, RolloverOutcome::NotDue);
        assert_eq!(notifier.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn failed_announcement_does_not_block_the_reset() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let (clock, service, scheduler) =
            setup(Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap(), notifier);
        scheduler.run_due();
        service.admin_adjust("g1", "alice", 9, AdjustMode::Add);

        clock.set(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap());
        match scheduler.run_due().value {
            RolloverOutcome::RolledOver { failed_announcements, .. } => {
                assert_eq!(failed_announcements, 1)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(service.ledger().monthly_points("g1"), vec![("alice".to_string(), 0)]);
    }

    #[test]
    fn draw_during_announcement_is_kept_in_the_new_period() {
        struct DrawingNotifier {
            service: Arc<KujiService>,
            late_delta: Mutex<Option<i64>>,
        }

        impl RankingNotifier for DrawingNotifier {
            fn announce(&self, _: &str, ranking: &[RankEntry]) -> Result<(), String> {
                assert!(ranking.iter().all(|entry| entry.member_id != "late"));
                let receipt = self.service.draw("g1", "late").map_err(|e| e.to_string())?;
                *self.late_delta.lock().unwrap() = Some(receipt.outcome.point_delta);
                Ok(())
            }
        }

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap()));
        let service = Arc::new(
            KujiService::new(&KujiConfig::default(), Arc::new(MemoryStore::new()), clock.clone())
                .unwrap(),
        );
        let notifier = Arc::new(DrawingNotifier {
            service: service.clone(),
            late_delta: Mutex::new(None),
        });
        let scheduler = ResetScheduler::new(
            service.clone(),
            notifier.clone(),
            std::time::Duration::from_secs(60),
        );
        scheduler.run_due();
        service.admin_adjust("g1", "alice", 40, AdjustMode::Set);

        // June 1st 00:01 in JST
        clock.set(Utc.with_ymd_and_hms(2024, 5, 31, 15, 1, 0).unwrap());
        assert!(matches!(scheduler.run_due().value, RolloverOutcome::RolledOver { .. }));

        let delta = notifier.late_delta.lock().unwrap().expect("announce ran");
        let late = service.ledger().record(&MemberKey::new("g1", "late")).unwrap();
        assert_eq!(late.monthly_points, delta);
        assert_eq!(late.total_points, Some(delta));
        assert_eq!(
            service.last_monthly_ranking("g1").unwrap(),
            serde_json::json!([{ "memberId": "alice", "points": 40 }])
        );
    }

    #[tokio::test]
    async fn started_loop_catches_up_and_shuts_down() {
        struct ChannelNotifier(mpsc::UnboundedSender<String>);
        impl RankingNotifier for ChannelNotifier {
            fn announce(&self, community_id: &str, _: &[RankEntry]) -> Result<(), String> {
                self.0.send(community_id.to_string()).map_err(|e| e.to_string())
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 3, 0, 0, 0).unwrap()));
        let service = Arc::new(
            KujiService::new(&KujiConfig::default(), Arc::new(MemoryStore::new()), clock).unwrap(),
        );
        service
            .ledger()
            .mark_rollover(Utc.with_ymd_and_hms(2024, 5, 31, 15, 0, 0).unwrap());
        service.admin_adjust("g7", "alice", 3, AdjustMode::Add);

        let scheduler = Arc::new(ResetScheduler::new(
            service.clone(),
            Arc::new(ChannelNotifier(tx)),
            std::time::Duration::from_secs(60),
        ));
        let handle = scheduler.start();

        let announced = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(announced.as_deref(), Some("g7"));
        handle.shutdown().await;

        assert_eq!(
            service.ledger().last_monthly_reset(),
            Some(Utc.with_ymd_and_hms(2024, 6, 30, 15, 0, 0).unwrap())
        );
    }
}
