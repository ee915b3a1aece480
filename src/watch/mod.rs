//! Poll cycle: fetch, diff against the last-known-good snapshot, notify.
//!
//! Peers are polled before providers and each class is independent: a failed
//! peer fetch still lets the provider fetch run. A failed fetch leaves that
//! class's baseline untouched so the next success diffs against it.

pub mod diff;
pub mod labels;
pub mod render;
pub mod store;

pub use diff::{diff, ChangeReport, Direction, EntityClass, Transition, TransitionEvent};
pub use labels::LabelCache;
pub use render::{Notification, Renderer};
pub use store::{Snapshot, SnapshotStore};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::PollMetrics;
use crate::notify::{self, Notifier};
use crate::pbx::StatusSource;
use crate::scheduler::{format_duration, Schedule};

/// What happened to one entity class in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassOutcome {
    /// First usable snapshot stored, nothing compared
    Seeded { entities: usize },
    /// Compared, no online/offline changes
    Quiet,
    Changed(ChangeReport),
    Failed(String),
    Cancelled,
}

impl ClassOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ClassOutcome::Failed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClassOutcome::Cancelled)
    }

    fn summary(&self) -> String {
        match self {
            ClassOutcome::Seeded { entities } => format!("seeded ({})", entities),
            ClassOutcome::Quiet => "no change".to_string(),
            ClassOutcome::Changed(report) => format!("{} change(s)", report.events.len()),
            ClassOutcome::Failed(_) => "failed".to_string(),
            ClassOutcome::Cancelled => "cancelled".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub peers: ClassOutcome,
    pub providers: ClassOutcome,
}

impl CycleReport {
    pub fn is_ok(&self) -> bool {
        !self.peers.is_failed() && !self.providers.is_failed() && !self.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.peers.is_cancelled() || self.providers.is_cancelled()
    }

    pub fn get(&self, class: EntityClass) -> &ClassOutcome {
        match class {
            EntityClass::Peer => &self.peers,
            EntityClass::Provider => &self.providers,
        }
    }
}

/// Owns all poll-loop state. Only `check_once` mutates it, and cycles never
/// overlap, so no locking is needed; shared readers go through `PollMetrics`.
pub struct Watcher<S, N, R = StdRng> {
    source: S,
    notifier: N,
    renderer: Renderer<R>,
    snapshots: SnapshotStore,
    labels: LabelCache,
    metrics: Arc<PollMetrics>,
    cancel: CancellationToken,
}

impl<S, N, R> Watcher<S, N, R>
where
    S: StatusSource,
    N: Notifier,
    R: Rng,
{
    pub fn new(source: S, notifier: N, renderer: Renderer<R>, metrics: Arc<PollMetrics>) -> Self {
        Self {
            source,
            notifier,
            renderer,
            snapshots: SnapshotStore::new(),
            labels: LabelCache::new(),
            metrics,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the run loop and abandon in-flight deliveries when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn labels(&self) -> &LabelCache {
        &self.labels
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Run one full cycle: peers, then providers.
    pub async fn check_once(&mut self) -> CycleReport {
        let peers = self.poll_class(EntityClass::Peer).await;
        let providers = if peers.is_cancelled() {
            ClassOutcome::Cancelled
        } else {
            self.poll_class(EntityClass::Provider).await
        };

        let report = CycleReport { peers, providers };
        if report.is_cancelled() {
            debug!("Cycle cancelled");
        } else if report.is_ok() {
            self.metrics.record_cycle_ok();
        } else {
            self.metrics.record_cycle_failed();
        }

        debug!(
            "Cycle done: peers {}, providers {}",
            report.peers.summary(),
            report.providers.summary()
        );
        report
    }

    async fn fetch(&self, class: EntityClass) -> Result<Snapshot, crate::pbx::PbxError> {
        match class {
            EntityClass::Peer => self.source.peer_statuses().await,
            EntityClass::Provider => self.source.provider_statuses().await,
        }
    }

    async fn poll_class(&mut self, class: EntityClass) -> ClassOutcome {
        let current = match self.fetch(class).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_cancelled() => return ClassOutcome::Cancelled,
            Err(e) => {
                warn!("Failed to fetch {}: {}", class, e);
                return ClassOutcome::Failed(e.to_string());
            }
        };

        let online = current.values().filter(|state| class.is_online(state)).count();
        self.metrics.record_entities(class, online, current.len());

        let previous = self.snapshots.replace(class, current);
        if previous.is_empty() {
            let entities = self.snapshots.get(class).len();
            info!("Baseline for {}: {} entities, {} online", class, entities, online);
            return ClassOutcome::Seeded { entities };
        }

        let transitions = diff(&previous, self.snapshots.get(class), |state| class.is_online(state));
        if transitions.is_empty() {
            return ClassOutcome::Quiet;
        }

        let mut labels = HashMap::with_capacity(transitions.len());
        for transition in &transitions {
            let label = match class {
                EntityClass::Peer => self.labels.resolve(&self.source, &transition.id).await,
                EntityClass::Provider => transition.id.clone(),
            };
            labels.insert(transition.id.clone(), label);
        }

        let report = ChangeReport::new(class, transitions, |id| {
            labels.remove(id).unwrap_or_else(|| id.to_string())
        });
        for line in report.lines() {
            info!("{}", line);
        }

        if let Some(message) = self.renderer.render(&report, Utc::now()) {
            let delivered = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!("Shutdown interrupted {} notification delivery", class);
                    return ClassOutcome::Cancelled;
                }
                result = notify::dispatch(&self.notifier, &message) => result,
            };
            match delivered {
                Ok(()) => self.metrics.record_notification(true),
                Err(e) => {
                    error!("Failed to deliver {} notification: {:#}", class, e);
                    self.metrics.record_notification(false);
                }
            }
        }

        ClassOutcome::Changed(report)
    }

    /// Poll every `period` until the shutdown token fires.
    pub async fn run(&mut self, period: Duration) {
        info!("Watching peers and providers every {}", format_duration(period));
        let mut schedule = Schedule::new(period, self.cancel.clone());

        while schedule.tick().await {
            let report = self.check_once().await;
            if report.is_cancelled() {
                break;
            }
        }

        info!("Watcher stopped");
    }
}
