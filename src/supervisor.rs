//! Watch supervisor
//!
//! One worker task per watched kind feeds the shared [`NoticeBuffer`]; one
//! coordinator task drains it on a fixed interval and drives targeted
//! refreshes, plus periodic and requested full refreshes. Workers share no
//! state beyond the buffer and the health map.
//!
//! Cancellation stops workers and keeps the coordinator from starting a new
//! pass. A pass already in APPLY runs to completion.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferedNotice, NoticeBuffer};
use crate::collector::{Notice, Watcher};
use crate::kind::ResourceKind;
use crate::refresh::Refresher;
use crate::retry::{Backoff, RetryConfig};
use crate::{Error, Result};

/// Version a worker starts from when the full refresh did not report one
pub const FROM_CURRENT_STATE: &str = "0";

/// Supervisor timing and thresholds
#[derive(Clone, Debug, PartialEq)]
pub struct SupervisorConfig {
    /// How often the coordinator drains the buffer
    pub poll_interval: Duration,
    /// How often a full refresh runs regardless of watch health
    pub full_refresh_interval: Duration,
    /// How long shutdown waits for each task to exit
    pub shutdown_timeout: Duration,
    /// Consecutive rejections before the status turns `InvalidCredentials`
    pub rejected_threshold: u32,
    /// Consecutive transport failures before the status turns `Unreachable`
    pub unreachable_threshold: u32,
    /// Reconnect backoff for watch workers
    pub backoff: RetryConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            full_refresh_interval: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(10),
            rejected_threshold: 3,
            unreachable_threshold: 5,
            backoff: RetryConfig::default(),
        }
    }
}

/// Health of one watch worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum WorkerHealth {
    /// Not connected yet
    Starting,
    /// Stream open
    Connected,
    /// Last attempt failed in transport; reconnecting with backoff
    Reconnecting {
        /// Consecutive failed attempts
        attempts: u32,
        /// Last error seen
        last_error: String,
    },
    /// Last attempt was refused by the server
    Rejected {
        /// Consecutive failed attempts
        attempts: u32,
        /// Last error seen
        last_error: String,
    },
}

/// Operator-visible status of the connection as a whole
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    /// Every worker is connected or failing below its threshold
    #[default]
    Healthy,
    /// Some worker keeps being refused
    InvalidCredentials,
    /// Some worker keeps failing to connect
    Unreachable,
}

/// Tasks that did not exit within the shutdown timeout
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Names of tasks that were aborted instead of joined
    pub unjoined: Vec<String>,
}

impl ShutdownReport {
    /// True when every task exited in time
    pub fn is_clean(&self) -> bool {
        self.unjoined.is_empty()
    }
}

#[derive(Debug, Default)]
struct Shared {
    buffer: NoticeBuffer,
    health: DashMap<ResourceKind, WorkerHealth>,
    full_refresh_requested: AtomicBool,
    last_status: Mutex<ConnectionStatus>,
}

impl Shared {
    fn set_health(&self, kind: ResourceKind, health: WorkerHealth) {
        self.health.insert(kind, health);
    }

    fn request_full_refresh(&self) {
        self.full_refresh_requested.store(true, Ordering::SeqCst);
    }

    fn take_full_refresh_request(&self) -> bool {
        self.full_refresh_requested.swap(false, Ordering::SeqCst)
    }

    /// Recompute the connection status and log it if it changed
    ///
    /// Returns the new status on a transition.
    fn observe_status(&self, config: &SupervisorConfig) -> Option<ConnectionStatus> {
        let current = connection_status(&self.health, config);
        let previous = std::mem::replace(&mut *self.last_status.lock(), current);
        if previous == current {
            return None;
        }

        let unhealthy: Vec<String> = self
            .health
            .iter()
            .filter(|entry| !matches!(entry.value(), WorkerHealth::Connected))
            .map(|entry| entry.key().to_string())
            .collect();
        match current {
            ConnectionStatus::InvalidCredentials => error!(
                previous = ?previous,
                kinds = ?unhealthy,
                "API server keeps refusing our credentials"
            ),
            ConnectionStatus::Unreachable => warn!(
                previous = ?previous,
                kinds = ?unhealthy,
                "API server unreachable"
            ),
            ConnectionStatus::Healthy => info!(previous = ?previous, "Connection recovered"),
        }
        Some(current)
    }
}

/// Running watch workers and coordinator
pub struct Supervisor {
    shared: Arc<Shared>,
    config: SupervisorConfig,
    cancel: CancellationToken,
    workers: Vec<(ResourceKind, JoinHandle<()>)>,
    coordinator: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawn one worker per watched kind and the coordinator
    ///
    /// `versions` are the list resource versions from the initial full
    /// refresh.
    pub fn start(
        watcher: Arc<dyn Watcher>,
        refresher: Refresher,
        versions: &BTreeMap<ResourceKind, String>,
        config: SupervisorConfig,
    ) -> Self {
        let mut supervisor = Self::start_workers(watcher, refresher.kinds(), versions, config);
        let coordinator = tokio::spawn(run_coordinator(
            refresher,
            supervisor.shared.clone(),
            supervisor.config.clone(),
            supervisor.cancel.clone(),
        ));
        supervisor.coordinator = Some(coordinator);
        supervisor
    }

    /// Spawn watch workers only; the caller drains the buffer itself
    pub fn start_workers(
        watcher: Arc<dyn Watcher>,
        kinds: &[ResourceKind],
        versions: &BTreeMap<ResourceKind, String>,
        config: SupervisorConfig,
    ) -> Self {
        let shared = Arc::new(Shared::default());
        let cancel = CancellationToken::new();

        let workers = kinds
            .iter()
            .map(|&kind| {
                shared.set_health(kind, WorkerHealth::Starting);
                let start = versions
                    .get(&kind)
                    .cloned()
                    .unwrap_or_else(|| FROM_CURRENT_STATE.to_string());
                let handle = tokio::spawn(run_worker(
                    kind,
                    watcher.clone(),
                    shared.clone(),
                    Some(start),
                    config.backoff.clone(),
                    cancel.clone(),
                ));
                (kind, handle)
            })
            .collect();

        info!(workers = kinds.len(), "Watch workers started");
        Self {
            shared,
            config,
            cancel,
            workers,
            coordinator: None,
        }
    }

    /// Shared notice buffer
    pub fn buffer(&self) -> &NoticeBuffer {
        &self.shared.buffer
    }

    /// Snapshot of per-kind worker health
    pub fn health(&self) -> BTreeMap<ResourceKind, WorkerHealth> {
        self.shared
            .health
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Connection status derived from worker health
    pub fn connection_status(&self) -> ConnectionStatus {
        connection_status(&self.shared.health, &self.config)
    }

    /// Ask the coordinator for a full refresh on its next tick
    pub fn request_full_refresh(&self) {
        self.shared.request_full_refresh();
    }

    /// True while a full refresh is pending
    pub fn full_refresh_requested(&self) -> bool {
        self.shared.full_refresh_requested.load(Ordering::SeqCst)
    }

    /// Token that stops every task when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every task and join them with the configured timeout
    pub async fn shutdown(self) -> ShutdownReport {
        info!("Stopping watch supervisor");
        self.cancel.cancel();

        let mut tasks: Vec<(String, JoinHandle<()>)> = self
            .workers
            .into_iter()
            .map(|(kind, handle)| (format!("watch {kind}"), handle))
            .collect();
        if let Some(coordinator) = self.coordinator {
            tasks.push(("coordinator".to_string(), coordinator));
        }

        let mut report = ShutdownReport::default();
        for (name, mut handle) in tasks {
            match tokio::time::timeout(self.config.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => debug!(task = %name, "Task joined"),
                Ok(Err(e)) => {
                    error!(task = %name, error = %e, "Task ended abnormally");
                    report.unjoined.push(name);
                }
                Err(_) => {
                    warn!(
                        task = %name,
                        timeout = ?self.config.shutdown_timeout,
                        "Task did not exit in time, aborting"
                    );
                    handle.abort();
                    report.unjoined.push(name);
                }
            }
        }
        report
    }
}

fn connection_status(
    health: &DashMap<ResourceKind, WorkerHealth>,
    config: &SupervisorConfig,
) -> ConnectionStatus {
    let mut status = ConnectionStatus::Healthy;
    for entry in health.iter() {
        match entry.value() {
            WorkerHealth::Rejected { attempts, .. } if *attempts >= config.rejected_threshold => {
                return ConnectionStatus::InvalidCredentials;
            }
            WorkerHealth::Reconnecting { attempts, .. }
                if *attempts >= config.unreachable_threshold =>
            {
                status = ConnectionStatus::Unreachable;
            }
            _ => {}
        }
    }
    status
}

/// How one stream attempt ended without a transport error
#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    /// Server closed the stream normally
    Closed,
    /// Server said our version expired
    Stale,
}

async fn run_worker(
    kind: ResourceKind,
    watcher: Arc<dyn Watcher>,
    shared: Arc<Shared>,
    mut version: Option<String>,
    backoff: RetryConfig,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(backoff);
    debug!(kind = %kind, version = ?version, "Watch worker started");

    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = stream_once(
                kind,
                watcher.as_ref(),
                &shared,
                &mut version,
                &mut backoff,
            ) => outcome,
        };

        match outcome {
            Ok(StreamEnd::Closed) => {
                debug!(kind = %kind, version = ?version, "Watch stream closed, reconnecting");
                continue;
            }
            Ok(StreamEnd::Stale) => {
                warn!(kind = %kind, "Watch version expired, restarting from a fresh baseline");
                version = None;
                shared.request_full_refresh();
                continue;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                let attempts = backoff.attempts();
                let last_error = e.to_string();
                if e.is_rejection() {
                    shared.set_health(kind, WorkerHealth::Rejected { attempts, last_error });
                } else {
                    shared.set_health(kind, WorkerHealth::Reconnecting { attempts, last_error });
                }
                warn!(
                    kind = %kind,
                    attempt = attempts,
                    delay = ?delay,
                    error = %e,
                    "Watch failed, reconnecting"
                );

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    debug!(kind = %kind, "Watch worker stopped");
}

async fn stream_once(
    kind: ResourceKind,
    watcher: &dyn Watcher,
    shared: &Shared,
    version: &mut Option<String>,
    backoff: &mut Backoff,
) -> Result<StreamEnd> {
    let mut stream = watcher.watch(kind, version.clone()).await?;
    // failures are counted from the last established stream
    backoff.reset();
    shared.set_health(kind, WorkerHealth::Connected);

    while let Some(item) = stream.next().await {
        match item? {
            Notice::Error(failure) if failure.is_stale_version() => return Ok(StreamEnd::Stale),
            Notice::Error(failure) => {
                return Err(match failure.code {
                    401 | 403 => {
                        Error::remote_rejected(kind.to_string(), failure.code, failure.message)
                    }
                    _ => Error::remote_unavailable(
                        kind.to_string(),
                        format!(
                            "watch error {} {}: {}",
                            failure.code, failure.reason, failure.message
                        ),
                    ),
                });
            }
            notice => {
                if let Some(v) = notice.resource_version() {
                    *version = Some(v.to_string());
                }
                if let Some((change, object)) = notice.into_change() {
                    shared.buffer.ingest(BufferedNotice::new(change, object));
                }
            }
        }
    }
    Ok(StreamEnd::Closed)
}

async fn run_coordinator(
    refresher: Refresher,
    shared: Arc<Shared>,
    config: SupervisorConfig,
    cancel: CancellationToken,
) {
    let mut poll = tokio::time::interval(config.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    poll.tick().await;
    let mut last_full = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = poll.tick() => {}
        }
        shared.observe_status(&config);

        let batch = shared.buffer.drain_batch();
        if !batch.is_empty() {
            let notices = batch.len();
            match refresher.targeted_refresh(batch).await {
                Ok(refresh) => {
                    if let Some(report) = refresh.report.filter(|r| !r.is_success()) {
                        warn!(
                            notices,
                            failed = ?report.failed_kinds,
                            "Targeted refresh partially failed"
                        );
                    }
                    if !refresh.deferred.is_empty() {
                        debug!(deferred = refresh.deferred.len(), "Requeueing deferred notices");
                    }
                    for notice in refresh.deferred {
                        shared.buffer.ingest(notice);
                    }
                }
                Err(e) => error!(notices, error = %e, "Targeted refresh failed"),
            }
        }

        let requested = shared.take_full_refresh_request();
        if !requested && last_full.elapsed() < config.full_refresh_interval {
            continue;
        }
        if cancel.is_cancelled() {
            break;
        }

        info!(requested, "Running full refresh");
        match refresher.full_refresh().await {
            Ok(refresh) if refresh.is_success() => last_full = Instant::now(),
            Ok(refresh) => {
                warn!(
                    failed_listings = ?refresh.failed_listings,
                    failed_kinds = ?refresh.report.failed_kinds,
                    "Full refresh incomplete, retrying on next tick"
                );
                shared.request_full_refresh();
            }
            Err(e) => {
                error!(error = %e, "Full refresh failed, retrying on next tick");
                shared.request_full_refresh();
            }
        }
    }
    debug!("Coordinator stopped");
}
