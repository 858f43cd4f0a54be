//! Multi-source aggregate.
//!
//! Children push records through a forwarding subscription into one
//! unbounded command channel. The receiving end is owned by `listen`, which
//! runs the children in a `JoinSet` and recomputes the fused record after
//! every update.

mod fusion;

pub use fusion::{fuse, FusionConfig, AGGREGATE_SOURCE};

use crate::error::SourceError;
use crate::source::{handler, Subscribers, SubscriptionId, WeatherSource};
use crate::status::WeatherStatus;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Handle for a source registered with an [`Aggregator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildId(u64);

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "child-{}", self.0)
    }
}

enum FusionCommand {
    Add {
        child: ChildId,
        source: Arc<dyn WeatherSource>,
        subscription: SubscriptionId,
    },
    Update {
        child: ChildId,
        status: Arc<WeatherStatus>,
    },
    Remove {
        child: ChildId,
    },
}

impl fmt::Debug for FusionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FusionCommand::Add { child, source, .. } => f
                .debug_struct("Add")
                .field("child", child)
                .field("source", &source.name())
                .finish(),
            FusionCommand::Update { child, .. } => {
                f.debug_struct("Update").field("child", child).finish()
            }
            FusionCommand::Remove { child } => {
                f.debug_struct("Remove").field("child", child).finish()
            }
        }
    }
}

struct Child {
    id: ChildId,
    source: Arc<dyn WeatherSource>,
    subscription: SubscriptionId,
    latest: Option<Arc<WeatherStatus>>,
    /// Set while the child's `listen` task is running.
    running: Option<CancellationToken>,
}

/// State owned by whichever call to `listen` is active.
struct FusionState {
    rx: mpsc::UnboundedReceiver<FusionCommand>,
    children: Vec<Child>,
}

type ChildTasks = JoinSet<(ChildId, Result<(), SourceError>)>;

/// Child tasks of one `listen` call.
struct Workers {
    root: CancellationToken,
    tasks: ChildTasks,
    /// Removed children whose `listen` has not returned yet.
    stopping: BTreeSet<ChildId>,
    /// Children added while others were stopping, started once they are gone.
    deferred: Vec<ChildId>,
}

impl Workers {
    fn new(cancel: &CancellationToken) -> Self {
        Self {
            root: cancel.child_token(),
            tasks: ChildTasks::new(),
            stopping: BTreeSet::new(),
            deferred: Vec::new(),
        }
    }
}

pub struct Aggregator {
    config: FusionConfig,
    subscribers: Subscribers,
    next_child: AtomicU64,
    tx: mpsc::UnboundedSender<FusionCommand>,
    state: Mutex<Option<FusionState>>,
    latest: Mutex<Option<Arc<WeatherStatus>>>,
}

impl Aggregator {
    pub fn new(config: FusionConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            subscribers: Subscribers::new(),
            next_child: AtomicU64::new(0),
            tx,
            state: Mutex::new(Some(FusionState {
                rx,
                children: Vec::new(),
            })),
            latest: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Registers `source`. When the aggregate is already listening the child
    /// is started right away, otherwise on the next `listen`.
    pub fn add_source(&self, source: Arc<dyn WeatherSource>) -> ChildId {
        let child = ChildId(self.next_child.fetch_add(1, Ordering::Relaxed));
        let tx = self.tx.clone();
        let subscription = source.subscribe(handler(move |status| {
            tx.send(FusionCommand::Update {
                child,
                status: status.clone(),
            })
            .map_err(|_| anyhow::anyhow!("aggregate is gone"))
        }));
        self.send(FusionCommand::Add {
            child,
            source,
            subscription,
        });
        child
    }

    /// Stops the child, drops its subscription and forgets its record.
    /// Unknown ids are ignored. Sources added after this call are started
    /// only once the removed child's `listen` has returned, so a replacement
    /// can reuse the resources (a UDP port) the old one held.
    pub fn remove_source(&self, child: ChildId) {
        self.send(FusionCommand::Remove { child });
    }

    /// Most recently published fused record.
    pub fn latest(&self) -> Option<Arc<WeatherStatus>> {
        lock(&self.latest).clone()
    }

    fn send(&self, command: FusionCommand) {
        // The receiver lives in `self.state`, so this only fails while the
        // aggregate is being dropped.
        if let Err(err) = self.tx.send(command) {
            tracing::debug!(command = ?err.0, "aggregate command dropped");
        }
    }

    fn start_child(&self, child: &mut Child, workers: &mut Workers) {
        if child.running.is_some() {
            return;
        }
        let token = workers.root.child_token();
        let source = child.source.clone();
        let id = child.id;
        let cancel = token.clone();
        workers.tasks.spawn(async move {
            // A panicking child is reported like a failed one, keeping its id.
            let outcome = AssertUnwindSafe(source.listen(cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(SourceError::Child {
                        name: source.name().to_string(),
                        message: "listen panicked".to_string(),
                    })
                });
            (id, outcome)
        });
        tracing::info!(child = %id, source = %child.source.name(), "aggregate child started");
        child.running = Some(token);
    }

    /// Applies one command. Returns `true` when the fused record must be
    /// recomputed.
    fn apply(
        &self,
        state: &mut FusionState,
        command: FusionCommand,
        workers: &mut Workers,
    ) -> bool {
        match command {
            FusionCommand::Add {
                child,
                source,
                subscription,
            } => {
                let mut entry = Child {
                    id: child,
                    source,
                    subscription,
                    latest: None,
                    running: None,
                };
                if workers.stopping.is_empty() {
                    self.start_child(&mut entry, workers);
                } else {
                    tracing::debug!(child = %child, "child start deferred until removed children stop");
                    workers.deferred.push(child);
                }
                state.children.push(entry);
                false
            }
            FusionCommand::Update { child, status } => {
                match state.children.iter_mut().find(|entry| entry.id == child) {
                    Some(entry) => {
                        entry.latest = Some(status);
                        true
                    }
                    None => {
                        tracing::debug!(child = %child, "update from unknown child ignored");
                        false
                    }
                }
            }
            FusionCommand::Remove { child } => {
                let Some(index) = state.children.iter().position(|entry| entry.id == child) else {
                    tracing::debug!(child = %child, "remove for unknown child ignored");
                    return false;
                };
                let entry = state.children.remove(index);
                if let Some(token) = &entry.running {
                    token.cancel();
                    workers.stopping.insert(child);
                }
                workers.deferred.retain(|id| *id != child);
                entry.source.unsubscribe(entry.subscription);
                tracing::info!(child = %child, source = %entry.source.name(), "aggregate child removed");
                true
            }
        }
    }

    fn recompute(&self, state: &FusionState) {
        let records = state
            .children
            .iter()
            .filter_map(|child| child.latest.as_deref());
        let fused = Arc::new(fuse(records, Utc::now(), &self.config));
        *lock(&self.latest) = Some(fused.clone());
        self.subscribers.publish(AGGREGATE_SOURCE, &fused);
    }

    fn restore(&self, state: FusionState) {
        *lock(&self.state) = Some(state);
    }

    async fn run(
        &self,
        state: &mut FusionState,
        cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        let mut workers = Workers::new(cancel);
        for child in state.children.iter_mut() {
            self.start_child(child, &mut workers);
        }

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                command = state.rx.recv() => {
                    // `self.tx` keeps the channel open.
                    let Some(command) = command else { break Ok(()); };
                    if self.apply(state, command, &mut workers) {
                        self.recompute(state);
                    }
                }
                Some(joined) = workers.tasks.join_next(), if !workers.tasks.is_empty() => {
                    if let Err(err) = self.child_finished(state, &mut workers, joined) {
                        break Err(err);
                    }
                }
            }
        };

        workers.root.cancel();
        while let Some(joined) = workers.tasks.join_next().await {
            match joined {
                Ok((child, Err(err))) => {
                    tracing::warn!(child = %child, error = %err, "aggregate child failed during shutdown");
                }
                Ok((_, Ok(()))) => {}
                Err(err) => {
                    tracing::error!(error = %err, "aggregate child task panicked during shutdown");
                }
            }
        }
        for child in state.children.iter_mut() {
            child.running = None;
        }
        result
    }

    /// Handles a finished child task. Returns `Err` when the aggregate must
    /// stop.
    fn child_finished(
        &self,
        state: &mut FusionState,
        workers: &mut Workers,
        joined: Result<(ChildId, Result<(), SourceError>), tokio::task::JoinError>,
    ) -> Result<(), SourceError> {
        let (child, outcome) = match joined {
            Ok(finished) => finished,
            Err(err) => {
                tracing::error!(error = %err, "aggregate child task panicked");
                if self.config.fail_fast {
                    return Err(SourceError::Child {
                        name: "unknown".to_string(),
                        message: err.to_string(),
                    });
                }
                return Ok(());
            }
        };
        if workers.stopping.remove(&child) {
            if let Err(err) = outcome {
                tracing::debug!(child = %child, error = %err, "removed child failed while stopping");
            }
            if workers.stopping.is_empty() {
                for id in std::mem::take(&mut workers.deferred) {
                    if let Some(entry) = state.children.iter_mut().find(|entry| entry.id == id) {
                        self.start_child(entry, workers);
                    }
                }
            }
            return Ok(());
        }

        let entry = state.children.iter_mut().find(|entry| entry.id == child);
        let name = entry
            .as_ref()
            .map(|entry| entry.source.name().to_string())
            .unwrap_or_else(|| child.to_string());
        if let Some(entry) = entry {
            entry.running = None;
        }

        match outcome {
            Ok(()) => {
                tracing::info!(child = %child, source = %name, "aggregate child stopped");
                Ok(())
            }
            Err(err) if self.config.fail_fast => {
                tracing::error!(child = %child, source = %name, error = %err, "aggregate child failed");
                Err(SourceError::Child {
                    name,
                    message: err.to_string(),
                })
            }
            Err(err) => {
                tracing::warn!(child = %child, source = %name, error = %err, "aggregate child failed; continuing without it");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl WeatherSource for Aggregator {
    fn name(&self) -> &str {
        AGGREGATE_SOURCE
    }

    fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    async fn listen(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        let Some(mut state) = lock(&self.state).take() else {
            return Err(SourceError::AlreadyListening(AGGREGATE_SOURCE.to_string()));
        };
        tracing::info!(children = state.children.len(), "aggregate listening");
        let result = self.run(&mut state, &cancel).await;
        self.restore(state);
        tracing::info!("aggregate stopped");
        result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
