//! Change notifications for member clusters and the worker loop that acts on them
//!
//! A [`Trigger`] yields one [`ClusterEvent`] per observed change. [`run`]
//! keeps at most one worker per [`ClusterKey`]: an event arriving while that
//! key's worker is busy marks it dirty, and the worker reconciles once more
//! before it exits. No event is lost and one key is never reconciled twice
//! at the same time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::controller::{reconcile, Context};
use crate::crd::{is_member_labels, ClusterDeployment};
use crate::naming::ClusterKey;
use crate::retry::RetryConfig;

/// A change to a member cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterEvent {
    /// Cluster that changed
    pub key: ClusterKey,
    /// True when the change was a deletion
    pub deleted: bool,
}

/// Source of cluster change notifications.
#[cfg_attr(test, automock)]
pub trait Trigger: Send + Sync {
    /// Stream of changes, ending only when the source shuts down
    fn events(&self) -> BoxStream<'static, ClusterEvent>;
}

/// Event for `cd` if its membership label carries an accepted value.
pub fn cluster_event(cd: &ClusterDeployment, deleted: bool, config: &MeshConfig) -> Option<ClusterEvent> {
    if !is_member_labels(cd.labels(), config) {
        return None;
    }
    Some(ClusterEvent {
        key: cd.key(),
        deleted,
    })
}

/// [`Trigger`] backed by a watch on ClusterDeployments carrying the membership label.
pub struct KubeTrigger {
    client: Client,
    config: Arc<MeshConfig>,
}

impl KubeTrigger {
    /// Create a trigger watching all namespaces
    pub fn new(client: Client, config: Arc<MeshConfig>) -> Self {
        Self { client, config }
    }
}

impl Trigger for KubeTrigger {
    fn events(&self) -> BoxStream<'static, ClusterEvent> {
        let api: Api<ClusterDeployment> = Api::all(self.client.clone());
        let watch_config = watcher::Config::default()
            .labels(&self.config.role_label)
            .timeout(self.config.watch_timeout_secs);
        let config = self.config.clone();

        watcher(api, watch_config)
            .default_backoff()
            .filter_map(move |event| {
                let event = match event {
                    Ok(watcher::Event::Apply(cd)) | Ok(watcher::Event::InitApply(cd)) => {
                        cluster_event(&cd, false, &config)
                    }
                    Ok(watcher::Event::Delete(cd)) => cluster_event(&cd, true, &config),
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                    Err(e) => {
                        warn!(error = %e, "ClusterDeployment watch failed, restarting");
                        None
                    }
                };
                futures::future::ready(event)
            })
            .boxed()
    }
}

type Workers = Arc<DashMap<ClusterKey, Arc<AtomicBool>>>;

/// Reconcile every cluster the trigger reports until `cancel` fires or the
/// trigger ends, then wait for in-flight workers.
pub async fn run(trigger: &dyn Trigger, ctx: Arc<Context>, cancel: CancellationToken) {
    let workers: Workers = Arc::new(DashMap::new());
    let mut tasks = JoinSet::new();
    let mut events = trigger.events();

    info!("Watching member clusters");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = result {
                    warn!(error = %e, "Reconcile worker aborted");
                }
            }
            event = events.next() => match event {
                Some(event) => dispatch(event, &workers, &mut tasks, &ctx, &cancel),
                None => break,
            },
        }
    }

    debug!(in_flight = tasks.len(), "Waiting for reconcile workers");
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Reconcile worker aborted");
        }
    }
    info!("Stopped watching member clusters");
}

fn dispatch(
    event: ClusterEvent,
    workers: &Workers,
    tasks: &mut JoinSet<()>,
    ctx: &Arc<Context>,
    cancel: &CancellationToken,
) {
    debug!(cluster = %event.key, deleted = event.deleted, "Cluster changed");
    match workers.entry(event.key.clone()) {
        Entry::Occupied(entry) => {
            entry.get().store(true, Ordering::SeqCst);
            debug!(cluster = %event.key, "Reconcile in progress, queued another pass");
        }
        Entry::Vacant(entry) => {
            let dirty = Arc::new(AtomicBool::new(false));
            entry.insert(dirty.clone());
            tasks.spawn(worker(
                event.key,
                dirty,
                workers.clone(),
                ctx.clone(),
                cancel.clone(),
            ));
        }
    }
}

async fn worker(
    key: ClusterKey,
    dirty: Arc<AtomicBool>,
    workers: Workers,
    ctx: Arc<Context>,
    cancel: CancellationToken,
) {
    loop {
        reconcile_until_settled(&key, &dirty, &ctx, &cancel).await;

        if cancel.is_cancelled() {
            workers.remove(&key);
            return;
        }
        // Exit unless an event arrived meanwhile. Holding the shard lock here
        // orders us against dispatch.
        if workers
            .remove_if(&key, |_, d| !d.swap(false, Ordering::SeqCst))
            .is_some()
        {
            return;
        }
    }
}

/// Retry `reconcile` with backoff until it succeeds, a newer event
/// supersedes it, or shutdown.
async fn reconcile_until_settled(
    key: &ClusterKey,
    dirty: &AtomicBool,
    ctx: &Context,
    cancel: &CancellationToken,
) {
    let mut backoff = RetryConfig::reconcile().backoff();
    loop {
        match reconcile(key, ctx).await {
            Ok(outcome) => {
                debug!(cluster = %key, ?outcome, "Reconcile finished");
                return;
            }
            Err(e) => {
                if dirty.load(Ordering::SeqCst) {
                    debug!(cluster = %key, error = %e, "Reconcile failed, newer event pending");
                    return;
                }
                let delay = backoff.next_delay();
                warn!(cluster = %key, error = %e, retry_in = ?delay, "Reconcile failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
