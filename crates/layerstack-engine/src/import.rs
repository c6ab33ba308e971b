//! External source adapter
//!
//! Binds an import node to a node published by another layer. The adapter
//! polls the remote publication endpoint, compares what it sees with what it
//! saw last time, and hands any change to the scheduler as an
//! [`ImportUpdate`]. It never writes the value store or runs the graph itself.
//!
//! Liveness is tracked separately from value changes: a failed fetch leaves
//! the import's record alone until the remote has been unreachable for more
//! consecutive polls than the binding's staleness threshold.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{FetchError, LayerError, Result};
use crate::events::{emit, EventSink, LayerEvent};
use crate::fingerprint::Fingerprint;
use crate::publication::{Publication, PublishedValue};
use crate::registry::ImportBinding;
use crate::scheduler::SchedulerHandle;
use crate::store::ValueStore;
use crate::types::{FailureReason, NodeId, NodeStatus};

/// Where an import reads its remote values from
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch the current published record of a remote node
    async fn fetch(&self, node: &str) -> std::result::Result<PublishedValue, FetchError>;

    /// Human-readable address, for logs
    fn describe(&self) -> String;
}

/// Reads another layer's publication in the same process
#[derive(Clone)]
pub struct PublicationSource {
    name: String,
    publication: Publication,
}

impl PublicationSource {
    pub fn new(name: impl Into<String>, publication: Publication) -> Self {
        Self {
            name: name.into(),
            publication,
        }
    }
}

#[async_trait]
impl RemoteSource for PublicationSource {
    async fn fetch(&self, node: &str) -> std::result::Result<PublishedValue, FetchError> {
        self.publication
            .get(node)
            .map_err(|_| FetchError::NotPublished(node.to_string()))
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Turns an import binding's remote address into a source
pub trait SourceConnector: Send + Sync {
    fn connect(&self, binding: &ImportBinding) -> Result<Arc<dyn RemoteSource>>;
}

/// Connects remote names to layers running in this process
#[derive(Clone, Default)]
pub struct LocalConnector {
    publications: HashMap<String, Publication>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a layer's publication reachable under `remote`
    pub fn with_layer(mut self, remote: impl Into<String>, publication: Publication) -> Self {
        self.publications.insert(remote.into(), publication);
        self
    }
}

impl SourceConnector for LocalConnector {
    fn connect(&self, binding: &ImportBinding) -> Result<Arc<dyn RemoteSource>> {
        let publication = self.publications.get(&binding.remote).ok_or_else(|| {
            LayerError::InvalidConfig(format!("no local layer named '{}'", binding.remote))
        })?;
        Ok(Arc::new(PublicationSource::new(
            binding.remote.clone(),
            publication.clone(),
        )))
    }
}

/// A change observed on the remote, to be written by the scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum ImportUpdate {
    /// The remote node has a new (or recovered) value
    Value {
        value: serde_json::Value,
        fingerprint: Fingerprint,
        remote_version: u64,
    },
    /// The remote reported the node as failed
    RemoteFailed { message: String },
    /// The remote stayed unreachable past the staleness threshold
    Unreachable { message: String },
}

/// What the scheduler must do after writing an import update
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ImportEffect {
    /// Run the import's consumers
    Trigger,
    /// Fail the import and everything downstream
    Fail(FailureReason),
    Nothing,
}

impl ImportUpdate {
    /// Write the update into the import node's record
    pub(crate) fn write(self, node: &str, store: &ValueStore) -> ImportEffect {
        match self {
            Self::Value {
                value, fingerprint, ..
            } => {
                let current = store.get(node).unwrap_or_default();
                let next = current.succeeded(value, fingerprint, store.tick());
                let changed = next.version != current.version;
                let recovered = current.status != NodeStatus::Fresh;
                store.replace(node, next);
                if changed || recovered {
                    ImportEffect::Trigger
                } else {
                    ImportEffect::Nothing
                }
            }
            Self::RemoteFailed { message } => {
                ImportEffect::Fail(FailureReason::RemoteFailed { message })
            }
            Self::Unreachable { message } => {
                ImportEffect::Fail(FailureReason::UpstreamUnreachable { message })
            }
        }
    }
}

/// Result of one poll
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Nothing changed since the last observation
    Unchanged,
    /// The remote has not produced a value yet
    NotReady,
    /// The fetch failed; still within the staleness threshold
    Unreachable { consecutive_failures: u32 },
    /// Something must be written to the import node
    Update(ImportUpdate),
}

/// Last observed remote state
#[derive(Debug, Clone, PartialEq)]
struct Observation {
    fingerprint: Option<Fingerprint>,
    status: NodeStatus,
}

/// Polls one remote node for one import
pub struct ImportAdapter {
    node: NodeId,
    binding: ImportBinding,
    source: Arc<dyn RemoteSource>,
    events: Arc<dyn EventSink>,
    last_observed: Option<Observation>,
    consecutive_failures: u32,
    escalated: bool,
}

impl ImportAdapter {
    pub fn new(
        node: impl Into<NodeId>,
        binding: ImportBinding,
        source: Arc<dyn RemoteSource>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            node: node.into(),
            binding,
            source,
            events,
            last_observed: None,
            consecutive_failures: 0,
            escalated: false,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn binding(&self) -> &ImportBinding {
        &self.binding
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Fetch once and compare with the last observation
    pub async fn poll(&mut self) -> PollOutcome {
        let fetched = match tokio::time::timeout(
            self.binding.request_timeout,
            self.source.fetch(&self.binding.remote_node),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Unreachable(format!(
                "no response within {:?}",
                self.binding.request_timeout
            ))),
        };

        match fetched {
            Ok(published) => self.observe(published),
            Err(e) => self.record_failure(e),
        }
    }

    fn observe(&mut self, published: PublishedValue) -> PollOutcome {
        if self.consecutive_failures > 0 {
            log::info!(
                "Import '{}' reached {} again after {} failed polls",
                self.node,
                self.source.describe(),
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.escalated = false;

        let fingerprint = match (&published.fingerprint, published.status) {
            (Some(fp), _) => Some(fp.clone()),
            (None, NodeStatus::Fresh) => Some(Fingerprint::of(&published.value)),
            (None, _) => None,
        };
        let observation = Observation {
            fingerprint,
            status: published.status,
        };
        if self.last_observed.as_ref() == Some(&observation) {
            return PollOutcome::Unchanged;
        }
        self.last_observed = Some(observation.clone());

        match observation.status {
            NodeStatus::Pending => {
                log::debug!("Import '{}': remote value not ready", self.node);
                PollOutcome::NotReady
            }
            NodeStatus::Failed => {
                let message = published
                    .error
                    .unwrap_or_else(|| "remote node failed".to_string());
                log::warn!("Import '{}': remote failed: {}", self.node, message);
                PollOutcome::Update(ImportUpdate::RemoteFailed { message })
            }
            NodeStatus::Fresh => {
                let fingerprint = observation
                    .fingerprint
                    .unwrap_or_else(|| Fingerprint::of(&published.value));
                log::debug!(
                    "Import '{}' observed remote v{} ({})",
                    self.node,
                    published.version,
                    fingerprint
                );
                emit(
                    self.events.as_ref(),
                    LayerEvent::ImportUpdated {
                        node: self.node.clone(),
                        remote_version: published.version,
                        fingerprint: fingerprint.to_string(),
                    },
                );
                PollOutcome::Update(ImportUpdate::Value {
                    value: published.value,
                    fingerprint,
                    remote_version: published.version,
                })
            }
        }
    }

    fn record_failure(&mut self, error: FetchError) -> PollOutcome {
        self.consecutive_failures += 1;
        let failures = self.consecutive_failures;
        log::warn!(
            "Import '{}': poll of {} failed ({} in a row): {}",
            self.node,
            self.source.describe(),
            failures,
            error
        );
        emit(
            self.events.as_ref(),
            LayerEvent::ImportUnreachable {
                node: self.node.clone(),
                consecutive_failures: failures,
                error: error.to_string(),
            },
        );

        match self.binding.staleness_threshold {
            Some(threshold) if failures > threshold && !self.escalated => {
                self.escalated = true;
                // Forget the last observation so the next good fetch restores the node
                self.last_observed = None;
                PollOutcome::Update(ImportUpdate::Unreachable {
                    message: format!("{} failed polls: {}", failures, error),
                })
            }
            _ => PollOutcome::Unreachable {
                consecutive_failures: failures,
            },
        }
    }
}

/// Poll on the binding's interval and forward updates to the scheduler
///
/// The task ends when the scheduler stops.
pub fn spawn(adapter: Arc<Mutex<ImportAdapter>>, scheduler: SchedulerHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (node, interval) = {
            let adapter = adapter.lock().await;
            (adapter.node.clone(), adapter.binding.poll_interval)
        };
        log::info!("Polling import '{}' every {:?}", node, interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcome = adapter.lock().await.poll().await;
            if let PollOutcome::Update(update) = outcome {
                if scheduler.import(node.clone(), update).is_err() {
                    break;
                }
            }
        }
        log::debug!("Import poller for '{}' stopped", node);
    })
}
