//! Scheduler loop
//!
//! One task per layer owns the reactive executor and the gated action
//! executor. Everything that writes the value store goes through it, so runs
//! never overlap and every run sees a consistent set of inputs.
//!
//! Before each cycle the loop drains every request that is already queued
//! into one batch. A node that was queued twice appears once, and a newer
//! import update for a node replaces the older one. Import updates are
//! written in arrival order, then a single run covers the whole batch, then
//! plan nodes are reconciled and approved actions applied.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::actions::{ApplyOutcome, GatedActionExecutor, ProposedAction};
use crate::error::{LayerError, Result};
use crate::executor::{ReactiveExecutor, RunReport};
use crate::import::{ImportEffect, ImportUpdate};
use crate::types::NodeId;

type RunReply = oneshot::Sender<Result<RunReport>>;

/// Outcomes of applying approved actions, by action id
pub type ApplyResults = Vec<(String, Result<ApplyOutcome>)>;

enum Request {
    Trigger {
        nodes: Vec<NodeId>,
        reply: Option<RunReply>,
    },
    Import {
        node: NodeId,
        update: ImportUpdate,
        reply: Option<RunReply>,
    },
    Approve {
        action: String,
        reply: oneshot::Sender<Result<ApplyOutcome>>,
    },
    Discard {
        action: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    ApplyApproved {
        reply: oneshot::Sender<ApplyResults>,
    },
    Shutdown,
}

/// Action requests are serviced after the batch's run, in arrival order
enum ActionRequest {
    Approve {
        action: String,
        reply: oneshot::Sender<Result<ApplyOutcome>>,
    },
    Discard {
        action: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    ApplyApproved {
        reply: oneshot::Sender<ApplyResults>,
    },
}

/// Requests coalesced into one cycle
#[derive(Default)]
struct Batch {
    triggers: Vec<NodeId>,
    imports: Vec<(NodeId, ImportUpdate)>,
    run_replies: Vec<RunReply>,
    actions: Vec<ActionRequest>,
    shutdown: bool,
}

impl Batch {
    fn push(&mut self, request: Request) {
        match request {
            Request::Trigger { nodes, reply } => {
                for node in nodes {
                    if !self.triggers.contains(&node) {
                        self.triggers.push(node);
                    }
                }
                self.run_replies.extend(reply);
            }
            Request::Import {
                node,
                update,
                reply,
            } => {
                match self.imports.iter_mut().find(|(n, _)| *n == node) {
                    Some(slot) => slot.1 = update,
                    None => self.imports.push((node, update)),
                }
                self.run_replies.extend(reply);
            }
            Request::Approve { action, reply } => {
                self.actions.push(ActionRequest::Approve { action, reply })
            }
            Request::Discard { action, reply } => {
                self.actions.push(ActionRequest::Discard { action, reply })
            }
            Request::ApplyApproved { reply } => {
                self.actions.push(ActionRequest::ApplyApproved { reply })
            }
            Request::Shutdown => self.shutdown = true,
        }
    }
}

/// Cheap, cloneable sender side of a layer's scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl SchedulerHandle {
    fn send(&self, request: Request) -> Result<()> {
        self.tx.send(request).map_err(|_| LayerError::SchedulerClosed)
    }

    /// Queue a run of the given nodes without waiting for it
    pub fn trigger(&self, nodes: Vec<NodeId>) -> Result<()> {
        self.send(Request::Trigger { nodes, reply: None })
    }

    /// Queue a run of the given nodes and wait for its report
    pub async fn run(&self, nodes: Vec<NodeId>) -> Result<RunReport> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Trigger {
            nodes,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| LayerError::SchedulerClosed)?
    }

    /// Queue an import update without waiting for it
    pub fn import(&self, node: NodeId, update: ImportUpdate) -> Result<()> {
        self.send(Request::Import {
            node,
            update,
            reply: None,
        })
    }

    /// Queue an import update and wait for the run it causes
    pub async fn import_and_wait(&self, node: NodeId, update: ImportUpdate) -> Result<RunReport> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Import {
            node,
            update,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| LayerError::SchedulerClosed)?
    }

    /// Approve an action and apply it
    pub async fn approve(&self, action: impl Into<String>) -> Result<ApplyOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Approve {
            action: action.into(),
            reply,
        })?;
        rx.await.map_err(|_| LayerError::SchedulerClosed)?
    }

    pub async fn discard(&self, action: impl Into<String>) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Discard {
            action: action.into(),
            reply,
        })?;
        rx.await.map_err(|_| LayerError::SchedulerClosed)?
    }

    /// Apply every action the approval gate reports approved
    pub async fn apply_approved(&self) -> Result<ApplyResults> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::ApplyApproved { reply })?;
        rx.await.map_err(|_| LayerError::SchedulerClosed)
    }

    /// Ask the loop to stop after the current batch
    pub fn shutdown(&self) {
        let _ = self.send(Request::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The per-layer scheduler loop
pub struct Scheduler {
    executor: ReactiveExecutor,
    actions: GatedActionExecutor,
    rx: mpsc::UnboundedReceiver<Request>,
}

impl Scheduler {
    pub fn new(
        executor: ReactiveExecutor,
        actions: GatedActionExecutor,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                executor,
                actions,
                rx,
            },
            SchedulerHandle { tx },
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Service requests until shut down or every handle is dropped
    pub async fn run(mut self) {
        log::debug!("Scheduler started");
        while let Some(first) = self.rx.recv().await {
            let mut batch = Batch::default();
            batch.push(first);
            while let Ok(next) = self.rx.try_recv() {
                batch.push(next);
            }

            let shutdown = batch.shutdown;
            self.service(batch).await;
            if shutdown {
                break;
            }
        }
        log::debug!("Scheduler stopped");
    }

    async fn service(&mut self, batch: Batch) {
        let Batch {
            mut triggers,
            imports,
            run_replies,
            actions,
            ..
        } = batch;

        let graph = Arc::clone(self.executor.graph());
        let store = Arc::clone(self.executor.store());

        let unknown: Vec<NodeId> = triggers
            .iter()
            .filter(|n| graph.plan().position(n).is_none())
            .cloned()
            .collect();
        if !unknown.is_empty() {
            log::warn!("Ignoring triggers for unknown nodes: {:?}", unknown);
            triggers.retain(|n| !unknown.contains(n));
        }

        for (node, update) in imports {
            if graph.node(&node).map_or(true, |def| !def.is_import()) {
                log::warn!("Ignoring import update for '{}': not an import node", node);
                continue;
            }
            match update.write(&node, &store) {
                ImportEffect::Trigger => {
                    if !triggers.contains(&node) {
                        triggers.push(node);
                    }
                }
                ImportEffect::Fail(reason) => {
                    if let Err(e) = self.executor.mark_failed(&node, reason) {
                        log::error!("Failed to mark '{}' failed: {}", node, e);
                    }
                }
                ImportEffect::Nothing => {}
            }
        }

        let report = if triggers.is_empty() {
            Ok(RunReport::default())
        } else {
            self.executor.run(&triggers).await
        };

        match report {
            Ok(report) => {
                self.reconcile_plans(&report);
                for reply in run_replies {
                    let _ = reply.send(Ok(report.clone()));
                }
            }
            Err(e) => {
                log::error!("Run failed: {}", e);
                // Waiters observe the dropped reply as a closed scheduler
                drop(run_replies);
            }
        }

        for request in actions {
            match request {
                ActionRequest::Approve { action, reply } => {
                    let outcome = match self.actions.approve(&action) {
                        Ok(()) => self.actions.apply(&action, &store).await,
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(outcome);
                }
                ActionRequest::Discard { action, reply } => {
                    let _ = reply.send(self.actions.discard(&action));
                }
                ActionRequest::ApplyApproved { reply } => {
                    let _ = reply.send(self.actions.apply_approved(&store).await);
                }
            }
        }

        for (id, outcome) in self.actions.apply_approved(&store).await {
            if let Ok(ApplyOutcome::Applied { .. }) = outcome {
                log::debug!("Applied approved action '{}' after run", id);
            }
        }
    }

    /// Merge the proposals of every plan node that ran successfully
    fn reconcile_plans(&mut self, report: &RunReport) {
        let graph = Arc::clone(self.executor.graph());
        let store = Arc::clone(self.executor.store());

        for name in &report.invoked {
            if !graph.node(name).is_some_and(|def| def.is_plan()) {
                continue;
            }
            let Some(record) = store.get(name).filter(|r| r.is_fresh()) else {
                continue;
            };
            let proposals: Vec<ProposedAction> =
                match serde_json::from_value(record.value.clone()) {
                    Ok(p) => p,
                    Err(e) => {
                        log::error!("Plan '{}' value is not a list of actions: {}", name, e);
                        continue;
                    }
                };
            match self.actions.reconcile(name, &proposals, &store) {
                Ok(r) if !r.proposed.is_empty() || !r.superseded.is_empty() => log::info!(
                    "Plan '{}': {} new actions, {} superseded",
                    name,
                    r.proposed.len(),
                    r.superseded.len()
                ),
                Ok(_) => {}
                Err(e) => log::error!("Failed to reconcile plan '{}': {}", name, e),
            }
        }
    }
}
