//! Gated actions
//!
//! Plan nodes propose side effects; nothing is applied until a human approves
//! it. Each action moves through `Proposed -> Approved -> Applied` at most
//! once, and is refused if the node it targets has moved on since the
//! proposal was made.
//!
//! The ledger keeps every action (pending and archived) and can persist to a
//! JSON file so an applied action is never re-applied after a restart.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ComputeError, LayerError, Result};
use crate::events::{emit, EventSink, LayerEvent};
use crate::store::ValueStore;
use crate::types::NodeId;

/// A side effect as emitted by a plan node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedAction {
    /// Plan-local name of the action (e.g. `add_clues`)
    pub key: String,
    /// Node whose state the action would change
    pub target: NodeId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ProposedAction {
    pub fn new(
        key: impl Into<String>,
        target: impl Into<NodeId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            key: key.into(),
            target: target.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Proposed,
    Approved,
    Applied,
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// The plan stopped proposing it
    Superseded,
    /// Its target advanced before it could be applied
    Stale,
    /// Discarded by the approver
    Manual,
}

/// A tracked action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub plan: NodeId,
    pub key: String,
    pub target: NodeId,
    pub payload: serde_json::Value,
    /// Version of `target` when the action was proposed
    pub target_version: u64,
    pub state: ActionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discard_reason: Option<DiscardReason>,
    pub proposed_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<u64>,
    /// What the applier returned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl Action {
    pub fn approved(&self) -> bool {
        matches!(self.state, ActionState::Approved | ActionState::Applied)
    }

    pub fn applied(&self) -> bool {
        self.state == ActionState::Applied
    }

    /// Still waiting for approval or application
    pub fn is_pending(&self) -> bool {
        matches!(self.state, ActionState::Proposed | ActionState::Approved)
    }
}

/// Deterministic id of a proposal against a specific target version
pub fn action_id(plan: &str, proposal: &ProposedAction, target_version: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in [plan, proposal.key.as_str(), proposal.target.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    hasher.update(&target_version.to_le_bytes());
    hasher.update(&serde_json::to_vec(&proposal.payload).unwrap_or_default());
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..16].to_string()
}

/// Boundary to whoever approves actions
pub trait ApprovalGate: Send + Sync {
    fn approve(&self, action_id: &str);

    fn is_approved(&self, action_id: &str) -> bool;
}

/// Approvals held in memory
#[derive(Debug, Default)]
pub struct InMemoryApprovals {
    approved: RwLock<HashSet<String>>,
}

impl InMemoryApprovals {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalGate for InMemoryApprovals {
    fn approve(&self, action_id: &str) {
        self.approved.write().insert(action_id.to_string());
    }

    fn is_approved(&self, action_id: &str) -> bool {
        self.approved.read().contains(action_id)
    }
}

/// Performs the side effect of an approved action
#[async_trait]
pub trait ActionApplier: Send + Sync {
    async fn apply(&self, action: &Action) -> std::result::Result<serde_json::Value, ComputeError>;
}

/// Applier backed by a synchronous closure
pub struct FnApplier {
    callback: Box<
        dyn Fn(&Action) -> std::result::Result<serde_json::Value, ComputeError> + Send + Sync,
    >,
}

impl FnApplier {
    pub fn new(
        callback: impl Fn(&Action) -> std::result::Result<serde_json::Value, ComputeError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl ActionApplier for FnApplier {
    async fn apply(&self, action: &Action) -> std::result::Result<serde_json::Value, ComputeError> {
        (self.callback)(action)
    }
}

/// Applier that only logs the action
pub struct LogApplier;

#[async_trait]
impl ActionApplier for LogApplier {
    async fn apply(&self, action: &Action) -> std::result::Result<serde_json::Value, ComputeError> {
        log::info!(
            "Applying action '{}' ({}) to '{}': {}",
            action.id,
            action.key,
            action.target,
            action.payload
        );
        Ok(serde_json::Value::Null)
    }
}

/// All known actions in proposal order, with optional file persistence
#[derive(Debug, Default)]
pub struct ActionLedger {
    actions: Vec<Action>,
    index: HashMap<String, usize>,
    persist_path: Option<PathBuf>,
}

impl ActionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ledger that is saved to `path` after every transition
    pub fn with_persistence(path: impl AsRef<Path>) -> Self {
        Self {
            persist_path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Load actions from the persistence file
    ///
    /// Returns the number of actions loaded.
    pub fn load_from_disk(&mut self) -> Result<usize> {
        let Some(ref path) = self.persist_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let content = std::fs::read_to_string(path)?;
        let actions: Vec<Action> = serde_json::from_str(&content)?;
        self.index = actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), i))
            .collect();
        self.actions = actions;
        log::info!("Loaded {} actions from {:?}", self.actions.len(), path);
        Ok(self.actions.len())
    }

    /// Write the ledger out (if persistence is enabled)
    pub fn save_to_disk(&self) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&self.actions)?)?;
        std::fs::rename(&tmp, path)?;
        log::debug!("Saved {} actions to {:?}", self.actions.len(), path);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Action> {
        self.index.get(id).map(|&i| &self.actions[i])
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Action> {
        self.index.get(id).map(|&i| &mut self.actions[i])
    }

    fn insert(&mut self, action: Action) {
        self.index.insert(action.id.clone(), self.actions.len());
        self.actions.push(action);
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Actions still waiting for approval or application
    pub fn pending(&self) -> Vec<Action> {
        self.actions.iter().filter(|a| a.is_pending()).cloned().collect()
    }

    /// Applied and discarded actions
    pub fn archived(&self) -> Vec<Action> {
        self.actions.iter().filter(|a| !a.is_pending()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Result of a successful apply request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied { result: serde_json::Value },
    /// Already applied earlier; nothing was done
    AlreadyApplied,
}

/// What a reconcile pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub proposed: Vec<String>,
    pub superseded: Vec<String>,
}

/// Applies approved actions at most once, refusing stale ones
///
/// Owned by the scheduler task, so transitions never race. Readers get a
/// shared handle to the ledger through [`GatedActionExecutor::ledger`].
pub struct GatedActionExecutor {
    ledger: Arc<RwLock<ActionLedger>>,
    gate: Arc<dyn ApprovalGate>,
    applier: Arc<dyn ActionApplier>,
    events: Arc<dyn EventSink>,
}

impl GatedActionExecutor {
    pub fn new(
        ledger: ActionLedger,
        gate: Arc<dyn ApprovalGate>,
        applier: Arc<dyn ActionApplier>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        // Approvals recorded in a reloaded ledger outlive the gate that saw them
        let mut restored = 0;
        for action in ledger.actions().iter().filter(|a| a.state == ActionState::Approved) {
            gate.approve(&action.id);
            restored += 1;
        }
        if restored > 0 {
            log::info!("Restored {} approvals from the action ledger", restored);
        }

        Self {
            ledger: Arc::new(RwLock::new(ledger)),
            gate,
            applier,
            events,
        }
    }

    /// Shared read handle to the ledger
    pub fn ledger(&self) -> Arc<RwLock<ActionLedger>> {
        Arc::clone(&self.ledger)
    }

    pub fn gate(&self) -> &Arc<dyn ApprovalGate> {
        &self.gate
    }

    /// Merge a plan node's latest proposals into the ledger
    pub fn reconcile(
        &mut self,
        plan: &str,
        proposals: &[ProposedAction],
        store: &ValueStore,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut ledger = self.ledger.write();
        let mut current = HashSet::new();

        for proposal in proposals {
            let Some(target_version) = store.version(&proposal.target) else {
                log::warn!(
                    "Plan '{}' proposed '{}' against unknown node '{}'; dropped",
                    plan,
                    proposal.key,
                    proposal.target
                );
                continue;
            };
            let id = action_id(plan, proposal, target_version);
            current.insert(id.clone());
            if let Some(known) = ledger.get_mut(&id) {
                // Only a superseded action comes back; applied, stale and
                // manually discarded ones stay archived
                if known.discard_reason == Some(DiscardReason::Superseded) {
                    known.state = if self.gate.is_approved(&id) {
                        ActionState::Approved
                    } else {
                        ActionState::Proposed
                    };
                    known.discard_reason = None;
                    log::info!("Plan '{}' re-proposed action '{}' ({})", plan, id, proposal.key);
                    emit(
                        self.events.as_ref(),
                        LayerEvent::ActionProposed {
                            action_id: id.clone(),
                            plan: plan.to_string(),
                            target: proposal.target.clone(),
                        },
                    );
                    report.proposed.push(id);
                }
                continue;
            }

            log::info!("Plan '{}' proposed action '{}' ({})", plan, id, proposal.key);
            emit(
                self.events.as_ref(),
                LayerEvent::ActionProposed {
                    action_id: id.clone(),
                    plan: plan.to_string(),
                    target: proposal.target.clone(),
                },
            );
            ledger.insert(Action {
                id: id.clone(),
                plan: plan.to_string(),
                key: proposal.key.clone(),
                target: proposal.target.clone(),
                payload: proposal.payload.clone(),
                target_version,
                state: ActionState::Proposed,
                discard_reason: None,
                proposed_at: store.now(),
                applied_at: None,
                result: None,
            });
            report.proposed.push(id);
        }

        for action in ledger.actions.iter_mut() {
            if action.plan == plan && action.is_pending() && !current.contains(&action.id) {
                action.state = ActionState::Discarded;
                action.discard_reason = Some(DiscardReason::Superseded);
                emit(
                    self.events.as_ref(),
                    LayerEvent::action_rejected(&action.id, "superseded"),
                );
                report.superseded.push(action.id.clone());
            }
        }

        if !report.proposed.is_empty() || !report.superseded.is_empty() {
            ledger.save_to_disk()?;
        }
        Ok(report)
    }

    /// Record an approval for a pending action
    pub fn approve(&mut self, id: &str) -> Result<()> {
        let mut ledger = self.ledger.write();
        let action = ledger
            .get_mut(id)
            .ok_or_else(|| LayerError::ActionNotFound(id.to_string()))?;
        match action.state {
            ActionState::Discarded => return Err(LayerError::ActionDiscarded(id.to_string())),
            ActionState::Applied | ActionState::Approved => {
                self.gate.approve(id);
                return Ok(());
            }
            ActionState::Proposed => action.state = ActionState::Approved,
        }
        self.gate.approve(id);
        log::info!("Action '{}' approved", id);
        ledger.save_to_disk()
    }

    /// Manually discard a pending action
    ///
    /// Returns false when the action was already archived.
    pub fn discard(&mut self, id: &str) -> Result<bool> {
        let mut ledger = self.ledger.write();
        let action = ledger
            .get_mut(id)
            .ok_or_else(|| LayerError::ActionNotFound(id.to_string()))?;
        if !action.is_pending() {
            return Ok(false);
        }
        action.state = ActionState::Discarded;
        action.discard_reason = Some(DiscardReason::Manual);
        emit(self.events.as_ref(), LayerEvent::action_rejected(id, "discarded"));
        ledger.save_to_disk()?;
        Ok(true)
    }

    /// Apply one action if it is approved and its target has not moved on
    pub async fn apply(&mut self, id: &str, store: &ValueStore) -> Result<ApplyOutcome> {
        let action = self
            .ledger
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| LayerError::ActionNotFound(id.to_string()))?;

        match action.state {
            ActionState::Applied => return Ok(ApplyOutcome::AlreadyApplied),
            ActionState::Discarded => return Err(LayerError::ActionDiscarded(id.to_string())),
            ActionState::Proposed | ActionState::Approved => {}
        }

        if !self.gate.is_approved(id) {
            return Err(LayerError::NotApproved(id.to_string()));
        }

        let current = store.version(&action.target).unwrap_or(0);
        if current != action.target_version {
            log::warn!(
                "Refusing stale action '{}': '{}' moved from v{} to v{}",
                id,
                action.target,
                action.target_version,
                current
            );
            self.transition(id, |a| {
                a.state = ActionState::Discarded;
                a.discard_reason = Some(DiscardReason::Stale);
            })?;
            emit(self.events.as_ref(), LayerEvent::action_rejected(id, "stale"));
            return Err(LayerError::StaleAction {
                action: id.to_string(),
                target: action.target,
                proposed_at: action.target_version,
                current,
            });
        }

        let result = self
            .applier
            .apply(&action)
            .await
            .map_err(|e| LayerError::ApplyFailed {
                action: id.to_string(),
                message: e.message,
            })?;

        let applied_at = store.tick();
        self.transition(id, |a| {
            a.state = ActionState::Applied;
            a.applied_at = Some(applied_at);
            a.result = Some(result.clone());
        })?;
        log::info!("Applied action '{}' to '{}'", id, action.target);
        emit(
            self.events.as_ref(),
            LayerEvent::ActionApplied {
                action_id: id.to_string(),
            },
        );
        Ok(ApplyOutcome::Applied { result })
    }

    /// Apply every pending action the gate reports approved, in proposal order
    pub async fn apply_approved(
        &mut self,
        store: &ValueStore,
    ) -> Vec<(String, Result<ApplyOutcome>)> {
        let ready: Vec<String> = self
            .ledger
            .read()
            .actions()
            .iter()
            .filter(|a| a.is_pending() && self.gate.is_approved(&a.id))
            .map(|a| a.id.clone())
            .collect();

        let mut outcomes = Vec::with_capacity(ready.len());
        for id in ready {
            let outcome = self.apply(&id, store).await;
            if let Err(e) = &outcome {
                log::warn!("Action '{}' not applied: {}", id, e);
            }
            outcomes.push((id, outcome));
        }
        outcomes
    }

    fn transition(&self, id: &str, update: impl FnOnce(&mut Action)) -> Result<()> {
        let mut ledger = self.ledger.write();
        let action = ledger
            .get_mut(id)
            .ok_or_else(|| LayerError::ActionNotFound(id.to_string()))?;
        update(action);
        ledger.save_to_disk()
    }
}
