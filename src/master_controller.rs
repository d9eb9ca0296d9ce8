//! Master Controller (C5, §4.5): the order/instant-action correlation
//! engine atop a `MasterControlClient`. Diffs successive `State` reports
//! per AGV against cached orders/instant actions and emits semantically
//! meaningful events (node/edge traversed, action state changed, order
//! processed) in the fixed order required by §4.5.4.
//!
//! Event structs carry an owned `Arc<OrderBody>`/cloned `Action` rather
//! than a borrow into the cache (§9 design note: "safely modelled as
//! owned copies"); two events from the same order share the same `Arc`
//! allocation, so `Arc::ptr_eq` still recovers the "same order identity"
//! guarantee without threading a lifetime through the handler type.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::agv_id::AgvId;
use crate::errors::ClientError;
use crate::master_control_client::MasterControlClient;
use crate::protocol::vda5050_common::{error_reference_keys, error_types, VdaError};
use crate::protocol::vda_2_0_0::{
    Action, ActionState, ActionStatus, BlockingType, Edge, InstantActionsBody, Node, OperatingMode, OrderBody,
    SafetyState, StateBody,
};
use crate::protocol::Stamped;
use crate::topic::Topic;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ActionLocation {
    Node(usize),
    Edge(usize),
}

fn index_released_actions(order: &OrderBody) -> HashMap<String, ActionLocation> {
    let mut map = HashMap::new();
    for (i, node) in order.nodes.iter().enumerate() {
        if node.released {
            for action in &node.actions {
                map.insert(action.action_id.clone(), ActionLocation::Node(i));
            }
        }
    }
    for (i, edge) in order.edges.iter().enumerate() {
        if edge.released {
            for action in &edge.actions {
                map.insert(action.action_id.clone(), ActionLocation::Edge(i));
            }
        }
    }
    map
}

/// Looks up the error whose `errorReferences` correlate it to `action_id`
/// on the topic an order vs. an instant-actions batch would carry (§4.5.3
/// "asInstantAction" rule).
fn find_action_error<'a>(errors: &'a [VdaError], action_id: &str, as_instant_action: bool) -> Option<&'a VdaError> {
    let expected_topic = if as_instant_action { "instantActions" } else { "order" };
    errors.iter().find(|e| {
        e.reference(error_reference_keys::ACTION_ID) == Some(action_id)
            && e.reference(error_reference_keys::TOPIC) == Some(expected_topic)
    })
}

/// §4.5.3(b): "check cancelation by scanning the AGV's active instant
/// actions for `actionType == cancelOrder` with action status `Finished`
/// **on this state**". Reads the current inbound `state.action_states`
/// directly rather than the instant-action cache's `last_status`:
/// `dispatch_instant_actions` (which writes `last_status`) runs after
/// order completion is checked within the same `on_state` call (§4.5.4),
/// so `last_status` would still hold the *previous* tick's value here
/// and would never observe a same-tick transition to `Finished`.
fn order_canceled_this_state(
    instant_action_caches: &HashMap<(AgvId, String), InstantActionStateCache>,
    agv_id: &AgvId,
    action_states: &[ActionState],
) -> bool {
    instant_action_caches.iter().any(|((a, action_id), iac)| {
        a == agv_id
            && iac.action.action_type == "cancelOrder"
            && action_states.iter().any(|s| &s.action_id == action_id && s.action_status == ActionStatus::Finished)
    })
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct EdgeTraversingSnapshot {
    distance_since_last_node: Option<f32>,
    driving: bool,
    new_base_request: Option<bool>,
    operating_mode: OperatingMode,
    paused: Option<bool>,
    safety_state: SafetyState,
}

/// Which fields of an `EdgeTraversingSnapshot` changed against the prior
/// emission (§4.5.3's "reporting just the changed subset").
#[derive(Clone, Copy, Debug, Default)]
pub struct EdgeTraversingChangedFields {
    pub distance_since_last_node: bool,
    pub driving: bool,
    pub new_base_request: bool,
    pub operating_mode: bool,
    pub paused: bool,
    pub safety_state: bool,
}

impl EdgeTraversingChangedFields {
    fn any(&self) -> bool {
        self.distance_since_last_node
            || self.driving
            || self.new_base_request
            || self.operating_mode
            || self.paused
            || self.safety_state
    }
}

impl EdgeTraversingSnapshot {
    fn changed_against(&self, prev: Option<&EdgeTraversingSnapshot>) -> EdgeTraversingChangedFields {
        match prev {
            None => EdgeTraversingChangedFields {
                distance_since_last_node: true,
                driving: true,
                new_base_request: true,
                operating_mode: true,
                paused: true,
                safety_state: true,
            },
            Some(prev) => EdgeTraversingChangedFields {
                distance_since_last_node: self.distance_since_last_node != prev.distance_since_last_node,
                driving: self.driving != prev.driving,
                new_base_request: self.new_base_request != prev.new_base_request,
                operating_mode: self.operating_mode != prev.operating_mode,
                paused: self.paused != prev.paused,
                safety_state: self.safety_state != prev.safety_state,
            },
        }
    }
}

pub struct NodeTraversedEvent {
    pub agv_id: AgvId,
    pub order: Arc<OrderBody>,
    pub node_index: usize,
    pub next_edge_index: Option<usize>,
    pub next_end_node_index: Option<usize>,
}

impl NodeTraversedEvent {
    pub fn node(&self) -> &Node {
        &self.order.nodes[self.node_index]
    }
    pub fn next_edge(&self) -> Option<&Edge> {
        self.next_edge_index.map(|i| &self.order.edges[i])
    }
    pub fn next_end_node(&self) -> Option<&Node> {
        self.next_end_node_index.map(|i| &self.order.nodes[i])
    }
}

pub struct EdgeTraversedEvent {
    pub agv_id: AgvId,
    pub order: Arc<OrderBody>,
    pub edge_index: usize,
}

impl EdgeTraversedEvent {
    pub fn edge(&self) -> &Edge {
        &self.order.edges[self.edge_index]
    }
}

pub struct EdgeTraversingEvent {
    pub agv_id: AgvId,
    pub order: Arc<OrderBody>,
    pub edge_index: usize,
    snapshot: EdgeTraversingSnapshot,
    pub changed_fields: EdgeTraversingChangedFields,
    pub invocation: u32,
}

impl EdgeTraversingEvent {
    pub fn edge(&self) -> &Edge {
        &self.order.edges[self.edge_index]
    }
    pub fn distance_since_last_node(&self) -> Option<f32> {
        self.snapshot.distance_since_last_node
    }
    pub fn driving(&self) -> bool {
        self.snapshot.driving
    }
    pub fn operating_mode(&self) -> OperatingMode {
        self.snapshot.operating_mode
    }
}

pub struct ActionStateChangedEvent {
    pub agv_id: AgvId,
    pub action_state: ActionState,
    pub order: Option<Arc<OrderBody>>,
    location: Option<ActionLocation>,
    pub with_error: Option<VdaError>,
}

impl ActionStateChangedEvent {
    pub fn node(&self) -> Option<&Node> {
        match (&self.order, self.location) {
            (Some(order), Some(ActionLocation::Node(i))) => Some(&order.nodes[i]),
            _ => None,
        }
    }
    pub fn edge(&self) -> Option<&Edge> {
        match (&self.order, self.location) {
            (Some(order), Some(ActionLocation::Edge(i))) => Some(&order.edges[i]),
            _ => None,
        }
    }
}

pub struct ActionErrorEvent {
    pub agv_id: AgvId,
    pub action: Action,
    pub error: VdaError,
}

pub struct OrderProcessedEvent {
    pub agv_id: AgvId,
    pub order: Arc<OrderBody>,
    pub with_error: Option<VdaError>,
    pub by_cancelation: bool,
    pub active: bool,
}

type EventHandler<E> = Box<dyn Fn(E) + Send + Sync>;

/// Event callbacks bound to a single order at `assign_order` time (§4.5.1:
/// "handlers"). A missing handler simply suppresses that event (§9).
#[derive(Default)]
pub struct OrderHandlers {
    pub on_node_traversed: Option<EventHandler<NodeTraversedEvent>>,
    pub on_edge_traversed: Option<EventHandler<EdgeTraversedEvent>>,
    pub on_edge_traversing: Option<EventHandler<EdgeTraversingEvent>>,
    pub on_action_state_changed: Option<EventHandler<ActionStateChangedEvent>>,
    pub on_order_processed: Option<EventHandler<OrderProcessedEvent>>,
}

/// Event callbacks bound to a single `initiate_instant_actions` batch
/// (§4.5.2).
#[derive(Default)]
pub struct InstantActionHandlers {
    pub on_action_state_changed: Option<EventHandler<ActionStateChangedEvent>>,
    pub on_action_error: Option<EventHandler<ActionErrorEvent>>,
}

struct OrderStateCache {
    order: Arc<OrderBody>,
    action_location: HashMap<String, ActionLocation>,
    last_action_states: HashMap<String, ActionStatus>,
    last_node_traversed: Option<(String, u32)>,
    edge_traversing: Option<EdgeTraversingSnapshot>,
    edge_state_change_invocations: u32,
    order_processed: bool,
    handlers: OrderHandlers,
}

struct InstantActionStateCache {
    action: Action,
    last_status: Option<ActionStatus>,
    instant_actions_ref: u64,
    handlers: Arc<InstantActionHandlers>,
}

#[derive(Default)]
struct ControllerState {
    order_caches: HashMap<(AgvId, String, u32), OrderStateCache>,
    last_assigned: HashMap<AgvId, (String, u32)>,
    instant_action_caches: HashMap<(AgvId, String), InstantActionStateCache>,
    instant_actions_ref_counter: u64,
    /// Per-AGV fingerprints of the unmatched `instantActions` validation
    /// errors seen on the *previous* tick's `State`, so a stale error that
    /// simply persists on `state.errors` across ticks is not re-mapped to
    /// a different outstanding action on the next tick (§4.5.3(c)).
    last_validation_errors: HashMap<AgvId, HashSet<String>>,
}

/// Content fingerprint of a validation error, used to detect whether the
/// same error persisted from the previous tick rather than a new one
/// appearing (§4.5.3(c): "the delta against the prior tick").
fn error_fingerprint(error: &VdaError) -> String {
    serde_json::to_string(error).unwrap_or_default()
}

struct Inner {
    client: MasterControlClient,
    state: Mutex<ControllerState>,
}

/// `C5`. Cheaply `Clone`-able; every clone shares the same caches so the
/// controller can be moved into the `track_agvs` callback closure.
#[derive(Clone)]
pub struct MasterController(Arc<Inner>);

impl MasterController {
    pub fn new(client: MasterControlClient) -> Self {
        Self(Arc::new(Inner { client, state: Mutex::new(ControllerState::default()) }))
    }

    pub fn client(&self) -> &MasterControlClient {
        &self.0.client
    }

    /// Starts the underlying client and begins tracking every targeted
    /// AGV's `state` (§4.5: "subscribes to state for every target AGV on
    /// start").
    pub async fn start(&self) -> Result<(), ClientError> {
        self.0.client.start().await?;
        let controller = self.clone();
        self.0
            .client
            .track_agvs(move |topic, agv_id, value| {
                if *topic == Topic::State {
                    match serde_json::from_value::<StateBody>(value.clone()) {
                        Ok(state_body) => {
                            let controller = controller.clone();
                            let agv_id = agv_id.clone();
                            tokio::spawn(async move { controller.on_state(&agv_id, &state_body).await });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "state payload did not match the expected schema");
                        }
                    }
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        self.0.client.stop().await
    }

    /// `assignOrder(agvId, order, handlers)` (§4.5.1). Returns `None` when
    /// a cache for the exact `(orderId, orderUpdateId)` already exists —
    /// the order is discarded and prior handlers remain bound.
    pub async fn assign_order(
        &self,
        agv_id: AgvId,
        order: OrderBody,
        handlers: OrderHandlers,
    ) -> Result<Option<Stamped<OrderBody>>, ClientError> {
        let key_prefix = (agv_id.clone(), order.order_id.clone(), order.order_update_id);
        {
            let state = self.0.state.lock().await;
            if state.order_caches.contains_key(&key_prefix) {
                return Ok(None);
            }
        }

        let Some(stamped) = self.0.client.publish_order(&agv_id, order).await? else {
            return Ok(None);
        };

        let order_ref = Arc::new(stamped.body.clone());
        let cache = OrderStateCache {
            action_location: index_released_actions(&order_ref),
            order: order_ref,
            last_action_states: HashMap::new(),
            last_node_traversed: None,
            edge_traversing: None,
            edge_state_change_invocations: 0,
            order_processed: false,
            handlers,
        };

        let mut state = self.0.state.lock().await;
        if let Some(prev) = state.last_assigned.get(&agv_id).cloned() {
            state.order_caches.remove(&(agv_id.clone(), prev.0, prev.1));
        }
        state.last_assigned.insert(agv_id.clone(), (key_prefix.1.clone(), key_prefix.2));
        state.order_caches.insert(key_prefix, cache);

        Ok(Some(stamped))
    }

    /// `initiateInstantActions(agvId, {instantActions}, handlers)`
    /// (§4.5.2).
    pub async fn initiate_instant_actions(
        &self,
        agv_id: AgvId,
        instant_actions: InstantActionsBody,
        handlers: InstantActionHandlers,
    ) -> Result<Option<Stamped<InstantActionsBody>>, ClientError> {
        let Some(stamped) = self.0.client.publish_instant_actions(&agv_id, instant_actions).await? else {
            return Ok(None);
        };

        let mut state = self.0.state.lock().await;
        state.instant_actions_ref_counter += 1;
        let instant_actions_ref = state.instant_actions_ref_counter;
        let handlers = Arc::new(handlers);
        for action in &stamped.body.actions {
            state.instant_action_caches.insert(
                (agv_id.clone(), action.action_id.clone()),
                InstantActionStateCache {
                    action: action.clone(),
                    last_status: None,
                    instant_actions_ref,
                    handlers: handlers.clone(),
                },
            );
        }

        Ok(Some(stamped))
    }

    /// Dispatch pipeline for one inbound `state`, in the fixed emission
    /// order of §4.5.4.
    async fn on_state(&self, agv_id: &AgvId, state: &StateBody) {
        self.dispatch_order_rejection(agv_id, state).await;
        self.dispatch_active_order(agv_id, state).await;
        self.dispatch_instant_actions(agv_id, state).await;
    }

    async fn dispatch_order_rejection(&self, agv_id: &AgvId, state: &StateBody) {
        for error in &state.errors {
            let topic_ref = error.reference(error_reference_keys::TOPIC);
            if let Some(topic) = topic_ref {
                if topic != "order" {
                    continue;
                }
            }
            let action_id_ref = error.reference(error_reference_keys::ACTION_ID);
            if action_id_ref.is_some() && error.error_type != error_types::ORDER_ERROR {
                continue;
            }

            let order_id_ref = error.reference(error_reference_keys::ORDER_ID);
            let order_update_id_ref = error.reference(error_reference_keys::ORDER_UPDATE_ID);

            let mut guard = self.0.state.lock().await;
            let key = locate_rejected_order(&guard, agv_id, order_id_ref, order_update_id_ref, &error.error_type, topic_ref);
            let Some(key) = key else { continue };
            let Some(cache) = guard.order_caches.remove(&key) else { continue };
            drop(guard);

            if let Some(cb) = &cache.handlers.on_order_processed {
                cb(OrderProcessedEvent {
                    agv_id: agv_id.clone(),
                    order: cache.order,
                    with_error: Some(error.clone()),
                    by_cancelation: false,
                    active: false,
                });
            }
        }
    }

    async fn dispatch_active_order(&self, agv_id: &AgvId, state: &StateBody) {
        let mut guard = self.0.state.lock().await;
        let key = (agv_id.clone(), state.order_id.clone(), state.order_update_id);
        let Some(cache) = guard.order_caches.get_mut(&key) else { return };
        if cache.order_processed {
            return;
        }

        for action_state in &state.action_states {
            let Some(&location) = cache.action_location.get(&action_state.action_id) else { continue };
            let previous = cache.last_action_states.get(&action_state.action_id).copied();
            if previous == Some(action_state.action_status) {
                continue;
            }
            cache.last_action_states.insert(action_state.action_id.clone(), action_state.action_status);

            let with_error = if action_state.action_status == ActionStatus::Failed {
                find_action_error(&state.errors, &action_state.action_id, false).cloned()
            } else {
                None
            };

            if let Some(cb) = &cache.handlers.on_action_state_changed {
                cb(ActionStateChangedEvent {
                    agv_id: agv_id.clone(),
                    action_state: action_state.clone(),
                    order: Some(cache.order.clone()),
                    location: Some(location),
                    with_error,
                });
            }
        }

        if let Some((last_node_id, last_sequence_id)) = cache.last_node_traversed.clone() {
            let next_edge_index = cache
                .order
                .edges
                .iter()
                .position(|e| e.start_node_id == last_node_id && e.sequence_id == last_sequence_id + 1 && e.released);

            if let Some(edge_index) = next_edge_index {
                let sequence_id = cache.order.edges[edge_index].sequence_id;
                let still_present = state.edge_states.iter().any(|es| es.sequence_id == sequence_id);

                if !still_present {
                    cache.edge_traversing = None;
                    cache.edge_state_change_invocations = 0;
                    if let Some(cb) = &cache.handlers.on_edge_traversed {
                        cb(EdgeTraversedEvent { agv_id: agv_id.clone(), order: cache.order.clone(), edge_index });
                    }
                } else {
                    let blocking_unfinished = cache
                        .order
                        .nodes
                        .iter()
                        .find(|n| n.node_id == last_node_id && n.sequence_id == last_sequence_id)
                        .map(|n| {
                            n.actions.iter().any(|a| {
                                a.blocking_type != BlockingType::None
                                    && !cache.last_action_states.get(&a.action_id).is_some_and(|s| s.is_terminal())
                            })
                        })
                        .unwrap_or(false);

                    let first_emission = cache.edge_traversing.is_none();
                    if !(first_emission && blocking_unfinished) {
                        let snapshot = EdgeTraversingSnapshot {
                            distance_since_last_node: state.distance_since_last_node,
                            driving: state.driving,
                            new_base_request: state.new_base_request,
                            operating_mode: state.operating_mode,
                            paused: state.paused,
                            safety_state: state.safety_state,
                        };
                        let changed_fields = snapshot.changed_against(cache.edge_traversing.as_ref());
                        if changed_fields.any() {
                            cache.edge_traversing = Some(snapshot);
                            cache.edge_state_change_invocations += 1;
                            if let Some(cb) = &cache.handlers.on_edge_traversing {
                                cb(EdgeTraversingEvent {
                                    agv_id: agv_id.clone(),
                                    order: cache.order.clone(),
                                    edge_index,
                                    snapshot,
                                    changed_fields,
                                    invocation: cache.edge_state_change_invocations,
                                });
                            }
                        }
                    }
                }
            }
        }

        let traversed_node_index = match &cache.last_node_traversed {
            None => cache.order.nodes.first().and_then(|first| {
                let still_pending =
                    state.node_states.iter().any(|ns| ns.node_id == first.node_id && ns.sequence_id == first.sequence_id);
                if still_pending { None } else { Some(0) }
            }),
            Some((node_id, sequence_id)) => {
                if (&state.last_node_id, state.last_node_sequence_id) != (node_id, *sequence_id) {
                    cache
                        .order
                        .nodes
                        .iter()
                        .position(|n| n.node_id == state.last_node_id && n.sequence_id == state.last_node_sequence_id)
                } else {
                    None
                }
            }
        };

        if let Some(node_index) = traversed_node_index {
            let node = &cache.order.nodes[node_index];
            cache.last_node_traversed = Some((node.node_id.clone(), node.sequence_id));
            let next_edge_index = cache.order.edges.iter().position(|e| e.sequence_id == node.sequence_id + 1);
            let next_end_node_index = next_edge_index
                .and_then(|ei| cache.order.nodes.iter().position(|n| n.node_id == cache.order.edges[ei].end_node_id));
            if let Some(cb) = &cache.handlers.on_node_traversed {
                cb(NodeTraversedEvent {
                    agv_id: agv_id.clone(),
                    order: cache.order.clone(),
                    node_index,
                    next_edge_index,
                    next_end_node_index,
                });
            }
        }

        let all_cached_actions_terminal = cache
            .action_location
            .keys()
            .all(|id| cache.last_action_states.get(id).is_some_and(|s| s.is_terminal()));

        let completion = if state.node_states.is_empty() && state.edge_states.is_empty() && all_cached_actions_terminal {
            Some(false)
        } else if state.node_states.iter().all(|n| !n.released)
            && state.edge_states.iter().all(|e| !e.released)
            && all_cached_actions_terminal
        {
            Some(true)
        } else {
            None
        };

        if let Some(active) = completion {
            let by_cancelation = order_canceled_this_state(&guard.instant_action_caches, agv_id, &state.action_states);

            let Some(cache) = guard.order_caches.get_mut(&key) else { return };
            cache.order_processed = true;
            if let Some(cb) = &cache.handlers.on_order_processed {
                cb(OrderProcessedEvent {
                    agv_id: agv_id.clone(),
                    order: cache.order.clone(),
                    with_error: None,
                    by_cancelation,
                    active,
                });
            }
        }
    }

    /// `instantActionsRef`-correlated dispatch per §4.5.3(c). Only
    /// validation errors that are new since the previous tick (the delta,
    /// since the same error may persist across several ticks) are applied,
    /// in arrival order, to the outstanding caches of the most recent
    /// batch for this AGV — an explicit best-effort resolution of the
    /// ambiguity the source leaves open for the multi-controller case
    /// (§5, §9).
    async fn dispatch_instant_actions(&self, agv_id: &AgvId, state: &StateBody) {
        let mut guard = self.0.state.lock().await;

        let current_validation_errors: Vec<VdaError> = state
            .errors
            .iter()
            .filter(|e| {
                e.error_type == error_types::VALIDATION_ERROR
                    && e.reference(error_reference_keys::TOPIC) == Some("instantActions")
                    && e.reference(error_reference_keys::ORDER_ID).is_none()
                    && e.reference(error_reference_keys::ACTION_ID).is_none()
            })
            .cloned()
            .collect();
        let current_fingerprints: HashSet<String> = current_validation_errors.iter().map(error_fingerprint).collect();

        let previously_seen = guard.last_validation_errors.insert(agv_id.clone(), current_fingerprints).unwrap_or_default();
        // Only errors that are new since the previous tick are eligible to
        // be mapped to an outstanding action; an error that merely
        // persisted unchanged was already consumed (or deliberately left
        // unmatched) on a prior tick.
        let validation_errors: Vec<VdaError> = current_validation_errors
            .into_iter()
            .filter(|e| !previously_seen.contains(&error_fingerprint(e)))
            .collect();

        let latest_ref =
            guard.instant_action_caches.iter().filter(|((a, _), _)| a == agv_id).map(|(_, c)| c.instant_actions_ref).max();

        let keys: Vec<(AgvId, String)> =
            guard.instant_action_caches.keys().filter(|(a, _)| a == agv_id).cloned().collect();

        let mut next_validation_error = 0usize;

        for key in keys {
            let action_id = &key.1;
            if let Some(action_state) = state.action_states.iter().find(|a| &a.action_id == action_id) {
                let Some(cache) = guard.instant_action_caches.get_mut(&key) else { continue };
                if cache.last_status == Some(action_state.action_status) {
                    continue;
                }
                cache.last_status = Some(action_state.action_status);
                let terminal = action_state.action_status.is_terminal();
                let with_error = if action_state.action_status == ActionStatus::Failed {
                    find_action_error(&state.errors, action_id, true).cloned()
                } else {
                    None
                };
                let handlers = cache.handlers.clone();
                if terminal {
                    guard.instant_action_caches.remove(&key);
                }
                if let Some(cb) = &handlers.on_action_state_changed {
                    cb(ActionStateChangedEvent {
                        agv_id: agv_id.clone(),
                        action_state: action_state.clone(),
                        order: None,
                        location: None,
                        with_error,
                    });
                }
                continue;
            }

            if let Some(error) = find_action_error(&state.errors, action_id, true) {
                if let Some(cache) = guard.instant_action_caches.remove(&key) {
                    if let Some(cb) = &cache.handlers.on_action_error {
                        cb(ActionErrorEvent { agv_id: agv_id.clone(), action: cache.action, error: error.clone() });
                    }
                }
                continue;
            }

            let is_latest_batch = guard.instant_action_caches.get(&key).map(|c| Some(c.instant_actions_ref) == latest_ref);
            if is_latest_batch == Some(true) && next_validation_error < validation_errors.len() {
                let error = validation_errors[next_validation_error].clone();
                next_validation_error += 1;
                if let Some(cache) = guard.instant_action_caches.remove(&key) {
                    if let Some(cb) = &cache.handlers.on_action_error {
                        cb(ActionErrorEvent { agv_id: agv_id.clone(), action: cache.action, error });
                    }
                }
            }
        }
    }
}

fn locate_rejected_order(
    state: &ControllerState,
    agv_id: &AgvId,
    order_id: Option<&str>,
    order_update_id: Option<&str>,
    error_type: &str,
    topic_ref: Option<&str>,
) -> Option<(AgvId, String, u32)> {
    if let (Some(order_id), Some(update_id)) = (order_id, order_update_id) {
        let update_id: u32 = update_id.parse().ok()?;
        let key = (agv_id.clone(), order_id.to_string(), update_id);
        return state.order_caches.contains_key(&key).then_some(key);
    }

    if let Some(order_id) = order_id {
        return state
            .order_caches
            .keys()
            .filter(|(a, o, _)| a == agv_id && o == order_id)
            .max_by_key(|(_, _, u)| *u)
            .cloned();
    }

    if error_type == error_types::VALIDATION_ERROR && topic_ref == Some("order") {
        let (order_id, update_id) = state.last_assigned.get(agv_id)?;
        let key = (agv_id.clone(), order_id.clone(), *update_id);
        return state.order_caches.contains_key(&key).then_some(key);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::vda_2_0_0::{BlockingType, Edge, Node};

    fn action(id: &str) -> Action {
        Action {
            action_type: "pick".into(),
            action_id: id.into(),
            action_description: None,
            blocking_type: BlockingType::Hard,
            action_parameters: None,
        }
    }

    fn node(id: &str, seq: u32, released: bool, actions: Vec<Action>) -> Node {
        Node { node_id: id.into(), sequence_id: seq, node_description: None, released, node_position: None, actions }
    }

    fn edge(id: &str, seq: u32, start: &str, end: &str, released: bool) -> Edge {
        Edge {
            edge_id: id.into(),
            sequence_id: seq,
            edge_description: None,
            released,
            start_node_id: start.into(),
            end_node_id: end.into(),
            max_speed: None,
            max_height: None,
            min_height: None,
            orientation: None,
            orientation_type: None,
            direction: None,
            rotation_allowed: None,
            max_rotation_speed: None,
            length: None,
            trajectory: None,
            actions: Vec::new(),
        }
    }

    #[test]
    fn indexes_only_released_segment_actions() {
        let order = OrderBody {
            order_id: "o1".into(),
            order_update_id: 0,
            zone_set_id: None,
            nodes: vec![
                node("n1", 0, true, vec![action("a1")]),
                node("n2", 2, false, vec![action("a2")]),
            ],
            edges: vec![edge("e1", 1, "n1", "n2", true)],
        };
        let index = index_released_actions(&order);
        assert_eq!(index.get("a1"), Some(&ActionLocation::Node(0)));
        assert!(index.get("a2").is_none());
    }

    #[test]
    fn find_action_error_distinguishes_order_and_instant_action_topics() {
        let err = VdaError {
            error_type: error_types::ORDER_ACTION_ERROR.into(),
            error_level: crate::protocol::vda5050_common::ErrorLevel::Warning,
            error_description: None,
            error_references: vec![
                crate::protocol::vda5050_common::ErrorReference {
                    reference_key: error_reference_keys::ACTION_ID.into(),
                    reference_value: "a1".into(),
                },
                crate::protocol::vda5050_common::ErrorReference {
                    reference_key: error_reference_keys::TOPIC.into(),
                    reference_value: "order".into(),
                },
            ],
        };
        assert!(find_action_error(&[err.clone()], "a1", false).is_some());
        assert!(find_action_error(&[err], "a1", true).is_none());
    }

    #[test]
    fn edge_traversing_snapshot_reports_first_emission_as_fully_changed() {
        let snapshot = EdgeTraversingSnapshot {
            distance_since_last_node: Some(1.0),
            driving: true,
            new_base_request: None,
            operating_mode: OperatingMode::Automatic,
            paused: None,
            safety_state: SafetyState { e_stop: crate::protocol::vda_2_0_0::EStop::None, field_violation: false },
        };
        let changed = snapshot.changed_against(None);
        assert!(changed.any());
        assert!(changed.driving);
    }

    fn cancel_order_cache(agv_id: AgvId, action_id: &str) -> HashMap<(AgvId, String), InstantActionStateCache> {
        let mut caches = HashMap::new();
        caches.insert(
            (agv_id, action_id.to_string()),
            InstantActionStateCache {
                action: action_type(action_id, "cancelOrder"),
                last_status: None,
                instant_actions_ref: 1,
                handlers: Arc::new(InstantActionHandlers::default()),
            },
        );
        caches
    }

    fn action_type(id: &str, action_type: &str) -> Action {
        Action { action_type: action_type.into(), action_id: id.into(), action_description: None, blocking_type: BlockingType::Soft, action_parameters: None }
    }

    fn action_state(id: &str, status: ActionStatus) -> ActionState {
        ActionState { action_id: id.into(), action_type: None, action_description: None, action_status: status, result_description: None }
    }

    fn test_controller() -> MasterController {
        let config = crate::client::ClientConfig {
            interface_name: "uagv".into(),
            topic_format: "%interfaceName%/%majorVersion%/%manufacturer%/%serialNumber%/%topic%".into(),
            protocol_version: crate::protocol::ProtocolVersion::V2_0_0,
            mqtt_protocol_version: crate::client::MqttProtocolVersion::V3_1_1,
            broker_uri: "tcp://localhost:1883".into(),
            connect_timeout: std::time::Duration::from_secs(1),
            inbound_message_channel_capacity: 10,
        };
        let agv_id = AgvId::new("acme", "controller-under-test").unwrap();
        let client = crate::client::Client::new(agv_id, config, false, None, None).unwrap();
        MasterController::new(crate::master_control_client::MasterControlClient::from_client(client))
    }

    fn instant_actions_validation_error() -> VdaError {
        VdaError {
            error_type: error_types::VALIDATION_ERROR.into(),
            error_level: crate::protocol::vda5050_common::ErrorLevel::Warning,
            error_description: None,
            error_references: vec![crate::protocol::vda5050_common::ErrorReference {
                reference_key: error_reference_keys::TOPIC.into(),
                reference_value: "instantActions".into(),
            }],
        }
    }

    fn state_with_errors(errors: Vec<VdaError>) -> StateBody {
        use crate::protocol::vda_2_0_0::BatteryState;
        StateBody {
            order_id: String::new(),
            order_update_id: 0,
            zone_set_id: None,
            last_node_id: String::new(),
            last_node_sequence_id: 0,
            node_states: Vec::new(),
            edge_states: Vec::new(),
            action_states: Vec::new(),
            driving: false,
            paused: None,
            new_base_request: None,
            distance_since_last_node: None,
            operating_mode: OperatingMode::Automatic,
            battery_state: BatteryState { battery_charge: 100.0, battery_voltage: None, battery_health: None, charging: false, reach: None },
            safety_state: SafetyState { e_stop: crate::protocol::vda_2_0_0::EStop::None, field_violation: false },
            errors,
            loads: Vec::new(),
            agv_position: None,
            velocity: None,
        }
    }

    #[tokio::test]
    async fn stale_validation_error_is_not_reapplied_to_a_later_unrelated_action() {
        let controller = test_controller();
        let agv_id = AgvId::new("acme", "validation-test").unwrap();
        let error = instant_actions_validation_error();

        {
            let mut guard = controller.0.state.lock().await;
            guard.instant_action_caches.insert(
                (agv_id.clone(), "bad1".into()),
                InstantActionStateCache {
                    action: action_type("bad1", "pick"),
                    last_status: None,
                    instant_actions_ref: 1,
                    handlers: Arc::new(InstantActionHandlers::default()),
                },
            );
        }

        controller.dispatch_instant_actions(&agv_id, &state_with_errors(vec![error.clone()])).await;

        {
            let guard = controller.0.state.lock().await;
            assert!(
                !guard.instant_action_caches.contains_key(&(agv_id.clone(), "bad1".into())),
                "the first occurrence of the error should be mapped to the outstanding action"
            );
        }

        {
            let mut guard = controller.0.state.lock().await;
            guard.instant_action_caches.insert(
                (agv_id.clone(), "bad2".into()),
                InstantActionStateCache {
                    action: action_type("bad2", "pick"),
                    last_status: None,
                    instant_actions_ref: 2,
                    handlers: Arc::new(InstantActionHandlers::default()),
                },
            );
        }

        // Same error, still present on tick N+1 (the AGV hasn't cleared it yet):
        // it must not be attributed to this unrelated, later action.
        controller.dispatch_instant_actions(&agv_id, &state_with_errors(vec![error])).await;

        let guard = controller.0.state.lock().await;
        assert!(
            guard.instant_action_caches.contains_key(&(agv_id.clone(), "bad2".into())),
            "a persisting (not newly appeared) validation error must not be re-mapped to a different action"
        );
    }

    #[test]
    fn order_canceled_this_state_is_true_when_cancel_order_finished_in_the_same_state() {
        let agv_id = AgvId::new("acme", "001").unwrap();
        let caches = cancel_order_cache(agv_id.clone(), "cancel1");
        let states = [action_state("cancel1", ActionStatus::Finished)];
        assert!(order_canceled_this_state(&caches, &agv_id, &states));
    }

    #[test]
    fn order_canceled_this_state_is_false_while_cancel_order_is_still_running() {
        let agv_id = AgvId::new("acme", "001").unwrap();
        let caches = cancel_order_cache(agv_id.clone(), "cancel1");
        let states = [action_state("cancel1", ActionStatus::Running)];
        assert!(!order_canceled_this_state(&caches, &agv_id, &states));
    }

    #[test]
    fn order_canceled_this_state_ignores_other_agvs() {
        let agv_id = AgvId::new("acme", "001").unwrap();
        let other = AgvId::new("acme", "002").unwrap();
        let caches = cancel_order_cache(agv_id, "cancel1");
        let states = [action_state("cancel1", ActionStatus::Finished)];
        assert!(!order_canceled_this_state(&caches, &other, &states));
    }
}
