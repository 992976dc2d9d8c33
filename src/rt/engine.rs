use crate::rt::clock::VectorClock;
use crate::rt::consistency::{ConsistencyChecker, Inconsistency};
use crate::rt::event::{EventId, EventStore};
use crate::rt::execution::Execution;
use crate::rt::failure::SwitchReason;
use crate::rt::frontier::ExecutionFrontier;
use crate::rt::label::{
    replay_matches, synchronize, EventLabel, LabelKind, MemoryInit, SpanKind, SyncType,
};
use crate::rt::location::CodeLocation;
use crate::rt::memory::MemoryLocation;
use crate::rt::object::ObjectRegistry;
use crate::rt::replay::{LoopDetector, Replayer};
use crate::rt::value::{ObjectId, Value, ValueId, INVALID_OBJECT_ID};
use crate::rt::{ThreadId, DEFAULT_SPIN_BOUND, INIT_THREAD_ID, MAIN_THREAD_ID};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::Ordering;

use tracing::{debug, info, trace};

/// A deferred alternative response, with enough state to resume exploration
/// from that choice.
///
/// Points are created in event-id order, so the stack is a depth-first
/// traversal over alternative synchronizations: newest alternatives first.
#[derive(Debug, Clone)]
pub struct BacktrackingPoint {
    pub event: EventId,
    pub frontier: ExecutionFrontier,
    pub pinned: ExecutionFrontier,
    pub blocked_requests: Vec<EventId>,
    pub visited: bool,
}

/// Outcome of appending a one-shot or request label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The event (fresh or replayed) now at the thread's frontier.
    Event(EventId),
    /// The engine wants another thread in the driver's seat first.
    Switch(SwitchReason),
}

/// Outcome of asking for a response to a blocking request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStep {
    Response(EventId),
    Switch(SwitchReason),
    /// No response exists yet; the request is a dangling request.
    NoResponse,
}

/// Observers the host strategy installs on the engine.
#[derive(Default)]
pub struct EngineHooks {
    pub on_switch: Option<Box<dyn Fn(ThreadId, SwitchReason) + Send>>,
    pub on_inconsistency: Option<Box<dyn Fn(&Inconsistency) + Send>>,
}

impl fmt::Debug for EngineHooks {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EngineHooks").finish()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub spin_bound: usize,
    /// Hard cap on events per run; hitting it is a modelling error.
    pub max_events: usize,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            spin_bound: DEFAULT_SPIN_BOUND,
            max_events: 10_000,
        }
    }
}

/// The event-structure exploration engine.
///
/// Incrementally constructs the event structure, chooses a linear execution
/// consistent with it, and systematically backtracks over alternative
/// synchronizations.
pub struct EventStructure {
    store: EventStore,
    execution: Execution,
    /// Events actually played by worker threads in the current run.
    played_frontier: ExecutionFrontier,
    /// Events committed to the current subtree; not re-synchronized.
    pinned: ExecutionFrontier,
    backtracking: Vec<BacktrackingPoint>,
    /// Blocked requests, each with its chosen unblocking response once one
    /// exists.
    dangling: HashMap<EventId, Option<EventId>>,
    replay: Replayer,
    detector: LoopDetector,
    registry: ObjectRegistry,
    checker: Box<dyn ConsistencyChecker>,
    hooks: EngineHooks,
    root: EventId,
    max_events: usize,
    spin_signal: bool,
}

impl EventStructure {
    pub fn new(
        memory_init: MemoryInit,
        checker: Box<dyn ConsistencyChecker>,
        config: EngineConfig,
    ) -> EventStructure {
        let mut store = EventStore::new();

        let root = store.create(
            INIT_THREAD_ID,
            EventLabel::Initialization {
                init_thread_id: INIT_THREAD_ID,
                main_thread_id: MAIN_THREAD_ID,
                memory_init,
            },
            None,
            Vec::new(),
            &[],
            None,
            None,
        );

        let mut execution = Execution::new();
        execution.append(&store, root);
        let played_frontier = ExecutionFrontier::with_root(root, &store);

        EventStructure {
            store,
            execution,
            played_frontier,
            pinned: ExecutionFrontier::new(),
            backtracking: Vec::new(),
            dangling: HashMap::new(),
            replay: Replayer::default(),
            detector: LoopDetector::new(config.spin_bound),
            registry: ObjectRegistry::new(),
            checker,
            hooks: EngineHooks::default(),
            root,
            max_events: config.max_events,
            spin_signal: false,
        }
    }

    pub fn set_hooks(&mut self, hooks: EngineHooks) {
        self.hooks = hooks;
    }

    pub fn root(&self) -> EventId {
        self.root
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ObjectRegistry {
        &mut self.registry
    }

    pub fn backtracking_points(&self) -> &[BacktrackingPoint] {
        &self.backtracking
    }

    /// Map a live value into the engine's identity space. Unknown objects are
    /// registered as external, allocated by the root.
    pub fn compute_value_id(&mut self, value: &Value) -> ValueId {
        self.registry.compute_value_id(value, self.root)
    }

    pub fn get_value(&self, id: ValueId) -> Option<Value> {
        self.registry.get_value(id)
    }

    // ===== exploration lifecycle =====

    /// Pop the newest unvisited backtracking point and reset to it.
    ///
    /// Returns `false` when the exploration space is exhausted.
    pub fn start_next_exploration(&mut self) -> bool {
        let idx = match self.backtracking.iter().rposition(|p| !p.visited) {
            Some(idx) => idx,
            None => return false,
        };

        self.backtracking[idx].visited = true;
        let event = self.backtracking[idx].event;
        let frontier = self.backtracking[idx].frontier.clone();
        let pinned = self.backtracking[idx].pinned.clone();
        let blocked = self.backtracking[idx].blocked_requests.clone();

        info!(event = %event, "start next exploration");

        self.execution = Execution::from_frontier(&self.store, &frontier);
        self.execution.append(&self.store, event);
        self.pinned = pinned;
        self.dangling = blocked.into_iter().map(|r| (r, None)).collect();

        let order: Vec<EventId> = self
            .execution
            .events_in_id_order()
            .into_iter()
            .filter(|&e| e != self.root)
            .collect();
        self.replay = Replayer::new(order, &self.store);

        self.played_frontier = ExecutionFrontier::with_root(self.root, &self.store);
        self.registry.retain_external();
        self.detector.clear();
        self.spin_signal = false;

        true
    }

    /// Reset the played frontier to the root and prime the replayer.
    pub fn initialize_exploration(&mut self) {
        self.played_frontier = ExecutionFrontier::with_root(self.root, &self.store);
        self.replay.rewind(&self.store);
        self.detector.clear();
        self.spin_signal = false;
    }

    /// Truncate the execution to the replayed prefix.
    ///
    /// Responses of frontier requests whose dependencies are all played are
    /// kept so at-most-one-response stays checkable.
    pub fn abort_exploration(&mut self) {
        let played = self.played_frontier.clone();

        let mut keep = Vec::new();
        for last in played.iter() {
            if !self.store[last].label.is_blocking() {
                continue;
            }
            if let Some(resp) = self.execution.response_of(&self.store, last) {
                if played.contains_all(&self.store, &self.store[resp].dependencies) {
                    keep.push(resp);
                }
            }
        }

        debug!(kept = keep.len(), "abort exploration");

        self.execution = Execution::from_frontier(&self.store, &played);
        for resp in keep {
            self.execution.append(&self.store, resp);
        }

        self.replay = Replayer::default();
    }

    pub fn check_consistency(&self) -> Option<Inconsistency> {
        let found = self.checker.check(&self.execution, &self.store);
        if let (Some(inconsistency), Some(hook)) = (&found, &self.hooks.on_inconsistency) {
            hook(inconsistency);
        }
        found
    }

    // ===== replay state, for the strategy =====

    pub fn in_replay_phase(&self) -> bool {
        self.replay.in_replay_phase()
    }

    /// Thread the stored order wants next, while replaying.
    pub fn replay_thread(&self) -> Option<ThreadId> {
        self.replay.peek().map(|e| self.store[e].thread_id)
    }

    pub fn replay_has_events_for(&self, thread: ThreadId) -> bool {
        self.replay.has_events_for(thread)
    }

    pub fn is_dangling(&self, request: EventId) -> bool {
        self.dangling.contains_key(&request)
    }

    pub fn unblocking_recorded(&self, request: EventId) -> bool {
        matches!(self.dangling.get(&request), Some(Some(_)))
    }

    /// Take the pending spin-bound signal, if any.
    pub fn take_spin_signal(&mut self) -> bool {
        std::mem::replace(&mut self.spin_signal, false)
    }

    // ===== event creation =====

    /// Create an event if it is possible in this execution.
    ///
    /// Computes the conflict set, rejects causality violations (`None`), and
    /// for `visit = false` records the event as a backtracking point.
    fn create_event(
        &mut self,
        thread_id: ThreadId,
        label: EventLabel,
        parent: Option<EventId>,
        dependencies: Vec<EventId>,
        source: Option<EventId>,
        visit: bool,
    ) -> Option<EventId> {
        assert!(
            self.store.len() < self.max_events,
            "Model exceeded maximum number of events. This is often caused \
             by an algorithm requiring the processor to make progress, e.g. \
             spin locks.",
        );

        let position = parent.map_or(0, |p| self.store[p].thread_position + 1);

        let allocation = label
            .location()
            .and_then(|l| l.object_id())
            .and_then(|o| self.registry.allocation_of(o));

        // An object exists before it is accessed: the allocation joins the
        // dependencies, which also keeps it inside every reset frontier.
        let mut dependencies = dependencies;
        if let Some(allocation) = allocation {
            if allocation != self.root && !dependencies.contains(&allocation) {
                dependencies.push(allocation);
            }
        }

        // The structure is canonical: re-deriving an event over the same
        // parent and dependencies yields the one already in the arena (and
        // its already-recorded backtracking point), which is what bounds
        // re-exploration of sibling branches.
        if let Some(existing) = self
            .store
            .iter()
            .find(|e| {
                e.thread_id == thread_id
                    && e.parent == parent
                    && e.dependencies == dependencies
                    && e.source == source
                    && replay_matches(&e.label, &label)
            })
            .map(|e| e.id)
        {
            return Some(existing);
        }

        let conflicts = self.conflicts_of(thread_id, position, &label, source);

        // Causality violation: a conflict in the causal past of the parent or
        // a dependency makes the event impossible here.
        let mut past = VectorClock::new();
        if let Some(parent) = parent {
            past.join(&self.store[parent].causality_clock);
        }
        for &dep in &dependencies {
            past.join(&self.store[dep].causality_clock);
        }
        for &conflict in &conflicts {
            let c = &self.store[conflict];
            if past.observes(c.thread_id, c.thread_position) {
                trace!(?label, conflict = %conflict, "causality violation");
                return None;
            }
        }

        let sync_deps: Vec<EventId> = dependencies
            .iter()
            .copied()
            .filter(|&d| label.acquires_from(&self.store[d].label))
            .collect();

        let event = self.store.create(
            thread_id,
            label,
            parent,
            dependencies,
            &sync_deps,
            allocation,
            source,
        );

        if !visit {
            self.push_backtracking_point(event, &conflicts);
        }

        Some(event)
    }

    /// Events the prospective event is in conflict with: the occupant of its
    /// `(thread, position)` slot, plus label-specific exclusivity.
    fn conflicts_of(
        &self,
        thread_id: ThreadId,
        position: usize,
        label: &EventLabel,
        source: Option<EventId>,
    ) -> Vec<EventId> {
        let mut conflicts = Vec::new();

        if let Some(existing) = self.execution.event_at(thread_id, position) {
            conflicts.push(existing);
        }

        match label {
            // Mutual exclusion: one lock response per unlock. Re-entries
            // share their source with the original acquisition by design and
            // are exempt.
            EventLabel::Lock {
                kind: LabelKind::Response,
                reentry: false,
                ..
            } => {
                for &other in self.execution.events_in_id_order().iter() {
                    if matches!(
                        self.store[other].label,
                        EventLabel::Lock {
                            kind: LabelKind::Response,
                            reentry: false,
                            ..
                        }
                    ) && self.store[other].source == source
                        && !conflicts.contains(&other)
                    {
                        conflicts.push(other);
                    }
                }
            }
            // One wakeup per non-broadcast notify.
            EventLabel::Wait {
                kind: LabelKind::Response,
                ..
            } => {
                let broadcast = source.map_or(false, |s| {
                    matches!(
                        self.store[s].label,
                        EventLabel::Notify {
                            broadcast: true,
                            ..
                        }
                    )
                });

                if !broadcast {
                    for &other in self.execution.events_in_id_order().iter() {
                        if matches!(
                            self.store[other].label,
                            EventLabel::Wait {
                                kind: LabelKind::Response,
                                ..
                            }
                        ) && self.store[other].source == source
                            && !conflicts.contains(&other)
                        {
                            conflicts.push(other);
                        }
                    }
                }
            }
            _ => {}
        }

        conflicts
    }

    fn push_backtracking_point(&mut self, event: EventId, conflicts: &[EventId]) {
        let thread_id = self.store[event].thread_id;
        let parent = self.store[event].parent;

        let mut frontier = self.execution.frontier(&self.store);
        frontier.cut(&self.store, conflicts);
        frontier.truncate_thread(thread_id, parent);

        // Keep the chosen responses of requests that are no longer blocked.
        for (&request, response) in &self.dangling {
            if let Some(response) = *response {
                if frontier.get(self.store[request].thread_id) == Some(request)
                    && self.store[response].id != self.store[event].id
                {
                    frontier.update(&self.store, response);
                }
            }
        }

        let mut pinned = self.pinned.clone();
        let causal_past = self
            .execution
            .frontier_of_clock(&self.store, &self.store[event].causality_clock);
        pinned.merge(&self.store, &causal_past);
        pinned.cut(&self.store, conflicts);
        let dangling: Vec<EventId> = self.dangling.keys().copied().collect();
        pinned.cut(&self.store, &dangling);
        pinned.cut(&self.store, &[event]);

        let blocked_requests: Vec<EventId> = self
            .dangling
            .iter()
            .filter(|(&request, response)| {
                if Some(request) == parent {
                    return false;
                }
                // A request whose recorded response survived into the
                // frontier is not blocked over there.
                match response {
                    Some(response) => !frontier.contains(&self.store, *response),
                    None => true,
                }
            })
            .map(|(&request, _)| request)
            .collect();

        trace!(event = %event, "push backtracking point");

        self.backtracking.push(BacktrackingPoint {
            event,
            frontier,
            pinned,
            blocked_requests,
            visited: false,
        });
    }

    fn mark_point_visited(&mut self, event: EventId) {
        if let Some(point) = self
            .backtracking
            .iter_mut()
            .rev()
            .find(|p| p.event == event)
        {
            point.visited = true;
        }
    }

    // ===== the generic append =====

    /// Append a send or request label at the calling thread's frontier.
    fn add_event(&mut self, thread_id: ThreadId, label: EventLabel) -> Step {
        self.add_event_with(thread_id, label, None)
    }

    fn add_event_with(
        &mut self,
        thread_id: ThreadId,
        label: EventLabel,
        source: Option<EventId>,
    ) -> Step {
        if let Some(next) = self.replay.peek() {
            if self.store[next].thread_id != thread_id {
                return self.switch(thread_id, SwitchReason::StrategySwitch);
            }

            assert!(
                replay_matches(&self.store[next].label, &label),
                "[weft internal bug] replay divergence on thread {}: \
                 recorded {:?}, attempted {:?}",
                thread_id,
                self.store[next].label,
                label,
            );

            let event = self.replay.advance(&self.store);
            self.played_frontier.update(&self.store, event);
            return Step::Event(event);
        }

        let parent = self.played_frontier.get(thread_id);
        let event = self
            .create_event(thread_id, label, parent, Vec::new(), source, true)
            .expect("[weft internal bug] fresh append conflicts with its own past");

        self.execution.append(&self.store, event);
        self.played_frontier.update(&self.store, event);

        if self.store[event].label.is_send() {
            self.add_synchronized_events(event);
        }

        Step::Event(event)
    }

    fn switch(&self, thread_id: ThreadId, reason: SwitchReason) -> Step {
        if let Some(hook) = &self.hooks.on_switch {
            hook(thread_id, reason);
        }
        Step::Switch(reason)
    }

    // ===== the request/response protocol =====

    /// Synthesize (or replay, or adopt) the response for a blocking request.
    pub fn add_response_events(&mut self, request: EventId) -> ResponseStep {
        let thread_id = self.store[request].thread_id;

        if let Some(next) = self.replay.peek() {
            if self.store[next].thread_id != thread_id {
                self.switch(thread_id, SwitchReason::StrategySwitch);
                return ResponseStep::Switch(SwitchReason::StrategySwitch);
            }

            assert_eq!(
                self.store[next].parent,
                Some(request),
                "[weft internal bug] replay divergence: {} is not the response of {}",
                next,
                request,
            );

            // Dependencies not yet played: no response yet. Replay keeps
            // progressing on the dependency threads, so this resolves.
            if !self
                .played_frontier
                .contains_all(&self.store, &self.store[next].dependencies)
            {
                return ResponseStep::NoResponse;
            }

            let event = self.replay.advance(&self.store);
            self.played_frontier.update(&self.store, event);
            self.record_read_response(event);
            return ResponseStep::Response(event);
        }

        // A previously blocked request adopts its recorded response, unless a
        // conflicting event entered the execution since (another thread spent
        // the same unlock first): then the request re-blocks.
        if let Some(&Some(response)) = self.dangling.get(&request) {
            if self.enabled_in_execution(response) {
                self.dangling.remove(&request);
                self.execution.append(&self.store, response);
                self.played_frontier.update(&self.store, response);
                self.record_read_response(response);
                return ResponseStep::Response(response);
            }
            self.dangling.insert(request, None);
        }

        self.dangling.remove(&request);
        let responses = self.add_synchronized_events(request);

        // The last produced response is the newest backtracking point; choose
        // it for this execution, skipping responses whose conflicts are
        // already present (those stay as alternatives to explore).
        let chosen = responses
            .iter()
            .rev()
            .copied()
            .find(|&r| self.enabled_in_execution(r));

        let chosen = match chosen {
            Some(chosen) => chosen,
            None => {
                debug!(request = %request, "request is dangling");
                self.dangling.insert(request, None);
                return ResponseStep::NoResponse;
            }
        };

        self.mark_point_visited(chosen);
        self.execution.append(&self.store, chosen);
        self.played_frontier.update(&self.store, chosen);
        self.record_read_response(chosen);

        ResponseStep::Response(chosen)
    }

    /// A response can join the current execution only while none of its
    /// conflicts are part of it.
    fn enabled_in_execution(&self, response: EventId) -> bool {
        let e = &self.store[response];
        self.conflicts_of(e.thread_id, e.thread_position, &e.label, e.source)
            .is_empty()
    }

    fn record_read_response(&mut self, event: EventId) {
        if let EventLabel::Read {
            kind: LabelKind::Response,
            location,
            value: Some(value),
            code_location,
            ..
        } = &self.store[event].label
        {
            let thread_id = self.store[event].thread_id;
            let saturated =
                self.detector
                    .record(thread_id, *code_location, location.clone(), *value);

            if saturated && !self.replay.in_replay_phase() {
                debug!(thread = %thread_id, location = %location, "spin bound hit");
                self.spin_signal = true;
                if let Some(hook) = &self.hooks.on_switch {
                    hook(thread_id, SwitchReason::SpinBound);
                }
            }
        }
    }

    // ===== synchronization search =====

    /// Enumerate partners for `event`, apply the algebra, and record every
    /// produced response as a backtracking point. Returns the new responses
    /// in partner order.
    fn add_synchronized_events(&mut self, event: EventId) -> Vec<EventId> {
        match self.store[event].label.sync_type() {
            SyncType::None => return Vec::new(),
            SyncType::Barrier => return self.add_barrier_responses(event),
            SyncType::Binary => {}
        }

        let is_send = self.store[event].label.is_send();
        let mut candidates = self.synchronization_candidates(event);
        candidates.sort();

        let mut responses = Vec::new();

        for candidate in candidates {
            let (send, request) = if is_send {
                (event, candidate)
            } else {
                (candidate, event)
            };

            let label = match synchronize(&self.store[send].label, &self.store[request].label) {
                Some(label) => label,
                None => continue,
            };

            // Saturated spin signatures do not regrow: no new identical
            // read responses once the detector has tripped for the slot.
            if let EventLabel::Read {
                kind: LabelKind::Response,
                location,
                value: Some(value),
                code_location,
                ..
            } = &label
            {
                if self.detector.saturated(
                    self.store[request].thread_id,
                    *code_location,
                    location,
                    *value,
                ) {
                    continue;
                }
            }

            let created = self.create_event(
                self.store[request].thread_id,
                label,
                Some(request),
                vec![send],
                Some(send),
                false,
            );

            if let Some(response) = created {
                responses.push(response);
            }
        }

        self.record_unblockings(&responses);
        responses
    }

    /// Barrier synchronization folds every available send into one response.
    fn add_barrier_responses(&mut self, event: EventId) -> Vec<EventId> {
        let requests: Vec<EventId> = match &self.store[event].label {
            EventLabel::ThreadJoin {
                kind: LabelKind::Request,
                ..
            } => vec![event],
            EventLabel::ThreadFinish { .. } => self
                .execution
                .events_in_id_order()
                .into_iter()
                .filter(|&e| {
                    matches!(
                        self.store[e].label,
                        EventLabel::ThreadJoin {
                            kind: LabelKind::Request,
                            ..
                        }
                    ) && self.execution.response_of(&self.store, e).is_none()
                })
                .collect(),
            _ => return Vec::new(),
        };

        let finishes: Vec<EventId> = self
            .execution
            .events_in_id_order()
            .into_iter()
            .filter(|&e| matches!(self.store[e].label, EventLabel::ThreadFinish { .. }))
            .collect();

        let mut responses = Vec::new();

        for request in requests {
            let mut label = self.store[request].label.clone();
            let mut dependencies = Vec::new();

            for &finish in &finishes {
                if let Some(folded) = synchronize(&self.store[finish].label, &label) {
                    label = folded;
                    dependencies.push(finish);
                }
            }

            // Still blocking: emit nothing.
            if !label.is_unblocked() {
                continue;
            }

            let created = self.create_event(
                self.store[request].thread_id,
                label,
                Some(request),
                dependencies,
                None,
                false,
            );

            if let Some(response) = created {
                responses.push(response);
            }
        }

        self.record_unblockings(&responses);
        responses
    }

    /// First response for a blocked dangling request unblocks it; the point
    /// is immediately visited since the current execution just chose it.
    fn record_unblockings(&mut self, responses: &[EventId]) {
        for &response in responses {
            let request = match self.store[response].parent {
                Some(request) => request,
                None => continue,
            };

            if !self.dangling.contains_key(&request) {
                continue;
            }
            if matches!(self.dangling.get(&request), Some(None))
                && self.enabled_in_execution(response)
            {
                debug!(request = %request, response = %response, "request unblocked");
                self.dangling.insert(request, Some(response));
                self.mark_point_visited(response);
            }
        }
    }

    /// Candidate partners for the label's family, before the generic cycle
    /// and pinning filters.
    fn synchronization_candidates(&self, event: EventId) -> Vec<EventId> {
        let label = &self.store[event].label;

        let mut candidates: Vec<EventId> = match label {
            EventLabel::ObjectAllocation { .. } | EventLabel::Random { .. } => return Vec::new(),

            EventLabel::Write {
                location, ..
            } => {
                if self.execution.index().is_read_write_race_free(location) {
                    return Vec::new();
                }
                self.execution.index().read_requests(location).to_vec()
            }

            EventLabel::Read {
                kind: LabelKind::Request,
                location,
                ..
            } => self.write_candidates(event, location),

            // A re-entry request synchronizes with the allocation only.
            EventLabel::Lock {
                kind: LabelKind::Request,
                mutex,
                reentry: true,
                ..
            } => vec![self.monitor_allocation(*mutex)],

            // Unlocks of the mutex, plus its allocation (or the root, for
            // monitors that predate the test) as the initial unlock.
            EventLabel::Lock {
                kind: LabelKind::Request,
                mutex,
                reentry: false,
                ..
            } => {
                let mutex = *mutex;
                let mut unlocks: Vec<EventId> = self
                    .execution
                    .events_in_id_order()
                    .into_iter()
                    .filter(|&e| {
                        matches!(self.store[e].label, EventLabel::Unlock { mutex: m, .. } if m == mutex)
                    })
                    .collect();
                unlocks.push(self.monitor_allocation(mutex));
                unlocks
            }

            _ => self
                .execution
                .events_in_id_order()
                .into_iter()
                .filter(|&c| {
                    let other = &self.store[c].label;
                    if label.is_send() {
                        other.is_request() && synchronize(label, other).is_some()
                    } else {
                        other.is_send() && synchronize(other, label).is_some()
                    }
                })
                .collect(),
        };

        let is_send = label.is_send();

        candidates.retain(|&c| {
            // Causal predecessors of a send cannot take its response; a
            // request cannot read from its own causal future.
            let cycle = if is_send {
                self.store.causally_precedes(c, event)
            } else {
                self.store.causally_precedes(event, c)
            };
            if cycle {
                return false;
            }

            // Pinned requests have their response committed to this subtree
            // and are not re-synchronized; blocked dangling requests may
            // still unblock. Sends stay available to fresh requests.
            if is_send
                && self.pinned.contains(&self.store, c)
                && !matches!(self.dangling.get(&c), Some(None))
            {
                return false;
            }

            true
        });

        candidates
    }

    /// Writes a read request may take its value from.
    fn write_candidates(&self, request: EventId, location: &MemoryLocation) -> Vec<EventId> {
        let index = self.execution.index();
        let initial = self.initial_write_for(location);

        // Race-free location: the unique last write.
        if index.is_race_free(location) {
            return vec![index.last_write(location).unwrap_or(initial)];
        }

        let mut writes: Vec<EventId> = index.writes(location).to_vec();
        writes.push(initial);

        let req = &self.store[request];

        // Reads-from already superseded for this thread: writes behind an
        // earlier read-from are stale.
        let stale_bar: Vec<EventId> = self
            .execution
            .thread_events(req.thread_id)
            .iter()
            .filter(|&&e| {
                matches!(
                    self.store[e].label,
                    EventLabel::Read {
                        kind: LabelKind::Response,
                        ..
                    }
                ) && self.store[e].label.location() == Some(location)
            })
            .filter_map(|&e| self.store[e].source)
            .collect();

        let all = writes.clone();
        writes.retain(|&w| {
            // Covered: a racy write later in causal order is already in the
            // reader's view.
            let covered = all.iter().any(|&w2| {
                w2 != w
                    && self.store.causally_precedes(w, w2)
                    && req
                        .sync_clock
                        .observes(self.store[w2].thread_id, self.store[w2].thread_position)
            });
            let stale = stale_bar
                .iter()
                .any(|&w3| w3 != w && self.store.causally_precedes(w, w3));

            !covered && !stale
        });

        writes
    }

    /// The event standing in for the location's initial value: the owning
    /// object's allocation, or the root.
    fn initial_write_for(&self, location: &MemoryLocation) -> EventId {
        location
            .object_id()
            .and_then(|o| self.registry.allocation_of(o))
            .filter(|&a| self.execution.contains(&self.store, a))
            .unwrap_or(self.root)
    }

    /// The mutex's initial unlock: its allocation event, or the root for
    /// external monitors.
    fn monitor_allocation(&self, mutex: ObjectId) -> EventId {
        self.registry
            .allocation_of(mutex)
            .filter(|&a| self.execution.contains(&self.store, a))
            .unwrap_or(self.root)
    }

    // ===== typed wrappers =====

    pub fn add_read_request(
        &mut self,
        thread_id: ThreadId,
        location: MemoryLocation,
        ordering: Ordering,
        exclusive: bool,
        code_location: CodeLocation,
    ) -> Step {
        self.add_event(
            thread_id,
            EventLabel::Read {
                kind: LabelKind::Request,
                location,
                value: None,
                ordering,
                exclusive,
                code_location,
            },
        )
    }

    pub fn add_write(
        &mut self,
        thread_id: ThreadId,
        location: MemoryLocation,
        value: ValueId,
        ordering: Ordering,
        exclusive: bool,
        source: Option<EventId>,
        code_location: CodeLocation,
    ) -> Step {
        // For an exclusive write, `source` is the paired read response.
        self.add_event_with(
            thread_id,
            EventLabel::Write {
                location,
                value,
                ordering,
                exclusive,
                code_location,
            },
            source,
        )
    }

    /// Allocate (or replay) an object allocation event. The driver binds the
    /// live cell to the returned id afterwards.
    pub fn add_object_allocation(
        &mut self,
        thread_id: ThreadId,
        class_name: &str,
        memory_init: MemoryInit,
    ) -> AllocationStep {
        if self.replay.in_replay_phase() {
            let probe = EventLabel::ObjectAllocation {
                object_id: INVALID_OBJECT_ID,
                class_name: class_name.into(),
                memory_init: memory_init.clone(),
            };

            return match self.add_event(thread_id, probe) {
                Step::Switch(reason) => AllocationStep::Switch(reason),
                Step::Event(event) => {
                    let object_id = match &self.store[event].label {
                        EventLabel::ObjectAllocation { object_id, .. } => *object_id,
                        _ => unreachable!("[weft internal bug] replayed non-allocation"),
                    };
                    AllocationStep::Allocated { event, object_id }
                }
            };
        }

        let object_id = self.registry.reserve_id();
        match self.add_event(
            thread_id,
            EventLabel::ObjectAllocation {
                object_id,
                class_name: class_name.into(),
                memory_init,
            },
        ) {
            Step::Switch(reason) => AllocationStep::Switch(reason),
            // The arena may have handed back the equivalent allocation from a
            // sibling branch; its id wins over the reserved one.
            Step::Event(event) => match &self.store[event].label {
                EventLabel::ObjectAllocation { object_id, .. } => AllocationStep::Allocated {
                    event,
                    object_id: *object_id,
                },
                _ => unreachable!("[weft internal bug] allocation appended a non-allocation"),
            },
        }
    }

    pub fn add_lock_request(
        &mut self,
        thread_id: ThreadId,
        mutex: ObjectId,
        reentry: bool,
        depth: usize,
        synthetic: bool,
    ) -> Step {
        self.add_event(
            thread_id,
            EventLabel::Lock {
                kind: LabelKind::Request,
                mutex,
                reentry,
                depth,
                synthetic,
            },
        )
    }

    pub fn add_unlock(
        &mut self,
        thread_id: ThreadId,
        mutex: ObjectId,
        reentry: bool,
        depth: usize,
        synthetic: bool,
    ) -> Step {
        self.add_event(
            thread_id,
            EventLabel::Unlock {
                mutex,
                reentry,
                depth,
                synthetic,
            },
        )
    }

    pub fn add_wait_request(&mut self, thread_id: ThreadId, mutex: ObjectId) -> Step {
        self.add_event(
            thread_id,
            EventLabel::Wait {
                kind: LabelKind::Request,
                mutex,
            },
        )
    }

    pub fn add_notify(&mut self, thread_id: ThreadId, mutex: ObjectId, broadcast: bool) -> Step {
        self.add_event(thread_id, EventLabel::Notify { mutex, broadcast })
    }

    pub fn add_park_request(&mut self, thread_id: ThreadId) -> Step {
        self.add_event(
            thread_id,
            EventLabel::Park {
                kind: LabelKind::Request,
                thread_id,
            },
        )
    }

    pub fn add_unpark(&mut self, thread_id: ThreadId, target: ThreadId) -> Step {
        self.add_event(thread_id, EventLabel::Unpark { thread_id: target })
    }

    pub fn add_thread_start_request(&mut self, thread_id: ThreadId) -> Step {
        self.add_event(
            thread_id,
            EventLabel::ThreadStart {
                kind: LabelKind::Request,
                thread_id,
            },
        )
    }

    pub fn add_thread_finish(&mut self, thread_id: ThreadId) -> Step {
        self.add_event(thread_id, EventLabel::ThreadFinish { thread_id })
    }

    pub fn add_thread_fork(&mut self, thread_id: ThreadId, threads: BTreeSet<ThreadId>) -> Step {
        self.add_event(thread_id, EventLabel::ThreadFork { threads })
    }

    pub fn add_thread_join_request(
        &mut self,
        thread_id: ThreadId,
        threads: BTreeSet<ThreadId>,
    ) -> Step {
        self.add_event(
            thread_id,
            EventLabel::ThreadJoin {
                kind: LabelKind::Request,
                pending: threads,
            },
        )
    }

    pub fn add_coroutine_suspend_request(
        &mut self,
        thread_id: ThreadId,
        actor_id: usize,
        prompt_cancellation: bool,
    ) -> Step {
        self.add_event(
            thread_id,
            EventLabel::CoroutineSuspend {
                kind: LabelKind::Request,
                thread_id,
                actor_id,
                prompt_cancellation,
                cancelled: false,
            },
        )
    }

    pub fn add_coroutine_resume(
        &mut self,
        thread_id: ThreadId,
        target: ThreadId,
        actor_id: usize,
    ) -> Step {
        self.add_event(
            thread_id,
            EventLabel::CoroutineResume {
                thread_id: target,
                actor_id,
            },
        )
    }

    pub fn add_actor_span(&mut self, thread_id: ThreadId, span: SpanKind, actor_id: usize) -> Step {
        self.add_event(
            thread_id,
            EventLabel::ActorSpan {
                span,
                thread_id,
                actor_id,
            },
        )
    }

    pub fn add_random(&mut self, thread_id: ThreadId, value: u64) -> Step {
        self.add_event(thread_id, EventLabel::Random { value })
    }
}

/// Outcome of [`EventStructure::add_object_allocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStep {
    Allocated { event: EventId, object_id: ObjectId },
    Switch(SwitchReason),
}

impl fmt::Debug for EventStructure {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EventStructure")
            .field("events", &self.store.len())
            .field("backtracking", &self.backtracking.len())
            .field("dangling", &self.dangling.len())
            .finish()
    }
}
