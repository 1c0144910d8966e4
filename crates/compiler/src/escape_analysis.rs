//! Escape analysis for the sea-of-nodes IR.
//!
//! Heap allocations whose address never leaves the current function can have
//! their memory modelled symbolically: loads from them are replaced by the
//! values that were stored, and the allocation itself becomes a candidate for
//! scalar replacement downstream. Two cooperating analyses run to a fixed
//! point over the same graph:
//!
//! * the *object analysis* walks effect edges and computes, per effect node,
//!   a virtual state mapping each tracked allocation to its symbolic field
//!   contents, synthesizing value phis where control flow merges distinct
//!   heap histories;
//! * the *status analysis* propagates an escaped bit along uses, so that any
//!   allocation observed by an operation we cannot model is excluded.
//!
//! The pass also materializes object-state nodes on demand, bundling the
//! current field values of a virtual allocation so the deoptimizer can
//! rebuild the object on bailout.

use std::collections::VecDeque;

use index_vec::IndexVec;
use ir::{
    Graph, IrOpcode, MachineRepresentation, NodeId, OperatorBuilder, POINTER_SIZE,
    POINTER_SIZE_LOG2,
};
use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::PassConfig;

mod state;
mod status;

#[cfg(test)]
mod tests;

use state::{MergeCache, VirtualObject, VirtualObjectId, VirtualState, VirtualStateId};
use status::EscapeStatusAnalysis;

macro_rules! trace {
    ($enabled:expr, $($arg:tt)*) => {
        if $enabled {
            ::tracing::debug!($($arg)*);
        }
    };
}
pub(crate) use trace;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EscapeAnalysisError {
    /// The node id space no longer fits into the alias id space (which
    /// reserves two sentinel values). The caller keeps the graph unchanged.
    #[error("graph has {0} nodes, exceeding the trackable alias space")]
    CapacityExceeded(usize),
}

/// Partial map from node to replacement node. Replacements chain (a load may
/// be replaced by another load that is itself replaced); resolution follows
/// the chain, which the pass keeps acyclic.
#[derive(Debug, Default)]
pub(crate) struct Replacements {
    map: IndexVec<NodeId, Option<NodeId>>,
}

impl Replacements {
    fn grow(&mut self, node_count: usize) {
        if self.map.len() < node_count {
            self.map.resize(node_count, None);
        }
    }

    fn get(&self, node: NodeId) -> Option<NodeId> {
        self.map.get(node).copied().flatten()
    }

    fn set(&mut self, node: NodeId, rep: Option<NodeId>) -> bool {
        let entry = &mut self.map[node];
        let changed = *entry != rep;
        *entry = rep;
        changed
    }

    /// The end of `node`'s replacement chain, or `node` itself.
    fn resolve(&self, mut node: NodeId) -> NodeId {
        while let Some(rep) = self.get(node) {
            node = rep;
        }
        node
    }

    /// The end of the chain, or None when `node` has no replacement at all.
    pub(crate) fn replacement(&self, node: NodeId) -> Option<NodeId> {
        self.get(node).map(|rep| self.resolve(rep))
    }
}

pub struct EscapeAnalysis<'g> {
    graph: &'g mut Graph,
    common: &'g OperatorBuilder,
    status: EscapeStatusAnalysis,
    /// Virtual state produced by each effect node, shared by id.
    virtual_states: IndexVec<NodeId, Option<VirtualStateId>>,
    states: IndexVec<VirtualStateId, VirtualState>,
    objects: IndexVec<VirtualObjectId, VirtualObject>,
    replacements: Replacements,
    cache: MergeCache,
    tracing: bool,
}

impl<'g> EscapeAnalysis<'g> {
    pub fn new(graph: &'g mut Graph, common: &'g OperatorBuilder, config: &PassConfig) -> Self {
        let tracing = config.trace_escape_analysis;
        EscapeAnalysis {
            graph,
            common,
            status: EscapeStatusAnalysis::new(tracing),
            virtual_states: IndexVec::new(),
            states: IndexVec::new(),
            objects: IndexVec::new(),
            replacements: Replacements::default(),
            cache: MergeCache::default(),
            tracing,
        }
    }

    pub fn run(&mut self) -> Result<(), EscapeAnalysisError> {
        self.replacements.grow(self.graph.node_count());
        self.status.assign_aliases(self.graph)?;
        if self.status.alias_count() > 0 {
            self.status.resize_status(self.graph.node_count());
            self.run_object_analysis();
            self.status.run(self.graph, &self.replacements);
            if self.tracing {
                self.status.debug_print();
            }
        }
        Ok(())
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// The fully resolved replacement for `node`, if any.
    pub fn replacement(&self, node: NodeId) -> Option<NodeId> {
        self.replacements.replacement(node)
    }

    pub fn is_virtual(&self, node: NodeId) -> bool {
        self.status.is_virtual(node)
    }

    pub fn is_escaped(&self, node: NodeId) -> bool {
        self.status.is_escaped(node)
    }

    /// True when at least one tracked allocation survived as virtual, so a
    /// downstream reducer has something to scalar-replace.
    pub fn exists_virtual_allocate(&self) -> bool {
        self.status.exists_virtual_allocate()
    }

    /// Two virtual allocations denote the same object when their replacement
    /// chains meet or end in structurally equivalent phis.
    pub fn compare_virtual_objects(&self, left: NodeId, right: NodeId) -> bool {
        debug_assert!(self.is_virtual(left) && self.is_virtual(right));
        let left = self.replacements.resolve(left);
        let right = self.replacements.resolve(right);
        is_equivalent_phi(self.graph, left, right)
    }

    // Object analysis.

    fn run_object_analysis(&mut self) {
        self.virtual_states.resize(self.graph.node_count(), None);
        let mut queue = VecDeque::new();
        queue.push_back(self.graph.start());
        let mut danglers = Vec::new();
        while let Some(node) = queue.pop_back() {
            self.status.set_in_queue(node, false);
            if self.process(node) {
                let uses: Vec<_> = self.graph.use_edges(node).collect();
                for edge in uses {
                    let use_node = edge.from;
                    if self.status.is_not_reachable(use_node) {
                        continue;
                    }
                    if self.graph.is_effect_edge(edge) {
                        // Depth first, but delay effect phis so their
                        // predecessors settle before the merge runs, and
                        // handle dangling loads immediately so their
                        // consumers see accurate states without re-enqueue
                        // churn.
                        if self.graph.opcode(use_node) == IrOpcode::EffectPhi {
                            if !self.status.is_in_queue(use_node) {
                                queue.push_front(use_node);
                            }
                        } else if !matches!(
                            self.graph.opcode(use_node),
                            IrOpcode::LoadField | IrOpcode::LoadElement
                        ) || !self.status.is_dangling_effect_node(self.graph, use_node)
                        {
                            if !self.status.is_in_queue(use_node) {
                                self.status.set_in_queue(use_node, true);
                                queue.push_back(use_node);
                            }
                        } else {
                            danglers.push(use_node);
                        }
                    }
                }
                queue.extend(danglers.drain(..));
            }
        }
        if self.tracing {
            self.debug_print();
        }
    }

    fn process(&mut self, node: NodeId) -> bool {
        match self.graph.opcode(node) {
            IrOpcode::Allocate => self.process_allocation(node),
            IrOpcode::BeginRegion => self.forward_virtual_state(node),
            IrOpcode::FinishRegion => self.process_finish_region(node),
            IrOpcode::StoreField => self.process_store_field(node),
            IrOpcode::LoadField => self.process_load_field(node),
            IrOpcode::StoreElement => self.process_store_element(node),
            IrOpcode::LoadElement => self.process_load_element(node),
            IrOpcode::Start => self.process_start(node),
            IrOpcode::EffectPhi => return self.process_effect_phi(node),
            _ => {
                if self.graph.op(node).effect_in > 0 {
                    self.forward_virtual_state(node);
                }
                self.process_allocation_users(node);
            }
        }
        true
    }

    fn process_start(&mut self, node: NodeId) {
        debug_assert_eq!(self.graph.opcode(node), IrOpcode::Start);
        let state = VirtualState::new(node, self.status.alias_count());
        self.virtual_states[node] = Some(self.states.push(state));
    }

    /// Makes `node`'s state available: either adopt the input effect's state
    /// (copy-required when the input is an effect branch point or `node`
    /// carries a frame state), or fold the input state into the one `node`
    /// already has.
    fn forward_virtual_state(&mut self, node: NodeId) {
        debug_assert_eq!(self.graph.op(node).effect_in, 1);
        if cfg!(debug_assertions)
            && !matches!(
                self.graph.opcode(node),
                IrOpcode::LoadField | IrOpcode::LoadElement
            )
            && self.status.is_dangling_effect_node(self.graph, node)
        {
            unreachable!(
                "dangling effect node {}#{:?} in the main effect chain",
                self.graph.op(node).mnemonic(),
                node
            );
        }
        let effect = self.graph.effect_input(node, 0);
        let effect_state = self.virtual_states[effect].expect("effect input has no state yet");
        if let Some(state) = self.virtual_states[node] {
            self.update_state_from(state, effect_state);
        } else {
            self.virtual_states[node] = Some(effect_state);
            trace!(
                self.tracing,
                "forwarding state from {}#{:?} to {}#{:?}",
                self.graph.op(effect).mnemonic(),
                effect,
                self.graph.op(node).mnemonic(),
                node
            );
            if self.status.is_effect_branch_point(self.graph, effect)
                || self.graph.op(node).frame_state_in > 0
            {
                trace!(self.tracing, "state of {:?} requires copy on write", node);
                let size = self.states[effect_state].size();
                for alias in 0..size {
                    if let Some(object) = self.states[effect_state].object_at(alias) {
                        self.objects[object].set_copy_required();
                    }
                }
            }
        }
    }

    /// Folds `from` into `target` alias by alias, adopting objects `target`
    /// lacks and updating the fields of the ones it has.
    fn update_state_from(&mut self, target: VirtualStateId, from: VirtualStateId) -> bool {
        if target == from {
            return false;
        }
        let mut changed = false;
        let size = self.states[target].size();
        for alias in 0..size {
            let ls = self.states[target].object_at(alias);
            let rs = self.states[from].object_at(alias);
            if ls == rs || rs.is_none() {
                continue;
            }
            let rs = rs.unwrap();
            match ls {
                None => {
                    let copy = VirtualObject::copy(&self.objects[rs], target);
                    let object = self.objects.push(copy);
                    self.states[target].set_object(alias, Some(object));
                    changed = true;
                }
                Some(ls) => {
                    trace!(self.tracing, "updating fields of alias @{}", alias);
                    let source = self.objects[rs].clone();
                    changed = self.objects[ls].update_from(&source) || changed;
                }
            }
        }
        changed
    }

    fn copy_state_for_modification(&mut self, node: NodeId) -> VirtualStateId {
        let state = self.virtual_states[node].unwrap();
        if self.states[state].owner() == node {
            return state;
        }
        let copy = VirtualState::copy(&self.states[state], node);
        let new_state = self.states.push(copy);
        self.virtual_states[node] = Some(new_state);
        trace!(
            self.tracing,
            "copying state {:?} to {:?} at {}#{:?}",
            state,
            new_state,
            self.graph.op(node).mnemonic(),
            node
        );
        new_state
    }

    /// Copy-on-write before a mutation of `object` at `node`. Only objects
    /// that are both shared (copy-required) and initialized need a copy.
    fn copy_for_modification(&mut self, object: VirtualObjectId, node: NodeId) -> VirtualObjectId {
        if !self.objects[object].needs_copy_for_modification() {
            return object;
        }
        let state = self.copy_state_for_modification(node);
        if self.objects[object].owner() == state {
            return object;
        }
        let alias = self.status.alias(self.objects[object].id()) as usize;
        let copy = VirtualObject::copy(&self.objects[object], state);
        let new_object = self.objects.push(copy);
        self.states[state].set_object(alias, Some(new_object));
        trace!(
            self.tracing,
            "copying object {:?} to {:?} at alias @{}",
            object,
            new_object,
            alias
        );
        new_object
    }

    fn get_virtual_object(&self, state: VirtualStateId, node: NodeId) -> Option<VirtualObjectId> {
        let alias = self.status.alias(node) as usize;
        if alias < self.states[state].size() {
            self.states[state].object_at(alias)
        } else {
            None
        }
    }

    fn resolve_virtual_object(
        &self,
        state: VirtualStateId,
        node: NodeId,
    ) -> Option<VirtualObjectId> {
        self.get_virtual_object(state, self.replacements.resolve(node))
    }

    fn process_allocation(&mut self, node: NodeId) {
        debug_assert_eq!(self.graph.opcode(node), IrOpcode::Allocate);
        self.forward_virtual_state(node);
        let mut state = self.virtual_states[node].unwrap();
        let alias = self.status.alias(node) as usize;

        // Nothing to do on revisits.
        if self.states[state].object_at(alias).is_some() {
            return;
        }

        if self.graph.opcode(self.states[state].owner()) == IrOpcode::EffectPhi {
            state = self.copy_state_for_modification(node);
        }

        let size = self.graph.match_number(self.graph.value_input(node, 0));
        let object = match size {
            Some(size) => {
                VirtualObject::tracked(node, state, size as usize / POINTER_SIZE, false)
            }
            // Unknown size: keep a placeholder so loads stay unreplaced. The
            // status analysis is responsible for marking the node escaped.
            None => VirtualObject::untracked(node, state),
        };
        let object = self.objects.push(object);
        self.states[state].set_object(alias, Some(object));
    }

    fn process_finish_region(&mut self, node: NodeId) {
        debug_assert_eq!(self.graph.opcode(node), IrOpcode::FinishRegion);
        self.forward_virtual_state(node);
        let allocation = self.graph.value_input(node, 0);
        if self.graph.opcode(allocation) == IrOpcode::Allocate {
            let state = self.virtual_states[node].unwrap();
            let alias = self.status.alias(node) as usize;
            let object = self.states[state]
                .object_at(alias)
                .expect("finished region has no virtual object");
            self.objects[object].set_initialized();
        }
    }

    /// Slot offset of a field access, or None when the byte offset is not
    /// pointer aligned (in which case the access is left alone).
    fn field_offset(&self, node: NodeId) -> Option<usize> {
        let access = self.graph.op(node).field_access();
        if access.offset % POINTER_SIZE != 0 {
            return None;
        }
        Some(access.offset / POINTER_SIZE)
    }

    fn update_replacement(&mut self, node: NodeId, rep: Option<NodeId>) -> bool {
        if self.replacements.set(node, rep) {
            match rep {
                Some(rep) => trace!(
                    self.tracing,
                    "replacement of {:?} is {}#{:?}",
                    node,
                    self.graph.op(rep).mnemonic(),
                    rep
                ),
                None => trace!(self.tracing, "replacement of {:?} cleared", node),
            }
            true
        } else {
            false
        }
    }

    fn process_load_field(&mut self, node: NodeId) {
        debug_assert_eq!(self.graph.opcode(node), IrOpcode::LoadField);
        self.forward_virtual_state(node);
        let from = self.replacements.resolve(self.graph.value_input(node, 0));
        let state = self.virtual_states[node].unwrap();
        let offset = self.field_offset(node);
        if let Some(object) = self.get_virtual_object(state, from) {
            let offset = match offset {
                Some(offset) => offset,
                None => return,
            };
            let object = &self.objects[object];
            if !object.is_tracked()
                || !object.is_initialized()
                || offset >= object.field_count()
            {
                return;
            }
            let value = object.field(offset);
            let value = value.map(|value| self.replacements.resolve(value));
            self.update_replacement(node, value);
        } else if self.graph.opcode(from) == IrOpcode::Phi && offset.is_some() {
            self.process_load_from_phi(offset.unwrap(), from, node, state);
        } else {
            self.update_replacement(node, None);
        }
    }

    fn process_load_element(&mut self, node: NodeId) {
        debug_assert_eq!(self.graph.opcode(node), IrOpcode::LoadElement);
        self.forward_virtual_state(node);
        let from = self.replacements.resolve(self.graph.value_input(node, 0));
        let state = self.virtual_states[node].unwrap();
        let index_node = self.graph.value_input(node, 1);
        let access = self.graph.op(node).element_access();
        match self.graph.match_number(index_node) {
            Some(index) => {
                let offset = index as usize + access.header_size / POINTER_SIZE;
                if let Some(object) = self.get_virtual_object(state, from) {
                    if access.machine_type.element_size_log2() < POINTER_SIZE_LOG2
                        || access.header_size % POINTER_SIZE != 0
                    {
                        return;
                    }
                    let object = &self.objects[object];
                    if !object.is_tracked()
                        || !object.is_initialized()
                        || offset >= object.field_count()
                    {
                        return;
                    }
                    let value = object.field(offset);
                    let value = value.map(|value| self.replacements.resolve(value));
                    self.update_replacement(node, value);
                } else if self.graph.opcode(from) == IrOpcode::Phi {
                    self.process_load_from_phi(offset, from, node, state);
                } else {
                    self.update_replacement(node, None);
                }
            }
            None => {
                // A load at an unknown index observes the whole object.
                if self.status.set_escaped(from) {
                    trace!(
                        self.tracing,
                        "marking {:?} escaped: load at non-constant index {:?}",
                        from,
                        index_node
                    );
                }
            }
        }
    }

    /// The load's base is a value phi. When every phi input resolves to a
    /// tracked object holding a value at `offset`, the load is replaced by a
    /// fresh phi over those values (reusing a structurally equivalent
    /// replacement if one is already in place).
    fn process_load_from_phi(
        &mut self,
        offset: usize,
        from: NodeId,
        node: NodeId,
        state: VirtualStateId,
    ) {
        trace!(self.tracing, "load {:?} from phi {:?}", node, from);
        self.cache.fields.clear();
        for index in 0..self.graph.op(from).value_in {
            self.cache.fields.push(self.graph.value_input(from, index));
        }

        self.cache.objects.clear();
        for index in 0..self.cache.fields.len() {
            let input = self.replacements.resolve(self.cache.fields[index]);
            if let Some(object) = self.get_virtual_object(state, input) {
                if self.objects[object].is_tracked() {
                    self.cache.objects.push(object);
                }
            }
        }
        if self.cache.objects.len() != self.graph.op(from).value_in {
            trace!(self.tracing, "load from phi {:?}: incomplete object info", from);
            return;
        }

        self.cache.get_fields(&self.objects, offset);
        if self.cache.fields.len() != self.cache.objects.len() {
            trace!(self.tracing, "load from phi {:?}: incomplete field info", from);
            return;
        }

        if let Some(rep) = self.replacements.get(node) {
            if is_equivalent_phi_inputs(self.graph, rep, &self.cache.fields) {
                trace!(self.tracing, "load {:?} already has phi {:?}", node, rep);
                return;
            }
        }

        let value_input_count = self.cache.fields.len();
        self.cache.fields.push(self.graph.control_input(from, 0));
        let op = self
            .common
            .phi(MachineRepresentation::Tagged, value_input_count);
        let phi = self.graph.new_node(op, &self.cache.fields);
        self.grow_tables();
        self.update_replacement(node, Some(phi));
        trace!(self.tracing, "created phi {:?} for load {:?}", phi, node);
    }

    fn process_store_field(&mut self, node: NodeId) {
        debug_assert_eq!(self.graph.opcode(node), IrOpcode::StoreField);
        self.forward_virtual_state(node);
        let to = self.replacements.resolve(self.graph.value_input(node, 0));
        let state = self.virtual_states[node].unwrap();
        let offset = match self.field_offset(node) {
            Some(offset) => offset,
            None => return,
        };
        if let Some(object) = self.get_virtual_object(state, to) {
            if self.objects[object].is_tracked() && offset < self.objects[object].field_count() {
                let value = self.replacements.resolve(self.graph.value_input(node, 1));
                if self.objects[object].field(offset) != Some(value) {
                    let object = self.copy_for_modification(object, node);
                    self.objects[object].set_field(offset, Some(value), false);
                }
            }
        }
    }

    fn process_store_element(&mut self, node: NodeId) {
        debug_assert_eq!(self.graph.opcode(node), IrOpcode::StoreElement);
        self.forward_virtual_state(node);
        let to = self.replacements.resolve(self.graph.value_input(node, 0));
        let state = self.virtual_states[node].unwrap();
        let index_node = self.graph.value_input(node, 1);
        let access = self.graph.op(node).element_access();
        match self.graph.match_number(index_node) {
            Some(index) => {
                let offset = index as usize + access.header_size / POINTER_SIZE;
                if let Some(object) = self.get_virtual_object(state, to) {
                    if access.machine_type.element_size_log2() < POINTER_SIZE_LOG2
                        || access.header_size % POINTER_SIZE != 0
                    {
                        return;
                    }
                    if self.objects[object].is_tracked()
                        && offset < self.objects[object].field_count()
                    {
                        let value = self.replacements.resolve(self.graph.value_input(node, 2));
                        if self.objects[object].field(offset) != Some(value) {
                            let object = self.copy_for_modification(object, node);
                            self.objects[object].set_field(offset, Some(value), false);
                        }
                    }
                }
            }
            None => {
                // A store at an unknown index can hit any slot: the object
                // escapes and every remembered field is wiped.
                if self.status.set_escaped(to) {
                    trace!(
                        self.tracing,
                        "marking {:?} escaped: store at non-constant index {:?}",
                        to,
                        index_node
                    );
                }
                if let Some(object) = self.get_virtual_object(state, to) {
                    if self.objects[object].is_tracked()
                        && !self.objects[object].all_fields_clear()
                    {
                        let object = self.copy_for_modification(object, node);
                        self.objects[object].clear_all_fields();
                        trace!(self.tracing, "cleared all fields of {:?}", object);
                    }
                }
            }
        }
    }

    /// Conservative fallback for unknown effectful nodes: any tracked object
    /// flowing into such a node may have been observed and mutated, so its
    /// remembered fields are wiped.
    fn process_allocation_users(&mut self, node: NodeId) {
        let op = self.graph.op(node);
        let limit = op.value_in + op.context_in;
        for index in 0..limit {
            let input = self.graph.inputs(node)[index];
            let input = self.replacements.resolve(input);
            let state = match self.virtual_states[node] {
                Some(state) => state,
                None => return,
            };
            if let Some(object) = self.get_virtual_object(state, input) {
                if self.objects[object].is_tracked() && !self.objects[object].all_fields_clear() {
                    let object = self.copy_for_modification(object, node);
                    self.objects[object].clear_all_fields();
                    trace!(
                        self.tracing,
                        "cleared all fields of {:?}: consumed by {}#{:?}",
                        object,
                        self.graph.op(node).mnemonic(),
                        node
                    );
                }
            }
        }
    }

    fn process_effect_phi(&mut self, node: NodeId) -> bool {
        debug_assert_eq!(self.graph.opcode(node), IrOpcode::EffectPhi);
        let mut changed = false;
        let alias_count = self.status.alias_count();

        let mut merge_state = match self.virtual_states[node] {
            Some(state) => state,
            None => {
                let state = self.states.push(VirtualState::new(node, alias_count));
                self.virtual_states[node] = Some(state);
                changed = true;
                trace!(self.tracing, "effect phi {:?} got new state {:?}", node, state);
                state
            }
        };

        self.cache.clear();
        for index in 0..self.graph.op(node).effect_in {
            let input = self.graph.effect_input(node, index);
            if let Some(state) = self.virtual_states[input] {
                self.cache.states.push(state);
                if state == merge_state {
                    // The merge target leaked into a predecessor; merge into
                    // a fresh state instead.
                    let fresh = self.states.push(VirtualState::new(node, alias_count));
                    self.virtual_states[node] = Some(fresh);
                    merge_state = fresh;
                    changed = true;
                }
            }
        }
        if self.cache.states.is_empty() {
            return changed;
        }

        changed |= self.merge_from(merge_state, node);
        trace!(
            self.tracing,
            "merge at {:?} {}",
            node,
            if changed { "changed" } else { "did not change" }
        );
        if changed {
            self.status.resize_status(self.graph.node_count());
        }
        changed
    }

    /// Pointwise meet of the cached predecessor states into `merge_state`.
    /// An alias survives only when every predecessor has an object for it;
    /// fields agree, become phis, or become empty.
    fn merge_from(&mut self, merge_state: VirtualStateId, node: NodeId) -> bool {
        debug_assert!(!self.cache.states.is_empty());
        let control = self.graph.control_input(node, 0);
        let arity = self.graph.op(node).effect_in;
        let mut changed = false;
        for alias in 0..self.status.alias_count() {
            self.cache.objects.clear();
            let merge_object = self.states[merge_state].object_at(alias);
            let mut copy_merge_object = false;
            let mut field_count = usize::MAX;
            let mut initialized = true;
            let mut id = None;
            for index in 0..self.cache.states.len() {
                let state = self.cache.states[index];
                if let Some(object) = self.states[state].object_at(alias) {
                    self.cache.objects.push(object);
                    if merge_object == Some(object) {
                        copy_merge_object = true;
                        changed = true;
                    }
                    let object = &self.objects[object];
                    field_count = field_count.min(object.field_count());
                    initialized &= object.is_initialized();
                    if id.is_none() {
                        id = Some(object.id());
                    }
                }
            }
            if self.cache.objects.len() != self.cache.states.len() {
                if merge_object.is_some() {
                    trace!(self.tracing, "alias @{}: virtual object removed", alias);
                    changed = true;
                }
                self.states[merge_state].set_object(alias, None);
                continue;
            }

            let merge_object = self.get_or_create_tracked_object(
                merge_state,
                alias,
                id.unwrap(),
                initialized,
                copy_merge_object,
            );
            changed |= self.objects[merge_object].resize_fields(field_count);
            for offset in 0..field_count {
                if let Some(field) = self.cache.get_fields(&self.objects, offset) {
                    changed = changed || self.objects[merge_object].field(offset) != Some(field);
                    self.objects[merge_object].set_field(offset, Some(field), false);
                    trace!(
                        self.tracing,
                        "alias @{} field {} agrees on {:?}",
                        alias,
                        offset,
                        field
                    );
                } else {
                    let value_input_count = self.cache.fields.len();
                    if value_input_count == arity {
                        let rep = self.objects[merge_object].field(offset);
                        if rep.is_none() || !self.objects[merge_object].is_created_phi(offset) {
                            self.cache.fields.push(control);
                            let op = self
                                .common
                                .phi(MachineRepresentation::Tagged, value_input_count);
                            let phi = self.graph.new_node(op, &self.cache.fields);
                            self.grow_tables();
                            self.objects[merge_object].set_field(offset, Some(phi), true);
                            trace!(
                                self.tracing,
                                "alias @{} field {}: created phi {:?}",
                                alias,
                                offset,
                                phi
                            );
                            changed = true;
                        } else {
                            // Keep the phi and rewire its inputs in place, so
                            // later iterations converge on a stable node.
                            let rep = rep.unwrap();
                            debug_assert_eq!(self.graph.opcode(rep), IrOpcode::Phi);
                            for index in 0..value_input_count {
                                let old = self.graph.value_input(rep, index);
                                let new = self.cache.fields[index];
                                if old != new {
                                    changed = true;
                                    self.graph.replace_value_input(rep, index, new);
                                }
                            }
                        }
                    } else {
                        if self.objects[merge_object].field(offset).is_some() {
                            trace!(self.tracing, "alias @{} field {} cleared", alias, offset);
                            changed = true;
                        }
                        self.objects[merge_object].set_field(offset, None, false);
                    }
                }
            }
        }
        changed
    }

    fn get_or_create_tracked_object(
        &mut self,
        state: VirtualStateId,
        alias: usize,
        id: NodeId,
        initialized: bool,
        force_copy: bool,
    ) -> VirtualObjectId {
        if !force_copy {
            if let Some(object) = self.states[state].object_at(alias) {
                return object;
            }
        }
        let object = self
            .objects
            .push(VirtualObject::tracked(id, state, 0, initialized));
        self.states[state].set_object(alias, Some(object));
        object
    }

    /// Tables indexed by node id must cover nodes the pass itself creates.
    fn grow_tables(&mut self) {
        let node_count = self.graph.node_count();
        self.replacements.grow(node_count);
        if self.virtual_states.len() < node_count {
            self.virtual_states.resize(node_count, None);
        }
        self.status.resize_status(node_count);
    }

    // Object-state materialization.

    /// Builds (or returns the cached) object-state node bundling the current
    /// field values of `node`'s virtual object, as seen at `effect`. Fields
    /// that are themselves virtual allocations are materialized recursively;
    /// the node is cached before recursing so reference cycles terminate.
    pub fn get_or_create_object_state(&mut self, effect: NodeId, node: NodeId) -> Option<NodeId> {
        if !matches!(
            self.graph.opcode(node),
            IrOpcode::Allocate | IrOpcode::FinishRegion
        ) || !self.is_virtual(node)
        {
            return None;
        }
        let state = self.virtual_states.get(effect).copied().flatten()?;
        let object = self.resolve_virtual_object(state, node)?;
        if let Some(object_state) = self.objects[object].object_state() {
            return Some(object_state);
        }

        let mut fields = Vec::new();
        for offset in 0..self.objects[object].field_count() {
            if let Some(field) = self.objects[object].field(offset) {
                fields.push(field);
            }
        }
        let id = self.objects[object].id().index() as u32;
        let op = self.common.object_state(fields.len(), id);
        let object_state = self.graph.new_node(op, &fields);
        self.grow_tables();
        self.objects[object].set_object_state(object_state);
        trace!(
            self.tracing,
            "created object state {:?} for {:?} at effect {:?}",
            object_state,
            node,
            effect
        );
        for (input_index, field) in fields.into_iter().enumerate() {
            if let Some(field_object_state) = self.get_or_create_object_state(effect, field) {
                self.graph
                    .replace_value_input(object_state, input_index, field_object_state);
            }
        }
        Some(object_state)
    }

    fn debug_print(&self) {
        let mut seen = FxHashSet::default();
        for state in self.virtual_states.iter().flatten() {
            if !seen.insert(*state) {
                continue;
            }
            tracing::debug!("virtual state {:?} (owner {:?})", state, self.states[*state].owner());
            for alias in 0..self.states[*state].size() {
                if let Some(object) = self.states[*state].object_at(alias) {
                    let object = &self.objects[object];
                    tracing::debug!(
                        "  alias @{}: object #{:?} with {} fields",
                        alias,
                        object.id(),
                        object.field_count()
                    );
                    for offset in 0..object.field_count() {
                        if let Some(field) = object.field(offset) {
                            tracing::debug!(
                                "    field {} = {}#{:?}",
                                offset,
                                self.graph.op(field).mnemonic(),
                                field
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Structural phi equivalence: equal nodes, or phis of the same arity whose
/// value inputs are pairwise equivalent.
fn is_equivalent_phi(graph: &Graph, left: NodeId, right: NodeId) -> bool {
    if left == right {
        return true;
    }
    if graph.opcode(left) != IrOpcode::Phi
        || graph.opcode(right) != IrOpcode::Phi
        || graph.op(left).value_in != graph.op(right).value_in
    {
        return false;
    }
    for index in 0..graph.op(left).value_in {
        if !is_equivalent_phi(
            graph,
            graph.value_input(left, index),
            graph.value_input(right, index),
        ) {
            return false;
        }
    }
    true
}

fn is_equivalent_phi_inputs(graph: &Graph, phi: NodeId, inputs: &[NodeId]) -> bool {
    if graph.opcode(phi) != IrOpcode::Phi || graph.op(phi).value_in != inputs.len() {
        return false;
    }
    for (index, &input) in inputs.iter().enumerate() {
        if !is_equivalent_phi(graph, graph.value_input(phi, index), input) {
            return false;
        }
    }
    true
}
