//! Alias assignment and the escape status analysis.
//!
//! Aliases give every tracked allocation a dense id for indexing per-object
//! state. The status analysis is a worklist over node ids that classifies
//! each tracked node as virtual or escaped; escape is monotone, so the
//! analysis terminates once no rule can fire anymore.

use bitflags::bitflags;
use index_vec::IndexVec;
use ir::{Graph, IrOpcode, NodeId};

use super::{trace, EscapeAnalysisError, Replacements};

/// Dense id of a tracked allocation, with two reserved sentinels.
pub(super) type Alias = u32;

/// The node was never reached from the graph end.
pub(super) const NOT_REACHABLE: Alias = Alias::MAX;
/// The node is reachable but not a tracked allocation.
pub(super) const UNTRACKABLE: Alias = Alias::MAX - 1;

bitflags! {
    struct Status: u16 {
        const TRACKED = 1 << 0;
        const ESCAPED = 1 << 1;
        const ON_STACK = 1 << 2;
        const VISITED = 1 << 3;
        const IN_QUEUE = 1 << 4;
        const DANGLING_COMPUTED = 1 << 5;
        const DANGLING = 1 << 6;
        const BRANCH_POINT_COMPUTED = 1 << 7;
        const BRANCH_POINT = 1 << 8;
    }
}

pub(super) struct EscapeStatusAnalysis {
    status: IndexVec<NodeId, Status>,
    aliases: IndexVec<NodeId, Alias>,
    next_free_alias: Alias,
    status_stack: Vec<NodeId>,
    tracing: bool,
}

impl EscapeStatusAnalysis {
    pub fn new(tracing: bool) -> Self {
        EscapeStatusAnalysis {
            status: IndexVec::new(),
            aliases: IndexVec::new(),
            next_free_alias: 0,
            status_stack: Vec::new(),
            tracing,
        }
    }

    pub fn alias_count(&self) -> usize {
        self.next_free_alias as usize
    }

    pub fn alias(&self, node: NodeId) -> Alias {
        self.aliases.get(node).copied().unwrap_or(UNTRACKABLE)
    }

    fn next_alias(&mut self) -> Alias {
        let alias = self.next_free_alias;
        self.next_free_alias += 1;
        alias
    }

    /// Grows the status table with headroom; the pass creates phi nodes
    /// mid-run, so the node id space is not fixed.
    pub fn resize_status(&mut self, node_count: usize) {
        if self.status.len() <= node_count {
            self.status.resize(node_count + node_count / 10 + 1, Status::empty());
        }
    }

    pub fn is_not_reachable(&self, node: NodeId) -> bool {
        match self.aliases.get(node) {
            // Nodes created by the pass itself are always considered reachable.
            None => false,
            Some(&alias) => alias == NOT_REACHABLE,
        }
    }

    fn has_entry(&self, node: NodeId) -> bool {
        self.status[node].intersects(Status::TRACKED | Status::ESCAPED)
    }

    pub fn is_virtual(&self, node: NodeId) -> bool {
        match self.status.get(node) {
            Some(status) => status.contains(Status::TRACKED) && !status.contains(Status::ESCAPED),
            None => false,
        }
    }

    pub fn is_escaped(&self, node: NodeId) -> bool {
        match self.status.get(node) {
            Some(status) => status.contains(Status::ESCAPED),
            None => false,
        }
    }

    pub fn is_allocation(&self, graph: &Graph, node: NodeId) -> bool {
        matches!(
            graph.opcode(node),
            IrOpcode::Allocate | IrOpcode::FinishRegion
        )
    }

    /// Marks `node` escaped, returning whether that was news. Escape is
    /// monotone; there is no way back to virtual.
    pub fn set_escaped(&mut self, node: NodeId) -> bool {
        let changed = !self.status[node].contains(Status::ESCAPED);
        self.status[node] |= Status::ESCAPED | Status::TRACKED;
        changed
    }

    pub fn is_in_queue(&self, node: NodeId) -> bool {
        self.status[node].contains(Status::IN_QUEUE)
    }

    pub fn set_in_queue(&mut self, node: NodeId, in_queue: bool) {
        if in_queue {
            self.status[node] |= Status::IN_QUEUE;
        } else {
            self.status[node] -= Status::IN_QUEUE;
        }
    }

    pub fn exists_virtual_allocate(&self) -> bool {
        self.aliases
            .iter_enumerated()
            .any(|(node, &alias)| alias < UNTRACKABLE && self.is_virtual(node))
    }

    /// Walks backwards from the graph end, handing each reachable allocation
    /// (and its region finish) a dense alias id. Everything else reachable
    /// becomes untrackable; unreached nodes keep the not-reachable sentinel.
    pub fn assign_aliases(&mut self, graph: &Graph) -> Result<(), EscapeAnalysisError> {
        let node_count = graph.node_count();
        if node_count >= UNTRACKABLE as usize {
            return Err(EscapeAnalysisError::CapacityExceeded(node_count));
        }
        self.resize_status(node_count);
        self.aliases = IndexVec::from_vec(vec![NOT_REACHABLE; node_count]);

        let end = graph.end();
        self.aliases[end] = UNTRACKABLE;
        let mut stack = Vec::with_capacity(node_count.min(1024));
        stack.push(end);
        trace!(self.tracing, "discovering trackable nodes");
        while let Some(node) = stack.pop() {
            match graph.opcode(node) {
                IrOpcode::Allocate => {
                    if self.aliases[node] >= UNTRACKABLE {
                        self.aliases[node] = self.next_alias();
                        trace!(
                            self.tracing,
                            "alias @{} for {}#{:?}",
                            self.aliases[node],
                            graph.op(node).mnemonic(),
                            node
                        );
                        self.enqueue_for_status_analysis(node);
                    }
                }
                IrOpcode::FinishRegion => {
                    let allocate = graph.value_input(node, 0);
                    if graph.opcode(allocate) == IrOpcode::Allocate {
                        if self.aliases[allocate] >= UNTRACKABLE {
                            if self.aliases[allocate] == NOT_REACHABLE {
                                stack.push(allocate);
                            }
                            self.aliases[allocate] = self.next_alias();
                            trace!(
                                self.tracing,
                                "alias @{} for {}#{:?}",
                                self.aliases[allocate],
                                graph.op(allocate).mnemonic(),
                                allocate
                            );
                            self.enqueue_for_status_analysis(allocate);
                        }
                        self.aliases[node] = self.aliases[allocate];
                    }
                }
                _ => {}
            }
            for &input in graph.inputs(node) {
                if self.aliases[input] == NOT_REACHABLE {
                    self.aliases[input] = UNTRACKABLE;
                    stack.push(input);
                }
            }
        }
        Ok(())
    }

    /// A node is dangling when it threads an effect chain through but nothing
    /// reachable consumes its effect output; such nodes can be processed out
    /// of line. Nodes chained directly to the start node are effectful in
    /// general but known not to produce effects here and are not dangling.
    pub fn is_dangling_effect_node(&mut self, graph: &Graph, node: NodeId) -> bool {
        let status = self.status[node];
        if status.contains(Status::DANGLING_COMPUTED) {
            return status.contains(Status::DANGLING);
        }
        let op = graph.op(node);
        if op.effect_in == 0
            || op.effect_out == 0
            || (op.effect_in == 1 && graph.opcode(graph.effect_input(node, 0)) == IrOpcode::Start)
        {
            self.status[node] |= Status::DANGLING_COMPUTED;
            return false;
        }
        for edge in graph.use_edges(node) {
            if self.is_not_reachable(edge.from) {
                continue;
            }
            if graph.is_effect_edge(edge) {
                self.status[node] |= Status::DANGLING_COMPUTED;
                return false;
            }
        }
        self.status[node] |= Status::DANGLING_COMPUTED | Status::DANGLING;
        true
    }

    /// An effect node with more than one non-dangling effect user; successor
    /// states must copy before mutating anything they share with it.
    pub fn is_effect_branch_point(&mut self, graph: &Graph, node: NodeId) -> bool {
        let status = self.status[node];
        if status.contains(Status::BRANCH_POINT_COMPUTED) {
            return status.contains(Status::BRANCH_POINT);
        }
        let mut count = 0;
        for edge in graph.use_edges(node) {
            let use_node = edge.from;
            if self.is_not_reachable(use_node) {
                continue;
            }
            if graph.is_effect_edge(edge) {
                if matches!(
                    graph.opcode(use_node),
                    IrOpcode::LoadField | IrOpcode::LoadElement
                ) && self.is_dangling_effect_node(graph, use_node)
                {
                    continue;
                }
                count += 1;
                if count > 1 {
                    self.status[node] |= Status::BRANCH_POINT_COMPUTED | Status::BRANCH_POINT;
                    return true;
                }
            }
        }
        self.status[node] |= Status::BRANCH_POINT_COMPUTED;
        false
    }

    pub fn enqueue_for_status_analysis(&mut self, node: NodeId) {
        if !self.status[node].contains(Status::ON_STACK) {
            self.status_stack.push(node);
            self.status[node] |= Status::ON_STACK;
        }
    }

    fn revisit_inputs(&mut self, graph: &Graph, node: NodeId) {
        for &input in graph.inputs(node) {
            if !self.status[input].contains(Status::ON_STACK) {
                self.status_stack.push(input);
                self.status[input] |= Status::ON_STACK;
            }
        }
    }

    fn revisit_uses(&mut self, graph: &Graph, node: NodeId) {
        for edge in graph.use_edges(node) {
            let use_node = edge.from;
            if !self.status[use_node].contains(Status::ON_STACK) && !self.is_not_reachable(use_node)
            {
                self.status_stack.push(use_node);
                self.status[use_node] |= Status::ON_STACK;
            }
        }
    }

    pub fn run(&mut self, graph: &Graph, replacements: &Replacements) {
        self.resize_status(graph.node_count());
        while let Some(node) = self.status_stack.pop() {
            self.status[node] -= Status::ON_STACK;
            self.process(graph, replacements, node);
            self.status[node] |= Status::VISITED;
        }
    }

    fn process(&mut self, graph: &Graph, replacements: &Replacements, node: NodeId) {
        match graph.opcode(node) {
            IrOpcode::Allocate => self.process_allocate(graph, node),
            IrOpcode::FinishRegion => self.process_finish_region(graph, node),
            IrOpcode::StoreField => self.process_store_field(graph, node),
            IrOpcode::StoreElement => self.process_store_element(graph, node),
            IrOpcode::LoadField | IrOpcode::LoadElement => {
                if let Some(rep) = replacements.replacement(node) {
                    if self.is_allocation(graph, rep)
                        && self.check_uses_for_escape(graph, node, rep, false)
                    {
                        self.revisit_inputs(graph, rep);
                        self.revisit_uses(graph, rep);
                    }
                }
                self.revisit_uses(graph, node);
            }
            IrOpcode::Phi => {
                if !self.has_entry(node) {
                    self.status[node] |= Status::TRACKED;
                    self.revisit_uses(graph, node);
                }
                if !self.is_allocation_phi(graph, node) && self.set_escaped(node) {
                    trace!(
                        self.tracing,
                        "marking {:?} escaped: phi of non-allocations",
                        node
                    );
                    self.revisit_inputs(graph, node);
                    self.revisit_uses(graph, node);
                }
                self.check_uses_for_escape(graph, node, node, false);
            }
            _ => {}
        }
    }

    fn process_allocate(&mut self, graph: &Graph, node: NodeId) {
        debug_assert_eq!(graph.opcode(node), IrOpcode::Allocate);
        if !self.has_entry(node) {
            self.status[node] |= Status::TRACKED;
            trace!(self.tracing, "created status entry for {:?}", node);
            self.revisit_uses(graph, node);
            let size = graph.match_number(graph.value_input(node, 0));
            if size.is_none() && self.set_escaped(node) {
                trace!(
                    self.tracing,
                    "marking {:?} escaped: non-constant allocation size",
                    node
                );
                // Already escaped; its uses cannot make things worse.
                return;
            }
        }
        if self.check_uses_for_escape_of(graph, node, true) {
            self.revisit_uses(graph, node);
        }
    }

    fn process_finish_region(&mut self, graph: &Graph, node: NodeId) {
        debug_assert_eq!(graph.opcode(node), IrOpcode::FinishRegion);
        if !self.has_entry(node) {
            self.status[node] |= Status::TRACKED;
            self.revisit_uses(graph, node);
        }
        if self.check_uses_for_escape_of(graph, node, true) {
            self.revisit_inputs(graph, node);
        }
    }

    /// A pointer written into a leaked or unmodelled object leaks too.
    fn process_store_field(&mut self, graph: &Graph, node: NodeId) {
        debug_assert_eq!(graph.opcode(node), IrOpcode::StoreField);
        let to = graph.value_input(node, 0);
        let value = graph.value_input(node, 1);
        if (self.is_escaped(to) || !self.is_allocation(graph, to)) && self.set_escaped(value) {
            trace!(
                self.tracing,
                "marking {:?} escaped: stored into field of {:?}",
                value,
                to
            );
            self.revisit_uses(graph, value);
            self.revisit_inputs(graph, value);
        }
    }

    fn process_store_element(&mut self, graph: &Graph, node: NodeId) {
        debug_assert_eq!(graph.opcode(node), IrOpcode::StoreElement);
        let to = graph.value_input(node, 0);
        let value = graph.value_input(node, 2);
        if (self.is_escaped(to) || !self.is_allocation(graph, to)) && self.set_escaped(value) {
            trace!(
                self.tracing,
                "marking {:?} escaped: stored into element of {:?}",
                value,
                to
            );
            self.revisit_uses(graph, value);
            self.revisit_inputs(graph, value);
        }
    }

    fn is_allocation_phi(&self, graph: &Graph, node: NodeId) -> bool {
        for index in 0..graph.op(node).value_in {
            let input = graph.value_input(node, index);
            if graph.opcode(input) == IrOpcode::Phi && !self.is_escaped(input) {
                continue;
            }
            if self.is_allocation(graph, input) {
                continue;
            }
            return false;
        }
        true
    }

    fn check_uses_for_escape_of(&mut self, graph: &Graph, node: NodeId, phi_escaping: bool) -> bool {
        self.check_uses_for_escape(graph, node, node, phi_escaping)
    }

    /// Scans the value and context uses of `uses` and applies the per-opcode
    /// escape rules to the candidate `rep`. Returns true as soon as a rule
    /// fires; the caller then revisits the affected neighborhood.
    fn check_uses_for_escape(
        &mut self,
        graph: &Graph,
        uses: NodeId,
        rep: NodeId,
        phi_escaping: bool,
    ) -> bool {
        for edge in graph.use_edges(uses) {
            let use_node = edge.from;
            if self.is_not_reachable(use_node) {
                continue;
            }
            let use_op = graph.op(use_node);
            if edge.index >= use_op.value_in + use_op.context_in {
                continue;
            }
            match graph.opcode(use_node) {
                IrOpcode::Phi => {
                    if phi_escaping && self.set_escaped(rep) {
                        trace!(
                            self.tracing,
                            "marking {:?} escaped: used by phi {:?}",
                            rep,
                            use_node
                        );
                        return true;
                    }
                }
                IrOpcode::StoreField
                | IrOpcode::LoadField
                | IrOpcode::StoreElement
                | IrOpcode::LoadElement
                | IrOpcode::FrameState
                | IrOpcode::StateValues
                | IrOpcode::ReferenceEqual
                | IrOpcode::FinishRegion => {
                    if self.is_escaped(use_node) && self.set_escaped(rep) {
                        trace!(
                            self.tracing,
                            "marking {:?} escaped: used by escaping node {:?}",
                            rep,
                            use_node
                        );
                        return true;
                    }
                }
                IrOpcode::ObjectIsSmi => {
                    if !self.is_allocation(graph, rep) && self.set_escaped(rep) {
                        trace!(
                            self.tracing,
                            "marking {:?} escaped: used by {:?}",
                            rep,
                            use_node
                        );
                        return true;
                    }
                }
                IrOpcode::Select => {
                    if self.set_escaped(rep) {
                        trace!(
                            self.tracing,
                            "marking {:?} escaped: used by {:?}",
                            rep,
                            use_node
                        );
                        return true;
                    }
                }
                _ => {
                    if use_op.effect_in == 0 && graph.op(uses).effect_out > 0 {
                        unreachable!(
                            "effectful {} consumed by effect-free {}",
                            graph.op(uses).mnemonic(),
                            use_op.mnemonic()
                        );
                    }
                    if self.set_escaped(rep) {
                        trace!(
                            self.tracing,
                            "marking {:?} escaped: used by {:?}",
                            rep,
                            use_node
                        );
                        return true;
                    }
                }
            }
        }
        false
    }

    pub fn debug_print(&self) {
        for (node, status) in self.status.iter_enumerated() {
            if status.contains(Status::TRACKED) {
                tracing::debug!(
                    "node {:?} is {}",
                    node,
                    if status.contains(Status::ESCAPED) {
                        "escaping"
                    } else {
                        "virtual"
                    }
                );
            }
        }
    }
}
