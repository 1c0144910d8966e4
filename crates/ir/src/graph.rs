use index_vec::{define_index_type, IndexVec};

use crate::operator::{IrOpcode, OpParams, Operator};

define_index_type! {
    /// Dense node id assigned by the graph. Ids are stable, but the id space
    /// grows when passes insert new nodes, so id-indexed tables must grow
    /// with the graph.
    pub struct NodeId = u32;
}

/// Classification of one input slot, derived from the position of the slot
/// within the owning operator's input layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Value,
    Context,
    FrameState,
    Effect,
    Control,
}

/// A directed edge: `from` consumes `to` through input slot `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub index: usize,
}

#[derive(Debug)]
struct NodeData {
    op: Operator,
    inputs: Vec<NodeId>,
    /// Reverse edges: (user, input index of the user).
    uses: Vec<(NodeId, usize)>,
}

/// The node store. Nodes are created through [`Graph::new_node`] and never
/// removed; dead nodes are simply left behind for downstream trimming.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: IndexVec<NodeId, NodeData>,
    start: Option<NodeId>,
    end: Option<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId::from_usize)
    }

    pub fn new_node(&mut self, op: Operator, inputs: &[NodeId]) -> NodeId {
        assert_eq!(
            inputs.len(),
            op.input_count(),
            "wrong input count for {}",
            op.mnemonic()
        );
        let id = self.nodes.push(NodeData {
            op,
            inputs: inputs.to_vec(),
            uses: Vec::new(),
        });
        for (index, &input) in inputs.iter().enumerate() {
            self.nodes[input].uses.push((id, index));
        }
        id
    }

    pub fn set_start(&mut self, node: NodeId) {
        self.start = Some(node);
    }

    pub fn start(&self) -> NodeId {
        self.start.expect("graph start not set")
    }

    pub fn set_end(&mut self, node: NodeId) {
        self.end = Some(node);
    }

    pub fn end(&self) -> NodeId {
        self.end.expect("graph end not set")
    }

    pub fn op(&self, node: NodeId) -> &Operator {
        &self.nodes[node].op
    }

    pub fn opcode(&self, node: NodeId) -> IrOpcode {
        self.nodes[node].op.opcode
    }

    pub fn inputs(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node].inputs
    }

    pub fn input_edges(&self, node: NodeId) -> impl Iterator<Item = Edge> + '_ {
        self.nodes[node]
            .inputs
            .iter()
            .enumerate()
            .map(move |(index, &to)| Edge {
                from: node,
                to,
                index,
            })
    }

    pub fn use_edges(&self, node: NodeId) -> impl Iterator<Item = Edge> + '_ {
        self.nodes[node].uses.iter().map(move |&(from, index)| Edge {
            from,
            to: node,
            index,
        })
    }

    /// The kind of an input slot, from the layout of the user's operator.
    pub fn edge_kind(&self, edge: Edge) -> EdgeKind {
        let op = &self.nodes[edge.from].op;
        if edge.index < op.first_context_index() {
            EdgeKind::Value
        } else if edge.index < op.first_frame_state_index() {
            EdgeKind::Context
        } else if edge.index < op.first_effect_index() {
            EdgeKind::FrameState
        } else if edge.index < op.first_control_index() {
            EdgeKind::Effect
        } else {
            EdgeKind::Control
        }
    }

    pub fn is_effect_edge(&self, edge: Edge) -> bool {
        self.edge_kind(edge) == EdgeKind::Effect
    }

    pub fn value_input(&self, node: NodeId, index: usize) -> NodeId {
        let data = &self.nodes[node];
        debug_assert!(index < data.op.value_in);
        data.inputs[data.op.first_value_index() + index]
    }

    pub fn effect_input(&self, node: NodeId, index: usize) -> NodeId {
        let data = &self.nodes[node];
        debug_assert!(index < data.op.effect_in);
        data.inputs[data.op.first_effect_index() + index]
    }

    pub fn control_input(&self, node: NodeId, index: usize) -> NodeId {
        let data = &self.nodes[node];
        debug_assert!(index < data.op.control_in);
        data.inputs[data.op.first_control_index() + index]
    }

    /// Rewires input slot `index` (an absolute index) of `node` to `new_input`,
    /// keeping the reverse edges in sync.
    pub fn replace_input(&mut self, node: NodeId, index: usize, new_input: NodeId) {
        let old = self.nodes[node].inputs[index];
        if old == new_input {
            return;
        }
        self.nodes[node].inputs[index] = new_input;
        let uses = &mut self.nodes[old].uses;
        let position = uses
            .iter()
            .position(|&use_| use_ == (node, index))
            .expect("use edge missing");
        uses.swap_remove(position);
        self.nodes[new_input].uses.push((node, index));
    }

    pub fn replace_value_input(&mut self, node: NodeId, index: usize, new_input: NodeId) {
        debug_assert!(index < self.nodes[node].op.value_in);
        let absolute = self.nodes[node].op.first_value_index() + index;
        self.replace_input(node, absolute, new_input);
    }

    /// Extracts the constant value of a number constant, if `node` is one.
    pub fn match_number(&self, node: NodeId) -> Option<f64> {
        match self.nodes[node].op.params {
            OpParams::NumberConstant(value) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{MachineRepresentation, OperatorBuilder};

    #[test]
    fn use_edges_track_inputs() {
        let common = OperatorBuilder::new();
        let mut graph = Graph::new();
        let start = graph.new_node(common.start(), &[]);
        let a = graph.new_node(common.number_constant(1.0), &[]);
        let b = graph.new_node(common.number_constant(2.0), &[]);
        let merge = graph.new_node(common.merge(1), &[start]);
        let phi = graph.new_node(
            common.phi(MachineRepresentation::Tagged, 2),
            &[a, b, merge],
        );

        assert_eq!(graph.value_input(phi, 0), a);
        assert_eq!(graph.value_input(phi, 1), b);
        assert_eq!(graph.control_input(phi, 0), merge);
        assert_eq!(graph.use_edges(a).count(), 1);

        let edge = graph.use_edges(merge).next().unwrap();
        assert_eq!(edge.from, phi);
        assert_eq!(graph.edge_kind(edge), EdgeKind::Control);

        graph.replace_value_input(phi, 0, b);
        assert_eq!(graph.value_input(phi, 0), b);
        assert_eq!(graph.use_edges(a).count(), 0);
        assert_eq!(graph.use_edges(b).count(), 2);
    }

    #[test]
    fn effect_edges_are_classified_by_layout() {
        let common = OperatorBuilder::new();
        let mut graph = Graph::new();
        let start = graph.new_node(common.start(), &[]);
        let size = graph.new_node(common.number_constant(8.0), &[]);
        let alloc = graph.new_node(common.allocate(), &[size, start, start]);

        let kinds: Vec<_> = graph
            .input_edges(alloc)
            .map(|edge| graph.edge_kind(edge))
            .collect();
        assert_eq!(kinds, vec![EdgeKind::Value, EdgeKind::Effect, EdgeKind::Control]);

        let effect_uses: Vec<_> = graph
            .use_edges(start)
            .filter(|&edge| graph.is_effect_edge(edge))
            .collect();
        assert_eq!(effect_uses.len(), 1);
        assert_eq!(effect_uses[0].from, alloc);
    }
}
