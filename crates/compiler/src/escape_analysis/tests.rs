use ir::{
    ElementAccess, FieldAccess, Graph, IrOpcode, MachineRepresentation, NodeId, OperatorBuilder,
};

use super::EscapeAnalysis;
use crate::PassConfig;

const TAGGED: MachineRepresentation = MachineRepresentation::Tagged;

/// Builds small literal graphs node by node. Effect and control inputs are
/// always passed explicitly so each test reads like the effect chain it
/// exercises.
struct TestGraph {
    graph: Graph,
    common: OperatorBuilder,
    start: NodeId,
}

impl TestGraph {
    fn new() -> Self {
        let common = OperatorBuilder::new();
        let mut graph = Graph::new();
        let start = graph.new_node(common.start(), &[]);
        graph.set_start(start);
        TestGraph {
            graph,
            common,
            start,
        }
    }

    fn number(&mut self, value: f64) -> NodeId {
        self.graph.new_node(self.common.number_constant(value), &[])
    }

    fn parameter(&mut self, index: u32) -> NodeId {
        let start = self.start;
        self.graph.new_node(self.common.parameter(index), &[start])
    }

    fn allocate(&mut self, size: NodeId, effect: NodeId, control: NodeId) -> NodeId {
        self.graph
            .new_node(self.common.allocate(), &[size, effect, control])
    }

    fn finish_region(&mut self, value: NodeId, effect: NodeId) -> NodeId {
        self.graph
            .new_node(self.common.finish_region(), &[value, effect])
    }

    fn store_field(
        &mut self,
        offset: usize,
        object: NodeId,
        value: NodeId,
        effect: NodeId,
        control: NodeId,
    ) -> NodeId {
        let access = FieldAccess {
            offset,
            machine_type: TAGGED,
        };
        self.graph.new_node(
            self.common.store_field(access),
            &[object, value, effect, control],
        )
    }

    fn load_field(
        &mut self,
        offset: usize,
        object: NodeId,
        effect: NodeId,
        control: NodeId,
    ) -> NodeId {
        let access = FieldAccess {
            offset,
            machine_type: TAGGED,
        };
        self.graph
            .new_node(self.common.load_field(access), &[object, effect, control])
    }

    fn store_element(
        &mut self,
        header_size: usize,
        object: NodeId,
        index: NodeId,
        value: NodeId,
        effect: NodeId,
        control: NodeId,
    ) -> NodeId {
        let access = ElementAccess {
            header_size,
            machine_type: TAGGED,
        };
        self.graph.new_node(
            self.common.store_element(access),
            &[object, index, value, effect, control],
        )
    }

    fn load_element(
        &mut self,
        header_size: usize,
        object: NodeId,
        index: NodeId,
        effect: NodeId,
        control: NodeId,
    ) -> NodeId {
        let access = ElementAccess {
            header_size,
            machine_type: TAGGED,
        };
        self.graph.new_node(
            self.common.load_element(access),
            &[object, index, effect, control],
        )
    }

    fn branch(&mut self, condition: NodeId, control: NodeId) -> (NodeId, NodeId) {
        let branch = self
            .graph
            .new_node(self.common.branch(), &[condition, control]);
        let if_true = self.graph.new_node(self.common.if_true(), &[branch]);
        let if_false = self.graph.new_node(self.common.if_false(), &[branch]);
        (if_true, if_false)
    }

    fn merge2(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.graph.new_node(self.common.merge(2), &[a, b])
    }

    fn phi2(&mut self, a: NodeId, b: NodeId, control: NodeId) -> NodeId {
        self.graph
            .new_node(self.common.phi(TAGGED, 2), &[a, b, control])
    }

    fn effect_phi2(&mut self, a: NodeId, b: NodeId, control: NodeId) -> NodeId {
        self.graph
            .new_node(self.common.effect_phi(2), &[a, b, control])
    }

    fn select(&mut self, condition: NodeId, if_true: NodeId, if_false: NodeId) -> NodeId {
        self.graph
            .new_node(self.common.select(TAGGED), &[condition, if_true, if_false])
    }

    fn object_is_smi(&mut self, value: NodeId) -> NodeId {
        self.graph.new_node(self.common.object_is_smi(), &[value])
    }

    fn state_values1(&mut self, value: NodeId) -> NodeId {
        self.graph.new_node(self.common.state_values(1), &[value])
    }

    fn call1(&mut self, argument: NodeId, effect: NodeId, control: NodeId) -> NodeId {
        self.graph
            .new_node(self.common.call(1, 0), &[argument, effect, control])
    }

    fn return_(&mut self, value: NodeId, effect: NodeId, control: NodeId) -> NodeId {
        self.graph
            .new_node(self.common.return_(), &[value, effect, control])
    }

    fn end(&mut self, control: NodeId) {
        let end = self.graph.new_node(self.common.end(1), &[control]);
        self.graph.set_end(end);
    }
}

fn analyze(test: &mut TestGraph) -> EscapeAnalysis<'_> {
    let mut analysis = EscapeAnalysis::new(&mut test.graph, &test.common, &PassConfig::default());
    analysis.run().unwrap();
    analysis
}

#[test]
fn scalar_replacement_of_single_field() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.number(16.0);
    let value = t.number(42.0);

    let alloc = t.allocate(size, start, start);
    let region = t.finish_region(alloc, alloc);
    let store = t.store_field(0, region, value, region, start);
    let load = t.load_field(0, region, store, start);
    let ret = t.return_(load, store, start);
    t.end(ret);

    let analysis = analyze(&mut t);
    assert_eq!(analysis.replacement(load), Some(value));
    assert!(analysis.is_virtual(alloc));
    assert!(analysis.is_virtual(region));
    assert!(analysis.exists_virtual_allocate());
    assert!(analysis.compare_virtual_objects(alloc, alloc));
}

#[test]
fn store_into_unknown_base_escapes_the_stored_value() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.number(16.0);
    let param = t.parameter(0);

    let alloc = t.allocate(size, start, start);
    let region = t.finish_region(alloc, alloc);
    let store1 = t.store_field(0, region, param, region, start);
    let load = t.load_field(0, region, store1, start);
    // Writing the region into an unknown object leaks it.
    let store2 = t.store_field(0, param, region, store1, start);
    let ret = t.return_(load, store2, start);
    t.end(ret);

    let analysis = analyze(&mut t);
    assert_eq!(analysis.replacement(load), Some(param));
    assert!(analysis.is_escaped(region));
    assert!(analysis.is_escaped(alloc));
    assert!(!analysis.is_virtual(alloc));
}

#[test]
fn load_from_phi_synthesizes_a_value_phi() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.number(8.0);
    let v1 = t.number(1.0);
    let v2 = t.number(2.0);
    let condition = t.parameter(0);

    let (if_true, if_false) = t.branch(condition, start);
    let alloc1 = t.allocate(size, start, if_true);
    let region1 = t.finish_region(alloc1, alloc1);
    let store1 = t.store_field(0, region1, v1, region1, if_true);
    let alloc2 = t.allocate(size, start, if_false);
    let region2 = t.finish_region(alloc2, alloc2);
    let store2 = t.store_field(0, region2, v2, region2, if_false);

    let merge = t.merge2(if_true, if_false);
    let effect_phi = t.effect_phi2(store1, store2, merge);
    let base = t.phi2(region1, region2, merge);
    let load = t.load_field(0, base, effect_phi, merge);
    let ret = t.return_(load, effect_phi, merge);
    t.end(ret);

    let analysis = analyze(&mut t);
    let phi = analysis.replacement(load).expect("load should be replaced");
    let graph = analysis.graph();
    assert_eq!(graph.opcode(phi), IrOpcode::Phi);
    assert_eq!(graph.value_input(phi, 0), v1);
    assert_eq!(graph.value_input(phi, 1), v2);
    assert_eq!(graph.control_input(phi, 0), merge);
}

#[test]
fn effect_phi_merge_synthesizes_field_phi() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.number(8.0);
    let v1 = t.number(1.0);
    let v2 = t.number(2.0);
    let v3 = t.number(3.0);
    let condition = t.parameter(0);

    let alloc = t.allocate(size, start, start);
    let region = t.finish_region(alloc, alloc);
    let store0 = t.store_field(0, region, v1, region, start);
    let (if_true, if_false) = t.branch(condition, start);
    let store_true = t.store_field(0, region, v2, store0, if_true);
    let store_false = t.store_field(0, region, v3, store0, if_false);
    let merge = t.merge2(if_true, if_false);
    let effect_phi = t.effect_phi2(store_true, store_false, merge);
    let load = t.load_field(0, region, effect_phi, merge);
    let ret = t.return_(load, effect_phi, merge);
    t.end(ret);

    let analysis = analyze(&mut t);
    let phi = analysis.replacement(load).expect("load should be replaced");
    let graph = analysis.graph();
    assert_eq!(graph.opcode(phi), IrOpcode::Phi);
    assert_eq!(graph.value_input(phi, 0), v2);
    assert_eq!(graph.value_input(phi, 1), v3);
    assert_eq!(graph.control_input(phi, 0), merge);
    assert!(analysis.is_virtual(alloc));
    assert!(analysis.is_virtual(region));
}

#[test]
fn effect_phi_merge_preserves_phi_identity_across_iterations() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.number(16.0);
    let v1 = t.number(1.0);
    let v2 = t.number(2.0);
    let v3 = t.number(3.0);

    let alloc = t.allocate(size, start, start);
    let region = t.finish_region(alloc, alloc);
    let store_a = t.store_field(0, region, v1, region, start);
    let store_b = t.store_field(8, region, v2, store_a, start);

    // A loop whose body rotates field 0 into field 8 and refreshes field 0,
    // so the merged field values keep changing for a couple of iterations.
    let loop_ctrl = t.merge2(start, start);
    t.graph.replace_input(loop_ctrl, 1, loop_ctrl);
    let effect_phi = t.effect_phi2(store_b, store_b, loop_ctrl);
    let load0 = t.load_field(0, region, effect_phi, loop_ctrl);
    let load8 = t.load_field(8, region, effect_phi, loop_ctrl);
    let store8 = t.store_field(8, region, load0, effect_phi, loop_ctrl);
    let store0 = t.store_field(0, region, v3, store8, loop_ctrl);
    t.graph.replace_input(effect_phi, 1, store0);
    let ret = t.return_(load8, effect_phi, loop_ctrl);
    t.end(ret);

    let node_count_before = t.graph.node_count();
    let analysis = analyze(&mut t);
    let phi0 = analysis.replacement(load0).expect("field 0 load replaced");
    let phi8 = analysis.replacement(load8).expect("field 8 load replaced");
    let graph = analysis.graph();
    assert_eq!(graph.opcode(phi0), IrOpcode::Phi);
    assert_eq!(graph.value_input(phi0, 0), v1);
    assert_eq!(graph.value_input(phi0, 1), v3);
    assert_eq!(graph.opcode(phi8), IrOpcode::Phi);
    assert_eq!(graph.value_input(phi8, 0), v2);
    // The second input stabilized on the other field phi by rewiring the
    // existing node in place.
    assert_eq!(graph.value_input(phi8, 1), phi0);
    // Exactly one phi per field; later iterations must not stack new ones.
    assert_eq!(graph.node_count(), node_count_before + 2);
    assert!(analysis.is_virtual(alloc));
}

#[test]
fn non_constant_element_store_escapes_and_havocs() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.number(64.0);
    let index = t.number(2.0);
    let v1 = t.number(7.0);
    let v2 = t.number(9.0);
    let unknown_index = t.parameter(0);

    let alloc = t.allocate(size, start, start);
    let store1 = t.store_element(0, alloc, index, v1, alloc, start);
    let store2 = t.store_element(0, alloc, unknown_index, v2, store1, start);
    let load = t.load_element(0, alloc, index, store2, start);
    let ret = t.return_(load, store2, start);
    t.end(ret);

    let analysis = analyze(&mut t);
    assert_eq!(analysis.replacement(load), None);
    assert!(analysis.is_escaped(alloc));
    assert!(!analysis.is_virtual(alloc));
    assert!(!analysis.exists_virtual_allocate());
}

#[test]
fn object_state_materialization_handles_reference_cycles() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.number(8.0);
    let zero = t.number(0.0);

    let alloc_a = t.allocate(size, start, start);
    let alloc_b = t.allocate(size, alloc_a, start);
    let store_a = t.store_field(0, alloc_a, alloc_b, alloc_b, start);
    let store_b = t.store_field(0, alloc_b, alloc_a, store_a, start);
    let ret = t.return_(zero, store_b, start);
    t.end(ret);

    let mut analysis = analyze(&mut t);
    assert!(analysis.is_virtual(alloc_a));
    assert!(analysis.is_virtual(alloc_b));

    let state_a = analysis
        .get_or_create_object_state(store_b, alloc_a)
        .expect("object state for a");
    let state_b = analysis
        .get_or_create_object_state(store_b, alloc_b)
        .expect("object state for b");
    let graph = analysis.graph();
    assert_eq!(graph.opcode(state_a), IrOpcode::ObjectState);
    assert_eq!(graph.opcode(state_b), IrOpcode::ObjectState);
    // The two object states reference each other exactly once.
    assert_eq!(graph.value_input(state_a, 0), state_b);
    assert_eq!(graph.value_input(state_b, 0), state_a);
    // Repeated requests hit the cache.
    assert_eq!(
        analysis.get_or_create_object_state(store_b, alloc_a),
        Some(state_a)
    );
}

#[test]
fn select_use_escapes_the_allocation() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.number(8.0);
    let zero = t.number(0.0);
    let condition = t.parameter(0);

    let alloc = t.allocate(size, start, start);
    let region = t.finish_region(alloc, alloc);
    let select = t.select(condition, region, zero);
    let ret = t.return_(select, region, start);
    t.end(ret);

    let analysis = analyze(&mut t);
    assert!(analysis.is_escaped(region));
    assert!(analysis.is_escaped(alloc));
}

#[test]
fn object_is_smi_keeps_allocation_virtual() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.number(8.0);

    let alloc = t.allocate(size, start, start);
    let region = t.finish_region(alloc, alloc);
    let is_smi = t.object_is_smi(region);
    let ret = t.return_(is_smi, region, start);
    t.end(ret);

    let analysis = analyze(&mut t);
    assert!(analysis.is_virtual(alloc));
    assert!(analysis.is_virtual(region));
}

#[test]
fn deopt_observation_keeps_allocation_virtual() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.number(8.0);

    let alloc = t.allocate(size, start, start);
    let region = t.finish_region(alloc, alloc);
    let observed = t.state_values1(region);
    let ret = t.return_(observed, region, start);
    t.end(ret);

    let analysis = analyze(&mut t);
    assert!(analysis.is_virtual(alloc));
    assert!(analysis.is_virtual(region));
}

#[test]
fn unknown_call_escapes_and_clears_remembered_fields() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.number(8.0);
    let value = t.number(42.0);

    let alloc = t.allocate(size, start, start);
    let region = t.finish_region(alloc, alloc);
    let store = t.store_field(0, region, value, region, start);
    let load_before = t.load_field(0, region, store, start);
    let call = t.call1(region, store, start);
    let load_after = t.load_field(0, region, call, start);
    let observed = t.state_values1(load_before);
    let keep_alive = t.select(observed, load_after, load_after);
    let ret = t.return_(keep_alive, call, start);
    t.end(ret);

    let analysis = analyze(&mut t);
    assert_eq!(analysis.replacement(load_before), Some(value));
    // The call may have observed and rewritten the object.
    assert_eq!(analysis.replacement(load_after), None);
    assert!(analysis.is_escaped(region));
    assert!(analysis.is_escaped(alloc));
}

#[test]
fn uninitialized_object_yields_no_replacement() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.number(8.0);
    let value = t.number(42.0);

    // No region finish: the object never becomes initialized.
    let alloc = t.allocate(size, start, start);
    let store = t.store_field(0, alloc, value, alloc, start);
    let load = t.load_field(0, alloc, store, start);
    let ret = t.return_(load, store, start);
    t.end(ret);

    let analysis = analyze(&mut t);
    assert_eq!(analysis.replacement(load), None);
    assert!(analysis.is_virtual(alloc));
}

#[test]
fn unaligned_field_offset_is_ignored() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.number(16.0);
    let value = t.number(42.0);

    let alloc = t.allocate(size, start, start);
    let region = t.finish_region(alloc, alloc);
    let store = t.store_field(4, region, value, region, start);
    let load = t.load_field(4, region, store, start);
    let ret = t.return_(load, store, start);
    t.end(ret);

    let analysis = analyze(&mut t);
    // Misaligned accesses are skipped, not punished.
    assert_eq!(analysis.replacement(load), None);
    assert!(analysis.is_virtual(alloc));
}

#[test]
fn non_constant_allocation_size_escapes() {
    let mut t = TestGraph::new();
    let start = t.start;
    let size = t.parameter(0);
    let value = t.number(42.0);

    let alloc = t.allocate(size, start, start);
    let store = t.store_field(0, alloc, value, alloc, start);
    let load = t.load_field(0, alloc, store, start);
    let ret = t.return_(load, store, start);
    t.end(ret);

    let analysis = analyze(&mut t);
    assert_eq!(analysis.replacement(load), None);
    assert!(analysis.is_escaped(alloc));
}
