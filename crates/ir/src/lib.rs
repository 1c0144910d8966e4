//! A sea-of-nodes intermediate representation.
//!
//! Control, value, and effect dependencies are all edges of a single directed
//! graph; there is no explicit basic-block CFG. Each node holds an
//! [`Operator`] describing what it computes and how its ordered input list is
//! partitioned into value, context, frame-state, effect, and control inputs.

mod graph;
mod operator;

pub use graph::{Edge, EdgeKind, Graph, NodeId};
pub use operator::{
    ElementAccess, FieldAccess, IrOpcode, MachineRepresentation, OpParams, Operator,
    OperatorBuilder, POINTER_SIZE, POINTER_SIZE_LOG2,
};
