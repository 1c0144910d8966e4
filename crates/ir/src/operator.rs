/// Size in bytes of a tagged pointer slot. Field offsets and element indices
/// are converted to slot-granular offsets using this constant.
pub const POINTER_SIZE: usize = 8;
pub const POINTER_SIZE_LOG2: usize = 3;

/// The opcode tag set. Opcodes not relevant to any analysis are still valid
/// graph citizens; passes dispatch with wildcard arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrOpcode {
    Start,
    End,

    // Control.
    Branch,
    IfTrue,
    IfFalse,
    Merge,
    Return,

    // Values.
    NumberConstant,
    Parameter,
    Phi,
    EffectPhi,
    Select,

    // Allocation regions and memory access.
    Allocate,
    BeginRegion,
    FinishRegion,
    LoadField,
    StoreField,
    LoadElement,
    StoreElement,

    // Deoptimization plumbing.
    FrameState,
    StateValues,
    ObjectState,

    // Predicates.
    ReferenceEqual,
    ObjectIsSmi,

    // Opaque effectful operation (calls out of the graph).
    Call,
}

impl IrOpcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            IrOpcode::Start => "Start",
            IrOpcode::End => "End",
            IrOpcode::Branch => "Branch",
            IrOpcode::IfTrue => "IfTrue",
            IrOpcode::IfFalse => "IfFalse",
            IrOpcode::Merge => "Merge",
            IrOpcode::Return => "Return",
            IrOpcode::NumberConstant => "NumberConstant",
            IrOpcode::Parameter => "Parameter",
            IrOpcode::Phi => "Phi",
            IrOpcode::EffectPhi => "EffectPhi",
            IrOpcode::Select => "Select",
            IrOpcode::Allocate => "Allocate",
            IrOpcode::BeginRegion => "BeginRegion",
            IrOpcode::FinishRegion => "FinishRegion",
            IrOpcode::LoadField => "LoadField",
            IrOpcode::StoreField => "StoreField",
            IrOpcode::LoadElement => "LoadElement",
            IrOpcode::StoreElement => "StoreElement",
            IrOpcode::FrameState => "FrameState",
            IrOpcode::StateValues => "StateValues",
            IrOpcode::ObjectState => "ObjectState",
            IrOpcode::ReferenceEqual => "ReferenceEqual",
            IrOpcode::ObjectIsSmi => "ObjectIsSmi",
            IrOpcode::Call => "Call",
        }
    }
}

/// Machine-level representation of a stored or computed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineRepresentation {
    Word8,
    Word16,
    Word32,
    Word64,
    Float32,
    Float64,
    Tagged,
}

impl MachineRepresentation {
    pub fn element_size_log2(self) -> usize {
        match self {
            MachineRepresentation::Word8 => 0,
            MachineRepresentation::Word16 => 1,
            MachineRepresentation::Word32 | MachineRepresentation::Float32 => 2,
            MachineRepresentation::Word64 | MachineRepresentation::Float64 => 3,
            MachineRepresentation::Tagged => POINTER_SIZE_LOG2,
        }
    }
}

/// Parameters of a field load or store: a byte offset into the object plus
/// the representation of the accessed field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldAccess {
    pub offset: usize,
    pub machine_type: MachineRepresentation,
}

/// Parameters of an element load or store: the byte size of the object
/// header preceding the element area plus the element representation. The
/// element index is a value input of the node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementAccess {
    pub header_size: usize,
    pub machine_type: MachineRepresentation,
}

/// Static payload attached to an operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpParams {
    None,
    Field(FieldAccess),
    Element(ElementAccess),
    Phi { representation: MachineRepresentation },
    Select { representation: MachineRepresentation },
    ObjectState { id: u32 },
    NumberConstant(f64),
    Parameter(u32),
}

/// Describes a node's computation and the partitioning of its input list.
///
/// Inputs are ordered: value inputs, then context inputs, then frame-state
/// inputs, then effect inputs, then control inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Operator {
    pub opcode: IrOpcode,
    pub value_in: usize,
    pub context_in: usize,
    pub frame_state_in: usize,
    pub effect_in: usize,
    pub control_in: usize,
    pub value_out: usize,
    pub effect_out: usize,
    pub control_out: usize,
    pub params: OpParams,
}

impl Operator {
    pub fn mnemonic(&self) -> &'static str {
        self.opcode.mnemonic()
    }

    pub fn input_count(&self) -> usize {
        self.value_in + self.context_in + self.frame_state_in + self.effect_in + self.control_in
    }

    pub fn first_value_index(&self) -> usize {
        0
    }

    pub fn first_context_index(&self) -> usize {
        self.value_in
    }

    pub fn first_frame_state_index(&self) -> usize {
        self.value_in + self.context_in
    }

    pub fn first_effect_index(&self) -> usize {
        self.value_in + self.context_in + self.frame_state_in
    }

    pub fn first_control_index(&self) -> usize {
        self.value_in + self.context_in + self.frame_state_in + self.effect_in
    }

    pub fn field_access(&self) -> FieldAccess {
        match self.params {
            OpParams::Field(access) => access,
            _ => unreachable!("{} has no field access", self.mnemonic()),
        }
    }

    pub fn element_access(&self) -> ElementAccess {
        match self.params {
            OpParams::Element(access) => access,
            _ => unreachable!("{} has no element access", self.mnemonic()),
        }
    }
}

/// Factory for the operators shared by all passes. Synthesized operators
/// (phis, object states) are created through this as well, so the pass that
/// needs them never hand-assembles input layouts.
#[derive(Debug, Default)]
pub struct OperatorBuilder;

impl OperatorBuilder {
    pub fn new() -> Self {
        OperatorBuilder
    }

    fn op(
        &self,
        opcode: IrOpcode,
        value_in: usize,
        effect_in: usize,
        control_in: usize,
        value_out: usize,
        effect_out: usize,
        control_out: usize,
        params: OpParams,
    ) -> Operator {
        Operator {
            opcode,
            value_in,
            context_in: 0,
            frame_state_in: 0,
            effect_in,
            control_in,
            value_out,
            effect_out,
            control_out,
            params,
        }
    }

    pub fn start(&self) -> Operator {
        self.op(IrOpcode::Start, 0, 0, 0, 1, 1, 1, OpParams::None)
    }

    pub fn end(&self, control_count: usize) -> Operator {
        self.op(IrOpcode::End, 0, 0, control_count, 0, 0, 0, OpParams::None)
    }

    pub fn branch(&self) -> Operator {
        self.op(IrOpcode::Branch, 1, 0, 1, 0, 0, 2, OpParams::None)
    }

    pub fn if_true(&self) -> Operator {
        self.op(IrOpcode::IfTrue, 0, 0, 1, 0, 0, 1, OpParams::None)
    }

    pub fn if_false(&self) -> Operator {
        self.op(IrOpcode::IfFalse, 0, 0, 1, 0, 0, 1, OpParams::None)
    }

    pub fn merge(&self, control_count: usize) -> Operator {
        self.op(IrOpcode::Merge, 0, 0, control_count, 0, 0, 1, OpParams::None)
    }

    pub fn return_(&self) -> Operator {
        self.op(IrOpcode::Return, 1, 1, 1, 0, 0, 1, OpParams::None)
    }

    pub fn number_constant(&self, value: f64) -> Operator {
        self.op(
            IrOpcode::NumberConstant,
            0,
            0,
            0,
            1,
            0,
            0,
            OpParams::NumberConstant(value),
        )
    }

    pub fn parameter(&self, index: u32) -> Operator {
        self.op(IrOpcode::Parameter, 1, 0, 0, 1, 0, 0, OpParams::Parameter(index))
    }

    /// A value phi with `value_count` value inputs plus a merge as control.
    pub fn phi(&self, representation: MachineRepresentation, value_count: usize) -> Operator {
        self.op(
            IrOpcode::Phi,
            value_count,
            0,
            1,
            1,
            0,
            0,
            OpParams::Phi { representation },
        )
    }

    pub fn effect_phi(&self, effect_count: usize) -> Operator {
        self.op(IrOpcode::EffectPhi, 0, effect_count, 1, 0, 1, 0, OpParams::None)
    }

    pub fn select(&self, representation: MachineRepresentation) -> Operator {
        self.op(
            IrOpcode::Select,
            3,
            0,
            0,
            1,
            0,
            0,
            OpParams::Select { representation },
        )
    }

    /// Allocation of `size` bytes (the size operand is the value input).
    pub fn allocate(&self) -> Operator {
        self.op(IrOpcode::Allocate, 1, 1, 1, 1, 1, 0, OpParams::None)
    }

    pub fn begin_region(&self) -> Operator {
        self.op(IrOpcode::BeginRegion, 0, 1, 0, 0, 1, 0, OpParams::None)
    }

    pub fn finish_region(&self) -> Operator {
        self.op(IrOpcode::FinishRegion, 1, 1, 0, 1, 1, 0, OpParams::None)
    }

    pub fn load_field(&self, access: FieldAccess) -> Operator {
        self.op(IrOpcode::LoadField, 1, 1, 1, 1, 1, 0, OpParams::Field(access))
    }

    pub fn store_field(&self, access: FieldAccess) -> Operator {
        self.op(IrOpcode::StoreField, 2, 1, 1, 0, 1, 0, OpParams::Field(access))
    }

    pub fn load_element(&self, access: ElementAccess) -> Operator {
        self.op(IrOpcode::LoadElement, 2, 1, 1, 1, 1, 0, OpParams::Element(access))
    }

    pub fn store_element(&self, access: ElementAccess) -> Operator {
        self.op(IrOpcode::StoreElement, 3, 1, 1, 0, 1, 0, OpParams::Element(access))
    }

    pub fn frame_state(&self, value_count: usize) -> Operator {
        self.op(IrOpcode::FrameState, value_count, 0, 0, 1, 0, 0, OpParams::None)
    }

    pub fn state_values(&self, value_count: usize) -> Operator {
        self.op(IrOpcode::StateValues, value_count, 0, 0, 1, 0, 0, OpParams::None)
    }

    /// Bundles the current field values of a virtual allocation so the
    /// deoptimizer can rebuild the object. `id` names the allocation.
    pub fn object_state(&self, input_count: usize, id: u32) -> Operator {
        self.op(
            IrOpcode::ObjectState,
            input_count,
            0,
            0,
            1,
            0,
            0,
            OpParams::ObjectState { id },
        )
    }

    pub fn reference_equal(&self) -> Operator {
        self.op(IrOpcode::ReferenceEqual, 2, 0, 0, 1, 0, 0, OpParams::None)
    }

    pub fn object_is_smi(&self) -> Operator {
        self.op(IrOpcode::ObjectIsSmi, 1, 0, 0, 1, 0, 0, OpParams::None)
    }

    /// An opaque call with `value_count` value inputs and, optionally,
    /// frame-state inputs for deoptimization.
    pub fn call(&self, value_count: usize, frame_state_count: usize) -> Operator {
        Operator {
            opcode: IrOpcode::Call,
            value_in: value_count,
            context_in: 0,
            frame_state_in: frame_state_count,
            effect_in: 1,
            control_in: 1,
            value_out: 1,
            effect_out: 1,
            control_out: 0,
            params: OpParams::None,
        }
    }
}
