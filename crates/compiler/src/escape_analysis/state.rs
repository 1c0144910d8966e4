//! Symbolic heap states.
//!
//! A [`VirtualState`] maps alias ids to [`VirtualObject`]s, the symbolic
//! contents of one allocation at one program point. States and objects live
//! in arenas owned by the pass and are addressed by ids; sharing a state
//! between effect consumers is just sharing its id. Ownership back-references
//! (a state's owning effect node, an object's owning state) drive the
//! copy-on-write discipline: anything about to mutate a state or object it
//! does not own clones it into the arena first.

use bitflags::bitflags;
use index_vec::{define_index_type, IndexVec};
use ir::NodeId;

define_index_type! {
    pub(super) struct VirtualStateId = u32;
}

define_index_type! {
    pub(super) struct VirtualObjectId = u32;
}

bitflags! {
    pub(super) struct ObjectStatus: u8 {
        const TRACKED = 1 << 0;
        const INITIALIZED = 1 << 1;
        const COPY_REQUIRED = 1 << 2;
    }
}

/// Per-field symbolic contents of a single allocation.
#[derive(Debug, Clone)]
pub(super) struct VirtualObject {
    /// The originating allocation.
    id: NodeId,
    status: ObjectStatus,
    fields: Vec<Option<NodeId>>,
    /// Marks fields whose value was synthesized as a phi by the pass, so a
    /// later merge rewires that phi's inputs instead of stacking a new one.
    created_phi: Vec<bool>,
    /// Cached materialization node, built on demand for deoptimization.
    object_state: Option<NodeId>,
    owner: VirtualStateId,
}

impl VirtualObject {
    /// An object we discovered but cannot model (unknown allocation size).
    pub fn untracked(id: NodeId, owner: VirtualStateId) -> Self {
        VirtualObject {
            id,
            status: ObjectStatus::empty(),
            fields: Vec::new(),
            created_phi: Vec::new(),
            object_state: None,
            owner,
        }
    }

    pub fn tracked(id: NodeId, owner: VirtualStateId, field_count: usize, initialized: bool) -> Self {
        let mut status = ObjectStatus::TRACKED;
        if initialized {
            status |= ObjectStatus::INITIALIZED;
        }
        VirtualObject {
            id,
            status,
            fields: vec![None; field_count],
            created_phi: vec![false; field_count],
            object_state: None,
            owner,
        }
    }

    /// A clone re-owned by `owner`; the clone starts out modifiable.
    pub fn copy(other: &VirtualObject, owner: VirtualStateId) -> Self {
        VirtualObject {
            id: other.id,
            status: other.status - ObjectStatus::COPY_REQUIRED,
            fields: other.fields.clone(),
            created_phi: other.created_phi.clone(),
            object_state: other.object_state,
            owner,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn owner(&self) -> VirtualStateId {
        self.owner
    }

    pub fn is_tracked(&self) -> bool {
        self.status.contains(ObjectStatus::TRACKED)
    }

    pub fn is_initialized(&self) -> bool {
        self.status.contains(ObjectStatus::INITIALIZED)
    }

    pub fn set_initialized(&mut self) {
        self.status |= ObjectStatus::INITIALIZED;
    }

    pub fn set_copy_required(&mut self) {
        self.status |= ObjectStatus::COPY_REQUIRED;
    }

    /// Copy-on-write only pays off once an object can be observed through
    /// more than one effect chain, which is after its region finished.
    pub fn needs_copy_for_modification(&self) -> bool {
        self.status
            .contains(ObjectStatus::COPY_REQUIRED | ObjectStatus::INITIALIZED)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, offset: usize) -> Option<NodeId> {
        self.fields.get(offset).copied().flatten()
    }

    pub fn is_created_phi(&self, offset: usize) -> bool {
        self.created_phi.get(offset).copied().unwrap_or(false)
    }

    pub fn set_field(&mut self, offset: usize, value: Option<NodeId>, created_phi: bool) {
        self.fields[offset] = value;
        self.created_phi[offset] = created_phi;
    }

    /// Resizes to exactly `field_count` slots; a merge dictates the minimum
    /// predecessor field count and nothing beyond it may survive.
    pub fn resize_fields(&mut self, field_count: usize) -> bool {
        if field_count == self.fields.len() {
            return false;
        }
        self.fields.resize(field_count, None);
        self.created_phi.resize(field_count, false);
        true
    }

    pub fn clear_all_fields(&mut self) {
        for field in &mut self.fields {
            *field = None;
        }
        for created in &mut self.created_phi {
            *created = false;
        }
    }

    pub fn all_fields_clear(&self) -> bool {
        self.fields.iter().all(|field| field.is_none())
    }

    /// Overwrites this object's contents with `other`'s, reporting whether
    /// anything changed.
    pub fn update_from(&mut self, other: &VirtualObject) -> bool {
        let mut changed = self.status != other.status;
        self.status = other.status;
        self.created_phi = other.created_phi.clone();
        if self.fields.len() != other.fields.len() {
            self.fields = other.fields.clone();
            return true;
        }
        for offset in 0..self.fields.len() {
            if self.fields[offset] != other.fields[offset] {
                changed = true;
                self.fields[offset] = other.fields[offset];
            }
        }
        changed
    }

    pub fn object_state(&self) -> Option<NodeId> {
        self.object_state
    }

    pub fn set_object_state(&mut self, node: NodeId) {
        self.object_state = Some(node);
    }
}

/// The symbolic heap at one effect-producing node: one optional object slot
/// per alias.
#[derive(Debug, Clone)]
pub(super) struct VirtualState {
    owner: NodeId,
    info: Vec<Option<VirtualObjectId>>,
}

impl VirtualState {
    pub fn new(owner: NodeId, size: usize) -> Self {
        VirtualState {
            owner,
            info: vec![None; size],
        }
    }

    /// A shallow clone re-owned by `owner`; objects stay shared.
    pub fn copy(other: &VirtualState, owner: NodeId) -> Self {
        VirtualState {
            owner,
            info: other.info.clone(),
        }
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn size(&self) -> usize {
        self.info.len()
    }

    pub fn object_at(&self, alias: usize) -> Option<VirtualObjectId> {
        self.info.get(alias).copied().flatten()
    }

    pub fn set_object(&mut self, alias: usize, object: Option<VirtualObjectId>) {
        self.info[alias] = object;
    }
}

/// Scratch vectors reused across effect-phi merges and load-from-phi
/// synthesis, so the steady state of the pass does not allocate per merge.
#[derive(Debug, Default)]
pub(super) struct MergeCache {
    pub states: Vec<VirtualStateId>,
    pub objects: Vec<VirtualObjectId>,
    pub fields: Vec<NodeId>,
}

impl MergeCache {
    pub fn clear(&mut self) {
        self.states.clear();
        self.objects.clear();
        self.fields.clear();
    }

    /// Collects the non-empty values at `pos` from the cached objects into
    /// `fields` and returns the value they all agree on, if any. Objects with
    /// fewer than `pos + 1` fields contribute nothing.
    pub fn get_fields(
        &mut self,
        objects: &IndexVec<VirtualObjectId, VirtualObject>,
        pos: usize,
    ) -> Option<NodeId> {
        self.fields.clear();
        let front = &objects[self.objects[0]];
        let mut rep = if pos >= front.field_count() {
            None
        } else {
            front.field(pos)
        };
        for &oid in &self.objects {
            let object = &objects[oid];
            if pos >= object.field_count() {
                continue;
            }
            let field = object.field(pos);
            if let Some(field) = field {
                self.fields.push(field);
            }
            if field != rep {
                rep = None;
            }
        }
        rep
    }
}
