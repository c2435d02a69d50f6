//! Type descriptors and the type registry
//!
//! The allocator only needs a small slice of the type system: the layout
//! encoding, whether the type may be instantiated or cloned, where an
//! instance keeps its reference fields, and the array-of relationship used
//! by multi-dimensional arrays.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::layout::{HEADER_SIZE, LayoutEncoding, REFERENCE_SIZE};

/// Index of a registered type. Id 0 is never handed out.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(u32);

impl TypeId {
    /// Wrap a raw id
    #[inline(always)]
    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw id
    #[inline(always)]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeId({})", self.0)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable description of an allocatable type
pub struct TypeDescriptor {
    id: TypeId,
    name: String,
    layout: LayoutEncoding,
    instantiated: bool,
    cloneable: bool,
    unaligned_allocation: bool,
    /// Offsets of reference fields in instances and in the fixed part of hybrids
    reference_offsets: Box<[u32]>,
    /// Element type of a reference array
    component: Option<TypeId>,
    /// Array-of-this-type, set once when that array type registers
    array_type: OnceLock<TypeId>,
}

impl TypeDescriptor {
    /// Registered id
    #[inline]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Name given at registration
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Layout encoding
    #[inline(always)]
    pub fn layout(&self) -> LayoutEncoding {
        self.layout
    }

    /// True if allocation sites may create objects of this type
    #[inline(always)]
    pub fn is_instantiated(&self) -> bool {
        self.instantiated
    }

    /// True if objects of this type support cloning
    #[inline]
    pub fn is_cloneable(&self) -> bool {
        self.cloneable
    }

    /// True if objects must be placed in unaligned chunks regardless of size
    #[inline(always)]
    pub fn requires_unaligned_allocation(&self) -> bool {
        self.unaligned_allocation
    }

    /// Offsets of reference fields outside the element region
    pub fn reference_offsets(&self) -> &[u32] {
        &self.reference_offsets
    }

    /// True if objects of this type can hold references
    #[inline]
    pub fn has_references(&self) -> bool {
        !self.reference_offsets.is_empty() || self.layout.has_reference_elements()
    }

    /// Element type of a reference array, if known
    pub fn component_type(&self) -> Option<TypeId> {
        self.component
    }

    /// The array-of-this-type, if one has been registered
    pub fn array_type(&self) -> Option<TypeId> {
        self.array_type.get().copied()
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Registration request for a new type
#[derive(Debug, Clone)]
pub struct TypeSpec {
    name: String,
    layout: LayoutEncoding,
    instantiated: bool,
    cloneable: bool,
    unaligned_allocation: bool,
    reference_offsets: Vec<u32>,
    component: Option<TypeId>,
}

impl TypeSpec {
    fn new(name: impl Into<String>, layout: LayoutEncoding) -> Self {
        Self {
            name: name.into(),
            layout,
            instantiated: true,
            cloneable: true,
            unaligned_allocation: false,
            reference_offsets: Vec::new(),
            component: None,
        }
    }

    /// Fixed-size type of `size` bytes including the header
    pub fn instance(name: impl Into<String>, size: usize) -> Self {
        Self::new(name, LayoutEncoding::instance(size))
    }

    /// Array of primitive elements
    pub fn primitive_array(name: impl Into<String>, element_size: usize) -> Self {
        Self::new(name, LayoutEncoding::array(element_size, false))
    }

    /// Array of references to `component` objects
    pub fn reference_array(name: impl Into<String>, component: Option<TypeId>) -> Self {
        let mut spec = Self::new(name, LayoutEncoding::array(REFERENCE_SIZE, true));
        spec.component = component;
        spec
    }

    /// Hybrid whose fixed fields end at `fixed_end`
    pub fn hybrid(
        name: impl Into<String>,
        fixed_end: usize,
        element_size: usize,
        reference_elements: bool,
    ) -> Self {
        Self::new(
            name,
            LayoutEncoding::hybrid(fixed_end, element_size, reference_elements),
        )
    }

    /// Declare a reference field at `offset`
    pub fn with_reference_at(mut self, offset: u32) -> Self {
        self.reference_offsets.push(offset);
        self
    }

    /// Registered but never allocated by observed code
    pub fn not_instantiated(mut self) -> Self {
        self.instantiated = false;
        self
    }

    /// Type without clone support
    pub fn not_cloneable(mut self) -> Self {
        self.cloneable = false;
        self
    }

    /// Always allocate in an unaligned chunk
    pub fn unaligned_allocation(mut self) -> Self {
        self.unaligned_allocation = true;
        self
    }
}

/// Registry of all type descriptors.
///
/// Descriptors are immutable once registered; the registry only grows.
#[derive(Default)]
pub struct TypeRegistry {
    types: RwLock<Vec<Arc<TypeDescriptor>>>,
    by_name: RwLock<FxHashMap<String, TypeId>>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type and return its descriptor
    pub fn register(&self, spec: TypeSpec) -> Arc<TypeDescriptor> {
        let mut reference_offsets = spec.reference_offsets;
        reference_offsets.sort_unstable();
        reference_offsets.dedup();
        debug_assert!(reference_offsets.iter().all(|&offset| {
            let offset = offset as usize;
            let limit = if spec.layout.is_array_like() {
                spec.layout.array_base_offset()
            } else {
                spec.layout.instance_size()
            };
            offset >= HEADER_SIZE
                && offset % REFERENCE_SIZE == 0
                && offset + REFERENCE_SIZE <= limit
        }));

        let mut types = self.types.write();
        let id = TypeId::from_u32(types.len() as u32 + 1);
        let descriptor = Arc::new(TypeDescriptor {
            id,
            name: spec.name,
            layout: spec.layout,
            instantiated: spec.instantiated,
            cloneable: spec.cloneable,
            unaligned_allocation: spec.unaligned_allocation,
            reference_offsets: reference_offsets.into_boxed_slice(),
            component: spec.component,
            array_type: OnceLock::new(),
        });

        let component = spec
            .component
            .and_then(|component| types.get((component.as_u32() as usize).checked_sub(1)?));
        if let Some(component) = component {
            // First array registered for a component wins
            let _ = component.array_type.set(id);
        }

        types.push(descriptor.clone());
        self.by_name.write().insert(descriptor.name.clone(), id);
        descriptor
    }

    /// Descriptor for `id`
    #[inline]
    pub fn get(&self, id: TypeId) -> Option<Arc<TypeDescriptor>> {
        let index = (id.as_u32() as usize).checked_sub(1)?;
        self.types.read().get(index).cloned()
    }

    /// Look a type up by name
    pub fn lookup(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        let id = *self.by_name.read().get(name)?;
        self.get(id)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    /// True if nothing has been registered
    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = TypeRegistry::new();
        assert!(registry.is_empty());

        let point = registry.register(TypeSpec::instance("Point", 24));
        assert_eq!(point.id(), TypeId::from_u32(1));
        assert_eq!(point.layout().instance_size(), 24);
        assert!(point.is_instantiated());
        assert!(point.is_cloneable());
        assert!(!point.has_references());

        let found = registry.lookup("Point").unwrap();
        assert_eq!(found.id(), point.id());
        assert!(registry.get(TypeId::from_u32(0)).is_none());
        assert!(registry.get(TypeId::from_u32(9)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reference_offsets() {
        let registry = TypeRegistry::new();
        let node = registry.register(
            TypeSpec::instance("Node", 32)
                .with_reference_at(16)
                .with_reference_at(8)
                .with_reference_at(16),
        );
        assert_eq!(node.reference_offsets(), &[8, 16]);
        assert!(node.has_references());
    }

    #[test]
    fn test_array_back_reference() {
        let registry = TypeRegistry::new();
        let ints = registry.register(TypeSpec::primitive_array("int[]", 4));
        assert!(ints.array_type().is_none());

        let int_matrix = registry.register(TypeSpec::reference_array("int[][]", Some(ints.id())));
        assert_eq!(ints.array_type(), Some(int_matrix.id()));
        assert_eq!(int_matrix.component_type(), Some(ints.id()));
        assert!(int_matrix.has_references());

        // A second array type for the same component does not replace the first
        let _other = registry.register(TypeSpec::reference_array("int[][]'", Some(ints.id())));
        assert_eq!(ints.array_type(), Some(int_matrix.id()));
    }

    #[test]
    fn test_flags() {
        let registry = TypeRegistry::new();
        let ghost = registry.register(TypeSpec::instance("Ghost", 16).not_instantiated());
        let lock = registry.register(TypeSpec::instance("Lock", 16).not_cloneable());
        let code = registry.register(TypeSpec::primitive_array("Code", 1).unaligned_allocation());
        assert!(!ghost.is_instantiated());
        assert!(!lock.is_cloneable());
        assert!(code.requires_unaligned_allocation());
    }
}
