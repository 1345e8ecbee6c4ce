//! Managed value representation
//!
//! The subset of the runtime's object model the native-call bridge needs:
//! - Immediates (`Nothing`, `Bool`, `Int`, `Pointer`): compared by bits
//! - Symbols: interned names, compared by content
//! - Heap values (`String`, `Type`, `UnionAll`, `Object`): reference-counted,
//!   compared by address
//!
//! Identity ([`ValueId`]) is what trampoline caches key on.

use std::fmt;
use std::sync::{Arc, OnceLock};

/// Identity of a value, the equivalent of `===`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueId {
    Nothing,
    Bool(bool),
    Int(i64),
    Pointer(usize),
    Symbol(Arc<str>),
    Heap(usize),
}

/// Runtime value
#[derive(Clone)]
pub enum Value {
    Nothing,
    Bool(bool),
    Int(i64),
    /// Raw native address
    Pointer(usize),
    Symbol(Arc<str>),
    String(Arc<str>),
    Type(Arc<DataType>),
    UnionAll(Arc<UnionAll>),
    Object(Arc<Object>),
}

impl Value {
    pub fn symbol(name: &str) -> Value {
        Value::Symbol(Arc::from(name))
    }

    pub fn string(s: &str) -> Value {
        Value::String(Arc::from(s))
    }

    /// Identity used for cache keys
    pub fn id(&self) -> ValueId {
        match self {
            Value::Nothing => ValueId::Nothing,
            Value::Bool(b) => ValueId::Bool(*b),
            Value::Int(n) => ValueId::Int(*n),
            Value::Pointer(p) => ValueId::Pointer(*p),
            Value::Symbol(s) => ValueId::Symbol(s.clone()),
            Value::String(s) => ValueId::Heap(Arc::as_ptr(s) as *const u8 as usize),
            Value::Type(t) => ValueId::Heap(Arc::as_ptr(t) as usize),
            Value::UnionAll(u) => ValueId::Heap(Arc::as_ptr(u) as usize),
            Value::Object(o) => ValueId::Heap(Arc::as_ptr(o) as usize),
        }
    }

    /// Identity comparison
    pub fn is(&self, other: &Value) -> bool {
        self.id() == other.id()
    }

    /// Get the kind name of this value (for error messages)
    pub fn type_name(&self) -> &str {
        match self {
            Value::Nothing => "Nothing",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Pointer(_) => "Ptr",
            Value::Symbol(_) => "Symbol",
            Value::String(_) => "String",
            Value::Type(_) => "DataType",
            Value::UnionAll(_) => "UnionAll",
            Value::Object(o) => o.ty().name(),
        }
    }

    /// True for a concrete, immutable data type or the top type. Only such
    /// values are retained as specialized trampoline parameters.
    pub fn is_retainable_parameter(&self) -> bool {
        match self {
            Value::Type(t) => t.is_top() || (t.is_concrete() && !t.is_mutable()),
            _ => false,
        }
    }

    /// True when this value lives for the process lifetime anyway: a
    /// concrete type, a parametric type's name wrapper, or the singleton
    /// instance of its type.
    pub fn is_type_level_singleton(&self) -> bool {
        match self {
            Value::Type(t) => t.is_concrete(),
            Value::UnionAll(u) => u.is_name_wrapper(),
            Value::Object(o) => o.is_singleton_instance(),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nothing => write!(f, "nothing"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Pointer(p) => write!(f, "Ptr(0x{:x})", p),
            Value::Symbol(s) => write!(f, ":{}", s),
            Value::String(s) => write!(f, "{:?}", s.as_ref()),
            Value::Type(t) => write!(f, "{}", t.name()),
            Value::UnionAll(u) => write!(f, "{}{{{}}} where {}", u.body().name(), u.var(), u.var()),
            Value::Object(o) => write!(f, "{}(..)", o.ty().name()),
        }
    }
}

/// Kind of a data type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Abstract,
    Concrete,
}

/// A data type descriptor
pub struct DataType {
    name: Arc<str>,
    parameters: Vec<Value>,
    kind: TypeKind,
    mutable: bool,
    top: bool,
    field_count: usize,
    // Canonical instance of a field-less immutable type. Holds a strong
    // reference back to the type, so such types are never freed.
    instance: OnceLock<Arc<Object>>,
}

impl DataType {
    fn new(name: &str, kind: TypeKind) -> Self {
        Self {
            name: Arc::from(name),
            parameters: Vec::new(),
            kind,
            mutable: false,
            top: false,
            field_count: 0,
            instance: OnceLock::new(),
        }
    }

    /// Immutable concrete type with no fields
    pub fn concrete(name: &str) -> Self {
        Self::new(name, TypeKind::Concrete)
    }

    pub fn abstract_type(name: &str) -> Self {
        Self::new(name, TypeKind::Abstract)
    }

    /// The universal supertype
    pub fn any() -> Self {
        let mut t = Self::new("Any", TypeKind::Abstract);
        t.top = true;
        t
    }

    pub fn mutable(mut self) -> Self {
        self.mutable = true;
        self
    }

    pub fn with_fields(mut self, count: usize) -> Self {
        self.field_count = count;
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn into_arc(self) -> Arc<DataType> {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn is_concrete(&self) -> bool {
        self.kind == TypeKind::Concrete
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn is_top(&self) -> bool {
        self.top
    }

    pub fn field_count(&self) -> usize {
        self.field_count
    }

    /// Whether every instance of this type is the same object
    pub fn has_singleton_instance(&self) -> bool {
        self.is_concrete() && !self.mutable && self.field_count == 0
    }

    /// The canonical instance of a singleton type
    pub fn instance(self: &Arc<Self>) -> Option<Arc<Object>> {
        if !self.has_singleton_instance() {
            return None;
        }
        let instance = self.instance.get_or_init(|| {
            Arc::new(Object {
                ty: Arc::clone(self),
                fields: Vec::new(),
            })
        });
        Some(Arc::clone(instance))
    }
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataType")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("mutable", &self.mutable)
            .finish()
    }
}

/// A parametric type `Body{var} where var`
#[derive(Debug)]
pub struct UnionAll {
    var: Arc<str>,
    body: Arc<DataType>,
    name_wrapper: bool,
}

impl UnionAll {
    pub fn new(var: &str, body: Arc<DataType>) -> Self {
        Self {
            var: Arc::from(var),
            body,
            name_wrapper: false,
        }
    }

    /// The UnionAll a type name refers to, e.g. `Vector` itself
    pub fn name_wrapper(var: &str, body: Arc<DataType>) -> Self {
        Self {
            name_wrapper: true,
            ..Self::new(var, body)
        }
    }

    pub fn var(&self) -> &str {
        &self.var
    }

    pub fn body(&self) -> &Arc<DataType> {
        &self.body
    }

    pub fn is_name_wrapper(&self) -> bool {
        self.name_wrapper
    }
}

/// An instance of a data type
#[derive(Debug)]
pub struct Object {
    ty: Arc<DataType>,
    fields: Vec<Value>,
}

impl Object {
    /// Construct an instance; singleton types always yield their canonical instance
    pub fn new(ty: &Arc<DataType>, fields: Vec<Value>) -> Value {
        if fields.is_empty() {
            if let Some(instance) = ty.instance() {
                return Value::Object(instance);
            }
        }
        Value::Object(Arc::new(Object {
            ty: Arc::clone(ty),
            fields,
        }))
    }

    pub fn ty(&self) -> &Arc<DataType> {
        &self.ty
    }

    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn is_singleton_instance(&self) -> bool {
        self.ty
            .instance
            .get()
            .is_some_and(|canonical| std::ptr::eq(Arc::as_ptr(canonical), self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_identity_is_by_address() {
        let a = Value::string("libm");
        let b = Value::string("libm");
        assert!(a.is(&a.clone()));
        assert!(!a.is(&b));
    }

    #[test]
    fn test_symbol_identity_is_by_name() {
        assert!(Value::symbol("libc").is(&Value::symbol("libc")));
        assert!(!Value::symbol("libc").is(&Value::symbol("libm")));
    }

    #[test]
    fn test_singleton_instance_is_canonical() {
        let ty = DataType::concrete("typeof(sin)").into_arc();
        let a = Object::new(&ty, vec![]);
        let b = Object::new(&ty, vec![]);
        assert!(a.is(&b));
        assert!(a.is_type_level_singleton());
    }

    #[test]
    fn test_mutable_instances_are_distinct() {
        let ty = DataType::concrete("Closure").mutable().with_fields(1).into_arc();
        let a = Object::new(&ty, vec![Value::Int(1)]);
        let b = Object::new(&ty, vec![Value::Int(1)]);
        assert!(!a.is(&b));
        assert!(!a.is_type_level_singleton());
        assert_eq!(a.type_name(), "Closure");
    }

    #[test]
    fn test_retainable_parameters() {
        assert!(Value::Type(DataType::concrete("Float64").into_arc()).is_retainable_parameter());
        assert!(Value::Type(DataType::any().into_arc()).is_retainable_parameter());
        assert!(!Value::Type(DataType::concrete("Ref").mutable().into_arc()).is_retainable_parameter());
        assert!(!Value::Type(DataType::abstract_type("Real").into_arc()).is_retainable_parameter());
        assert!(!Value::Int(3).is_retainable_parameter());
    }

    #[test]
    fn test_type_level_singletons() {
        let vector = DataType::concrete("Vector").into_arc();
        assert!(Value::UnionAll(Arc::new(UnionAll::name_wrapper("T", vector.clone()))).is_type_level_singleton());
        assert!(!Value::UnionAll(Arc::new(UnionAll::new("T", vector))).is_type_level_singleton());
        assert!(!Value::Type(DataType::abstract_type("Number").into_arc()).is_type_level_singleton());
        assert!(!Value::Int(1).is_type_level_singleton());
    }
}
