//! Snapshots of runtime values fetched from the engine.

/// Kind tag of a runtime value. The set is closed by protocol contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Erased or invalid type (e.g. the target of a dangling pointer).
    Invalid,
    Scalar,
    Float32,
    Float64,
    String,
    Array,
    Slice,
    Map,
    Struct,
    /// Typed pointer, the pointee is the single child.
    Pointer,
    /// Raw pointer without pointee type information.
    RawPointer,
    Interface,
    Channel,
    Complex64,
    Complex128,
}

/// Immutable, already-materialized subtree of a runtime value, fetched from
/// the engine at request time. The converter never re-queries the engine.
///
/// Children of a map alternate key/value pairs; children of every other kind
/// are positional elements or named fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSnapshot {
    pub name: String,
    pub kind: ValueKind,
    pub type_name: String,
    /// Pre-rendered value; empty when the kind has no scalar rendering.
    /// For strings this holds the loaded prefix of the data.
    pub value: String,
    pub addr: u64,
    /// Base address of the underlying storage (slices and maps).
    pub base: u64,
    pub len: i64,
    pub cap: i64,
    /// Read failure cause, set when the engine could not load the value.
    pub unreadable: Option<String>,
    /// Real and imaginary parts, present for complex kinds only.
    pub complex: Option<(f64, f64)>,
    pub children: Vec<ValueSnapshot>,
}

impl Default for ValueSnapshot {
    fn default() -> Self {
        ValueSnapshot {
            name: String::new(),
            kind: ValueKind::Scalar,
            type_name: String::new(),
            value: String::new(),
            addr: 0,
            base: 0,
            len: 0,
            cap: 0,
            unreadable: None,
            complex: None,
            children: vec![],
        }
    }
}

impl ValueSnapshot {
    /// Synthetic struct-like grouping, used as the root of a variable scope.
    pub fn container(name: impl Into<String>, children: Vec<ValueSnapshot>) -> Self {
        ValueSnapshot {
            name: name.into(),
            kind: ValueKind::Struct,
            children,
            ..Default::default()
        }
    }
}
