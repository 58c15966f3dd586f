use std::mem;

use crate::{Chunk, Table, Value};

/// A handle to an object cell in the heap.
///
/// Handles are plain indices: the heap never moves cells, so a handle stays
/// valid for as long as the object it names is reachable. Two handles are
/// equal exactly when they name the same object, which gives reference
/// equality for free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

/// The payload of a heap object.
#[derive(Debug)]
pub enum Obj {
    /// An immutable interned string.
    String(ObjString),
    /// A compiled function.
    Fun(ObjFun),
    /// A host-implemented callable.
    Native(ObjNative),
    /// A function bound to its captured upvalues.
    Closure(ObjClosure),
    /// A captured variable shared between a declaring function and its
    /// inner closures.
    Upvalue(ObjUpvalue),
    /// A class with a method table.
    Class(ObjClass),
    /// An instance of a class with its own field table.
    Instance(ObjInstance),
    /// A method pulled off an instance, remembering its receiver.
    BoundMethod(ObjBoundMethod),
}

impl Obj {
    /// Approximate footprint of this object in bytes, counting its owned
    /// heap payloads. Used by the collector to decide when to run.
    pub fn footprint(&self) -> usize {
        let owned = match self {
            Obj::String(s) => s.chars.len(),
            Obj::Fun(f) => {
                f.chunk.len() * (1 + mem::size_of::<crate::Position>())
                    + f.chunk.constants().len() * mem::size_of::<Value>()
            }
            Obj::Native(_) => 0,
            Obj::Closure(c) => c.upvalues.len() * mem::size_of::<ObjRef>(),
            Obj::Upvalue(_) => 0,
            Obj::Class(c) => c.methods.len() * mem::size_of::<(ObjRef, Value)>(),
            Obj::Instance(i) => i.fields.len() * mem::size_of::<(ObjRef, Value)>(),
            Obj::BoundMethod(_) => 0,
        };
        mem::size_of::<Obj>() + owned
    }
}

/// An immutable UTF-8 string with its precomputed FNV-1a hash. Strings are
/// interned: two equal strings are the same heap object.
#[derive(Debug)]
pub struct ObjString {
    /// The string's content.
    pub chars: Box<str>,
    /// FNV-1a hash of the content, computed before interning. The intern
    /// table is bucketed by this hash.
    pub hash: u32,
}

/// Hash a string with 32-bit FNV-1a.
pub fn hash_str(s: &str) -> u32 {
    let mut hash = 2166136261u32;
    for byte in s.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// A function object holding the function's bytecode along with the
/// metadata needed to call it.
#[derive(Debug)]
pub struct ObjFun {
    /// The function's name, or `None` for the top-level script.
    pub name: Option<ObjRef>,
    /// Number of parameters the function takes.
    pub arity: u8,
    /// Number of upvalues closures over this function capture.
    pub upvalue_count: usize,
    /// The function's compiled body.
    pub chunk: Chunk,
}

impl ObjFun {
    /// Create an empty function with the given name.
    pub fn new(name: Option<ObjRef>) -> Self {
        Self {
            name,
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::default(),
        }
    }
}

/// A function implemented by the host.
#[derive(Clone)]
pub struct ObjNative {
    /// The native's name.
    pub name: ObjRef,
    /// Number of parameters the native takes.
    pub arity: u8,
    /// The host function invoked with the call's arguments.
    pub call: fn(&[Value]) -> Value,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<native fn>")
    }
}

/// A function together with the upvalues it captured from its surrounding
/// environment.
#[derive(Debug)]
pub struct ObjClosure {
    /// The function this closure executes.
    pub fun: ObjRef,
    /// Captured variables, one per upvalue the compiler resolved.
    pub upvalues: Vec<ObjRef>,
}

/// A closed-over variable.
///
/// While the variable's stack slot is live the upvalue is "open" and names
/// that slot; when the slot dies the value moves into the upvalue itself.
#[derive(Debug, Clone, Copy)]
pub enum ObjUpvalue {
    /// Points at a live value-stack slot.
    Open(usize),
    /// Holds the captured value after the stack slot died.
    Closed(Value),
}

/// A class: a name and a table of methods.
#[derive(Debug)]
pub struct ObjClass {
    /// The class's name.
    pub name: ObjRef,
    /// Methods, keyed by interned name.
    pub methods: Table,
}

impl ObjClass {
    /// Create a class with no methods.
    pub fn new(name: ObjRef) -> Self {
        Self {
            name,
            methods: Table::default(),
        }
    }
}

/// An instance of a class.
#[derive(Debug)]
pub struct ObjInstance {
    /// The instance's class.
    pub class: ObjRef,
    /// Fields, keyed by interned name.
    pub fields: Table,
}

impl ObjInstance {
    /// Create an instance with no fields.
    pub fn new(class: ObjRef) -> Self {
        Self {
            class,
            fields: Table::default(),
        }
    }
}

/// A method bound to the instance it was accessed through.
#[derive(Debug)]
pub struct ObjBoundMethod {
    /// The value `this` resolves to inside the method.
    pub receiver: Value,
    /// The method's closure.
    pub method: ObjRef,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        // Vectors from the FNV reference implementation.
        assert_eq!(hash_str(""), 0x811c9dc5);
        assert_eq!(hash_str("a"), 0xe40c292c);
        assert_eq!(hash_str("foobar"), 0xbf9cf968);
    }
}
