use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};

use crate::{
    hash_str, DisplayValue, Obj, ObjClass, ObjClosure, ObjFun, ObjInstance, ObjRef, ObjString,
    ObjUpvalue, Value,
};

/// How much the heap must grow past the surviving set before the next
/// collection triggers.
const GC_HEAP_GROW_FACTOR: usize = 2;

/// Allocation threshold for the first collection.
const GC_FIRST_THRESHOLD: usize = 1024 * 1024;

/// A 32-bit FNV-1a hasher for the runtime's tables. Interned-string handles
/// make cheap keys, and FNV beats SipHash for such tiny inputs.
#[derive(Debug)]
pub struct FnvHasher(u32);

impl Default for FnvHasher {
    fn default() -> Self {
        Self(2166136261)
    }
}

impl Hasher for FnvHasher {
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 ^= u32::from(byte);
            self.0 = self.0.wrapping_mul(16777619);
        }
    }

    fn finish(&self) -> u64 {
        u64::from(self.0)
    }
}

/// A table keyed by interned-string handles: globals, class methods, and
/// instance fields all share this shape.
pub type Table = HashMap<ObjRef, Value, BuildHasherDefault<FnvHasher>>;

/// A provider of GC roots.
///
/// The collector has no global view of the program; whoever asks the heap to
/// allocate must hand it everything reachable. The VM's implementation walks
/// the value stack, call frames, open upvalues, and globals; the compiler's
/// walks its stack of in-progress functions and chains to the VM's.
pub trait Trace {
    /// Mark every root this provider knows about.
    fn trace(&self, heap: &mut Heap);
}

#[derive(Debug)]
struct Slot {
    marked: bool,
    obj: Option<Obj>,
}

/// The object heap: an arena of cells owned by the garbage collector.
///
/// Cells never move and freed cells are recycled through a free list, so an
/// [`ObjRef`] stays valid for the lifetime of the object it names. The heap
/// also owns the string intern table, which the collector treats as a weak
/// set: entries whose strings die are dropped during collection.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    strings: HashMap<u32, Vec<ObjRef>>,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            strings: HashMap::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: GC_FIRST_THRESHOLD,
        }
    }

    /// Allocate an object, collecting first when the heap has grown past its
    /// threshold. Everything the new object references must be reachable
    /// from `roots`.
    pub fn alloc(&mut self, obj: Obj, roots: &dyn Trace) -> ObjRef {
        self.collect_if_needed(roots);
        self.insert(obj)
    }

    /// Run a collection when the allocation threshold has been crossed
    /// (always, under the `stress-gc` feature).
    pub fn collect_if_needed(&mut self, roots: &dyn Trace) {
        #[cfg(feature = "stress-gc")]
        self.collect(roots);
        if self.bytes_allocated > self.next_gc {
            self.collect(roots);
        }
    }

    /// Insert an object without giving the collector a chance to run.
    ///
    /// Callers must have already called [`Heap::collect_if_needed`] at a
    /// point where the object's children were still rooted.
    pub fn insert(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += obj.footprint();
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize].obj = Some(obj);
                ObjRef(idx)
            }
            None => {
                self.slots.push(Slot {
                    marked: false,
                    obj: Some(obj),
                });
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Intern a string: return the existing handle for equal content, or
    /// allocate a new string object and register it.
    pub fn intern(&mut self, s: &str, roots: &dyn Trace) -> ObjRef {
        let hash = hash_str(s);
        if let Some(bucket) = self.strings.get(&hash) {
            for &r in bucket {
                if &*self.string(r).chars == s {
                    return r;
                }
            }
        }
        self.collect_if_needed(roots);
        let r = self.insert(Obj::String(ObjString {
            chars: s.into(),
            hash,
        }));
        self.strings.entry(hash).or_default().push(r);
        r
    }

    /// Number of live objects. A diagnostic for tests and tooling.
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| slot.obj.is_some()).count()
    }

    /// Bytes currently attributed to live objects.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Render a value for printing.
    pub fn display(&self, value: Value) -> DisplayValue<'_> {
        DisplayValue::new(self, value)
    }

    /// Mark a value's object, if it holds one.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    /// Mark an object gray: flag it and queue it for blackening.
    pub fn mark_object(&mut self, r: ObjRef) {
        let slot = &mut self.slots[r.0 as usize];
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(r);
    }

    /// Run a full mark-sweep collection over the given roots.
    pub fn collect(&mut self, roots: &dyn Trace) {
        #[cfg(feature = "log-gc")]
        let before = self.bytes_allocated;
        #[cfg(feature = "log-gc")]
        eprintln!("-- gc begin");

        roots.trace(self);
        self.trace_references();
        self.remove_white_strings();
        self.sweep();
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;

        #[cfg(feature = "log-gc")]
        eprintln!(
            "-- gc end: collected {} bytes (from {} to {}) next at {}",
            before - self.bytes_allocated,
            before,
            self.bytes_allocated,
            self.next_gc,
        );
    }

    /// Blacken gray objects until the worklist drains.
    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    /// Mark everything one object references.
    fn blacken(&mut self, r: ObjRef) {
        // Gather the outgoing edges first; marking mutates other slots.
        let mut edges = Vec::new();
        let push_value = |edges: &mut Vec<ObjRef>, value: Value| {
            if let Value::Obj(r) = value {
                edges.push(r);
            }
        };
        match self.get(r) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Upvalue(upvalue) => {
                if let ObjUpvalue::Closed(value) = upvalue {
                    push_value(&mut edges, *value);
                }
            }
            Obj::Fun(fun) => {
                edges.extend(fun.name);
                for &constant in fun.chunk.constants() {
                    push_value(&mut edges, constant);
                }
            }
            Obj::Closure(closure) => {
                edges.push(closure.fun);
                edges.extend(&closure.upvalues);
            }
            Obj::Class(class) => {
                edges.push(class.name);
                for (&name, &method) in &class.methods {
                    edges.push(name);
                    push_value(&mut edges, method);
                }
            }
            Obj::Instance(instance) => {
                edges.push(instance.class);
                for (&name, &value) in &instance.fields {
                    edges.push(name);
                    push_value(&mut edges, value);
                }
            }
            Obj::BoundMethod(bound) => {
                push_value(&mut edges, bound.receiver);
                edges.push(bound.method);
            }
        }
        for edge in edges {
            self.mark_object(edge);
        }
    }

    /// Drop intern-table entries whose strings did not survive marking. The
    /// intern table is the runtime's only weak reference set.
    fn remove_white_strings(&mut self) {
        let Self { slots, strings, .. } = self;
        for (idx, slot) in slots.iter().enumerate() {
            if slot.marked {
                continue;
            }
            if let Some(Obj::String(s)) = &slot.obj {
                if let Some(bucket) = strings.get_mut(&s.hash) {
                    bucket.retain(|r| r.0 as usize != idx);
                    if bucket.is_empty() {
                        strings.remove(&s.hash);
                    }
                }
            }
        }
    }

    /// Free unmarked cells and clear the mark on survivors.
    fn sweep(&mut self) {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.marked {
                slot.marked = false;
            } else if let Some(obj) = slot.obj.take() {
                self.bytes_allocated -= obj.footprint();
                self.free.push(idx as u32);
            }
        }
    }
}

impl Heap {
    /// Borrow the object behind a handle.
    pub fn get(&self, r: ObjRef) -> &Obj {
        self.slots[r.0 as usize]
            .obj
            .as_ref()
            .expect("handle names a live object")
    }

    /// Mutably borrow the object behind a handle.
    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slots[r.0 as usize]
            .obj
            .as_mut()
            .expect("handle names a live object")
    }

    /// Borrow a handle's string object.
    pub fn string(&self, r: ObjRef) -> &ObjString {
        match self.get(r) {
            Obj::String(s) => s,
            _ => panic!("Invalid cast"),
        }
    }

    /// Borrow a handle's string content.
    pub fn str(&self, r: ObjRef) -> &str {
        &self.string(r).chars
    }

    /// Borrow a handle's function object.
    pub fn fun(&self, r: ObjRef) -> &ObjFun {
        match self.get(r) {
            Obj::Fun(f) => f,
            _ => panic!("Invalid cast"),
        }
    }

    /// Borrow a handle's closure object.
    pub fn closure(&self, r: ObjRef) -> &ObjClosure {
        match self.get(r) {
            Obj::Closure(c) => c,
            _ => panic!("Invalid cast"),
        }
    }

    /// Mutably borrow a handle's closure object.
    pub fn closure_mut(&mut self, r: ObjRef) -> &mut ObjClosure {
        match self.get_mut(r) {
            Obj::Closure(c) => c,
            _ => panic!("Invalid cast"),
        }
    }

    /// Borrow a handle's upvalue object.
    pub fn upvalue(&self, r: ObjRef) -> &ObjUpvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            _ => panic!("Invalid cast"),
        }
    }

    /// Mutably borrow a handle's upvalue object.
    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut ObjUpvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => panic!("Invalid cast"),
        }
    }

    /// Borrow a handle's class object.
    pub fn class(&self, r: ObjRef) -> &ObjClass {
        match self.get(r) {
            Obj::Class(c) => c,
            _ => panic!("Invalid cast"),
        }
    }

    /// Mutably borrow a handle's class object.
    pub fn class_mut(&mut self, r: ObjRef) -> &mut ObjClass {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            _ => panic!("Invalid cast"),
        }
    }

    /// Borrow a handle's instance object.
    pub fn instance(&self, r: ObjRef) -> &ObjInstance {
        match self.get(r) {
            Obj::Instance(i) => i,
            _ => panic!("Invalid cast"),
        }
    }

    /// Mutably borrow a handle's instance object.
    pub fn instance_mut(&mut self, r: ObjRef) -> &mut ObjInstance {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            _ => panic!("Invalid cast"),
        }
    }
}
