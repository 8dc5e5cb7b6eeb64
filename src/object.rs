// Heap object variants (spec.md §3, §4.C).
//
// Objects never move once allocated: `Heap` is a slab (`Vec<Option<Obj>>`)
// and an `ObjRef` is a stable index into it, not a pointer. This is the
// "indices or stable handles" design spec.md §9 calls for so the graph can
// be cyclic (closures <-> upvalues <-> instances) without reference
// counting.

use crate::chunk::Chunk;
use crate::error::RuntimeError;
use crate::table::Table;
use crate::value::Value;

/// A stable handle to a heap-allocated object. Equality is index equality,
/// which is exactly the pointer-identity equality spec.md requires for
/// interned strings and for general object equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjRef(pub u32);

pub type NativeFn = fn(&[Value]) -> Result<Value, RuntimeError>;

pub struct ObjString {
    pub bytes: Box<[u8]>,
    pub hash: u32,
}

impl ObjString {
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// None for the implicit top-level script function.
    pub name: Option<ObjRef>,
}

pub struct ObjNative {
    pub name: &'static str,
    pub function: NativeFn,
}

pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// Open while the captured local is still on the VM stack; closed once the
/// enclosing scope (or the whole stack, on frame pop) has collapsed past
/// it. All closures sharing the slot hold the same `ObjRef`, so flipping
/// this in place is visible to every holder (spec.md §3, §9).
pub enum ObjUpvalue {
    Open(usize),
    Closed(Value),
}

pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
}

pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native function",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
        }
    }
}
