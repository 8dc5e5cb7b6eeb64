// Tracing mark-sweep garbage collector over the object graph (spec.md
// §4.F, §9). Objects never move: `Heap` is a slab (`Vec<Option<Obj>>`) and
// an `ObjRef` is a stable index, so references between objects are plain
// indices rather than pointers, and the graph can be cyclic (closures
// capturing instances capturing closures) without reference counting.
//
// `Heap` only implements the allocator and the mark/trace/sweep
// mechanics. It does not know about the VM's stack, call frames, globals,
// or the compiler's in-progress function chain (those are the root set,
// (spec.md §3's GC invariant), and only `Vm`/`Compiler` know how to walk
// them. Each marks its own roots into the heap (`Heap::mark_value`/
// `mark_object`) before calling `Heap::trace_references` + `Heap::sweep`.

use crate::object::{Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjNative, ObjRef, ObjString, ObjUpvalue};
use crate::table::Table;
use crate::value::Value;

const GC_GROW_FACTOR: usize = 2;
const DEFAULT_NEXT_GC: usize = 1024 * 1024;

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

pub struct Heap {
    objects: Vec<Option<Obj>>,
    marks: Vec<bool>,
    free_list: Vec<u32>,
    gray_stack: Vec<ObjRef>,
    /// The intern table. Keys are string handles; values are unused
    /// (`Value::Nil`), this is a set, not a map. Treated as a *weak* root
    /// (spec.md §9 Open Question): it is never walked during mark, so an
    /// interned string with no other live reference is swept like any
    /// other object, and its entry is removed here at the same time.
    pub strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    pub stress_gc: bool,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objects: Vec::new(),
            marks: Vec::new(),
            free_list: Vec::new(),
            gray_stack: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: DEFAULT_NEXT_GC,
            stress_gc: false,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    fn size_of(obj: &Obj) -> usize {
        match obj {
            Obj::String(s) => std::mem::size_of::<ObjString>() + s.bytes.len(),
            Obj::Function(f) => std::mem::size_of::<ObjFunction>() + f.chunk.code.len() + f.chunk.constants.len() * std::mem::size_of::<Value>(),
            Obj::Native(_) => std::mem::size_of::<ObjNative>(),
            Obj::Closure(c) => std::mem::size_of::<ObjClosure>() + c.upvalues.len() * std::mem::size_of::<ObjRef>(),
            Obj::Upvalue(_) => std::mem::size_of::<ObjUpvalue>(),
            Obj::Class(_) => std::mem::size_of::<ObjClass>(),
            Obj::Instance(_) => std::mem::size_of::<ObjInstance>(),
            Obj::BoundMethod(_) => std::mem::size_of::<ObjBoundMethod>(),
        }
    }

    /// The single allocation chokepoint (spec.md §4.F: "every allocation
    /// routes through a single allocator"). Collection, when warranted, is
    /// the caller's job (`Vm`/`Compiler` call `should_collect` then their
    /// own `collect_garbage` before the *next* allocation); `Heap` alone
    /// can't run a collection because it doesn't know the root set.
    fn raw_alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += Self::size_of(&obj);
        if let Some(slot) = self.free_list.pop() {
            self.objects[slot as usize] = Some(obj);
            self.marks[slot as usize] = false;
            ObjRef(slot)
        } else {
            self.objects.push(Some(obj));
            self.marks.push(false);
            ObjRef((self.objects.len() - 1) as u32)
        }
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        self.objects[r.0 as usize].as_ref().expect("dangling ObjRef")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.objects[r.0 as usize].as_mut().expect("dangling ObjRef")
    }

    pub fn as_string(&self, r: ObjRef) -> &ObjString {
        match self.get(r) {
            Obj::String(s) => s,
            other => panic!("expected string, found {}", other.type_name()),
        }
    }

    /// Walk every live handle in allocation order. This is the enumeration
    /// seam spec.md §6 asks for (a serializer or native-codegen collaborator
    /// walking the full object set) without handing out the backing `Vec`
    /// itself, freed slots are skipped rather than yielded as `None`.
    pub fn objects(&self) -> impl Iterator<Item = (ObjRef, &Obj)> {
        self.objects.iter().enumerate().filter_map(|(i, slot)| slot.as_ref().map(|obj| (ObjRef(i as u32), obj)))
    }

    /// Intern `bytes`, returning the unique handle for this content. Two
    /// calls with identical bytes return the same `ObjRef` (spec.md §8's
    /// "String identity" invariant).
    pub fn intern(&mut self, bytes: &[u8]) -> ObjRef {
        let hash = fnv1a(bytes);
        if let Some(existing) = self.strings.find_string(hash, |candidate| {
            match &self.objects[candidate.0 as usize] {
                Some(Obj::String(s)) => &*s.bytes == bytes,
                _ => false,
            }
        }) {
            return existing;
        }
        let handle = self.raw_alloc(Obj::String(ObjString { bytes: bytes.to_vec().into_boxed_slice(), hash }));
        self.strings.set(handle, hash, Value::Nil);
        handle
    }

    pub fn string_hash(&self, r: ObjRef) -> u32 {
        self.as_string(r).hash
    }

    pub fn alloc_function(&mut self, function: ObjFunction) -> ObjRef {
        self.raw_alloc(Obj::Function(function))
    }

    pub fn alloc_native(&mut self, native: ObjNative) -> ObjRef {
        self.raw_alloc(Obj::Native(native))
    }

    /// Allocates with an *empty* upvalues vector, the caller must push
    /// the returned handle onto a root (typically the VM stack) before
    /// populating upvalues one at a time via `get_mut`, so each freshly
    /// captured upvalue is reachable through the closure the moment it's
    /// attached, rather than sitting unrooted in a local variable across
    /// an allocation that might trigger collection (spec.md §4.F/§9).
    pub fn alloc_closure(&mut self, function: ObjRef, upvalue_count: usize) -> ObjRef {
        self.raw_alloc(Obj::Closure(ObjClosure { function, upvalues: Vec::with_capacity(upvalue_count) }))
    }

    pub fn alloc_open_upvalue(&mut self, stack_slot: usize) -> ObjRef {
        self.raw_alloc(Obj::Upvalue(ObjUpvalue::Open(stack_slot)))
    }

    pub fn alloc_class(&mut self, name: ObjRef) -> ObjRef {
        self.raw_alloc(Obj::Class(ObjClass { name, methods: Table::new() }))
    }

    pub fn alloc_instance(&mut self, class: ObjRef) -> ObjRef {
        self.raw_alloc(Obj::Instance(ObjInstance { class, fields: Table::new() }))
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        self.raw_alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }))
    }

    // ---- mark/trace/sweep -------------------------------------------------

    pub fn mark_value(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let idx = r.0 as usize;
        if self.marks[idx] {
            return;
        }
        self.marks[idx] = true;
        self.gray_stack.push(r);
    }

    pub fn mark_table(&mut self, table: &Table) {
        let entries: Vec<(ObjRef, Value)> = table.iter().collect();
        for (k, v) in entries {
            self.mark_object(k);
            self.mark_value(v);
        }
    }

    /// Pop gray objects and mark what each references, until the worklist
    /// runs dry (spec.md §4.F phase 2).
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray_stack.pop() {
            self.blacken_object(r);
        }
    }

    fn blacken_object(&mut self, r: ObjRef) {
        enum Refs {
            None,
            Object(Option<ObjRef>, Vec<Value>),
            Objects(ObjRef, Vec<ObjRef>),
            Value(Value),
            Table(ObjRef, Vec<(ObjRef, Value)>),
            BoundMethod(Value, ObjRef),
        }

        let refs = match self.objects[r.0 as usize].as_ref().expect("dangling ObjRef") {
            Obj::String(_) | Obj::Native(_) => Refs::None,
            Obj::Function(f) => Refs::Object(f.name, f.chunk.constants.clone()),
            Obj::Closure(c) => Refs::Objects(c.function, c.upvalues.clone()),
            Obj::Upvalue(ObjUpvalue::Closed(v)) => Refs::Value(*v),
            Obj::Upvalue(ObjUpvalue::Open(_)) => Refs::None,
            Obj::Class(c) => Refs::Table(c.name, c.methods.iter().collect()),
            Obj::Instance(i) => Refs::Table(i.class, i.fields.iter().collect()),
            Obj::BoundMethod(b) => Refs::BoundMethod(b.receiver, b.method),
        };

        match refs {
            Refs::None => {}
            Refs::Object(name, constants) => {
                if let Some(n) = name {
                    self.mark_object(n);
                }
                for v in constants {
                    self.mark_value(v);
                }
            }
            Refs::Objects(head, rest) => {
                self.mark_object(head);
                for r in rest {
                    self.mark_object(r);
                }
            }
            Refs::Value(v) => self.mark_value(v),
            Refs::Table(head, entries) => {
                self.mark_object(head);
                for (k, v) in entries {
                    self.mark_object(k);
                    self.mark_value(v);
                }
            }
            Refs::BoundMethod(receiver, method) => {
                self.mark_value(receiver);
                self.mark_object(method);
            }
        }
    }

    /// Walk the object list; free anything unmarked, clear marks on
    /// everything that survived (spec.md §4.F phase 3). Freeing a string
    /// also drops its intern-table entry.
    pub fn sweep(&mut self) {
        for idx in 0..self.objects.len() {
            if self.objects[idx].is_none() {
                continue;
            }
            if self.marks[idx] {
                self.marks[idx] = false;
                continue;
            }
            let freed = self.objects[idx].take().unwrap();
            self.bytes_allocated = self.bytes_allocated.saturating_sub(Self::size_of(&freed));
            if let Obj::String(s) = &freed {
                self.strings.delete(ObjRef(idx as u32), s.hash);
            }
            self.free_list.push(idx as u32);
        }
    }

    pub fn update_next_gc(&mut self) {
        self.next_gc = (self.bytes_allocated * GC_GROW_FACTOR).max(DEFAULT_NEXT_GC);
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_pointer_unique() {
        let mut heap = Heap::new();
        let a = heap.intern(b"hello");
        let b = heap.intern(b"hello");
        let c = heap.intern(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn unreachable_object_is_collected() {
        let mut heap = Heap::new();
        let s = heap.intern(b"transient");
        // no roots mark `s`
        heap.trace_references();
        heap.sweep();
        assert!(heap.strings.find_string(fnv1a(b"transient"), |r| heap.as_string(r).bytes.as_ref() == b"transient" as &[u8]).is_none());
        let _ = s;
    }

    #[test]
    fn reachable_object_survives_collection() {
        let mut heap = Heap::new();
        let s = heap.intern(b"kept");
        heap.mark_object(s);
        heap.trace_references();
        heap.sweep();
        assert_eq!(heap.as_string(s).bytes.as_ref(), b"kept" as &[u8]);
    }

    #[test]
    fn closure_trace_reaches_captured_upvalue() {
        let mut heap = Heap::new();
        let name = heap.intern(b"f");
        let function = heap.alloc_function(ObjFunction {
            arity: 0,
            upvalue_count: 1,
            chunk: crate::chunk::Chunk::new(),
            name: Some(name),
        });
        let upvalue = heap.alloc_open_upvalue(0);
        let closure = heap.alloc_closure(function, 1);
        if let Obj::Closure(c) = heap.get_mut(closure) {
            c.upvalues.push(upvalue);
        }
        heap.mark_object(closure);
        heap.trace_references();
        heap.sweep();
        // all three objects (closure, function, upvalue, name string)
        // should have survived
        assert!(matches!(heap.get(closure), Obj::Closure(_)));
        assert!(matches!(heap.get(function), Obj::Function(_)));
        assert!(matches!(heap.get(upvalue), Obj::Upvalue(_)));
    }
}
