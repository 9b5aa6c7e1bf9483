//! The object heap: an index-handle arena with a tracing collector.
//!
//! Every heap object lives in one slot of `entries`; a [`HeapId`] is the
//! slot index. Freed slots are recycled through a free list. Each slot
//! carries an object header (flag bits + cached hash) alongside its
//! [`HeapData`] payload.
//!
//! Collection is mark-sweep with a gray worklist and "second chance"
//! survival: an object must be unreachable for two consecutive cycles
//! before its slot is reclaimed. The interned-strings table is a weak view
//! pruned as strings are actually freed, so equal strings stay identical
//! for as long as either copy could be observed.
//!
//! Allocation never collects. The VM checks [`Heap::should_gc`] at
//! instruction boundaries and supplies the root set itself; native code can
//! therefore hold un-rooted handles between instructions, and parks values
//! in the scratch-root list before calling back into the VM.

use std::rc::Rc;

use serde::Serialize;
use smallvec::SmallVec;
use strum::{EnumCount, EnumIter, IntoStaticStr};

use crate::{
    chunk::CodeObject,
    hashing::{hash_bytes, hash_str},
    table::Table,
    value::Value,
    vm::NativeFn,
};

/// Index handle into the heap arena.
///
/// `u32` keeps `Value` small; four billion live objects is far beyond any
/// realistic heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).expect("heap exceeds u32 slots"))
    }
}

/// Header flag: reachable in the current mark phase.
pub(crate) const FLAG_MARKED: u8 = 1 << 0;
/// Header flag: currently being rendered by `repr`, for cycle cutoff.
pub(crate) const FLAG_IN_REPR: u8 = 1 << 1;
/// Header flag: never collected (builtin classes, cached dunder names).
pub(crate) const FLAG_IMMORTAL: u8 = 1 << 2;
/// Header flag: survived one unreachable cycle; freed on the next.
pub(crate) const FLAG_SECOND_CHANCE: u8 = 1 << 3;
/// Header flag: the header hash field holds a valid cached hash.
pub(crate) const FLAG_VALID_HASH: u8 = 1 << 4;
/// Header flag: attribute is skipped when copying method tables on inherit.
pub(crate) const FLAG_NO_INHERIT: u8 = 1 << 5;

/// String storage width, by widest codepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StrWidth {
    /// All codepoints < 0x80; the UTF-8 bytes are the codepoints.
    Ascii,
    /// All codepoints < 0x100.
    Ucs1,
    /// All codepoints < 0x10000.
    Ucs2,
    /// Codepoints beyond the BMP present.
    Ucs4,
}

/// An interned string.
#[derive(Debug)]
pub(crate) struct StrObject {
    data: Box<str>,
    /// Number of codepoints (not bytes).
    pub codepoints: usize,
    pub width: StrWidth,
    /// Decoded codepoints for non-ASCII strings, giving O(1) indexing.
    /// ASCII strings index their bytes directly and store nothing here.
    chars: Option<Box<[char]>>,
}

impl StrObject {
    #[must_use]
    pub fn new(text: &str) -> Self {
        let mut max = 0u32;
        let mut count = 0usize;
        for ch in text.chars() {
            max = max.max(ch as u32);
            count += 1;
        }
        let width = match max {
            0..=0x7f => StrWidth::Ascii,
            0x80..=0xff => StrWidth::Ucs1,
            0x100..=0xffff => StrWidth::Ucs2,
            _ => StrWidth::Ucs4,
        };
        let chars = if width == StrWidth::Ascii {
            None
        } else {
            Some(text.chars().collect())
        };
        Self {
            data: text.into(),
            codepoints: count,
            width,
            chars,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.data
    }

    /// The codepoint at a character index.
    #[must_use]
    pub fn char_at(&self, index: usize) -> Option<char> {
        if index >= self.codepoints {
            return None;
        }
        match &self.chars {
            None => Some(char::from(self.data.as_bytes()[index])),
            Some(chars) => chars.get(index).copied(),
        }
    }
}

/// An immutable byte string.
#[derive(Debug)]
pub(crate) struct BytesObject {
    pub data: Box<[u8]>,
}

/// An immutable value sequence.
#[derive(Debug)]
pub(crate) struct TupleObject {
    pub items: Vec<Value>,
}

/// A mutable value sequence.
#[derive(Debug)]
pub(crate) struct ListObject {
    pub items: Vec<Value>,
}

/// A mapping backed by the ordered table.
#[derive(Debug, Default)]
pub(crate) struct DictObject {
    pub table: Table,
}

/// A set backed by the ordered table; values are a `None` sentinel.
#[derive(Debug, Default)]
pub(crate) struct SetObject {
    pub table: Table,
}

/// A callable pairing a code object with captured upvalues and globals.
#[derive(Debug)]
pub(crate) struct ClosureObject {
    /// Heap slot of the `HeapData::Code` this closure runs.
    pub code: HeapId,
    /// Captured upvalue cells, in the order the code object references them.
    pub upvalues: SmallVec<[HeapId; 4]>,
    /// Evaluated positional defaults, right-aligned on the parameter list.
    pub defaults: Vec<Value>,
    /// Evaluated keyword-only defaults, right-aligned.
    pub kw_defaults: Vec<Value>,
    /// Module instance whose fields are this function's globals.
    pub globals: HeapId,
    /// Lazily created attribute table (`f.attr = ...`).
    pub attrs: Option<Box<Table>>,
    /// Annotations dict, when the source carried annotations.
    pub annotations: Option<HeapId>,
}

/// A host function exposed to programs.
pub(crate) struct NativeObject {
    pub func: NativeFn,
    pub name: Box<str>,
    pub docstring: Option<&'static str>,
}

impl std::fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeObject").field("name", &self.name).finish()
    }
}

/// Storage for a captured variable.
///
/// Open upvalues point at a live stack slot of the owning thread; closing
/// copies the slot into the cell. An upvalue closes exactly once.
#[derive(Debug, Clone, Copy)]
pub(crate) enum UpvalueState {
    /// Still on the owning thread's stack at this absolute slot.
    Open { slot: usize },
    /// Copied out; the cell owns the value now.
    Closed(Value),
}

#[derive(Debug)]
pub(crate) struct UpvalueObject {
    pub state: UpvalueState,
}

/// Protocol methods resolved once per class and cached on it.
///
/// Subclasses inherit the cache on `INHERIT`; installing a method with a
/// matching name overwrites the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter, IntoStaticStr)]
pub(crate) enum Dunder {
    #[strum(serialize = "__init__")]
    Init,
    #[strum(serialize = "__new__")]
    New,
    #[strum(serialize = "__repr__")]
    Repr,
    #[strum(serialize = "__str__")]
    Str,
    #[strum(serialize = "__call__")]
    Call,
    #[strum(serialize = "__eq__")]
    Eq,
    #[strum(serialize = "__hash__")]
    Hash,
    #[strum(serialize = "__iter__")]
    Iter,
    #[strum(serialize = "__len__")]
    Len,
    #[strum(serialize = "__contains__")]
    Contains,
    #[strum(serialize = "__getattr__")]
    Getattr,
    #[strum(serialize = "__get__")]
    Get,
    #[strum(serialize = "__set__")]
    Set,
    #[strum(serialize = "__enter__")]
    Enter,
    #[strum(serialize = "__exit__")]
    Exit,
    #[strum(serialize = "__getitem__")]
    Getitem,
    #[strum(serialize = "__setitem__")]
    Setitem,
    #[strum(serialize = "__delitem__")]
    Delitem,
    #[strum(serialize = "__bool__")]
    Bool,
    #[strum(serialize = "__await__")]
    Await,
}

impl Dunder {
    /// The dunder's source-level name.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Per-class cache of resolved dunder methods.
#[derive(Debug, Default)]
pub(crate) struct DunderCache {
    slots: [Option<Value>; Dunder::COUNT],
}

impl DunderCache {
    #[must_use]
    pub fn get(&self, dunder: Dunder) -> Option<Value> {
        self.slots[dunder as usize]
    }

    pub fn set(&mut self, dunder: Dunder, value: Value) {
        self.slots[dunder as usize] = Some(value);
    }

    /// Copies the base class's resolved entries; later `METHOD` installs
    /// overwrite individual slots.
    pub fn inherit_from(&mut self, base: &Self) {
        for (slot, inherited) in self.slots.iter_mut().zip(base.slots.iter()) {
            if slot.is_none() {
                *slot = *inherited;
            }
        }
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &Value> {
        self.slots.iter().flatten()
    }
}

/// A class: name, single base, attribute table, dunder cache.
#[derive(Debug)]
pub(crate) struct ClassObject {
    pub name: HeapId,
    pub base: Option<HeapId>,
    pub table: Table,
    pub dunders: DunderCache,
    /// Builtin classes construct through a native rather than `__init__`.
    pub native_ctor: Option<NativeFn>,
    /// Native finalizer run when an instance of this class is swept.
    pub finalizer: Option<fn(&mut InstanceObject)>,
}

impl ClassObject {
    #[must_use]
    pub fn new(name: HeapId, base: Option<HeapId>) -> Self {
        Self {
            name,
            base,
            table: Table::new(),
            dunders: DunderCache::default(),
            native_ctor: None,
            finalizer: None,
        }
    }
}

/// An object with a class pointer and attribute table.
#[derive(Debug)]
pub(crate) struct InstanceObject {
    pub class: HeapId,
    pub fields: Table,
}

/// A `(receiver, method)` pair callable with an implicit first argument.
#[derive(Debug)]
pub(crate) struct BoundMethodObject {
    pub receiver: Value,
    pub method: Value,
}

/// Built-in iterator state.
///
/// All variants follow the exhaustion convention of the language: when a
/// call finds nothing left, the iterator returns *itself*.
#[derive(Debug, Clone)]
pub(crate) enum NativeIterObject {
    List { list: HeapId, index: usize },
    Tuple { tuple: HeapId, index: usize },
    Str { string: HeapId, index: usize },
    Bytes { bytes: HeapId, index: usize },
    Range { current: i64, stop: i64, step: i64 },
    DictKeys { dict: HeapId, index: usize },
    DictItems { dict: HeapId, index: usize },
    DictValues { dict: HeapId, index: usize },
    Set { set: HeapId, index: usize },
}

/// Generator / coroutine execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GeneratorState {
    /// Created but never resumed.
    Ready,
    /// Suspended at a `yield`.
    Suspended,
    /// Currently executing; re-entry is an error.
    Running,
    /// Ran to completion; further calls return the generator itself.
    Finished,
}

/// A paused function activation.
///
/// The generator owns its stack slice between resumes; resuming splices it
/// back onto the calling thread's stack as a fresh frame.
#[derive(Debug)]
pub(crate) struct GeneratorObject {
    pub closure: HeapId,
    pub ip: usize,
    pub stack: Vec<Value>,
    pub state: GeneratorState,
}

/// A lazily evaluated integer sequence (`range(...)`).
#[derive(Debug, Clone, Copy)]
pub(crate) struct RangeObject {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeObject {
    /// Number of values the range produces.
    #[must_use]
    pub fn len(&self) -> i64 {
        if self.step > 0 {
            (self.stop - self.start + self.step - 1).div_euclid(self.step).max(0)
        } else {
            (self.start - self.stop - self.step - 1).div_euclid(-self.step).max(0)
        }
    }
}

/// Heap object payload.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(StrObject),
    Bytes(BytesObject),
    Tuple(TupleObject),
    List(ListObject),
    Dict(DictObject),
    Set(SetObject),
    Code(Rc<CodeObject>),
    Closure(ClosureObject),
    Native(NativeObject),
    Upvalue(UpvalueObject),
    Class(ClassObject),
    Instance(InstanceObject),
    BoundMethod(BoundMethodObject),
    NativeIter(NativeIterObject),
    Generator(GeneratorObject),
    Range(RangeObject),
}

impl HeapData {
    /// Kind name used in error messages and stats.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Set(_) => "set",
            Self::Code(_) => "code",
            Self::Closure(_) => "function",
            Self::Native(_) => "builtin_function",
            Self::Upvalue(_) => "upvalue",
            Self::Class(_) => "class",
            Self::Instance(_) => "instance",
            Self::BoundMethod(_) => "method",
            Self::NativeIter(_) => "iterator",
            Self::Generator(_) => "generator",
            Self::Range(_) => "range",
        }
    }
}

/// One arena slot: header plus payload.
#[derive(Debug)]
struct HeapEntry {
    flags: u8,
    /// Cached hash; valid when `FLAG_VALID_HASH` is set.
    hash: u32,
    data: HeapData,
}

/// Collector counters, exposed to embedders.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GcStats {
    /// Completed collection cycles.
    pub collections: u64,
    /// Estimated live bytes after the last sweep.
    pub bytes_allocated: usize,
    /// Allocation estimate that triggers the next collection.
    pub next_gc: usize,
    /// Objects freed by the last sweep.
    pub last_freed: usize,
    /// Objects granted a second chance by the last sweep.
    pub last_deferred: usize,
}

/// Initial collection threshold.
const FIRST_GC_BYTES: usize = 1024 * 1024;
/// Growth is doubling, capped at this increment so very large heaps do not
/// suffer doubling latency.
const GC_GROWTH_CAP: usize = 64 * 1024 * 1024;

/// The object heap arena.
#[derive(Debug, Default)]
pub(crate) struct Heap {
    entries: Vec<Option<HeapEntry>>,
    /// Recycled slots, consumed before the arena grows.
    free_list: Vec<HeapId>,
    /// Weak view of interned strings: key is the string, value unused.
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    /// Collection is deferred while this is nonzero.
    pause_depth: u32,
    /// Collect at every opportunity; for shaking out liveness bugs.
    pub stress: bool,
    /// Values native code parked here are traced as roots.
    scratch: Vec<Value>,
    /// Objects owned by in-progress compilations; traced as roots.
    compiler_roots: Vec<HeapId>,
    stats: GcStats,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_gc: FIRST_GC_BYTES,
            ..Self::default()
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates a new object, reusing a free slot when one exists.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        self.bytes_allocated += estimate_size(&data);
        let entry = HeapEntry { flags: 0, hash: 0, data };
        if let Some(id) = self.free_list.pop() {
            debug_assert!(self.entries[id.index()].is_none(), "free list slot still occupied");
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId::from_index(self.entries.len());
            self.entries.push(Some(entry));
            id
        }
    }

    /// Interns a string, returning the shared copy.
    ///
    /// All strings are created through here, which is what makes string
    /// equality an identity test.
    pub fn intern(&mut self, text: &str) -> HeapId {
        let hash = hash_str(text);
        if let Some(existing) = self.find_interned(text, hash) {
            return existing;
        }
        let id = self.allocate(HeapData::Str(StrObject::new(text)));
        self.set_cached_hash(id, hash);
        self.strings.set_exact(Value::Ref(id), hash, Value::None);
        id
    }

    /// Probes the intern table by content.
    fn find_interned(&self, text: &str, hash: u32) -> Option<HeapId> {
        let mut found = None;
        self.strings.get_with(hash, |candidate| {
            if let Value::Ref(id) = candidate
                && self.as_str(*id) == text
            {
                found = Some(*id);
                true
            } else {
                false
            }
        });
        found
    }

    pub fn allocate_bytes(&mut self, data: Vec<u8>) -> HeapId {
        let hash = hash_bytes(&data);
        let id = self.allocate(HeapData::Bytes(BytesObject { data: data.into() }));
        self.set_cached_hash(id, hash);
        id
    }

    pub fn allocate_list(&mut self, items: Vec<Value>) -> HeapId {
        self.allocate(HeapData::List(ListObject { items }))
    }

    pub fn allocate_tuple(&mut self, items: Vec<Value>) -> HeapId {
        self.allocate(HeapData::Tuple(TupleObject { items }))
    }

    pub fn allocate_dict(&mut self) -> HeapId {
        self.allocate(HeapData::Dict(DictObject::default()))
    }

    pub fn allocate_set(&mut self) -> HeapId {
        self.allocate(HeapData::Set(SetObject::default()))
    }

    pub fn allocate_instance(&mut self, class: HeapId) -> HeapId {
        self.allocate(HeapData::Instance(InstanceObject {
            class,
            fields: Table::new(),
        }))
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    /// Borrows a live object's payload.
    ///
    /// # Panics
    /// Panics on a freed slot; handles are only valid while reachable.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self
            .entries
            .get(id.index())
            .and_then(Option::as_ref)
            .expect("stale heap handle")
            .data
    }

    #[must_use]
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self
            .entries
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .expect("stale heap handle")
            .data
    }

    fn entry(&self, id: HeapId) -> &HeapEntry {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .expect("stale heap handle")
    }

    fn entry_mut(&mut self, id: HeapId) -> &mut HeapEntry {
        self.entries
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .expect("stale heap handle")
    }

    #[must_use]
    pub fn flags(&self, id: HeapId) -> u8 {
        self.entry(id).flags
    }

    pub fn set_flag(&mut self, id: HeapId, flag: u8) {
        self.entry_mut(id).flags |= flag;
    }

    pub fn clear_flag(&mut self, id: HeapId, flag: u8) {
        self.entry_mut(id).flags &= !flag;
    }

    /// Marks an object as entering `repr`; false if it already was, which
    /// signals a reference cycle to the renderer.
    pub fn enter_repr(&mut self, id: HeapId) -> bool {
        let entry = self.entry_mut(id);
        if entry.flags & FLAG_IN_REPR != 0 {
            return false;
        }
        entry.flags |= FLAG_IN_REPR;
        true
    }

    pub fn exit_repr(&mut self, id: HeapId) {
        self.clear_flag(id, FLAG_IN_REPR);
    }

    /// The hash cached in the object header.
    ///
    /// Strings and bytes always have one; instances gain one the first time
    /// the VM evaluates their `__hash__`.
    #[must_use]
    pub fn cached_hash(&self, id: HeapId) -> u32 {
        let entry = self.entry(id);
        debug_assert!(entry.flags & FLAG_VALID_HASH != 0, "no cached hash on this object");
        entry.hash
    }

    #[must_use]
    pub fn has_cached_hash(&self, id: HeapId) -> bool {
        self.entry(id).flags & FLAG_VALID_HASH != 0
    }

    pub fn set_cached_hash(&mut self, id: HeapId, hash: u32) {
        let entry = self.entry_mut(id);
        entry.hash = hash;
        entry.flags |= FLAG_VALID_HASH;
    }

    // Typed accessors. All panic on kind mismatch: opcodes and natives
    // validate kinds before reaching for these.

    #[must_use]
    pub fn as_str(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::Str(s) => s.as_str(),
            other => panic!("expected str, found {}", other.type_name()),
        }
    }

    #[must_use]
    pub fn str_object(&self, id: HeapId) -> &StrObject {
        match self.get(id) {
            HeapData::Str(s) => s,
            other => panic!("expected str, found {}", other.type_name()),
        }
    }

    #[must_use]
    pub fn bytes(&self, id: HeapId) -> &BytesObject {
        match self.get(id) {
            HeapData::Bytes(b) => b,
            other => panic!("expected bytes, found {}", other.type_name()),
        }
    }

    #[must_use]
    pub fn list(&self, id: HeapId) -> &ListObject {
        match self.get(id) {
            HeapData::List(l) => l,
            other => panic!("expected list, found {}", other.type_name()),
        }
    }

    pub fn list_mut(&mut self, id: HeapId) -> &mut ListObject {
        match self.get_mut(id) {
            HeapData::List(l) => l,
            other => panic!("expected list, found {}", other.type_name()),
        }
    }

    #[must_use]
    pub fn tuple(&self, id: HeapId) -> &TupleObject {
        match self.get(id) {
            HeapData::Tuple(t) => t,
            other => panic!("expected tuple, found {}", other.type_name()),
        }
    }

    #[must_use]
    pub fn dict(&self, id: HeapId) -> &DictObject {
        match self.get(id) {
            HeapData::Dict(d) => d,
            other => panic!("expected dict, found {}", other.type_name()),
        }
    }

    pub fn dict_mut(&mut self, id: HeapId) -> &mut DictObject {
        match self.get_mut(id) {
            HeapData::Dict(d) => d,
            other => panic!("expected dict, found {}", other.type_name()),
        }
    }

    #[must_use]
    pub fn set_obj(&self, id: HeapId) -> &SetObject {
        match self.get(id) {
            HeapData::Set(s) => s,
            other => panic!("expected set, found {}", other.type_name()),
        }
    }

    pub fn set_obj_mut(&mut self, id: HeapId) -> &mut SetObject {
        match self.get_mut(id) {
            HeapData::Set(s) => s,
            other => panic!("expected set, found {}", other.type_name()),
        }
    }

    /// Detaches a dict's table for heap-aware probing.
    ///
    /// While detached the dict reads as empty; pair every take with
    /// [`Heap::put_dict_table`]. Hashable keys cannot reference dicts, so
    /// probing never re-enters the detached table.
    #[must_use]
    pub fn take_dict_table(&mut self, id: HeapId) -> Table {
        std::mem::take(&mut self.dict_mut(id).table)
    }

    pub fn put_dict_table(&mut self, id: HeapId, table: Table) {
        self.dict_mut(id).table = table;
    }

    #[must_use]
    pub fn take_set_table(&mut self, id: HeapId) -> Table {
        std::mem::take(&mut self.set_obj_mut(id).table)
    }

    pub fn put_set_table(&mut self, id: HeapId, table: Table) {
        self.set_obj_mut(id).table = table;
    }

    #[must_use]
    pub fn class(&self, id: HeapId) -> &ClassObject {
        match self.get(id) {
            HeapData::Class(c) => c,
            other => panic!("expected class, found {}", other.type_name()),
        }
    }

    pub fn class_mut(&mut self, id: HeapId) -> &mut ClassObject {
        match self.get_mut(id) {
            HeapData::Class(c) => c,
            other => panic!("expected class, found {}", other.type_name()),
        }
    }

    #[must_use]
    pub fn instance(&self, id: HeapId) -> &InstanceObject {
        match self.get(id) {
            HeapData::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_name()),
        }
    }

    pub fn instance_mut(&mut self, id: HeapId) -> &mut InstanceObject {
        match self.get_mut(id) {
            HeapData::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_name()),
        }
    }

    #[must_use]
    pub fn closure(&self, id: HeapId) -> &ClosureObject {
        match self.get(id) {
            HeapData::Closure(c) => c,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    pub fn closure_mut(&mut self, id: HeapId) -> &mut ClosureObject {
        match self.get_mut(id) {
            HeapData::Closure(c) => c,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    #[must_use]
    pub fn code(&self, id: HeapId) -> &Rc<CodeObject> {
        match self.get(id) {
            HeapData::Code(c) => c,
            other => panic!("expected code, found {}", other.type_name()),
        }
    }

    #[must_use]
    pub fn upvalue(&self, id: HeapId) -> &UpvalueObject {
        match self.get(id) {
            HeapData::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    pub fn upvalue_mut(&mut self, id: HeapId) -> &mut UpvalueObject {
        match self.get_mut(id) {
            HeapData::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    #[must_use]
    pub fn generator(&self, id: HeapId) -> &GeneratorObject {
        match self.get(id) {
            HeapData::Generator(g) => g,
            other => panic!("expected generator, found {}", other.type_name()),
        }
    }

    pub fn generator_mut(&mut self, id: HeapId) -> &mut GeneratorObject {
        match self.get_mut(id) {
            HeapData::Generator(g) => g,
            other => panic!("expected generator, found {}", other.type_name()),
        }
    }

    #[must_use]
    pub fn range(&self, id: HeapId) -> &RangeObject {
        match self.get(id) {
            HeapData::Range(r) => r,
            other => panic!("expected range, found {}", other.type_name()),
        }
    }

    // ------------------------------------------------------------------
    // Roots held by the heap itself
    // ------------------------------------------------------------------

    /// Parks a value so it survives collection while native code works.
    /// Returns the depth to pass to [`Heap::scratch_truncate`].
    pub fn scratch_push(&mut self, value: Value) -> usize {
        self.scratch.push(value);
        self.scratch.len() - 1
    }

    pub fn scratch_truncate(&mut self, depth: usize) {
        self.scratch.truncate(depth);
    }

    #[must_use]
    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }

    /// Registers an object owned by an in-progress compilation.
    pub fn push_compiler_root(&mut self, id: HeapId) {
        self.compiler_roots.push(id);
    }

    #[must_use]
    pub fn compiler_roots_len(&self) -> usize {
        self.compiler_roots.len()
    }

    pub fn compiler_roots_truncate(&mut self, len: usize) {
        self.compiler_roots.truncate(len);
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Defers collection until the matching [`Heap::gc_resume`].
    pub fn gc_pause(&mut self) {
        self.pause_depth += 1;
    }

    pub fn gc_resume(&mut self) {
        debug_assert!(self.pause_depth > 0, "unbalanced gc_resume");
        self.pause_depth = self.pause_depth.saturating_sub(1);
    }

    /// Whether the VM should collect at the next instruction boundary.
    #[must_use]
    pub fn should_gc(&self) -> bool {
        self.pause_depth == 0 && (self.stress || self.bytes_allocated > self.next_gc)
    }

    /// Runs a full mark-sweep cycle over the given external roots.
    ///
    /// The heap's own scratch and compiler roots are always included. The
    /// VM wraps this with its stack/frame/module/builtin roots.
    pub fn collect_garbage(&mut self, external_roots: impl IntoIterator<Item = HeapId>) {
        // Mark phase: flood from the roots through a gray worklist.
        let mut gray: Vec<HeapId> = external_roots.into_iter().collect();
        gray.extend(self.compiler_roots.iter().copied());
        for value in &self.scratch {
            if let Value::Ref(id) = value {
                gray.push(*id);
            }
        }
        while let Some(id) = gray.pop() {
            let Some(entry) = self.entries.get_mut(id.index()).and_then(Option::as_mut) else {
                continue;
            };
            if entry.flags & FLAG_MARKED != 0 {
                continue;
            }
            entry.flags |= FLAG_MARKED;
            collect_children(&entry.data, &mut gray);
        }

        // Sweep phase with second-chance survival.
        let mut freed = 0usize;
        let mut deferred = 0usize;
        for index in 0..self.entries.len() {
            // Decide this slot's fate first, then free with fresh borrows so
            // the finalizer lookup can read the (possibly also dying) class.
            let (hash, is_str, size, instance_class) = {
                let Some(entry) = self.entries[index].as_mut() else {
                    continue;
                };
                if entry.flags & FLAG_MARKED != 0 {
                    entry.flags &= !(FLAG_MARKED | FLAG_SECOND_CHANCE);
                    continue;
                }
                if entry.flags & FLAG_IMMORTAL != 0 {
                    continue;
                }
                if entry.flags & FLAG_SECOND_CHANCE == 0 {
                    entry.flags |= FLAG_SECOND_CHANCE;
                    deferred += 1;
                    continue;
                }
                let instance_class = match &entry.data {
                    HeapData::Instance(instance) => Some(instance.class),
                    _ => None,
                };
                (
                    entry.hash,
                    matches!(entry.data, HeapData::Str(_)),
                    estimate_size(&entry.data),
                    instance_class,
                )
            };
            let id = HeapId::from_index(index);
            // Run an instance finalizer if its class declares one. The class
            // may itself be dying this cycle; it has not been freed yet.
            let finalizer = instance_class.and_then(|class| {
                self.entries
                    .get(class.index())
                    .and_then(Option::as_ref)
                    .and_then(|c| match &c.data {
                        HeapData::Class(class_obj) => class_obj.finalizer,
                        _ => None,
                    })
            });
            if let Some(finalize) = finalizer
                && let Some(slot) = self.entries[index].as_mut()
                && let HeapData::Instance(instance) = &mut slot.data
            {
                finalize(instance);
            }
            // Strings leave the weak intern view at the same moment they are
            // freed, so the table never holds a stale handle.
            if is_str {
                self.strings.delete_exact(&Value::Ref(id), hash);
            }
            self.entries[index] = None;
            self.free_list.push(id);
            self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
            freed += 1;
        }

        self.next_gc = self
            .bytes_allocated
            .saturating_mul(2)
            .min(self.bytes_allocated + GC_GROWTH_CAP)
            .max(FIRST_GC_BYTES);
        self.stats.collections += 1;
        self.stats.bytes_allocated = self.bytes_allocated;
        self.stats.next_gc = self.next_gc;
        self.stats.last_freed = freed;
        self.stats.last_deferred = deferred;
    }

    #[must_use]
    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Number of live objects, for tests and stats.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    #[must_use]
    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }
}

/// Pushes every heap handle a payload references onto the gray worklist.
fn collect_children(data: &HeapData, gray: &mut Vec<HeapId>) {
    let mut push_value = |gray: &mut Vec<HeapId>, value: &Value| {
        if let Value::Ref(id) = value {
            gray.push(*id);
        }
    };
    match data {
        HeapData::Str(_) | HeapData::Bytes(_) | HeapData::Native(_) | HeapData::Range(_) => {}
        HeapData::Tuple(TupleObject { items }) | HeapData::List(ListObject { items }) => {
            for item in items {
                push_value(gray, item);
            }
        }
        HeapData::Dict(DictObject { table }) | HeapData::Set(SetObject { table }) => {
            for (key, value) in table.iter() {
                push_value(gray, key);
                push_value(gray, value);
            }
        }
        HeapData::Code(code) => {
            gray.push(code.name);
            for constant in &code.chunk.constants {
                push_value(gray, constant);
            }
            gray.extend(code.positional.iter().copied());
            gray.extend(code.keyword_only.iter().copied());
            for local in &code.local_names {
                gray.push(local.name);
            }
            if let Some(doc) = &code.docstring {
                push_value(gray, doc);
            }
        }
        HeapData::Closure(closure) => {
            gray.push(closure.code);
            gray.push(closure.globals);
            gray.extend(closure.upvalues.iter().copied());
            for value in closure.defaults.iter().chain(closure.kw_defaults.iter()) {
                push_value(gray, value);
            }
            if let Some(attrs) = &closure.attrs {
                for (key, value) in attrs.iter() {
                    push_value(gray, key);
                    push_value(gray, value);
                }
            }
            if let Some(annotations) = closure.annotations {
                gray.push(annotations);
            }
        }
        HeapData::Upvalue(upvalue) => {
            if let UpvalueState::Closed(value) = &upvalue.state {
                push_value(gray, value);
            }
            // Open upvalues point into a thread stack, which is a root
            // already; nothing further to trace here.
        }
        HeapData::Class(class) => {
            gray.push(class.name);
            if let Some(base) = class.base {
                gray.push(base);
            }
            for (key, value) in class.table.iter() {
                push_value(gray, key);
                push_value(gray, value);
            }
            for value in class.dunders.values() {
                push_value(gray, value);
            }
        }
        HeapData::Instance(instance) => {
            gray.push(instance.class);
            for (key, value) in instance.fields.iter() {
                push_value(gray, key);
                push_value(gray, value);
            }
        }
        HeapData::BoundMethod(bound) => {
            push_value(gray, &bound.receiver);
            push_value(gray, &bound.method);
        }
        HeapData::NativeIter(iter) => match iter {
            NativeIterObject::List { list: id, .. }
            | NativeIterObject::Tuple { tuple: id, .. }
            | NativeIterObject::Str { string: id, .. }
            | NativeIterObject::Bytes { bytes: id, .. }
            | NativeIterObject::DictKeys { dict: id, .. }
            | NativeIterObject::DictItems { dict: id, .. }
            | NativeIterObject::DictValues { dict: id, .. }
            | NativeIterObject::Set { set: id, .. } => gray.push(*id),
            NativeIterObject::Range { .. } => {}
        },
        HeapData::Generator(generator) => {
            gray.push(generator.closure);
            for value in &generator.stack {
                push_value(gray, value);
            }
        }
    }
}

/// Rough per-object byte estimate driving the collection schedule.
fn estimate_size(data: &HeapData) -> usize {
    let base = std::mem::size_of::<HeapEntry>();
    base + match data {
        HeapData::Str(s) => s.as_str().len() + s.chars.as_ref().map_or(0, |c| c.len() * 4),
        HeapData::Bytes(b) => b.data.len(),
        HeapData::Tuple(t) => t.items.len() * std::mem::size_of::<Value>(),
        HeapData::List(l) => l.items.capacity() * std::mem::size_of::<Value>(),
        HeapData::Dict(d) => d.table.len() * 3 * std::mem::size_of::<Value>(),
        HeapData::Set(s) => s.table.len() * 2 * std::mem::size_of::<Value>(),
        HeapData::Code(c) => c.chunk.code.len() + c.chunk.constants.len() * std::mem::size_of::<Value>(),
        HeapData::Closure(c) => (c.defaults.len() + c.kw_defaults.len()) * std::mem::size_of::<Value>() + 64,
        HeapData::Generator(g) => g.stack.len() * std::mem::size_of::<Value>() + 64,
        HeapData::Class(c) => c.table.len() * 3 * std::mem::size_of::<Value>() + 128,
        HeapData::Instance(i) => i.fields.len() * 3 * std::mem::size_of::<Value>(),
        _ => 32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_get() {
        let mut heap = Heap::new();
        let id = heap.allocate_list(vec![Value::Int(1)]);
        assert_eq!(heap.list(id).items.len(), 1);
        assert_eq!(heap.get(id).type_name(), "list");
    }

    #[test]
    fn test_interning_shares_and_caches_hash() {
        let mut heap = Heap::new();
        let a = heap.intern("abc");
        let b = heap.intern("abc");
        let c = heap.intern("abd");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(heap.has_cached_hash(a));
        assert_eq!(heap.interned_count(), 2);
    }

    #[test]
    fn test_ascii_strings_store_no_codepoint_buffer() {
        let mut heap = Heap::new();
        let ascii = heap.intern("plain");
        let wide = heap.intern("a\u{1F600}b");
        assert_eq!(heap.str_object(ascii).width, StrWidth::Ascii);
        assert!(heap.str_object(ascii).chars.is_none());
        assert_eq!(heap.str_object(wide).width, StrWidth::Ucs4);
        assert!(heap.str_object(wide).chars.is_some());
        assert_eq!(heap.str_object(wide).codepoints, 3);
        assert_eq!(heap.str_object(wide).char_at(1), Some('\u{1F600}'));
    }

    #[test]
    fn test_collection_requires_two_cycles() {
        let mut heap = Heap::new();
        let id = heap.allocate_list(Vec::new());
        heap.collect_garbage([]);
        // First cycle only grants the second chance.
        assert_eq!(heap.live_objects(), 1);
        assert!(heap.flags(id) & FLAG_SECOND_CHANCE != 0);
        heap.collect_garbage([]);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn test_rooted_objects_survive() {
        let mut heap = Heap::new();
        let kept = heap.allocate_list(Vec::new());
        let _dropped = heap.allocate_list(Vec::new());
        heap.collect_garbage([kept]);
        heap.collect_garbage([kept]);
        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.list(kept).items.len(), 0);
    }

    #[test]
    fn test_marking_revokes_second_chance() {
        let mut heap = Heap::new();
        let id = heap.allocate_list(Vec::new());
        heap.collect_garbage([]);
        assert!(heap.flags(id) & FLAG_SECOND_CHANCE != 0);
        // Becomes reachable again: the grace flag is cleared.
        heap.collect_garbage([id]);
        assert!(heap.flags(id) & FLAG_SECOND_CHANCE == 0);
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn test_children_keep_objects_alive() {
        let mut heap = Heap::new();
        let inner = heap.intern("payload");
        let outer = heap.allocate_list(vec![Value::Ref(inner)]);
        heap.collect_garbage([outer]);
        heap.collect_garbage([outer]);
        assert_eq!(heap.live_objects(), 2);
        assert_eq!(heap.as_str(inner), "payload");
    }

    #[test]
    fn test_dead_strings_leave_the_intern_table() {
        let mut heap = Heap::new();
        let _s = heap.intern("transient");
        assert_eq!(heap.interned_count(), 1);
        heap.collect_garbage([]);
        // Second chance: still interned, still identical if re-created.
        assert_eq!(heap.interned_count(), 1);
        heap.collect_garbage([]);
        assert_eq!(heap.interned_count(), 0);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn test_cycles_are_collected() {
        let mut heap = Heap::new();
        let a = heap.allocate_list(Vec::new());
        let b = heap.allocate_list(vec![Value::Ref(a)]);
        heap.list_mut(a).items.push(Value::Ref(b));
        heap.collect_garbage([]);
        heap.collect_garbage([]);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn test_immortal_objects_never_free() {
        let mut heap = Heap::new();
        let id = heap.intern("forever");
        heap.set_flag(id, FLAG_IMMORTAL);
        for _ in 0..3 {
            heap.collect_garbage([]);
        }
        assert_eq!(heap.as_str(id), "forever");
    }

    #[test]
    fn test_scratch_values_are_roots() {
        let mut heap = Heap::new();
        let id = heap.allocate_list(Vec::new());
        let depth = heap.scratch_push(Value::Ref(id));
        heap.collect_garbage([]);
        heap.collect_garbage([]);
        assert_eq!(heap.live_objects(), 1);
        heap.scratch_truncate(depth);
        heap.collect_garbage([]);
        heap.collect_garbage([]);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn test_free_slots_are_recycled() {
        let mut heap = Heap::new();
        let first = heap.allocate_list(Vec::new());
        heap.collect_garbage([]);
        heap.collect_garbage([]);
        let second = heap.allocate_list(Vec::new());
        assert_eq!(first.index(), second.index());
    }

    #[test]
    fn test_pause_defers_collection() {
        let mut heap = Heap::new();
        heap.stress = true;
        assert!(heap.should_gc());
        heap.gc_pause();
        assert!(!heap.should_gc());
        heap.gc_resume();
        assert!(heap.should_gc());
    }

    #[test]
    fn test_instance_finalizer_runs_on_sweep() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static FINALIZED: AtomicUsize = AtomicUsize::new(0);
        fn finalize(_instance: &mut InstanceObject) {
            FINALIZED.fetch_add(1, Ordering::SeqCst);
        }

        let mut heap = Heap::new();
        let name = heap.intern("Managed");
        let mut class = ClassObject::new(name, None);
        class.finalizer = Some(finalize);
        let class_id = heap.allocate(HeapData::Class(class));
        heap.set_flag(class_id, FLAG_IMMORTAL);
        let instance = heap.allocate_instance(class_id);
        let _ = instance;
        heap.collect_garbage([]);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 0);
        heap.collect_garbage([]);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    }
}
