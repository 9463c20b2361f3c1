//! Type layout contract between the runtime and the collector.
//!
//! Every object header encodes a `*const TypeLayout`. The collector never
//! interprets payloads on its own; it only follows the pointer offset tables
//! and scanner selectors published here by the runtime's type system.

use std::sync::atomic::AtomicPtr;

use crate::mark::Marker;
use crate::value::Value;

/// Layout descriptor for one runtime type. Aligned to 16 so that the
/// descriptor pointer survives the 4 tag bits of the object header.
#[repr(C, align(16))]
pub struct TypeLayout {
    /// Payload size in bytes. Ignored by the variable-size kinds
    /// (`String`, `ObjVec`, `Array`).
    pub size: usize,
    /// Number of managed slots, used for intergenerational accounting.
    pub npointers: u32,
    pub name: &'static str,
    pub desc: FieldDesc,
    /// Foreign sweep hook, dispatched for objects scheduled via
    /// `schedule_foreign_sweepfunc`.
    pub sweepfunc: Option<unsafe fn(*mut Value)>,
}

unsafe impl Sync for TypeLayout {}

/// Field scanner selector. The three offset-table widths mirror the
/// original's `fielddesc_type 0/1/2`; `Dynamic` is the type-supplied
/// fallback (`fielddesc_type 3`). The remaining variants select the
/// compound scanners.
pub enum FieldDesc {
    /// No managed fields.
    None,
    /// Word-index offset tables into the payload, by width.
    Ptr8(&'static [u8]),
    Ptr16(&'static [u16]),
    Ptr32(&'static [u32]),
    /// Inline vector of values; payload is `ObjVec` followed by the slots.
    ObjVec,
    /// Array with a separate buffer; payload is `Array`.
    Array,
    /// Variable-sized byte string, no pointers; payload is `GcString`.
    String,
    /// Weak reference; the referent slot is *not* scanned.
    Weak,
    /// Task; payload starts with `Task`, managed fields at the offsets.
    Task { offsets: &'static [u8] },
    /// Module with a binding hash table; payload is `Module`.
    Module,
    /// Type-supplied mark function. Returns the number of young objects
    /// the value references so the caller can preserve the barrier
    /// invariant for old parents.
    Dynamic(unsafe fn(&mut Marker, *mut Value) -> usize),
}

/// Inline vector payload: length word, then `len` value slots.
#[repr(C)]
pub struct ObjVec {
    pub len: usize,
}

impl ObjVec {
    #[inline]
    pub unsafe fn data(this: *mut ObjVec) -> *mut *mut Value {
        this.add(1).cast()
    }
}

/// How an `Array`'s buffer is owned.
pub const ARRAY_INLINE: u8 = 0;
/// Buffer is a separate GC-managed buffer.
pub const ARRAY_BUFFERED: u8 = 1;
/// Buffer came from `managed_malloc` and is freed by the sweep when the
/// array dies.
pub const ARRAY_MALLOC: u8 = 2;
/// Buffer belongs to another array (`owner`).
pub const ARRAY_OWNED: u8 = 3;

/// Array payload. `elsize` is in bytes; `ptrarray` means the elements are
/// bare value pointers, `hasptr` means the elements are inline structs whose
/// pointer offsets come from `eltype`.
#[repr(C)]
pub struct Array {
    pub data: *mut u8,
    pub len: usize,
    pub owner: *mut Value,
    pub eltype: *const TypeLayout,
    pub elsize: u16,
    pub how: u8,
    pub ptrarray: bool,
    pub hasptr: bool,
}

impl Array {
    #[inline]
    pub fn nbytes(&self) -> usize {
        self.elsize as usize * self.len
    }
}

/// A frame of the per-task GC shadow stack. `nroots >> 2` slots follow the
/// struct; bit 0 of `nroots` means the slots are indirect (`*mut *mut
/// Value`). A slot with its low bit set is a finalizer entry: the *next*
/// slot holds an unboxed C function pointer and must be skipped.
#[repr(C)]
pub struct GcFrame {
    pub nroots: usize,
    pub prev: *mut GcFrame,
}

impl GcFrame {
    #[inline]
    pub unsafe fn roots(this: *mut GcFrame) -> *mut *mut Value {
        this.add(1).cast()
    }
}

/// Exception stack buffer. `reserved_size` words of data follow; `top` is
/// the index one past the newest record. A record is laid out as
/// `[elements..., element_count, exception]`; an element with its low bit
/// set is a native frame (instruction pointer), otherwise it is a managed
/// value.
#[repr(C)]
pub struct ExcStack {
    pub top: usize,
    pub reserved_size: usize,
}

impl ExcStack {
    #[inline]
    pub unsafe fn data(this: *mut ExcStack) -> *mut usize {
        this.add(1).cast()
    }
}

/// Task payload header; runtime-specific managed fields follow and are
/// described by `FieldDesc::Task { offsets }`.
#[repr(C)]
pub struct Task {
    pub gcstack: *mut GcFrame,
    /// `ExcStack` gc buffer, or null.
    pub excstack: *mut Value,
    /// Copied stack buffer (gc buffer), or null.
    pub stkbuf: *mut Value,
    pub bufsz: usize,
}

/// Built-in layout for weak references created by `alloc_weakref`.
pub static WEAK_REF_LAYOUT: TypeLayout = TypeLayout {
    size: std::mem::size_of::<crate::value::WeakRef>(),
    npointers: 1,
    name: "weakref",
    desc: FieldDesc::Weak,
    sweepfunc: None,
};

/// Built-in layout for managed strings.
pub static STRING_LAYOUT: TypeLayout = TypeLayout {
    size: 0,
    npointers: 0,
    name: "string",
    desc: FieldDesc::String,
    sweepfunc: None,
};

/// Layout for untyped gc buffers (array storage, exception stacks).
pub static BUFFER_LAYOUT: TypeLayout = TypeLayout {
    size: 0,
    npointers: 0,
    name: "buffer",
    desc: FieldDesc::None,
    sweepfunc: None,
};

/// Layout of the canonical undef sentinel that cleared weak references
/// point at.
pub static UNDEF_LAYOUT: TypeLayout = TypeLayout {
    size: 0,
    npointers: 0,
    name: "undef",
    desc: FieldDesc::None,
    sweepfunc: None,
};

/// Hash-table sentinel for absent bindings.
pub const HT_NOTFOUND: *mut Binding = 1 as *mut Binding;

/// A name binding. Bindings are allocated as tagged values so the write
/// barrier can re-tag them; their slots are scanned by the module scanner,
/// not through their own layout.
#[repr(C)]
pub struct Binding {
    pub value: AtomicPtr<Value>,
    pub globalref: AtomicPtr<Value>,
}

/// Module payload: an open-addressed table of `[key, binding]` pairs with
/// `HT_NOTFOUND` holes, the parent module, and the usings list.
#[repr(C)]
pub struct Module {
    pub bindings: *mut *mut Binding,
    pub bindings_size: usize,
    pub parent: *mut Value,
    pub usings: *mut *mut Value,
    pub usings_len: usize,
}
