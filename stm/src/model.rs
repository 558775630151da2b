use object::{HEADER_SIZE, Header, ObjRef, WEAKREF_SIZE};

use crate::error::StmResult;
use crate::thread::StmThread;

/// Client hooks describing the layout of heap objects.
///
/// Every object starts with a [`Header`]. Reference fields must be 8-byte
/// aligned [`ObjRef`]s. The engine never interprets anything past the header
/// on its own; it asks the model instead.
///
/// Weak references (type id [`object::WEAKREF_TYPE_ID`]) are handled by the
/// engine and never reach the model.
pub trait ObjectModel: Send + Sync + 'static {
    /// Total size of the object in bytes, header included.
    ///
    /// # Safety
    /// `obj` points at the header of an initialised object. The size must be
    /// derivable from the first page of the object.
    unsafe fn size_of(&self, obj: *const u8) -> usize;

    /// Calls `visit` once for every reference field of the object. The
    /// visitor may rewrite the reference in place.
    ///
    /// # Safety
    /// `obj` points at the header of an initialised object that may be
    /// written through.
    unsafe fn trace(&self, obj: *mut u8, visit: &mut dyn FnMut(&mut ObjRef));

    /// `(base_offset, item_size)` used to turn an item index into a byte
    /// offset for card marking.
    ///
    /// # Safety
    /// `obj` points at the header of an initialised object.
    unsafe fn card_base_itemsize(&self, _obj: *const u8) -> (usize, usize) {
        (HEADER_SIZE, 1)
    }

    /// Runs when an object with a light finalizer dies. Must not allocate or
    /// touch other objects.
    ///
    /// # Safety
    /// `obj` points at the dead object's bytes, valid only for this call.
    unsafe fn light_finalizer(&self, _obj: *const u8) {}

    /// Runs in its own transaction after the object became unreachable.
    fn finalizer(&self, _thread: &mut StmThread, _obj: ObjRef) -> StmResult<()> {
        Ok(())
    }
}

/// # Safety
/// `obj` points at an initialised object header.
#[inline]
pub(crate) unsafe fn object_size(model: &dyn ObjectModel, obj: *const u8) -> usize {
    // SAFETY: header is the first field of every object
    let header = unsafe { &*obj.cast::<Header>() };
    if header.is_weakref() {
        WEAKREF_SIZE
    } else {
        // SAFETY: contract forwarded
        unsafe { model.size_of(obj) }
    }
}

/// Strong references only, weakref targets are skipped.
///
/// # Safety
/// `obj` points at an initialised, writable object header.
#[inline]
pub(crate) unsafe fn trace_object(
    model: &dyn ObjectModel,
    obj: *mut u8,
    visit: &mut dyn FnMut(&mut ObjRef),
) {
    // SAFETY: header is the first field of every object
    let header = unsafe { &*obj.cast::<Header>() };
    if !header.is_weakref() {
        // SAFETY: contract forwarded
        unsafe { model.trace(obj, visit) };
    }
}

/// # Safety
/// `obj` points at a weakref object.
#[inline(always)]
pub(crate) unsafe fn weakref_target(obj: *mut u8) -> *mut ObjRef {
    // SAFETY: weakrefs are header + one reference
    unsafe { obj.add(HEADER_SIZE).cast::<ObjRef>() }
}
