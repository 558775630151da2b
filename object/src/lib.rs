mod header;
mod objref;

pub use header::{
    GcFlags, HEADER_SIZE, Header, MIN_OBJECT_SIZE, OBJECT_ALIGN,
    WEAKREF_SIZE, WEAKREF_TYPE_ID, align_object_size,
};
pub use objref::ObjRef;
