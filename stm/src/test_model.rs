use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use object::{Header, ObjRef, align_object_size};
use parking_lot::Mutex;

use crate::error::StmResult;
use crate::model::ObjectModel;
use crate::settings::StmSettings;
use crate::stm::Stm;
use crate::thread::StmThread;

/// header | value: u64 | next: ObjRef
pub const NODE: u16 = 1;
pub const NODE_SIZE: usize = 24;
pub const VALUE: usize = 8;
pub const NEXT: usize = 16;

/// header | len: u64 | bytes[len]
pub const BLOB: u16 = 2;
/// header | len: u64 | refs[len]
pub const ARRAY: u16 = 3;
pub const LEN: usize = 8;
pub const ITEMS: usize = 16;

#[derive(Default, Clone)]
pub struct TestModel {
    pub light_finalized: Arc<AtomicUsize>,
    pub finalized: Arc<Mutex<Vec<u64>>>,
}

impl ObjectModel for TestModel {
    unsafe fn size_of(&self, obj: *const u8) -> usize {
        unsafe {
            let header = &*obj.cast::<Header>();
            let len = obj.add(LEN).cast::<u64>().read() as usize;
            match header.type_id() {
                NODE => NODE_SIZE,
                BLOB => align_object_size(ITEMS + len),
                ARRAY => ITEMS + 8 * len,
                t => panic!("unknown type {t}"),
            }
        }
    }

    unsafe fn trace(&self, obj: *mut u8, visit: &mut dyn FnMut(&mut ObjRef)) {
        unsafe {
            let header = &*obj.cast::<Header>();
            match header.type_id() {
                NODE => visit(&mut *obj.add(NEXT).cast::<ObjRef>()),
                ARRAY => {
                    let len = obj.add(LEN).cast::<u64>().read() as usize;
                    for i in 0..len {
                        visit(&mut *obj.add(ITEMS + 8 * i).cast::<ObjRef>());
                    }
                }
                _ => {}
            }
        }
    }

    unsafe fn card_base_itemsize(&self, obj: *const u8) -> (usize, usize) {
        let header = unsafe { &*obj.cast::<Header>() };
        match header.type_id() {
            ARRAY => (ITEMS, 8),
            _ => (ITEMS, 1),
        }
    }

    unsafe fn light_finalizer(&self, _obj: *const u8) {
        self.light_finalized.fetch_add(1, Ordering::SeqCst);
    }

    fn finalizer(&self, thread: &mut StmThread, obj: ObjRef) -> StmResult<()> {
        let value = thread.read_word(obj, VALUE)?;
        self.finalized.lock().push(value);
        Ok(())
    }
}

pub fn small_settings() -> StmSettings {
    StmSettings {
        segments: 4,
        heap_size: 8 * 1024 * 1024,
        nursery_size: 64 * 1024,
        ..StmSettings::default()
    }
}

pub fn new_stm() -> (Stm, TestModel) {
    let _ = env_logger::builder().is_test(true).try_init();
    let model = TestModel::default();
    let stm = Stm::new(small_settings(), model.clone()).expect("stm");
    (stm, model)
}

pub fn node(thread: &mut StmThread, value: u64, next: ObjRef) -> StmResult<ObjRef> {
    thread.push_root(next);
    let obj = thread.allocate(NODE, NODE_SIZE)?;
    let next = thread.pop_root();
    thread.write_word(obj, VALUE, value)?;
    thread.write_ref(obj, NEXT, next)?;
    Ok(obj)
}

pub fn array(thread: &mut StmThread, len: usize) -> StmResult<ObjRef> {
    // len must be in place before anything asks for the size
    let obj = thread.allocate(ARRAY, ITEMS + 8 * len)?;
    thread.write_word(obj, LEN, len as u64)?;
    Ok(obj)
}

pub fn blob(thread: &mut StmThread, len: usize) -> StmResult<ObjRef> {
    let obj = thread.allocate(BLOB, ITEMS + len)?;
    thread.write_word(obj, LEN, len as u64)?;
    Ok(obj)
}

/// Commits a fresh node and leaves it rooted on the shadow stack.
pub fn committed_node(thread: &mut StmThread, value: u64) -> ObjRef {
    thread.atomically(|t, _| {
        let obj = node(t, value, ObjRef::NULL)?;
        t.push_root(obj);
        Ok(())
    });
    thread.peek_root(0)
}
