#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use stm::{Header, ObjRef, ObjectModel, Stm, StmResult, StmSettings, StmThread, align_object_size};

pub const NODE: u16 = 1;
pub const NODE_SIZE: usize = 24;
pub const VALUE: usize = 8;
pub const NEXT: usize = 16;

pub const ARRAY: u16 = 3;
pub const LEN: usize = 8;
pub const ITEMS: usize = 16;

/// Nodes and reference arrays, recording every finalizer call.
#[derive(Default, Clone)]
pub struct Model {
    pub light_finalized: Arc<AtomicUsize>,
    pub finalized: Arc<Mutex<Vec<u64>>>,
}

impl ObjectModel for Model {
    unsafe fn size_of(&self, obj: *const u8) -> usize {
        unsafe {
            match (*obj.cast::<Header>()).type_id() {
                NODE => NODE_SIZE,
                ARRAY => align_object_size(ITEMS + 8 * obj.add(LEN).cast::<u64>().read() as usize),
                t => panic!("unknown type {t}"),
            }
        }
    }

    unsafe fn trace(&self, obj: *mut u8, visit: &mut dyn FnMut(&mut ObjRef)) {
        unsafe {
            match (*obj.cast::<Header>()).type_id() {
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

    unsafe fn card_base_itemsize(&self, _obj: *const u8) -> (usize, usize) {
        (ITEMS, 8)
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

pub fn settings() -> StmSettings {
    StmSettings {
        segments: 4,
        heap_size: 16 * 1024 * 1024,
        nursery_size: 64 * 1024,
        ..StmSettings::default()
    }
}

pub fn setup(settings: StmSettings) -> (Stm, Model) {
    let _ = env_logger::builder().is_test(true).try_init();
    let model = Model::default();
    let stm = Stm::new(settings, model.clone()).expect("valid settings");
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
    let obj = thread.allocate(ARRAY, ITEMS + 8 * len)?;
    thread.write_word(obj, LEN, len as u64)?;
    Ok(obj)
}

/// Runs `f` in a committed transaction and returns the object it leaves on
/// top of the shadow stack, which stays rooted.
pub fn commit_rooted(
    thread: &mut StmThread,
    mut f: impl FnMut(&mut StmThread) -> StmResult<ObjRef>,
) -> ObjRef {
    thread.atomically(|t, _| {
        let obj = f(t)?;
        t.push_root(obj);
        Ok(())
    });
    thread.peek_root(0)
}

pub fn list_values(thread: &mut StmThread, head: ObjRef) -> Vec<u64> {
    thread.atomically(|t, _| {
        let mut values = Vec::new();
        let mut cursor = head;
        while !cursor.is_null() {
            values.push(t.read_word(cursor, VALUE)?);
            cursor = t.read_ref(cursor, NEXT)?;
        }
        Ok(values)
    })
}

/// LCG step, returns a roll in `0..100`.
pub fn next_rand(seed: &mut u64) -> u64 {
    *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    (*seed >> 32) % 100
}
