//! Software transactional memory over a segmented, garbage-collected heap.
//!
//! Every registered thread owns a segment: a private view of the whole
//! logical heap. Transactions read and write through barriers on
//! [`StmThread`], publish their changes to a global commit log, and are
//! validated against the commits of other segments. Young objects live in
//! a per-segment nursery; a stop-the-world major collection reclaims old
//! space.

mod alloc;
mod barrier;
mod cards;
mod commit_log;
mod contention;
mod error;
mod gc;
mod model;
mod safepoint;
mod segment;
mod settings;
mod stm;
mod system;
mod thread;
mod timing;
mod transaction;

pub use commit_log::{CommitEntry, WrittenRange};
pub use error::{Abort, AbortReason, StmError, StmResult};
pub use model::ObjectModel;
pub use object::{
    GcFlags, HEADER_SIZE, Header, MIN_OBJECT_SIZE, OBJECT_ALIGN, ObjRef, WEAKREF_SIZE,
    WEAKREF_TYPE_ID, align_object_size,
};
pub use segment::{PageState, SHARING_SEGMENT};
pub use settings::{ConfigError, MAX_SEGMENTS, StmSettings};
pub use stm::{Stm, StmInner};
pub use system::OS_PAGE_SIZE;
pub use thread::{StmThread, TxState};
pub use timing::{StmStats, ThreadStats, TimingCallback, TimingEvent};

#[cfg(test)]
pub(crate) mod test_model;
