use ahash::AHashSet;
use object::ObjRef;

use super::major::Marker;
use crate::thread::StmThread;

/// Picks the unreachable finalizable objects whose finalizers may run now.
///
/// An object that is reachable from another unreachable finalizable object
/// waits for a later cycle, so finalizers see their referents intact. A
/// cycle of such objects is released all at once. Every unreachable
/// candidate is marked again, with everything it references.
pub(super) fn order_finalizers(marker: &mut Marker<'_>, registered: &mut Vec<ObjRef>) -> Vec<ObjRef> {
    let candidates: Vec<ObjRef> = registered
        .iter()
        .copied()
        .filter(|&obj| !marker.is_marked(obj))
        .collect();
    if candidates.is_empty() {
        return candidates;
    }
    let candidate_set: AHashSet<ObjRef> = candidates.iter().copied().collect();

    let mut deferred = AHashSet::new();
    for &root in &candidates {
        let mut visited = AHashSet::new();
        let mut stack = marker.children(root);
        while let Some(obj) = stack.pop() {
            if marker.is_marked(obj) || !visited.insert(obj) {
                continue;
            }
            if obj != root && candidate_set.contains(&obj) {
                deferred.insert(obj);
            }
            stack.extend(marker.children(obj));
        }
    }

    let mut ready: Vec<ObjRef> = candidates
        .iter()
        .copied()
        .filter(|obj| !deferred.contains(obj))
        .collect();
    if ready.is_empty() {
        ready = candidates.clone();
    }

    for &obj in &candidates {
        marker.mark(obj);
    }
    marker.drain();

    let ready_set: AHashSet<ObjRef> = ready.iter().copied().collect();
    registered.retain(|obj| !ready_set.contains(obj));
    ready
}

impl StmThread {
    /// Runs queued finalizers, each in its own inevitable transaction.
    pub(crate) fn run_pending_finalizers(&mut self) {
        if self.running_finalizers {
            return;
        }
        self.running_finalizers = true;
        loop {
            let next = self.with_local(|stm, local| {
                let next = stm.gc_tables.lock().pending_finalizers.pop_front();
                // rooted before the next collection can look
                if let Some(obj) = next {
                    local.shadow_stack.push(obj);
                }
                next
            });
            let Some(obj) = next else {
                break;
            };
            log::trace!("segment {}: finalizing {obj:?}", self.segment);
            let stm = self.stm.clone();
            self.atomically(|thread, _| {
                thread.become_inevitable()?;
                stm.model.finalizer(thread, obj)
            });
            self.pop_root();
        }
        self.running_finalizers = false;
    }
}
