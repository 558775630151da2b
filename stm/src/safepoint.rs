use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

// ── Collection word ───────────────────────────────────────────────────

/// Decoded view of the collection word.
///
/// Layout: bit 0 is set while a major collection runs, bits 1..32 hold its
/// generation, the high half counts threads inside a transaction. Those
/// threads are the parties of the rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub collecting: bool,
    pub generation: u32,
    pub in_transaction: u32,
}

impl Snapshot {
    const GENERATIONS: u32 = 1 << 31;

    fn encode(self) -> u64 {
        debug_assert!(self.generation < Self::GENERATIONS);
        self.collecting as u64 | (self.generation as u64) << 1 | (self.in_transaction as u64) << 32
    }

    fn decode(word: u64) -> Self {
        Self {
            collecting: word & 1 == 1,
            generation: (word as u32) >> 1,
            in_transaction: (word >> 32) as u32,
        }
    }

    fn next_generation(self) -> u32 {
        (self.generation + 1) % Self::GENERATIONS
    }
}

/// A won election: the caller coordinates collection `generation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Election {
    pub generation: u32,
    pub participants: u32,
}

#[derive(Debug, Default)]
pub(crate) struct CollectionState(AtomicU64);

impl CollectionState {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::decode(self.0.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn collecting(&self) -> bool {
        self.0.load(Ordering::Acquire) & 1 == 1
    }

    /// Applies `f` atomically; `None` leaves the word alone and fails.
    fn update(&self, mut f: impl FnMut(Snapshot) -> Option<Snapshot>) -> Result<Snapshot, Snapshot> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                f(Snapshot::decode(word)).map(Snapshot::encode)
            })
            .map(Snapshot::decode)
            .map_err(Snapshot::decode)
    }

    /// Counts the caller as inside a transaction. Blocks while a
    /// collection runs.
    pub fn enter_transaction(&self) {
        while self
            .update(|s| {
                (!s.collecting).then_some(Snapshot {
                    in_transaction: s.in_transaction + 1,
                    ..s
                })
            })
            .is_err()
        {
            std::thread::yield_now();
        }
    }

    /// Fails while a collection runs, since the caller is one of its
    /// parties.
    pub fn try_leave_transaction(&self) -> bool {
        self.update(|s| {
            (!s.collecting).then(|| Snapshot {
                in_transaction: s.in_transaction - 1,
                ..s
            })
        })
        .is_ok()
    }

    /// `None` when another collection is already running.
    pub fn try_start(&self) -> Option<Election> {
        self.update(|s| {
            (!s.collecting).then(|| Snapshot {
                collecting: true,
                generation: s.next_generation(),
                ..s
            })
        })
        .ok()
        .map(|prev| Election {
            generation: prev.next_generation(),
            participants: prev.in_transaction,
        })
    }

    /// Called by the coordinator once every party is past the last
    /// barrier of `generation`.
    pub fn finish(&self, generation: u32) {
        let finished = self.update(|s| {
            (s.collecting && s.generation == generation).then_some(Snapshot {
                collecting: false,
                ..s
            })
        });
        debug_assert!(finished.is_ok(), "collection {generation} is not running");
    }

    /// Parks a party of `generation` until the coordinator released it.
    /// Returning earlier would let the party join the same collection twice.
    pub fn wait_for_end(&self, generation: u32) {
        loop {
            let s = self.snapshot();
            if !s.collecting || s.generation != generation {
                return;
            }
            std::thread::yield_now();
        }
    }
}

// ── Rendezvous barrier ────────────────────────────────────────────────

/// Reusable sleeping barrier. The party size is given per round because
/// it is only known once a collection has started.
#[derive(Debug, Default)]
pub(crate) struct SenseBarrier {
    /// (threads arrived this round, rounds completed)
    round: Mutex<(usize, u64)>,
    released: Condvar,
}

impl SenseBarrier {
    /// Blocks until `parties` threads have arrived in this round.
    pub fn wait(&self, parties: usize) {
        let mut round = self.round.lock();
        let current = round.1;
        round.0 += 1;
        if round.0 == parties {
            *round = (0, current.wrapping_add(1));
            self.released.notify_all();
            return;
        }
        while round.1 == current {
            self.released.wait(&mut round);
        }
    }
}

/// Everything the major collection rendezvous synchronizes on.
#[derive(Debug, Default)]
pub(crate) struct SyncState {
    pub state: CollectionState,
    pub barrier: SenseBarrier,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    #[test]
    fn snapshot_encoding() {
        let s = Snapshot {
            collecting: true,
            generation: Snapshot::GENERATIONS - 1,
            in_transaction: 77,
        };
        assert_eq!(Snapshot::decode(s.encode()), s);
        assert_eq!(s.next_generation(), 0);
    }

    #[test]
    fn election_lifecycle() {
        let state = CollectionState::default();
        state.enter_transaction();
        state.enter_transaction();

        let election = state.try_start().unwrap();
        assert_eq!(
            election,
            Election {
                generation: 1,
                participants: 2
            }
        );
        assert!(state.collecting());

        // second election loses, cannot leave while collecting
        assert!(state.try_start().is_none());
        assert!(!state.try_leave_transaction());

        state.finish(election.generation);
        assert!(!state.collecting());
        assert!(state.try_leave_transaction());
        assert!(state.try_leave_transaction());
        assert_eq!(state.snapshot().in_transaction, 0);
        assert_eq!(state.snapshot().generation, 1);
    }

    #[test]
    fn parties_are_released_before_the_next_generation() {
        let state = Arc::new(CollectionState::default());
        state.enter_transaction();
        state.enter_transaction();
        let first = state.try_start().unwrap();

        let party = {
            let state = state.clone();
            thread::spawn(move || {
                state.wait_for_end(first.generation);
                // a fresh election is possible once released
                state.try_start()
            })
        };

        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!party.is_finished());
        state.finish(first.generation);

        let second = party.join().unwrap().unwrap();
        assert_eq!(second.generation, first.generation + 1);
        assert_eq!(second.participants, 2);
        // an old generation never blocks
        state.wait_for_end(first.generation);
    }

    #[test]
    fn barrier_releases_all_rounds() {
        let barrier = Arc::new(SenseBarrier::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for round in 1..=3 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        barrier.wait(4);
                        assert!(counter.load(Ordering::SeqCst) >= round * 4);
                        barrier.wait(4);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 12);
    }
}
