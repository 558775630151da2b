/// What the contention manager needs to know about one side of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Contender {
    pub segment: usize,
    pub start_rev: u64,
    pub inevitable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Loser {
    Committer,
    Other,
}

/// Decides which transaction aborts when `committer` is about to publish a
/// write to something `other` has read.
///
/// An inevitable transaction always wins. Otherwise the one that started at
/// the lower revision wins, ties broken by the lower segment number.
pub(crate) fn resolve(committer: Contender, other: Contender) -> Loser {
    assert!(
        !(committer.inevitable && other.inevitable),
        "segments {} and {} are both inevitable",
        committer.segment,
        other.segment
    );
    if committer.inevitable {
        return Loser::Other;
    }
    if other.inevitable {
        return Loser::Committer;
    }
    if (committer.start_rev, committer.segment) < (other.start_rev, other.segment) {
        Loser::Other
    } else {
        Loser::Committer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(segment: usize, start_rev: u64, inevitable: bool) -> Contender {
        Contender {
            segment,
            start_rev,
            inevitable,
        }
    }

    #[test]
    fn older_transaction_wins() {
        assert_eq!(resolve(c(1, 3, false), c(2, 7, false)), Loser::Other);
        assert_eq!(resolve(c(2, 7, false), c(1, 3, false)), Loser::Committer);
    }

    #[test]
    fn ties_go_to_lower_segment() {
        assert_eq!(resolve(c(1, 5, false), c(3, 5, false)), Loser::Other);
        assert_eq!(resolve(c(3, 5, false), c(1, 5, false)), Loser::Committer);
    }

    #[test]
    fn inevitable_always_wins() {
        assert_eq!(resolve(c(4, 9, true), c(1, 0, false)), Loser::Other);
        assert_eq!(resolve(c(1, 0, false), c(4, 9, true)), Loser::Committer);
    }

    #[test]
    #[should_panic(expected = "both inevitable")]
    fn two_inevitable_is_fatal() {
        resolve(c(1, 0, true), c(2, 0, true));
    }
}
