use std::time::Instant;

use crate::device::BdAddr;

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub(crate) enum Timer {
    /// When to give up on a pending signalling or audio transition
    Connect = 0,
    /// When to answer ERROR to a peer-initiated dial that telephony never confirmed
    DialingOut = 1,
    /// When to answer ERROR to a remote voice-recognition start that was never confirmed locally
    StartVr = 2,
    /// When to emit the CLCC list terminator if telephony stops streaming entries
    ClccResponse = 3,
}

impl Timer {
    pub(crate) const VALUES: [Self; 4] = [
        Self::Connect,
        Self::DialingOut,
        Self::StartVr,
        Self::ClccResponse,
    ];
}

/// A table of deadlines associated with each distinct kind of `Timer`.
///
/// Every entry records the peer it was armed for, so an expiration can be
/// matched against the machine's own peer and stale timers from an earlier
/// session dropped.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<(Instant, BdAddr)>; 4],
}

impl TimerTable {
    pub(crate) fn set(&mut self, timer: Timer, deadline: Instant, peer: BdAddr) {
        self.data[timer as usize] = Some((deadline, peer));
    }

    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self.data[timer as usize].map(|(t, _)| t)
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|x| x.map(|(t, _)| t)).min()
    }

    /// Remove and return every timer whose deadline has passed.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(Timer, BdAddr)> {
        let mut expired = Vec::new();
        for timer in Timer::VALUES {
            if let Some((deadline, peer)) = self.data[timer as usize] {
                if deadline <= now {
                    self.data[timer as usize] = None;
                    expired.push((timer, peer));
                }
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_next_timeout_is_earliest_deadline() {
        let now = Instant::now();
        let peer = BdAddr::ANY;
        let mut table = TimerTable::default();
        assert_eq!(table.next_timeout(), None);

        table.set(Timer::Connect, now + Duration::from_secs(30), peer);
        table.set(Timer::StartVr, now + Duration::from_secs(5), peer);
        assert_eq!(table.next_timeout(), Some(now + Duration::from_secs(5)));

        table.stop(Timer::StartVr);
        assert_eq!(table.next_timeout(), Some(now + Duration::from_secs(30)));
    }

    #[test]
    fn test_take_expired_removes_only_due_timers() {
        let now = Instant::now();
        let peer = BdAddr([1; 6]);
        let mut table = TimerTable::default();
        table.set(Timer::Connect, now + Duration::from_secs(30), peer);
        table.set(Timer::DialingOut, now, peer);

        let expired = table.take_expired(now);
        assert_eq!(expired, vec![(Timer::DialingOut, peer)]);
        assert_eq!(table.get(Timer::DialingOut), None);
        assert!(table.get(Timer::Connect).is_some());
    }

    #[test]
    fn test_set_replaces_existing_deadline() {
        let now = Instant::now();
        let peer = BdAddr::ANY;
        let mut table = TimerTable::default();
        table.set(Timer::Connect, now + Duration::from_secs(30), peer);
        table.set(Timer::Connect, now + Duration::from_secs(1), peer);
        assert_eq!(table.get(Timer::Connect), Some(now + Duration::from_secs(1)));
    }
}
