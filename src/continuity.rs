//! Checking of continuity counters, independently of any section reassembly.
//!
//! A [`ContinuityAnalyzer`](struct.ContinuityAnalyzer.html) is fed the same packets as a
//! [`SectionDemux`](../demultiplex/struct.SectionDemux.html) would be, and reports packets
//! which don't carry the expected continuity counter value.

use crate::packet::{ContinuityCounter, Packet, Pid};
use fixedbitset::FixedBitSet;
use log::debug;

#[derive(Debug, Clone, Copy)]
struct PidState {
    first: ContinuityCounter,
    last: ContinuityCounter,
    /// the last packet repeated the counter of the one before
    duplicated: bool,
}

/// Tracks the continuity counter of each PID.
///
/// On packets carrying a payload, the counter must be one more than on the previous packet of
/// the same PID, except that a packet may be sent twice in a row.  Packets without payload must
/// repeat the counter of the previous packet.  A packet whose adaptation field has the
/// `discontinuity_indicator` set may carry any value.
#[derive(Debug)]
pub struct ContinuityAnalyzer {
    pid_filter: FixedBitSet,
    states: Vec<Option<PidState>>,
    packets: u64,
    errors: u64,
}

impl Default for ContinuityAnalyzer {
    fn default() -> ContinuityAnalyzer {
        let mut pid_filter = FixedBitSet::with_capacity(Pid::PID_COUNT);
        pid_filter.insert_range(..);
        ContinuityAnalyzer {
            pid_filter,
            states: Vec::new(),
            packets: 0,
            errors: 0,
        }
    }
}

impl ContinuityAnalyzer {
    /// An analyzer checking every PID.
    pub fn new() -> ContinuityAnalyzer {
        ContinuityAnalyzer::default()
    }

    /// Check only the given PIDs.  Whatever is known of other PIDs is forgotten.
    pub fn set_pid_filter<I: IntoIterator<Item = Pid>>(&mut self, pids: I) {
        self.pid_filter.clear();
        for pid in pids {
            self.pid_filter.insert(usize::from(pid));
        }
        for (i, state) in self.states.iter_mut().enumerate() {
            if !self.pid_filter.contains(i) {
                *state = None;
            }
        }
    }

    pub fn add_pid(&mut self, pid: Pid) {
        self.pid_filter.insert(usize::from(pid));
    }

    pub fn remove_pid(&mut self, pid: Pid) {
        self.pid_filter.set(usize::from(pid), false);
        self.reset_pid(pid);
    }

    pub fn reset(&mut self) {
        self.states.clear();
        self.packets = 0;
        self.errors = 0;
    }

    pub fn reset_pid(&mut self, pid: Pid) {
        if let Some(state) = self.states.get_mut(usize::from(pid)) {
            *state = None;
        }
    }

    /// The number of packets checked.
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// The number of packets with an unexpected continuity counter.
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// The counter of the first packet seen on the given PID.
    pub fn first_counter(&self, pid: Pid) -> Option<ContinuityCounter> {
        self.state(pid).map(|s| s.first)
    }

    /// The counter of the latest packet seen on the given PID.
    pub fn last_counter(&self, pid: Pid) -> Option<ContinuityCounter> {
        self.state(pid).map(|s| s.last)
    }

    fn state(&self, pid: Pid) -> Option<&PidState> {
        self.states.get(usize::from(pid)).and_then(|s| s.as_ref())
    }

    /// Check the continuity counter of the given packet, returning `false` if it shows a
    /// discontinuity.  Packets on PIDs not being checked, and null packets, are always accepted.
    pub fn feed(&mut self, pk: &Packet<'_>) -> bool {
        let pid = pk.pid();
        if pid == Pid::STUFFING || !self.pid_filter.contains(usize::from(pid)) {
            return true;
        }
        self.packets += 1;
        let cc = pk.continuity_counter();
        let i = usize::from(pid);
        if i >= self.states.len() {
            self.states.resize(i + 1, None);
        }
        let state = match self.states[i].as_mut() {
            Some(state) => state,
            None => {
                self.states[i] = Some(PidState {
                    first: cc,
                    last: cc,
                    duplicated: false,
                });
                return true;
            }
        };
        let ok = if pk
            .adaptation_field()
            .map(|af| af.discontinuity_indicator())
            .unwrap_or(false)
        {
            state.duplicated = false;
            true
        } else if !pk.has_payload() {
            cc == state.last
        } else if cc == state.last {
            let first_repeat = !state.duplicated;
            state.duplicated = true;
            first_repeat
        } else {
            state.duplicated = false;
            cc.follows(state.last)
        };
        if !ok {
            debug!(
                "{:?}: continuity counter {} after {}, packet {}",
                pid,
                cc.count(),
                state.last.count(),
                self.packets - 1
            );
            self.errors += 1;
        }
        state.last = cc;
        ok
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn packet(pid: u16, cc: u8, payload: bool) -> Vec<u8> {
        let mut buf = vec![0xffu8; Packet::SIZE];
        buf[0] = Packet::SYNC_BYTE;
        buf[1] = (pid >> 8) as u8;
        buf[2] = pid as u8;
        if payload {
            buf[3] = 0b0001_0000 | cc;
        } else {
            buf[3] = 0b0010_0000 | cc;
            buf[4] = 183;
            buf[5] = 0;
        }
        buf
    }

    fn feed(analyzer: &mut ContinuityAnalyzer, buf: &[u8]) -> bool {
        analyzer.feed(&Packet::new(buf))
    }

    #[test]
    fn in_sequence() {
        let mut a = ContinuityAnalyzer::new();
        for i in 0..40u8 {
            assert!(feed(&mut a, &packet(0x100, i & 0xf, true)));
        }
        assert_eq!(a.errors(), 0);
        assert_eq!(a.packets(), 40);
        assert_eq!(a.first_counter(Pid::new(0x100)), Some(ContinuityCounter::new(0)));
        assert_eq!(a.last_counter(Pid::new(0x100)), Some(ContinuityCounter::new(39 & 0xf)));
        assert_eq!(a.first_counter(Pid::new(0x101)), None);
    }

    #[test]
    fn gap() {
        let mut a = ContinuityAnalyzer::new();
        assert!(feed(&mut a, &packet(0x100, 4, true)));
        assert!(!feed(&mut a, &packet(0x100, 6, true)));
        assert!(feed(&mut a, &packet(0x100, 7, true)));
        assert_eq!(a.errors(), 1);
    }

    #[test]
    fn one_duplicate_allowed() {
        let mut a = ContinuityAnalyzer::new();
        assert!(feed(&mut a, &packet(0x100, 4, true)));
        assert!(feed(&mut a, &packet(0x100, 4, true)));
        assert!(!feed(&mut a, &packet(0x100, 4, true)));
        assert!(feed(&mut a, &packet(0x100, 5, true)));
        assert_eq!(a.errors(), 1);
    }

    #[test]
    fn adaptation_only_keeps_counter() {
        let mut a = ContinuityAnalyzer::new();
        assert!(feed(&mut a, &packet(0x100, 4, true)));
        assert!(feed(&mut a, &packet(0x100, 4, false)));
        assert!(!feed(&mut a, &packet(0x100, 5, false)));
        assert_eq!(a.errors(), 1);
    }

    #[test]
    fn discontinuity_indicator() {
        let mut a = ContinuityAnalyzer::new();
        assert!(feed(&mut a, &packet(0x100, 4, true)));
        let mut pk = packet(0x100, 11, true);
        pk[3] = 0b0011_0000 | 11;
        pk[4] = 1;
        pk[5] = 0b1000_0000;
        assert!(feed(&mut a, &pk));
        assert!(feed(&mut a, &packet(0x100, 12, true)));
        assert_eq!(a.errors(), 0);
    }

    #[test]
    fn null_packets_and_filter() {
        let mut a = ContinuityAnalyzer::new();
        assert!(feed(&mut a, &packet(0x1fff, 3, true)));
        assert!(feed(&mut a, &packet(0x1fff, 9, true)));
        assert_eq!(a.packets(), 0);

        a.set_pid_filter(vec![Pid::new(0x100)]);
        assert!(feed(&mut a, &packet(0x200, 0, true)));
        assert!(feed(&mut a, &packet(0x200, 5, true)));
        assert_eq!(a.errors(), 0);
        assert!(a.first_counter(Pid::new(0x200)).is_none());

        assert!(feed(&mut a, &packet(0x100, 0, true)));
        a.remove_pid(Pid::new(0x100));
        assert!(a.last_counter(Pid::new(0x100)).is_none());
    }
}
