use std::collections::BTreeSet;

use crate::rtp::extend_u16;

// Dropped entries older than this relative to the newest input are
// forgotten. Far outside any plausible reorder window.
const DROP_RETENTION: u64 = 10_000;

/// Rewrites an input sequence-number space into a gapless output space.
///
/// Consumers forward a subset of a producer's packets (pause windows,
/// non-selected simulcast layers). Every input packet is either mapped
/// via [`input`][SeqManager::input] or consumed via
/// [`drop`][SeqManager::drop]; the output numbering then advances only
/// for mapped packets, so the egress stream has no holes of its own
/// making while preserving the gaps that were real losses.
///
/// Retransmitted inputs map to the same output they were first given.
#[derive(Debug, Default)]
pub struct SeqManager {
    /// Widened newest input, for rollover tracking.
    last_ext: Option<u64>,
    /// output = input_ext + offset - dropped_before(input_ext).
    offset: i64,
    /// Widened inputs consumed without output.
    dropped: BTreeSet<u64>,
    /// Highest output produced so far.
    max_output: Option<u64>,
}

impl SeqManager {
    pub fn new() -> Self {
        SeqManager::default()
    }

    /// Map an input sequence number to the output space.
    ///
    /// The returned value is the widened output sequence; its lower 16
    /// bits go on the wire.
    pub fn input(&mut self, seq: u16) -> u64 {
        let ext = self.extend(seq);

        let dropped_before = self.dropped.range(..ext).count() as i64;
        let out = (ext as i64 + self.offset - dropped_before) as u64;

        if self.max_output.map(|m| out > m).unwrap_or(true) {
            self.max_output = Some(out);
        }

        self.prune(ext);

        out
    }

    /// Consume an input sequence number without producing output.
    ///
    /// Subsequent inputs shift down so the output stays gapless.
    pub fn drop(&mut self, seq: u16) {
        let ext = self.extend(seq);
        self.dropped.insert(ext);
        self.prune(ext);
    }

    /// Re-anchor so the next input continues right after the current
    /// maximum output. Used when switching simulcast layers, where the
    /// input space changes entirely.
    pub fn sync(&mut self, seq: u16) {
        let ext = self.extend(seq);
        let next_out = self.max_output.map(|m| m + 1).unwrap_or(0);
        self.offset = next_out as i64 - ext as i64;
        self.dropped.clear();
    }

    fn extend(&mut self, seq: u16) -> u64 {
        let ext = extend_u16(self.last_ext, seq);
        if self.last_ext.map(|l| ext > l).unwrap_or(true) {
            self.last_ext = Some(ext);
        }
        ext
    }

    // Forget old dropped entries, folding their count into the offset so
    // mappings at and above the horizon are unaffected.
    fn prune(&mut self, newest: u64) {
        let horizon = newest.saturating_sub(DROP_RETENTION);
        let keep = self.dropped.split_off(&horizon);
        let pruned = self.dropped.len();
        if pruned > 0 {
            self.offset -= pruned as i64;
        }
        self.dropped = keep;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_when_nothing_dropped() {
        let mut sm = SeqManager::new();
        assert_eq!(sm.input(100), 100);
        assert_eq!(sm.input(101), 101);
        assert_eq!(sm.input(102), 102);
    }

    #[test]
    fn drops_compact_the_output() {
        let mut sm = SeqManager::new();
        assert_eq!(sm.input(100), 100);
        sm.drop(101);
        sm.drop(102);
        assert_eq!(sm.input(103), 101);
        assert_eq!(sm.input(104), 102);
    }

    #[test]
    fn real_losses_stay_gaps() {
        let mut sm = SeqManager::new();
        assert_eq!(sm.input(100), 100);
        // 101 was lost on the wire: not dropped, not input.
        assert_eq!(sm.input(102), 102);
    }

    #[test]
    fn retransmission_maps_to_same_output() {
        let mut sm = SeqManager::new();
        assert_eq!(sm.input(100), 100);
        sm.drop(101);
        assert_eq!(sm.input(102), 101);
        // 102 again (RTX): same answer.
        assert_eq!(sm.input(102), 101);
        // Late 100 (RTX): still 100.
        assert_eq!(sm.input(100), 100);
    }

    #[test]
    fn output_is_monotonic_across_wraparound() {
        let mut sm = SeqManager::new();

        let mut prev: Option<u64> = None;
        let mut dropping = false;

        for i in 0u64..200_000 {
            let seq = (65_000 + i) as u16;

            // Drop stretches of input.
            if i % 1000 == 0 {
                dropping = !dropping;
            }

            if dropping {
                sm.drop(seq);
                continue;
            }

            let out = sm.input(seq);
            if let Some(p) = prev {
                assert!(
                    out > p && out - p < 0x8000,
                    "output not monotonic: {} -> {}",
                    p,
                    out
                );
            }
            prev = Some(out);
        }
    }

    #[test]
    fn sync_continues_after_max_output() {
        let mut sm = SeqManager::new();
        assert_eq!(sm.input(100), 100);
        assert_eq!(sm.input(101), 101);

        // Layer switch: new input space starting at 5000.
        sm.sync(5000);
        assert_eq!(sm.input(5000), 102);
        assert_eq!(sm.input(5001), 103);
    }

    #[test]
    fn drops_then_sync_then_drops() {
        let mut sm = SeqManager::new();
        assert_eq!(sm.input(10), 10);
        sm.drop(11);
        sm.drop(12);
        assert_eq!(sm.input(13), 11);

        sm.sync(1000);
        assert_eq!(sm.input(1000), 12);
        sm.drop(1001);
        assert_eq!(sm.input(1002), 13);
    }
}
