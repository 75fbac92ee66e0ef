use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::rtp::Ssrc;
use crate::util::Soonest;

// Watchdog before an unanswered request is re-emitted.
const RETRY_DELAY: Duration = Duration::from_secs(2);

// Re-emissions before giving up until the next explicit request.
const MAX_RETRIES: u8 = 2;

/// Debounces and retries keyframe requests per SSRC.
///
/// At most one request is outstanding per SSRC. An unanswered request is
/// retried after two seconds, at most twice; after that the state is
/// cleared and only a new explicit request starts over.
#[derive(Debug, Default)]
pub struct KeyFrameRequestManager {
    pending: HashMap<Ssrc, Pending>,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    retries_left: u8,
    deadline: Instant,
}

impl KeyFrameRequestManager {
    pub fn new() -> Self {
        KeyFrameRequestManager::default()
    }

    /// Register the need for a keyframe on `ssrc`.
    ///
    /// Returns true when a request should be emitted now. False means one
    /// is already outstanding.
    pub fn key_frame_needed(&mut self, now: Instant, ssrc: Ssrc) -> bool {
        if self.pending.contains_key(&ssrc) {
            return false;
        }

        self.pending.insert(
            ssrc,
            Pending {
                retries_left: MAX_RETRIES,
                deadline: now + RETRY_DELAY,
            },
        );

        true
    }

    /// A keyframe arrived on `ssrc`; the outstanding request is satisfied.
    pub fn key_frame_received(&mut self, ssrc: Ssrc) {
        self.pending.remove(&ssrc);
    }

    /// Forget all state for `ssrc` (stream going away).
    pub fn remove_ssrc(&mut self, ssrc: Ssrc) {
        self.pending.remove(&ssrc);
    }

    /// The next watchdog deadline, if any.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.pending
            .values()
            .fold(None, |acc, p| acc.soonest(Some(p.deadline)))
    }

    /// Fire due watchdogs. Returns the SSRCs to re-request.
    pub fn handle_timeout(&mut self, now: Instant) -> Vec<Ssrc> {
        let mut retry = vec![];

        self.pending.retain(|ssrc, p| {
            if now < p.deadline {
                return true;
            }

            if p.retries_left == 0 {
                debug!("Giving up keyframe request for ssrc: {}", ssrc);
                return false;
            }

            p.retries_left -= 1;
            p.deadline = now + RETRY_DELAY;
            retry.push(*ssrc);
            true
        });

        retry
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_request_emits() {
        let now = Instant::now();
        let mut mgr = KeyFrameRequestManager::new();

        assert!(mgr.key_frame_needed(now, 1111.into()));
    }

    #[test]
    fn duplicate_requests_are_debounced() {
        let now = Instant::now();
        let mut mgr = KeyFrameRequestManager::new();

        assert!(mgr.key_frame_needed(now, 1111.into()));
        assert!(!mgr.key_frame_needed(now, 1111.into()));
        assert!(!mgr.key_frame_needed(now, 1111.into()));

        // A different SSRC is independent.
        assert!(mgr.key_frame_needed(now, 2222.into()));
    }

    #[test]
    fn unanswered_request_retries_twice_then_gives_up() {
        let now = Instant::now();
        let mut mgr = KeyFrameRequestManager::new();

        mgr.key_frame_needed(now, 1111.into());

        // First watchdog.
        let deadline = mgr.poll_timeout().unwrap();
        assert_eq!(deadline, now + RETRY_DELAY);
        let retries = mgr.handle_timeout(deadline);
        assert_eq!(retries, vec![1111.into()]);

        // Second watchdog.
        let deadline = mgr.poll_timeout().unwrap();
        let retries = mgr.handle_timeout(deadline);
        assert_eq!(retries, vec![1111.into()]);

        // Out of retries.
        let deadline = mgr.poll_timeout().unwrap();
        let retries = mgr.handle_timeout(deadline);
        assert!(retries.is_empty());
        assert!(mgr.poll_timeout().is_none());

        // A new explicit request starts over.
        assert!(mgr.key_frame_needed(now, 1111.into()));
    }

    #[test]
    fn received_keyframe_stops_the_watchdog() {
        let now = Instant::now();
        let mut mgr = KeyFrameRequestManager::new();

        mgr.key_frame_needed(now, 1111.into());
        mgr.key_frame_received(1111.into());

        assert!(mgr.poll_timeout().is_none());
        assert!(mgr.handle_timeout(now + RETRY_DELAY).is_empty());
    }
}
