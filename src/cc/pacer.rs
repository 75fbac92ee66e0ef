use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::rtp::RtpPacket;

// Drain cadence.
const PROCESS_INTERVAL: Duration = Duration::from_millis(5);

// Debt above one burst worth of bytes blocks sending.
const BURST_WINDOW: Duration = Duration::from_millis(40);

// Debt is capped so a long stall cannot block forever.
const MAX_DEBT_WINDOW: Duration = Duration::from_millis(500);

/// Leaky bucket pacer.
///
/// Queued packets drain at the rate set by the congestion controller.
/// Each sent packet adds its size as debt; debt decays with time at the
/// pacing rate, and sending stops while debt exceeds one burst window.
#[derive(Debug)]
pub struct Pacer {
    rate_bps: u64,
    queue: VecDeque<RtpPacket>,
    debt_bytes: f64,
    last_process: Option<Instant>,
}

impl Pacer {
    pub fn new(initial_rate_bps: u64) -> Pacer {
        Pacer {
            rate_bps: initial_rate_bps.max(1),
            queue: VecDeque::new(),
            debt_bytes: 0.0,
            last_process: None,
        }
    }

    /// Update the pacing rate.
    pub fn set_pacing_rate(&mut self, rate_bps: u64) {
        self.rate_bps = rate_bps.max(1);
    }

    /// Queue a packet for paced sending.
    pub fn enqueue(&mut self, packet: RtpPacket) {
        self.queue.push_back(packet);
    }

    /// Number of packets waiting.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// When to call [`handle_timeout`][Pacer::handle_timeout] next.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.queue.is_empty() {
            return None;
        }
        // The clock anchors at the first poll_packet.
        self.last_process.map(|at| at + PROCESS_INTERVAL)
    }

    /// Advance time: decay debt.
    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(last) = self.last_process {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.debt_bytes -= elapsed * self.rate_bps as f64 / 8.0;
        }

        let max_debt = self.rate_bps as f64 / 8.0 * MAX_DEBT_WINDOW.as_secs_f64();
        self.debt_bytes = self.debt_bytes.clamp(0.0, max_debt);

        self.last_process = Some(now);
    }

    /// Take the next packet allowed out at `now`, accounting its size as
    /// debt. `None` when the queue is empty or the bucket is full.
    pub fn poll_packet(&mut self, now: Instant) -> Option<RtpPacket> {
        if self.last_process.is_none() {
            self.last_process = Some(now);
        }

        let burst_allowance = self.rate_bps as f64 / 8.0 * BURST_WINDOW.as_secs_f64();
        if self.debt_bytes > burst_allowance {
            return None;
        }

        let packet = self.queue.pop_front()?;
        self.debt_bytes += packet.len() as f64;
        Some(packet)
    }
}
