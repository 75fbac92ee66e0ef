use std::time::Instant;

use crate::producer::Producer;
use crate::rtp::{RtpPacket, Ssrc};

use super::{ConsumerEvent, ConsumerOptions, ConsumerShared};

/// Forwards one of several producer encodings, switching layers on
/// keyframes and congestion feedback.
#[derive(Debug)]
pub struct SimulcastConsumer {
    pub(crate) shared: ConsumerShared,
    /// Producer mapped SSRCs, low to high spatial layer.
    layers: Vec<Ssrc>,
    /// Forwarded layer. None until the first packet flows.
    current: Option<usize>,
    /// Layer we want to forward.
    target: usize,
    /// Upper bound requested by the subscriber.
    preferred: usize,
    /// The next packet of the target layer re-anchors seq/ts.
    pending_sync: bool,
}

impl SimulcastConsumer {
    pub(crate) fn new(id: &str, options: ConsumerOptions) -> SimulcastConsumer {
        let layers = options.producer_ssrcs.clone();
        assert!(!layers.is_empty());

        let preferred = options
            .preferred_layer
            .map(|p| (p as usize).min(layers.len() - 1))
            .unwrap_or(layers.len() - 1);

        SimulcastConsumer {
            shared: ConsumerShared::new(id, &options),
            layers,
            current: None,
            // Starting low lets media flow before any estimate exists.
            target: 0,
            preferred,
            pending_sync: false,
        }
    }

    /// Currently forwarded spatial layer.
    pub fn current_layer(&self) -> Option<u8> {
        self.current.map(|c| c as u8)
    }

    /// The targeted spatial layer.
    pub fn target_layer(&self) -> u8 {
        self.target as u8
    }

    pub(crate) fn set_preferred_layer(&mut self, spatial: u8) {
        self.preferred = (spatial as usize).min(self.layers.len() - 1);
        // The preference caps the target immediately.
        if self.target > self.preferred {
            self.switch_target(self.preferred);
        }
    }

    /// The mapped SSRC upstream keyframe requests should address: the
    /// target layer when switching, else the current one.
    pub(crate) fn keyframe_request_target(&self) -> Option<Ssrc> {
        let idx = if self.current != Some(self.target) {
            self.target
        } else {
            self.current?
        };
        self.layers.get(idx).copied()
    }

    pub(crate) fn send_rtp(
        &mut self,
        now: Instant,
        packet: &RtpPacket,
        encoding_idx: usize,
        is_keyframe: bool,
    ) -> Option<RtpPacket> {
        // Switch on target-layer packets: bootstrap (nothing forwarded
        // yet) takes any packet, moving between layers needs a keyframe.
        let on_target = encoding_idx == self.target && self.current != Some(self.target);
        if on_target && (self.current.is_none() || is_keyframe) {
            self.current = Some(self.target);
            self.pending_sync = true;
            self.shared
                .push_event(ConsumerEvent::LayersChanged(self.target as u8));
        }

        if self.current != Some(encoding_idx) {
            return None;
        }

        if self.pending_sync {
            self.shared
                .resync(now, packet.sequence_number(), packet.timestamp());
            self.pending_sync = false;
        }

        self.shared.rewrite(now, packet)
    }

    /// Re-select the target layer for an available bitrate.
    ///
    /// Returns the mapped SSRC a keyframe is needed for when moving up.
    pub(crate) fn need_bitrate_change(
        &mut self,
        available_bps: u32,
        layer_bitrates: &[u32],
    ) -> Option<Ssrc> {
        // Highest affordable layer within the preference.
        let mut selected = 0usize;
        for (idx, rate) in layer_bitrates.iter().enumerate().take(self.preferred + 1) {
            if *rate == 0 {
                continue;
            }
            if *rate <= available_bps {
                selected = idx;
            }
        }

        if selected == self.target {
            return None;
        }

        let moving_up = selected > self.current.unwrap_or(0);
        self.switch_target(selected);

        if moving_up {
            // Upward switches wait for a keyframe on the new layer.
            self.layers.get(selected).copied()
        } else {
            None
        }
    }

    fn switch_target(&mut self, target: usize) {
        self.target = target;

        // Downward switches take effect immediately.
        if let Some(current) = self.current {
            if target < current {
                self.current = Some(target);
                self.pending_sync = true;
                self.shared
                    .push_event(ConsumerEvent::LayersChanged(target as u8));
            }
        }
    }

    pub(crate) fn score(&self, producer: &Producer) -> u8 {
        match self.current {
            Some(layer) => producer.encoding_score(layer),
            None => 0,
        }
    }
}
