use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::json;

use crate::channel::{
    ConsumeData, MaxIncomingBitrateData, PreferredLayersData, ProduceData, Request, Response,
};
use crate::consumer::{Consumer, ConsumerEvent, ConsumerOptions};
use crate::listener::RtpListener;
use crate::producer::{Producer, ProducerOptions, RtpEncoding};
use crate::rate::RateCalculator;
use crate::remb::{RembClient, RembServer};
use crate::cc::{TccClient, TccServer};
use crate::rtp::{ExtensionMap, Pli, ReceiverReport, ReportList, Rtcp, RtpPacket, Ssrc};
use crate::util::Soonest;
use crate::{MediaKind, SfuError};

// RTCP interval bounds. The nominal interval shrinks with the sending
// rate: min(MAX, 360000 / kbps), jittered in [0.5, 1.5].
const RTCP_MAX_INTERVAL: Duration = Duration::from_millis(1000);

// A compound packet must fit the MTU after SRTCP overhead.
const RTCP_BUFFER_SIZE: usize = 1472;

// Default egress estimate until congestion feedback arrives.
const INITIAL_AVAILABLE_BITRATE: u32 = 600_000;

// setMaxIncomingBitrate clamps to at least this.
const MIN_INCOMING_BITRATE: u32 = 10_000;

/// Output drained from [`Transport::poll_output`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// A cleartext RTP packet to encrypt and send.
    Rtp(Vec<u8>),
    /// A cleartext RTCP packet to encrypt and send.
    Rtcp(Vec<u8>),
    /// A notification for the controller.
    Event(Event),
}

/// Notifications for the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A producer stream's score changed.
    Score {
        producer_id: String,
        ssrc: u32,
        score: u8,
    },
    /// A consumer switched simulcast layer.
    LayersChanged { consumer_id: String, layer: u8 },
    /// A producer was paused via the control channel.
    ProducerPaused { producer_id: String },
    /// A producer was resumed via the control channel.
    ProducerResumed { producer_id: String },
    /// The producer of this consumer closed; the consumer is gone too.
    ConsumerProducerClosed { consumer_id: String },
    /// A producer closed.
    ProducerClosed { producer_id: String },
    /// A consumer closed.
    ConsumerClosed { consumer_id: String },
}

impl Event {
    /// The channel notification form of this event.
    pub fn to_notification(&self) -> crate::channel::Notification {
        use crate::channel::Notification;
        match self {
            Event::Score {
                producer_id,
                ssrc,
                score,
            } => Notification {
                target_id: producer_id.clone(),
                event: "score".into(),
                data: Some(json!({ "ssrc": ssrc, "score": score })),
            },
            Event::LayersChanged { consumer_id, layer } => Notification {
                target_id: consumer_id.clone(),
                event: "layerschange".into(),
                data: Some(json!({ "spatialLayer": layer })),
            },
            Event::ProducerPaused { producer_id } => Notification {
                target_id: producer_id.clone(),
                event: "producerpause".into(),
                data: None,
            },
            Event::ProducerResumed { producer_id } => Notification {
                target_id: producer_id.clone(),
                event: "producerresume".into(),
                data: None,
            },
            Event::ConsumerProducerClosed { consumer_id } => Notification {
                target_id: consumer_id.clone(),
                event: "producerclose".into(),
                data: None,
            },
            Event::ProducerClosed { producer_id } => Notification {
                target_id: producer_id.clone(),
                event: "close".into(),
                data: None,
            },
            Event::ConsumerClosed { consumer_id } => Notification {
                target_id: consumer_id.clone(),
                event: "close".into(),
                data: None,
            },
        }
    }
}

/// Snapshot of transport-level throughput.
#[allow(missing_docs)]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    pub recv_bitrate: u32,
    pub send_bitrate: u32,
    pub producers: usize,
    pub consumers: usize,
}

/// A media transport: one peer connection worth of producers and
/// consumers, with the RTCP loops and congestion control tying them
/// together.
///
/// See the crate documentation for the sans-IO driving contract.
#[derive(Debug)]
pub struct Transport {
    id: String,
    cname: String,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
    map_ssrc_consumer: HashMap<Ssrc, String>,
    listener: RtpListener,
    /// Union of the extension ids declared by attached producers.
    ext_ids: ExtensionMap,
    recv_rate: RateCalculator,
    send_rate: RateCalculator,
    rtcp_next: Option<Instant>,
    remb_server: RembServer,
    remb_client: RembClient,
    tcc_server: TccServer,
    tcc_client: TccClient,
    outputs: VecDeque<Output>,
    connected: bool,
}

impl Transport {
    pub fn new(id: &str) -> Transport {
        Transport {
            id: id.to_string(),
            cname: format!("sfu-{}", id),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            map_ssrc_consumer: HashMap::new(),
            listener: RtpListener::new(),
            ext_ids: ExtensionMap::empty(),
            recv_rate: RateCalculator::default(),
            send_rate: RateCalculator::default(),
            rtcp_next: None,
            remb_server: RembServer::new(),
            remb_client: RembClient::new(INITIAL_AVAILABLE_BITRATE),
            tcc_server: TccServer::new(),
            tcc_client: TccClient::new(INITIAL_AVAILABLE_BITRATE),
            outputs: VecDeque::new(),
            connected: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The DTLS layer reports the transport usable.
    pub fn connected(&mut self, now: Instant) {
        self.connected = true;
        self.rtcp_next = Some(now + RTCP_MAX_INTERVAL / 2);
        self.tcc_server.transport_connected(now);
    }

    /// The DTLS layer reports the transport down. Timers stop.
    pub fn disconnected(&mut self) {
        self.connected = false;
        self.rtcp_next = None;
        self.tcc_server.transport_disconnected();
    }

    /// Ingress RTP from the DTLS/SRTP collaborator.
    pub fn handle_rtp(&mut self, now: Instant, buf: &[u8]) {
        self.recv_rate.update(buf.len(), now);

        let mut packet = match RtpPacket::parse(buf, &self.ext_ids) {
            Ok(p) => p,
            Err(e) => {
                warn!("Dropping malformed RTP packet: {}", e);
                return;
            }
        };

        // Congestion control taps before routing.
        if let Some(abs) = packet.header().ext_vals.abs_send_time {
            self.remb_server.incoming_packet(now, abs, packet.len());
        }
        if let Some(wide_seq) = packet.header().ext_vals.transport_cc {
            if let Some(feedback) = self.tcc_server.incoming_packet(now, wide_seq) {
                self.emit_rtcp(vec![Rtcp::TransportFeedback(feedback)]);
            }
        }

        let Some(producer_id) = self.listener.resolve(packet.header()) else {
            warn!("No producer for RTP packet [ssrc:{}]", packet.ssrc());
            return;
        };

        let Some(producer) = self.producers.get_mut(&producer_id) else {
            warn!("Listener resolved to unknown producer: {}", producer_id);
            return;
        };

        let Some(meta) = producer.receive_rtp(now, &mut packet, &self.ext_ids) else {
            warn!(
                "Producer did not accept packet [id:{}, ssrc:{}]",
                producer_id,
                packet.ssrc()
            );
            return;
        };

        // NACK missing packets toward the sender right away.
        let nacks = producer.nack_reports();
        if !nacks.is_empty() {
            self.emit_rtcp(nacks.into_iter().map(Rtcp::Nack).collect());
        }

        if !meta.forward {
            return;
        }

        // Fan out. Dispatch order is map iteration order; consumers must
        // not depend on it.
        let consumer_ids: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.producer_id() == producer_id)
            .map(|(id, _)| id.clone())
            .collect();

        for consumer_id in consumer_ids {
            let consumer = self.consumers.get_mut(&consumer_id).unwrap();

            let Some(mut out) = consumer.send_rtp(now, &packet, meta.encoding_idx, meta.is_keyframe)
            else {
                self.drain_consumer_events(&consumer_id);
                continue;
            };

            if consumer.supports_wide_seq() {
                let wide_seq = self.tcc_client.next_wide_seq();
                let consumer = self.consumers.get_mut(&consumer_id).unwrap();
                consumer.apply_wide_seq(&mut out, wide_seq);
            }

            self.tcc_client.insert_packet(out);
            self.drain_consumer_events(&consumer_id);
        }

        self.drain_pacer(now);
    }

    /// Ingress RTCP from the DTLS/SRTP collaborator.
    pub fn handle_rtcp(&mut self, now: Instant, buf: &[u8]) {
        let mut packets = VecDeque::new();
        Rtcp::read_packet(buf, &mut packets);

        for rtcp in packets {
            self.handle_rtcp_packet(now, rtcp);
        }
    }

    fn handle_rtcp_packet(&mut self, now: Instant, rtcp: Rtcp) {
        match rtcp {
            Rtcp::ReceiverReport(rr) => {
                for report in rr.reports.iter() {
                    let Some(consumer) = self.consumer_by_media_ssrc(report.ssrc) else {
                        warn!("No consumer for RR [ssrc:{}]", report.ssrc);
                        continue;
                    };
                    consumer.receive_reception_report(now, report);
                }
            }

            Rtcp::SenderReport(sr) => {
                let info = sr.sender_info;
                let Some(producer_id) = self.listener.get_by_ssrc(info.ssrc).map(String::from)
                else {
                    warn!("No producer for SR [ssrc:{}]", info.ssrc);
                    return;
                };
                if let Some(producer) = self.producers.get_mut(&producer_id) {
                    producer.receive_sender_report(now, &info);
                }
            }

            Rtcp::Nack(nack) => {
                let Some(consumer) = self.consumer_by_media_ssrc(nack.ssrc) else {
                    warn!("No consumer for NACK [ssrc:{}]", nack.ssrc);
                    return;
                };
                let resends = consumer.receive_nack(&nack);
                for packet in resends {
                    let size = packet.len();
                    self.send_rate.update(size, now);
                    self.remb_client.sent_rtp(now, size);
                    self.outputs.push_back(Output::Rtp(packet.into_data()));
                }
            }

            Rtcp::Pli(pli) => self.consumer_keyframe_request(now, pli.ssrc),
            Rtcp::Fir(fir) => {
                for entry in fir.reports.iter() {
                    self.consumer_keyframe_request(now, entry.ssrc);
                }
            }

            Rtcp::Remb(remb) => {
                // Both estimators consume REMB: the client for the
                // remaining/exceeding reallocation, the congestion
                // controller as its ceiling.
                if self.remb_client.receive_remb_feedback(now, &remb).is_some() {
                    let available = self.remb_client.available_bitrate(now);
                    self.distribute_available_bitrate(now, available);
                }
                if let Some(available) = self
                    .tcc_client
                    .receive_estimated_bitrate(now, remb.bitrate_bps() as u32)
                {
                    self.distribute_available_bitrate(now, available);
                }
            }

            Rtcp::TransportFeedback(feedback) => {
                if let Some(available) = self.tcc_client.receive_transport_feedback(now, &feedback)
                {
                    self.distribute_available_bitrate(now, available);
                }
            }

            Rtcp::SourceDescription(_) | Rtcp::Goodbye(_) => {
                trace!("Ignoring RTCP SDES/BYE");
            }
        }
    }

    /// Dispatch a control request addressed to this transport.
    pub fn handle_request(&mut self, now: Instant, request: &Request) -> Response {
        match self.dispatch_request(now, request) {
            Ok(data) => Response::accepted(request.id, data),
            Err(e) => Response::error(request.id, &e),
        }
    }

    fn dispatch_request(
        &mut self,
        now: Instant,
        request: &Request,
    ) -> Result<Option<serde_json::Value>, SfuError> {
        match request.method.as_str() {
            "transport.produce" => {
                let producer_id = required(&request.internal.producer_id, "producerId")?;
                let data: ProduceData = parse_data(&request.data)?;
                let simulcast = data.rtp_parameters.encodings.len() > 1;
                self.produce(&producer_id, data)?;
                let kind = if simulcast { "simulcast" } else { "simple" };
                Ok(Some(json!({ "type": kind })))
            }

            "transport.consume" => {
                let producer_id = required(&request.internal.producer_id, "producerId")?;
                let consumer_id = required(&request.internal.consumer_id, "consumerId")?;
                let data: ConsumeData = parse_data(&request.data)?;
                let response = self.consume(&consumer_id, &producer_id, data)?;
                Ok(Some(response))
            }

            "transport.setMaxIncomingBitrate" => {
                let data: MaxIncomingBitrateData = parse_data(&request.data)?;
                let bitrate = data.bitrate.max(MIN_INCOMING_BITRATE);
                self.remb_server.set_max_bitrate(bitrate);
                debug!("Max incoming bitrate set to {}", bitrate);
                Ok(None)
            }

            "producer.close" => {
                let producer_id = required(&request.internal.producer_id, "producerId")?;
                self.close_producer(&producer_id)?;
                Ok(None)
            }

            "producer.pause" => {
                let producer_id = required(&request.internal.producer_id, "producerId")?;
                let changed = self.producer_mut(&producer_id)?.pause();
                if changed {
                    self.set_consumers_producer_paused(&producer_id, true);
                    self.outputs.push_back(Output::Event(Event::ProducerPaused {
                        producer_id: producer_id.clone(),
                    }));
                }
                Ok(None)
            }

            "producer.resume" => {
                let producer_id = required(&request.internal.producer_id, "producerId")?;
                let changed = self.producer_mut(&producer_id)?.resume();
                if changed {
                    self.set_consumers_producer_paused(&producer_id, false);
                    self.outputs
                        .push_back(Output::Event(Event::ProducerResumed {
                            producer_id: producer_id.clone(),
                        }));
                }
                Ok(None)
            }

            "producer.dump" => {
                let producer_id = required(&request.internal.producer_id, "producerId")?;
                let producer = self.producer_mut(&producer_id)?;
                let dump = producer.dump();
                Ok(Some(serde_json::to_value(dump).expect("dump serializes")))
            }

            "producer.getStats" => {
                let producer_id = required(&request.internal.producer_id, "producerId")?;
                let producer = self.producer_mut(&producer_id)?;
                let stats = producer.stats(now);
                Ok(Some(serde_json::to_value(stats).expect("stats serialize")))
            }

            "consumer.close" => {
                let consumer_id = required(&request.internal.consumer_id, "consumerId")?;
                self.close_consumer(&consumer_id)?;
                Ok(None)
            }

            "consumer.pause" => {
                let consumer_id = required(&request.internal.consumer_id, "consumerId")?;
                self.consumer_mut(&consumer_id)?.pause();
                Ok(None)
            }

            "consumer.resume" => {
                let consumer_id = required(&request.internal.consumer_id, "consumerId")?;
                self.consumer_mut(&consumer_id)?.resume();
                Ok(None)
            }

            "consumer.setPreferredLayers" => {
                let consumer_id = required(&request.internal.consumer_id, "consumerId")?;
                let data: PreferredLayersData = parse_data(&request.data)?;
                self.consumer_mut(&consumer_id)?
                    .set_preferred_layers(data.spatial_layer);
                Ok(None)
            }

            "consumer.requestKeyFrame" => {
                let consumer_id = required(&request.internal.consumer_id, "consumerId")?;
                let (target, producer_id) = {
                    let consumer = self.consumer_mut(&consumer_id)?;
                    (
                        consumer.keyframe_request_target(),
                        consumer.producer_id().to_string(),
                    )
                };
                if let Some(target) = target {
                    self.producer_keyframe_request(now, &producer_id, target);
                }
                Ok(None)
            }

            "consumer.dump" => {
                let consumer_id = required(&request.internal.consumer_id, "consumerId")?;
                let dump = self.consumer_mut(&consumer_id)?.dump();
                Ok(Some(serde_json::to_value(dump).expect("dump serializes")))
            }

            "consumer.getStats" => {
                let consumer_id = required(&request.internal.consumer_id, "consumerId")?;
                let stats = self.consumer_mut(&consumer_id)?.stats(now);
                Ok(Some(serde_json::to_value(stats).expect("stats serialize")))
            }

            method => Err(SfuError::UnknownMethod(method.to_string())),
        }
    }

    /// Drive time forward. Call when the deadline from
    /// [`poll_timeout`][Transport::poll_timeout] passes.
    pub fn handle_timeout(&mut self, now: Instant) {
        // RTCP tick.
        if let Some(at) = self.rtcp_next {
            if now >= at {
                self.send_rtcp(now);
                self.reschedule_rtcp(now);
            }
        }

        // Keyframe request watchdogs.
        let mut retries: Vec<(String, Ssrc)> = vec![];
        for (id, producer) in &mut self.producers {
            for wire_ssrc in producer.handle_timeout(now) {
                retries.push((id.clone(), wire_ssrc));
            }
        }
        for (_, wire_ssrc) in retries {
            self.emit_rtcp(vec![Rtcp::Pli(Pli {
                sender_ssrc: 0.into(),
                ssrc: wire_ssrc,
            })]);
        }

        // Transport-wide feedback tick.
        if let Some(feedback) = self.tcc_server.handle_timeout(now) {
            self.emit_rtcp(vec![Rtcp::TransportFeedback(feedback)]);
        }

        // Receive-side estimation tick.
        if let Some(remb) = self.remb_server.handle_timeout(now) {
            self.emit_rtcp(vec![Rtcp::Remb(remb)]);
        }

        // Pacer tick.
        self.tcc_client.handle_timeout(now);
        self.drain_pacer(now);
    }

    /// The next deadline requiring [`handle_timeout`][Transport::handle_timeout].
    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut soonest = self.rtcp_next;
        soonest = soonest.soonest(self.tcc_server.poll_timeout());
        soonest = soonest.soonest(self.remb_server.poll_timeout());
        soonest = soonest.soonest(self.tcc_client.poll_timeout());
        for producer in self.producers.values() {
            soonest = soonest.soonest(producer.poll_timeout());
        }
        soonest
    }

    /// Drain the next output.
    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    /// Aggregate transport throughput.
    pub fn stats(&mut self, now: Instant) -> TransportStats {
        TransportStats {
            recv_bitrate: self.recv_rate.rate(now),
            send_bitrate: self.send_rate.rate(now),
            producers: self.producers.len(),
            consumers: self.consumers.len(),
        }
    }

    /// Close everything, notifying the controller about each entity.
    ///
    /// The owning router calls this before dropping the transport.
    /// Dropping without calling it tears down silently.
    pub fn close_producers_and_consumers(&mut self) {
        let producer_ids: Vec<String> = self.producers.keys().cloned().collect();
        let consumer_ids: Vec<String> = self.consumers.keys().cloned().collect();

        for id in consumer_ids {
            self.remove_consumer(&id);
            self.outputs
                .push_back(Output::Event(Event::ConsumerClosed { consumer_id: id }));
        }

        for id in producer_ids {
            self.listener.remove_producer(&id);
            self.producers.remove(&id);
            self.outputs
                .push_back(Output::Event(Event::ProducerClosed { producer_id: id }));
        }
    }

    // --- producer/consumer lifecycle ---

    fn produce(&mut self, producer_id: &str, data: ProduceData) -> Result<(), SfuError> {
        if self.producers.contains_key(producer_id) {
            return Err(SfuError::Conflict(format!(
                "a producer with id {} already exists",
                producer_id
            )));
        }

        let params = data.rtp_parameters;

        if params.encodings.is_empty() {
            return Err(SfuError::Config("encodings must not be empty".into()));
        }

        let mut ext_map = ExtensionMap::empty();
        for he in &params.header_extensions {
            if let Some(ext) = crate::channel::extension_from_uri(&he.uri) {
                ext_map.set(he.id, ext);
            }
        }

        let options = ProducerOptions {
            kind: data.kind,
            mid: params.mid.as_deref().map(Into::into),
            encodings: params
                .encodings
                .iter()
                .map(|e| RtpEncoding {
                    ssrc: e.ssrc.map(Into::into),
                    rid: e.rid.as_deref().map(Into::into),
                    mapped_ssrc: e.mapped_ssrc.into(),
                })
                .collect(),
            payload_map: params
                .payload_map
                .iter()
                .map(|(from, to)| ((*from).into(), (*to).into()))
                .collect(),
            ext_map: ext_map.clone(),
            clock_rate: params.clock_rate,
            paused: data.paused,
        };

        let mut producer = Producer::new(producer_id, options);
        if let Some(codec) = params.codec {
            producer.set_codec(codec);
        }

        // Register with the listener first: a conflict must not leave
        // partial state behind.
        self.listener.add_producer(&producer)?;

        // The transport-wide extension mapping is the union of all
        // attached producers.
        self.ext_ids.merge(&ext_map);

        // The REMB server reports for all producer SSRCs.
        let mut ssrcs: Vec<u32> = vec![];
        for p in self.producers.values() {
            ssrcs.extend(p.encodings().iter().filter_map(|e| e.ssrc.map(|s| *s)));
        }
        ssrcs.extend(producer.encodings().iter().filter_map(|e| e.ssrc.map(|s| *s)));
        self.remb_server.set_ssrcs(ssrcs);

        self.producers.insert(producer_id.to_string(), producer);

        debug!("Producer created [id:{}]", producer_id);
        Ok(())
    }

    fn consume(
        &mut self,
        consumer_id: &str,
        producer_id: &str,
        data: ConsumeData,
    ) -> Result<serde_json::Value, SfuError> {
        if self.consumers.contains_key(consumer_id) {
            return Err(SfuError::Conflict(format!(
                "a consumer with id {} already exists",
                consumer_id
            )));
        }

        let Some(producer) = self.producers.get(producer_id) else {
            return Err(SfuError::NotFound(format!(
                "producer not found: {}",
                producer_id
            )));
        };

        let producer_ssrcs: Vec<Ssrc> =
            producer.encodings().iter().map(|e| e.mapped_ssrc).collect();
        let producer_paused = producer.is_paused();

        let params = data.rtp_parameters;

        let mut ext_map = ExtensionMap::empty();
        for he in &params.header_extensions {
            if let Some(ext) = crate::channel::extension_from_uri(&he.uri) {
                ext_map.set(he.id, ext);
            }
        }

        let options = ConsumerOptions {
            kind: data.kind,
            consumer_type: data.consumer_type,
            producer_id: producer_id.to_string(),
            producer_ssrcs,
            ssrc: params.ssrc.into(),
            payload_type: params.payload_type.into(),
            mid: params.mid.as_deref().map(Into::into),
            ext_map,
            clock_rate: params.clock_rate,
            paused: data.paused,
            preferred_layer: data.preferred_layers.map(|p| p.spatial_layer),
        };

        let mut consumer = Consumer::new(consumer_id, options);
        consumer.set_producer_paused(producer_paused);

        for ssrc in consumer.media_ssrcs() {
            self.map_ssrc_consumer.insert(ssrc, consumer_id.to_string());
        }

        let score = consumer.score(&self.producers[producer_id]);
        let paused = consumer.is_paused();

        self.consumers.insert(consumer_id.to_string(), consumer);

        debug!(
            "Consumer created [id:{}, producerId:{}]",
            consumer_id, producer_id
        );

        Ok(json!({
            "paused": paused,
            "producerPaused": producer_paused,
            "score": score,
        }))
    }

    fn close_producer(&mut self, producer_id: &str) -> Result<(), SfuError> {
        if !self.producers.contains_key(producer_id) {
            return Err(SfuError::NotFound(format!(
                "producer not found: {}",
                producer_id
            )));
        }

        self.listener.remove_producer(producer_id);
        self.producers.remove(producer_id);

        // Consumers of a closed producer close too.
        let orphaned: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.producer_id() == producer_id)
            .map(|(id, _)| id.clone())
            .collect();

        for consumer_id in orphaned {
            self.remove_consumer(&consumer_id);
            self.outputs
                .push_back(Output::Event(Event::ConsumerProducerClosed {
                    consumer_id,
                }));
        }

        debug!("Producer closed [id:{}]", producer_id);
        Ok(())
    }

    fn close_consumer(&mut self, consumer_id: &str) -> Result<(), SfuError> {
        if !self.consumers.contains_key(consumer_id) {
            return Err(SfuError::NotFound(format!(
                "consumer not found: {}",
                consumer_id
            )));
        }

        self.remove_consumer(consumer_id);
        debug!("Consumer closed [id:{}]", consumer_id);
        Ok(())
    }

    fn remove_consumer(&mut self, consumer_id: &str) {
        if let Some(consumer) = self.consumers.remove(consumer_id) {
            for ssrc in consumer.media_ssrcs() {
                self.map_ssrc_consumer.remove(&ssrc);
            }
        }
    }

    fn producer_mut(&mut self, id: &str) -> Result<&mut Producer, SfuError> {
        self.producers
            .get_mut(id)
            .ok_or_else(|| SfuError::NotFound(format!("producer not found: {}", id)))
    }

    fn consumer_mut(&mut self, id: &str) -> Result<&mut Consumer, SfuError> {
        self.consumers
            .get_mut(id)
            .ok_or_else(|| SfuError::NotFound(format!("consumer not found: {}", id)))
    }

    fn set_consumers_producer_paused(&mut self, producer_id: &str, paused: bool) {
        for consumer in self.consumers.values_mut() {
            if consumer.producer_id() == producer_id {
                consumer.set_producer_paused(paused);
            }
        }
    }

    // --- RTCP and congestion plumbing ---

    fn consumer_by_media_ssrc(&mut self, ssrc: Ssrc) -> Option<&mut Consumer> {
        let id = self.map_ssrc_consumer.get(&ssrc)?.clone();
        self.consumers.get_mut(&id)
    }

    fn consumer_keyframe_request(&mut self, now: Instant, media_ssrc: Ssrc) {
        let (target, producer_id) = {
            let Some(consumer) = self.consumer_by_media_ssrc(media_ssrc) else {
                warn!("No consumer for keyframe request [ssrc:{}]", media_ssrc);
                return;
            };
            (
                consumer.keyframe_request_target(),
                consumer.producer_id().to_string(),
            )
        };

        let Some(target) = target else {
            return;
        };

        self.producer_keyframe_request(now, &producer_id, target);
    }

    fn producer_keyframe_request(&mut self, now: Instant, producer_id: &str, mapped_ssrc: Ssrc) {
        let Some(producer) = self.producers.get_mut(producer_id) else {
            return;
        };

        if let Some(wire_ssrc) = producer.request_key_frame(now, mapped_ssrc) {
            self.emit_rtcp(vec![Rtcp::Pli(Pli {
                sender_ssrc: 0.into(),
                ssrc: wire_ssrc,
            })]);
        }
    }

    fn distribute_available_bitrate(&mut self, now: Instant, available: u32) {
        let video_consumers: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.kind() == MediaKind::Video)
            .map(|(id, _)| id.clone())
            .collect();

        if video_consumers.is_empty() {
            return;
        }

        let share = available / video_consumers.len() as u32;

        for consumer_id in video_consumers {
            let consumer = self.consumers.get_mut(&consumer_id).unwrap();
            let producer_id = consumer.producer_id().to_string();

            let Some(producer) = self.producers.get_mut(&producer_id) else {
                continue;
            };

            let layer_bitrates: Vec<u32> = (0..producer.encodings().len())
                .map(|idx| producer.encoding_bitrate(idx, now))
                .collect();

            let consumer = self.consumers.get_mut(&consumer_id).unwrap();
            if let Some(keyframe_target) = consumer.need_bitrate_change(share, &layer_bitrates) {
                self.producer_keyframe_request(now, &producer_id, keyframe_target);
            }

            self.drain_consumer_events(&consumer_id);
        }
    }

    fn drain_consumer_events(&mut self, consumer_id: &str) {
        let Some(consumer) = self.consumers.get_mut(consumer_id) else {
            return;
        };

        while let Some(event) = consumer.poll_event() {
            match event {
                ConsumerEvent::LayersChanged(layer) => {
                    self.outputs.push_back(Output::Event(Event::LayersChanged {
                        consumer_id: consumer_id.to_string(),
                        layer,
                    }));
                }
            }
        }
    }

    fn drain_pacer(&mut self, now: Instant) {
        while let Some(packet) = self.tcc_client.poll_packet(now) {
            let size = packet.len();

            if let Some(wide_seq) = packet.header().ext_vals.transport_cc {
                self.tcc_client.packet_sent(now, wide_seq, size);
            }

            self.send_rate.update(size, now);
            self.remb_client.sent_rtp(now, size);
            self.outputs.push_back(Output::Rtp(packet.into_data()));
        }
    }

    fn send_rtcp(&mut self, now: Instant) {
        // Per consumer: SR plus SDES CNAME, emitted as soon as a sender
        // report exists.
        let consumer_ids: Vec<String> = self.consumers.keys().cloned().collect();
        for consumer_id in consumer_ids {
            let consumer = self.consumers.get_mut(&consumer_id).unwrap();
            let ssrc = consumer.media_ssrcs()[0];

            if let Some(sr) = consumer.get_rtcp(now) {
                let sdes = crate::rtp::Descriptions::cname(ssrc, &self.cname);
                self.emit_rtcp(vec![
                    Rtcp::SenderReport(sr),
                    Rtcp::SourceDescription(sdes),
                ]);
            }
        }

        // Producers: one RR batch with all reception reports.
        let mut blocks = vec![];
        let mut score_events = vec![];
        for (id, producer) in &mut self.producers {
            blocks.extend(producer.get_rtcp(now));

            for (_, mapped_ssrc, score) in producer.take_score_changes() {
                score_events.push(Event::Score {
                    producer_id: id.clone(),
                    ssrc: *mapped_ssrc,
                    score,
                });
            }
        }

        if !blocks.is_empty() {
            let packets: Vec<Rtcp> = ReportList::lists_from_iter(blocks)
                .into_iter()
                .map(|reports| {
                    Rtcp::ReceiverReport(ReceiverReport {
                        sender_ssrc: 0.into(),
                        reports,
                    })
                })
                .collect();
            self.emit_rtcp(packets);
        }

        for event in score_events {
            self.outputs.push_back(Output::Event(event));
        }
    }

    fn reschedule_rtcp(&mut self, now: Instant) {
        let mut interval = RTCP_MAX_INTERVAL;

        if !self.consumers.is_empty() {
            let mut rate_kbps = 0u64;
            let consumer_ids: Vec<String> = self.consumers.keys().cloned().collect();
            for id in consumer_ids {
                let consumer = self.consumers.get_mut(&id).unwrap();
                rate_kbps += consumer.transmission_rate(now) as u64 / 1000;
            }

            if rate_kbps > 0 {
                interval = interval.min(Duration::from_millis(360_000 / rate_kbps));
            }
        }

        // Jitter in [0.5, 1.5] against synchronization.
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        self.rtcp_next = Some(now + interval.mul_f64(factor));
    }

    fn emit_rtcp(&mut self, packets: Vec<Rtcp>) {
        if !self.connected {
            return;
        }

        let mut queue: VecDeque<Rtcp> = packets.into();
        let mut buf = vec![0u8; RTCP_BUFFER_SIZE];

        while !queue.is_empty() {
            let before = queue.len();
            let n = Rtcp::write_packet(&mut queue, &mut buf);

            if n == 0 {
                if queue.len() == before {
                    warn!("Dropping RTCP too big for the compound buffer");
                    break;
                }
                continue;
            }

            self.outputs.push_back(Output::Rtcp(buf[..n].to_vec()));
        }
    }
}

fn required(value: &Option<String>, name: &str) -> Result<String, SfuError> {
    value
        .clone()
        .ok_or_else(|| SfuError::Config(format!("request has no internal.{}", name)))
}

fn parse_data<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> Result<T, SfuError> {
    serde_json::from_value(value.clone()).map_err(|e| SfuError::Config(e.to_string()))
}
