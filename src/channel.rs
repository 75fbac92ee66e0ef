//! Control channel message types.
//!
//! The worker talks line-delimited JSON with its controller. Requests
//! address a transport (and producer/consumer within it); responses are
//! accepted with optional data, or an error string. Notifications flow
//! the other way, from the core to the controller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SfuError;

/// A request from the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u32,
    pub method: String,
    #[serde(default)]
    pub internal: Internal,
    #[serde(default)]
    pub data: Value,
}

/// Routing ids of a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Internal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
}

/// The worker's answer to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u32,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn accepted(id: u32, data: Option<Value>) -> Response {
        Response {
            id,
            accepted: true,
            data,
            error: None,
        }
    }

    pub fn error(id: u32, error: &SfuError) -> Response {
        Response {
            id,
            accepted: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

/// An event pushed from the core to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub target_id: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Payload of `transport.produce`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceData {
    pub kind: crate::MediaKind,
    pub rtp_parameters: RtpParametersData,
    #[serde(default)]
    pub paused: bool,
}

/// Payload of `transport.consume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeData {
    pub kind: crate::MediaKind,
    #[serde(rename = "type")]
    pub consumer_type: crate::ConsumerType,
    pub rtp_parameters: ConsumerRtpParametersData,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub preferred_layers: Option<PreferredLayersData>,
}

/// Wire form of producer RTP parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParametersData {
    #[serde(default)]
    pub mid: Option<String>,
    pub encodings: Vec<EncodingData>,
    /// Wire payload type to canonical payload type.
    #[serde(default)]
    pub payload_map: Vec<(u8, u8)>,
    /// Extension id to extension URI-ish short name.
    #[serde(default)]
    pub header_extensions: Vec<HeaderExtensionData>,
    pub clock_rate: u32,
    /// Payload format, for keyframe detection.
    #[serde(default)]
    pub codec: Option<crate::CodecKind>,
}

/// Wire form of consumer RTP parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRtpParametersData {
    #[serde(default)]
    pub mid: Option<String>,
    pub ssrc: u32,
    pub payload_type: u8,
    #[serde(default)]
    pub header_extensions: Vec<HeaderExtensionData>,
    pub clock_rate: u32,
}

/// One encoding declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingData {
    #[serde(default)]
    pub ssrc: Option<u32>,
    #[serde(default)]
    pub rid: Option<String>,
    pub mapped_ssrc: u32,
}

/// One header extension declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderExtensionData {
    pub id: u8,
    pub uri: String,
}

/// Payload of `consumer.setPreferredLayers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferredLayersData {
    pub spatial_layer: u8,
}

/// Payload of `transport.setMaxIncomingBitrate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxIncomingBitrateData {
    pub bitrate: u32,
}

/// Map a header extension URI to the crate's extension enum.
pub fn extension_from_uri(uri: &str) -> Option<crate::rtp::Extension> {
    use crate::rtp::Extension::*;
    let ext = match uri {
        "urn:ietf:params:rtp-hdrext:sdes:mid" => RtpMid,
        "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id" => RtpStreamId,
        "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id" => RepairedRtpStreamId,
        "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time" => AbsoluteSendTime,
        "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01" => {
            TransportSequenceNumber
        }
        "http://tools.ietf.org/html/draft-ietf-avtext-framemarking-07" => FrameMarking,
        "urn:ietf:params:rtp-hdrext:ssrc-audio-level" => AudioLevel,
        "urn:3gpp:video-orientation" => VideoOrientation,
        "urn:ietf:params:rtp-hdrext:toffset" => TransmissionTimeOffset,
        _ => return None,
    };
    Some(ext)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_parses_from_json_line() {
        let line = r#"{
            "id": 7,
            "method": "transport.produce",
            "internal": { "transportId": "t1", "producerId": "p1" },
            "data": {
                "kind": "video",
                "paused": false,
                "rtpParameters": {
                    "mid": "a",
                    "encodings": [ { "ssrc": 100, "mappedSsrc": 1100 } ],
                    "clockRate": 90000
                }
            }
        }"#;

        let request: Request = serde_json::from_str(line).unwrap();
        assert_eq!(request.id, 7);
        assert_eq!(request.method, "transport.produce");
        assert_eq!(request.internal.producer_id.as_deref(), Some("p1"));

        let data: ProduceData = serde_json::from_value(request.data).unwrap();
        assert_eq!(data.rtp_parameters.encodings.len(), 1);
        assert_eq!(data.rtp_parameters.encodings[0].mapped_ssrc, 1100);
    }

    #[test]
    fn response_serializes_accepted_and_error() {
        let ok = Response::accepted(1, Some(serde_json::json!({"type": "simple"})));
        let s = serde_json::to_string(&ok).unwrap();
        assert!(s.contains("\"accepted\":true"));

        let err = Response::error(2, &SfuError::NotFound("producer".into()));
        let s = serde_json::to_string(&err).unwrap();
        assert!(s.contains("\"accepted\":false"));
        assert!(s.contains("not found"));
    }

    #[test]
    fn notification_shape() {
        let n = Notification {
            target_id: "c1".into(),
            event: "layerschange".into(),
            data: Some(serde_json::json!({ "spatialLayer": 2 })),
        };
        let s = serde_json::to_string(&n).unwrap();
        assert!(s.contains("\"targetId\":\"c1\""));
    }
}
