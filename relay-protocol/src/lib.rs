//! # Relay Protocol Messages
//!
//! Defines the messages exchanged between the sandboxed peer and the relay
//! agent over the duplex channel, and the codec that turns them into channel
//! frames and back.
//!
//! Every frame is a single JSON object using serde's internally-tagged
//! representation: a `"type"` field holds the snake_case variant name
//! (e.g. `{"type": "http_request", ...}`). Byte payloads travel as standard
//! base64 strings so that bodies round-trip exactly without any charset
//! assumptions.

use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Peer-assigned correlation token for one outstanding relay request.
///
/// Only unique among the requests outstanding on a single channel session;
/// the agent never interprets or generates it.
pub type RequestId = u64;

// ─── HTTP Descriptors ───────────────────────────────────────────

/// The closed set of methods a peer may ask the agent to perform.
///
/// Serialized as a bare uppercase tag (`"GET"`, `"POST"`, ...). Anything
/// outside the set fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single header line. Names are not case-normalized at this layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

impl HttpHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An HTTP request the peer wants performed on its behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<HttpHeader>,

    /// `None` when the peer sent no payload. `Some(vec![])` is a present
    /// but empty body and stays distinct on the wire.
    #[serde(
        default,
        with = "base64_opt_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(
        url: impl Into<String>,
        method: HttpMethod,
        headers: Vec<HttpHeader>,
        body: Option<Vec<u8>>,
    ) -> Self {
        Self {
            url: url.into(),
            method,
            headers,
            body,
        }
    }
}

/// The outcome of a relayed HTTP call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// Carried as a wide integer so no intermediate transport truncates it.
    pub status: u64,
    pub headers: Vec<HttpHeader>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

// ─── Channel Messages ───────────────────────────────────────────

/// All messages in the relay protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Sent by the agent right after the channel opens so the peer
    /// registers it as an executor of outbound requests.
    SetupProxyClient,

    /// Peer → agent: perform this request and answer under `request_id`.
    HttpRequest {
        request_id: RequestId,
        request: HttpRequest,
    },

    /// Agent → peer: the request identified by `request_id` completed.
    HttpResponse {
        request_id: RequestId,
        response: HttpResponse,
    },

    /// Failure report. `request_id` is absent for failures that are not
    /// tied to a request.
    Error {
        request_id: Option<RequestId>,
        message: String,
    },
}

impl RelayMessage {
    /// Short variant name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::SetupProxyClient => "setup_proxy_client",
            RelayMessage::HttpRequest { .. } => "http_request",
            RelayMessage::HttpResponse { .. } => "http_response",
            RelayMessage::Error { .. } => "error",
        }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            RelayMessage::SetupProxyClient => None,
            RelayMessage::HttpRequest { request_id, .. }
            | RelayMessage::HttpResponse { request_id, .. } => Some(*request_id),
            RelayMessage::Error { request_id, .. } => *request_id,
        }
    }
}

// ─── Codec ──────────────────────────────────────────────────────

/// A frame that is not a well-formed [`RelayMessage`].
#[derive(Debug, thiserror::Error)]
#[error("malformed relay frame: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Encodes a message as the JSON text of one channel frame.
pub fn encode(msg: &RelayMessage) -> String {
    // Every field is a string, integer, sequence or tagged enum, so
    // serde_json has no failure path here.
    serde_json::to_string(msg).unwrap_or_default()
}

/// Decodes the JSON text of one channel frame.
pub fn decode(raw: &str) -> Result<RelayMessage, DecodeError> {
    Ok(serde_json::from_str(raw)?)
}

/// Decodes a binary channel frame carrying the same UTF-8 JSON as a text frame.
pub fn decode_slice(raw: &[u8]) -> Result<RelayMessage, DecodeError> {
    Ok(serde_json::from_slice(raw)?)
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        BASE64.decode(encoded.as_bytes()).map_err(de::Error::custom)
    }
}

mod base64_opt_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => s.serialize_str(&BASE64.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| BASE64.decode(encoded.as_bytes()).map_err(de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_request(body: Option<Vec<u8>>) -> RelayMessage {
        RelayMessage::HttpRequest {
            request_id: 7,
            request: HttpRequest::new(
                "http://example.test/a",
                HttpMethod::Get,
                vec![
                    HttpHeader::new("accept", "text/plain"),
                    HttpHeader::new("x-dup", "1"),
                    HttpHeader::new("x-dup", "2"),
                ],
                body,
            ),
        }
    }

    #[test]
    fn request_round_trips_with_absent_and_empty_body() {
        for body in [None, Some(Vec::new()), Some(vec![0u8, 159, 146, 150, 255])] {
            let msg = get_request(body);
            assert_eq!(decode(&encode(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn absent_body_is_omitted_and_empty_body_is_not() {
        let absent = encode(&get_request(None));
        assert!(!absent.contains("\"body\""));

        let empty = encode(&get_request(Some(Vec::new())));
        assert!(empty.contains("\"body\":\"\""));
    }

    #[test]
    fn response_and_error_round_trip() {
        let response = RelayMessage::HttpResponse {
            request_id: 7,
            response: HttpResponse {
                status: 200,
                headers: vec![HttpHeader::new("content-type", "text/plain")],
                body: b"ok".to_vec(),
            },
        };
        assert_eq!(decode(&encode(&response)).unwrap(), response);

        for request_id in [Some(9), None] {
            let error = RelayMessage::Error {
                request_id,
                message: "connection refused".to_string(),
            };
            assert_eq!(decode(&encode(&error)).unwrap(), error);
        }
    }

    #[test]
    fn decodes_the_documented_wire_shape() {
        let raw = r#"{"type":"http_request","request_id":7,
            "request":{"url":"http://example.test/a","method":"GET","headers":[]}}"#;
        assert_eq!(decode(raw).unwrap(), get_request(None).with_no_headers());

        let raw = r#"{"type":"error","message":"boom"}"#;
        assert_eq!(
            decode(raw).unwrap(),
            RelayMessage::Error {
                request_id: None,
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn status_is_not_truncated_to_a_byte() {
        let raw = r#"{"type":"http_response","request_id":1,
            "response":{"status":70000,"headers":[],"body":""}}"#;
        match decode(raw).unwrap() {
            RelayMessage::HttpResponse { response, .. } => assert_eq!(response.status, 70000),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_variant_and_method() {
        assert!(decode(r#"{"type":"tunnel_open","request_id":1}"#).is_err());

        let raw = r#"{"type":"http_request","request_id":1,
            "request":{"url":"http://x","method":"PATCH","headers":[]}}"#;
        let err = decode(raw).unwrap_err();
        assert!(err.to_string().contains("PATCH"), "{err}");

        let raw = r#"{"type":"http_request","request_id":1,
            "request":{"url":"http://x","method":"get","headers":[]}}"#;
        assert!(decode(raw).is_err());
    }

    #[test]
    fn rejects_structurally_invalid_frames() {
        let garbage: &[&[u8]] = &[
            b"",
            b"not json",
            b"\xff\xfe\x00",
            b"[]",
            b"{}",
            b"{\"type\":42}",
            b"{\"type\":\"http_request\"}",
            b"{\"type\":\"http_request\",\"request_id\":-1,\"request\":{\"url\":\"u\",\"method\":\"GET\",\"headers\":[]}}",
            b"{\"type\":\"http_response\",\"request_id\":1,\"response\":{\"status\":200,\"headers\":[],\"body\":\"%%%\"}}",
            b"{\"type\":\"http_response\",\"request_id\":1,\"response\":{\"status\":\"200\",\"headers\":[],\"body\":\"\"}}",
            b"{\"type\":\"http_request\",\"request_id\":1,\"request\":{\"url\":\"http://x\",\"method\":\"GET\"}}",
            b"{\"type\":\"http_response\",\"request_id\":1,\"response\":{\"status\":200,\"body\":\"\"}}",
        ];
        for raw in garbage {
            assert!(decode_slice(raw).is_err(), "{:?}", String::from_utf8_lossy(raw));
        }
    }

    impl RelayMessage {
        fn with_no_headers(self) -> Self {
            match self {
                RelayMessage::HttpRequest {
                    request_id,
                    mut request,
                } => {
                    request.headers.clear();
                    RelayMessage::HttpRequest {
                        request_id,
                        request,
                    }
                }
                other => other,
            }
        }
    }
}
