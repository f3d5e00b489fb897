//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Message envelope: identity, correlation, routing and payload."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{MessagingError, Result};

/// Protocol string stamped on every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Identity and correlation block of a [`Message`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Globally unique message id (RFC 4122 version 4, lowercase hyphenated).
    #[serde(default)]
    pub id: String,
    /// Id of the request this message answers; empty on requests.
    #[serde(default)]
    pub parent_id: String,
    /// Whether the sender awaits a response.
    #[serde(default)]
    pub is_sync: bool,
    /// Milliseconds since the Unix epoch at construction.
    #[serde(default)]
    pub timestamp: i64,
    /// Protocol version.
    #[serde(default)]
    pub version: String,
    /// Remote edge the message targets or came from.
    #[serde(default)]
    pub node_id: String,
}

/// Routing quadruple of a [`Message`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    /// Sending endpoint.
    #[serde(default)]
    pub source: String,
    /// Receiving endpoint.
    #[serde(default)]
    pub destination: String,
    /// Verb selecting the handler, e.g. `GET`.
    #[serde(default)]
    pub option: String,
    /// Noun selecting the handler, e.g. `/edgemanager/v1/software/edge/version-info`.
    #[serde(default)]
    pub resource: String,
}

/// Envelope exchanged on the bus and, JSON-encoded, over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Identity and correlation.
    pub header: Header,
    /// Routing.
    pub router: Router,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub content: Value,
}

/// Handler-table key for a verb/noun pair.
pub fn route_key(option: &str, resource: &str) -> String {
    format!("{option}:{resource}")
}

/// Mint a version-4 id from the operating system's random source.
pub(crate) fn generate_id() -> Result<String> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| MessagingError::IdGeneration(err.to_string()))?;
    Ok(uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .hyphenated()
        .to_string())
}

impl Message {
    /// Create a request with a fresh id and the current timestamp.
    pub fn new() -> Result<Self> {
        Ok(Self {
            header: Header {
                id: generate_id()?,
                parent_id: String::new(),
                is_sync: false,
                timestamp: Utc::now().timestamp_millis(),
                version: PROTOCOL_VERSION.to_owned(),
                node_id: String::new(),
            },
            router: Router::default(),
            content: Value::Null,
        })
    }

    /// Create a request already routed from `source` to `destination`.
    pub fn request(
        source: impl Into<String>,
        destination: impl Into<String>,
        option: impl Into<String>,
        resource: impl Into<String>,
    ) -> Result<Self> {
        let mut msg = Self::new()?;
        msg.set_route(source, destination, option, resource);
        Ok(msg)
    }

    /// Derive the response to this request.
    ///
    /// The response gets its own id, carries this message's id as `parent_id`,
    /// keeps the sync flag, swaps source and destination and copies the
    /// option/resource pair. Content is left empty for the handler to fill.
    pub fn new_response(&self) -> Result<Self> {
        let mut resp = Self::new()?;
        resp.header.parent_id = self.header.id.clone();
        resp.header.is_sync = self.header.is_sync;
        resp.header.node_id = self.header.node_id.clone();
        resp.router = Router {
            source: self.router.destination.clone(),
            destination: self.router.source.clone(),
            option: self.router.option.clone(),
            resource: self.router.resource.clone(),
        };
        Ok(resp)
    }

    /// Replace the routing quadruple.
    pub fn set_route(
        &mut self,
        source: impl Into<String>,
        destination: impl Into<String>,
        option: impl Into<String>,
        resource: impl Into<String>,
    ) {
        self.router = Router {
            source: source.into(),
            destination: destination.into(),
            option: option.into(),
            resource: resource.into(),
        };
    }

    /// Builder-style node id setter.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.header.node_id = node_id.into();
        self
    }

    /// Builder-style content setter for values that are already JSON.
    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    /// Serialize `value` into the payload.
    pub fn fill_content<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.content = serde_json::to_value(value)?;
        Ok(())
    }

    /// Deserialize the payload.
    pub fn parse_content<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.content)?)
    }

    /// Message id.
    pub fn id(&self) -> &str {
        &self.header.id
    }

    /// Correlation id; empty on requests.
    pub fn parent_id(&self) -> &str {
        &self.header.parent_id
    }

    /// True when this message answers an earlier request.
    pub fn is_response(&self) -> bool {
        !self.header.parent_id.is_empty()
    }

    /// Handler-table key of this message.
    pub fn route_key(&self) -> String {
        route_key(&self.router.option, &self.router.resource)
    }

    /// JSON wire encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode the JSON wire encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;

    #[test]
    fn ids_are_version_four_rfc4122() {
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let id = generate_id().expect("id");
            assert_eq!(id.len(), 36);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c) || c == '-'));
            let bytes = id.as_bytes();
            assert_eq!(bytes[14], b'4', "version nibble in {id}");
            assert!(
                matches!(bytes[19], b'8' | b'9' | b'a' | b'b'),
                "variant bits in {id}"
            );
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn new_message_is_stamped() {
        let before = Utc::now().timestamp_millis();
        let msg = Message::new().expect("message");
        assert_eq!(msg.header.version, PROTOCOL_VERSION);
        assert!(msg.header.timestamp >= before);
        assert!(msg.header.parent_id.is_empty());
        assert!(!msg.is_response());
        assert_eq!(msg.content, Value::Null);
    }

    #[test]
    fn response_swaps_route_and_correlates() {
        let mut req = Message::request("A", "B", "GET", "/ping").expect("request");
        req.header.is_sync = true;
        req.content = json!("ping");

        let resp = req.new_response().expect("response");
        assert_ne!(resp.header.id, req.header.id);
        assert_eq!(resp.header.parent_id, req.header.id);
        assert!(resp.header.is_sync);
        assert_eq!(resp.router.source, "B");
        assert_eq!(resp.router.destination, "A");
        assert_eq!(resp.router.option, "GET");
        assert_eq!(resp.router.resource, "/ping");
        assert_eq!(resp.content, Value::Null);
        assert!(resp.is_response());
    }

    #[test]
    fn wire_field_names_match_protocol() {
        let mut msg = Message::request("edgehub", "cloudhub", "POST", "/config")
            .expect("request")
            .with_node_id("edge-7");
        msg.header.parent_id = "p-1".into();
        let value: Value = serde_json::from_slice(&msg.encode().expect("encode")).expect("json");

        let header = value.get("header").expect("header");
        for field in ["id", "parentId", "isSync", "timestamp", "version", "nodeId"] {
            assert!(header.get(field).is_some(), "missing header.{field}");
        }
        let router = value.get("router").expect("router");
        for field in ["source", "destination", "option", "resource"] {
            assert!(router.get(field).is_some(), "missing router.{field}");
        }
        assert_eq!(header["nodeId"], "edge-7");
        assert_eq!(header["parentId"], "p-1");
    }

    #[test]
    fn decode_restores_every_field() {
        let mut msg = Message::request("A", "B", "GET", "/nodes")
            .expect("request")
            .with_node_id("edge-1")
            .with_content(json!({"names": ["a", "b"], "count": 2, "nested": {"ok": true}}));
        msg.header.is_sync = true;

        let decoded = Message::decode(&msg.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_tolerates_missing_content_and_rejects_garbage() {
        let raw = br#"{"header":{"id":"x"},"router":{"source":"a","destination":"b","option":"GET","resource":"/r"}}"#;
        let msg = Message::decode(raw).expect("decode");
        assert_eq!(msg.content, Value::Null);
        assert_eq!(msg.route_key(), "GET:/r");

        assert!(matches!(
            Message::decode(b"not json"),
            Err(MessagingError::Json(_))
        ));
    }

    #[test]
    fn float_content_survives_the_wire_bit_for_bit() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let mut checked = 0;
        while checked < 20_000 {
            let value = f64::from_bits(rng.gen::<u64>());
            if !value.is_finite() {
                continue;
            }
            let msg = Message::new()
                .expect("msg")
                .with_content(json!({"reading": value, "series": [value, -value]}));
            let decoded = Message::decode(&msg.encode().expect("encode")).expect("decode");
            assert_eq!(decoded, msg, "content {value:e} changed on the wire");
            assert_eq!(
                decoded.content["reading"].as_f64().map(f64::to_bits),
                Some(value.to_bits())
            );
            checked += 1;
        }
    }

    #[test]
    fn typed_content_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct VersionInfo {
            version: String,
            build: u32,
        }

        let mut msg = Message::new().expect("message");
        let info = VersionInfo {
            version: "5.0.1".into(),
            build: 42,
        };
        msg.fill_content(&info).expect("fill");
        assert_eq!(msg.parse_content::<VersionInfo>().expect("parse"), info);
        assert!(msg.parse_content::<Vec<u8>>().is_err());
    }
}
