//! Signaling envelopes: the JSON wire unit exchanged over the relay.
//!
//! The tag set is fixed: four membership messages generated by the
//! server and three directed negotiation messages relayed between
//! clients. Negotiation payloads (SDP descriptions, ICE candidates)
//! are opaque to this layer and carried as raw JSON values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::SignalResult;

/// Opaque client identifier, assigned by the server at connect time.
///
/// One id exists per transport connection; it is never reused after
/// the connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the id, for logging.
    pub fn short(&self) -> String {
        let s = self.0.to_string();
        s[..8].to_string()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// A signaling envelope, JSON-encoded as one WebSocket text frame.
///
/// `from` is only meaningful on the three directed types and is always
/// injected by the server on relay; a value claimed by the sender is
/// never forwarded (see [`Envelope::stamp_from`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Server -> client: the id assigned to this connection.
    YourId { id: ClientId },
    /// Server -> client: roster of already-connected clients. Skipped
    /// entirely (not sent empty) when no other client exists.
    ExistingClients { clients: Vec<ClientId> },
    /// Server -> broadcast: a client joined.
    NewClient { id: ClientId },
    /// Server -> broadcast: a client departed.
    ClientLeft { id: ClientId },
    /// Directed: session description offer.
    Offer {
        target: ClientId,
        offer: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ClientId>,
    },
    /// Directed: session description answer.
    Answer {
        target: ClientId,
        answer: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ClientId>,
    },
    /// Directed: ICE candidate.
    IceCandidate {
        target: ClientId,
        candidate: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ClientId>,
    },
}

impl Envelope {
    /// Relay target, present only on the three directed types.
    pub fn target(&self) -> Option<ClientId> {
        match self {
            Envelope::Offer { target, .. }
            | Envelope::Answer { target, .. }
            | Envelope::IceCandidate { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Sender id as stamped by the server.
    pub fn sender(&self) -> Option<ClientId> {
        match self {
            Envelope::Offer { from, .. }
            | Envelope::Answer { from, .. }
            | Envelope::IceCandidate { from, .. } => *from,
            _ => None,
        }
    }

    /// Overwrite `from` with the authoritative sender id, discarding
    /// whatever the sender may have claimed.
    pub fn stamp_from(mut self, sender: ClientId) -> Self {
        match &mut self {
            Envelope::Offer { from, .. }
            | Envelope::Answer { from, .. }
            | Envelope::IceCandidate { from, .. } => *from = Some(sender),
            _ => {}
        }
        self
    }

    pub fn to_json(&self) -> SignalResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> SignalResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_tags_match_protocol() {
        let id = ClientId::random();

        let v = serde_json::to_value(Envelope::YourId { id }).unwrap();
        assert_eq!(v["type"], "your-id");
        assert_eq!(v["id"], id.to_string());

        let v = serde_json::to_value(Envelope::ExistingClients { clients: vec![id] }).unwrap();
        assert_eq!(v["type"], "existing-clients");
        assert_eq!(v["clients"][0], id.to_string());

        let v = serde_json::to_value(Envelope::IceCandidate {
            target: id,
            candidate: json!({"candidate": "candidate:0 1 UDP"}),
            from: None,
        })
        .unwrap();
        assert_eq!(v["type"], "ice-candidate");
    }

    #[test]
    fn from_is_omitted_when_absent() {
        let v = serde_json::to_value(Envelope::Offer {
            target: ClientId::random(),
            offer: json!({"sdp": "v=0"}),
            from: None,
        })
        .unwrap();
        assert!(!v.as_object().unwrap().contains_key("from"));
    }

    #[test]
    fn stamp_from_overwrites_claimed_sender() {
        let target = ClientId::random();
        let claimed = ClientId::random();
        let real = ClientId::random();

        let envelope = Envelope::Offer {
            target,
            offer: json!({"sdp": "v=0"}),
            from: Some(claimed),
        };
        assert_eq!(envelope.stamp_from(real).sender(), Some(real));
    }

    #[test]
    fn stamp_from_leaves_membership_types_alone() {
        let id = ClientId::random();
        let envelope = Envelope::ClientLeft { id }.stamp_from(ClientId::random());
        assert_eq!(envelope, Envelope::ClientLeft { id });
        assert_eq!(envelope.sender(), None);
        assert_eq!(envelope.target(), None);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Envelope::from_json(r#"{"type":"bogus"}"#).is_err());
        assert!(Envelope::from_json("not json at all").is_err());
    }

    #[test]
    fn directed_round_trip() {
        let envelope = Envelope::Answer {
            target: ClientId::random(),
            answer: json!({"type": "answer", "sdp": "v=0"}),
            from: Some(ClientId::random()),
        };
        let decoded = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }
}
