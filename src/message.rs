//! Replication message types, pinned to the peer wire format.
//!
//! Peer payloads are textual JSON, one self-delimited value per
//! connection; the serde renames here fix the field names other
//! replicas expect. Encoding and decoding happen at the TCP surfaces
//! that own the sockets (the link layer and the client service).

use serde::{Deserialize, Serialize};

/// Store operations carried by replication messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
}

/// Sequential-mode message kinds. ACKs provide the "later clock"
/// evidence the total-order delivery predicate demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "REQUEST")]
    Request,
    #[serde(rename = "ACK")]
    Ack,
}

/// Globally unique message identifier: a per-replica counter paired
/// with the originating replica id. ACKs carry the identifier of the
/// REQUEST they acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub id: u64,
    #[serde(rename = "serverId")]
    pub origin: usize,
}

/// Sequential-mode replication message (REQUEST or ACK).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "identifier")]
    pub id: MessageId,
    pub key: String,
    pub value: String,
    /// `None` on ACKs, serialized as the empty string on the wire.
    #[serde(with = "op_field")]
    pub op: Option<Operation>,
    pub clock: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "server_id")]
    pub sender: usize,
    #[serde(rename = "seq_num")]
    pub seq_num: u64,
}

/// Causal-mode replication message. No ACKs and no separate
/// identifier: `(sender, clock[sender])` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorMessage {
    pub key: String,
    pub value: String,
    pub op: Operation,
    pub clock: Vec<u64>,
    #[serde(rename = "server_id")]
    pub sender: usize,
    #[serde(rename = "seq_num")]
    pub seq_num: u64,
}

mod op_field {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Operation;

    pub fn serialize<S>(op: &Option<Operation>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let text = match op {
            Some(Operation::Get) => "GET",
            Some(Operation::Put) => "PUT",
            Some(Operation::Delete) => "DELETE",
            None => "",
        };
        serializer.serialize_str(text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Operation>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        match text.as_str() {
            "" => Ok(None),
            "GET" => Ok(Some(Operation::Get)),
            "PUT" => Ok(Some(Operation::Put)),
            "DELETE" => Ok(Some(Operation::Delete)),
            other => Err(serde::de::Error::custom(format!(
                "unknown operation {other:?}"
            ))),
        }
    }
}
