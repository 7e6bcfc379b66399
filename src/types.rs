use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Namespace used for records owned by the batch manager itself
pub const SYSTEM_NAMESPACE: &str = "ff_system";

/// Name of the offset record that checkpoints the message sequencer
pub const MSG_BATCH_OFFSET_NAME: &str = "ff_msgbatch";

/// A 32 byte hash, rendered as lowercase hex
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Bytes32(pub [u8; 32]);

impl Bytes32 {
    /// SHA-256 of the given bytes
    pub fn sha256(data: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(data.as_ref()).into())
    }

    /// Parse a 64 character hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Bytes32 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes32({})", self)
    }
}

impl Serialize for Bytes32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Bytes32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Bytes32::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Kinds of message that flow through the batch manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Definition,
    Broadcast,
    Private,
    #[serde(rename = "groupinit")]
    GroupInit,
    TransferBroadcast,
    TransferPrivate,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Definition => "definition",
            MessageType::Broadcast => "broadcast",
            MessageType::Private => "private",
            MessageType::GroupInit => "groupinit",
            MessageType::TransferBroadcast => "transfer_broadcast",
            MessageType::TransferPrivate => "transfer_private",
        }
    }

    /// Private-class messages are pinned with a per-author nonce inside their group
    pub fn is_private(&self) -> bool {
        matches!(
            self,
            MessageType::Private | MessageType::GroupInit | MessageType::TransferPrivate
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference from a message to one of its data items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRef {
    pub id: Uuid,
    pub hash: Option<Bytes32>,
}

/// Header fields of a message, carried verbatim into batch payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub author: String,
    pub namespace: String,
    pub topics: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Bytes32>,
    pub created: DateTime<Utc>,
}

/// Outbound application message
///
/// `sequence`, `batch` and `confirmed` are local store state and are not
/// part of the payload other parties receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<Bytes32>,
    pub data: Vec<DataRef>,
    #[serde(skip)]
    pub sequence: i64,
    #[serde(skip)]
    pub batch: Option<Uuid>,
    #[serde(skip)]
    pub confirmed: Option<DateTime<Utc>>,
}

impl Message {
    /// Create an unsequenced message with a fresh id
    pub fn new(
        msg_type: MessageType,
        namespace: impl Into<String>,
        author: impl Into<String>,
        topics: Vec<String>,
    ) -> Self {
        Self {
            header: MessageHeader {
                id: Uuid::new_v4(),
                msg_type,
                author: author.into(),
                namespace: namespace.into(),
                topics,
                group: None,
                created: Utc::now(),
            },
            hash: None,
            data: Vec::new(),
            sequence: 0,
            batch: None,
            confirmed: None,
        }
    }

    pub fn with_group(mut self, group: Bytes32) -> Self {
        self.header.group = Some(group);
        self
    }

    pub fn with_data(mut self, data: &Data) -> Self {
        self.data.push(DataRef {
            id: data.id,
            hash: Some(data.hash),
        });
        self
    }

    pub fn id(&self) -> Uuid {
        self.header.id
    }
}

/// Resolved data payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub id: Uuid,
    pub hash: Bytes32,
    pub value: serde_json::Value,
}

impl Data {
    /// Create a data item whose hash commits to its JSON value
    pub fn new(value: serde_json::Value) -> Self {
        let hash = Bytes32::sha256(value.to_string());
        Self {
            id: Uuid::new_v4(),
            hash,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    BatchPin,
}

/// Parent transaction of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRef {
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub id: Uuid,
}

/// The part of a batch that is hashed and transmitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub tx: TransactionRef,
    pub messages: Vec<Message>,
    pub data: Vec<Data>,
}

impl BatchPayload {
    /// SHA-256 over the canonical JSON encoding of the payload
    pub fn hash(&self) -> Result<Bytes32, serde_json::Error> {
        let encoded = serde_json::to_vec(self)?;
        Ok(Bytes32::sha256(encoded))
    }
}

/// A group of messages dispatched as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub namespace: String,
    #[serde(rename = "type")]
    pub batch_type: MessageType,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Bytes32>,
    pub hash: Option<Bytes32>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<DateTime<Utc>>,
    pub payload: BatchPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_ref: Option<String>,
}

impl Batch {
    pub fn message_ids(&self) -> Vec<Uuid> {
        self.payload.messages.iter().map(|m| m.header.id).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetType {
    Batch,
}

/// Durable checkpoint record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    #[serde(rename = "type")]
    pub offset_type: OffsetType,
    pub namespace: String,
    pub name: String,
    pub current: i64,
}

/// Query for messages past a checkpoint, ascending by sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFilter {
    pub after_sequence: i64,
    pub limit: usize,
}

/// Fields to set on a set of messages; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageUpdate {
    pub batch: Option<Uuid>,
    pub confirmed: Option<DateTime<Utc>>,
}

impl MessageUpdate {
    pub fn batched(batch: Uuid) -> Self {
        Self {
            batch: Some(batch),
            confirmed: None,
        }
    }

    pub fn confirmed(batch: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            batch: Some(batch),
            confirmed: Some(at),
        }
    }
}

/// Fields to set on an existing batch; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchUpdate {
    pub payload: Option<BatchPayload>,
    pub hash: Option<Bytes32>,
    pub payload_ref: Option<String>,
    pub confirmed: Option<DateTime<Utc>>,
}

/// Identifies the processor a message is batched by
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    pub namespace: String,
    pub msg_type: MessageType,
    pub group: Option<Bytes32>,
}

impl RoutingKey {
    pub fn for_message(msg: &Message) -> Self {
        Self {
            namespace: msg.header.namespace.clone(),
            msg_type: msg.header.msg_type,
            group: msg.header.group,
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{}:{}:{}", self.namespace, self.msg_type, group),
            None => write!(f, "{}:{}", self.namespace, self.msg_type),
        }
    }
}
