//! WebSocket Protocol Messages
//!
//! This module defines the collaboration messages exchanged between clients
//! and a room. Every message is a JSON object whose `type` field selects the
//! payload shape:
//!
//! ```json
//! {"type": "block_move", "block_id": "b1", "position": {"x": 10.0, "y": 4.0}}
//! ```
//!
//! Routing only needs the discriminator, so [`peek_kind`] reads it without
//! decoding the payload. Unknown discriminators are not errors; they are
//! relayed verbatim.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::document::{Block, Document, Edit, Element, Position};
use crate::error::{Error, Result};
use crate::session::UserInfo;

/// Collaboration messages with a known discriminator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Presence roster, ordered by join (server to client only)
    UserJoinedList {
        /// Currently registered users
        users: Vec<UserInfo>,
    },

    /// Identity and document snapshot for a new joiner (server to client only)
    UserCreated {
        /// The joiner's assigned identity
        user: UserInfo,
        /// Document at the moment of registration
        document: Document,
        /// Number of mutations applied before this snapshot
        version: u64,
    },

    /// Cursor position of a user
    CursorMove {
        /// Moving user
        user: UserInfo,
        /// Cursor position in canvas coordinates
        position: Position,
    },

    /// A block was created
    BlockCreate {
        /// New block ID
        block_id: String,
        /// Block content; its `id` may be left out
        #[serde(deserialize_with = "block_payload")]
        block: Block,
    },

    /// A block was removed
    BlockRemove {
        /// Removed block ID
        block_id: String,
    },

    /// A block was moved
    BlockMove {
        /// Block ID
        block_id: String,
        /// New position
        position: Position,
    },

    /// A block parameter changed
    BlockConfigChange {
        /// Block ID
        block_id: String,
        /// Parameter name
        param_name: String,
        /// New parameter value
        param_value: Value,
    },

    /// A block label changed
    BlockLabelChange {
        /// Block ID
        block_id: String,
        /// New label
        label: String,
    },

    /// Edges were created; carries the full element list
    EdgeCreate {
        /// Replacement element list
        elements: Vec<Element>,
    },

    /// Edges were updated; carries the full element list
    EdgeUpdate {
        /// Replacement element list
        elements: Vec<Element>,
    },

    /// Chat line
    Chat {
        /// Message text
        text: String,
    },
}

fn block_payload<'de, D>(deserializer: D) -> std::result::Result<Block, D::Error>
where
    D: Deserializer<'de>,
{
    let mut fields = Map::<String, Value>::deserialize(deserializer)?;
    fields
        .entry("id")
        .or_insert_with(|| Value::String(String::new()));
    serde_json::from_value(Value::Object(fields)).map_err(serde::de::Error::custom)
}

/// Discriminator of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `user_joined_list`
    UserJoinedList,
    /// `user_created`
    UserCreated,
    /// `cursor_move`
    CursorMove,
    /// `block_create`
    BlockCreate,
    /// `block_remove`
    BlockRemove,
    /// `block_move`
    BlockMove,
    /// `block_config_change`
    BlockConfigChange,
    /// `block_label_change`
    BlockLabelChange,
    /// `edge_create`
    EdgeCreate,
    /// `edge_update`
    EdgeUpdate,
    /// `chat`
    Chat,
    /// Any other discriminator
    Unknown(String),
}

impl MessageKind {
    /// Parse a discriminator value
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "user_joined_list" => Self::UserJoinedList,
            "user_created" => Self::UserCreated,
            "cursor_move" => Self::CursorMove,
            "block_create" => Self::BlockCreate,
            "block_remove" => Self::BlockRemove,
            "block_move" => Self::BlockMove,
            "block_config_change" => Self::BlockConfigChange,
            "block_label_change" => Self::BlockLabelChange,
            "edge_create" => Self::EdgeCreate,
            "edge_update" => Self::EdgeUpdate,
            "chat" => Self::Chat,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Wire name of the discriminator
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::UserJoinedList => "user_joined_list",
            Self::UserCreated => "user_created",
            Self::CursorMove => "cursor_move",
            Self::BlockCreate => "block_create",
            Self::BlockRemove => "block_remove",
            Self::BlockMove => "block_move",
            Self::BlockConfigChange => "block_config_change",
            Self::BlockLabelChange => "block_label_change",
            Self::EdgeCreate => "edge_create",
            Self::EdgeUpdate => "edge_update",
            Self::Chat => "chat",
            Self::Unknown(name) => name,
        }
    }

    /// Only the server may send this kind
    #[must_use]
    pub fn is_server_only(&self) -> bool {
        matches!(self, Self::UserJoinedList | Self::UserCreated)
    }

    /// Applying this kind changes the document
    #[must_use]
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::BlockCreate
                | Self::BlockRemove
                | Self::BlockMove
                | Self::BlockConfigChange
                | Self::BlockLabelChange
                | Self::EdgeCreate
                | Self::EdgeUpdate
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of decoding a raw inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Known discriminator with a well-formed payload
    Known(Message),
    /// Unrecognized discriminator, to be relayed as-is
    Unknown(String),
}

#[derive(Deserialize)]
struct Envelope<'a> {
    #[serde(rename = "type", borrow)]
    kind: std::borrow::Cow<'a, str>,
}

/// Read the discriminator without decoding the payload
pub fn peek_kind(raw: &str) -> Result<MessageKind> {
    let envelope: Envelope<'_> = serde_json::from_str(raw)?;
    Ok(MessageKind::parse(&envelope.kind))
}

/// Decode a raw message.
///
/// Fails when the text is not a JSON object with a string `type`, or when a
/// known discriminator carries a payload of the wrong shape.
pub fn decode(raw: &str) -> Result<Decoded> {
    match peek_kind(raw)? {
        MessageKind::Unknown(name) => Ok(Decoded::Unknown(name)),
        kind => decode_as(&kind, raw).map(Decoded::Known),
    }
}

/// Decode the payload of a message whose discriminator is already known
pub fn decode_as(kind: &MessageKind, raw: &str) -> Result<Message> {
    serde_json::from_str::<Message>(raw).map_err(|e| Error::decode(format!("{kind}: {e}")))
}

impl Message {
    /// Discriminator of this message
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::UserJoinedList { .. } => MessageKind::UserJoinedList,
            Self::UserCreated { .. } => MessageKind::UserCreated,
            Self::CursorMove { .. } => MessageKind::CursorMove,
            Self::BlockCreate { .. } => MessageKind::BlockCreate,
            Self::BlockRemove { .. } => MessageKind::BlockRemove,
            Self::BlockMove { .. } => MessageKind::BlockMove,
            Self::BlockConfigChange { .. } => MessageKind::BlockConfigChange,
            Self::BlockLabelChange { .. } => MessageKind::BlockLabelChange,
            Self::EdgeCreate { .. } => MessageKind::EdgeCreate,
            Self::EdgeUpdate { .. } => MessageKind::EdgeUpdate,
            Self::Chat { .. } => MessageKind::Chat,
        }
    }

    /// Document edit carried by a mutating message
    #[must_use]
    pub fn into_edit(self) -> Option<Edit> {
        match self {
            Self::BlockCreate {
                block_id,
                mut block,
            } => {
                block.id = block_id;
                Some(Edit::CreateBlock(block))
            }
            Self::BlockRemove { block_id } => Some(Edit::RemoveBlock(block_id)),
            Self::BlockMove { block_id, position } => Some(Edit::MoveBlock {
                id: block_id,
                position,
            }),
            Self::BlockConfigChange {
                block_id,
                param_name,
                param_value,
            } => Some(Edit::SetParam {
                id: block_id,
                name: param_name,
                value: param_value,
            }),
            Self::BlockLabelChange { block_id, label } => Some(Edit::SetLabel {
                id: block_id,
                label,
            }),
            Self::EdgeCreate { elements } | Self::EdgeUpdate { elements } => {
                Some(Edit::ReplaceElements(elements))
            }
            Self::UserJoinedList { .. }
            | Self::UserCreated { .. }
            | Self::CursorMove { .. }
            | Self::Chat { .. } => None,
        }
    }

    /// Encode to JSON text
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Create a roster message
    #[must_use]
    pub fn roster(users: Vec<UserInfo>) -> Self {
        Self::UserJoinedList { users }
    }
}
