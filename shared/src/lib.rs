//! Wire protocol shared between the avatar-sync server and its clients.
//!
//! Messages travel as UTF-8 decimal CSV: an integer signifier followed by a
//! fixed number of numeric fields. The text encoding trades bandwidth for a
//! protocol that can be read off the wire with tcpdump; message sizes are
//! small and the tick rate is bounded, so this is a deliberate choice.
//!
//! Field count and types per signifier are fixed. Every variant round-trips
//! exactly through `encode`/`decode`.

use std::fmt;

/// Default port the server binds when none is given on the command line.
pub const DEFAULT_PORT: u16 = 9001;

/// Avatars spawn at a random position inside this region of the unit square.
pub const SPAWN_REGION_MIN: f32 = 0.05;
pub const SPAWN_REGION_MAX: f32 = 0.95;

/// Signifiers for messages sent by clients.
pub mod client_to_server {
    /// Client reports a velocity delta for its avatar.
    pub const UPDATE_POSITION: u8 = 1;
}

/// Signifiers for messages sent by the server.
pub mod server_to_client {
    /// A new avatar exists; includes its position and color.
    pub const SPAWN_AVATAR: u8 = 1;
    /// Authoritative position for an existing avatar.
    pub const UPDATE_POSITION: u8 = 2;
    /// An avatar's client disconnected.
    pub const REMOVE_AVATAR: u8 = 3;
}

/// 2D position or velocity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// RGB color, each component in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }
}

/// Why a payload failed to decode. Malformed messages are logged and dropped
/// by the server; they never abort the tick or touch another client's state.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Payload is not valid UTF-8.
    InvalidUtf8,
    /// First field is not an integer, or is not a known signifier.
    MalformedSignifier(String),
    /// Known signifier but the wrong number of fields.
    FieldCountMismatch {
        signifier: u8,
        expected: usize,
        actual: usize,
    },
    /// A field that should be numeric is not.
    FieldParseError { index: usize, value: String },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidUtf8 => write!(f, "payload is not valid UTF-8"),
            DecodeError::MalformedSignifier(s) => write!(f, "malformed signifier '{}'", s),
            DecodeError::FieldCountMismatch {
                signifier,
                expected,
                actual,
            } => write!(
                f,
                "signifier {} expects {} fields, got {}",
                signifier, expected, actual
            ),
            DecodeError::FieldParseError { index, value } => {
                write!(f, "field {} is not numeric: '{}'", index, value)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

fn split_fields(payload: &[u8]) -> Result<Vec<&str>, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok(text.split(',').collect())
}

fn parse_signifier(fields: &[&str]) -> Result<u8, DecodeError> {
    let raw = fields.first().copied().unwrap_or("");
    raw.parse::<u8>()
        .map_err(|_| DecodeError::MalformedSignifier(raw.to_string()))
}

fn expect_fields(signifier: u8, fields: &[&str], expected: usize) -> Result<(), DecodeError> {
    if fields.len() != expected {
        return Err(DecodeError::FieldCountMismatch {
            signifier,
            expected,
            actual: fields.len(),
        });
    }
    Ok(())
}

fn parse_f32(fields: &[&str], index: usize) -> Result<f32, DecodeError> {
    fields[index]
        .parse::<f32>()
        .map_err(|_| DecodeError::FieldParseError {
            index,
            value: fields[index].to_string(),
        })
}

fn parse_u32(fields: &[&str], index: usize) -> Result<u32, DecodeError> {
    fields[index]
        .parse::<u32>()
        .map_err(|_| DecodeError::FieldParseError {
            index,
            value: fields[index].to_string(),
        })
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Velocity delta for the sender's avatar. The server integrates it with
    /// the fixed tick duration, never a wall-clock delta.
    UpdatePosition { vx: f32, vy: f32 },
}

impl ClientMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ClientMessage::UpdatePosition { vx, vy } => {
                format!("{},{},{}", client_to_server::UPDATE_POSITION, vx, vy).into_bytes()
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let fields = split_fields(payload)?;
        let signifier = parse_signifier(&fields)?;
        match signifier {
            client_to_server::UPDATE_POSITION => {
                expect_fields(signifier, &fields, 3)?;
                Ok(ClientMessage::UpdatePosition {
                    vx: parse_f32(&fields, 1)?,
                    vy: parse_f32(&fields, 2)?,
                })
            }
            other => Err(DecodeError::MalformedSignifier(other.to_string())),
        }
    }
}

/// Messages the server sends to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    SpawnAvatar {
        id: u32,
        x: f32,
        y: f32,
        r: f32,
        g: f32,
        b: f32,
    },
    UpdatePosition {
        id: u32,
        x: f32,
        y: f32,
    },
    RemoveAvatar {
        id: u32,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ServerMessage::SpawnAvatar { id, x, y, r, g, b } => format!(
                "{},{},{},{},{},{},{}",
                server_to_client::SPAWN_AVATAR,
                id,
                x,
                y,
                r,
                g,
                b
            )
            .into_bytes(),
            ServerMessage::UpdatePosition { id, x, y } => {
                format!("{},{},{},{}", server_to_client::UPDATE_POSITION, id, x, y).into_bytes()
            }
            ServerMessage::RemoveAvatar { id } => {
                format!("{},{}", server_to_client::REMOVE_AVATAR, id).into_bytes()
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let fields = split_fields(payload)?;
        let signifier = parse_signifier(&fields)?;
        match signifier {
            server_to_client::SPAWN_AVATAR => {
                expect_fields(signifier, &fields, 7)?;
                Ok(ServerMessage::SpawnAvatar {
                    id: parse_u32(&fields, 1)?,
                    x: parse_f32(&fields, 2)?,
                    y: parse_f32(&fields, 3)?,
                    r: parse_f32(&fields, 4)?,
                    g: parse_f32(&fields, 5)?,
                    b: parse_f32(&fields, 6)?,
                })
            }
            server_to_client::UPDATE_POSITION => {
                expect_fields(signifier, &fields, 4)?;
                Ok(ServerMessage::UpdatePosition {
                    id: parse_u32(&fields, 1)?,
                    x: parse_f32(&fields, 2)?,
                    y: parse_f32(&fields, 3)?,
                })
            }
            server_to_client::REMOVE_AVATAR => {
                expect_fields(signifier, &fields, 2)?;
                Ok(ServerMessage::RemoveAvatar {
                    id: parse_u32(&fields, 1)?,
                })
            }
            other => Err(DecodeError::MalformedSignifier(other.to_string())),
        }
    }
}
