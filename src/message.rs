use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Serde adapter encoding byte fields as base64 strings, the way the wire
/// format carries opaque bodies inside JSON.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

/// The envelope every framed message carries: an action name, an error string
/// (empty on success), and an opaque action-specific body.
///
/// The body is itself JSON, but intermediate layers treat it as bytes and
/// only the dispatched handler decodes it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub action: String,
    pub error: String,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(action: &str, body: Vec<u8>) -> Self {
        Message {
            action: action.to_string(),
            error: String::new(),
            body,
        }
    }

    /// Build an envelope whose body is the JSON encoding of `value`.
    pub fn with_value<T: Serialize>(action: &str, value: &T) -> Result<Self, Error> {
        Ok(Message::new(action, serde_json::to_vec(value)?))
    }

    /// Build an error envelope carrying the error's display text.
    pub fn from_error(err: &Error) -> Self {
        Message {
            action: String::new(),
            error: err.to_string(),
            body: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decode the body into a typed payload.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Body of a `pake` message: the opaque SPAKE2 protocol message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Pake {
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// Body of a `hello` message: which slot to rendezvous on and as what.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Hello {
    pub relay_key: String,
    pub connection_type: Role,
}

/// Informational goodbye, carried at the end of a transfer session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Goodbye {
    pub reason: String,
}

/// Body of a `finfo` message announcing the next file on the pipe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// Which half of a relay slot a connection fills.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}
