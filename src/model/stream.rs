//! Stream identity types.

use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// 32-byte content hash identifying a stream or a group.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Key([u8; 32]);

impl Key {
    /// Hash arbitrary text (a stream URI or a group name) into a key.
    pub fn of(text: &str) -> Self {
        Key(Sha256::digest(text.as_bytes()).into())
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Key(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", &self.to_hex()[..12])
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Kind of monitored streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    /// Internet resources used for self checks.
    Sample,
    /// Plain HTTP.
    Http,
    /// Apple HTTP Live Streaming.
    Hls,
    /// Adobe HTTP Dynamic Streaming.
    Hds,
    /// Widevine VOD.
    Wv,
    #[serde(other)]
    Unknown,
}

impl StreamType {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamType::Sample => "sample",
            StreamType::Http => "http",
            StreamType::Hls => "hls",
            StreamType::Hds => "hds",
            StreamType::Wv => "wv",
            StreamType::Unknown => "unknown",
        }
    }

    /// Whether probers must capture the response body for this kind.
    pub fn reads_body(self) -> bool {
        matches!(self, StreamType::Hls | StreamType::Hds)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "sample" => StreamType::Sample,
            "http" => StreamType::Http,
            "hls" => StreamType::Hls,
            "hds" => StreamType::Hds,
            "wv" => StreamType::Wv,
            _ => StreamType::Unknown,
        })
    }
}

/// A monitored endpoint. Immutable once configuration is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stream {
    pub key: Key,
    pub uri: String,
    pub stream_type: StreamType,
    pub name: String,
    pub title: String,
    pub group: String,
}

impl Stream {
    pub fn new(uri: &str, stream_type: StreamType, name: &str, title: &str, group: &str) -> Self {
        Self {
            key: Key::of(uri),
            uri: uri.to_string(),
            stream_type,
            name: name.to_string(),
            title: title.to_string(),
            group: group.to_string(),
        }
    }
}
