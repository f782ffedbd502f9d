use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Message types reserved for the heartbeat; never delivered to subscribers.
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/// Wire envelope for every realtime message, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Milliseconds since the Unix epoch, stamped by the sender.
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Build an outbound envelope stamped with the current time.
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn ping() -> Self {
        Self::new(PING, serde_json::json!({}))
    }

    /// Heartbeat traffic is swallowed by the connection.
    pub fn is_heartbeat(&self) -> bool {
        self.kind == PING || self.kind == PONG
    }
}

/// Parsed body of an HTTP response, chosen by its content type.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
    Empty,
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Json(v) => {
                // Surface the server's own message when it sends one.
                match v
                    .get("message")
                    .or_else(|| v.get("error"))
                    .and_then(|m| m.as_str())
                {
                    Some(msg) => write!(f, "{msg}"),
                    None => write!(f, "{v}"),
                }
            }
            ResponseBody::Text(s) => write!(f, "{s}"),
            ResponseBody::Binary(b) => write!(f, "<{} bytes>", b.len()),
            ResponseBody::Empty => write!(f, "<empty body>"),
        }
    }
}

/// A file sent as a multipart form body.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    /// Extra text fields appended to the form after the file part.
    pub metadata: Vec<(String, String)>,
}

impl FileUpload {
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            bytes,
            metadata: Vec::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Image,
    Svg,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Image => "image",
            AssetKind::Svg => "svg",
        }
    }
}

/// A binary asset produced by the scraper, uploaded one call per asset.
#[derive(Debug, Clone)]
pub struct Asset {
    pub filename: String,
    pub kind: AssetKind,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Asset {
    /// Manifest entry sent ahead of the uploads.
    pub fn manifest_entry(&self) -> serde_json::Value {
        serde_json::json!({
            "filename": self.filename,
            "type": self.kind.as_str(),
            "contentType": self.content_type,
            "size": self.bytes.len(),
            "width": self.width,
            "height": self.height,
            "sha256": compute_digest(&self.bytes),
        })
    }

    pub fn to_upload(&self) -> FileUpload {
        FileUpload::new(&self.filename, &self.content_type, self.bytes.clone())
            .with_field("filename", &self.filename)
            .with_field("type", self.kind.as_str())
    }
}

/// User-facing notification pushed over the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Compute a SHA-256 hash of raw bytes, returned as 64-char hex.
pub fn compute_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
