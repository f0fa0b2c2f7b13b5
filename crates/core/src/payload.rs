//! Request and response payload types
//!
//! Payloads are opaque to the broker: a request carries a tagged bag of
//! string values plus optional file attachments, and a response is whatever
//! JSON object the worker posted back, split only on its `success`
//! discriminant. Neither side is interpreted by the queueing core; only the
//! worker-side decoder needs concrete types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// A file attachment carried inside a [`RequestPayload`].
///
/// `data` travels as base64 text on the wire so the whole request stays a
/// single JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormFile {
    /// Form-field name the file was attached under (commonly "image")
    pub name: String,

    /// Original file name as supplied by the caller
    pub filename: String,

    /// MIME type as supplied by the caller
    #[serde(rename = "contentType")]
    pub content_type: String,

    /// Raw file bytes
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Opaque key/value + file-attachment container passed through a queue.
///
/// Mirrors an HTML form: every key maps to one or more string values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// The request command (e.g. "detect", "list-custom")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Key/value pairs passed by the caller
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, Vec<String>>,

    /// File attachments passed by the caller
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FormFile>,

    /// Trailing URL segments from the original route
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<String>,
}

impl RequestPayload {
    /// Creates a payload carrying just a command tag.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::default()
        }
    }

    /// Sets a single-valued key, replacing any existing values for that key.
    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), vec![value.into()]);
    }

    /// Appends a value to a key, keeping any existing values.
    pub fn add_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.entry(key.into()).or_default().push(value.into());
    }

    /// Returns the first value for a key, if present.
    ///
    /// Payloads mirror HTML forms, so a key may hold several values; this
    /// returns only the first.
    pub fn get_value(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// Attaches a file to the payload.
    pub fn add_file(&mut self, file: FormFile) {
        self.files.push(file);
    }

    /// Returns the first attached file with the given form-field name.
    pub fn get_file(&self, name: &str) -> Option<&FormFile> {
        self.files.iter().find(|f| f.name == name)
    }
}

/// A request travelling through a queue.
///
/// The wire shape seen by workers is `{reqid, reqtype, payload}`;
/// `enqueued_at` is broker-side bookkeeping only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    /// Globally unique, generator-assigned request id
    pub reqid: String,

    /// Command tag chosen by the caller
    pub reqtype: String,

    /// Opaque request payload
    pub payload: RequestPayload,

    /// When the broker accepted the request
    #[serde(skip, default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedRequest {
    /// Creates a request with a freshly generated id.
    pub fn new(reqtype: impl Into<String>, payload: RequestPayload) -> Self {
        Self {
            reqid: uuid::Uuid::new_v4().to_string(),
            reqtype: reqtype.into(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// A worker's response, split on its `success` discriminant.
///
/// The success branch carries the worker's result fields verbatim; the
/// failure branch carries an error message and a numeric code. Responses the
/// broker fabricates itself (timeouts, unknown queues) use the same shape,
/// so front-end callers see one format regardless of who produced the
/// error.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleResponse {
    /// `success: true` - the worker's result fields, passed through verbatim
    Success {
        /// Result fields other than the discriminant
        data: Map<String, Value>,
    },

    /// `success: false` - an error message plus a numeric code
    Error {
        /// Human-readable error message
        error: String,
        /// Numeric error code (HTTP-ish)
        code: u16,
    },
}

impl ModuleResponse {
    /// Builds a success response from result fields.
    pub fn success(data: Map<String, Value>) -> Self {
        ModuleResponse::Success { data }
    }

    /// Builds an error response.
    pub fn error(message: impl Into<String>, code: u16) -> Self {
        ModuleResponse::Error {
            error: message.into(),
            code,
        }
    }

    /// Whether this is the success branch.
    pub fn is_success(&self) -> bool {
        matches!(self, ModuleResponse::Success { .. })
    }

    /// Renders the response as the JSON object sent to front-end callers.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        match self {
            ModuleResponse::Success { data } => {
                obj.insert("success".into(), Value::Bool(true));
                for (k, v) in data {
                    obj.insert(k.clone(), v.clone());
                }
            }
            ModuleResponse::Error { error, code } => {
                obj.insert("success".into(), Value::Bool(false));
                obj.insert("error".into(), Value::String(error.clone()));
                obj.insert("code".into(), Value::Number((*code).into()));
            }
        }
        Value::Object(obj)
    }

    /// Parses a worker-posted JSON object.
    ///
    /// A missing `success` field is treated as success: some worker SDKs
    /// only add the discriminant on failure.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let Value::Object(mut obj) = value else {
            return Err(Error::Other(
                "module response must be a JSON object".into(),
            ));
        };

        let success = match obj.remove("success") {
            Some(Value::Bool(b)) => b,
            Some(other) => {
                // Python truthiness leaks out of some workers
                !matches!(other, Value::Null)
            }
            None => true,
        };

        if success {
            Ok(ModuleResponse::Success { data: obj })
        } else {
            let error = obj
                .remove("error")
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_else(|| "unknown module error".into());
            let code = obj
                .remove("code")
                .and_then(|v| v.as_u64())
                .map(|c| u16::try_from(c).unwrap_or(500))
                .unwrap_or(500);
            Ok(ModuleResponse::Error { error, code })
        }
    }
}

impl From<&Error> for ModuleResponse {
    fn from(err: &Error) -> Self {
        ModuleResponse::error(err.to_string(), err.code())
    }
}

impl Serialize for ModuleResponse {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ModuleResponse {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ModuleResponse::from_value(value).map_err(serde::de::Error::custom)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
