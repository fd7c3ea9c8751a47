//! Envelopes and the messages carried across service channels.
//!
//! Everything in this module is plain data: it is serialized to JSON
//! whenever it crosses a channel, so a receiver never shares memory with
//! the sender.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::ServiceName;

/// Correlation id of an outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Ulid);

impl RequestId {
    /// Create a new unique request ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a request ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Routing wrapper: the only unit ever posted on a service's outbound channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub to: ServiceName,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(to: ServiceName, data: T) -> Self {
        Self { to, data }
    }
}

/// Every payload the bus knows how to carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "camelCase")]
pub enum BusMessage {
    /// A call that expects exactly one [`Response`].
    Request(Request),
    /// The answer to a [`Request`], correlated by id.
    Response(Response),
    /// A command for the job executor.
    Job(JobCommand),
}

impl BusMessage {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            BusMessage::Request(_) => "request",
            BusMessage::Response(_) => "response",
            BusMessage::Job(JobCommand::Process { .. }) => "job.process",
            BusMessage::Job(JobCommand::Abort { .. }) => "job.abort",
        }
    }
}

/// A named operation addressed to another service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_id: RequestId,
    pub from: ServiceName,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub data: Value,
    /// Raw bytes that came in alongside the request, if any. Carried as
    /// base64 text on the bus.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub binary: Option<Vec<u8>>,
}

impl Request {
    pub fn new(from: ServiceName, name: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: RequestId::new(),
            from,
            name: name.into(),
            key: None,
            data,
            binary: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_binary(mut self, binary: Vec<u8>) -> Self {
        self.binary = Some(binary);
        self
    }

    /// Build the successful answer to this request.
    pub fn respond(&self, from: ServiceName, data: Value) -> Response {
        Response {
            request_id: self.request_id,
            from,
            name: self.name.clone(),
            key: self.key.clone(),
            data,
            error: None,
        }
    }

    /// Build the failed answer to this request.
    pub fn fail(&self, from: ServiceName, error: impl Into<String>) -> Response {
        Response {
            request_id: self.request_id,
            from,
            name: self.name.clone(),
            key: self.key.clone(),
            data: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Answer to a [`Request`]. `request_id` is copied unchanged from the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: RequestId,
    pub from: ServiceName,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Split into the payload or the remote error message.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

/// Commands understood by the job executor service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum JobCommand {
    /// Start a job. `job_name` is resolved against the executor's handlers.
    #[serde(rename_all = "camelCase")]
    Process {
        job_name: String,
        job_id: String,
        #[serde(default)]
        payload: Value,
    },
    /// Signal the cancellation token of a running job.
    #[serde(rename_all = "camelCase")]
    Abort { job_id: String },
}

impl JobCommand {
    /// Name of the request that carries a command when the sender wants
    /// its outcome. The command itself is the request's data.
    pub const REQUEST: &'static str = "jobCommand";

    pub fn job_id(&self) -> &str {
        match self {
            JobCommand::Process { job_id, .. } | JobCommand::Abort { job_id } => job_id,
        }
    }
}

/// Serde adapter that writes optional bytes as base64 text.
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
