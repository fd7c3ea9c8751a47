//! Typed routing of decoded client messages.

use bytes::Bytes;
use serde_json::Value;

use crate::frame::ParsedMessage;

/// Every message a client may send, keyed by `(namespace, type)`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `jobs/process`: start a background job.
    ProcessJob {
        request_id: String,
        job_name: String,
        job_id: String,
        payload: Value,
    },
    /// `jobs/abort`: cancel a running job.
    AbortJob { request_id: String, job_id: String },
    /// `files/sendFileData`: upload raw bytes for a target.
    SendFileData {
        request_id: String,
        target_id: String,
        data: Bytes,
    },
    /// `db/<operation>`: a persistence call.
    Database {
        request_id: String,
        operation: String,
        key: Option<String>,
        data: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler for {namespace}/{kind}")]
    UnknownRoute { namespace: String, kind: String },

    #[error("{namespace}/{kind} requires field `{field}`")]
    MissingField {
        namespace: String,
        kind: String,
        field: &'static str,
    },

    #[error("{namespace}/{kind} requires a binary payload")]
    MissingPayload { namespace: String, kind: String },
}

impl ClientMessage {
    pub fn request_id(&self) -> &str {
        match self {
            ClientMessage::ProcessJob { request_id, .. }
            | ClientMessage::AbortJob { request_id, .. }
            | ClientMessage::SendFileData { request_id, .. }
            | ClientMessage::Database { request_id, .. } => request_id,
        }
    }

    /// Namespace replies to this message are sent under.
    pub fn namespace(&self) -> &'static str {
        match self {
            ClientMessage::ProcessJob { .. } | ClientMessage::AbortJob { .. } => "jobs",
            ClientMessage::SendFileData { .. } => "files",
            ClientMessage::Database { .. } => "db",
        }
    }

    /// Message type replies to this message are sent under.
    pub fn kind(&self) -> &str {
        match self {
            ClientMessage::ProcessJob { .. } => "process",
            ClientMessage::AbortJob { .. } => "abort",
            ClientMessage::SendFileData { .. } => "sendFileData",
            ClientMessage::Database { operation, .. } => operation,
        }
    }
}

impl TryFrom<ParsedMessage> for ClientMessage {
    type Error = DispatchError;

    fn try_from(message: ParsedMessage) -> Result<Self, Self::Error> {
        let route = Route::of(&message);
        let request_id = message.request_id().to_string();

        match (route.namespace.as_str(), route.kind.as_str()) {
            ("jobs", "process") => Ok(ClientMessage::ProcessJob {
                job_name: route.required_str(&message, "jobName")?,
                job_id: route.required_str(&message, "jobId")?,
                payload: message.field("payload").cloned().unwrap_or(Value::Null),
                request_id,
            }),
            ("jobs", "abort") => Ok(ClientMessage::AbortJob {
                job_id: route.required_str(&message, "jobId")?,
                request_id,
            }),
            ("files", "sendFileData") => {
                let target_id = route.required_str(&message, "targetId")?;
                let data = message.binary_data.ok_or_else(|| route.missing_payload())?;
                Ok(ClientMessage::SendFileData {
                    request_id,
                    target_id,
                    data,
                })
            }
            ("db", operation) => Ok(ClientMessage::Database {
                operation: operation.to_string(),
                key: message.str_field("key").map(str::to_string),
                data: message.field("data").cloned().unwrap_or(Value::Null),
                request_id,
            }),
            _ => Err(route.unknown()),
        }
    }
}

struct Route {
    namespace: String,
    kind: String,
}

impl Route {
    fn of(message: &ParsedMessage) -> Self {
        Self {
            namespace: message.namespace().to_string(),
            kind: message.kind().to_string(),
        }
    }

    fn required_str(&self, message: &ParsedMessage, field: &'static str) -> Result<String, DispatchError> {
        message
            .str_field(field)
            .map(str::to_string)
            .ok_or_else(|| DispatchError::MissingField {
                namespace: self.namespace.clone(),
                kind: self.kind.clone(),
                field,
            })
    }

    fn missing_payload(&self) -> DispatchError {
        DispatchError::MissingPayload {
            namespace: self.namespace.clone(),
            kind: self.kind.clone(),
        }
    }

    fn unknown(&self) -> DispatchError {
        DispatchError::UnknownRoute {
            namespace: self.namespace.clone(),
            kind: self.kind.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use crate::{Frame, MessageHeader, encode_binary_frame, read_message};
    use serde_json::json;

    fn text(value: Value) -> ParsedMessage {
        read_message(&Frame::Text(value.to_string())).unwrap()
    }

    #[test]
    fn job_messages_are_typed() {
        let message = text(json!({
            "namespace": "jobs", "type": "process", "requestId": "r1",
            "jobName": "createBackup", "jobId": "b-1", "payload": {"full": true}
        }));
        assert_eq!(
            ClientMessage::try_from(message),
            Ok(ClientMessage::ProcessJob {
                request_id: "r1".into(),
                job_name: "createBackup".into(),
                job_id: "b-1".into(),
                payload: json!({"full": true}),
            })
        );

        let abort = text(json!({"namespace": "jobs", "type": "abort", "requestId": "r2", "jobId": "b-1"}));
        assert_eq!(
            ClientMessage::try_from(abort).map(|m| m.kind().to_string()),
            Ok("abort".to_string())
        );
    }

    #[test]
    fn missing_job_id_is_reported() {
        let message = text(json!({"namespace": "jobs", "type": "abort", "requestId": "r2"}));
        assert!(matches!(
            ClientMessage::try_from(message),
            Err(DispatchError::MissingField { field: "jobId", .. })
        ));
    }

    #[test]
    fn file_data_needs_binary_payload() {
        let header = MessageHeader::new("files", "sendFileData", "r1").with_field("targetId", "t1");
        let frame = encode_binary_frame(&header, b"abc").unwrap();
        let message = read_message(&Frame::Binary(frame)).unwrap();
        assert!(matches!(
            ClientMessage::try_from(message),
            Ok(ClientMessage::SendFileData { ref target_id, ref data, .. })
                if target_id == "t1" && &data[..] == b"abc"
        ));

        let text_only = text(json!({
            "namespace": "files", "type": "sendFileData", "requestId": "r1", "targetId": "t1"
        }));
        assert!(matches!(
            ClientMessage::try_from(text_only),
            Err(DispatchError::MissingPayload { .. })
        ));
    }

    #[test]
    fn db_operations_carry_key_and_data() {
        let message = text(json!({
            "namespace": "db", "type": "put", "requestId": "r3", "key": "note-7", "data": {"body": "x"}
        }));
        assert_eq!(
            ClientMessage::try_from(message),
            Ok(ClientMessage::Database {
                request_id: "r3".into(),
                operation: "put".into(),
                key: Some("note-7".into()),
                data: json!({"body": "x"}),
            })
        );
    }

    #[test]
    fn unknown_routes_are_rejected() {
        let message = text(json!({"namespace": "chat", "type": "say", "requestId": "r4"}));
        assert_eq!(
            ClientMessage::try_from(message),
            Err(DispatchError::UnknownRoute {
                namespace: "chat".into(),
                kind: "say".into()
            })
        );
    }
}
