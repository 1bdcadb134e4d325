//! Wire types shared between a Worker process and the Execution Loop, plus
//! the client-visible [`OutputEvent`] the Gateway ultimately emits.
//!
//! A Worker Message is a tagged record `{ kind, payload }`; `kind` is one of
//! the six values recognized by the Jupyter-style message contract a Worker
//! is required to speak (see the Worker component contract). Only a subset
//! of payload fields ever reach a client — the rest exist purely so the
//! Execution Loop can recognize end-of-execution (`status(idle)`).

use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;

/// One message produced by a Worker's iopub channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum WorkerMessage {
    Stream(StreamPayload),
    DisplayData(DataPayload),
    ExecuteResult(DataPayload),
    Error(ErrorPayload),
    Status(StatusPayload),
    ExecuteInput(ExecuteInputPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPayload {
    pub name: StreamName,
    pub text: String,
}

/// `display_data` / `execute_result` carry a MIME-type -> value mapping
/// directly as the message's `payload` (the Worker emits the mapping
/// in-line, not nested under a `data` key). Only `image/png` (base64 bytes)
/// and `text/plain` are ever surfaced; other MIME types round-trip on the
/// wire but the Execution Loop ignores them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataPayload(pub HashMap<String, String>);

impl DataPayload {
    pub fn image_png(&self) -> Option<&str> {
        self.0.get("image/png").map(String::as_str)
    }

    pub fn text_plain(&self) -> Option<&str> {
        self.0.get("text/plain").map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: ExecutionState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteInputPayload {
    pub code: String,
    #[serde(default)]
    pub execution_count: u64,
}

/// Client-visible event emitted by the Execution Loop. The three shapes are
/// distinguished by field set alone (no `kind` tag) to match the NDJSON
/// schema in the external interface contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputEvent {
    Text {
        text: String,
    },
    Image {
        image: String,
        format: String,
    },
    Error {
        error: String,
        traceback: Vec<String>,
    },
}

impl OutputEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image_png(base64_bytes: impl Into<String>) -> Self {
        Self::Image {
            image: base64_bytes.into(),
            format: "png".to_string(),
        }
    }

    pub fn error(message: impl Into<String>, traceback: Vec<String>) -> Self {
        Self::Error {
            error: message.into(),
            traceback,
        }
    }
}

/// Translate one Worker Message into zero-or-one client-visible events, per
/// the Message -> Event translation table. `status` and `execute_input` are
/// state used internally only and never reach a client.
pub fn translate(message: &WorkerMessage) -> Option<OutputEvent> {
    match message {
        WorkerMessage::Stream(p) => Some(OutputEvent::text(p.text.clone())),
        WorkerMessage::DisplayData(p) | WorkerMessage::ExecuteResult(p) => {
            if let Some(png) = p.image_png() {
                Some(OutputEvent::image_png(png.to_string()))
            } else {
                p.text_plain().map(OutputEvent::text)
            }
        }
        WorkerMessage::Error(p) => {
            let message = if p.traceback.is_empty() {
                p.evalue.clone()
            } else {
                p.traceback.join("\n")
            };
            Some(OutputEvent::error(message, p.traceback.clone()))
        }
        WorkerMessage::Status(_) | WorkerMessage::ExecuteInput(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_translates_regardless_of_channel() {
        let msg = WorkerMessage::Stream(StreamPayload {
            name: StreamName::Stderr,
            text: "oops\n".into(),
        });
        assert_eq!(translate(&msg), Some(OutputEvent::text("oops\n")));
    }

    #[test]
    fn display_data_prefers_image_over_text() {
        let mut data = HashMap::new();
        data.insert("image/png".to_string(), "QUJD".to_string());
        data.insert("text/plain".to_string(), "<Figure>".to_string());
        let msg = WorkerMessage::DisplayData(DataPayload(data));
        assert_eq!(translate(&msg), Some(OutputEvent::image_png("QUJD")));
    }

    #[test]
    fn error_joins_traceback_when_present() {
        let msg = WorkerMessage::Error(ErrorPayload {
            ename: "ZeroDivisionError".into(),
            evalue: "division by zero".into(),
            traceback: vec!["line 1".into(), "line 2".into()],
        });
        assert_eq!(
            translate(&msg),
            Some(OutputEvent::error("line 1\nline 2", vec!["line 1".into(), "line 2".into()]))
        );
    }

    #[test]
    fn error_falls_back_to_evalue_without_traceback() {
        let msg = WorkerMessage::Error(ErrorPayload {
            ename: "RuntimeError".into(),
            evalue: "boom".into(),
            traceback: vec![],
        });
        assert_eq!(translate(&msg), Some(OutputEvent::error("boom", vec![])));
    }

    #[test]
    fn status_and_execute_input_are_suppressed() {
        let status = WorkerMessage::Status(StatusPayload {
            state: ExecutionState::Idle,
        });
        assert_eq!(translate(&status), None);

        let input = WorkerMessage::ExecuteInput(ExecuteInputPayload {
            code: "1+1".into(),
            execution_count: 1,
        });
        assert_eq!(translate(&input), None);
    }

    #[test]
    fn wire_round_trips_through_json() {
        let msg = WorkerMessage::Status(StatusPayload {
            state: ExecutionState::Busy,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"kind":"status","payload":{"state":"busy"}}"#);
        let back: WorkerMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, WorkerMessage::Status(StatusPayload { state: ExecutionState::Busy })));
    }
}
