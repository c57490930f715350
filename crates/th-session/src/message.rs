use serde::{Deserialize, Serialize};

/// Requested PTY geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResizeRequest {
    pub rows: u16,
    pub cols: u16,
}

/// Inbound message. Exactly one key is present on the wire:
///
/// ```json
/// {"command": "testapp --fast"}
/// {"input": "\r"}
/// {"resize": {"rows": 40, "cols": 120}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    /// A full line, equivalent to typing it and pressing Enter.
    Command(String),
    /// Raw keystrokes.
    Input(String),
    Resize(ResizeRequest),
}

impl ClientMessage {
    /// Decode one frame.
    ///
    /// Bytes that are not JSON at all are an error and end the connection.
    /// JSON that does not match one of the three shapes, or a resize with a
    /// zero dimension, yields `Ok(None)` and is dropped.
    pub fn decode(frame: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_slice(frame)?;
        let msg = match serde_json::from_value::<ClientMessage>(value) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring unrecognised client message");
                return Ok(None);
            }
        };
        if let ClientMessage::Resize(ResizeRequest { rows, cols }) = msg {
            if rows == 0 || cols == 0 {
                tracing::debug!(rows, cols, "ignoring degenerate resize");
                return Ok(None);
            }
        }
        Ok(Some(msg))
    }
}

/// Outbound message: `{"output": "..."}`. Clients append `output` to their
/// terminal; chunk boundaries carry no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerMessage {
    pub output: String,
}

impl ServerMessage {
    pub fn output(text: impl Into<String>) -> Self {
        Self {
            output: text.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // A struct with a single String field cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}
