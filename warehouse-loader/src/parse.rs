use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::PipelineError;
use crate::queue::QueuedMessage;

/// A queue message whose payload parsed to a JSON object. The receipt token
/// travels with the parsed row so the batch can be acknowledged after a
/// durable load.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub id: String,
    pub receipt_token: String,
    pub row: Map<String, Value>,
    pub enqueued_at: DateTime<Utc>,
}

/// Parse a message payload into a row. Rows must be JSON objects so their
/// keys can be compared against warehouse columns. Malformed messages are
/// dropped by the caller, never retried.
pub fn parse_message(message: QueuedMessage) -> Result<ParsedMessage, PipelineError> {
    let value: Value = serde_json::from_str(&message.payload)
        .map_err(|e| PipelineError::Parse(format!("message {}: {}", message.id, e)))?;

    let Value::Object(row) = value else {
        return Err(PipelineError::Parse(format!(
            "message {}: payload is not a JSON object",
            message.id
        )));
    };

    Ok(ParsedMessage {
        id: message.id,
        receipt_token: message.receipt_token,
        row,
        enqueued_at: message.enqueued_at,
    })
}
