use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// Error details carried by an `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsError {
    pub code: i32,
    pub message: String,
}

/// Envelope for every text message on the channel.
///
/// `payload` stays raw until the receiver knows which type to decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

impl Message {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let payload = payload
            .map(serde_json::value::to_raw_value)
            .transpose()?;
        Ok(Self {
            id: id.into(),
            msg_type,
            payload,
            error: None,
        })
    }

    /// Decodes the payload, failing if it is absent.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        let raw = self.payload.as_ref().map(|r| r.get()).unwrap_or("null");
        serde_json::from_str(raw)
    }

    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(WsError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Builds a response that carries this request's id.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Message::new(&self.id, msg_type, Some(payload))
    }

    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Message::error(&self.id, code, message)
    }
}
