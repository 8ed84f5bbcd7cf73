use base64::Engine;

/// One websocket text message on a device channel.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "hello")]
    Hello {
        project: String,
        device: String,
        agent_version: String,
    },
    #[serde(rename = "open")]
    Open { stream: u64 },
    #[serde(rename = "data")]
    Data { stream: u64, payload_b64: String },
    #[serde(rename = "close")]
    Close { stream: u64 },
    /// Returns `credit` data frames of send window to the peer.
    #[serde(rename = "window")]
    Window { stream: u64, credit: u32 },
    #[serde(other)]
    Unknown,
}

impl Frame {
    pub fn data(stream: u64, payload: &[u8]) -> Self {
        Frame::Data {
            stream,
            payload_b64: base64::engine::general_purpose::STANDARD.encode(payload),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Unparseable text decodes to `Unknown` so a peer speaking a newer
    /// protocol does not tear the channel down.
    pub fn decode(text: &str) -> Frame {
        serde_json::from_str(text).unwrap_or(Frame::Unknown)
    }
}

pub(crate) fn decode_payload(payload_b64: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(payload_b64.as_bytes())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_uses_type_tag() {
        let text = Frame::Hello {
            project: "p".to_string(),
            device: "d".to_string(),
            agent_version: "1.0.0".to_string(),
        }
        .encode()
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v.get("type").unwrap().as_str().unwrap(), "hello");
    }

    #[test]
    fn unknown_and_garbage_frames_decode_to_unknown() {
        assert_eq!(Frame::decode(r#"{"type":"ping"}"#), Frame::Unknown);
        assert_eq!(Frame::decode("not json"), Frame::Unknown);
    }

    #[test]
    fn data_payload_survives_encoding() {
        let frame = Frame::decode(&Frame::data(7, b"\x00\x01bytes").encode().unwrap());
        let Frame::Data { stream, payload_b64 } = frame else {
            panic!("expected data frame");
        };
        assert_eq!(stream, 7);
        assert_eq!(decode_payload(&payload_b64).unwrap(), b"\x00\x01bytes");
    }
}
