//! Parsed Firehose responses.

use std::collections::HashMap;

use tracing::warn;

use super::FirehoseError;
use super::framer::split_frames;
use super::xml::parse_elements;

pub const ACK: &str = "ACK";

/// One request/response cycle worth of device output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirehoseResponse {
    /// `value` of the `<response>` element, e.g. `ACK` or `NAK`.
    pub status: String,
    /// All other `<response>` attributes.
    pub properties: HashMap<String, String>,
    /// `<log>` values seen while waiting, in arrival order.
    pub logs: Vec<String>,
    /// Bytes that followed the frames in the read carrying the response.
    pub trailing_payload: Vec<u8>,
}

impl FirehoseResponse {
    pub fn is_ack(&self) -> bool {
        self.status == ACK
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Turn a non-ACK status into [`FirehoseError::Rejected`].
    pub fn check(self) -> Result<Self, FirehoseError> {
        if self.is_ack() {
            Ok(self)
        } else {
            Err(FirehoseError::Rejected {
                status: self.status,
                logs: self.logs,
            })
        }
    }

    /// Fold one physical read into the response.
    ///
    /// Returns true once a `<response>` frame was found; later frames in the
    /// same read are not examined, but still count toward the trailing offset.
    pub(crate) fn absorb(&mut self, chunk: &[u8]) -> bool {
        let split = split_frames(chunk);
        let mut found = false;

        for frame in &split.frames {
            let elements = match parse_elements(frame) {
                Ok(elements) => elements,
                Err(e) => {
                    warn!(error = %e, "Skipping unparsable frame");
                    continue;
                }
            };
            if let Some(resp) = elements.iter().find(|e| e.name == "response") {
                let Some(status) = resp.attr("value") else {
                    continue;
                };
                self.status = status.to_string();
                self.properties = resp
                    .attributes
                    .iter()
                    .filter(|(k, _)| k != "value")
                    .cloned()
                    .collect();
                found = true;
                break;
            }
            for log in elements.iter().filter(|e| e.name == "log") {
                if let Some(value) = log.attr("value") {
                    self.logs.push(value.to_string());
                }
            }
        }

        if found {
            self.trailing_payload = chunk[split.consumed..].to_vec();
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &str) -> String {
        format!(r#"<?xml version="1.0" encoding="UTF-8" ?><data>{body}</data>"#)
    }

    #[test]
    fn test_ack_with_property() {
        let mut resp = FirehoseResponse::default();
        assert!(resp.absorb(frame(r#"<response value="ACK" prop1="x"/>"#).as_bytes()));
        assert_eq!(resp.status, "ACK");
        assert_eq!(resp.properties.len(), 1);
        assert_eq!(resp.property("prop1"), Some("x"));
        assert!(resp.trailing_payload.is_empty());
    }

    #[test]
    fn test_log_then_response() {
        let mut chunk = frame(r#"<log value="boot ok"/>"#);
        chunk.push_str(&frame(r#"<response value="ACK" prop1="x"/>"#));
        let mut resp = FirehoseResponse::default();
        assert!(resp.absorb(chunk.as_bytes()));
        assert_eq!(resp.logs, vec!["boot ok".to_string()]);
        assert_eq!(resp.status, "ACK");
    }

    #[test]
    fn test_trailing_payload_after_all_frames() {
        let mut chunk = frame(r#"<response value="ACK"/>"#).into_bytes();
        chunk.extend_from_slice(frame(r#"<log value="late"/>"#).as_bytes());
        chunk.extend_from_slice(&[1, 2, 3]);

        let mut resp = FirehoseResponse::default();
        assert!(resp.absorb(&chunk));
        assert_eq!(resp.trailing_payload, vec![1, 2, 3]);
        // Frames after the response are skipped.
        assert!(resp.logs.is_empty());
    }

    #[test]
    fn test_logs_only() {
        let mut resp = FirehoseResponse::default();
        assert!(!resp.absorb(frame(r#"<log value="a"/>"#).as_bytes()));
        assert!(!resp.absorb(b"garbage"));
        assert_eq!(resp.logs, vec!["a".to_string()]);
    }

    #[test]
    fn test_check_rejects_nak() {
        let mut resp = FirehoseResponse::default();
        let mut chunk = frame(r#"<log value="bad lun"/>"#);
        chunk.push_str(&frame(r#"<response value="NAK"/>"#));
        resp.absorb(chunk.as_bytes());
        match resp.check() {
            Err(FirehoseError::Rejected { status, logs }) => {
                assert_eq!(status, "NAK");
                assert_eq!(logs, vec!["bad lun".to_string()]);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
