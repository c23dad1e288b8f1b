//! Event codec seam and the bundled line-based codec
//!
//! The binary event-broker codec lives outside this crate; links only need
//! something that turns an [`EventRecord`] into bytes and incrementally turns
//! received bytes back into records. [`TextEventCodec`] is the packed text
//! form used by the broker tooling:
//!
//! ```text
//! EVT HOST_CHECK name=web01;state=0;output=PING OK\n
//! ```
//!
//! Keys and values escape `\`, `;`, `=` and newlines with a backslash.

use crate::common::{Error, Result};

use super::types::EventRecord;

/// Event type names understood by the event broker
pub const EVENT_TYPES: &[&str] = &[
    "PROCESS",
    "TIMED_EVENT",
    "LOG",
    "SYSTEM_COMMAND",
    "EVENT_HANDLER",
    "NOTIFICATION",
    "SERVICE_CHECK",
    "HOST_CHECK",
    "COMMENT",
    "DOWNTIME",
    "FLAPPING",
    "PROGRAM_STATUS",
    "HOST_STATUS",
    "SERVICE_STATUS",
    "ADAPTIVE_PROGRAM",
    "ADAPTIVE_HOST",
    "ADAPTIVE_SERVICE",
    "EXTERNAL_COMMAND",
    "AGGREGATED_STATUS",
    "RETENTION",
    "CONTACT_NOTIFICATION",
    "CONTACT_NOTIFICATION_METHOD",
    "ACKNOWLEDGEMENT",
    "STATE_CHANGE",
    "CONTACT_STATUS",
    "ADAPTIVE_CONTACT",
    "CTRL_ACTIVE",
];

/// Whether `name` is a known event type
pub fn is_event_type(name: &str) -> bool {
    EVENT_TYPES.contains(&name)
}

/// Encodes events and creates per-link decoders
pub trait EventCodec: Send + Sync {
    /// Encode one event into its wire bytes
    fn encode(&self, event: &EventRecord) -> Result<Vec<u8>>;

    /// Create a fresh incremental decoder for one link
    fn decoder(&self) -> Box<dyn EventDecoder>;
}

/// Incremental decoder fed with raw bytes as they arrive
pub trait EventDecoder: Send {
    /// Append received bytes
    fn push(&mut self, data: &[u8]);

    /// Take the next complete event, if one is buffered
    fn next_event(&mut self) -> Result<Option<EventRecord>>;
}

/// Line-oriented `EVT <TYPE> k=v;k=v` codec
#[derive(Debug, Clone, Default)]
pub struct TextEventCodec;

/// Longest line the text decoder buffers before giving up (1 MB)
const MAX_LINE: usize = 1024 * 1024;

impl EventCodec for TextEventCodec {
    fn encode(&self, event: &EventRecord) -> Result<Vec<u8>> {
        if !is_event_type(&event.event_type) {
            return Err(Error::Codec(format!(
                "Unknown event type {}",
                event.event_type
            )));
        }

        let fields: Vec<String> = event
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect();

        Ok(format!("EVT {} {}\n", event.event_type, fields.join(";")).into_bytes())
    }

    fn decoder(&self) -> Box<dyn EventDecoder> {
        Box::new(TextEventDecoder::default())
    }
}

/// Decoder half of [`TextEventCodec`]
#[derive(Debug, Default)]
pub struct TextEventDecoder {
    buffer: Vec<u8>,
}

impl EventDecoder for TextEventDecoder {
    fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_event(&mut self) -> Result<Option<EventRecord>> {
        loop {
            let Some(end) = self.buffer.iter().position(|&b| b == b'\n') else {
                if self.buffer.len() > MAX_LINE {
                    return Err(Error::Codec(format!(
                        "Event line longer than {} bytes",
                        MAX_LINE
                    )));
                }
                return Ok(None);
            };

            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8(line)
                .map_err(|e| Error::Codec(format!("Invalid UTF-8: {}", e)))?;
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                continue;
            }
            return parse_line(line).map(Some);
        }
    }
}

fn parse_line(line: &str) -> Result<EventRecord> {
    let rest = line
        .strip_prefix("EVT ")
        .ok_or_else(|| Error::Codec(format!("Not an event line: {}", line)))?;
    let (event_type, packed) = rest.split_once(' ').unwrap_or((rest, ""));

    if !is_event_type(event_type) {
        return Err(Error::Codec(format!("Unknown event type {}", event_type)));
    }

    let mut record = EventRecord::new(event_type);
    for pair in split_unescaped(packed, ';') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = split_unescaped(&pair, '=').into_iter();
        let key = parts.next().unwrap_or_default();
        let value: Vec<String> = parts.collect();
        if value.is_empty() {
            return Err(Error::Codec(format!("Field without value: {}", pair)));
        }
        record
            .fields
            .push((unescape(&key), unescape(&value.join("="))));
    }

    Ok(record)
}

/// Split on `sep`, leaving escape sequences intact for a later [`unescape`]
fn split_unescaped(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            '=' => out.push_str("\\="),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let event = EventRecord::new("CTRL_ACTIVE")
            .with("version", "1")
            .with("configured_peers", "0");
        let bytes = TextEventCodec.encode(&event).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "EVT CTRL_ACTIVE version=1;configured_peers=0\n"
        );
    }

    #[test]
    fn test_encode_rejects_unknown_type() {
        let err = TextEventCodec.encode(&EventRecord::new("BOGUS")).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn test_decode_partial_input() {
        let mut decoder = TextEventCodec.decoder();
        decoder.push(b"EVT HOST_CHECK name=web01;st");
        assert_eq!(decoder.next_event().unwrap(), None);

        decoder.push(b"ate=0\n\nEVT CTRL_ACTIVE \n");
        let first = decoder.next_event().unwrap().unwrap();
        assert_eq!(first.event_type, "HOST_CHECK");
        assert_eq!(first.get("name"), Some("web01"));
        assert_eq!(first.get("state"), Some("0"));

        let second = decoder.next_event().unwrap().unwrap();
        assert_eq!(second, EventRecord::new("CTRL_ACTIVE"));
        assert_eq!(decoder.next_event().unwrap(), None);
    }

    #[test]
    fn test_escaped_separators_survive() {
        let event = EventRecord::new("LOG")
            .with("data", "a=b; c\\d")
            .with("multi", "line1\nline2");
        let bytes = TextEventCodec.encode(&event).unwrap();

        let mut decoder = TextEventCodec.decoder();
        decoder.push(&bytes);
        assert_eq!(decoder.next_event().unwrap(), Some(event));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut decoder = TextEventCodec.decoder();
        decoder.push(b"hello\n");
        assert!(decoder.next_event().is_err());

        let mut decoder = TextEventCodec.decoder();
        decoder.push(b"EVT HOST_CHECK name\n");
        assert!(decoder.next_event().is_err());
    }
}
