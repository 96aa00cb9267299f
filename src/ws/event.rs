// realtime-hub/src/ws/event.rs

//! Event taxonomy and the wire envelope.
//!
//! Every frame the hub sends is a text frame of the form
//! `{EventName}\n{json payload}`. Clients split on the first newline and use
//! the name to decide how to decode the rest.

use crate::ws::types::Payload;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Every event the hub can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerDeleted,
    ServerModified,
    ChannelCreated,
    ChannelDeleted,
    ChannelModified,
    MessageCreated,
    MessageDeleted,
    MessageModified,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::ServerDeleted,
        EventKind::ServerModified,
        EventKind::ChannelCreated,
        EventKind::ChannelDeleted,
        EventKind::ChannelModified,
        EventKind::MessageCreated,
        EventKind::MessageDeleted,
        EventKind::MessageModified,
    ];

    /// The tag written in front of the payload.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ServerDeleted => "ServerDeleted",
            EventKind::ServerModified => "ServerModified",
            EventKind::ChannelCreated => "ChannelCreated",
            EventKind::ChannelDeleted => "ChannelDeleted",
            EventKind::ChannelModified => "ChannelModified",
            EventKind::MessageCreated => "MessageCreated",
            EventKind::MessageDeleted => "MessageDeleted",
            EventKind::MessageModified => "MessageModified",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind: {}", s))
    }
}

/// Encoding and decoding of `{EventName}\n{json}` frames.
pub struct Envelope;

impl Envelope {
    /// Serializes `payload` and prefixes it with the event tag.
    pub fn encode<T: Serialize + ?Sized>(
        event: EventKind,
        payload: &T,
    ) -> Result<Payload, serde_json::Error> {
        let json = serde_json::to_string(payload)?;
        let tag = event.as_str();

        let mut frame = String::with_capacity(tag.len() + 1 + json.len());
        frame.push_str(tag);
        frame.push('\n');
        frame.push_str(&json);
        Ok(Payload::from(frame))
    }

    /// Splits a frame back into its event kind and raw JSON payload.
    pub fn decode(frame: &str) -> Option<(EventKind, &str)> {
        let (tag, json) = frame.split_once('\n')?;
        let kind = tag.parse().ok()?;
        Some((kind, json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_prefixes_tag() {
        let frame = Envelope::encode(
            EventKind::MessageCreated,
            &json!({ "id": 1, "content": "hi" }),
        )
        .unwrap();
        assert_eq!(frame.as_str(), "MessageCreated\n{\"content\":\"hi\",\"id\":1}");
    }

    #[test]
    fn test_decode_splits_on_first_newline() {
        let (kind, json) = Envelope::decode("MessageDeleted\n\"line\\nbreak\"").unwrap();
        assert_eq!(kind, EventKind::MessageDeleted);
        assert_eq!(json, "\"line\\nbreak\"");
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        assert!(Envelope::decode("Nope\n{}").is_none());
        assert!(Envelope::decode("ServerDeleted").is_none());
    }

    #[test]
    fn test_every_kind_parses_back() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>(), Ok(kind));
        }
    }
}
