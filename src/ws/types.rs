// realtime-hub/src/ws/types.rs

//! Identifier and topic types shared by the hub components.

use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one live real-time session. Minted by the Snowflake generator.
pub type SessionId = u64;

/// Identifies the user that owns a session.
pub type UserId = u64;

/// A topic key such as `channel:123`.
pub type Topic = String;

/// An encoded envelope, ready to be written as a text frame.
pub type Payload = Utf8Bytes;

/// The kind of resource a topic follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    /// Messages of one channel. A session watches at most one at a time.
    Channel,
    /// Channel roster of one server. A session watches at most one at a time.
    Server,
    /// Server-list entry of one server. A session may watch many at once.
    ServerList,
}

impl TopicKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TopicKind::Channel => "channel",
            TopicKind::Server => "server",
            TopicKind::ServerList => "server_list",
        }
    }

    /// Builds the `{kind}:{id}` topic key.
    pub fn topic(self, id: u64) -> Topic {
        format!("{}:{}", self.as_str(), id)
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopicKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "channel" => Ok(TopicKind::Channel),
            "server" => Ok(TopicKind::Server),
            "server_list" => Ok(TopicKind::ServerList),
            other => Err(format!("unknown topic kind: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_keys() {
        assert_eq!(TopicKind::Channel.topic(5), "channel:5");
        assert_eq!(TopicKind::Server.topic(18), "server:18");
        assert_eq!(TopicKind::ServerList.topic(100), "server_list:100");
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("server_list".parse::<TopicKind>(), Ok(TopicKind::ServerList));
        assert!("servers".parse::<TopicKind>().is_err());
    }
}
