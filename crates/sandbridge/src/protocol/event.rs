use std::fmt;
use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::utils::base64_bytes;

/// Correlates forwarded events with a tunneled connection.
///
/// The accepting side uses the accepted socket's fd number. The far side
/// treats it as an opaque key and never interprets it as a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub RawFd);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// All tunnel traffic over a channel is wrapped in this typed envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyEvent {
    /// Connection lifecycle
    Open { id: ConnectionId },
    Close { id: ConnectionId },

    /// Data plane
    Data {
        id: ConnectionId,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },

    /// A single connection failed on the sending side
    ConnectionError {
        id: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Tunnel shutdown
    Stop,
    ServerError { error: RemoteError },
}

impl ProxyEvent {
    /// Connection the event refers to, if any
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            ProxyEvent::Open { id }
            | ProxyEvent::Close { id }
            | ProxyEvent::Data { id, .. }
            | ProxyEvent::ConnectionError { id, .. } => Some(*id),
            ProxyEvent::Stop | ProxyEvent::ServerError { .. } => None,
        }
    }

    /// Whether the event already tears its connection down, in which case a
    /// failure handling it must not be reported back as another error.
    pub fn is_teardown(&self) -> bool {
        matches!(
            self,
            ProxyEvent::Close { .. } | ProxyEvent::ConnectionError { .. }
        )
    }

    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyEvent::Open { .. } => "open",
            ProxyEvent::Close { .. } => "close",
            ProxyEvent::Data { .. } => "data",
            ProxyEvent::ConnectionError { .. } => "connection_error",
            ProxyEvent::Stop => "stop",
            ProxyEvent::ServerError { .. } => "server_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close_serialization() {
        let open = ProxyEvent::Open { id: ConnectionId(9) };
        let json = serde_json::to_string(&open).unwrap();
        assert_eq!(json, r#"{"type":"open","id":9}"#);

        let close = ProxyEvent::Close { id: ConnectionId(9) };
        let json = serde_json::to_string(&close).unwrap();
        assert_eq!(json, r#"{"type":"close","id":9}"#);

        let parsed: ProxyEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, close);
    }

    #[test]
    fn test_data_serialization() {
        let data = ProxyEvent::Data {
            id: ConnectionId(12),
            payload: b"10".to_vec(),
        };
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains(r#""type":"data"#));
        assert!(json.contains(r#""payload":"MTA=""#));

        let parsed: ProxyEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            ProxyEvent::Data { id, payload } => {
                assert_eq!(id, ConnectionId(12));
                assert_eq!(payload, b"10");
            }
            _ => panic!("Expected Data"),
        }
    }

    #[test]
    fn test_connection_error_message_is_optional() {
        let json = r#"{"type":"connection_error","id":4}"#;
        let parsed: ProxyEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            ProxyEvent::ConnectionError {
                id: ConnectionId(4),
                message: None
            }
        );

        let json = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, r#"{"type":"connection_error","id":4}"#);
    }

    #[test]
    fn test_stop_and_server_error_serialization() {
        let json = serde_json::to_string(&ProxyEvent::Stop).unwrap();
        assert_eq!(json, r#"{"type":"stop"}"#);

        let err = ProxyEvent::ServerError {
            error: RemoteError::new("BridgeError", "Channel closed"),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains(r#""type":"server_error"#));
        assert!(json.contains(r#""kind":"BridgeError"#));

        let parsed: ProxyEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_str::<ProxyEvent>(r#"{"type":"reboot","id":1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_event_accessors() {
        let cases = vec![
            (ProxyEvent::Open { id: ConnectionId(1) }, Some(1), false, "open"),
            (ProxyEvent::Close { id: ConnectionId(2) }, Some(2), true, "close"),
            (
                ProxyEvent::Data {
                    id: ConnectionId(3),
                    payload: vec![],
                },
                Some(3),
                false,
                "data",
            ),
            (
                ProxyEvent::ConnectionError {
                    id: ConnectionId(4),
                    message: None,
                },
                Some(4),
                true,
                "connection_error",
            ),
            (ProxyEvent::Stop, None, false, "stop"),
            (
                ProxyEvent::ServerError {
                    error: RemoteError::new("E", "m"),
                },
                None,
                false,
                "server_error",
            ),
        ];

        for (event, id, teardown, kind) in cases {
            assert_eq!(event.connection_id().map(|c| c.0), id, "{}", kind);
            assert_eq!(event.is_teardown(), teardown, "{}", kind);
            assert_eq!(event.kind(), kind);
        }
    }
}
