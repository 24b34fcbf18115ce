//! Control-channel message types.
//!
//! Requests flow controller → worker, events flow worker → controller. Both
//! travel on channel 0, JSON-encoded by `JsonCodec`. Events that hand over
//! logical channels carry their ids; the referenced `Open` frames are always
//! written before the event itself.

use serde::{Deserialize, Serialize};

use super::frame::ChannelId;
use crate::env::EnvDiff;

/// Bumped whenever frames or control messages change incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Correlates a request with its channels and its terminal event.
///
/// UUID v4 so ids are never reused across the lifetime of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages from controller to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// First message on a new connection; answered with `Ready`.
    Hello {
        protocol_version: u32,
        label: String,
    },

    Exec {
        request: RequestId,
        cwd: String,
        argv: Vec<String>,
        /// `None` inherits the worker environment unmodified.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env: Option<EnvDiff>,
    },

    PushFile {
        request: RequestId,
        /// Path template (`~/…`, `{tmp}/…` or plain).
        path: String,
    },

    OpenSocket {
        request: RequestId,
    },

    /// Stop accepting on a tunnel opened by `OpenSocket`.
    CloseSocket {
        request: RequestId,
    },

    Shutdown,
}

/// Messages from worker to controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Ready {
        protocol_version: u32,
        version: String,
        pid: u32,
    },

    /// Stdio channels are open; the process is running.
    ExecStarted {
        request: RequestId,
        stdin: ChannelId,
        stdout: ChannelId,
        stderr: ChannelId,
    },

    ExecFinished {
        request: RequestId,
        exit_code: i32,
    },

    /// The process could not be started.
    ExecFailed {
        request: RequestId,
        error: String,
    },

    /// Data channel is open; the controller should stream the file body.
    PushAccepted {
        request: RequestId,
        channel: ChannelId,
    },

    PushConfirmed {
        request: RequestId,
        path: String,
        size: u64,
    },

    PushFailed {
        request: RequestId,
        path: String,
        error: String,
        /// Bytes received before the failure.
        written: u64,
    },

    SocketBound {
        request: RequestId,
        host: String,
        port: u16,
    },

    SocketAccepted {
        request: RequestId,
        remote_host: String,
        remote_port: u16,
        channel: ChannelId,
    },

    SocketFailed {
        request: RequestId,
        error: String,
    },

    /// Listener closed; no further `SocketAccepted` for this request.
    SocketClosed {
        request: RequestId,
    },

    ShuttingDown,
}

impl ControlEvent {
    pub fn request(&self) -> Option<RequestId> {
        match self {
            Self::ExecStarted { request, .. }
            | Self::ExecFinished { request, .. }
            | Self::ExecFailed { request, .. }
            | Self::PushAccepted { request, .. }
            | Self::PushConfirmed { request, .. }
            | Self::PushFailed { request, .. }
            | Self::SocketBound { request, .. }
            | Self::SocketAccepted { request, .. }
            | Self::SocketFailed { request, .. }
            | Self::SocketClosed { request } => Some(*request),
            Self::Ready { .. } | Self::ShuttingDown => None,
        }
    }

    /// Channels handed over by this event.
    pub fn channels(&self) -> Vec<ChannelId> {
        match self {
            Self::ExecStarted {
                stdin,
                stdout,
                stderr,
                ..
            } => vec![*stdin, *stdout, *stderr],
            Self::PushAccepted { channel, .. } | Self::SocketAccepted { channel, .. } => {
                vec![*channel]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvDiff;

    fn test_request_id() -> RequestId {
        RequestId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    #[test]
    fn hello_serializes() {
        let req = ControlRequest::Hello {
            protocol_version: 1,
            label: "node-a".to_string(),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "hello",
          "protocol_version": 1,
          "label": "node-a"
        }
        "#);
    }

    #[test]
    fn exec_without_env_omits_field() {
        let req = ControlRequest::Exec {
            request: test_request_id(),
            cwd: ".".to_string(),
            argv: vec!["echo".to_string(), "hi".to_string()],
            env: None,
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "exec",
          "request": "550e8400-e29b-41d4-a716-446655440000",
          "cwd": ".",
          "argv": [
            "echo",
            "hi"
          ]
        }
        "#);
    }

    #[test]
    fn exec_env_diff_serializes_typed() {
        let mut env = EnvDiff::new();
        env.set("NEWVAR", "random value");
        env.unset("HOME");
        let req = ControlRequest::Exec {
            request: test_request_id(),
            cwd: "/tmp".to_string(),
            argv: vec!["sh".to_string()],
            env: Some(env),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "exec",
          "request": "550e8400-e29b-41d4-a716-446655440000",
          "cwd": "/tmp",
          "argv": [
            "sh"
          ],
          "env": {
            "HOME": "unset",
            "NEWVAR": {
              "set": "random value"
            }
          }
        }
        "#);
    }

    #[test]
    fn empty_env_diff_differs_from_absent() {
        let with_empty = ControlRequest::Exec {
            request: test_request_id(),
            cwd: ".".to_string(),
            argv: vec!["sh".to_string()],
            env: Some(EnvDiff::new()),
        };
        let json = serde_json::to_string(&with_empty).unwrap();
        assert!(json.contains(r#""env":{}"#));

        match serde_json::from_str::<ControlRequest>(&json).unwrap() {
            ControlRequest::Exec { env, .. } => assert_eq!(env, Some(EnvDiff::new())),
            other => panic!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn push_failed_serializes() {
        let event = ControlEvent::PushFailed {
            request: test_request_id(),
            path: "/work/target/test-file.dat".to_string(),
            error: "Failed to rename target file".to_string(),
            written: 2000,
        };
        insta::assert_json_snapshot!(event, @r#"
        {
          "type": "push_failed",
          "request": "550e8400-e29b-41d4-a716-446655440000",
          "path": "/work/target/test-file.dat",
          "error": "Failed to rename target file",
          "written": 2000
        }
        "#);
    }

    #[test]
    fn exec_started_serializes_channel_ids() {
        let event = ControlEvent::ExecStarted {
            request: test_request_id(),
            stdin: ChannelId::new(2),
            stdout: ChannelId::new(4),
            stderr: ChannelId::new(6),
        };
        insta::assert_json_snapshot!(event, @r#"
        {
          "type": "exec_started",
          "request": "550e8400-e29b-41d4-a716-446655440000",
          "stdin": 2,
          "stdout": 4,
          "stderr": 6
        }
        "#);
    }

    #[test]
    fn shutdown_serializes() {
        insta::assert_json_snapshot!(ControlRequest::Shutdown, @r#"
        {
          "type": "shutdown"
        }
        "#);
    }

    #[test]
    fn event_accessors() {
        let request = test_request_id();
        let event = ControlEvent::SocketAccepted {
            request,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 50123,
            channel: ChannelId::new(8),
        };
        assert_eq!(event.request(), Some(request));
        assert_eq!(event.channels(), vec![ChannelId::new(8)]);
        assert_eq!(ControlEvent::ShuttingDown.request(), None);
        assert!(ControlEvent::ExecFinished { request, exit_code: 0 }.channels().is_empty());
    }
}
