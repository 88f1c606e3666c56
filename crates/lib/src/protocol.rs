//! Wire protocol types shared by the gateway and the client.
//!
//! One JSON object per WebSocket frame. Requests carry a `requestId` that the gateway echoes
//! in its answer; push messages (`data`, `closed`, device `error`) carry no id and are routed
//! by `port` instead.

use serde::{Deserialize, Serialize};
use std::fmt;

/// WebSocket sub-protocol negotiated during the handshake.
pub const SUBPROTOCOL: &str = "serialport-net";

/// Reported by the health endpoint.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request identifier. Opaque to the gateway: any JSON number or string is echoed back as
/// received.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n.into())
    }
}

/// One enumerated device. Everything but `port` is absent when the driver does not know it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnp_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    /// USB vendor id, 4-digit lowercase hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vid: Option<String>,
    /// USB product id, 4-digit lowercase hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
}

impl DeviceDescriptor {
    pub fn named(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }
}

/// Wire request: `{ "requestId", "cmd", ...command fields }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    #[serde(flatten)]
    pub command: Command,
}

/// Client commands, tagged by `cmd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Command {
    Enumerate,
    Open {
        port: String,
        #[serde(rename = "baudRate")]
        baud_rate: u32,
    },
    Write {
        port: String,
        data: Vec<u8>,
    },
    Close {
        port: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Enumerate => "enumerate",
            Command::Open { .. } => "open",
            Command::Write { .. } => "write",
            Command::Close { .. } => "close",
        }
    }

    /// Port the command targets; `None` for `enumerate`.
    pub fn port(&self) -> Option<&str> {
        match self {
            Command::Enumerate => None,
            Command::Open { port, .. } | Command::Write { port, .. } | Command::Close { port } => {
                Some(port)
            }
        }
    }
}

/// Every frame the gateway sends, tagged by `cmd`.
///
/// `success`, `enumerate` and `error` with a `requestId` answer a request; `data`, `closed`
/// and `error` without one are pushes. Use [`ServerMessage::into_inbound`] for the typed split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum ServerMessage {
    Success {
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },
    Enumerate {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        devices: Vec<DeviceDescriptor>,
    },
    Error {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<String>,
        message: String,
    },
    Data {
        port: String,
        data: Vec<u8>,
    },
    Closed {
        port: String,
    },
}

/// Outcome of one request. Both success and error resolve the caller's future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success,
    Devices(Vec<DeviceDescriptor>),
    Error(String),
}

/// Unsolicited device event, routed by port name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
    Data { port: String, data: Vec<u8> },
    Closed { port: String },
    /// `port` is `None` for connection-level errors (e.g. an unparseable frame).
    Error { port: Option<String>, message: String },
}

/// A server frame split into "answers request `id`" and "push".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Response { id: RequestId, response: Response },
    Push(PushMessage),
}

impl ServerMessage {
    pub fn response(id: RequestId, response: Response) -> Self {
        match response {
            Response::Success => ServerMessage::Success { request_id: id },
            Response::Devices(devices) => ServerMessage::Enumerate {
                request_id: id,
                devices,
            },
            Response::Error(message) => ServerMessage::Error {
                request_id: Some(id),
                port: None,
                message,
            },
        }
    }

    pub fn push(push: PushMessage) -> Self {
        match push {
            PushMessage::Data { port, data } => ServerMessage::Data { port, data },
            PushMessage::Closed { port } => ServerMessage::Closed { port },
            PushMessage::Error { port, message } => ServerMessage::Error {
                request_id: None,
                port,
                message,
            },
        }
    }

    pub fn into_inbound(self) -> Inbound {
        match self {
            ServerMessage::Success { request_id } => Inbound::Response {
                id: request_id,
                response: Response::Success,
            },
            ServerMessage::Enumerate {
                request_id,
                devices,
            } => Inbound::Response {
                id: request_id,
                response: Response::Devices(devices),
            },
            ServerMessage::Error {
                request_id: Some(id),
                message,
                ..
            } => Inbound::Response {
                id,
                response: Response::Error(message),
            },
            ServerMessage::Error {
                request_id: None,
                port,
                message,
            } => Inbound::Push(PushMessage::Error { port, message }),
            ServerMessage::Data { port, data } => Inbound::Push(PushMessage::Data { port, data }),
            ServerMessage::Closed { port } => Inbound::Push(PushMessage::Closed { port }),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Best-effort `requestId` from a frame that did not parse as a [`Request`].
pub fn salvage_request_id(value: &serde_json::Value) -> Option<RequestId> {
    serde_json::from_value(value.get("requestId")?.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shapes() {
        let req: Request = serde_json::from_value(json!({
            "requestId": "abc",
            "cmd": "open",
            "port": "/dev/ttyUSB0",
            "baudRate": 115200
        }))
        .expect("parse open");
        assert_eq!(req.request_id, RequestId::Text("abc".into()));
        assert_eq!(
            req.command,
            Command::Open {
                port: "/dev/ttyUSB0".into(),
                baud_rate: 115200
            }
        );

        let req = Request {
            request_id: RequestId::from(7),
            command: Command::Write {
                port: "COM3".into(),
                data: vec![1, 2, 3],
            },
        };
        assert_eq!(
            serde_json::to_value(&req).expect("serialize"),
            json!({"requestId": 7, "cmd": "write", "port": "COM3", "data": [1, 2, 3]})
        );

        let req: Request =
            serde_json::from_str(r#"{"requestId":1,"cmd":"enumerate"}"#).expect("parse enumerate");
        assert_eq!(req.command, Command::Enumerate);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let res: Result<Request, _> =
            serde_json::from_str(r#"{"requestId":1,"cmd":"reboot","port":"COM1"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn missing_request_id_is_rejected() {
        let res: Result<Request, _> = serde_json::from_str(r#"{"cmd":"close","port":"COM1"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn server_message_wire_shapes() {
        let ok = ServerMessage::response(RequestId::from(3), Response::Success);
        assert_eq!(
            serde_json::to_value(&ok).expect("serialize"),
            json!({"requestId": 3, "cmd": "success"})
        );

        let push = ServerMessage::push(PushMessage::Data {
            port: "COM1".into(),
            data: vec![104, 105],
        });
        assert_eq!(
            serde_json::to_value(&push).expect("serialize"),
            json!({"cmd": "data", "port": "COM1", "data": [104, 105]})
        );

        let err = ServerMessage::push(PushMessage::Error {
            port: None,
            message: "bad frame".into(),
        });
        assert_eq!(
            serde_json::to_value(&err).expect("serialize"),
            json!({"cmd": "error", "message": "bad frame"})
        );
    }

    #[test]
    fn descriptor_omits_unknown_fields() {
        let mut d = DeviceDescriptor::named("/dev/ttyACM0");
        d.vid = Some("2341".into());
        assert_eq!(
            serde_json::to_value(&d).expect("serialize"),
            json!({"port": "/dev/ttyACM0", "vid": "2341"})
        );
    }

    #[test]
    fn error_with_id_is_a_response_and_without_is_a_push() {
        let m: ServerMessage =
            serde_json::from_str(r#"{"requestId":"9","cmd":"error","message":"nope"}"#)
                .expect("parse");
        assert_eq!(
            m.into_inbound(),
            Inbound::Response {
                id: RequestId::Text("9".into()),
                response: Response::Error("nope".into())
            }
        );

        let m: ServerMessage =
            serde_json::from_str(r#"{"cmd":"error","port":"COM1","message":"unplugged"}"#)
                .expect("parse");
        assert_eq!(
            m.into_inbound(),
            Inbound::Push(PushMessage::Error {
                port: Some("COM1".into()),
                message: "unplugged".into()
            })
        );
    }

    #[test]
    fn enumerate_answer_round_trips_into_devices() {
        let m: ServerMessage = serde_json::from_value(json!({
            "requestId": 1,
            "cmd": "enumerate",
            "devices": [{"port": "COM1", "manufacturer": "FTDI"}]
        }))
        .expect("parse");
        let Inbound::Response { response: Response::Devices(devices), .. } = m.into_inbound()
        else {
            panic!("expected devices response");
        };
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].manufacturer.as_deref(), Some("FTDI"));
    }

    #[test]
    fn salvage_request_id_from_bad_shape() {
        let v = json!({"requestId": 12, "cmd": "write", "port": "COM1", "data": "oops"});
        assert_eq!(salvage_request_id(&v), Some(RequestId::from(12)));
        assert_eq!(salvage_request_id(&json!({"cmd": "write"})), None);
    }

    #[test]
    fn numeric_ids_keep_their_exact_form() {
        for id in [json!(-3), json!(1.5), json!(u64::MAX)] {
            let req: Request = serde_json::from_value(json!({"requestId": id, "cmd": "enumerate"}))
                .expect("any JSON number is an id");
            let echoed = ServerMessage::response(req.request_id, Response::Success);
            assert_eq!(
                serde_json::to_value(&echoed).expect("serialize")["requestId"],
                id
            );
        }
        assert_ne!(RequestId::from(1), RequestId::Text("1".into()));
    }
}
