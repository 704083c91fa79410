//! Wire contract: request parsing, error taxonomy and response encoding.
//!
//! A request is one JSON object of at most [`MAX_COMMAND_SIZE`] bytes carrying
//! a string `cmd` field. Responses are single-line JSON objects, either
//! `{"status":"ok","cmd":...}` or `{"status":"error","code":...}`.

use crate::activity::{LogEntry, LogStats};
use crate::config_store::WifiCredentials;
use crate::estop::EstopStatus;
use crate::health::HealthReport;
use crate::hub::{HubSnapshot, PowerLevel};
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::io;
use thiserror::Error;

pub const MAX_COMMAND_SIZE: usize = 512;
pub const MAX_RESPONSE_SIZE: usize = 16 * 1024;

/// Inbound command slot.
pub type CommandBuffer = heapless::String<MAX_COMMAND_SIZE>;
pub type ResponseBuffer = ArrayString<MAX_RESPONSE_SIZE>;

/// Every command kind, in the order `help` lists them.
pub const COMMAND_KINDS: [&str; 11] = [
    "port", "hub", "alloff", "boot", "reset", "led", "config", "log", "status", "ping", "help",
];

const OVERSIZED_RESPONSE: &str =
    r#"{"status":"error","code":"internal","message":"response too large"}"#;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("malformed command")]
    Malformed(String),
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("invalid field '{field}'")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
    #[error("{field} {value} out of range")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("{target} unavailable")]
    Unavailable {
        target: String,
        reason: &'static str,
    },
    #[error("hardware write failed")]
    Hardware(String),
    #[error("unknown command")]
    UnknownCommand(String),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::MissingField(_) => "missing_field",
            Self::InvalidField { .. } => "invalid_field",
            Self::OutOfRange { .. } => "out_of_range",
            Self::Unavailable { .. } => "unavailable",
            Self::Hardware(_) => "hardware",
            Self::UnknownCommand(_) => "unknown_command",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Malformed(detail) | Self::Hardware(detail) => Some(detail.clone()),
            Self::MissingField(_) => None,
            Self::InvalidField { expected, .. } => Some(format!("expected {expected}")),
            Self::OutOfRange { min, max, .. } => Some(format!("valid range {min}..={max}")),
            Self::Unavailable { reason, .. } => Some((*reason).to_string()),
            Self::UnknownCommand(name) => Some(name.clone()),
        }
    }

    pub(crate) fn invalid(field: &'static str, expected: &'static str) -> Self {
        Self::InvalidField { field, expected }
    }

    pub(crate) fn unavailable(target: impl Into<String>, reason: &'static str) -> Self {
        Self::Unavailable {
            target: target.into(),
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorId {
    Status,
    Activity,
    Error,
}

impl IndicatorId {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "status" => Some(Self::Status),
            "activity" => Some(Self::Activity),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Activity => "activity",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorAction {
    On,
    Off,
    Toggle,
    Blink,
}

impl IndicatorAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "toggle" => Some(Self::Toggle),
            "blink" => Some(Self::Blink),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Toggle => "toggle",
            Self::Blink => "blink",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortAction {
    Power(PowerLevel),
    Enable(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubChange {
    Led(bool),
    /// Hub-wide current limit, `true` for high.
    Power(bool),
    Usbc(bool),
    /// All four ports at once.
    State(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetAction {
    Level(bool),
    Pulse(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Port { port: u16, action: PortAction },
    Hub { hub: u16, change: Option<HubChange> },
    AllOff,
    Boot { state: bool },
    Reset(ResetAction),
    Led { led: IndicatorId, action: IndicatorAction },
    Config {
        wifi: Option<WifiCredentials>,
        mdns: Option<String>,
    },
    Log { count: Option<u16> },
    Status,
    Ping,
    Help,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Port { .. } => "port",
            Self::Hub { .. } => "hub",
            Self::AllOff => "alloff",
            Self::Boot { .. } => "boot",
            Self::Reset(_) => "reset",
            Self::Led { .. } => "led",
            Self::Config { .. } => "config",
            Self::Log { .. } => "log",
            Self::Status => "status",
            Self::Ping => "ping",
            Self::Help => "help",
        }
    }

    /// Kinds that change hub outputs or the boot/reset lines.
    pub fn is_mutating(&self) -> bool {
        match self {
            Self::Port { .. } | Self::AllOff | Self::Boot { .. } | Self::Reset(_) => true,
            Self::Hub { change, .. } => change.is_some(),
            _ => false,
        }
    }

    /// Parse one command line.
    ///
    /// Field types are checked here; index ranges depend on the board and
    /// are checked by the processor.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        if text.len() > MAX_COMMAND_SIZE {
            return Err(CommandError::Malformed(format!(
                "command exceeds {MAX_COMMAND_SIZE} bytes"
            )));
        }
        let value: Value =
            serde_json::from_str(text).map_err(|e| CommandError::Malformed(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(CommandError::Malformed("expected a JSON object".into()));
        };
        let fields = Fields(&fields);

        let cmd = fields.str("cmd")?.ok_or(CommandError::MissingField("cmd"))?;

        match cmd {
            "port" => {
                let port = fields.required_u16("port")?;
                let action = match (fields.str("power")?, fields.bool("enable")?) {
                    (Some(_), Some(_)) => {
                        return Err(CommandError::invalid("port", "one of power, enable"))
                    }
                    (Some(power), None) => PortAction::Power(
                        PowerLevel::parse(power)
                            .ok_or(CommandError::invalid("power", "off, low or high"))?,
                    ),
                    (None, Some(enable)) => PortAction::Enable(enable),
                    (None, None) => return Err(CommandError::MissingField("power")),
                };
                Ok(Self::Port { port, action })
            }
            "hub" => {
                let hub = fields.required_u16("hub")?;
                let mut changes = Vec::new();
                if let Some(on) = fields.bool("led")? {
                    changes.push(HubChange::Led(on));
                }
                if let Some(power) = fields.str("power")? {
                    let high = match PowerLevel::parse(power) {
                        Some(PowerLevel::High) => true,
                        Some(PowerLevel::Low) => false,
                        _ => return Err(CommandError::invalid("power", "low or high")),
                    };
                    changes.push(HubChange::Power(high));
                }
                if let Some(on) = fields.bool("usbc")? {
                    changes.push(HubChange::Usbc(on));
                }
                if let Some(on) = fields.bool("state")? {
                    changes.push(HubChange::State(on));
                }
                if changes.len() > 1 {
                    return Err(CommandError::invalid("hub", "one of led, power, usbc, state"));
                }
                Ok(Self::Hub {
                    hub,
                    change: changes.pop(),
                })
            }
            "alloff" => Ok(Self::AllOff),
            "boot" => Ok(Self::Boot {
                state: fields.bool("state")?.ok_or(CommandError::MissingField("state"))?,
            }),
            "reset" => {
                if let Some(pulse) = fields.u64("pulse")? {
                    let pulse = u32::try_from(pulse).map_err(|_| CommandError::OutOfRange {
                        field: "pulse",
                        value: pulse,
                        min: 0,
                        max: u64::from(u32::MAX),
                    })?;
                    Ok(Self::Reset(ResetAction::Pulse(pulse)))
                } else if let Some(state) = fields.bool("state")? {
                    Ok(Self::Reset(ResetAction::Level(state)))
                } else {
                    Err(CommandError::MissingField("state"))
                }
            }
            "led" => {
                let led = fields.str("led")?.ok_or(CommandError::MissingField("led"))?;
                let action = fields.str("action")?.ok_or(CommandError::MissingField("action"))?;
                Ok(Self::Led {
                    led: IndicatorId::parse(led)
                        .ok_or(CommandError::invalid("led", "status, activity or error"))?,
                    action: IndicatorAction::parse(action)
                        .ok_or(CommandError::invalid("action", "on, off, toggle or blink"))?,
                })
            }
            "config" => {
                let wifi = match fields.get("wifi") {
                    None => None,
                    Some(value) => Some(
                        serde_json::from_value::<WifiCredentials>(value.clone())
                            .map_err(|_| CommandError::invalid("wifi", "{ssid, password}"))?,
                    ),
                };
                let mdns = fields.str("mdns")?.map(str::to_string);
                Ok(Self::Config { wifi, mdns })
            }
            "log" => Ok(Self::Log {
                count: fields.u16("count")?,
            }),
            "status" => Ok(Self::Status),
            "ping" => Ok(Self::Ping),
            "help" => Ok(Self::Help),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

/// Typed access to the fields of a request object.
///
/// An absent field is `Ok(None)`; a present field of the wrong type is an
/// error, never silently ignored.
struct Fields<'a>(&'a Map<String, Value>);

impl<'a> Fields<'a> {
    fn get(&self, name: &str) -> Option<&'a Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    fn str(&self, name: &'static str) -> Result<Option<&'a str>, CommandError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(CommandError::invalid(name, "a string")),
        }
    }

    fn bool(&self, name: &'static str) -> Result<Option<bool>, CommandError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(CommandError::invalid(name, "a boolean")),
        }
    }

    fn u64(&self, name: &'static str) -> Result<Option<u64>, CommandError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .map(Some)
                .ok_or(CommandError::invalid(name, "an unsigned integer")),
        }
    }

    fn u16(&self, name: &'static str) -> Result<Option<u16>, CommandError> {
        match self.u64(name)? {
            None => Ok(None),
            Some(value) => u16::try_from(value).map(Some).map_err(|_| CommandError::OutOfRange {
                field: name,
                value,
                min: 0,
                max: u64::from(u16::MAX),
            }),
        }
    }

    fn required_u16(&self, name: &'static str) -> Result<u16, CommandError> {
        self.u16(name)?.ok_or(CommandError::MissingField(name))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PinLevels {
    pub boot: bool,
    pub reset: bool,
}

/// Everything `status` reports and the periodic broadcast carries.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub board: String,
    pub uptime_ms: u32,
    pub commands: u32,
    pub total_ports: usize,
    pub hubs_connected: usize,
    pub hubs: Vec<HubSnapshot>,
    pub i2c: HealthReport,
    pub estop: EstopStatus,
    pub pins: PinLevels,
    pub log: LogStats,
}

pub fn ok_response(cmd: &str, context: Value) -> Value {
    let mut body = Map::new();
    body.insert("status".into(), json!("ok"));
    body.insert("cmd".into(), json!(cmd));
    if let Value::Object(extra) = context {
        body.extend(extra);
    }
    Value::Object(body)
}

pub fn error_response(error: &CommandError) -> Value {
    let mut body = json!({
        "status": "error",
        "code": error.code(),
        "message": error.to_string(),
    });
    if let (Some(detail), Value::Object(map)) = (error.detail(), &mut body) {
        map.insert("detail".into(), json!(detail));
    }
    body
}

pub fn status_broadcast(snapshot: &StatusSnapshot) -> Value {
    tagged("status", snapshot)
}

pub fn log_broadcast(entry: &LogEntry) -> Value {
    tagged("log", entry)
}

fn tagged<T: Serialize>(kind: &str, payload: &T) -> Value {
    let mut body = Map::new();
    body.insert("type".into(), json!(kind));
    if let Ok(Value::Object(fields)) = serde_json::to_value(payload) {
        body.extend(fields);
    }
    Value::Object(body)
}

/// Encodes outbound messages into a preallocated buffer.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    buffer: ResponseBuffer,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-line JSON, serialized straight into the buffer. Messages over
    /// [`MAX_RESPONSE_SIZE`] are replaced by a short internal error.
    pub fn encode<T: Serialize + ?Sized>(&mut self, message: &T) -> &str {
        self.buffer.clear();
        if let Err(e) = serde_json::to_writer(BoundedWriter(&mut self.buffer), message) {
            tracing::error!("response dropped: {}", e);
            self.buffer.clear();
            self.buffer.push_str(OVERSIZED_RESPONSE);
        }
        &self.buffer
    }
}

/// `io::Write` over the fixed response buffer; refuses to grow it.
struct BoundedWriter<'a>(&'a mut ResponseBuffer);

impl io::Write for BoundedWriter<'_> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        // serde_json only emits whole UTF-8 sequences per write
        let text = std::str::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.0
            .try_push_str(text)
            .map_err(|_| io::Error::new(io::ErrorKind::WriteZero, "response buffer full"))?;
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_power() {
        let request = Request::parse(r#"{"cmd":"port","port":5,"power":"high"}"#).unwrap();
        assert_eq!(
            request,
            Request::Port {
                port: 5,
                action: PortAction::Power(PowerLevel::High)
            }
        );
        assert!(request.is_mutating());
    }

    #[test]
    fn test_error_classes_stay_distinct() {
        let code = |text: &str| Request::parse(text).unwrap_err().code();

        assert_eq!(code("{not json"), "malformed");
        assert_eq!(code("[1,2]"), "malformed");
        assert_eq!(code(r#"{"port":1}"#), "missing_field");
        assert_eq!(code(r#"{"cmd":"port","power":"off"}"#), "missing_field");
        assert_eq!(code(r#"{"cmd":"port","port":"1","power":"off"}"#), "invalid_field");
        assert_eq!(code(r#"{"cmd":"port","port":1,"power":"HIGH"}"#), "invalid_field");
        assert_eq!(code(r#"{"cmd":"port","port":70000,"power":"off"}"#), "out_of_range");
        assert_eq!(code(r#"{"cmd":"reboot"}"#), "unknown_command");
    }

    #[test]
    fn test_hub_query_and_single_change() {
        assert_eq!(
            Request::parse(r#"{"cmd":"hub","hub":2}"#).unwrap(),
            Request::Hub { hub: 2, change: None }
        );
        assert_eq!(
            Request::parse(r#"{"cmd":"hub","hub":1,"led":true}"#).unwrap(),
            Request::Hub {
                hub: 1,
                change: Some(HubChange::Led(true))
            }
        );
        assert!(Request::parse(r#"{"cmd":"hub","hub":1,"led":true,"usbc":false}"#).is_err());
    }

    #[test]
    fn test_port_takes_power_or_enable() {
        assert_eq!(
            Request::parse(r#"{"cmd":"port","port":1,"enable":false}"#).unwrap(),
            Request::Port {
                port: 1,
                action: PortAction::Enable(false)
            }
        );
        let error = Request::parse(r#"{"cmd":"port","port":1,"power":"high","enable":false}"#)
            .unwrap_err();
        assert_eq!(error, CommandError::invalid("port", "one of power, enable"));
    }

    #[test]
    fn test_error_response_shape() {
        let error = CommandError::unavailable("hub 2", "not connected");
        let body = error_response(&error);
        assert_eq!(body["status"], "error");
        assert_eq!(body["code"], "unavailable");
        assert_eq!(body["message"], "hub 2 unavailable");
        assert_eq!(body["detail"], "not connected");
    }

    #[test]
    fn test_writer_replaces_oversized_message() {
        let mut writer = ResponseWriter::new();
        let huge = json!({ "blob": "x".repeat(MAX_RESPONSE_SIZE) });
        assert_eq!(writer.encode(&huge), OVERSIZED_RESPONSE);
        assert_eq!(writer.encode(&json!({"a":1})), r#"{"a":1}"#);

        // multi-byte text survives the chunked writes
        assert_eq!(writer.encode(&json!({"name":"hüb-ä"})), r#"{"name":"hüb-ä"}"#);
    }
}
