//! OBD Model
//!
//! This module defines the model and utility structures for talking to an ELM327-compatible
//! OBD adapter over a serial-style link.
//! It provides abstractions for:
//! - Discoverable adapter devices
//! - Commands with their expected-response matchers and timeouts
//! - Framing of the adapter's prompt-terminated output
//! - Decoding of mode 01 parameter responses

use crate::core::constants::{
    ELM_PROMPT, GASOLINE_AFR, GASOLINE_DENSITY_G_PER_L, MIN_SPEED_FOR_CONSUMPTION_KMH,
};
use crate::core::error::CommandError;
use btleplug::api::BDAddr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Represents a discovered Bluetooth OBD adapter.
///
/// Contains:
/// - Device name (if available)
/// - Bluetooth address (MAC)
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceDescriptor {
    /// The name of the device.
    pub name: String,
    /// The unique Bluetooth address of the device.
    pub address: BDAddr,
}

impl DeviceDescriptor {
    /// Checks whether the device name contains `filter`, ignoring case.
    pub fn is_obd_adapter(&self, filter: &str) -> bool {
        self.name.to_lowercase().contains(&filter.to_lowercase())
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// A local Bluetooth adapter, identified by a handle generated at discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterDescriptor {
    name: String,
    uuid: Uuid,
}

impl AdapterDescriptor {
    pub fn new(name: String) -> Self {
        Self {
            name,
            uuid: Uuid::new_v4(),
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_uuid(&self) -> &Uuid {
        &self.uuid
    }
}

/// Lifecycle state of the adapter link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionState::Disconnected => "Not Connected",
            ConnectionState::Connecting => "Connecting ...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Failed => "Failed to connect",
        };
        f.write_str(text)
    }
}

/// Mode 01 parameter ids read by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pid {
    SupportedPids,
    EngineLoad,
    CoolantTemperature,
    EngineRpm,
    VehicleSpeed,
    MafAirFlow,
    ThrottlePosition,
    EngineFuelRate,
}

impl Pid {
    /// Returns the numeric parameter id.
    pub fn code(&self) -> u8 {
        match self {
            Pid::SupportedPids => 0x00,
            Pid::EngineLoad => 0x04,
            Pid::CoolantTemperature => 0x05,
            Pid::EngineRpm => 0x0C,
            Pid::VehicleSpeed => 0x0D,
            Pid::MafAirFlow => 0x10,
            Pid::ThrottlePosition => 0x11,
            Pid::EngineFuelRate => 0x5E,
        }
    }

    /// Number of data bytes following the `41 XX` header.
    fn data_len(&self) -> usize {
        match self {
            Pid::SupportedPids => 4,
            Pid::EngineRpm | Pid::MafAirFlow | Pid::EngineFuelRate => 2,
            _ => 1,
        }
    }

    /// The request string sent to the adapter, e.g. `010C`.
    pub fn request(&self) -> String {
        format!("01{:02X}", self.code())
    }

    /// Decodes the physical value from an adapter response.
    ///
    /// Units: RPM in 1/min, speed in km/h, temperature in °C, MAF in g/s,
    /// fuel rate in L/h, load and throttle in percent. `SupportedPids` yields
    /// the raw 32-bit support mask.
    pub fn decode(&self, response: &str) -> Result<f64, CommandError> {
        let bytes = self.data_bytes(response)?;
        let a = bytes[0] as f64;
        let b = bytes.get(1).copied().unwrap_or(0) as f64;
        let value = match self {
            Pid::SupportedPids => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            Pid::EngineLoad | Pid::ThrottlePosition => a * 100.0 / 255.0,
            Pid::CoolantTemperature => a - 40.0,
            Pid::EngineRpm => (a * 256.0 + b) / 4.0,
            Pid::VehicleSpeed => a,
            Pid::MafAirFlow => (a * 256.0 + b) / 100.0,
            Pid::EngineFuelRate => (a * 256.0 + b) / 20.0,
        };
        Ok(value)
    }

    /// Checks whether this parameter is flagged in a `0100` support mask.
    pub fn is_supported_by(&self, mask: u32) -> bool {
        match self.code() {
            0 => true,
            code @ 1..=0x20 => mask & (1 << (32 - code as u32)) != 0,
            _ => false,
        }
    }

    fn data_bytes(&self, response: &str) -> Result<Vec<u8>, CommandError> {
        let malformed = || CommandError::MalformedResponse(response.to_owned());
        let compact = normalize(response);
        let header = format!("41{:02X}", self.code());
        let data = compact.strip_prefix(&header).ok_or_else(malformed)?;
        let needed = self.data_len() * 2;
        if !data.is_ascii() || data.len() < needed {
            return Err(malformed());
        }
        (0..needed)
            .step_by(2)
            .map(|i| u8::from_str_radix(&data[i..i + 2], 16).map_err(|_| malformed()))
            .collect()
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.request())
    }
}

/// Decides whether a response text belongs to the command that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMatcher {
    /// Any non-empty response except the adapter's `?` (unknown command).
    Any,
    /// The response must start with this prefix, whitespace and case ignored.
    Prefix(String),
}

impl ResponseMatcher {
    pub fn matches(&self, response: &str) -> bool {
        let compact = normalize(response);
        match self {
            ResponseMatcher::Any => !compact.is_empty() && compact != "?",
            ResponseMatcher::Prefix(prefix) => compact.starts_with(&normalize(prefix)),
        }
    }
}

/// A textual adapter command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    id: String,
    request: String,
    matcher: ResponseMatcher,
    timeout: Option<Duration>,
}

impl Command {
    /// Creates a command whose id is its request text.
    pub fn new(request: &str, matcher: ResponseMatcher) -> Self {
        Self {
            id: request.to_owned(),
            request: request.to_owned(),
            matcher,
            timeout: None,
        }
    }

    /// Mode 01 query for a parameter.
    pub fn pid(pid: Pid) -> Self {
        Self::new(
            &pid.request(),
            ResponseMatcher::Prefix(format!("41{:02X}", pid.code())),
        )
    }

    /// Adapter configuration command, e.g. `ATE0`.
    pub fn at(request: &str) -> Self {
        Self::new(request, ResponseMatcher::Any)
    }

    /// Overrides the dispatcher's default timeout for this command.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Commands that bring a freshly connected adapter into a known state:
    /// reset, echo off, linefeeds off, 125 x 4 ms adapter timeout and
    /// automatic protocol selection.
    pub fn init_sequence() -> Vec<Command> {
        vec![
            Command::at("ATZ").with_timeout(Duration::from_secs(3)),
            Command::at("ATE0"),
            Command::at("ATL0"),
            Command::at("ATST7D"),
            Command::at("ATSP0"),
        ]
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn matcher(&self) -> &ResponseMatcher {
        &self.matcher
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Bytes written to the link.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.request.as_bytes().to_vec();
        bytes.push(b'\r');
        bytes
    }

    /// Removes an echoed request line from a framed response.
    pub fn strip_echo(&self, frame: &str) -> String {
        let request = normalize(&self.request);
        frame
            .lines()
            .filter(|line| normalize(line) != request)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Splits the adapter output into prompt-terminated responses.
#[derive(Debug, Default)]
pub struct ResponseFramer {
    buffer: Vec<u8>,
}

impl ResponseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every response completed by a prompt.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut frames = Vec::new();
        for &byte in bytes {
            match byte {
                ELM_PROMPT => {
                    frames.push(Self::clean(&self.buffer));
                    self.buffer.clear();
                }
                0 => {}
                _ => self.buffer.push(byte),
            }
        }
        frames
    }

    fn clean(raw: &[u8]) -> String {
        String::from_utf8_lossy(raw)
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("SEARCHING"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Fuel flow in L/h derived from the mass air flow in g/s.
pub fn fuel_rate_from_maf(maf_g_per_s: f64) -> f64 {
    maf_g_per_s * 3600.0 / (GASOLINE_AFR * GASOLINE_DENSITY_G_PER_L)
}

/// Consumption in L/100 km; 0.0 while the vehicle is (almost) stationary.
pub fn consumption_per_100km(fuel_rate_l_per_h: f64, speed_kmh: f64) -> f64 {
    if speed_kmh < MIN_SPEED_FOR_CONSUMPTION_KMH {
        0.0
    } else {
        fuel_rate_l_per_h * 100.0 / speed_kmh
    }
}

/// Uppercase with all whitespace removed.
fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_requests() {
        assert_eq!(Pid::EngineRpm.request(), "010C");
        assert_eq!(Pid::EngineFuelRate.request(), "015E");
        assert_eq!(Command::pid(Pid::SupportedPids).id(), "0100");
    }

    #[test]
    fn test_decode_rpm() {
        assert_eq!(Pid::EngineRpm.decode("41 0C 1A F8").unwrap(), 1726.0);
        assert_eq!(Pid::EngineRpm.decode("410C1AF8").unwrap(), 1726.0);
    }

    #[test]
    fn test_decode_single_byte_pids() {
        assert_eq!(Pid::VehicleSpeed.decode("41 0D 32").unwrap(), 50.0);
        assert_eq!(Pid::CoolantTemperature.decode("41 05 7B").unwrap(), 83.0);
        assert_eq!(Pid::ThrottlePosition.decode("41 11 FF").unwrap(), 100.0);
    }

    #[test]
    fn test_decode_maf_and_fuel_rate() {
        assert_eq!(Pid::MafAirFlow.decode("41 10 01 F4").unwrap(), 5.0);
        assert_eq!(Pid::EngineFuelRate.decode("41 5E 00 64").unwrap(), 5.0);
    }

    #[test]
    fn test_decode_rejects_foreign_or_short_responses() {
        assert!(matches!(
            Pid::EngineRpm.decode("NO DATA"),
            Err(CommandError::MalformedResponse(_))
        ));
        assert!(matches!(
            Pid::EngineRpm.decode("41 0D 32"),
            Err(CommandError::MalformedResponse(_))
        ));
        assert!(matches!(
            Pid::EngineRpm.decode("41 0C 1A"),
            Err(CommandError::MalformedResponse(_))
        ));
        assert!(matches!(
            Pid::VehicleSpeed.decode("41 0D ZZ"),
            Err(CommandError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_decode_rejects_noise_bytes() {
        let mut framer = ResponseFramer::new();
        let frames = framer.push(b"41 0D \xFF\xFE\r\r>");
        assert_eq!(frames.len(), 1);
        assert!(Command::pid(Pid::VehicleSpeed).matcher().matches(&frames[0]));
        assert!(matches!(
            Pid::VehicleSpeed.decode(&frames[0]),
            Err(CommandError::MalformedResponse(_))
        ));
        assert!(matches!(
            Pid::EngineRpm.decode("41 0C 1\u{e9}F8"),
            Err(CommandError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_supported_mask() {
        let mask = Pid::SupportedPids.decode("41 00 BE 1F A8 13").unwrap() as u32;
        assert_eq!(mask, 0xBE1FA813);
        assert!(Pid::EngineRpm.is_supported_by(mask));
        assert!(Pid::VehicleSpeed.is_supported_by(mask));
        assert!(!Pid::EngineFuelRate.is_supported_by(mask));
    }

    #[test]
    fn test_matcher() {
        let cmd = Command::pid(Pid::EngineRpm);
        assert!(cmd.matcher().matches("41 0C 1A F8"));
        assert!(!cmd.matcher().matches("NO DATA"));
        assert!(ResponseMatcher::Any.matches("OK"));
        assert!(!ResponseMatcher::Any.matches("?"));
        assert!(!ResponseMatcher::Any.matches("  "));
    }

    #[test]
    fn test_framer_splits_on_prompt() {
        let mut framer = ResponseFramer::new();
        assert!(framer.push(b"41 0C ").is_empty());
        let frames = framer.push(b"1A F8\r\r>OK\r>");
        assert_eq!(frames, vec!["41 0C 1A F8".to_string(), "OK".to_string()]);
    }

    #[test]
    fn test_framer_drops_searching_lines() {
        let mut framer = ResponseFramer::new();
        let frames = framer.push(b"SEARCHING...\r41 00 BE 1F A8 13\r\r>");
        assert_eq!(frames, vec!["41 00 BE 1F A8 13".to_string()]);
    }

    #[test]
    fn test_strip_echo() {
        let cmd = Command::pid(Pid::VehicleSpeed);
        assert_eq!(cmd.strip_echo("010D\n41 0D 32"), "41 0D 32");
        assert_eq!(cmd.strip_echo("41 0D 32"), "41 0D 32");
    }

    #[test]
    fn test_command_bytes_are_cr_terminated() {
        assert_eq!(Command::at("ATE0").to_bytes(), b"ATE0\r".to_vec());
    }

    #[test]
    fn test_device_filter() {
        let dev = DeviceDescriptor {
            name: "OBDII Vlink".to_string(),
            address: BDAddr::default(),
        };
        assert!(dev.is_obd_adapter("obd"));
        assert!(!dev.is_obd_adapter("hrm"));
    }

    #[test]
    fn test_fuel_consumption() {
        let lph = fuel_rate_from_maf(GASOLINE_AFR * GASOLINE_DENSITY_G_PER_L / 3600.0);
        assert!((lph - 1.0).abs() < 1e-9);
        assert_eq!(consumption_per_100km(6.0, 100.0), 6.0);
        assert_eq!(consumption_per_100km(1.2, 0.0), 0.0);
    }
}
