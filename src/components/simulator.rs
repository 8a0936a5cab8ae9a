//! Simulated Adapter
//!
//! An in-process ELM327 emulator served over a `tokio::io::duplex` pipe and a
//! random-walk position source. Used by the `mock` feature and by tests.
use crate::api::controller::{Link, LinkOpener, PositionSource};
use crate::core::error::ConnectionError;
use crate::model::obd::{DeviceDescriptor, Pid};
use async_trait::async_trait;
use btleplug::api::BDAddr;
use log::{debug, trace};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const PIPE_CAPACITY: usize = 1024;
const METRES_PER_DEGREE: f64 = 111_320.0;

/// Values reported by the simulated vehicle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleProfile {
    pub rpm: f64,
    pub speed_kmh: f64,
    pub coolant_c: f64,
    pub maf_g_per_s: f64,
    pub engine_load_pct: f64,
    pub throttle_pct: f64,
    /// Relative random variation applied to every reading, e.g. 0.05 for ±5 %.
    pub jitter: f64,
}

impl Default for VehicleProfile {
    fn default() -> Self {
        Self {
            rpm: 1900.0,
            speed_kmh: 45.0,
            coolant_c: 88.0,
            maf_g_per_s: 7.5,
            engine_load_pct: 35.0,
            throttle_pct: 18.0,
            jitter: 0.05,
        }
    }
}

impl VehicleProfile {
    fn read(&self, value: f64) -> f64 {
        if self.jitter > 0.0 {
            value * (1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter))
        } else {
            value
        }
    }
}

/// Emulates the command handling of an ELM327 adapter.
#[derive(Debug, Clone)]
pub struct SimulatedElm327 {
    vehicle: VehicleProfile,
    echo: bool,
    linefeeds: bool,
    overrides: HashMap<String, String>,
    silent: HashSet<String>,
}

impl Default for SimulatedElm327 {
    fn default() -> Self {
        Self::new(VehicleProfile::default())
    }
}

impl SimulatedElm327 {
    pub fn new(vehicle: VehicleProfile) -> Self {
        Self {
            vehicle,
            echo: true,
            linefeeds: true,
            overrides: HashMap::new(),
            silent: HashSet::new(),
        }
    }

    /// Answers `request` with a fixed text instead of the emulated one.
    pub fn with_response(mut self, request: &str, response: &str) -> Self {
        self.overrides
            .insert(request.to_uppercase(), response.to_owned());
        self
    }

    /// Never answers `request`.
    pub fn with_silent(mut self, request: &str) -> Self {
        self.silent.insert(request.to_uppercase());
        self
    }

    /// Response body for `request`, `None` if the adapter stays silent.
    pub fn respond(&mut self, request: &str) -> Option<String> {
        let request: String = request
            .chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_uppercase)
            .collect();
        if self.silent.contains(&request) {
            return None;
        }
        if let Some(response) = self.overrides.get(&request) {
            return Some(response.clone());
        }
        let response = match request.as_str() {
            "ATZ" | "ATWS" => {
                self.echo = true;
                self.linefeeds = true;
                "ELM327 v1.5".to_owned()
            }
            "ATI" => "ELM327 v1.5".to_owned(),
            "AT@1" => "OBDII to RS232 Interpreter".to_owned(),
            "ATE0" | "ATE1" => {
                self.echo = request.ends_with('1');
                "OK".to_owned()
            }
            "ATL0" | "ATL1" => {
                self.linefeeds = request.ends_with('1');
                "OK".to_owned()
            }
            "ATDP" => "AUTO, ISO 15765-4 (CAN 11/500)".to_owned(),
            c if c.starts_with("AT") => {
                if matches!(
                    &c[2..c.len().min(4)],
                    "S0" | "S1" | "H0" | "H1" | "SP" | "ST" | "AT" | "D"
                ) {
                    "OK".to_owned()
                } else {
                    "?".to_owned()
                }
            }
            c if c.starts_with("01") && c.len() == 4 => self.mode01(&c[2..]),
            _ => "?".to_owned(),
        };
        Some(response)
    }

    fn mode01(&self, pid: &str) -> String {
        let Ok(code) = u8::from_str_radix(pid, 16) else {
            return "?".to_owned();
        };
        let v = &self.vehicle;
        let data: Vec<u8> = match code {
            0x00 => {
                let mask = [
                    Pid::EngineLoad,
                    Pid::CoolantTemperature,
                    Pid::EngineRpm,
                    Pid::VehicleSpeed,
                    Pid::MafAirFlow,
                    Pid::ThrottlePosition,
                ]
                .iter()
                .fold(0u32, |mask, pid| mask | 1 << (32 - pid.code() as u32));
                mask.to_be_bytes().to_vec()
            }
            0x04 => vec![percent_byte(v.read(v.engine_load_pct))],
            0x05 => vec![(v.read(v.coolant_c) + 40.0).clamp(0.0, 255.0) as u8],
            0x0C => word(v.read(v.rpm) * 4.0),
            0x0D => vec![v.read(v.speed_kmh).clamp(0.0, 255.0) as u8],
            0x10 => word(v.read(v.maf_g_per_s) * 100.0),
            0x11 => vec![percent_byte(v.read(v.throttle_pct))],
            _ => return "NO DATA".to_owned(),
        };
        let mut response = format!("41 {:02X}", code);
        for byte in data {
            response.push_str(&format!(" {:02X}", byte));
        }
        response
    }

    /// Full byte sequence written for `request`: echo, body and prompt.
    fn reply(&mut self, request: &str) -> Option<Vec<u8>> {
        let echoed = self.echo;
        let body = self.respond(request)?;
        let eol = if self.linefeeds { "\r\n" } else { "\r" };
        let mut out = String::new();
        if echoed {
            out.push_str(request);
            out.push_str(eol);
        }
        out.push_str(&body);
        out.push_str(eol);
        out.push_str(eol);
        out.push('>');
        Some(out.into_bytes())
    }

    /// Starts serving on a fresh pipe and returns the client end as a link.
    pub fn spawn(self) -> Link {
        let (client, device) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(self.serve(device));
        let (reader, writer) = tokio::io::split(client);
        Link::from_io(reader, writer)
    }

    async fn serve(mut self, mut stream: DuplexStream) {
        let mut line = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &byte in &chunk[..n] {
                match byte {
                    b'\r' => {
                        let request = String::from_utf8_lossy(&line).trim().to_owned();
                        line.clear();
                        if request.is_empty() {
                            continue;
                        }
                        trace!("Simulator RX '{}'", request);
                        if let Some(reply) = self.reply(&request) {
                            if stream.write_all(&reply).await.is_err() {
                                return;
                            }
                        }
                    }
                    b'\n' => {}
                    _ => line.push(byte),
                }
            }
        }
        debug!("Simulated adapter closed");
    }
}

fn percent_byte(percent: f64) -> u8 {
    (percent * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8
}

fn word(raw: f64) -> Vec<u8> {
    (raw.round().clamp(0.0, u16::MAX as f64) as u16)
        .to_be_bytes()
        .to_vec()
}

/// Opens links to a [`SimulatedElm327`]; each connection gets a fresh copy.
#[derive(Debug, Clone, Default)]
pub struct SimulatedAdapter {
    template: SimulatedElm327,
}

impl SimulatedAdapter {
    pub fn new(template: SimulatedElm327) -> Self {
        Self { template }
    }

    /// The device the simulated adapter presents itself as.
    pub fn device() -> DeviceDescriptor {
        DeviceDescriptor {
            name: "OBDII Simulator".to_owned(),
            address: BDAddr::from([0x0B, 0xD2, 0x00, 0x00, 0x00, 0x01]),
        }
    }
}

#[async_trait]
impl LinkOpener for SimulatedAdapter {
    async fn open(&self, device: &DeviceDescriptor) -> Result<Link, ConnectionError> {
        if device.address != Self::device().address {
            return Err(ConnectionError::Unreachable(device.to_string()));
        }
        Ok(self.template.clone().spawn())
    }
}

/// Random walk around a start coordinate.
#[derive(Debug, Clone)]
pub struct SimulatedRoute {
    position: [f64; 2],
    heading_deg: f64,
    step_m: f64,
}

impl SimulatedRoute {
    /// `step_m` is the distance covered between two position reads.
    pub fn new(start: [f64; 2], step_m: f64) -> Self {
        Self {
            position: start,
            heading_deg: 0.0,
            step_m,
        }
    }
}

#[async_trait]
impl PositionSource for SimulatedRoute {
    async fn current_position(&mut self) -> Option<[f64; 2]> {
        let turn = rand::thread_rng().gen_range(-20.0..=20.0);
        self.heading_deg = (self.heading_deg + turn).rem_euclid(360.0);
        let heading = self.heading_deg.to_radians();
        let [lat, lon] = self.position;
        self.position = [
            lat + self.step_m * heading.cos() / METRES_PER_DEGREE,
            lon + self.step_m * heading.sin() / (METRES_PER_DEGREE * lat.to_radians().cos()),
        ];
        Some(self.position)
    }
}
