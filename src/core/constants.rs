use btleplug::api::bleuuid::uuid_from_u16;
use uuid::Uuid;

/// Serial emulation service exposed by BLE ELM327 adapters.
pub const OBD_SERIAL_SERVICE_UUID: Uuid = uuid_from_u16(0xFFF0);
/// UUID of the notify characteristic carrying adapter output.
pub const OBD_NOTIFY_CHARACTERISTIC_UUID: Uuid = uuid_from_u16(0xFFF1);
/// UUID of the characteristic accepting adapter input.
pub const OBD_WRITE_CHARACTERISTIC_UUID: Uuid = uuid_from_u16(0xFFF2);

/// Prompt byte the ELM327 prints once it is ready for the next command.
pub const ELM_PROMPT: u8 = b'>';

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Stoichiometric air/fuel ratio for gasoline.
pub const GASOLINE_AFR: f64 = 14.7;
/// Gasoline density in grams per litre.
pub const GASOLINE_DENSITY_G_PER_L: f64 = 745.0;
/// Below this speed the per-distance consumption is reported as zero.
pub const MIN_SPEED_FOR_CONSUMPTION_KMH: f64 = 1.0;
