//! OBD-II PID Definitions and Conversion Formulas
//!
//! Static catalog of the standard Mode 01 Parameter IDs with their SAE J1979
//! decoding formulas, units and plausible value ranges.

use crate::mode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Conversion formula applied to the payload bytes of a PID response.
///
/// `A` is the first payload byte, `B` the second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Formula {
    /// `A * scale + offset`
    Byte { scale: f64, offset: f64 },
    /// `(256 * A + B) * scale + offset`
    Word { scale: f64, offset: f64 },
    /// `(A << 24 | B << 16 | C << 8 | D) * scale + offset`
    DWord { scale: f64, offset: f64 },
}

impl Formula {
    /// Raw single byte
    pub const BYTE: Formula = Formula::Byte { scale: 1.0, offset: 0.0 };
    /// Raw 16-bit word
    pub const WORD: Formula = Formula::Word { scale: 1.0, offset: 0.0 };
    /// `A * 100 / 255` (%)
    pub const PERCENT: Formula = Formula::Byte { scale: 100.0 / 255.0, offset: 0.0 };
    /// `A - 40` (°C)
    pub const TEMPERATURE: Formula = Formula::Byte { scale: 1.0, offset: -40.0 };
    /// `(A - 128) * 100 / 128` (%)
    pub const FUEL_TRIM: Formula = Formula::Byte { scale: 100.0 / 128.0, offset: -100.0 };
    /// `(256 * A + B) / 4` (rpm)
    pub const RPM: Formula = Formula::Word { scale: 0.25, offset: 0.0 };
    /// `A - 125` (%)
    pub const TORQUE: Formula = Formula::Byte { scale: 1.0, offset: -125.0 };

    /// Number of payload bytes the formula consumes
    pub fn byte_len(&self) -> usize {
        match self {
            Formula::Byte { .. } => 1,
            Formula::Word { .. } => 2,
            Formula::DWord { .. } => 4,
        }
    }

    /// Apply the formula, returning `None` if the payload is too short
    pub fn apply(&self, data: &[u8]) -> Option<f64> {
        match *self {
            Formula::Byte { scale, offset } => {
                let a = *data.first()? as f64;
                Some(a * scale + offset)
            }
            Formula::Word { scale, offset } => {
                let a = *data.first()? as f64;
                let b = *data.get(1)? as f64;
                Some((a * 256.0 + b) * scale + offset)
            }
            Formula::DWord { scale, offset } => {
                let raw = data.get(..4)?.iter().fold(0u32, |acc, &byte| (acc << 8) | byte as u32);
                Some(raw as f64 * scale + offset)
            }
        }
    }
}

/// Catalog entry describing one PID
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PidDefinition {
    pub mode: u8,
    pub pid: u8,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    /// Payload bytes expected after the mode/PID echo
    pub bytes: usize,
    pub formula: Formula,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub poll_interval_ms: Option<u64>,
}

impl PidDefinition {
    /// Request string for this PID, e.g. `"010C"`
    pub fn request(&self) -> String {
        format!("{:02X}{:02X}", self.mode, self.pid)
    }

    /// Decode a payload into an engineering value
    pub fn decode(&self, data: &[u8]) -> Option<f64> {
        self.formula.apply(data)
    }

    /// Whether a decoded value falls inside the documented range
    pub fn in_range(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }

    /// Default polling priority (higher = polled earlier in each cycle)
    pub fn default_priority(&self) -> u8 {
        match self.poll_interval_ms {
            Some(ms) if ms <= 250 => 10,
            Some(ms) if ms <= 1000 => 5,
            _ => 2,
        }
    }
}

const fn current(
    pid: u8,
    name: &'static str,
    unit: &'static str,
    formula: Formula,
    range: (f64, f64),
    poll_interval_ms: Option<u64>,
) -> PidDefinition {
    let bytes = match formula {
        Formula::Byte { .. } => 1,
        Formula::Word { .. } => 2,
        Formula::DWord { .. } => 4,
    };
    PidDefinition {
        mode: mode::CURRENT_DATA,
        pid,
        name,
        unit: Some(unit),
        bytes,
        formula,
        min: Some(range.0),
        max: Some(range.1),
        poll_interval_ms,
    }
}

/// Standard Mode 01 PIDs
static STANDARD_PIDS: &[PidDefinition] = &[
    current(0x04, "Calculated Engine Load", "%", Formula::PERCENT, (0.0, 100.0), Some(250)),
    current(0x05, "Engine Coolant Temperature", "°C", Formula::TEMPERATURE, (-40.0, 215.0), Some(1000)),
    current(0x06, "Short Term Fuel Trim Bank 1", "%", Formula::FUEL_TRIM, (-100.0, 99.2), Some(2000)),
    current(0x07, "Long Term Fuel Trim Bank 1", "%", Formula::FUEL_TRIM, (-100.0, 99.2), Some(2000)),
    current(0x08, "Short Term Fuel Trim Bank 2", "%", Formula::FUEL_TRIM, (-100.0, 99.2), Some(2000)),
    current(0x09, "Long Term Fuel Trim Bank 2", "%", Formula::FUEL_TRIM, (-100.0, 99.2), Some(2000)),
    current(0x0A, "Fuel Pressure", "kPa", Formula::Byte { scale: 3.0, offset: 0.0 }, (0.0, 765.0), Some(1000)),
    current(0x0B, "Intake Manifold Pressure", "kPa", Formula::BYTE, (0.0, 255.0), Some(500)),
    current(0x0C, "Engine RPM", "rpm", Formula::RPM, (0.0, 16383.75), Some(250)),
    current(0x0D, "Vehicle Speed", "km/h", Formula::BYTE, (0.0, 255.0), Some(250)),
    current(0x0E, "Timing Advance", "°", Formula::Byte { scale: 0.5, offset: -64.0 }, (-64.0, 63.5), Some(500)),
    current(0x0F, "Intake Air Temperature", "°C", Formula::TEMPERATURE, (-40.0, 215.0), Some(2000)),
    current(0x10, "MAF Air Flow Rate", "g/s", Formula::Word { scale: 0.01, offset: 0.0 }, (0.0, 655.35), Some(1000)),
    current(0x11, "Throttle Position", "%", Formula::PERCENT, (0.0, 100.0), Some(250)),
    current(0x1F, "Run time since engine start", "s", Formula::WORD, (0.0, 65535.0), Some(5000)),
    current(0x21, "Distance with MIL on", "km", Formula::WORD, (0.0, 65535.0), None),
    current(0x2F, "Fuel Tank Level", "%", Formula::PERCENT, (0.0, 100.0), Some(10000)),
    current(0x31, "Distance since codes cleared", "km", Formula::WORD, (0.0, 65535.0), None),
    current(0x33, "Barometric Pressure", "kPa", Formula::BYTE, (0.0, 255.0), Some(10000)),
    current(0x42, "Control Module Voltage", "V", Formula::Word { scale: 0.001, offset: 0.0 }, (0.0, 65.535), Some(1000)),
    current(0x43, "Absolute Load Value", "%", Formula::Word { scale: 100.0 / 255.0, offset: 0.0 }, (0.0, 25700.0), Some(1000)),
    current(0x44, "Fuel Air Commanded Equivalence Ratio", "ratio", Formula::Word { scale: 1.0 / 32768.0, offset: 0.0 }, (0.0, 2.0), Some(1000)),
    current(0x45, "Relative Throttle Position", "%", Formula::PERCENT, (0.0, 100.0), Some(500)),
    current(0x46, "Ambient Air Temperature", "°C", Formula::TEMPERATURE, (-40.0, 215.0), Some(10000)),
    current(0x47, "Absolute Throttle Position B", "%", Formula::PERCENT, (0.0, 100.0), Some(500)),
    current(0x48, "Absolute Throttle Position C", "%", Formula::PERCENT, (0.0, 100.0), Some(500)),
    current(0x49, "Accelerator Pedal Position D", "%", Formula::PERCENT, (0.0, 100.0), Some(250)),
    current(0x4A, "Accelerator Pedal Position E", "%", Formula::PERCENT, (0.0, 100.0), Some(250)),
    current(0x4B, "Accelerator Pedal Position F", "%", Formula::PERCENT, (0.0, 100.0), Some(250)),
    current(0x4C, "Commanded Throttle Actuator", "%", Formula::PERCENT, (0.0, 100.0), Some(500)),
    current(0x4D, "Time run with MIL on", "min", Formula::WORD, (0.0, 65535.0), None),
    current(0x4E, "Time since codes cleared", "min", Formula::WORD, (0.0, 65535.0), None),
    current(0x51, "Fuel Type", "encoded", Formula::BYTE, (0.0, 23.0), None),
    current(0x52, "Ethanol Fuel Percentage", "%", Formula::PERCENT, (0.0, 100.0), None),
    current(0x5A, "Relative Accelerator Pedal Position", "%", Formula::PERCENT, (0.0, 100.0), Some(250)),
    current(0x5B, "Hybrid Battery Pack Remaining Life", "%", Formula::PERCENT, (0.0, 100.0), Some(10000)),
    current(0x5C, "Engine Oil Temperature", "°C", Formula::TEMPERATURE, (-40.0, 210.0), Some(2000)),
    current(0x5D, "Fuel Injection Timing", "°", Formula::Word { scale: 1.0 / 128.0, offset: -210.0 }, (-210.0, 301.992), Some(1000)),
    current(0x5E, "Engine Fuel Rate", "L/h", Formula::Word { scale: 0.05, offset: 0.0 }, (0.0, 3212.75), Some(1000)),
    current(0x61, "Driver Demand Engine Torque", "%", Formula::TORQUE, (-125.0, 130.0), Some(500)),
    current(0x62, "Actual Engine Torque", "%", Formula::TORQUE, (-125.0, 130.0), Some(500)),
    current(0x63, "Engine Reference Torque", "Nm", Formula::WORD, (0.0, 65535.0), None),
    current(0x7C, "Diesel Particulate Filter Temperature", "°C", Formula::Word { scale: 0.1, offset: -40.0 }, (-40.0, 6513.5), Some(2000)),
    current(0x7F, "Engine Run Time", "s", Formula::WORD, (0.0, 65535.0), Some(5000)),
    current(0xA4, "Transmission Actual Gear", "ratio", Formula::Word { scale: 0.001, offset: 0.0 }, (0.0, 65.535), Some(1000)),
    current(0xA6, "Odometer", "km", Formula::DWord { scale: 0.1, offset: 0.0 }, (0.0, 429_496_729.5), None),
];

/// Immutable PID lookup table, indexed by (mode, pid) and by name.
///
/// Built once and shared read-only (usually behind an `Arc`).
#[derive(Debug)]
pub struct PidCatalog {
    definitions: &'static [PidDefinition],
    by_key: HashMap<(u8, u8), usize>,
    by_name: HashMap<&'static str, usize>,
}

impl PidCatalog {
    /// Catalog of the standard Mode 01 PIDs
    pub fn standard() -> Self {
        Self::from_static(STANDARD_PIDS)
    }

    /// Build a catalog over a static table. The first entry wins when two
    /// entries share a key or a name.
    pub fn from_static(definitions: &'static [PidDefinition]) -> Self {
        let mut by_key = HashMap::with_capacity(definitions.len());
        let mut by_name = HashMap::with_capacity(definitions.len());
        for (index, def) in definitions.iter().enumerate() {
            by_key.entry((def.mode, def.pid)).or_insert(index);
            by_name.entry(def.name).or_insert(index);
        }
        Self {
            definitions,
            by_key,
            by_name,
        }
    }

    /// Look up a PID by mode and identifier
    pub fn get(&self, mode: u8, pid: u8) -> Option<&'static PidDefinition> {
        let definitions = self.definitions;
        self.by_key.get(&(mode, pid)).map(|&i| &definitions[i])
    }

    /// Look up a PID by its display name
    pub fn by_name(&self, name: &str) -> Option<&'static PidDefinition> {
        let definitions = self.definitions;
        self.by_name.get(name).map(|&i| &definitions[i])
    }

    /// Check that a PID name exists
    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// All PIDs for a mode
    pub fn by_mode(&self, mode: u8) -> impl Iterator<Item = &'static PidDefinition> {
        self.definitions.iter().filter(move |def| def.mode == mode)
    }

    /// Every definition in catalog order
    pub fn all(&self) -> &'static [PidDefinition] {
        self.definitions
    }

    /// Number of definitions
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Check if the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl Default for PidCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

/// A decoded PID reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedValue {
    pub mode: u8,
    pub pid: u8,
    pub name: String,
    pub unit: Option<String>,
    pub value: f64,
    /// Payload bytes the value was decoded from
    pub raw_bytes: Vec<u8>,
    /// Unix milliseconds when the response was decoded
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpm_decode() {
        // 1A F8 => (26 * 256 + 248) / 4 = 1726
        let catalog = PidCatalog::standard();
        let rpm = catalog.get(0x01, 0x0C).unwrap();
        assert_eq!(rpm.name, "Engine RPM");
        assert_eq!(rpm.unit, Some("rpm"));
        assert!((rpm.decode(&[0x1A, 0xF8]).unwrap() - 1726.0).abs() < 1e-9);
    }

    #[test]
    fn test_coolant_temp_decode() {
        // 0x73 = 115, so temp = 115 - 40 = 75°C
        let catalog = PidCatalog::standard();
        let def = catalog.get(0x01, 0x05).unwrap();
        assert!((def.decode(&[0x73]).unwrap() - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_fuel_trim_decode() {
        let catalog = PidCatalog::standard();
        let def = catalog.get(0x01, 0x06).unwrap();
        assert!((def.decode(&[0x80]).unwrap() - 0.0).abs() < 0.01);
        // 0x90 = 144, so trim = (144-128)*100/128 = 12.5%
        assert!((def.decode(&[0x90]).unwrap() - 12.5).abs() < 0.01);
    }

    #[test]
    fn test_short_payload() {
        assert_eq!(Formula::RPM.apply(&[0x1A]), None);
        assert_eq!(Formula::BYTE.apply(&[]), None);
    }

    #[test]
    fn test_odometer_uses_four_bytes() {
        let catalog = PidCatalog::standard();
        let odometer = catalog.by_name("Odometer").unwrap();
        assert_eq!(odometer.bytes, 4);
        // 0x0001E240 = 123456 => 12345.6 km
        let value = odometer.decode(&[0x00, 0x01, 0xE2, 0x40]).unwrap();
        assert!((value - 12345.6).abs() < 1e-6);
    }

    #[test]
    fn test_lookup_by_name() {
        let catalog = PidCatalog::standard();
        let speed = catalog.by_name("Vehicle Speed").unwrap();
        assert_eq!(speed.pid, 0x0D);
        assert_eq!(speed.request(), "010D");
        assert!(catalog.contains_name("Engine RPM"));
        assert!(!catalog.contains_name("Warp Drive Output"));
    }

    #[test]
    fn test_byte_lengths_match_formulas() {
        for def in PidCatalog::standard().all() {
            assert_eq!(def.bytes, def.formula.byte_len(), "{}", def.name);
        }
    }

    #[test]
    fn test_default_priority() {
        let catalog = PidCatalog::standard();
        assert_eq!(catalog.by_name("Engine RPM").unwrap().default_priority(), 10);
        assert_eq!(catalog.by_name("MAF Air Flow Rate").unwrap().default_priority(), 5);
        assert_eq!(catalog.by_name("Odometer").unwrap().default_priority(), 2);
    }

    #[test]
    fn test_in_range() {
        let catalog = PidCatalog::standard();
        let coolant = catalog.by_name("Engine Coolant Temperature").unwrap();
        assert!(coolant.in_range(90.0));
        assert!(!coolant.in_range(-50.0));
    }
}
