//! Diagnostic Trouble Code Catalog
//!
//! SAE J2012 code descriptions plus the rule-based severity classification.
//! Severity is derived from the code itself, never stored per entry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Vehicle system encoded in the DTC prefix letter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcSystem {
    /// `P` codes
    Powertrain,
    /// `C` codes
    Chassis,
    /// `B` codes
    Body,
    /// `U` codes
    Network,
}

impl DtcSystem {
    /// System for a prefix letter, defaulting to powertrain
    pub fn from_prefix(prefix: char) -> Self {
        match prefix.to_ascii_uppercase() {
            'C' => DtcSystem::Chassis,
            'B' => DtcSystem::Body,
            'U' => DtcSystem::Network,
            _ => DtcSystem::Powertrain,
        }
    }

    /// Prefix letter for this system
    pub fn prefix(&self) -> char {
        match self {
            DtcSystem::Powertrain => 'P',
            DtcSystem::Chassis => 'C',
            DtcSystem::Body => 'B',
            DtcSystem::Network => 'U',
        }
    }

    /// Human-readable system name
    pub fn label(&self) -> &'static str {
        match self {
            DtcSystem::Powertrain => "Powertrain",
            DtcSystem::Chassis => "Chassis",
            DtcSystem::Body => "Body",
            DtcSystem::Network => "Network",
        }
    }
}

/// How urgently a code needs attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Static catalog entry for one code
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DtcDefinition {
    pub code: &'static str,
    pub system: DtcSystem,
    pub category: &'static str,
    pub label: &'static str,
    pub notes: Option<&'static str>,
}

/// Description of a code as handed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtcInfo {
    pub code: String,
    pub description: String,
    pub severity: Severity,
    pub prefix: char,
    pub category: Option<String>,
}

/// Normalize a code: drop all whitespace, uppercase, and pad a three-digit
/// suffix with a leading zero (`"p 420"` -> `"P0420"`).
pub fn normalize_dtc_code(code: &str) -> String {
    let normalized: String = code
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    match normalized.chars().next() {
        Some(prefix @ ('P' | 'B' | 'C' | 'U'))
            if normalized.len() == 4 && normalized[1..].chars().all(|c| c.is_ascii_digit()) =>
        {
            format!("{prefix}0{}", &normalized[1..])
        }
        _ => normalized,
    }
}

/// Classify a code by prefix/range rules.
///
/// Only all-decimal suffixes are ranked; manufacturer codes with hex digits
/// fall through to [`Severity::Info`].
pub fn severity_for(code: &str) -> Severity {
    let code = normalize_dtc_code(code);
    let Some(number) = code
        .get(1..)
        .filter(|digits| digits.len() == 4 && digits.chars().all(|c| c.is_ascii_digit()))
        .and_then(|digits| digits.parse::<u16>().ok())
    else {
        return Severity::Info;
    };
    match code.as_bytes().first() {
        Some(b'P') => match number {
            300..=399 | 600..=619 => Severity::Critical,
            420 | 430 | 171 | 172 | 174 | 175 => Severity::Warning,
            130..=169 | 200..=208 | 700..=799 => Severity::Warning,
            _ => Severity::Info,
        },
        Some(b'U') => match number {
            100 | 101 | 102 | 121 => Severity::Critical,
            _ => Severity::Info,
        },
        _ => Severity::Info,
    }
}

macro_rules! dtc {
    ($code:literal, $category:literal, $label:literal) => {
        DtcDefinition {
            code: $code,
            system: system_of($code),
            category: $category,
            label: $label,
            notes: None,
        }
    };
    ($code:literal, $category:literal, $label:literal, $notes:literal) => {
        DtcDefinition {
            code: $code,
            system: system_of($code),
            category: $category,
            label: $label,
            notes: Some($notes),
        }
    };
}

const fn system_of(code: &str) -> DtcSystem {
    match code.as_bytes()[0] {
        b'C' => DtcSystem::Chassis,
        b'B' => DtcSystem::Body,
        b'U' => DtcSystem::Network,
        _ => DtcSystem::Powertrain,
    }
}

static STANDARD_DTCS: &[DtcDefinition] = &[
    dtc!("P0100", "Fuel/Air", "Mass air flow (MAF) circuit malfunction"),
    dtc!("P0101", "Fuel/Air", "Mass air flow (MAF) circuit range/performance"),
    dtc!("P0102", "Fuel/Air", "Mass air flow (MAF) circuit low input"),
    dtc!("P0103", "Fuel/Air", "Mass air flow (MAF) circuit high input"),
    dtc!("P0105", "Fuel/Air", "Manifold absolute pressure (MAP) circuit malfunction"),
    dtc!("P0106", "Fuel/Air", "Manifold absolute pressure (MAP) circuit range/performance"),
    dtc!("P0107", "Fuel/Air", "Manifold absolute pressure (MAP) circuit low input"),
    dtc!("P0108", "Fuel/Air", "Manifold absolute pressure (MAP) circuit high input"),
    dtc!("P0110", "Fuel/Air", "Intake air temperature (IAT) circuit malfunction"),
    dtc!("P0112", "Fuel/Air", "Intake air temperature (IAT) circuit low input"),
    dtc!("P0113", "Fuel/Air", "Intake air temperature (IAT) circuit high input"),
    dtc!("P0115", "Fuel/Air", "Engine coolant temperature (ECT) circuit malfunction"),
    dtc!("P0117", "Fuel/Air", "Engine coolant temperature (ECT) circuit low input"),
    dtc!("P0118", "Fuel/Air", "Engine coolant temperature (ECT) circuit high input"),
    dtc!("P0120", "Fuel/Air", "Throttle position sensor (TPS) circuit malfunction"),
    dtc!("P0121", "Fuel/Air", "Throttle position sensor (TPS) range/performance"),
    dtc!("P0125", "Fuel/Air", "Insufficient coolant temperature for closed loop fuel control"),
    dtc!("P0128", "Fuel/Air", "Coolant temperature below thermostat regulating temperature", "Usually a thermostat stuck open"),
    dtc!("P0130", "Fuel/Air", "O2 sensor circuit malfunction (bank 1, sensor 1)"),
    dtc!("P0131", "Fuel/Air", "O2 sensor circuit low voltage (bank 1, sensor 1)"),
    dtc!("P0132", "Fuel/Air", "O2 sensor circuit high voltage (bank 1, sensor 1)"),
    dtc!("P0133", "Fuel/Air", "O2 sensor circuit slow response (bank 1, sensor 1)"),
    dtc!("P0134", "Fuel/Air", "O2 sensor circuit no activity (bank 1, sensor 1)"),
    dtc!("P0135", "Fuel/Air", "O2 sensor heater circuit malfunction (bank 1, sensor 1)"),
    dtc!("P0136", "Fuel/Air", "O2 sensor circuit malfunction (bank 1, sensor 2)"),
    dtc!("P0141", "Fuel/Air", "O2 sensor heater circuit malfunction (bank 1, sensor 2)"),
    dtc!("P0150", "Fuel/Air", "O2 sensor circuit malfunction (bank 2, sensor 1)"),
    dtc!("P0155", "Fuel/Air", "O2 sensor heater circuit malfunction (bank 2, sensor 1)"),
    dtc!("P0171", "Fuel/Air", "System too lean (bank 1)", "Check for vacuum leaks and MAF contamination"),
    dtc!("P0172", "Fuel/Air", "System too rich (bank 1)"),
    dtc!("P0174", "Fuel/Air", "System too lean (bank 2)"),
    dtc!("P0175", "Fuel/Air", "System too rich (bank 2)"),
    dtc!("P0200", "Ignition", "Injector circuit malfunction"),
    dtc!("P0201", "Ignition", "Injector circuit malfunction, cylinder 1"),
    dtc!("P0202", "Ignition", "Injector circuit malfunction, cylinder 2"),
    dtc!("P0203", "Ignition", "Injector circuit malfunction, cylinder 3"),
    dtc!("P0204", "Ignition", "Injector circuit malfunction, cylinder 4"),
    dtc!("P0300", "Misfire", "Random/multiple cylinder misfire detected", "Sustained misfire can damage the catalytic converter"),
    dtc!("P0301", "Misfire", "Cylinder 1 misfire detected"),
    dtc!("P0302", "Misfire", "Cylinder 2 misfire detected"),
    dtc!("P0303", "Misfire", "Cylinder 3 misfire detected"),
    dtc!("P0304", "Misfire", "Cylinder 4 misfire detected"),
    dtc!("P0305", "Misfire", "Cylinder 5 misfire detected"),
    dtc!("P0306", "Misfire", "Cylinder 6 misfire detected"),
    dtc!("P0307", "Misfire", "Cylinder 7 misfire detected"),
    dtc!("P0308", "Misfire", "Cylinder 8 misfire detected"),
    dtc!("P0325", "Ignition", "Knock sensor 1 circuit malfunction"),
    dtc!("P0335", "Ignition", "Crankshaft position sensor A circuit malfunction"),
    dtc!("P0340", "Ignition", "Camshaft position sensor circuit malfunction"),
    dtc!("P0400", "Emissions", "Exhaust gas recirculation (EGR) flow malfunction"),
    dtc!("P0401", "Emissions", "Exhaust gas recirculation (EGR) flow insufficient"),
    dtc!("P0402", "Emissions", "Exhaust gas recirculation (EGR) flow excessive"),
    dtc!("P0420", "Emissions", "Catalyst system efficiency below threshold (bank 1)"),
    dtc!("P0430", "Emissions", "Catalyst system efficiency below threshold (bank 2)"),
    dtc!("P0440", "Emissions", "Evaporative emission (EVAP) control system malfunction"),
    dtc!("P0441", "Emissions", "Evaporative emission (EVAP) incorrect purge flow"),
    dtc!("P0442", "Emissions", "Evaporative emission (EVAP) small leak detected"),
    dtc!("P0446", "Emissions", "Evaporative emission (EVAP) vent control malfunction"),
    dtc!("P0455", "Emissions", "Evaporative emission (EVAP) large leak detected", "Check the fuel cap first"),
    dtc!("P0456", "Emissions", "Evaporative emission (EVAP) very small leak detected"),
    dtc!("P0500", "Speed/Idle", "Vehicle speed sensor (VSS) malfunction"),
    dtc!("P0505", "Speed/Idle", "Idle air control (IAC) system malfunction"),
    dtc!("P0506", "Speed/Idle", "Idle control system RPM lower than expected"),
    dtc!("P0507", "Speed/Idle", "Idle control system RPM higher than expected"),
    dtc!("P0562", "Speed/Idle", "System voltage low"),
    dtc!("P0563", "Speed/Idle", "System voltage high"),
    dtc!("P0600", "Computer", "Serial communication link malfunction"),
    dtc!("P0601", "Computer", "Internal control module memory checksum error"),
    dtc!("P0602", "Computer", "Control module programming error"),
    dtc!("P0603", "Computer", "Internal control module keep-alive memory (KAM) error"),
    dtc!("P0604", "Computer", "Internal control module RAM error"),
    dtc!("P0605", "Computer", "Internal control module ROM error"),
    dtc!("P0700", "Transmission", "Transmission control system malfunction"),
    dtc!("P0705", "Transmission", "Transmission range sensor circuit malfunction"),
    dtc!("P0715", "Transmission", "Input/turbine speed sensor circuit malfunction"),
    dtc!("P0720", "Transmission", "Output speed sensor circuit malfunction"),
    dtc!("P0730", "Transmission", "Incorrect gear ratio"),
    dtc!("P0740", "Transmission", "Torque converter clutch circuit malfunction"),
    dtc!("P0750", "Transmission", "Shift solenoid A malfunction"),
    dtc!("B0001", "Restraints", "Driver frontal stage 1 deployment control"),
    dtc!("B0100", "Restraints", "Electronic frontal sensor 1 performance"),
    dtc!("B1000", "Body", "Electronic control unit malfunction"),
    dtc!("C0035", "Brakes", "Left front wheel speed sensor circuit"),
    dtc!("C0040", "Brakes", "Right front wheel speed sensor circuit"),
    dtc!("C0045", "Brakes", "Left rear wheel speed sensor circuit"),
    dtc!("C0050", "Brakes", "Right rear wheel speed sensor circuit"),
    dtc!("C1201", "Brakes", "Engine control system malfunction reported to ABS"),
    dtc!("U0001", "Network", "High speed CAN communication bus"),
    dtc!("U0073", "Network", "Control module communication bus off"),
    dtc!("U0100", "Network", "Lost communication with ECM/PCM"),
    dtc!("U0101", "Network", "Lost communication with TCM"),
    dtc!("U0102", "Network", "Lost communication with transfer case control module"),
    dtc!("U0121", "Network", "Lost communication with anti-lock brake system (ABS) module"),
    dtc!("U0140", "Network", "Lost communication with body control module"),
];

/// Immutable DTC lookup table indexed by code and by system
#[derive(Debug)]
pub struct DtcCatalog {
    definitions: &'static [DtcDefinition],
    by_code: HashMap<&'static str, usize>,
    by_system: HashMap<DtcSystem, Vec<usize>>,
}

impl DtcCatalog {
    /// Catalog of the built-in SAE J2012 descriptions
    pub fn standard() -> Self {
        Self::from_static(STANDARD_DTCS)
    }

    /// Build a catalog over a static table of normalized codes
    pub fn from_static(definitions: &'static [DtcDefinition]) -> Self {
        let mut by_code = HashMap::with_capacity(definitions.len());
        let mut by_system: HashMap<DtcSystem, Vec<usize>> = HashMap::new();
        for (index, def) in definitions.iter().enumerate() {
            by_code.entry(def.code).or_insert(index);
            by_system.entry(def.system).or_default().push(index);
        }
        Self {
            definitions,
            by_code,
            by_system,
        }
    }

    /// Look up a code (normalized before lookup)
    pub fn get(&self, code: &str) -> Option<&'static DtcDefinition> {
        let definitions = self.definitions;
        let code = normalize_dtc_code(code);
        self.by_code.get(code.as_str()).map(|&i| &definitions[i])
    }

    /// All cataloged codes for one system
    pub fn by_system(&self, system: DtcSystem) -> Vec<&'static DtcDefinition> {
        let definitions = self.definitions;
        self.by_system
            .get(&system)
            .map(|indices| indices.iter().map(|&i| &definitions[i]).collect())
            .unwrap_or_default()
    }

    /// Describe a code. Unknown codes still get a generic description.
    pub fn describe(&self, code: &str) -> DtcInfo {
        let code = normalize_dtc_code(code);
        let prefix = code.chars().next().unwrap_or('P');
        let system = DtcSystem::from_prefix(prefix);

        match self.by_code.get(code.as_str()) {
            Some(&index) => {
                let def = &self.definitions[index];
                DtcInfo {
                    severity: severity_for(&code),
                    description: def.label.to_string(),
                    category: Some(def.category.to_string()),
                    prefix: system.prefix(),
                    code,
                }
            }
            None => DtcInfo {
                description: format!("Generic {} code", system.label()),
                severity: Severity::Info,
                category: Some(system.label().to_string()),
                prefix: system.prefix(),
                code,
            },
        }
    }

    /// Number of cataloged codes
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Check if the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl Default for DtcCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_dtc_code(" p0420 "), "P0420");
        assert_eq!(normalize_dtc_code("P 04 20"), "P0420");
        assert_eq!(normalize_dtc_code("p420"), "P0420");
        assert_eq!(normalize_dtc_code("U0100"), "U0100");
        assert_eq!(normalize_dtc_code("C1A2"), "C1A2");
    }

    #[test]
    fn test_severity_rules() {
        assert_eq!(severity_for("P0301"), Severity::Critical);
        assert_eq!(severity_for("P0605"), Severity::Critical);
        assert_eq!(severity_for("P0420"), Severity::Warning);
        assert_eq!(severity_for("P0171"), Severity::Warning);
        assert_eq!(severity_for("P0133"), Severity::Warning);
        assert_eq!(severity_for("P0202"), Severity::Warning);
        assert_eq!(severity_for("P0730"), Severity::Warning);
        assert_eq!(severity_for("P0401"), Severity::Info);
        assert_eq!(severity_for("P0455"), Severity::Info);
        assert_eq!(severity_for("U0100"), Severity::Critical);
        assert_eq!(severity_for("U0140"), Severity::Info);
        assert_eq!(severity_for("B1000"), Severity::Info);
        assert_eq!(severity_for("P03A0"), Severity::Info);
    }

    #[test]
    fn test_describe_known() {
        let catalog = DtcCatalog::standard();
        let info = catalog.describe("p0301");
        assert_eq!(info.code, "P0301");
        assert_eq!(info.prefix, 'P');
        assert_eq!(info.severity, Severity::Critical);
        assert_eq!(info.category.as_deref(), Some("Misfire"));
        assert!(info.description.contains("Cylinder 1"));
    }

    #[test]
    fn test_describe_unknown() {
        let catalog = DtcCatalog::standard();
        let info = catalog.describe("C1234");
        assert_eq!(info.prefix, 'C');
        assert_eq!(info.severity, Severity::Info);
        assert_eq!(info.description, "Generic Chassis code");
    }

    #[test]
    fn test_index_by_system() {
        let catalog = DtcCatalog::standard();
        let network = catalog.by_system(DtcSystem::Network);
        assert!(!network.is_empty());
        assert!(network.iter().all(|def| def.code.starts_with('U')));
        assert!(catalog.get("p0420").is_some());
    }

    #[test]
    fn test_catalog_codes_are_normalized() {
        for def in DtcCatalog::standard().definitions {
            assert_eq!(normalize_dtc_code(def.code), def.code);
            assert_eq!(def.system.prefix(), def.code.chars().next().unwrap());
        }
    }
}
