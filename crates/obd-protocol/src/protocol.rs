//! OBD-II Protocol Definitions and Connection Profiles

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported OBD-II protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObdProtocol {
    /// Automatic protocol detection
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

impl ObdProtocol {
    pub const ALL: [ObdProtocol; 10] = [
        ObdProtocol::Auto,
        ObdProtocol::J1850Pwm,
        ObdProtocol::J1850Vpw,
        ObdProtocol::Iso9141_2,
        ObdProtocol::Iso14230_4Kwp,
        ObdProtocol::Iso14230_4KwpFast,
        ObdProtocol::Iso15765_4Can11bit500,
        ObdProtocol::Iso15765_4Can29bit500,
        ObdProtocol::Iso15765_4Can11bit250,
        ObdProtocol::Iso15765_4Can29bit250,
    ];

    /// ELM327 protocol number used by `ATSP<code>`
    pub fn code(&self) -> u8 {
        match self {
            ObdProtocol::Auto => 0,
            ObdProtocol::J1850Pwm => 1,
            ObdProtocol::J1850Vpw => 2,
            ObdProtocol::Iso9141_2 => 3,
            ObdProtocol::Iso14230_4Kwp => 4,
            ObdProtocol::Iso14230_4KwpFast => 5,
            ObdProtocol::Iso15765_4Can11bit500 => 6,
            ObdProtocol::Iso15765_4Can29bit500 => 7,
            ObdProtocol::Iso15765_4Can11bit250 => 8,
            ObdProtocol::Iso15765_4Can29bit250 => 9,
        }
    }

    /// Get the ELM327 AT command for this protocol
    pub fn to_elm_command(&self) -> String {
        format!("ATSP{}", self.code())
    }

    /// Stable identifier used in profiles and configuration
    pub fn id(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "auto",
            ObdProtocol::J1850Pwm => "sae-j1850-p",
            ObdProtocol::J1850Vpw => "sae-j1850-v",
            ObdProtocol::Iso9141_2 => "iso9141-2",
            ObdProtocol::Iso14230_4Kwp => "kwp2000-5",
            ObdProtocol::Iso14230_4KwpFast => "kwp2000-f",
            ObdProtocol::Iso15765_4Can11bit500 => "iso15765-4",
            ObdProtocol::Iso15765_4Can29bit500 => "iso15765-5",
            ObdProtocol::Iso15765_4Can11bit250 => "iso15765-6",
            ObdProtocol::Iso15765_4Can29bit250 => "iso15765-7",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "Automatic protocol detection",
            ObdProtocol::J1850Pwm => "SAE J1850 PWM (41.6 kbps)",
            ObdProtocol::J1850Vpw => "SAE J1850 VPW (10.4 kbps)",
            ObdProtocol::Iso9141_2 => "ISO 9141-2 (5 baud init, 10.4 kbps)",
            ObdProtocol::Iso14230_4Kwp => "ISO 14230-4 KWP2000 (5 baud init)",
            ObdProtocol::Iso14230_4KwpFast => "ISO 14230-4 KWP2000 (fast init)",
            ObdProtocol::Iso15765_4Can11bit500 => "ISO 15765-4 CAN (11 bit ID, 500 kbps)",
            ObdProtocol::Iso15765_4Can29bit500 => "ISO 15765-4 CAN (29 bit ID, 500 kbps)",
            ObdProtocol::Iso15765_4Can11bit250 => "ISO 15765-4 CAN (11 bit ID, 250 kbps)",
            ObdProtocol::Iso15765_4Can29bit250 => "ISO 15765-4 CAN (29 bit ID, 250 kbps)",
        }
    }

    /// Recommended response timeout for this bus
    pub fn timeout_ms(&self) -> u64 {
        match self {
            ObdProtocol::Auto | ObdProtocol::Iso9141_2 | ObdProtocol::Iso14230_4Kwp => 5000,
            ObdProtocol::Iso14230_4KwpFast => 3000,
            _ => 2000,
        }
    }

    /// Extra AT commands issued after selecting this protocol
    pub fn init_commands(&self) -> &'static [&'static str] {
        match self {
            // ~4 s adapter timeout for the 5 baud handshake
            ObdProtocol::Iso9141_2 | ObdProtocol::Iso14230_4Kwp => &["ATST64"],
            _ => &[],
        }
    }
}

impl Default for ObdProtocol {
    fn default() -> Self {
        ObdProtocol::Auto
    }
}

impl fmt::Display for ObdProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ObdProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ObdProtocol::ALL
            .into_iter()
            .find(|p| p.id() == wanted)
            .ok_or_else(|| format!("unknown OBD protocol '{s}'"))
    }
}

/// Vehicle-specific workarounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProfileQuirks {
    /// 5 baud handshakes that need a longer wait
    pub slow_init: bool,
    /// Some commands answer slowly even after init
    pub extended_timeout: bool,
}

/// Ordered protocol list and init extras used when connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolProfile {
    pub name: &'static str,
    pub display_name: &'static str,
    /// Tried in order during connect
    pub protocols: &'static [ObdProtocol],
    /// Extra AT commands issued after the base init sequence
    pub init_commands: &'static [&'static str],
    /// Send `ATH1` instead of `ATH0`
    pub headers: bool,
    pub quirks: ProfileQuirks,
}

impl ProtocolProfile {
    /// Response timeout suited to this profile
    pub fn recommended_timeout_ms(&self) -> u64 {
        let mut timeout = self
            .protocols
            .first()
            .map(ObdProtocol::timeout_ms)
            .unwrap_or_else(|| ObdProtocol::Auto.timeout_ms());
        if self.quirks.extended_timeout {
            timeout = timeout.max(5000);
        }
        if self.quirks.slow_init {
            timeout = timeout.max(6000);
        }
        timeout
    }
}

const NO_QUIRKS: ProfileQuirks = ProfileQuirks {
    slow_init: false,
    extended_timeout: false,
};

const LEGACY_QUIRKS: ProfileQuirks = ProfileQuirks {
    slow_init: true,
    extended_timeout: true,
};

use self::ObdProtocol::*;

static AUTO: ProtocolProfile = ProtocolProfile {
    name: "auto",
    display_name: "Automatic (Universal)",
    protocols: &[Auto],
    init_commands: &[],
    headers: false,
    quirks: NO_QUIRKS,
};

static NAMED_PROFILES: &[ProtocolProfile] = &[
    ProtocolProfile {
        name: "toyota_lexus",
        display_name: "Toyota / Lexus",
        protocols: &[Iso15765_4Can11bit500, Iso9141_2, Iso14230_4Kwp, Iso14230_4KwpFast],
        init_commands: &["ATCAF0"],
        headers: true,
        quirks: NO_QUIRKS,
    },
    ProtocolProfile {
        name: "honda",
        display_name: "Honda / Acura",
        protocols: &[Iso15765_4Can11bit500, Iso14230_4KwpFast],
        init_commands: &[],
        headers: false,
        quirks: NO_QUIRKS,
    },
    ProtocolProfile {
        name: "nissan",
        display_name: "Nissan / Infiniti",
        protocols: &[Iso15765_4Can11bit500, Iso14230_4KwpFast, Iso9141_2],
        init_commands: &[],
        headers: false,
        quirks: NO_QUIRKS,
    },
    ProtocolProfile {
        name: "gm",
        display_name: "General Motors",
        protocols: &[Iso15765_4Can11bit500, J1850Vpw],
        init_commands: &[],
        headers: false,
        quirks: NO_QUIRKS,
    },
    ProtocolProfile {
        name: "ford",
        display_name: "Ford / Lincoln / Mercury",
        protocols: &[Iso15765_4Can11bit500, J1850Pwm],
        init_commands: &[],
        headers: false,
        quirks: NO_QUIRKS,
    },
    ProtocolProfile {
        name: "european",
        display_name: "European (VW, BMW, Mercedes, etc.)",
        protocols: &[Iso15765_4Can11bit500, Iso14230_4KwpFast, Iso9141_2],
        init_commands: &[],
        headers: false,
        quirks: NO_QUIRKS,
    },
];

/// Make and model-year window a vehicle profile applies to
struct VehicleMatch {
    make: &'static str,
    min_year: Option<u16>,
    max_year: Option<u16>,
    profile: ProtocolProfile,
}

impl VehicleMatch {
    fn covers(&self, year: Option<u16>) -> bool {
        let Some(year) = year else { return true };
        self.min_year.map_or(true, |min| year >= min) && self.max_year.map_or(true, |max| year <= max)
    }
}

macro_rules! vehicle {
    ($make:literal, $name:literal, $display:literal, $min:expr, $max:expr, [$($p:expr),+], $headers:expr, $quirks:expr) => {
        VehicleMatch {
            make: $make,
            min_year: $min,
            max_year: $max,
            profile: ProtocolProfile {
                name: $name,
                display_name: $display,
                protocols: &[$($p),+],
                init_commands: &[],
                headers: $headers,
                quirks: $quirks,
            },
        }
    };
}

static VEHICLE_PROFILES: &[VehicleMatch] = &[
    vehicle!("toyota", "toyota", "Toyota (2008+)", Some(2008), None,
        [Iso15765_4Can11bit500, Iso15765_4Can29bit500, Iso9141_2], true, NO_QUIRKS),
    vehicle!("toyota", "toyota-legacy", "Toyota (pre-2008)", None, Some(2007),
        [Iso9141_2, Iso14230_4Kwp, Iso15765_4Can11bit500], false, LEGACY_QUIRKS),
    vehicle!("lexus", "lexus", "Lexus (2008+)", Some(2008), None,
        [Iso15765_4Can11bit500, Iso15765_4Can29bit500, Iso9141_2], true, NO_QUIRKS),
    vehicle!("lexus", "lexus-legacy", "Lexus (pre-2008)", None, Some(2007),
        [Iso9141_2, Iso14230_4Kwp, Iso15765_4Can11bit500], false, LEGACY_QUIRKS),
    vehicle!("ford", "ford", "Ford", Some(1996), None,
        [Iso15765_4Can11bit500, J1850Pwm, Iso9141_2], false, NO_QUIRKS),
    vehicle!("gm", "gm", "General Motors", Some(1996), None,
        [Iso15765_4Can11bit500, J1850Vpw, Iso9141_2], false, NO_QUIRKS),
    vehicle!("chrysler", "chrysler", "Chrysler", Some(1996), None,
        [Iso15765_4Can11bit500, J1850Vpw, Iso9141_2], false, NO_QUIRKS),
    vehicle!("honda", "honda", "Honda", Some(2008), None,
        [Iso15765_4Can11bit500, Iso9141_2], false, NO_QUIRKS),
    vehicle!("nissan", "nissan", "Nissan", Some(2008), None,
        [Iso15765_4Can11bit500, Iso9141_2], false, NO_QUIRKS),
    vehicle!("bmw", "bmw", "BMW", Some(2001), None,
        [Iso15765_4Can11bit500, Iso14230_4KwpFast, Iso9141_2], false, NO_QUIRKS),
    vehicle!("mercedes-benz", "mercedes-benz", "Mercedes-Benz", Some(2001), None,
        [Iso15765_4Can11bit500, Iso14230_4KwpFast, Iso9141_2], false, NO_QUIRKS),
    vehicle!("volkswagen", "volkswagen", "Volkswagen", Some(2004), None,
        [Iso15765_4Can11bit500, Iso14230_4KwpFast, Iso9141_2], false, NO_QUIRKS),
    vehicle!("audi", "audi", "Audi", Some(2004), None,
        [Iso15765_4Can11bit500, Iso14230_4KwpFast, Iso9141_2], false, NO_QUIRKS),
];

static GENERIC_MODERN: ProtocolProfile = ProtocolProfile {
    name: "generic-modern",
    display_name: "Generic (2008+)",
    protocols: &[Iso15765_4Can11bit500, Iso15765_4Can29bit500, Iso9141_2, Iso14230_4KwpFast],
    init_commands: &[],
    headers: false,
    quirks: NO_QUIRKS,
};

static GENERIC_LEGACY: ProtocolProfile = ProtocolProfile {
    name: "generic-legacy",
    display_name: "Generic (pre-2008)",
    protocols: &[Iso9141_2, Iso14230_4Kwp, Iso14230_4KwpFast, J1850Vpw, J1850Pwm],
    init_commands: &[],
    headers: false,
    quirks: NO_QUIRKS,
};

/// Read-only registry of connection profiles
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileRegistry;

impl ProfileRegistry {
    /// Named profile, or `auto` when the name is absent or unknown
    pub fn get(name: Option<&str>) -> &'static ProtocolProfile {
        let Some(name) = name.map(|n| n.trim().to_ascii_lowercase()) else {
            return &AUTO;
        };
        NAMED_PROFILES
            .iter()
            .chain(VEHICLE_PROFILES.iter().map(|v| &v.profile))
            .chain([&GENERIC_MODERN, &GENERIC_LEGACY])
            .find(|profile| profile.name == name)
            .unwrap_or(&AUTO)
    }

    /// Names of every registered profile
    pub fn names() -> Vec<&'static str> {
        std::iter::once(AUTO.name)
            .chain(NAMED_PROFILES.iter().map(|p| p.name))
            .chain(VEHICLE_PROFILES.iter().map(|v| v.profile.name))
            .chain([GENERIC_MODERN.name, GENERIC_LEGACY.name])
            .collect()
    }

    /// Profile for a vehicle make and optional model year.
    ///
    /// Exact make matches win; otherwise the generic profile for the year's
    /// era, and `generic-modern` when the year is unknown.
    pub fn for_vehicle(make: &str, year: Option<u16>) -> &'static ProtocolProfile {
        let make = make.trim().to_ascii_lowercase();
        if let Some(matched) = VEHICLE_PROFILES
            .iter()
            .find(|v| v.make == make && v.covers(year))
        {
            return &matched.profile;
        }
        match year {
            Some(year) if year < 2008 => &GENERIC_LEGACY,
            _ => &GENERIC_MODERN,
        }
    }
}
