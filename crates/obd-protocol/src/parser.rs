//! ELM327 Response Parsers
//!
//! Pure functions from framed adapter responses to typed values. Responses
//! may carry spaces or not (`ATS0`), and CAN headers when `ATH1` is active.
//! Malformed input is always a terminal [`ObdError::Parse`].

use crate::error::ObdError;
use crate::pid::{DecodedValue, PidCatalog, PidDefinition};
use std::time::{SystemTime, UNIX_EPOCH};

/// Response byte that marks a positive reply to `mode`
pub const fn response_mode(mode: u8) -> u8 {
    mode + 0x40
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Parse one response line into bytes.
///
/// An odd number of hex digits means an 11-bit CAN header (`7E8`) leads the
/// line; it is skipped.
pub fn hex_line(line: &str) -> Result<Vec<u8>, ObdError> {
    let digits: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() {
        return Ok(Vec::new());
    }
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ObdError::parse("non-hex characters in response", line));
    }

    let digits = match digits.len() {
        len if len % 2 == 0 => &digits[..],
        len if len > 3 => &digits[3..],
        _ => return Err(ObdError::parse("odd-length hex line", line)),
    };
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| ObdError::parse("invalid hex byte", line))
        })
        .collect()
}

/// Parse every non-empty line of a framed response
pub fn hex_lines(response: &str) -> Result<Vec<Vec<u8>>, ObdError> {
    response
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(hex_line)
        .collect()
}

/// Locate the payload following `[mode + 0x40, pid]` on the first line that
/// carries it.
fn find_payload(lines: &[Vec<u8>], mode: u8, pid: u8) -> Option<Vec<u8>> {
    let echo = [response_mode(mode), pid];
    lines.iter().find_map(|bytes| {
        bytes
            .windows(2)
            .position(|window| window == echo)
            .map(|start| bytes[start + 2..].to_vec())
    })
}

/// Decode a response to a known PID request
pub fn parse_pid_response(response: &str, def: &PidDefinition) -> Result<DecodedValue, ObdError> {
    let lines = hex_lines(response)?;
    let payload = find_payload(&lines, def.mode, def.pid).ok_or_else(|| {
        ObdError::parse(
            format!("response does not echo request {}", def.request()),
            response,
        )
    })?;

    if payload.len() < def.bytes {
        return Err(ObdError::parse(
            format!(
                "{} expects {} data bytes, got {}",
                def.name,
                def.bytes,
                payload.len()
            ),
            response,
        ));
    }

    let raw_bytes = payload[..def.bytes].to_vec();
    let value = def
        .decode(&raw_bytes)
        .ok_or_else(|| ObdError::parse(format!("cannot decode {}", def.name), response))?;
    if !def.in_range(value) {
        return Err(ObdError::parse(
            format!("{} value {} outside its documented range", def.name, value),
            response,
        ));
    }

    Ok(DecodedValue {
        mode: def.mode,
        pid: def.pid,
        name: def.name.to_string(),
        unit: def.unit.map(str::to_string),
        value,
        raw_bytes,
        timestamp_ms: now_ms(),
    })
}

/// Decode a response by reading the mode/PID echo and looking the PID up
/// in `catalog`
pub fn parse_with_catalog(response: &str, catalog: &PidCatalog) -> Result<DecodedValue, ObdError> {
    let lines = hex_lines(response)?;
    let (mode, pid) = lines
        .iter()
        .find_map(|bytes| {
            bytes
                .windows(2)
                .find(|w| (0x41..=0x4A).contains(&w[0]))
                .map(|w| (w[0] - 0x40, w[1]))
        })
        .ok_or_else(|| ObdError::parse("no mode/PID echo in response", response))?;

    let def = catalog
        .get(mode, pid)
        .ok_or_else(|| ObdError::parse(format!("unknown PID {mode:02X}{pid:02X}"), response))?;
    parse_pid_response(response, def)
}

/// Decode one SAE J2012 byte pair, e.g. `(0x03, 0x01)` -> `"P0301"`
pub fn decode_dtc(a: u8, b: u8) -> String {
    let prefix = match a >> 6 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    format!("{}{:X}{:X}{:X}{:X}", prefix, (a >> 4) & 0x03, a & 0x0F, b >> 4, b & 0x0F)
}

/// Decode a mode 03 response into codes, first-seen order, without
/// duplicates or `P0000` padding.
///
/// CAN adapters prefix each frame with a code count, which shows up as an
/// odd number of bytes after the `43` marker and is skipped.
pub fn parse_dtc_response(response: &str) -> Result<Vec<String>, ObdError> {
    let lines = hex_lines(response)?;
    let marker = response_mode(crate::mode::READ_DTC);
    let mut codes: Vec<String> = Vec::new();
    let mut saw_marker = false;

    for bytes in &lines {
        let Some(start) = bytes.iter().position(|&b| b == marker) else {
            continue;
        };
        saw_marker = true;

        let mut data = &bytes[start + 1..];
        if data.len() % 2 == 1 {
            data = &data[1..];
        }

        for pair in data.chunks_exact(2) {
            let code = decode_dtc(pair[0], pair[1]);
            if code != "P0000" && !codes.contains(&code) {
                codes.push(code);
            }
        }
    }

    if !saw_marker {
        return Err(ObdError::parse("missing mode 03 response marker", response));
    }
    Ok(codes)
}

/// Decode the `0100` support bitmap into the supported PIDs `0x01..=0x20`
pub fn parse_supported_pids(response: &str) -> Result<Vec<u8>, ObdError> {
    let lines = hex_lines(response)?;
    let payload = find_payload(&lines, crate::mode::CURRENT_DATA, 0x00)
        .filter(|payload| payload.len() >= 4)
        .ok_or_else(|| ObdError::parse("invalid supported PID bitmap", response))?;

    let bitmap = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok((0..32u8)
        .filter(|bit| bitmap & (0x8000_0000 >> bit) != 0)
        .map(|bit| bit + 1)
        .collect())
}

/// Decode a `0902` response into the 17-character VIN
pub fn parse_vin(response: &str) -> Result<String, ObdError> {
    let lines = hex_lines(response)?;
    let mut ascii = Vec::new();

    for bytes in &lines {
        // Multi-frame replies repeat `49 02 <seq>` on each line
        let data = match bytes.windows(2).position(|w| w == [0x49, 0x02]) {
            Some(start) => &bytes[start + 2..],
            None => &bytes[..],
        };
        ascii.extend(data.iter().copied().filter(|b| b.is_ascii_alphanumeric()));
    }

    if ascii.len() < 17 {
        return Err(ObdError::parse(
            format!("VIN needs 17 characters, got {}", ascii.len()),
            response,
        ));
    }
    Ok(String::from_utf8_lossy(&ascii[ascii.len() - 17..]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hex_line_spacing_and_headers() {
        assert_eq!(hex_line("41 0C 1A F8").unwrap(), vec![0x41, 0x0C, 0x1A, 0xF8]);
        assert_eq!(hex_line("410C1AF8").unwrap(), vec![0x41, 0x0C, 0x1A, 0xF8]);
        assert_eq!(
            hex_line("7E8 04 41 0C 1A F8").unwrap(),
            vec![0x04, 0x41, 0x0C, 0x1A, 0xF8]
        );
        assert!(matches!(hex_line("41 0C ZZ"), Err(ObdError::Parse { .. })));
    }

    #[test]
    fn test_short_odd_lines_are_parse_errors() {
        assert!(matches!(hex_line("A"), Err(ObdError::Parse { .. })));
        assert!(matches!(hex_line("7E8"), Err(ObdError::Parse { .. })));
        assert_eq!(hex_line("7E8 41").unwrap(), vec![0x41]);

        let catalog = PidCatalog::standard();
        let speed = catalog.get(0x01, 0x0D).unwrap();
        assert!(matches!(parse_pid_response("A", speed), Err(ObdError::Parse { .. })));
    }

    #[test]
    fn test_parse_rpm_and_speed() {
        let catalog = PidCatalog::standard();
        let rpm = parse_pid_response("41 0C 1A F8", catalog.get(0x01, 0x0C).unwrap()).unwrap();
        assert_eq!(rpm.name, "Engine RPM");
        assert_eq!(rpm.unit.as_deref(), Some("rpm"));
        assert!((rpm.value - 1726.0).abs() < 1e-9);
        assert_eq!(rpm.raw_bytes, vec![0x1A, 0xF8]);

        let speed = parse_with_catalog("41 0D 2A", &catalog).unwrap();
        assert_eq!(speed.name, "Vehicle Speed");
        assert!((speed.value - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_with_can_header() {
        // Header 7E8, then the PCI length byte, then the echo
        let catalog = PidCatalog::standard();
        let rpm = parse_with_catalog("7E804410C1AF8", &catalog).unwrap();
        assert_eq!(rpm.pid, 0x0C);
        assert!((rpm.value - 1726.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_errors() {
        let catalog = PidCatalog::standard();
        let rpm = catalog.get(0x01, 0x0C).unwrap();
        assert!(matches!(parse_pid_response("41 0C 1A", rpm), Err(ObdError::Parse { .. })));
        assert!(matches!(parse_pid_response("41 0D 2A", rpm), Err(ObdError::Parse { .. })));
        assert!(matches!(parse_with_catalog("41 FE 00", &catalog), Err(ObdError::Parse { .. })));
        assert!(matches!(parse_with_catalog("", &catalog), Err(ObdError::Parse { .. })));
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let catalog = PidCatalog::standard();
        let fuel_type = catalog.get(0x01, 0x51).unwrap();
        assert_eq!(parse_pid_response("41 51 04", fuel_type).unwrap().value, 4.0);
        assert!(matches!(parse_pid_response("41 51 FF", fuel_type), Err(ObdError::Parse { .. })));

        let oil = catalog.get(0x01, 0x5C).unwrap();
        assert_eq!(parse_pid_response("41 5C FA", oil).unwrap().value, 210.0);
        assert!(matches!(parse_with_catalog("41 5C FF", &catalog), Err(ObdError::Parse { .. })));
    }

    #[test]
    fn test_decode_dtc_prefixes() {
        assert_eq!(decode_dtc(0x03, 0x01), "P0301");
        assert_eq!(decode_dtc(0x04, 0x20), "P0420");
        assert_eq!(decode_dtc(0x41, 0x23), "C0123");
        assert_eq!(decode_dtc(0x90, 0x01), "B1001");
        assert_eq!(decode_dtc(0xC1, 0x00), "U0100");
        assert_eq!(decode_dtc(0x00, 0x00), "P0000");
    }

    #[test]
    fn test_parse_dtc_drops_padding_and_duplicates() {
        let codes = parse_dtc_response("43 03 01 04 20 00 00\n43 03 01 00 00 00 00").unwrap();
        assert_eq!(codes, vec!["P0301", "P0420"]);
    }

    #[test]
    fn test_parse_dtc_with_count_byte() {
        // CAN style: 43, count, pairs
        let codes = parse_dtc_response("43 02 01 33 04 20").unwrap();
        assert_eq!(codes, vec!["P0133", "P0420"]);
    }

    #[test]
    fn test_parse_dtc_empty_and_invalid() {
        assert!(parse_dtc_response("43 00").unwrap().is_empty());
        assert!(matches!(parse_dtc_response("41 00"), Err(ObdError::Parse { .. })));
    }

    #[test]
    fn test_supported_pids_bitmap() {
        let pids = parse_supported_pids("41 00 BE 3E B8 13").unwrap();
        assert!(pids.contains(&0x01));
        assert!(!pids.contains(&0x02));
        assert!(pids.contains(&0x0C));
        assert!(pids.contains(&0x0D));
        assert!(pids.contains(&0x20));
        assert!(matches!(parse_supported_pids("41 00 BE"), Err(ObdError::Parse { .. })));
    }

    #[test]
    fn test_parse_vin() {
        let response = "49 02 01 00 00 00 31\n49 02 02 48 47 43 4D\n49 02 03 38 32 36 33\n49 02 04 33 41 30 30\n49 02 05 34 33 35 32";
        assert_eq!(parse_vin(response).unwrap(), "1HGCM82633A004352");
        assert!(parse_vin("49 02 01 31 32").is_err());
    }

    proptest! {
        #[test]
        fn prop_dtc_pair_layout(a in any::<u8>(), b in any::<u8>()) {
            let code = decode_dtc(a, b);
            prop_assert_eq!(code.len(), 5);
            let expected_prefix = ['P', 'C', 'B', 'U'][(a >> 6) as usize];
            prop_assert_eq!(code.chars().next(), Some(expected_prefix));
            let digits = u16::from_str_radix(&code[1..], 16).unwrap();
            prop_assert_eq!(digits, (((a & 0x3F) as u16) << 8) | b as u16);
        }

        #[test]
        fn prop_dtc_list_has_no_duplicates(pairs in proptest::collection::vec((0u8..4, any::<u8>()), 0..12)) {
            let mut response = String::from("43");
            for (a, b) in &pairs {
                response.push_str(&format!(" {a:02X} {b:02X}"));
            }
            let codes = parse_dtc_response(&response).unwrap();
            let mut seen = std::collections::HashSet::new();
            for code in &codes {
                prop_assert!(code != "P0000");
                prop_assert!(seen.insert(code.clone()));
            }
        }
    }
}
