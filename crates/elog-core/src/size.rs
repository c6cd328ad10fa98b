//! Byte-size parsing and formatting. The file-manager page reports
//! per-run totals either as raw byte counts or as human-readable
//! strings like "1.5 GB"; units are decimal (1000-based), matching the
//! upstream page.

const UNITS: [(&str, u64); 5] = [
    ("PB", 1_000_000_000_000_000),
    ("TB", 1_000_000_000_000),
    ("GB", 1_000_000_000),
    ("MB", 1_000_000),
    ("KB", 1_000),
];

/// Parses a size string into bytes. Accepts plain integers ("12345")
/// and decimal-unit strings ("1.5 GB", "300MB", "2 g"), case
/// insensitive, with or without a space before the unit.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value.bytes().all(|byte| byte.is_ascii_digit()) {
        return value.parse().ok();
    }

    let unit_start = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let number: f64 = value[..unit_start].parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }

    let multiplier: u64 = match value[unit_start..].trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1_000,
        "M" | "MB" => 1_000_000,
        "G" | "GB" => 1_000_000_000,
        "T" | "TB" => 1_000_000_000_000,
        "P" | "PB" => 1_000_000_000_000_000,
        _ => return None,
    };

    Some((number * multiplier as f64).round() as u64)
}

/// Renders a byte count in the largest decimal unit that fits, with at
/// most two decimal places. `parse_size(&format_size(n))` is stable
/// under repeated round trips.
pub fn format_size(bytes: u64) -> String {
    for (unit, scale) in UNITS {
        if bytes >= scale {
            let scaled = bytes as f64 / scale as f64;
            let mut text = format!("{scaled:.2}");
            while text.ends_with('0') {
                text.pop();
            }
            if text.ends_with('.') {
                text.pop();
            }
            return format!("{text} {unit}");
        }
    }
    format!("{bytes} B")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_byte_counts() {
        assert_eq!(parse_size("0"), Some(0));
        assert_eq!(parse_size(" 123456789 "), Some(123_456_789));
    }

    #[test]
    fn parses_decimal_units() {
        assert_eq!(parse_size("1.5 GB"), Some(1_500_000_000));
        assert_eq!(parse_size("300MB"), Some(300_000_000));
        assert_eq!(parse_size("2 kb"), Some(2_000));
        assert_eq!(parse_size("1.25 tb"), Some(1_250_000_000_000));
        assert_eq!(parse_size("42 B"), Some(42));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("GB"), None);
        assert_eq!(parse_size("-1 GB"), None);
        assert_eq!(parse_size("1.5 GiB"), None);
    }

    #[test]
    fn formats_in_largest_fitting_unit() {
        assert_eq!(format_size(999), "999 B");
        assert_eq!(format_size(1_500_000_000), "1.5 GB");
        assert_eq!(format_size(2_000), "2 KB");
        assert_eq!(format_size(1_234_000_000), "1.23 GB");
    }

    #[test]
    fn round_trip_is_stable_under_repeated_ingestion() {
        let first = parse_size("1.5 GB").expect("parse");
        let second = parse_size(&format_size(first)).expect("reparse");
        assert_eq!(first, second);

        // A count that rounds when formatted settles after one pass.
        let rounded = parse_size(&format_size(1_536_000_000)).expect("reparse");
        let settled = parse_size(&format_size(rounded)).expect("reparse again");
        assert_eq!(rounded, settled);
    }
}
