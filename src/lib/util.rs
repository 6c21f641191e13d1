//! Byte-size formatting and parsing shared by the config loader and the logs.

/// Formats a byte count the way the heap-sizing logs print it, e.g. `1.0 GiB`.
pub fn human_readable_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Parses sizes such as `4096`, `0x100000`, `512KB`, `64MB` or `1GB`.
///
/// Suffixes are binary multiples and case-insensitive; an optional trailing
/// `B` or `iB` is accepted (`1G`, `1GB`, `1GiB` are all 2^30).
pub fn parse_byte_size(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).ok();
    }

    let upper = text.to_ascii_uppercase();
    let digits_end = upper
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(upper.len());
    let (digits, suffix) = upper.split_at(digits_end);
    let value: u64 = digits.parse().ok()?;

    let shift = match suffix.trim() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        _ => return None,
    };
    value.checked_mul(1u64 << shift)
}

/// Rounds `value` up to the next multiple of `alignment` (a power of two).
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("4096"), Some(4096));
        assert_eq!(parse_byte_size("0x100000"), Some(0x100000));
        assert_eq!(parse_byte_size("512KB"), Some(512 * 1024));
        assert_eq!(parse_byte_size("64mb"), Some(64 << 20));
        assert_eq!(parse_byte_size("1GB"), Some(1 << 30));
        assert_eq!(parse_byte_size("1GiB"), Some(1 << 30));
        assert_eq!(parse_byte_size(" 2G "), Some(2 << 30));
        assert_eq!(parse_byte_size("lots"), None);
        assert_eq!(parse_byte_size("12XB"), None);
    }

    #[test]
    fn test_human_readable_bytes() {
        assert_eq!(human_readable_bytes(512), "512 B");
        assert_eq!(human_readable_bytes(1536), "1.5 KiB");
        assert_eq!(human_readable_bytes(1 << 30), "1.0 GiB");
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(1, 8), Some(8));
        assert_eq!(align_up(600, 8), Some(600));
        assert_eq!(align_up(601, 8), Some(608));
        assert_eq!(align_up(u64::MAX, 8), None);
    }
}
