//! Human-readable byte size formatting
//!
//! Used when logging how much data a source returned.

/// Binary unit step (1 KB = 1024 B)
const UNIT: u64 = 1024;

/// Unit suffixes after plain bytes
const PREFIXES: [char; 6] = ['K', 'M', 'G', 'T', 'P', 'E'];

/// Format a byte count as a human-readable string
///
/// # Examples
///
/// ```
/// use powdb_common::human_size::format_bytes;
///
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    if bytes < UNIT {
        return format!("{} B", bytes);
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp < PREFIXES.len() - 1 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }

    format!("{:.2} {}B", bytes as f64 / div as f64, PREFIXES[exp])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
    }

    #[test]
    fn test_kilobytes_boundary() {
        assert_eq!(format_bytes(1024), "1.00 KB");
    }

    #[test]
    fn test_larger_units() {
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(format_bytes(u64::MAX), "16.00 EB");
    }
}
