use crate::error::ConfigError;

/// Parse a memory size such as `1G`, `512M`, `1.5GB` or `2048` into bytes
///
/// Suffixes are binary multiples and case-insensitive; a trailing `B` is optional.
pub fn parse_memory_size(input: &str) -> Result<u64, ConfigError> {
    const FIELD: &str = "max_memory_restart";

    let text = input.trim();
    if text.is_empty() {
        return Err(ConfigError::invalid(FIELD, "empty size"));
    }

    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| ConfigError::invalid(FIELD, format!("invalid size: {}", input)))?;

    let unit = unit.trim().to_ascii_uppercase();
    let multiplier: u64 = match unit.trim_end_matches('B') {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => {
            return Err(ConfigError::invalid(
                FIELD,
                format!("unknown size unit in {}", input),
            ))
        }
    };

    let bytes = (value * multiplier as f64).round();
    if !bytes.is_finite() || bytes < 1.0 || bytes > u64::MAX as f64 {
        return Err(ConfigError::invalid(FIELD, "must be a positive byte count"));
    }

    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_bytes() {
        assert_eq!(parse_memory_size("2048").unwrap(), 2048);
        assert_eq!(parse_memory_size(" 1 ").unwrap(), 1);
    }

    #[test]
    fn test_suffixes() {
        assert_eq!(parse_memory_size("1G").unwrap(), 1_073_741_824);
        assert_eq!(parse_memory_size("200M").unwrap(), 200 * 1024 * 1024);
        assert_eq!(parse_memory_size("50k").unwrap(), 50 * 1024);
        assert_eq!(parse_memory_size("1GB").unwrap(), 1_073_741_824);
        assert_eq!(parse_memory_size("1.5G").unwrap(), 1_610_612_736);
        assert_eq!(parse_memory_size("2T").unwrap(), 2 * (1u64 << 40));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_memory_size("").is_err());
        assert!(parse_memory_size("G").is_err());
        assert!(parse_memory_size("12X").is_err());
        assert!(parse_memory_size("1.2.3M").is_err());
        assert!(parse_memory_size("-5M").is_err());
    }

    #[test]
    fn test_rejects_zero() {
        assert!(parse_memory_size("0").is_err());
        assert!(parse_memory_size("0M").is_err());
    }
}
