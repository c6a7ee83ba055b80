use crate::error::MoxError;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Largest disk mockmox will provision: 1 PiB.
pub const MAX_DISK_GB: u64 = 1 << 20;

/// `gb` gigabytes in bytes. Sizes above `MAX_DISK_GB` are refused.
pub fn gb_to_bytes(gb: u64) -> Result<u64, MoxError> {
    if gb > MAX_DISK_GB {
        return Err(MoxError::Validation {
            message: format!("disk size {gb} GB is above the {MAX_DISK_GB} GB limit"),
        });
    }
    gb.checked_mul(GIB).ok_or_else(|| MoxError::Validation {
        message: format!("disk size {gb} GB does not fit in 64 bits"),
    })
}

/// Bytes to whole gigabytes, rounding up.
pub fn gb_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(GIB)
}

/// Bytes from `"20G"`, `"512M"`, `"100K"`, `"2T"` or a plain byte count.
/// Suffixes are binary and case-insensitive, with an optional trailing `B`.
pub fn parse_size(s: &str) -> Result<u64, MoxError> {
    let invalid = |why: &str| MoxError::Validation {
        message: format!("invalid size '{s}': {why}"),
    };
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(invalid("expected a number"));
    }
    let shift = match unit.trim().to_ascii_uppercase().trim_end_matches('B') {
        "" => 0,
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        _ => return Err(invalid("unit must be K, M, G or T")),
    };
    let count: u64 = digits.parse().map_err(|_| invalid("number too large"))?;
    count
        .checked_mul(1u64 << shift)
        .ok_or_else(|| invalid("number too large"))
}

/// Parse a disk size given on the command line into whole gigabytes.
///
/// A bare number is already gigabytes; anything with a suffix is converted
/// and rounded up.
pub fn parse_disk_gb(s: &str) -> Result<u64, MoxError> {
    let trimmed = s.trim();
    let gb = if trimmed.chars().all(|c| c.is_ascii_digit()) && !trimmed.is_empty() {
        trimmed.parse().map_err(|_| MoxError::Validation {
            message: format!("invalid disk size: '{s}'"),
        })?
    } else {
        gb_ceil(parse_size(trimmed)?)
    };
    if gb == 0 {
        return Err(MoxError::Validation {
            message: "disk size must be at least 1 GB".into(),
        });
    }
    gb_to_bytes(gb)?;
    Ok(gb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_units() {
        assert_eq!(parse_size("20G").unwrap(), 20 * GIB);
        assert_eq!(parse_size("1GB").unwrap(), GIB);
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("100K").unwrap(), 100 * 1024);
        assert_eq!(parse_size("1073741824").unwrap(), GIB);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("10X").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn gb_rounds_up() {
        assert_eq!(gb_ceil(0), 0);
        assert_eq!(gb_ceil(1), 1);
        assert_eq!(gb_ceil(GIB), 1);
        assert_eq!(gb_ceil(GIB + 1), 2);
    }

    #[test]
    fn disk_gb_from_cli() {
        assert_eq!(parse_disk_gb("128").unwrap(), 128);
        assert_eq!(parse_disk_gb("128G").unwrap(), 128);
        assert_eq!(parse_disk_gb("1500M").unwrap(), 2);
        assert_eq!(parse_disk_gb("1T").unwrap(), 1024);
        assert!(parse_disk_gb("0").is_err());
        assert!(parse_disk_gb("lots").is_err());
    }

    #[test]
    fn disk_gb_is_bounded() {
        assert_eq!(gb_to_bytes(MAX_DISK_GB).unwrap(), MAX_DISK_GB * GIB);
        assert!(gb_to_bytes(MAX_DISK_GB + 1).is_err());
        assert!(gb_to_bytes(1 << 40).is_err());
        assert!(parse_disk_gb("1099511627776").is_err());
        assert!(parse_disk_gb("2048T").is_err());
        assert_eq!(parse_disk_gb("1024T").unwrap(), MAX_DISK_GB);
    }
}
