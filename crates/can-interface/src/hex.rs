//! Hex normalization for user-entered frames

use crate::error::CanError;

/// Remove all whitespace; left-pad an odd digit count with one `0`
///
/// `"FFF"` becomes `"0FFF"`, `"1 A"` becomes `"1A"`.
pub fn sanitize_hex(input: &str) -> String {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 == 1 {
        format!("0{}", compact)
    } else {
        compact
    }
}

fn ensure_hex(field: &'static str, value: &str) -> Result<(), CanError> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CanError::InvalidHex {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Sanitized payload, validated as hex
pub fn frame_data(data: &str) -> Result<String, CanError> {
    let data = sanitize_hex(data);
    ensure_hex("data", &data)?;
    Ok(data)
}

/// Sanitized arbitration header
///
/// An 11-bit header keeps its three digits, which is the form `ATSH`
/// expects; other lengths are padded like payloads.
pub fn frame_header(header: &str) -> Result<String, CanError> {
    let compact: String = header.chars().filter(|c| !c.is_whitespace()).collect();
    let header = if compact.len() == 3 {
        compact
    } else {
        sanitize_hex(&compact)
    };
    ensure_hex("header", &header)?;
    if !matches!(header.len(), 3 | 6 | 8) {
        return Err(CanError::InvalidHex {
            field: "header",
            value: header,
        });
    }
    Ok(header)
}
