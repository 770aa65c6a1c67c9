//! Input validation for identifiers that cross the MQTT boundary.

/// Maximum accepted device code length. Codes are MAC addresses or short
/// operator-assigned identifiers; anything longer is suspect.
pub const MAX_DEVICE_CODE_LEN: usize = 64;

/// A device code is non-empty, at most [`MAX_DEVICE_CODE_LEN`] bytes, and
/// restricted to ASCII alphanumerics, `-` and `_`. This keeps codes safe to
/// embed in topic segments and log lines.
pub fn is_valid_device_code(code: &str) -> bool {
    !code.is_empty()
        && code.len() <= MAX_DEVICE_CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
