//! Logging helper for quoting inbound device payloads in a single log line.
//! Devices occasionally emit binary or multi-line junk; previews keep that
//! from corrupting log output.

/// Render a payload for logging: lossy UTF-8, control characters escaped,
/// truncated with an ellipsis past `MAX_PREVIEW` characters.
pub fn payload_preview(payload: &[u8]) -> String {
    const MAX_PREVIEW: usize = 200;
    let text = String::from_utf8_lossy(payload);
    let mut out = String::with_capacity(text.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in text.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
