//! Line framing
//!
//! Frame format (one ASCII line):
//! - `<deviceId>:<command>` body
//! - `|` separator
//! - decimal CRC of the body (see [`checksum`](super::checksum))
//! - `\n` terminator (added by the port on write, stripped on read)

use super::checksum;
use super::FrameError;

/// Separator between the frame body and its checksum
pub const CHECKSUM_SEPARATOR: char = '|';

/// Separator between the device id and the command
pub const DEVICE_SEPARATOR: char = ':';

/// Device id that addresses every device on a port
pub const BROADCAST_ID: &str = "*";

/// Append the checksum to a command body (without the line terminator).
pub fn encode(body: &str) -> String {
    format!("{}{}{}", body, CHECKSUM_SEPARATOR, checksum::compute(body))
}

/// Verify a received line and return its body.
///
/// The checksum covers everything before the last `|`. An embedded checksum
/// that does not parse is treated as zero, so it fails the comparison.
pub fn decode(line: &str) -> Result<&str, FrameError> {
    let pos = line
        .rfind(CHECKSUM_SEPARATOR)
        .ok_or(FrameError::MissingChecksum)?;
    let body = &line[..pos];
    let remote = line[pos + 1..].trim().parse::<u16>().unwrap_or(0);
    let calculated = checksum::compute(body);
    if calculated != remote {
        return Err(FrameError::ChecksumMismatch { calculated, remote });
    }
    Ok(body)
}

/// Split a verified body into device id and payload.
///
/// Returns `None` for the id when the frame carries no `:`.
pub fn split_device_id(body: &str) -> (Option<&str>, &str) {
    match body.find(DEVICE_SEPARATOR) {
        Some(pos) => (Some(body[..pos].trim()), body[pos + 1..].trim()),
        None => (None, body.trim()),
    }
}

/// Replace non-ASCII characters so a frame can be logged or sent as JSON
pub fn sanitize(message: &str) -> String {
    message
        .chars()
        .map(|c| if c.is_ascii() { c } else { 'X' })
        .collect()
}
