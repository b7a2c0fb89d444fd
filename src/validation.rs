//! Input validation for bus addresses and instrument parameters.
//!
//! Every check here is pure: it runs before any line is written to the helper, so a
//! rejected value never causes I/O or a helper restart.

use crate::error::{AdapterError, AdapterResult};
use std::ops::RangeInclusive;

/// Legal GPIB primary addresses for an instrument.
pub const BUS_ADDRESS_RANGE: RangeInclusive<u8> = 1..=31;

/// Legal acquisition record lengths.
pub const ACQUISITION_POINTS_RANGE: RangeInclusive<u32> = 16..=4096;

/// Legal averaging counts.
pub const AVERAGE_COUNT_RANGE: RangeInclusive<u32> = 1..=4096;

/// Oscilloscope input channels.
pub const CHANNEL_RANGE: RangeInclusive<u8> = 1..=4;

/// Checks a bus address.
pub fn bus_address(address: u8) -> AdapterResult<u8> {
    if BUS_ADDRESS_RANGE.contains(&address) {
        Ok(address)
    } else {
        Err(AdapterError::InvalidAddress(address))
    }
}

/// `value` if it lies in `range`, otherwise an [`AdapterError::InvalidValue`] naming
/// `parameter`.
fn within<T>(value: T, range: RangeInclusive<T>, parameter: &'static str) -> AdapterResult<T>
where
    T: PartialOrd + ToString,
{
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(AdapterError::InvalidValue {
            parameter,
            value: value.to_string(),
        })
    }
}

/// Parses a bus address typed by an operator, e.g. `"7"`.
pub fn parse_bus_address(text: &str) -> AdapterResult<u8> {
    let trimmed = text.trim();
    let address = trimmed
        .parse::<u8>()
        .map_err(|_| AdapterError::InvalidValue {
            parameter: "bus address",
            value: trimmed.to_string(),
        })?;
    bus_address(address)
}

/// Checks an acquisition point count.
pub fn acquisition_points(points: u32) -> AdapterResult<u32> {
    within(points, ACQUISITION_POINTS_RANGE, "acquisition points")
}

/// Checks an averaging count.
pub fn average_count(count: u32) -> AdapterResult<u32> {
    within(count, AVERAGE_COUNT_RANGE, "average count")
}

/// Checks a channel number.
pub fn channel(number: u8) -> AdapterResult<u8> {
    within(number, CHANNEL_RANGE, "channel")
}

/// Checks a path for the helper's `file` command.
///
/// The helper reads the path up to the end of the line, so embedded line breaks and
/// null bytes are rejected.
pub fn output_path(path: &str) -> AdapterResult<&str> {
    if path.trim().is_empty() || path.contains(['\0', '\n', '\r']) {
        return Err(AdapterError::InvalidValue {
            parameter: "output file",
            value: path.escape_default().to_string(),
        });
    }
    Ok(path)
}
