//! Provides formatting helpers for durations and byte sizes.
//!
//! These are mainly used when logging cache refreshes (bytes) and request latencies
//! (microseconds).

/// Formats a duration given in microseconds.
///
/// This function determines the ideal unit (ranging from microseconds to seconds) to provide
/// a concise representation.
///
/// Note that a helper function [format_short_duration](format_short_duration) is also provided
/// which directly returns a String. This function also provides some examples.
pub fn format_micros(micros: i32, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    if micros < 1_000 {
        write!(f, "{} us", micros)
    } else if micros < 10_000 {
        write!(f, "{:.2} ms", micros as f32 / 1_000.)
    } else if micros < 100_000 {
        write!(f, "{:.1} ms", micros as f32 / 1_000.)
    } else if micros < 1_000_000 {
        write!(f, "{} ms", micros / 1_000)
    } else if micros < 10_000_000 {
        write!(f, "{:.2} s", micros as f32 / 1_000_000.)
    } else if micros < 100_000_000 {
        write!(f, "{:.1} s", micros as f32 / 1_000_000.)
    } else {
        write!(f, "{} s", micros / 1_000_000)
    }
}

/// Formats a duration given in microseconds and returns a String representation.
///
/// This function determines the ideal unit (ranging from microseconds to seconds) to provide
/// a concise representation.
///
/// # Examples
///
/// ```
/// assert_eq!(shdb::fmt::format_short_duration(100), "100 us");
/// assert_eq!(shdb::fmt::format_short_duration(8_192), "8.19 ms");
/// assert_eq!(shdb::fmt::format_short_duration(32_768), "32.8 ms");
/// assert_eq!(shdb::fmt::format_short_duration(128_123), "128 ms");
/// assert_eq!(shdb::fmt::format_short_duration(1_128_123), "1.13 s");
/// assert_eq!(shdb::fmt::format_short_duration(10_128_123), "10.1 s");
/// assert_eq!(shdb::fmt::format_short_duration(101_000_000), "101 s");
/// ```
pub fn format_short_duration(duration_in_micros: i32) -> String {
    let mut result = String::new();
    let _ = format_micros(duration_in_micros, &mut result);
    result
}

/// Formats a given size in bytes.
///
/// This function determines the ideal unit (ranging from bytes to petabytes) to provide
/// a concise representation.
///
/// Note that a helper function [format_size](format_size) is also provided
/// which directly returns a String. This function also provides some examples.
pub fn format_bytes(size_in_bytes: usize, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    if size_in_bytes == 1 {
        return write!(f, "1 byte");
    } else if size_in_bytes < 1024 {
        return write!(f, "{} bytes", size_in_bytes);
    }

    let mut magnitude = 0;
    let mut size = size_in_bytes as f32;
    while size > 1024. && magnitude < 5 {
        size /= 1024.;
        magnitude += 1;
    }

    if size <= 10. {
        write!(f, "{:.2} ", size)?;
    } else if size <= 100. {
        write!(f, "{:.1} ", size)?;
    } else {
        write!(f, "{:.0} ", size)?;
    }

    match magnitude {
        0 => write!(f, "Bytes"),
        1 => write!(f, "KiB"),
        2 => write!(f, "MiB"),
        3 => write!(f, "GiB"),
        4 => write!(f, "TiB"),
        _ => write!(f, "PiB"),
    }
}

/// Formats a given size in bytes and returns a String representation.
///
/// This function determines the ideal unit (ranging from bytes to petabytes) to provide
/// a concise representation.
///
/// # Examples
///
/// ```
/// assert_eq!(shdb::fmt::format_size(0), "0 bytes");
/// assert_eq!(shdb::fmt::format_size(1), "1 byte");
/// assert_eq!(shdb::fmt::format_size(100), "100 bytes");
/// assert_eq!(shdb::fmt::format_size(8_734), "8.53 KiB");
/// assert_eq!(shdb::fmt::format_size(87_340), "85.3 KiB");
/// assert_eq!(shdb::fmt::format_size(873_400), "853 KiB");
/// assert_eq!(shdb::fmt::format_size(8_734_000), "8.33 MiB");
/// assert_eq!(shdb::fmt::format_size(8_734_000_000), "8.13 GiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    let mut result = String::new();
    let _ = format_bytes(size_in_bytes, &mut result);
    result
}
