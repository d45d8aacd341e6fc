//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generates a short opaque identifier (12 hex chars of a v4 UUID).
///
/// Used for episode and pending-action ids where a full UUID is noisy
/// in logs and on-wire payloads.
#[must_use]
pub fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

/// Clamps a value into `[0, 1]`.
#[must_use]
pub fn unit_clamp(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_12_hex_chars() {
        let id = short_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn unit_clamp_bounds() {
        assert_eq!(unit_clamp(-0.5), 0.0);
        assert_eq!(unit_clamp(0.5), 0.5);
        assert_eq!(unit_clamp(1.5), 1.0);
    }
}
