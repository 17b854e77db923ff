use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

/// Generates a random token of size N bytes, encoded in base58.
pub fn generate_token<const N: usize>(mut rng: impl Rng) -> eyre::Result<String> {
    let mut token = [0u8; N];
    rng.try_fill_bytes(&mut token)?;
    Ok(bs58::encode(token).into_string())
}

/// Converts a std duration into a chrono delta, saturating on overflow.
pub fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

pub fn to_millis(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token_is_unique() {
        let mut rng = rand::thread_rng();
        let a = generate_token::<16>(&mut rng).unwrap();
        let b = generate_token::<16>(&mut rng).unwrap();

        assert_ne!(a, b);
        assert!(bs58::decode(&a).into_vec().unwrap().len() == 16);
    }

    #[test]
    fn test_millis_round_trip() {
        let instant = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(instant), 1_700_000_000_123);
    }
}
