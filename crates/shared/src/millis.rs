//! Serde adapter for signed `chrono::Duration` values stored as whole milliseconds.

use chrono::Duration;
use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_i64(value.num_milliseconds())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = i64::deserialize(deserializer)?;
    Duration::try_milliseconds(millis)
        .ok_or_else(|| D::Error::custom(format!("{millis}ms is out of range")))
}
