//! Serde helpers for configuration values

/// `Duration` stored as whole seconds
///
/// ```ignore
/// #[serde(with = "bf_core::config::duration_secs")]
/// timeout: Duration,
/// ```
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Closed port range stored as a two-element array `[start, end]`
pub mod port_range {
    use serde::de::Error;
    use serde::{self, Deserialize, Deserializer, Serialize, Serializer};
    use std::ops::RangeInclusive;

    pub fn serialize<S>(range: &RangeInclusive<u16>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        [*range.start(), *range.end()].serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<RangeInclusive<u16>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let [start, end] = <[u16; 2]>::deserialize(deserializer)?;
        if start > end {
            return Err(D::Error::custom(format!(
                "port range start {} is greater than end {}",
                start, end
            )));
        }
        Ok(start..=end)
    }
}
