//! Serde helpers shared by configuration types

/// Durations expressed in seconds
///
/// Whole durations serialize as integers, sub-second ones as floats, so
/// `forward_resolve_timeout = 0.5` round-trips through TOML.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Settings {
///     #[serde(with = "sshubl_core::config::serde_utils::duration_secs")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Secs {
        Whole(u64),
        Fractional(f64),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_u64(duration.as_secs())
        } else {
            serializer.serialize_f64(duration.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Secs::deserialize(deserializer)? {
            Secs::Whole(secs) => Ok(Duration::from_secs(secs)),
            Secs::Fractional(secs) if secs.is_finite() && secs >= 0.0 => {
                Ok(Duration::from_secs_f64(secs))
            }
            Secs::Fractional(secs) => Err(serde::de::Error::custom(format!(
                "invalid duration: {} seconds",
                secs
            ))),
        }
    }
}
