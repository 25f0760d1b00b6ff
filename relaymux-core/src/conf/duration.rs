use std::fmt;
use std::time::Duration as StdDuration;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A duration that crosses the JSON surface as a humantime string ("10s",
/// "1h30m"). Bare integers are accepted on input and read as seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HumanDuration(pub StdDuration);

impl HumanDuration {
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(StdDuration::from_secs(secs))
    }

    #[must_use]
    pub const fn as_duration(&self) -> StdDuration {
        self.0
    }

    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<StdDuration> for HumanDuration {
    fn from(d: StdDuration) -> Self {
        Self(d)
    }
}

impl From<HumanDuration> for StdDuration {
    fn from(d: HumanDuration) -> Self {
        d.0
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl de::Visitor<'_> for DurationVisitor {
            type Value = HumanDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like \"10s\" or a number of seconds")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                humantime::parse_duration(v)
                    .map(HumanDuration)
                    .map_err(|e| E::custom(format!("invalid duration '{v}': {e}")))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(HumanDuration::from_secs(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u64::try_from(v)
                    .map(HumanDuration::from_secs)
                    .map_err(|_| E::custom("duration can not be negative"))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let d: HumanDuration = serde_json::from_str("\"7s\"").unwrap();
        assert_eq!(d.as_duration(), StdDuration::from_secs(7));
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"7s\"");
    }

    #[test]
    fn test_composite() {
        let d: HumanDuration = serde_json::from_str("\"1h 30m\"").unwrap();
        assert_eq!(d.as_duration(), StdDuration::from_secs(5400));
    }

    #[test]
    fn test_integer_seconds() {
        let d: HumanDuration = serde_json::from_str("10").unwrap();
        assert_eq!(d.as_duration(), StdDuration::from_secs(10));
    }

    #[test]
    fn test_zero() {
        let d: HumanDuration = serde_json::from_str("\"0s\"").unwrap();
        assert!(d.is_zero());
    }

    #[test]
    fn test_invalid() {
        assert!(serde_json::from_str::<HumanDuration>("\"abc\"").is_err());
        assert!(serde_json::from_str::<HumanDuration>("-3").is_err());
    }
}
