//! Wire representations: bytes as base64 strings, 64-bit integers as
//! decimal strings and durations as `"<seconds>s"`.

pub mod base64_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&threatmatch_hash::to_base64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        threatmatch_hash::from_base64(&encoded).map_err(de::Error::custom)
    }
}

pub mod base64_bytes_list {
    use serde::ser::SerializeSeq;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&threatmatch_hash::to_base64(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|encoded| threatmatch_hash::from_base64(encoded).map_err(de::Error::custom))
            .collect()
    }
}

pub mod int64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::String(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

pub mod option_duration {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_str(&format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => parse_duration(&text).map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }

    pub(crate) fn format_duration(duration: Duration) -> String {
        if duration.subsec_nanos() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}s", duration.as_secs_f64())
        }
    }

    pub(crate) fn parse_duration(text: &str) -> Result<Duration, String> {
        let seconds = text
            .strip_suffix('s')
            .ok_or_else(|| format!("duration {text:?} does not end in 's'"))?;
        let value: f64 = seconds
            .parse()
            .map_err(|e| format!("invalid duration {text:?}: {e}"))?;
        Duration::try_from_secs_f64(value).map_err(|e| format!("invalid duration {text:?}: {e}"))
    }

}
