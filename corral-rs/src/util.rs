pub mod hex_slice {
    //! Wrapper type around a slice to print it as a lower-case hex
    //! string.
    use std::fmt;

    /// Wrapper type around a slice to print it as a lower-case hex
    /// string. Implements both [`Display`](fmt::Display) and
    /// [`Debug`](fmt::Debug).
    pub struct HexSlice<'a>(pub &'a [u8]);

    impl<'a> fmt::Debug for HexSlice<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for b in self.0.iter() {
                write!(f, "{:0>2x}", *b)?;
            }

            Ok(())
        }
    }

    impl<'a> fmt::Display for HexSlice<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }
}

pub mod text {
    /// Cut `s` down to at most `max_bytes` bytes, backing off to the nearest
    /// character boundary so the result stays valid UTF-8.
    pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
        if s.len() <= max_bytes {
            return s;
        }
        let mut end = max_bytes;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }

    #[cfg(test)]
    mod test {
        use super::truncate_utf8;

        #[test]
        fn keeps_short_strings() {
            assert_eq!(truncate_utf8("abc", 10), "abc");
        }

        #[test]
        fn backs_off_multibyte_boundary() {
            // 'é' is two bytes; cutting in the middle must drop it.
            assert_eq!(truncate_utf8("aé", 2), "a");
            assert_eq!(truncate_utf8("aé", 3), "aé");
        }
    }
}

pub mod chrono {
    pub mod duration {
        //! Human-readable durations ("30s", "1h", "7d") in configuration
        //! files, deserialized into [`chrono::TimeDelta`].
        use fundu::DurationParser;
        use serde::{de, Deserialize, Deserializer, Serializer};

        const PARSER: DurationParser<'static> = DurationParser::with_all_time_units();

        pub fn parse(s: &str) -> Result<chrono::TimeDelta, String> {
            let duration = PARSER.parse(s.trim()).map_err(|e| e.to_string())?;
            let std_duration =
                std::time::Duration::try_from(duration).map_err(|e| e.to_string())?;
            chrono::TimeDelta::from_std(std_duration).map_err(|e| e.to_string())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<chrono::TimeDelta, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            parse(&s).map_err(de::Error::custom)
        }

        pub fn serialize<S>(delta: &chrono::TimeDelta, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&format!("{}s", delta.num_seconds()))
        }

    }
}
