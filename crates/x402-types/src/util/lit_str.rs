//! Types standing for one fixed string.
//!
//! Wire fields such as the payment scheme (`"exact"`) or the session purpose
//! (`"microapi-session"`) admit exactly one value. [`lit_str!`](crate::lit_str) turns
//! such a value into a zero-sized type, so that a document carrying anything else
//! fails to deserialize instead of being checked by hand later.
//!
//! ```
//! use microapi_x402_types::lit_str;
//!
//! lit_str!(ExactScheme, "exact");
//!
//! let scheme: ExactScheme = "exact".parse().unwrap();
//! assert_eq!(scheme.to_string(), "exact");
//! assert!("upto".parse::<ExactScheme>().is_err());
//! ```

/// Declares a unit struct that (de)serializes as, and parses from, exactly `$val`.
#[macro_export]
macro_rules! lit_str {
    ($struct_name:ident, $val:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $struct_name;

        impl $struct_name {
            pub const VALUE: &'static str = $val;
        }

        impl AsRef<str> for $struct_name {
            fn as_ref(&self) -> &str {
                Self::VALUE
            }
        }

        impl std::str::FromStr for $struct_name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s == Self::VALUE {
                    Ok($struct_name)
                } else {
                    Err(format!("expected '{}', got '{}'", Self::VALUE, s))
                }
            }
        }

        impl serde::Serialize for $struct_name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(Self::VALUE)
            }
        }

        impl<'de> serde::Deserialize<'de> for $struct_name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }

        impl std::fmt::Display for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(Self::VALUE)
            }
        }
    };
}
