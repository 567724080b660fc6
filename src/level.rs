/*!
The [`Level`] type.
*/

use std::{fmt, str::FromStr};

/**
A severity level for a log event.

Levels are ordered from least to most severe, so `Level::Debug < Level::Warn`. Queue-full policies and sink filters compare against levels using this ordering.

The default level is [`Level::Info`].

# Parsing

`Level` has a permissive parser that will match partial and incomplete contents, ignoring case. So long as the start of the text is a submatch of the full level, and any trailing unmatched characters are not ASCII control characters, the level will parse.

For example, the following will all be parsed as `Level::Info`:

- `info`
- `INFO`
- `i`
- `inf`
- `information`
- `INFO1`
- `inf(13)`

Note that any trailing data is lost when levels are parsed.
*/
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /**
    The event is very fine-grained tracing.
    */
    Trace,
    /**
    The event is weakly informative.
    */
    Debug,
    /**
    The event is informative.
    */
    Info,
    /**
    The event is weakly erroneous.
    */
    Warn,
    /**
    The event is erroneous.
    */
    Error,
    /**
    The event is an unrecoverable error.
    */
    Fatal,
}

impl Level {
    /**
    Try parse a level from a formatted representation.
    */
    pub fn try_from_str(s: &str) -> Result<Self, ParseLevelError> {
        s.parse()
    }

    /**
    Get the canonical name of the level.
    */
    pub const fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }

    pub(crate) fn to_log(&self) -> log::Level {
        match self {
            Level::Trace => log::Level::Trace,
            Level::Debug => log::Level::Debug,
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
            Level::Error | Level::Fatal => log::Level::Error,
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Level::Info
    }
}

impl fmt::Debug for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let lvl = s.as_bytes();

        match lvl.first() {
            Some(b'T') | Some(b't') => {
                parse(lvl, b"TRACE", Level::Trace).or_else(|_| parse(lvl, b"TRC", Level::Trace))
            }
            Some(b'D') | Some(b'd') => {
                parse(lvl, b"DEBUG", Level::Debug).or_else(|_| parse(lvl, b"DBG", Level::Debug))
            }
            Some(b'I') | Some(b'i') => parse(lvl, b"INFORMATION", Level::Info),
            Some(b'W') | Some(b'w') => {
                parse(lvl, b"WARNING", Level::Warn).or_else(|_| parse(lvl, b"WRN", Level::Warn))
            }
            Some(b'E') | Some(b'e') => parse(lvl, b"ERROR", Level::Error),
            Some(b'F') | Some(b'f') => {
                parse(lvl, b"FATAL", Level::Fatal).or_else(|_| parse(lvl, b"FTL", Level::Fatal))
            }
            Some(_) => Err(ParseLevelError {}),
            None => Err(ParseLevelError {}),
        }
    }
}

fn parse(
    mut input: &[u8],
    mut expected_uppercase: &[u8],
    ok: Level,
) -> Result<Level, ParseLevelError> {
    // The first character has already been matched
    input = &input[1..];
    expected_uppercase = &expected_uppercase[1..];

    // `INF` matches `INFORMATION`
    while let Some(b) = input.first() {
        match b {
            b if b.is_ascii_alphabetic() => {
                let Some(e) = expected_uppercase.first() else {
                    return Err(ParseLevelError {});
                };

                if b.to_ascii_uppercase() != *e {
                    return Err(ParseLevelError {});
                }

                expected_uppercase = &expected_uppercase[1..];
                input = &input[1..];
            }
            // Stop at the first non-alphabetic character, so `info13` and `INFO(4)` match
            b if b.is_ascii() && !b.is_ascii_control() => break,
            _ => {
                return Err(ParseLevelError {});
            }
        }
    }

    Ok(ok)
}

/**
An error attempting to parse a [`Level`] from text.
*/
#[derive(Debug)]
pub struct ParseLevelError {}

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the input was not a valid level")
    }
}

impl std::error::Error for ParseLevelError {}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Level {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = Level;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a level like `info` or `warn`")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}
