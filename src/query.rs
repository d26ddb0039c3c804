//! Query classification and response tokens.
//!
//! A raw payload is classified in a fixed order, first match wins:
//!
//! 1. longer than the configured maximum: `TooLarge` (checked on raw bytes,
//!    before any decoding work)
//! 2. not valid UTF-8: `InvalidEncoding`
//! 3. empty after trimming: `Empty`
//! 4. otherwise `Valid` with the trimmed text
//!
//! ```text
//! payload            max  classification       response
//! "apple\n"          1024 Valid("apple")       STRING EXISTS / STRING NOT FOUND
//! "" or "\n"         1024 Empty                STRING NOT FOUND
//! "a" x 2048         1024 TooLarge             QUERY TOO LARGE
//! \xff\xfe\xfd       1024 InvalidEncoding      INVALID ENCODING
//! ```

use std::fmt;

/// Result of validating a raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Empty,
    TooLarge,
    InvalidEncoding,
    /// Trimmed query text, never empty
    Valid(String),
}

/// Classify a raw payload against the configured maximum size.
pub fn classify(raw: &[u8], max_payload: usize) -> Classification {
    if raw.len() > max_payload {
        return Classification::TooLarge;
    }

    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(_) => return Classification::InvalidEncoding,
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        Classification::Empty
    } else {
        Classification::Valid(trimmed.to_string())
    }
}

/// The four response tokens of the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Exists,
    NotFound,
    TooLarge,
    InvalidEncoding,
}

impl Response {
    /// Response for a completed dataset lookup.
    pub fn for_lookup(found: bool) -> Self {
        if found {
            Response::Exists
        } else {
            Response::NotFound
        }
    }

    /// Token text without line terminator.
    pub fn token(&self) -> &'static str {
        match self {
            Response::Exists => "STRING EXISTS",
            Response::NotFound => "STRING NOT FOUND",
            Response::TooLarge => "QUERY TOO LARGE",
            Response::InvalidEncoding => "INVALID ENCODING",
        }
    }

    /// Bytes written to the client, newline terminated.
    pub fn wire_bytes(&self) -> &'static [u8] {
        match self {
            Response::Exists => b"STRING EXISTS\n",
            Response::NotFound => b"STRING NOT FOUND\n",
            Response::TooLarge => b"QUERY TOO LARGE\n",
            Response::InvalidEncoding => b"INVALID ENCODING\n",
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}
