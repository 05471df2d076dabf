use crate::header::{parse_header_field, strip_whitespace};

use super::{ArcError, MAX_INSTANCE};

/// An `ARC-Authentication-Results` header: an instance number followed by
/// Authentication-Results payload, carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcAuthenticationResults {
    pub instance: u32,
    /// The full header value, `i=N;` prefix included.
    pub value: String,
    /// The raw header line this was parsed from; empty for constructed
    /// values.
    pub raw_header: String,
}

impl ArcAuthenticationResults {
    pub fn parse(line: &str) -> Result<Self, ArcError> {
        let (name, value) = parse_header_field(line);
        if !name.eq_ignore_ascii_case("arc-authentication-results") {
            return Err(ArcError::InvalidHeaderField);
        }

        let first = value.split(';').next().unwrap_or_default();
        let instance = match strip_whitespace(first).strip_prefix("i=") {
            Some(num) => num
                .parse::<u32>()
                .map_err(|_| ArcError::InvalidInstanceNumber)?,
            None => return Err(ArcError::InvalidInstanceNumber),
        };
        if instance == 0 || instance > MAX_INSTANCE {
            return Err(ArcError::InvalidInstanceNumber);
        }

        Ok(Self {
            instance,
            value,
            raw_header: line.to_string(),
        })
    }

    /// The raw header line as seen in the message; for constructed values,
    /// the emission form.
    pub fn raw(&self) -> String {
        if self.raw_header.is_empty() {
            self.header_string()
        } else {
            self.raw_header.clone()
        }
    }

    pub fn header_string(&self) -> String {
        format!("ARC-Authentication-Results: {}\r\n", self.value)
    }
}
