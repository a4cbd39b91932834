//! Reasons a sender may withhold a group session key.

use std::fmt;

use olmdev_store::WithheldRecord;

const FALLBACK_MESSAGE: &str = "decryption key withheld";

/// Withheld reason codes. Unrecognised codes are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WithheldCode {
    Unverified,
    Blacklisted,
    Unauthorised,
    NoOlm,
    Other(String),
}

impl WithheldCode {
    pub fn from_code(code: &str) -> Self {
        match code {
            "m.unverified" => WithheldCode::Unverified,
            "m.blacklisted" => WithheldCode::Blacklisted,
            "m.unauthorised" => WithheldCode::Unauthorised,
            "m.no_olm" => WithheldCode::NoOlm,
            other => WithheldCode::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WithheldCode::Unverified => "m.unverified",
            WithheldCode::Blacklisted => "m.blacklisted",
            WithheldCode::Unauthorised => "m.unauthorised",
            WithheldCode::NoOlm => "m.no_olm",
            WithheldCode::Other(code) => code,
        }
    }

    /// Fixed user-facing message for the known codes.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            WithheldCode::Unverified => {
                Some("The sender has disabled encrypting to unverified devices.")
            }
            WithheldCode::Blacklisted => Some("The sender has blocked you."),
            WithheldCode::Unauthorised => Some("You are not authorised to read the message."),
            WithheldCode::NoOlm => Some("Unable to establish a secure channel."),
            WithheldCode::Other(_) => None,
        }
    }
}

impl fmt::Display for WithheldCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable explanation for a withheld record: the fixed message for a
/// known code, else the sender's free-text reason, else a generic fallback.
pub fn withheld_message(record: &WithheldRecord) -> String {
    let code = WithheldCode::from_code(&record.code);
    if let Some(message) = code.message() {
        return message.to_owned();
    }
    match record.reason.as_deref() {
        Some(reason) if !reason.is_empty() => reason.to_owned(),
        _ => FALLBACK_MESSAGE.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: &str, reason: Option<&str>) -> WithheldRecord {
        WithheldRecord {
            code: code.into(),
            reason: reason.map(str::to_owned),
        }
    }

    #[test]
    fn known_code_wins_over_reason() {
        assert_eq!(
            withheld_message(&record("m.blacklisted", Some("go away"))),
            "The sender has blocked you."
        );
        assert_eq!(
            withheld_message(&record("m.no_olm", None)),
            "Unable to establish a secure channel."
        );
    }

    #[test]
    fn unknown_code_uses_reason_then_fallback() {
        assert_eq!(
            withheld_message(&record("com.example.nope", Some("not today"))),
            "not today"
        );
        assert_eq!(
            withheld_message(&record("com.example.nope", None)),
            "decryption key withheld"
        );
        assert_eq!(
            withheld_message(&record("com.example.nope", Some(""))),
            "decryption key withheld"
        );
    }

    #[test]
    fn codes_roundtrip_through_strings() {
        for code in ["m.unverified", "m.blacklisted", "m.unauthorised", "m.no_olm", "x.y"] {
            assert_eq!(WithheldCode::from_code(code).as_str(), code);
        }
        assert_eq!(
            WithheldCode::from_code("x.y"),
            WithheldCode::Other("x.y".into())
        );
    }
}
