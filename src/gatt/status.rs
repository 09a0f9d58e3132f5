use serde::Serialize;
use strum_macros::{Display, EnumIter};

/// Outcome reported by the link for one GATT request.
///
/// The numbering of any underlying platform is not exposed; drivers translate their own codes
/// into this closed set.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[strum(to_string = "success")]
    Success,
    #[strum(to_string = "failure")]
    Failure,
    #[strum(to_string = "read_not_permitted")]
    ReadNotPermitted,
    #[strum(to_string = "write_not_permitted")]
    WriteNotPermitted,
    #[strum(to_string = "insufficient_authentication")]
    InsufficientAuthentication,
    #[strum(to_string = "insufficient_encryption")]
    InsufficientEncryption,
    #[strum(to_string = "invalid_offset")]
    InvalidOffset,
    #[strum(to_string = "invalid_attribute_length")]
    InvalidAttributeLength,
    #[strum(to_string = "connection_congested")]
    ConnectionCongested,
    /// The peer or the local stack does not implement the request.
    #[strum(to_string = "request_not_supported")]
    RequestNotSupported,
}

impl Status {
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Connection-interval preference requested from the link.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, EnumIter, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPriority {
    #[default]
    #[strum(to_string = "balanced")]
    Balanced,
    #[strum(to_string = "high")]
    High,
    #[strum(to_string = "low_power")]
    LowPower,
}

/// How a characteristic write is acknowledged on the air.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteType {
    #[default]
    #[strum(to_string = "with_response")]
    WithResponse,
    #[strum(to_string = "without_response")]
    WithoutResponse,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn only_success_is_success() {
        let successes: Vec<Status> = Status::iter().filter(|status| status.is_success()).collect();
        assert_eq!(vec![Status::Success], successes);
    }

    #[rstest]
    #[case(Status::RequestNotSupported, "request_not_supported")]
    #[case(Status::InsufficientEncryption, "insufficient_encryption")]
    fn status_display_uses_snake_case(#[case] status: Status, #[case] expected: &str) {
        assert_eq!(expected, status.to_string());
    }

    #[test]
    fn connection_priority_defaults_to_balanced() {
        assert_eq!(ConnectionPriority::Balanced, ConnectionPriority::default());
    }
}
