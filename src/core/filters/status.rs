use std::{fmt, str::FromStr};

use http::StatusCode;
use serde::Deserialize;

/// Selects response statuses: one code, or a whole series.
///
/// Accepted forms: `502`, `"502"`, `"BAD_GATEWAY"`, `"5xx"` or `"SERVER_ERROR"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "StatusSpec")]
pub enum StatusSelector {
    Code(StatusCode),
    /// Hundreds digit of the series, 1 to 5.
    Series(u16),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StatusSpec {
    Number(u16),
    Text(String),
}

impl TryFrom<StatusSpec> for StatusSelector {
    type Error = String;

    fn try_from(spec: StatusSpec) -> Result<Self, Self::Error> {
        match spec {
            StatusSpec::Number(code) => StatusCode::from_u16(code)
                .map(StatusSelector::Code)
                .map_err(|e| format!("invalid status {code}: {e}")),
            StatusSpec::Text(text) => text.parse(),
        }
    }
}

impl FromStr for StatusSelector {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let text = raw.trim();
        if let Ok(code) = text.parse::<u16>() {
            return StatusCode::from_u16(code)
                .map(StatusSelector::Code)
                .map_err(|e| format!("invalid status {code}: {e}"));
        }
        let upper = text.to_ascii_uppercase();
        let series = match upper.as_str() {
            "INFORMATIONAL" | "1XX" => Some(1),
            "SUCCESSFUL" | "2XX" => Some(2),
            "REDIRECTION" | "3XX" => Some(3),
            "CLIENT_ERROR" | "4XX" => Some(4),
            "SERVER_ERROR" | "5XX" => Some(5),
            _ => None,
        };
        if let Some(series) = series {
            return Ok(StatusSelector::Series(series));
        }
        (100..=599)
            .filter_map(|code| StatusCode::from_u16(code).ok())
            .find(|status| {
                status
                    .canonical_reason()
                    .is_some_and(|reason| reason.to_ascii_uppercase().replace([' ', '-'], "_") == upper)
            })
            .map(StatusSelector::Code)
            .ok_or_else(|| format!("unknown status '{raw}'"))
    }
}

impl StatusSelector {
    pub fn matches(&self, status: StatusCode) -> bool {
        match self {
            StatusSelector::Code(code) => *code == status,
            StatusSelector::Series(series) => status.as_u16() / 100 == *series,
        }
    }
}

impl fmt::Display for StatusSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusSelector::Code(code) => write!(f, "{}", code.as_u16()),
            StatusSelector::Series(series) => write!(f, "{series}xx"),
        }
    }
}
