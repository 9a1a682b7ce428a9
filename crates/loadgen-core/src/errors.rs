use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of failure categories used for classification and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ConnectionTimeout,
    AuthenticationFailed,
    RateLimited,
    ServerError,
    NetworkError,
    Unknown,
}

/// Ordered phrases checked against the lowercased reason. First hit wins.
/// Bare status digits are not listed: reasons often carry URLs whose port
/// numbers would match. Codes are read from a "status NNN" form instead.
const PATTERNS: &[(ErrorType, &[&str])] = &[
    (
        ErrorType::ConnectionTimeout,
        &["timeout", "timed out", "deadline"],
    ),
    (
        ErrorType::NetworkError,
        &[
            "connection refused",
            "connection reset",
            "connection closed",
            "refused",
            "unreachable",
            "network",
            "broken pipe",
            "dns",
            "i/o",
            "io error",
            "socket",
        ],
    ),
    (
        ErrorType::AuthenticationFailed,
        &[
            "authentication",
            "unauthorized",
            "forbidden",
            "credential",
            "not authorized",
            "bad password",
        ],
    ),
    (
        ErrorType::RateLimited,
        &["rate limit", "rate_limit", "too many requests", "throttl"],
    ),
    (
        ErrorType::ServerError,
        &[
            "server error",
            "internal error",
            "service unavailable",
            "bad gateway",
        ],
    ),
];

/// Three-digit code following "status" (e.g. "status 503", "status: 401").
fn status_code(reason: &str) -> Option<u16> {
    reason.match_indices("status").find_map(|(at, word)| {
        let rest = reason[at + word.len()..].trim_start_matches([' ', ':', '=']);
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 3 {
            rest[..3].parse().ok()
        } else {
            None
        }
    })
}

impl ErrorType {
    pub const ALL: [ErrorType; 6] = [
        ErrorType::ConnectionTimeout,
        ErrorType::AuthenticationFailed,
        ErrorType::RateLimited,
        ErrorType::ServerError,
        ErrorType::NetworkError,
        ErrorType::Unknown,
    ];

    /// Classify a free-form failure description. Anything unmatched is
    /// `Unknown`.
    pub fn classify(reason: &str) -> Self {
        let reason = reason.to_ascii_lowercase();
        PATTERNS
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| reason.contains(n)))
            .map(|(kind, _)| *kind)
            .or_else(|| status_code(&reason).map(Self::from_status))
            .unwrap_or(ErrorType::Unknown)
    }

    /// Category of a non-success response status.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorType::AuthenticationFailed,
            429 => ErrorType::RateLimited,
            500..=599 => ErrorType::ServerError,
            _ => ErrorType::Unknown,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            ErrorType::ConnectionTimeout => 0,
            ErrorType::AuthenticationFailed => 1,
            ErrorType::RateLimited => 2,
            ErrorType::ServerError => 3,
            ErrorType::NetworkError => 4,
            ErrorType::Unknown => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::ConnectionTimeout => "connection_timeout",
            ErrorType::AuthenticationFailed => "authentication_failed",
            ErrorType::RateLimited => "rate_limited",
            ErrorType::ServerError => "server_error",
            ErrorType::NetworkError => "network_error",
            ErrorType::Unknown => "unknown",
        }
    }

    /// "connection_timeout" -> "Connection Timeout"
    pub fn title(&self) -> String {
        self.as_str()
            .split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
