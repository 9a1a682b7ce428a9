use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Protocol adapters a run can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mqtt,
    Http,
    Coap,
    Amqp,
    Lora,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Mqtt,
        Protocol::Http,
        Protocol::Coap,
        Protocol::Amqp,
        Protocol::Lora,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::Http => "http",
            Protocol::Coap => "coap",
            Protocol::Amqp => "amqp",
            Protocol::Lora => "lora",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown protocol '{0}'")]
pub struct UnknownProtocol(pub String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str() == lowered)
            .ok_or_else(|| UnknownProtocol(s.to_string()))
    }
}
