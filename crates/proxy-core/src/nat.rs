use serde::{Deserialize, Serialize};

/// NAT classification, ours and the client's, as exchanged with the broker.
///
/// `Restricted` NATs make the peer-to-peer hole-punch hard; the broker uses
/// the classification to pair restricted clients with unrestricted proxies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    #[default]
    Unknown,
    Unrestricted,
    Restricted,
}

impl NatType {
    /// The wire string used in broker messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            NatType::Unknown => "unknown",
            NatType::Unrestricted => "unrestricted",
            NatType::Restricted => "restricted",
        }
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(NatType::Unknown),
            "unrestricted" => Ok(NatType::Unrestricted),
            "restricted" => Ok(NatType::Restricted),
            other => Err(format!("unrecognised NAT classification '{other}'")),
        }
    }
}
