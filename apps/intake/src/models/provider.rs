use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The identity providers resumes arrive through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    /// Google service account reading a Drive folder.
    Google,
    /// Microsoft 365 group mailbox (delegated OAuth).
    Microsoft,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Google => "google",
            ProviderId::Microsoft => "microsoft",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(ProviderId::Google),
            "microsoft" => Ok(ProviderId::Microsoft),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}
