use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StplugError;

/// Numeric id of the package being installed or fixed (a Steam app id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(u32);

impl ResourceId {
    pub fn new(value: u32) -> Result<Self, StplugError> {
        if value == 0 {
            return Err(StplugError::InvalidResourceId(value.to_string()));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Replaces every `<appid>` placeholder in `template`.
    pub fn substitute(self, template: &str) -> String {
        template.replace(APPID_PLACEHOLDER, &self.0.to_string())
    }
}

pub const APPID_PLACEHOLDER: &str = "<appid>";

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceId {
    type Err = StplugError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(StplugError::InvalidResourceId(value.to_string()));
        }
        let parsed = trimmed
            .parse::<u32>()
            .map_err(|_| StplugError::InvalidResourceId(value.to_string()))?;
        Self::new(parsed).map_err(|_| StplugError::InvalidResourceId(value.to_string()))
    }
}

/// The fix variants the probe knows about. Any other label passed by a caller
/// is carried through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixKind {
    Generic,
    OnlineUnsteam,
    Other(String),
}

impl FixKind {
    pub fn label(&self) -> &str {
        match self {
            FixKind::Generic => "Generic Fix",
            FixKind::OnlineUnsteam => "Online Fix (Unsteam)",
            FixKind::Other(label) => label,
        }
    }

    /// Whether the extracted `unsteam.ini` needs its `<appid>` token replaced.
    pub fn needs_appid_substitution(&self) -> bool {
        matches!(self, FixKind::OnlineUnsteam)
    }
}

impl fmt::Display for FixKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for FixKind {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case(FixKind::Generic.label()) {
            Ok(FixKind::Generic)
        } else if trimmed.eq_ignore_ascii_case(FixKind::OnlineUnsteam.label()) {
            Ok(FixKind::OnlineUnsteam)
        } else {
            Ok(FixKind::Other(trimmed.to_string()))
        }
    }
}
