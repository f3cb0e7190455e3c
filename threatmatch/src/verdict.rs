//! Lookup outcomes

use std::fmt;
use threatmatch_api::ThreatType;

/// Result of checking one URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// No list contains the URL
    Safe,
    /// The URL is on a list; the most severe threat type is reported
    Dangerous(ThreatType),
    /// A local match could not be confirmed because lookups are backing off
    Unknown,
}

impl Verdict {
    pub fn is_dangerous(&self) -> bool {
        matches!(self, Verdict::Dangerous(_))
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Verdict::Safe)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Safe => f.write_str("safe"),
            Verdict::Dangerous(threat_type) => write!(f, "dangerous ({threat_type})"),
            Verdict::Unknown => f.write_str("unknown"),
        }
    }
}

fn severity(threat_type: ThreatType) -> u8 {
    match threat_type {
        ThreatType::Malware => 4,
        ThreatType::SocialEngineering => 3,
        ThreatType::UnwantedSoftware => 2,
        ThreatType::PotentiallyHarmfulApplication => 1,
        ThreatType::Unspecified => 0,
    }
}

/// Pick the most severe of the confirmed threats.
///
/// An empty slice is [`Verdict::Safe`].
pub fn classify(threats: &[ThreatType]) -> Verdict {
    threats
        .iter()
        .copied()
        .max_by_key(|&threat_type| severity(threat_type))
        .map_or(Verdict::Safe, Verdict::Dangerous)
}
