use std::fmt;

use serde::Serialize;

use crate::pipeline::SampleMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    High,
    Medium,
    Low,
    Unknown,
}

impl ThreatLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreatLevel::High => "high",
            ThreatLevel::Medium => "medium",
            ThreatLevel::Low => "low",
            ThreatLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub threat_level: ThreatLevel,
    pub malware_family: String,
    pub summary: String,
}

/// Derive the verdict from what the earlier stages found.
///
/// `ok` and `total` count stages that ran, including the caller.
pub fn assess(meta: &SampleMetadata, ok: usize, total: usize, elapsed_secs: f64) -> Assessment {
    let (threat_level, family) = if meta.component_info.is_some() && !meta.urls.is_empty() {
        (ThreatLevel::High, "Grandoreiro")
    } else if !meta.urls.is_empty() {
        (ThreatLevel::Medium, "Suspicious")
    } else {
        (ThreatLevel::Low, "Unknown")
    };

    let mut summary = format!(
        "Analysis completed in {elapsed_secs:.1}s | {ok}/{total} stages successful | Threat level: {threat_level} | Malware family: {family}"
    );
    if let Some(cnc) = &meta.cnc_url {
        summary.push_str(&format!(" | C&C server identified: {cnc}"));
    }

    Assessment {
        threat_level,
        malware_family: family.to_string(),
        summary,
    }
}
