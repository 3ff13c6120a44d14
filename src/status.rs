use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered severity of a status report item. `None` is the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Severity {
    #[default]
    None,
    Info,
    Warning,
    Error,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StatusFlags: u32 {
        /// Only interesting in detailed output.
        const VERBOSE = 0b0001;
        /// The item confirms something is already configured correctly.
        const CONFIGURATION_UP_TO_DATE = 0b0010;
    }
}

impl Default for StatusFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// A single diagnostic record. Every engine operation returns a list of these
/// instead of raising errors, and the same records cross the elevation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReportItem {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub flags: StatusFlags,
}

impl StatusReportItem {
    pub fn new(severity: Severity, status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            recommendation: None,
            severity,
            flags: StatusFlags::empty(),
        }
    }

    pub fn info(status: impl Into<String>) -> Self {
        Self::new(Severity::Info, status)
    }

    pub fn warning(status: impl Into<String>) -> Self {
        Self::new(Severity::Warning, status)
    }

    pub fn error(status: impl Into<String>) -> Self {
        Self::new(Severity::Error, status)
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendation = Some(recommendation.into());
        self
    }

    pub fn with_flags(mut self, flags: StatusFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn is_up_to_date(&self) -> bool {
        self.flags.contains(StatusFlags::CONFIGURATION_UP_TO_DATE)
    }
}

impl fmt::Display for StatusReportItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::None => "     ",
            Severity::Info => "info ",
            Severity::Warning => "warn ",
            Severity::Error => "error",
        };
        write!(f, "[{}] {}", tag, self.status)?;
        if let Some(recommendation) = &self.recommendation {
            write!(f, "\n        -> {}", recommendation)?;
        }
        Ok(())
    }
}

/// Highest severity found in a report, `Severity::None` for an empty one.
pub fn worst_severity(items: &[StatusReportItem]) -> Severity {
    items
        .iter()
        .map(|item| item.severity)
        .max()
        .unwrap_or(Severity::None)
}

pub fn has_errors(items: &[StatusReportItem]) -> bool {
    items.iter().any(StatusReportItem::is_error)
}

/// Patch state of one destination, or of all destinations together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StatusCode {
    #[default]
    Unknown,
    /// None of the patched files exist in the destination.
    NotApplicable,
    /// Every present file carries its patch.
    UpToDate,
    /// No present file carries its patch yet.
    OutOfDate,
    /// Some files are patched and some are not; revert before installing again.
    ResetRequired,
    /// Patches could not be applied; a newer patch distribution is needed.
    Incompatible,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatusCode::Unknown => "unknown",
            StatusCode::NotApplicable => "not applicable",
            StatusCode::UpToDate => "up to date",
            StatusCode::OutOfDate => "out of date",
            StatusCode::ResetRequired => "reset required",
            StatusCode::Incompatible => "incompatible",
        };
        f.write_str(text)
    }
}
