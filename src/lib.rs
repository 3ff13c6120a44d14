//! Applying, verifying and removing text patches in simulator installations.
//!
//! A [`PatchInstallation`] coordinates one [`PatchApplication`] per
//! destination. Each application owns the [`PatchList`] selected for its
//! destination and reports everything it does as [`StatusReportItem`]s.

pub mod application;
pub mod config;
pub mod create;
pub mod destination;
pub mod elevation;
pub mod error;
pub mod installation;
pub mod journal;
pub mod patch_file;
pub mod patch_format;
pub mod patch_list;
pub mod status;
pub mod text_patch;
pub mod util;

pub use application::{PatchApplication, RemoteInvocation};
pub use config::{MemorySettings, PatchingConfiguration, SettingsStore, TomlSettings};
pub use destination::{FileDestination, PatchDestination, PatchSource};
pub use error::{PatchError, Result};
pub use installation::{
    InstallationCallbacks, InstallationPromptResult, InstallationResult, PatchInstallation, PatchedPath, PathChange,
};
pub use journal::WriteJournal;
pub use patch_file::{PatchFile, PatchResult, VerifyMode};
pub use patch_list::PatchList;
pub use status::{Severity, StatusCode, StatusFlags, StatusReportItem};
