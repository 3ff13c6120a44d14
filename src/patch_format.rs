use serde::{Deserialize, Serialize};

/// Extension of a forward patch file; `Scripts/Export.lua.gpatch` patches `Scripts/Export.lua`.
pub const PATCH_EXTENSION: &str = "gpatch";
/// Extension of the sibling reverse patch.
pub const REVERT_EXTENSION: &str = "grevert";

pub const JOURNAL_MAGIC: &[u8; 8] = b"HPJRNL01";
pub const JOURNAL_FORMAT_VERSION: u32 = 1;

/// On-disk form of a write journal: zstd-compressed bincode after the magic.
#[derive(Debug, Serialize, Deserialize)]
pub struct JournalManifest {
    pub version: u32,
    pub destination: String,
    pub entries: Vec<JournalEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub target_path: String,
    /// File content before this pass touched it.
    pub original: String,
    /// BLAKE3 of the content this pass wrote.
    pub written_blake3: [u8; 32],
}
