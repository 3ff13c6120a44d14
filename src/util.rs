use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::patch_format::PATCH_EXTENSION;

const UTF8_BOM: char = '\u{feff}';

#[derive(Debug, Clone)]
pub struct PatchEntry {
    /// Target path inside a destination, forward slashes, patch extension removed.
    pub target_path: String,
    pub full_path: PathBuf,
}

/// Walk a patch set directory and collect every forward patch with the target
/// path it applies to. Entries come back in file-name order at each level so
/// application order is stable across platforms.
pub fn walk_patch_dir(root: &Path) -> Result<Vec<PatchEntry>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry =
            entry.with_context(|| format!("Failed to read directory entry in {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let full_path = entry.path().to_path_buf();
        if full_path.extension().and_then(|e| e.to_str()) != Some(PATCH_EXTENSION) {
            continue;
        }

        let relative = full_path
            .strip_prefix(root)
            .with_context(|| "Failed to compute relative path")?
            .with_extension("");
        let target_path = relative
            .to_str()
            .with_context(|| format!("Non-UTF8 path: {}", relative.display()))?
            .replace('\\', "/");

        entries.push(PatchEntry {
            target_path,
            full_path,
        });
    }

    Ok(entries)
}

/// Remove a leading UTF-8 byte order mark.
pub fn strip_bom(text: &str) -> &str {
    text.strip_prefix(UTF8_BOM).unwrap_or(text)
}

/// Compute the BLAKE3 hash of a byte slice.
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Render a path for logs and bug reports without the user's home directory
/// or account name.
pub fn anonymize_path(path: &Path) -> String {
    let mut text = path.display().to_string();
    if let Some(home) = dirs::home_dir() {
        let home = home.display().to_string();
        if !home.is_empty() {
            text = text.replace(&home, "%USERPROFILE%");
        }
    }
    let user = std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_default();
    if user.len() > 1 {
        text = text.replace(&user, "%USERNAME%");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_walk_patch_dir_targets() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = dir.path().join("Scripts");
        fs::create_dir_all(&scripts).unwrap();
        fs::write(scripts.join("Export.lua.gpatch"), "").unwrap();
        fs::write(scripts.join("Export.lua.grevert"), "").unwrap();
        fs::write(dir.path().join("Config.lua.gpatch"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let entries = walk_patch_dir(dir.path()).unwrap();
        let targets: Vec<_> = entries.iter().map(|e| e.target_path.as_str()).collect();
        assert_eq!(targets, vec!["Config.lua", "Scripts/Export.lua"]);
    }

    #[test]
    fn test_strip_bom() {
        assert_eq!(strip_bom("\u{feff}abc"), "abc");
        assert_eq!(strip_bom("abc"), "abc");
    }

    #[test]
    fn test_anonymize_home() {
        if let Some(home) = dirs::home_dir() {
            let path = home.join("Saved Games").join("DCS");
            let text = anonymize_path(&path);
            assert!(text.starts_with("%USERPROFILE%"));
        }
    }
}
