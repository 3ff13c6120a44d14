use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::destination::PatchDestination;
use crate::error::{PatchError, Result};
use crate::patch_format::{JournalEntry, JournalManifest, JOURNAL_FORMAT_VERSION, JOURNAL_MAGIC};
use crate::status::{StatusFlags, StatusReportItem};
use crate::util;

/// Original contents of every file written during a pass, so the pass can be
/// undone. Persisted before each write when the destination provides a path.
#[derive(Debug)]
pub struct WriteJournal {
    destination: String,
    path: Option<PathBuf>,
    entries: Vec<JournalEntry>,
}

impl WriteJournal {
    pub fn new(destination: &dyn PatchDestination) -> Self {
        Self {
            destination: destination.description().to_string(),
            path: destination.journal_path(),
            entries: Vec::new(),
        }
    }

    /// Read a journal left behind by an interrupted pass.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PatchError::io(path, e)),
        };
        let invalid = |message: String| PatchError::Journal {
            path: path.to_path_buf(),
            message,
        };

        if raw.len() < JOURNAL_MAGIC.len() || &raw[..JOURNAL_MAGIC.len()] != JOURNAL_MAGIC {
            return Err(invalid("missing magic header".into()));
        }
        let decoder = zstd::Decoder::new(&raw[JOURNAL_MAGIC.len()..])
            .map_err(|e| invalid(format!("failed to create zstd decoder: {}", e)))?;
        let manifest: JournalManifest =
            bincode::deserialize_from(decoder).map_err(|e| invalid(format!("failed to decode: {}", e)))?;
        if manifest.version != JOURNAL_FORMAT_VERSION {
            return Err(invalid(format!(
                "unsupported version {} (expected {})",
                manifest.version, JOURNAL_FORMAT_VERSION
            )));
        }

        Ok(Some(Self {
            destination: manifest.destination,
            path: Some(path.to_path_buf()),
            entries: manifest.entries,
        }))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remember `original` for `target_path` before `written` replaces it.
    /// The first original recorded for a target wins.
    pub fn record(&mut self, target_path: &str, original: &str, written: &str) -> Result<()> {
        let written_blake3 = util::hash_bytes(written.as_bytes());
        match self.entries.iter_mut().find(|e| e.target_path == target_path) {
            Some(entry) => entry.written_blake3 = written_blake3,
            None => self.entries.push(JournalEntry {
                target_path: target_path.to_string(),
                original: original.to_string(),
                written_blake3,
            }),
        }
        self.persist()
    }

    /// Undo `record` for a write that did not happen; `current` is what the
    /// target still holds.
    pub fn forget(&mut self, target_path: &str, current: &str) -> Result<()> {
        let Some(index) = self.entries.iter().position(|e| e.target_path == target_path) else {
            return Ok(());
        };
        if self.entries[index].original == current {
            self.entries.remove(index);
        } else {
            self.entries[index].written_blake3 = util::hash_bytes(current.as_bytes());
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let invalid = |message: String| PatchError::Journal {
            path: path.clone(),
            message,
        };
        let manifest = JournalManifest {
            version: JOURNAL_FORMAT_VERSION,
            destination: self.destination.clone(),
            entries: self.entries.clone(),
        };
        let encoded = bincode::serialize(&manifest).map_err(|e| invalid(format!("failed to encode: {}", e)))?;
        let compressed =
            zstd::bulk::compress(&encoded, 3).map_err(|e| invalid(format!("failed to compress: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PatchError::io(parent, e))?;
        }
        let mut file = std::fs::File::create(path).map_err(|e| PatchError::io(path, e))?;
        file.write_all(JOURNAL_MAGIC)
            .and_then(|_| file.write_all(&compressed))
            .and_then(|_| file.flush())
            .map_err(|e| PatchError::io(path, e))
    }

    /// The pass succeeded: forget the originals.
    pub fn commit(&mut self) {
        self.entries.clear();
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove write journal {}: {}", path.display(), e),
            }
        }
    }

    /// Put back every original this journal recorded, newest first. A file is
    /// only restored while it still holds exactly what this pass wrote.
    pub fn rollback(&mut self, destination: &dyn PatchDestination) -> Vec<StatusReportItem> {
        let mut results = Vec::new();
        if self.entries.is_empty() {
            self.commit();
            return results;
        }
        if let Err(e) = destination.try_lock() {
            results.push(
                StatusReportItem::error(format!(
                    "could not lock {} to roll back {} files: {}",
                    destination.description(),
                    self.entries.len(),
                    e
                ))
                .with_recommendation("Close programs using the destination and run 'helios-patcher recover'."),
            );
            return results;
        }

        let mut complete = true;
        for entry in self.entries.iter().rev() {
            let current = match destination.try_get_source(&entry.target_path) {
                Ok(current) => current,
                Err(e) => {
                    complete = false;
                    results.push(StatusReportItem::error(format!(
                        "could not read {} for rollback: {}",
                        entry.target_path, e
                    )));
                    continue;
                }
            };
            if current.as_deref() == Some(entry.original.as_str()) {
                debug!("{} already holds its original content", entry.target_path);
                continue;
            }
            let unchanged = current
                .as_deref()
                .is_some_and(|text| util::hash_bytes(text.as_bytes()) == entry.written_blake3);
            if !unchanged {
                warn!("{} changed after it was patched; not rolled back", entry.target_path);
                results.push(
                    StatusReportItem::warning(format!(
                        "{} was modified by another program after patching and was not rolled back",
                        entry.target_path
                    ))
                    .with_recommendation("Use the simulator's repair tool to restore this file."),
                );
                continue;
            }
            match destination.try_write_patched(&entry.target_path, &entry.original) {
                Ok(()) => {
                    info!("Rolled back {} in {}", entry.target_path, destination.description());
                    results.push(
                        StatusReportItem::info(format!(
                            "Restored {} in {}",
                            entry.target_path,
                            destination.description()
                        ))
                        .with_flags(StatusFlags::VERBOSE),
                    );
                }
                Err(e) => {
                    complete = false;
                    results.push(
                        StatusReportItem::error(format!("could not restore {}: {}", entry.target_path, e))
                            .with_recommendation("Use the simulator's repair tool to restore this file."),
                    );
                }
            }
        }

        if let Err(e) = destination.try_unlock() {
            warn!("Failed to unlock {}: {}", destination.description(), e);
        }
        if complete {
            self.commit();
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::FileDestination;
    use crate::patch_list::tests::MemoryDestination;
    use crate::status::has_errors;

    #[test]
    fn test_rollback_restores_originals() {
        let dest = MemoryDestination::with_files(&[("a.lua", "abc"), ("b.lua", "xyz")]);
        let mut journal = WriteJournal::new(&dest);
        journal.record("a.lua", "abc", "abcd").unwrap();
        dest.try_write_patched("a.lua", "abcd").unwrap();
        journal.record("b.lua", "xyz", "xyz!").unwrap();
        dest.try_write_patched("b.lua", "xyz!").unwrap();

        let results = journal.rollback(&dest);
        assert!(!has_errors(&results));
        assert_eq!(dest.read("a.lua").as_deref(), Some("abc"));
        assert_eq!(dest.read("b.lua").as_deref(), Some("xyz"));
        assert!(journal.is_empty());
    }

    #[test]
    fn test_rollback_skips_externally_modified_file() {
        let dest = MemoryDestination::with_files(&[("a.lua", "abc")]);
        let mut journal = WriteJournal::new(&dest);
        journal.record("a.lua", "abc", "abcd").unwrap();
        dest.try_write_patched("a.lua", "someone else").unwrap();

        let results = journal.rollback(&dest);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].severity, crate::status::Severity::Warning);
        assert_eq!(dest.read("a.lua").as_deref(), Some("someone else"));
    }

    #[test]
    fn test_persisted_journal_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let dest = FileDestination::new("files", dir.path(), None, state.path());
        dest.try_write_patched("a.lua", "abcd").unwrap();
        let mut journal = WriteJournal::new(&dest);
        journal.record("a.lua", "abc", "abcd").unwrap();

        let path = dest.journal_path().unwrap();
        assert!(path.starts_with(state.path()));
        let mut recovered = WriteJournal::load(&path).unwrap().unwrap();
        assert_eq!(recovered.len(), 1);
        let results = recovered.rollback(&dest);
        assert!(!has_errors(&results));
        assert_eq!(dest.try_get_source("a.lua").unwrap().as_deref(), Some("abc"));
        assert!(WriteJournal::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.journal");
        std::fs::write(&path, b"not a journal").unwrap();
        assert!(matches!(WriteJournal::load(&path), Err(PatchError::Journal { .. })));
    }

    #[test]
    fn test_forget_drops_entry_for_failed_write() {
        let dest = MemoryDestination::with_files(&[("a.lua", "abc")]);
        let mut journal = WriteJournal::new(&dest);
        journal.record("a.lua", "abc", "abcd").unwrap();
        journal.forget("a.lua", "abc").unwrap();
        assert!(journal.is_empty());
        assert!(journal.rollback(&dest).is_empty());
    }

    #[test]
    fn test_forget_keeps_earlier_write() {
        let dest = MemoryDestination::with_files(&[("a.lua", "abc")]);
        let mut journal = WriteJournal::new(&dest);
        journal.record("a.lua", "abc", "abcd").unwrap();
        dest.try_write_patched("a.lua", "abcd").unwrap();
        journal.record("a.lua", "abc", "abcde").unwrap();
        journal.forget("a.lua", "abcd").unwrap();

        let results = journal.rollback(&dest);
        assert!(!has_errors(&results));
        assert_eq!(dest.read("a.lua").as_deref(), Some("abc"));
    }

    #[test]
    fn test_rollback_of_unwritten_original_is_silent() {
        let dest = MemoryDestination::with_files(&[("a.lua", "abc")]);
        let mut journal = WriteJournal::new(&dest);
        journal.record("a.lua", "abc", "abcd").unwrap();
        assert!(journal.rollback(&dest).is_empty());
        assert!(journal.is_empty());
    }
}
