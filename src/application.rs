use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::destination::{PatchDestination, PatchSource};
use crate::elevation::{ElevatedProcess, ElevationLauncher};
use crate::journal::WriteJournal;
use crate::patch_file::VerifyMode;
use crate::patch_list::PatchList;
use crate::status::{has_errors, StatusCode, StatusFlags, StatusReportItem};

/// How to re-run this program elevated for destinations that need it.
#[derive(Clone)]
pub struct RemoteInvocation {
    pub executable: PathBuf,
    /// Arguments placed before the command, e.g. `--config <file>`.
    pub args: Vec<String>,
    pub launcher: Arc<dyn ElevationLauncher>,
}

impl RemoteInvocation {
    fn run(&self, command: &str, key: &str) -> Vec<StatusReportItem> {
        let mut args = self.args.clone();
        args.extend([command.to_string(), "--destination".to_string(), key.to_string()]);
        ElevatedProcess::new(self.executable.clone(), args, self.launcher.clone()).run()
    }
}

/// One patch set bound to one destination, plus the user's policy for it.
pub struct PatchApplication {
    key: String,
    destination: Arc<dyn PatchDestination>,
    patches: PatchList,
    selected_version: Option<String>,
    enabled: bool,
    use_remote: bool,
    exclusions: BTreeSet<String>,
    verify_mode: VerifyMode,
    status: StatusCode,
    load_report: Vec<StatusReportItem>,
    remote: Option<RemoteInvocation>,
}

impl PatchApplication {
    /// Select patches of `patch_set` from `sources`, in order. A source that
    /// offers a strictly higher version than everything before it replaces
    /// the patches gathered so far; otherwise its patches are merged in.
    pub fn new(
        key: impl Into<String>,
        destination: Arc<dyn PatchDestination>,
        enabled: bool,
        use_remote: bool,
        patch_set: &str,
        sources: &[PatchSource],
    ) -> Self {
        let key = key.into();
        let mut patches = PatchList::default();
        let mut selected_version: Option<String> = None;
        let mut load_report = Vec::new();

        for source in sources {
            let previous = selected_version.clone();
            match destination.select_patches(source, &mut selected_version, patch_set) {
                Ok(Some(list)) => {
                    if previous.is_some() && selected_version != previous {
                        info!(
                            "Patches {} for {} supersede version {}",
                            selected_version.as_deref().unwrap_or_default(),
                            key,
                            previous.as_deref().unwrap_or_default()
                        );
                        patches = list;
                    } else {
                        patches.merge(list);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to load patches for {}: {}", key, e);
                    load_report.push(
                        StatusReportItem::error(format!("patches for {} could not be loaded: {}", key, e))
                            .with_recommendation("Reinstall Helios to restore the patch files."),
                    );
                }
            }
        }
        debug!(
            "{} patches selected for {} (version {:?})",
            patches.len(),
            key,
            selected_version
        );

        let status = if has_errors(&load_report) {
            StatusCode::Incompatible
        } else {
            StatusCode::Unknown
        };
        Self {
            key,
            destination,
            patches,
            selected_version,
            enabled,
            use_remote,
            exclusions: BTreeSet::new(),
            verify_mode: VerifyMode::default(),
            status,
            load_report,
            remote: None,
        }
    }

    pub fn with_patches(key: impl Into<String>, destination: Arc<dyn PatchDestination>, patches: PatchList) -> Self {
        Self {
            key: key.into(),
            destination,
            patches,
            selected_version: None,
            enabled: true,
            use_remote: false,
            exclusions: BTreeSet::new(),
            verify_mode: VerifyMode::default(),
            status: StatusCode::Unknown,
            load_report: Vec::new(),
            remote: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn destination(&self) -> &Arc<dyn PatchDestination> {
        &self.destination
    }

    pub fn patches(&self) -> &PatchList {
        &self.patches
    }

    pub fn selected_version(&self) -> Option<&str> {
        self.selected_version.as_deref()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Problems found while loading the patches.
    pub fn load_report(&self) -> &[StatusReportItem] {
        &self.load_report
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn use_remote(&self) -> bool {
        self.use_remote
    }

    pub fn set_use_remote(&mut self, use_remote: bool) {
        self.use_remote = use_remote;
    }

    pub fn set_remote(&mut self, remote: RemoteInvocation) {
        self.remote = Some(remote);
    }

    pub fn exclusions(&self) -> &BTreeSet<String> {
        &self.exclusions
    }

    pub fn set_exclusions(&mut self, exclusions: BTreeSet<String>) {
        self.exclusions = exclusions;
    }

    pub fn set_verify_mode(&mut self, mode: VerifyMode) {
        self.verify_mode = mode;
    }

    /// Verify the destination and derive its status from the result.
    pub fn check_applied(&mut self) -> Vec<StatusReportItem> {
        if has_errors(&self.load_report) {
            self.status = StatusCode::Incompatible;
            return self.load_report.clone();
        }
        let results = self
            .patches
            .verify(self.destination.as_ref(), &self.exclusions, self.verify_mode);
        let not_installed = results.iter().any(StatusReportItem::is_error);
        let installed = results
            .iter()
            .any(|item| item.flags.contains(StatusFlags::CONFIGURATION_UP_TO_DATE));
        self.status = match (installed, not_installed) {
            (false, false) => StatusCode::NotApplicable,
            (true, true) => StatusCode::ResetRequired,
            (true, false) => StatusCode::UpToDate,
            (false, true) => StatusCode::OutOfDate,
        };
        debug!("{} is {}", self.key, self.status);
        results
    }

    /// Dry run of `apply`. Always local: it only reads.
    pub fn simulate(&self) -> Vec<StatusReportItem> {
        if has_errors(&self.load_report) {
            return self.load_report.clone();
        }
        self.patches.simulate(self.destination.as_ref(), &self.exclusions, self.verify_mode)
    }

    pub fn simulate_revert(&self) -> Vec<StatusReportItem> {
        if has_errors(&self.load_report) {
            return self.load_report.clone();
        }
        self.patches.simulate_revert(self.destination.as_ref(), &self.exclusions, self.verify_mode)
    }

    /// Apply locally or through the elevated helper, per `use_remote`. A
    /// local pass that fails is rolled back.
    pub fn apply(&mut self) -> Vec<StatusReportItem> {
        if self.use_remote {
            return self.remote_apply();
        }
        let mut journal = WriteJournal::new(self.destination.as_ref());
        let mut results = self.patches.apply(
            self.destination.as_ref(),
            &self.exclusions,
            self.verify_mode,
            Some(&mut journal),
        );
        self.settle(&mut journal, &mut results);
        results
    }

    pub fn revert(&mut self) -> Vec<StatusReportItem> {
        if self.use_remote {
            return self.remote_revert();
        }
        let mut journal = WriteJournal::new(self.destination.as_ref());
        let mut results = self.patches.revert(
            self.destination.as_ref(),
            &self.exclusions,
            self.verify_mode,
            Some(&mut journal),
        );
        self.settle(&mut journal, &mut results);
        results
    }

    /// Apply locally, leaving commit or rollback of `journal` to the caller.
    pub fn apply_staged(&mut self, journal: &mut WriteJournal) -> Vec<StatusReportItem> {
        let results = self
            .patches
            .apply(self.destination.as_ref(), &self.exclusions, self.verify_mode, Some(journal));
        self.finish(&results);
        results
    }

    pub fn remote_apply(&mut self) -> Vec<StatusReportItem> {
        let results = self.run_remote("apply");
        self.finish(&results);
        results
    }

    pub fn remote_revert(&mut self) -> Vec<StatusReportItem> {
        let results = self.run_remote("revert");
        self.finish(&results);
        results
    }

    /// Roll back a journal left behind by an interrupted pass.
    pub fn recover(&mut self) -> Vec<StatusReportItem> {
        let Some(path) = self.destination.journal_path() else {
            return vec![StatusReportItem::info(format!(
                "{} does not keep a write journal",
                self.destination.description()
            ))];
        };
        let mut results = match WriteJournal::load(&path) {
            Ok(Some(mut journal)) => {
                info!("Recovering {} entries for {}", journal.len(), self.key);
                journal.rollback(self.destination.as_ref())
            }
            Ok(None) => vec![StatusReportItem::info(format!(
                "No interrupted patching found for {}",
                self.destination.description()
            ))],
            Err(e) => vec![StatusReportItem::error(format!("write journal for {} is unusable: {}", self.key, e))
                .with_recommendation("Use the simulator's repair tool to restore its files.")],
        };
        results.extend(self.check_applied().into_iter().filter(|item| !item.is_error()));
        results
    }

    fn run_remote(&self, command: &str) -> Vec<StatusReportItem> {
        match &self.remote {
            Some(remote) => remote.run(command, &self.key),
            None => vec![StatusReportItem::error(format!(
                "{} is set to patch with elevated rights, but no elevated helper is configured",
                self.key
            ))
            .with_recommendation("Disable elevated patching for this destination.")],
        }
    }

    fn settle(&mut self, journal: &mut WriteJournal, results: &mut Vec<StatusReportItem>) {
        if has_errors(results) {
            results.extend(journal.rollback(self.destination.as_ref()));
        } else {
            journal.commit();
        }
        self.finish(results);
    }

    fn finish(&mut self, results: &[StatusReportItem]) {
        if has_errors(results) {
            self.status = StatusCode::Incompatible;
        } else {
            self.check_applied();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::FileDestination;
    use crate::elevation::{ElevatedProcessResponsePipe, HelperHandle, SENT_TIMEOUT};
    use crate::patch_file::PatchFile;
    use crate::patch_list::tests::{append_patch, MemoryDestination};
    use crate::text_patch::{Diff, Fragment, Op};
    use std::fs;
    use std::path::Path;

    fn write_patch(root: &Path, version: &str, target: &str) {
        let path = root.join(version).join("Helios").join(format!("{}.gpatch", target));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "@@ -1,3 +1,4 @@\n abc\n+d\n").unwrap();
    }

    fn memory_app(files: &[(&str, &str)], patches: Vec<PatchFile>) -> (Arc<MemoryDestination>, PatchApplication) {
        let dest = Arc::new(MemoryDestination::with_files(files));
        let app = PatchApplication::with_patches("dcs", dest.clone(), PatchList::new(patches));
        (dest, app)
    }

    #[test]
    fn test_higher_version_supersedes_earlier_sources() {
        let dir = tempfile::tempdir().unwrap();
        let first = PatchSource {
            user: dir.path().join("u1"),
            installed: dir.path().join("i1"),
        };
        let second = PatchSource {
            user: dir.path().join("u2"),
            installed: dir.path().join("i2"),
        };
        write_patch(&first.installed, "001", "a.lua");
        write_patch(&second.installed, "002", "b.lua");

        let root = tempfile::tempdir().unwrap();
        let dest = Arc::new(FileDestination::new("dcs", root.path(), None, dir.path().join("state")));
        let app = PatchApplication::new("dcs", dest, true, false, "Helios", &[first, second]);
        assert_eq!(app.selected_version(), Some("002"));
        assert_eq!(app.patches().target_paths().collect::<Vec<_>>(), vec!["b.lua"]);
    }

    #[test]
    fn test_lower_version_later_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        let first = PatchSource {
            user: dir.path().join("u1"),
            installed: dir.path().join("i1"),
        };
        let second = PatchSource {
            user: dir.path().join("u2"),
            installed: dir.path().join("i2"),
        };
        write_patch(&first.installed, "002", "b.lua");
        write_patch(&second.installed, "001", "a.lua");

        let root = tempfile::tempdir().unwrap();
        let dest = Arc::new(FileDestination::new("dcs", root.path(), None, dir.path().join("state")));
        let app = PatchApplication::new("dcs", dest, true, false, "Helios", &[first, second]);
        assert_eq!(app.selected_version(), Some("002"));
        assert_eq!(app.patches().target_paths().collect::<Vec<_>>(), vec!["b.lua", "a.lua"]);
    }

    #[test]
    fn test_status_classification() {
        let (dest, mut app) = memory_app(
            &[("a.lua", "abc"), ("b.lua", "xyz")],
            vec![append_patch("a.lua", "abc", "d"), append_patch("b.lua", "xyz", "!")],
        );
        app.check_applied();
        assert_eq!(app.status(), StatusCode::OutOfDate);

        dest.try_write_patched("a.lua", "abcd").unwrap();
        app.check_applied();
        assert_eq!(app.status(), StatusCode::ResetRequired);

        dest.try_write_patched("b.lua", "xyz!").unwrap();
        app.check_applied();
        assert_eq!(app.status(), StatusCode::UpToDate);

        let (_, mut empty) = memory_app(&[], vec![append_patch("a.lua", "abc", "d")]);
        empty.check_applied();
        assert_eq!(empty.status(), StatusCode::NotApplicable);
    }

    #[test]
    fn test_apply_and_revert_update_status() {
        let (dest, mut app) = memory_app(&[("a.lua", "abc")], vec![append_patch("a.lua", "abc", "d")]);
        assert!(!has_errors(&app.apply()));
        assert_eq!(app.status(), StatusCode::UpToDate);
        assert_eq!(dest.read("a.lua").as_deref(), Some("abcd"));

        assert!(!has_errors(&app.revert()));
        assert_eq!(app.status(), StatusCode::OutOfDate);
        assert_eq!(dest.read("a.lua").as_deref(), Some("abc"));
    }

    #[test]
    fn test_strict_application_writes_what_it_reports_missing() {
        let fragment = Fragment::new(
            0,
            0,
            vec![
                Diff::new(Op::Equal, "a = "),
                Diff::new(Op::Delete, "1"),
                Diff::new(Op::Insert, "2"),
            ],
        );
        let (dest, mut app) = memory_app(
            &[("a.lua", "a = 1\n-- old: a = 2\n")],
            vec![PatchFile::new("a.lua", vec![fragment], None)],
        );
        app.set_verify_mode(VerifyMode::Strict);
        app.check_applied();
        assert_eq!(app.status(), StatusCode::OutOfDate);

        assert!(!has_errors(&app.apply()));
        assert_eq!(dest.read("a.lua").as_deref(), Some("a = 2\n-- old: a = 2\n"));
        assert_eq!(app.status(), StatusCode::UpToDate);
    }

    #[test]
    fn test_failed_apply_rolls_back_and_is_incompatible() {
        let (dest, mut app) = memory_app(
            &[("1.lua", "first"), ("2.lua", "nothing like the context")],
            vec![
                append_patch("1.lua", "first", "!"),
                append_patch("2.lua", "0123456789abcdef", "!"),
            ],
        );
        let results = app.apply();
        assert!(has_errors(&results));
        assert_eq!(app.status(), StatusCode::Incompatible);
        assert_eq!(dest.read("1.lua").as_deref(), Some("first"));
    }

    #[test]
    fn test_remote_without_helper_is_incompatible() {
        let (_, mut app) = memory_app(&[("a.lua", "abc")], vec![append_patch("a.lua", "abc", "d")]);
        app.set_use_remote(true);
        let results = app.apply();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_error());
        assert_eq!(app.status(), StatusCode::Incompatible);
    }

    struct EchoHelper;

    impl ElevationLauncher for EchoHelper {
        fn launch(&self, _executable: &Path, args: &[String]) -> std::io::Result<Option<Box<dyn HelperHandle>>> {
            let mut pipe = ElevatedProcessResponsePipe::create(&args[1])?;
            let message = format!("{} {}", args[args.len() - 3], args[args.len() - 1]);
            std::thread::spawn(move || {
                pipe.send_report(vec![StatusReportItem::info(message)]);
                pipe.wait_for_sent(SENT_TIMEOUT);
            });
            Ok(None)
        }
    }

    #[test]
    fn test_remote_apply_passes_command_and_key() {
        let (_, mut app) = memory_app(&[("a.lua", "abc")], vec![append_patch("a.lua", "abc", "d")]);
        app.set_use_remote(true);
        app.set_remote(RemoteInvocation {
            executable: std::env::current_exe().unwrap(),
            args: vec!["--config".into(), "patching.toml".into()],
            launcher: Arc::new(EchoHelper),
        });
        let results = app.apply();
        assert_eq!(results, vec![StatusReportItem::info("apply dcs")]);
        assert_eq!(app.status(), StatusCode::OutOfDate);
    }
}
