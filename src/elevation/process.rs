use anyhow::{bail, Context};
use interprocess::local_socket::{prelude::*, Stream};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::message::MessageReader;
use super::socket_name;
use crate::status::StatusReportItem;
use crate::util;

/// How long the caller keeps trying to reach the helper's channel once the
/// launched process (if one is tracked) is no longer running.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

const CONNECT_RETRY: Duration = Duration::from_millis(50);

const FILE_A_BUG: &str = "Please file a bug report and include the Helios log file.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperState {
    /// Still running; for pkexec this includes waiting on the password prompt.
    Running,
    Exited { success: bool, detail: String },
}

/// A process started by a launcher, polled while the caller waits for its
/// report and reaped afterwards.
pub trait HelperHandle: Send {
    fn poll(&mut self) -> io::Result<HelperState>;

    fn wait(&mut self) -> io::Result<HelperState>;
}

impl HelperHandle for Child {
    fn poll(&mut self) -> io::Result<HelperState> {
        Ok(match self.try_wait()? {
            None => HelperState::Running,
            Some(status) => HelperState::Exited {
                success: status.success(),
                detail: status.to_string(),
            },
        })
    }

    fn wait(&mut self) -> io::Result<HelperState> {
        let status = Child::wait(self)?;
        Ok(HelperState::Exited {
            success: status.success(),
            detail: status.to_string(),
        })
    }
}

/// Starts a program with elevated privileges.
pub trait ElevationLauncher: Send + Sync {
    /// Returns once the program has been started, with a handle on it when
    /// one is available. Declining the elevation prompt is an `Err`, unless
    /// the launcher only learns of it later through the handle.
    fn launch(&self, executable: &Path, args: &[String]) -> io::Result<Option<Box<dyn HelperHandle>>>;
}

/// Elevates through the operating system: UAC on Windows, polkit elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ElevationLauncher for SystemLauncher {
    fn launch(&self, executable: &Path, args: &[String]) -> io::Result<Option<Box<dyn HelperHandle>>> {
        if cfg!(windows) {
            let quote = |s: &str| format!("'{}'", s.replace('\'', "''"));
            let mut script = format!(
                "Start-Process -FilePath {} -Verb RunAs -WindowStyle Hidden",
                quote(&executable.to_string_lossy())
            );
            if !args.is_empty() {
                let list: Vec<String> = args.iter().map(|a| quote(a)).collect();
                script.push_str(&format!(" -ArgumentList {}", list.join(",")));
            }
            // Start-Process returns after the UAC prompt was answered.
            let status = Command::new("powershell")
                .args(["-NoProfile", "-NonInteractive", "-Command", &script])
                .status()?;
            if status.success() {
                Ok(None)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "elevation was declined or failed",
                ))
            }
        } else {
            // pkexec runs until the helper exits, prompt included.
            let child = Command::new("pkexec").arg(executable).args(args).spawn()?;
            Ok(Some(Box::new(child)))
        }
    }
}

/// Starts the program as-is, for sessions that already have the rights.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectLauncher;

impl ElevationLauncher for DirectLauncher {
    fn launch(&self, executable: &Path, args: &[String]) -> io::Result<Option<Box<dyn HelperHandle>>> {
        let child = Command::new(executable).args(args).spawn()?;
        Ok(Some(Box::new(child)))
    }
}

/// Client side of one elevated run: launches the helper and collects its report.
pub struct ElevatedProcess {
    executable: PathBuf,
    args: Vec<String>,
    channel: String,
    launcher: Arc<dyn ElevationLauncher>,
    connect_timeout: Duration,
    helper: Mutex<Option<Box<dyn HelperHandle>>>,
}

impl ElevatedProcess {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>, launcher: Arc<dyn ElevationLauncher>) -> Self {
        Self {
            executable: executable.into(),
            args,
            channel: format!("helios-patching-{}", Uuid::new_v4().simple()),
            launcher,
            connect_timeout: CONNECT_TIMEOUT,
            helper: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn channel_name(&self) -> &str {
        &self.channel
    }

    /// Launch the helper with `-o <channel>` in front of the arguments.
    pub fn try_execute(&self) -> Result<(), StatusReportItem> {
        let shown = util::anonymize_path(&self.executable);
        if !self.executable.is_file() {
            error!("Elevated helper not found at {}", shown);
            return Err(StatusReportItem::error(format!(
                "the program needed to patch with elevated rights was not found at {}",
                shown
            ))
            .with_recommendation("Reinstall Helios or disable elevated patching for this destination."));
        }

        let mut args = vec!["-o".to_string(), self.channel.clone()];
        args.extend(self.args.iter().cloned());
        debug!("Launching elevated {} {:?}", shown, args);

        match self.launcher.launch(&self.executable, &args) {
            Ok(handle) => {
                if let Ok(mut helper) = self.helper.lock() {
                    *helper = handle;
                }
                Ok(())
            }
            Err(e) => {
                // Commonly the user declined the prompt; no backtrace needed.
                error!("Elevated helper {} could not be started: {}", shown, e);
                Err(StatusReportItem::error(format!(
                    "the elevated helper could not be started, or elevation was declined: {}",
                    e
                ))
                .with_recommendation("Accept the elevation prompt, or patch without elevation."))
            }
        }
    }

    /// Wait for the helper's report. Never fails: every problem becomes a
    /// single error item.
    pub fn read_results(&self) -> Vec<StatusReportItem> {
        let received = self.receive();
        self.reap(received.is_ok());
        match received {
            Ok(items) => items,
            Err(e) => {
                error!("No report from elevated helper on {}: {:#}", self.channel, e);
                vec![StatusReportItem::error(format!(
                    "no valid response was received from the elevated helper: {:#}",
                    e
                ))
                .with_recommendation(FILE_A_BUG)]
            }
        }
    }

    /// `try_execute` followed by `read_results`.
    pub fn run(&self) -> Vec<StatusReportItem> {
        match self.try_execute() {
            Ok(()) => self.read_results(),
            Err(item) => vec![item],
        }
    }

    fn receive(&self) -> anyhow::Result<Vec<StatusReportItem>> {
        let stream = self.connect()?;
        let mut reader = MessageReader::new(stream);
        let mut payload = Vec::new();
        reader
            .read_to_end(&mut payload)
            .context("failed to read the response message")?;
        if payload.is_empty() {
            bail!("the response was empty");
        }
        serde_json::from_slice(&payload).context("the response is not a valid status report")
    }

    /// Retry the channel until `connect_timeout` has passed without the
    /// helper process running. A helper that exits unsuccessfully ends the
    /// wait at once.
    fn connect(&self) -> anyhow::Result<Stream> {
        let mut deadline = Instant::now() + self.connect_timeout;
        loop {
            let error = match Stream::connect(socket_name(&self.channel)?) {
                Ok(stream) => return Ok(stream),
                Err(e) => e,
            };
            match self.poll_helper() {
                Some(HelperState::Running) => deadline = Instant::now() + self.connect_timeout,
                Some(HelperState::Exited { success: false, detail }) => {
                    bail!("the elevated helper exited without responding ({})", detail)
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                bail!(
                    "timed out after {} ms connecting to {}: {}",
                    self.connect_timeout.as_millis(),
                    self.channel,
                    error
                );
            }
            thread::sleep(CONNECT_RETRY);
        }
    }

    fn poll_helper(&self) -> Option<HelperState> {
        let mut helper = self.helper.lock().ok()?;
        match helper.as_mut()?.poll() {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Could not query the elevated helper: {}", e);
                None
            }
        }
    }

    /// Collect the helper's exit status. After a report it is about to exit;
    /// otherwise it is only polled, since it may be stuck.
    fn reap(&self, reported: bool) {
        let Some(mut handle) = self.helper.lock().ok().and_then(|mut helper| helper.take()) else {
            return;
        };
        let state = if reported { handle.wait() } else { handle.poll() };
        match state {
            Ok(HelperState::Exited { success, detail }) => {
                debug!("Elevated helper exited: {} (success: {})", detail, success)
            }
            Ok(HelperState::Running) => warn!("Elevated helper on {} is still running", self.channel),
            Err(e) => warn!("Could not reap the elevated helper: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elevation::{ElevatedProcessResponsePipe, SENT_TIMEOUT};
    use crate::status::{Severity, StatusFlags};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Plays the elevated helper inside the test process.
    struct InProcessHelper {
        report: Vec<StatusReportItem>,
    }

    impl ElevationLauncher for InProcessHelper {
        fn launch(&self, _executable: &Path, args: &[String]) -> io::Result<Option<Box<dyn HelperHandle>>> {
            assert_eq!(args[0], "-o");
            assert_eq!(args[2], "apply");
            let mut pipe = ElevatedProcessResponsePipe::create(&args[1])?;
            let report = self.report.clone();
            thread::spawn(move || {
                pipe.send_report(report);
                pipe.wait_for_sent(SENT_TIMEOUT);
            });
            Ok(None)
        }
    }

    struct DecliningLauncher;

    impl ElevationLauncher for DecliningLauncher {
        fn launch(&self, _executable: &Path, _args: &[String]) -> io::Result<Option<Box<dyn HelperHandle>>> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "the user declined"))
        }
    }

    struct SilentLauncher;

    impl ElevationLauncher for SilentLauncher {
        fn launch(&self, _executable: &Path, _args: &[String]) -> io::Result<Option<Box<dyn HelperHandle>>> {
            Ok(None)
        }
    }

    /// Running until `done` is set, like pkexec while its prompt is open.
    struct SlowHelper {
        done: Arc<AtomicBool>,
        exit: Option<HelperState>,
    }

    impl HelperHandle for SlowHelper {
        fn poll(&mut self) -> io::Result<HelperState> {
            if let Some(exit) = &self.exit {
                return Ok(exit.clone());
            }
            Ok(if self.done.load(Ordering::SeqCst) {
                HelperState::Exited {
                    success: true,
                    detail: "exit status: 0".into(),
                }
            } else {
                HelperState::Running
            })
        }

        fn wait(&mut self) -> io::Result<HelperState> {
            while self.poll()? == HelperState::Running {
                thread::sleep(Duration::from_millis(10));
            }
            self.poll()
        }
    }

    /// Opens the channel only after `delay`, as a helper does once the user
    /// has finished authenticating.
    struct SlowAuthLauncher {
        delay: Duration,
    }

    impl ElevationLauncher for SlowAuthLauncher {
        fn launch(&self, _executable: &Path, args: &[String]) -> io::Result<Option<Box<dyn HelperHandle>>> {
            let channel = args[1].clone();
            let done = Arc::new(AtomicBool::new(false));
            let finished = done.clone();
            let delay = self.delay;
            thread::spawn(move || {
                thread::sleep(delay);
                if let Ok(mut pipe) = ElevatedProcessResponsePipe::create(&channel) {
                    pipe.send_report(vec![StatusReportItem::info("Patched a.lua in DCS")]);
                    pipe.wait_for_sent(SENT_TIMEOUT);
                }
                finished.store(true, Ordering::SeqCst);
            });
            Ok(Some(Box::new(SlowHelper { done, exit: None })))
        }
    }

    /// pkexec exiting with 126 after the user dismissed the prompt.
    struct DismissedAuthLauncher;

    impl ElevationLauncher for DismissedAuthLauncher {
        fn launch(&self, _executable: &Path, _args: &[String]) -> io::Result<Option<Box<dyn HelperHandle>>> {
            Ok(Some(Box::new(SlowHelper {
                done: Arc::new(AtomicBool::new(false)),
                exit: Some(HelperState::Exited {
                    success: false,
                    detail: "exit status: 126".into(),
                }),
            })))
        }
    }

    fn this_exe() -> PathBuf {
        std::env::current_exe().unwrap()
    }

    #[test]
    fn test_round_trip_preserves_items() {
        let report = vec![
            StatusReportItem::info("Patched Scripts/Export.lua in DCS")
                .with_flags(StatusFlags::CONFIGURATION_UP_TO_DATE),
            StatusReportItem::error("could not write Config/View.lua")
                .with_recommendation("Check the file permissions"),
        ];
        let process = ElevatedProcess::new(
            this_exe(),
            vec!["apply".into()],
            Arc::new(InProcessHelper { report: report.clone() }),
        );
        assert_eq!(process.run(), report);
    }

    #[test]
    fn test_missing_executable() {
        let process = ElevatedProcess::new(
            "/nonexistent/helios-patcher",
            vec!["apply".into()],
            Arc::new(SilentLauncher),
        );
        let results = process.run();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].severity, Severity::Error);
        assert!(results[0].status.contains("not found"));
    }

    #[test]
    fn test_declined_elevation() {
        let process = ElevatedProcess::new(this_exe(), vec!["apply".into()], Arc::new(DecliningLauncher));
        let results = process.run();
        assert_eq!(results.len(), 1);
        assert!(results[0].status.contains("declined"));
    }

    #[test]
    fn test_connect_timeout_becomes_report() {
        let process = ElevatedProcess::new(this_exe(), vec!["apply".into()], Arc::new(SilentLauncher))
            .with_connect_timeout(Duration::from_millis(200));
        let results = process.run();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_error());
        assert!(results[0].recommendation.is_some());
    }

    #[test]
    fn test_wait_outlasts_timeout_while_helper_authenticates() {
        let process = ElevatedProcess::new(
            this_exe(),
            vec!["apply".into()],
            Arc::new(SlowAuthLauncher {
                delay: Duration::from_millis(600),
            }),
        )
        .with_connect_timeout(Duration::from_millis(200));
        assert_eq!(process.run(), vec![StatusReportItem::info("Patched a.lua in DCS")]);
    }

    #[test]
    fn test_helper_exit_without_report_ends_wait() {
        let process = ElevatedProcess::new(this_exe(), vec!["apply".into()], Arc::new(DismissedAuthLauncher));
        let started = Instant::now();
        let results = process.run();
        assert!(started.elapsed() < CONNECT_TIMEOUT);
        assert_eq!(results.len(), 1);
        assert!(results[0].status.contains("exited without responding"));
        assert!(results[0].status.contains("126"));
    }
}
