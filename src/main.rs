use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use helios_patching::application::PatchApplication;
use helios_patching::create;
use helios_patching::elevation::{ElevatedProcessResponsePipe, SystemLauncher, SENT_TIMEOUT};
use helios_patching::status::has_errors;
use helios_patching::{
    InstallationCallbacks, InstallationPromptResult, InstallationResult, PatchInstallation, PatchingConfiguration,
    RemoteInvocation, StatusFlags, StatusReportItem, TomlSettings,
};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "helios-patcher", about = "Installs and removes Helios patches in simulator installations")]
struct Cli {
    /// Send the status report over this channel instead of printing it
    #[arg(short = 'o', long = "response-pipe", global = true)]
    response_pipe: Option<String>,
    /// Patching configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Settings file holding exclusions and per-destination overrides
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch and its reverse by comparing two versions of a file
    Create {
        /// The original file
        #[arg(long)]
        old: PathBuf,
        /// The modified file
        #[arg(long)]
        new: PathBuf,
        /// Path of the patched file inside a destination, e.g. Scripts/Export.lua
        #[arg(long)]
        target: String,
        /// Patch set directory to write into
        #[arg(long)]
        output: PathBuf,
    },
    /// Show the patch status of every destination
    Status,
    /// Install patches in every enabled destination
    Install {
        /// Accept imprecise patches without asking
        #[arg(long)]
        yes: bool,
    },
    /// Remove patches from every enabled destination
    Uninstall,
    /// Apply patches to one destination
    Apply {
        #[arg(long)]
        destination: String,
    },
    /// Revert patches in one destination
    Revert {
        #[arg(long)]
        destination: String,
    },
    /// Roll back an interrupted patching run
    Recover {
        #[arg(long)]
        destination: String,
    },
    /// Stop patching a target path in all destinations
    Exclude { path: String },
    /// Patch a previously excluded target path again
    Include { path: String },
}

struct Paths {
    config: PathBuf,
    settings: PathBuf,
}

impl Paths {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone().unwrap_or_else(PatchingConfiguration::default_path),
            settings: cli.settings.clone().unwrap_or_else(TomlSettings::default_path),
        }
    }

    fn open(&self) -> Result<(PatchingConfiguration, PatchInstallation)> {
        let config = PatchingConfiguration::load(&self.config)?;
        let settings = Arc::new(TomlSettings::open(&self.settings)?);
        let remote = RemoteInvocation {
            executable: std::env::current_exe().context("Failed to locate this program")?,
            args: vec![
                "--config".to_string(),
                self.config.display().to_string(),
                "--settings".to_string(),
                self.settings.display().to_string(),
            ],
            launcher: Arc::new(SystemLauncher),
        };
        let installation = config.build_installation(settings, Some(remote));
        Ok((config, installation))
    }
}

struct CliCallbacks {
    yes: bool,
}

impl InstallationCallbacks for CliCallbacks {
    fn failure(&mut self, title: &str, message: &str, details: &[StatusReportItem]) {
        print_report(details);
        println!("\n{}", title);
        println!("  {}", message);
    }

    fn danger_prompt(&mut self, title: &str, message: &str, details: &[StatusReportItem]) -> InstallationPromptResult {
        print_report(details);
        println!("\n{}", title);
        println!("  {}", message);
        if self.yes {
            return InstallationPromptResult::Ok;
        }
        print!("Proceed? [y/N] ");
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) if answer.trim().eq_ignore_ascii_case("y") => InstallationPromptResult::Ok,
            _ => InstallationPromptResult::Cancel,
        }
    }

    fn success(&mut self, title: &str, message: &str, details: &[StatusReportItem]) {
        print_report(details);
        println!("\n{}", title);
        println!("  {}", message);
    }
}

fn print_report(items: &[StatusReportItem]) {
    for item in items.iter().filter(|i| !i.flags.contains(StatusFlags::VERBOSE)) {
        println!("{}", item);
    }
}

fn application<'a>(installation: &'a mut PatchInstallation, key: &str) -> Result<&'a mut PatchApplication> {
    match installation.application_mut(key) {
        Some(application) => Ok(application),
        None => bail!("No destination named '{}' in the configuration", key),
    }
}

/// Run one destination command in this process and return its report.
fn run_local(paths: &Paths, command: &Commands) -> Result<Vec<StatusReportItem>> {
    let (_, mut installation) = paths.open()?;
    let report = match command {
        Commands::Apply { destination } => {
            let application = application(&mut installation, destination)?;
            application.set_use_remote(false);
            application.apply()
        }
        Commands::Revert { destination } => {
            let application = application(&mut installation, destination)?;
            application.set_use_remote(false);
            application.revert()
        }
        Commands::Recover { destination } => application(&mut installation, destination)?.recover(),
        _ => bail!("This command cannot run with a response pipe"),
    };
    Ok(report)
}

/// Elevated helper mode: report over the caller's channel.
fn serve_elevated(channel: &str, paths: &Paths, command: &Commands) -> Result<bool> {
    let mut pipe = ElevatedProcessResponsePipe::create(channel)
        .with_context(|| format!("Failed to create response pipe {}", channel))?;
    let report = match run_local(paths, command) {
        Ok(report) => report,
        Err(e) => vec![StatusReportItem::error(format!("elevated helper failed: {:#}", e))],
    };
    let ok = !has_errors(&report);
    pipe.send_report(report);
    if !pipe.wait_for_sent(SENT_TIMEOUT) {
        bail!("The status report was not delivered over {}", channel);
    }
    Ok(ok)
}

fn run(cli: Cli) -> Result<bool> {
    let paths = Paths::from_cli(&cli);
    if let Some(channel) = &cli.response_pipe {
        return serve_elevated(channel, &paths, &cli.command);
    }

    match &cli.command {
        Commands::Create {
            old,
            new,
            target,
            output,
        } => {
            println!("Creating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Target: {}", target);

            let start = Instant::now();
            let summary = create::create_patch(old, new, target, output)?;
            let elapsed = start.elapsed();

            println!("\nPatch created successfully!");
            println!("  Patch: {}", summary.patch_path.display());
            println!("  Reverse patch: {}", summary.revert_path.display());
            println!("  Fragments: {} ({} reverse)", summary.fragments, summary.reverse_fragments);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
            Ok(true)
        }
        Commands::Status => {
            let (config, installation) = paths.open()?;
            println!("Patch set: {}", config.patch_set);
            for application in installation.applications() {
                println!(
                    "  {}: {}{}{} (patches {})",
                    application.key(),
                    application.status(),
                    if application.is_enabled() { "" } else { ", disabled" },
                    if application.use_remote() { ", elevated" } else { "" },
                    application.selected_version().unwrap_or("none")
                );
                print_report(application.load_report());
            }
            if !installation.patched_paths().is_empty() {
                println!("\nPatched files:");
                for path in installation.patched_paths() {
                    println!("  {}{}", path.path, if path.excluded { " (excluded)" } else { "" });
                }
            }
            println!("\nOverall: {}", installation.status());
            Ok(true)
        }
        Commands::Install { yes } => {
            let (_, mut installation) = paths.open()?;
            let start = Instant::now();
            let result = installation.install(&mut CliCallbacks { yes: *yes });
            println!("  Status: {}", installation.status());
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
            Ok(result == InstallationResult::Success)
        }
        Commands::Uninstall => {
            let (_, mut installation) = paths.open()?;
            let start = Instant::now();
            let result = installation.uninstall(&mut CliCallbacks { yes: false });
            println!("  Status: {}", installation.status());
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
            Ok(result == InstallationResult::Success)
        }
        Commands::Apply { destination } | Commands::Revert { destination } => {
            let (_, mut installation) = paths.open()?;
            let application = application(&mut installation, destination)?;
            let report = if matches!(cli.command, Commands::Apply { .. }) {
                application.apply()
            } else {
                application.revert()
            };
            print_report(&report);
            println!("  {}: {}", application.key(), application.status());
            Ok(!has_errors(&report))
        }
        Commands::Recover { .. } => {
            let report = run_local(&paths, &cli.command)?;
            print_report(&report);
            Ok(!has_errors(&report))
        }
        Commands::Exclude { path } | Commands::Include { path } => {
            let excluded = matches!(cli.command, Commands::Exclude { .. });
            let (_, mut installation) = paths.open()?;
            installation.set_excluded(path, excluded)?;
            println!(
                "{} {}; overall status: {}",
                if excluded { "Excluded" } else { "Included" },
                path,
                installation.status()
            );
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let succeeded = tokio::task::spawn_blocking(move || run(cli))
        .await
        .context("Patching task failed")??;
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
