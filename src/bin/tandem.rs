//! # Tandem CLI - per-file version control
//!
//! A command-line interface for Tandem projects.
//!
//! ## Features
//! - Put files under version control and check them in and out
//! - Merge newer repository versions into a checkout
//! - Rename, move, copy, delete and export files
//! - Inspect file states and version history
//!
//! ## Usage
//! ```bash
//! # Create a project with its own repository
//! tandem init --name demo
//!
//! # Import a file and add it to the repository
//! tandem add notes.txt -m "First draft"
//!
//! # Edit it
//! tandem checkout /notes.txt
//! tandem write /notes.txt edited.txt
//! tandem checkin /notes.txt -m "Second draft"
//!
//! # Show states and history
//! tandem status
//! tandem history /notes.txt
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem::utils::format_bytes;
use tandem::{
    CheckinOptions, CheckinOutcome, FileState, ItemKind, MergeOutcome, Project, ProjectConfig,
    RepositoryOptions, TaskMonitor, OPAQUE_CONTENT_TYPE, TEXT_CONTENT_TYPE,
};

/// Tandem CLI - version control for individual files
#[derive(Parser)]
#[command(name = "tandem")]
#[command(version)]
#[command(about = "Check files in and out of a shared repository")]
#[command(long_about = None)]
struct Cli {
    /// Path to the project folder (defaults to current)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a project
    Init {
        /// Project name (defaults to the folder name)
        #[arg(long)]
        name: Option<String>,

        /// Repository folder (defaults to <path>/repository)
        #[arg(long)]
        repository: Option<PathBuf>,

        /// Acting user
        #[arg(long)]
        user: Option<String>,

        /// Make every checkout exclusive
        #[arg(long)]
        exclusive: bool,
    },

    /// Import a file and add it to the repository
    Add {
        /// File to import
        source: PathBuf,

        /// Destination folder in the project
        #[arg(long, default_value = "/")]
        dest: String,

        /// Content type (detected from the content by default)
        #[arg(long, value_enum)]
        content_type: Option<ContentMode>,

        /// Checkin comment
        #[arg(short, long)]
        message: Option<String>,

        /// Keep the file checked out
        #[arg(short, long)]
        keep: bool,

        /// Only import as a private file
        #[arg(long)]
        private: bool,
    },

    /// Show file states
    #[command(alias = "st")]
    Status {
        /// Only show this file
        file: Option<String>,
    },

    /// Check a file out
    #[command(alias = "co")]
    Checkout {
        /// File path in the project
        file: String,

        /// Request an exclusive checkout
        #[arg(short, long)]
        exclusive: bool,
    },

    /// Replace the content of a checked-out or private file
    Write {
        /// File path in the project
        file: String,

        /// File holding the new content
        source: PathBuf,
    },

    /// Check local changes in
    #[command(alias = "ci")]
    Checkin {
        /// File path in the project
        file: String,

        /// Checkin comment
        #[arg(short, long)]
        message: Option<String>,

        /// Keep the file checked out
        #[arg(short, long)]
        keep: bool,

        /// Save the local content as a keep file
        #[arg(long)]
        keep_file: bool,
    },

    /// Release a checkout
    UndoCheckout {
        /// File path in the project
        file: String,

        /// Keep the local copy as a private keep file
        #[arg(short, long)]
        keep: bool,

        /// Release locally even if the repository is unreachable
        #[arg(long)]
        force: bool,
    },

    /// Merge newer repository versions into a checkout
    Update {
        /// File path in the project
        file: String,
    },

    /// Show version history
    #[command(alias = "log")]
    History {
        /// File path in the project
        file: String,
    },

    /// Rename a file
    Rename {
        /// File path in the project
        file: String,

        /// New name
        name: String,
    },

    /// Move a file to another folder
    Mv {
        /// File path in the project
        file: String,

        /// Destination folder
        folder: String,
    },

    /// Copy a file into a folder as a new private file
    Cp {
        /// File path in the project
        file: String,

        /// Destination folder
        folder: String,

        /// Copy this repository version
        #[arg(long)]
        version: Option<u32>,
    },

    /// Delete a file
    Rm {
        /// File path in the project
        file: String,
    },

    /// Write the content of a file to the filesystem
    Export {
        /// File path in the project
        file: String,

        /// Destination on the filesystem
        dest: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ContentMode {
    Text,
    Binary,
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let root = cli.path.unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Commands::Init { name, repository, user, exclusive } => cmd_init(root, name, repository, user, exclusive),
        Commands::Add { source, dest, content_type, message, keep, private } => {
            cmd_add(&open_project(&root)?, &source, &dest, content_type, message, keep, private)
        }
        Commands::Status { file } => cmd_status(&open_project(&root)?, file),
        Commands::Checkout { file, exclusive } => cmd_checkout(&open_project(&root)?, &file, exclusive),
        Commands::Write { file, source } => cmd_write(&open_project(&root)?, &file, &source),
        Commands::Checkin { file, message, keep, keep_file } => {
            cmd_checkin(&open_project(&root)?, &file, message, keep, keep_file)
        }
        Commands::UndoCheckout { file, keep, force } => {
            let project = open_project(&root)?;
            project.file(&file)?.undo_checkout(keep, force, false)?;
            println!("{} Released checkout of {}", "✓".green().bold(), file.cyan());
            if keep {
                println!("  Local copy kept next to the file");
            }
            Ok(())
        }
        Commands::Update { file } => cmd_update(&open_project(&root)?, &file),
        Commands::History { file } => cmd_history(&open_project(&root)?, &file),
        Commands::Rename { file, name } => {
            let project = open_project(&root)?;
            let target = project.file(&file)?;
            target.rename(&name)?;
            println!("{} Renamed {} to {}", "✓".green().bold(), file.cyan(), target.path().cyan());
            Ok(())
        }
        Commands::Mv { file, folder } => {
            let project = open_project(&root)?;
            let target = project.file(&file)?;
            target.move_to(&folder)?;
            println!("{} Moved {} to {}", "✓".green().bold(), file.cyan(), target.path().cyan());
            Ok(())
        }
        Commands::Cp { file, folder, version } => {
            let project = open_project(&root)?;
            let source = project.file(&file)?;
            let copy = match version {
                Some(v) => source.copy_version_to(v, &folder, &TaskMonitor::none())?,
                None => source.copy_to(&folder, &TaskMonitor::none())?,
            };
            println!("{} Copied {} to {}", "✓".green().bold(), file.cyan(), copy.cyan());
            Ok(())
        }
        Commands::Rm { file } => {
            let project = open_project(&root)?;
            project.file(&file)?.delete()?;
            println!("{} Deleted {}", "✓".green().bold(), file.cyan());
            Ok(())
        }
        Commands::Export { file, dest } => {
            let project = open_project(&root)?;
            let written = project.file(&file)?.export(&dest)?;
            println!(
                "{} Exported {} ({}) to {}",
                "✓".green().bold(),
                file.cyan(),
                format_bytes(written),
                dest.display().to_string().cyan()
            );
            Ok(())
        }
    }
}

/// Create a project folder and its repository
fn cmd_init(
    root: PathBuf,
    name: Option<String>,
    repository: Option<PathBuf>,
    user: Option<String>,
    exclusive: bool,
) -> anyhow::Result<()> {
    println!("{}", "Initializing Tandem project...".blue().bold());

    let name = match name {
        Some(name) => name,
        None => std::fs::canonicalize(&root)
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "project".to_string()),
    };
    let mut config = ProjectConfig::new(name);
    if let Some(user) = user {
        config.user = user;
    }
    let repository = repository.unwrap_or_else(|| root.join("repository"));
    let options = RepositoryOptions {
        shared: !exclusive,
        ..RepositoryOptions::default()
    };

    let project = Project::init(root.clone(), repository.clone(), config, options)
        .with_context(|| format!("cannot initialize project at {}", root.display()))?;

    println!("{} Initialized project {}", "✓".green().bold(), project.config().name.yellow().bold());
    println!("  Root: {}", root.display().to_string().cyan());
    println!("  Repository: {}", repository.display().to_string().cyan());
    println!("  User: {}", project.config().user.cyan());
    println!("\nNext steps:");
    println!("  - Add a file: {}", "tandem add <file> -m \"First version\"".yellow());
    println!("  - Show states: {}", "tandem status".yellow());
    Ok(())
}

/// Import a filesystem file into the project
fn cmd_add(
    project: &Project,
    source: &Path,
    dest: &str,
    content_type: Option<ContentMode>,
    message: Option<String>,
    keep: bool,
    private: bool,
) -> anyhow::Result<()> {
    let content = std::fs::read(source).with_context(|| format!("cannot read {}", source.display()))?;
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("source has no file name")?;
    let mode = content_type.unwrap_or(if std::str::from_utf8(&content).is_ok() {
        ContentMode::Text
    } else {
        ContentMode::Binary
    });
    let (content_type, kind) = match mode {
        ContentMode::Text => (TEXT_CONTENT_TYPE, ItemKind::Database),
        ContentMode::Binary => (OPAQUE_CONTENT_TYPE, ItemKind::DataFile),
    };

    let path = tandem::utils::join_path(&tandem::utils::normalize_parent(dest)?, &name);
    let file = project.create_file(&path, content_type, kind, &content)?;
    if private {
        println!("{} Created private file {}", "✓".green().bold(), path.cyan());
        return Ok(());
    }
    file.add_to_repository(message.as_deref(), keep, &TaskMonitor::none())?;
    println!("{} Added {} to the repository", "✓".green().bold(), path.cyan());
    println!("  Size: {}", format_bytes(content.len() as u64).cyan());
    if keep {
        println!("  State: {}", "checked out".yellow());
    }
    Ok(())
}

/// Show file states
fn cmd_status(project: &Project, only: Option<String>) -> anyhow::Result<()> {
    let paths = match only {
        Some(path) => vec![path],
        None => project.list_files()?,
    };
    if !project.repository().is_online() {
        println!("{}", "Repository offline; showing local files only".yellow());
    }
    if paths.is_empty() {
        println!("{}", "No files".yellow());
        return Ok(());
    }

    println!("{}", "Tandem Status:".blue().bold());
    for path in paths {
        let file = project.file(&path)?;
        let state = file.state()?;
        let label = match state {
            FileState::Private => state.to_string().normal(),
            FileState::Versioned => state.to_string().green(),
            FileState::CheckedOut if file.modified_since_checkout() => "modified".yellow().bold(),
            FileState::CheckedOut => state.to_string().yellow(),
            FileState::Hijacked => state.to_string().red(),
        };
        let versions = match state {
            FileState::Private => String::new(),
            _ => format!("v{}/{}", file.version(), file.latest_version()),
        };
        let exclusive = if file.is_checked_out_exclusive() { " (exclusive)" } else { "" };
        println!(
            "  {:<12} {:<8} {:>10}  {}{}",
            label,
            versions,
            format_bytes(file.length()),
            path.cyan(),
            exclusive
        );
    }
    Ok(())
}

/// Check a file out
fn cmd_checkout(project: &Project, path: &str, exclusive: bool) -> anyhow::Result<()> {
    let file = project.file(path)?;
    if !file.checkout(exclusive, &TaskMonitor::none())? {
        bail!("checkout of {} was declined; another user holds a conflicting checkout", path);
    }
    println!(
        "{} Checked out {} at version {}",
        "✓".green().bold(),
        path.cyan(),
        file.version().to_string().yellow()
    );
    Ok(())
}

/// Replace file content from a filesystem file
fn cmd_write(project: &Project, path: &str, source: &Path) -> anyhow::Result<()> {
    let content = std::fs::read(source).with_context(|| format!("cannot read {}", source.display()))?;
    let file = project.file(path)?;
    let object = file.open_for_update(false)?;
    let saved = object
        .set_content(content)
        .and_then(|_| file.save(&object));
    file.release(&object)?;
    saved?;
    println!("{} Wrote {}", "✓".green().bold(), path.cyan());
    Ok(())
}

/// Check local changes in
fn cmd_checkin(
    project: &Project,
    path: &str,
    message: Option<String>,
    keep: bool,
    keep_file: bool,
) -> anyhow::Result<()> {
    let file = project.file(path)?;
    let options = CheckinOptions {
        comment: message,
        keep_checked_out: keep,
        create_keep_file: keep_file,
    };

    let start = Instant::now();
    let (pb, monitor) = spinner("Checking in...")?;
    let outcome = file.checkin(&options, &monitor);
    pb.finish_and_clear();

    match outcome? {
        CheckinOutcome::Committed { version, fast_path } => {
            println!(
                "{} Checked in {} as version {}",
                "✓".green().bold(),
                path.cyan(),
                version.to_string().yellow().bold()
            );
            if !fast_path {
                println!("  Merged with changes checked in by others");
            }
            println!("  Time: {}", format_duration(round_millis(start.elapsed())).to_string().cyan());
        }
        CheckinOutcome::Aborted => {
            println!("{} Checkin of {} aborted by conflicting changes", "!".yellow().bold(), path.cyan());
            println!("  Run {} after resolving the conflict", "tandem update".yellow());
        }
    }
    Ok(())
}

/// Merge newer repository versions into a checkout
fn cmd_update(project: &Project, path: &str) -> anyhow::Result<()> {
    let file = project.file(path)?;
    let (pb, monitor) = spinner("Merging...")?;
    let outcome = file.merge(&monitor);
    pb.finish_and_clear();

    match outcome? {
        MergeOutcome::Rebased { version } => {
            println!("{} Updated {} to version {}", "✓".green().bold(), path.cyan(), version.to_string().yellow());
        }
        MergeOutcome::Merged { version } => {
            println!(
                "{} Merged local changes of {} onto version {}",
                "✓".green().bold(),
                path.cyan(),
                version.to_string().yellow()
            );
            println!("  Previous local content saved as a keep file");
        }
        MergeOutcome::Aborted => {
            println!("{} Merge of {} aborted; local file unchanged", "!".yellow().bold(), path.cyan());
        }
    }
    Ok(())
}

/// Show version history
fn cmd_history(project: &Project, path: &str) -> anyhow::Result<()> {
    let file = project.file(path)?;
    let history = file.version_history()?;
    let current = file.is_checked_out().then(|| file.version());

    println!("{} {}", "History of".blue().bold(), path.cyan());
    for info in history.iter().rev() {
        let marker = if Some(info.version) == current { "*" } else { " " };
        println!(
            "{} {:>4}  {}  {:<12} {:>10}  {}",
            marker.yellow().bold(),
            format!("v{}", info.version).yellow(),
            info.created_at.format("%Y-%m-%d %H:%M:%S"),
            info.user,
            format_bytes(info.length),
            info.comment.as_deref().unwrap_or("").cyan()
        );
    }
    Ok(())
}

// Helper functions

/// Open the project at `root`
fn open_project(root: &Path) -> anyhow::Result<Project> {
    Project::open(root.to_path_buf())
        .with_context(|| format!("not a Tandem project: {}. Run 'tandem init' first", root.display()))
}

/// Spinner driven by a task monitor
fn spinner(message: &'static str) -> anyhow::Result<(ProgressBar, TaskMonitor)> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));

    let bar = pb.clone();
    let monitor = TaskMonitor::with_progress(Arc::new(move |info| {
        let item = info.current_item.unwrap_or_default();
        bar.set_message(format!("{} {}", info.operation, item));
    }));
    Ok((pb, monitor))
}

fn round_millis(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}
