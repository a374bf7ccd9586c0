//! Tandem CLI
//!
//! Command-line front end for a Tandem project directory.
//!
//! # Usage
//!
//! ```bash
//! # Create (or open) the project in the current directory
//! tandem init
//!
//! # Branch off the checked-out branch and switch to it
//! tandem branch level-redesign
//! tandem checkout level-redesign
//!
//! # Preview a merge, then keep or drop it
//! tandem preview level-redesign main
//! tandem confirm
//!
//! # Mirror the directory into the store until Ctrl-C
//! tandem watch
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use colored::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tandem_core::DocumentId;
use tandem_project::config::ProjectConfig;
use tandem_project::{Branch, NoopHooks, Project, ProjectDiff, SyncStatus};
use tandem_scene::{ChangeType, LineTag};

/// Tandem - branching and history for game projects
#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Project directory
    #[arg(short, long, env = "TANDEM_PATH", default_value = ".")]
    path: PathBuf,

    /// Author name recorded on new changes (overrides tandem.toml)
    #[arg(short, long, env = "TANDEM_USER")]
    user: Option<String>,

    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[arg(long, env = "TANDEM_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Quiet mode (no banner)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the project store if it does not exist yet
    Init,
    /// Show the checked-out branch and its sync state
    Status,
    /// History of the checked-out branch
    Log {
        /// Show only the latest N entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// List branches
    Branches,
    /// Fork the checked-out branch
    Branch { name: String },
    /// Switch to another branch (name or id)
    Checkout { branch: String },
    /// Merge SOURCE into TARGET (defaults to main)
    Merge {
        source: String,
        target: Option<String>,
        /// Merge even if both sides edited the same files
        #[arg(long)]
        force: bool,
    },
    /// Build and check out a merge preview of SOURCE into TARGET
    Preview { source: String, target: Option<String> },
    /// Apply the checked-out merge preview to its target
    Confirm,
    /// Drop the checked-out merge preview
    Cancel,
    /// Delete a branch
    Delete { branch: String },
    /// What the checked-out branch changed since it forked
    Diff,
    /// List files on the checked-out branch
    Files,
    /// Mirror the working directory into the store until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(args.log_level.to_lowercase())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let mut config = ProjectConfig::load(ProjectConfig::path_in(&args.path))?;
    if let Some(user) = args.user.clone() {
        config.user.name = Some(user);
    }
    let project = Project::open_with_config(&args.path, config).await?;

    if !args.quiet && matches!(args.command, Command::Init | Command::Watch) {
        print_banner(&project);
    }

    let result = run(&project, args.command).await;
    project.close().await?;
    result
}

async fn run(project: &Project, command: Command) -> Result<()> {
    match command {
        Command::Init => {
            let main = project.main_branch().await?;
            println!("{} project {}", "Initialized".green(), project.project_id());
            println!("  main branch {}", main.id.to_string().dimmed());
        }
        Command::Status => {
            let branch = project.current_branch().await?;
            println!("On branch {}", branch.name.cyan());
            if branch.is_merge_preview {
                println!("{}", "  (merge preview: confirm or cancel)".yellow());
            }
            println!("  heads {}", branch.heads);
            let sync = match project.sync_status().await? {
                SyncStatus::Unknown => "unknown".dimmed(),
                SyncStatus::Syncing => "syncing".yellow(),
                SyncStatus::FullySynced => "fully synced".green(),
                SyncStatus::Disconnected { pending } => {
                    format!("disconnected, {} pending", pending).red()
                }
            };
            println!("  sync  {}", sync);
        }
        Command::Log { limit } => {
            let changes = project.get_changes().await?;
            let skip = limit.map_or(0, |n| changes.len().saturating_sub(n));
            for change in changes.iter().skip(skip).rev() {
                let marker = if change.is_merge { "M".magenta() } else { "*".normal() };
                println!(
                    "{} {} {}",
                    marker,
                    change.hash.short().yellow(),
                    change.summary
                );
            }
        }
        Command::Branches => {
            let current = project.current_branch().await?;
            for branch in project.get_branches().await? {
                let mark = if branch.id == current.id { "*" } else { " " };
                let mut line = format!("{} {}", mark, branch.name);
                if branch.is_not_loaded {
                    line.push_str(" (not loaded)");
                }
                if branch.id == current.id {
                    println!("{}  {}", line.green(), branch.id.to_string().dimmed());
                } else {
                    println!("{}  {}", line, branch.id.to_string().dimmed());
                }
            }
        }
        Command::Branch { name } => {
            let branch = project.create_branch(&name).await?;
            println!("Created branch {} ({})", branch.name.cyan(), branch.id);
        }
        Command::Checkout { branch } => {
            let branch = resolve(project, &branch).await?;
            let branch = project.checkout_branch(&branch.id).await?;
            println!("Switched to branch {}", branch.name.cyan());
        }
        Command::Merge {
            source,
            target,
            force,
        } => {
            let source = resolve(project, &source).await?;
            let target = resolve_target(project, target.as_deref()).await?;
            let conflicts = project.conflicting_files(&source.id, &target.id).await?;
            if !conflicts.is_empty() && !force {
                eprintln!("{}", "Both branches edited:".yellow());
                for path in &conflicts {
                    eprintln!("  {}", path);
                }
                bail!("refusing to merge; preview it or pass --force");
            }
            let hash = project.merge_branch(&source.id, &target.id).await?;
            info!(source = %source.id, target = %target.id, "Merged from the command line");
            println!(
                "Merged {} into {} ({})",
                source.name.cyan(),
                target.name.cyan(),
                hash.short()
            );
        }
        Command::Preview { source, target } => {
            let source = resolve(project, &source).await?;
            let target = resolve_target(project, target.as_deref()).await?;
            let preview = project
                .create_merge_preview_branch(&source.id, &target.id)
                .await?;
            println!("Checked out preview {}", preview.name.cyan());
            if let Some(diff) = project.get_default_diff().await? {
                print_diff(&diff);
            }
        }
        Command::Confirm => {
            let preview = current_preview(project).await?;
            let target = project.confirm_merge_preview(&preview.id).await?;
            println!("Merged preview into {}", target.name.cyan());
        }
        Command::Cancel => {
            let preview = current_preview(project).await?;
            let back = project.cancel_merge_preview(&preview.id).await?;
            println!("Cancelled preview; back on {}", back.name.cyan());
        }
        Command::Delete { branch } => {
            let branch = resolve(project, &branch).await?;
            project.delete_branch(&branch.id).await?;
            println!("Deleted branch {}", branch.name);
        }
        Command::Diff => match project.get_default_diff().await? {
            Some(diff) if diff.is_empty() => println!("{}", "No changes".dimmed()),
            Some(diff) => print_diff(&diff),
            None => println!("{}", "main has no fork point to diff against".dimmed()),
        },
        Command::Files => {
            for path in project.list_all_files().await? {
                println!("{}", path);
            }
        }
        Command::Watch => {
            project.start_watching(Arc::new(NoopHooks)).await?;
            info!("Watching for changes");
            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");
        }
    }
    Ok(())
}

/// Find a branch by id, falling back to its name
async fn resolve(project: &Project, name_or_id: &str) -> Result<Branch> {
    if let Ok(id) = DocumentId::new(name_or_id) {
        if let Ok(branch) = project.get_branch_by_id(&id).await {
            return Ok(branch);
        }
    }
    let mut matches: Vec<Branch> = project
        .get_branches()
        .await?
        .into_iter()
        .filter(|b| b.name == name_or_id)
        .collect();
    match matches.len() {
        0 => bail!("no branch named {}", name_or_id),
        1 => Ok(matches.remove(0)),
        n => bail!("{} branches are named {}; use the id", n, name_or_id),
    }
}

async fn resolve_target(project: &Project, target: Option<&str>) -> Result<Branch> {
    match target {
        Some(target) => resolve(project, target).await,
        None => Ok(project.main_branch().await?),
    }
}

async fn current_preview(project: &Project) -> Result<Branch> {
    let branch = project.current_branch().await?;
    if !branch.is_merge_preview {
        bail!("{} is not a merge preview", branch.name);
    }
    Ok(branch)
}

fn print_diff(diff: &ProjectDiff) {
    for file in &diff.files {
        let tag = match file.change_type {
            ChangeType::Added => "A".green(),
            ChangeType::Removed => "D".red(),
            ChangeType::Modified => "M".yellow(),
            ChangeType::TypeChanged => "T".magenta(),
        };
        println!("{} {}", tag, file.path);
        for (node, change) in &file.node_diffs {
            println!("    {} {} ({} properties)", change.change_type, node, change.props.len());
        }
        for (id, change) in &file.sub_resource_diffs {
            println!("    {} sub_resource {}", change.change_type, id);
        }
        for name in file.props_diff.keys() {
            println!("    changed {}", name);
        }
        for hunk in &file.text_hunks {
            println!(
                "    {}",
                format!(
                    "@@ -{},{} +{},{} @@",
                    hunk.old_start, hunk.old_lines, hunk.new_start, hunk.new_lines
                )
                .cyan()
            );
            for line in &hunk.lines {
                let text = format!("{}{}", line.tag.sign(), line.content);
                match line.tag {
                    LineTag::Insert => println!("    {}", text.green()),
                    LineTag::Delete => println!("    {}", text.red()),
                    LineTag::Equal => println!("    {}", text),
                }
            }
        }
    }
    for (path, error) in &diff.errors {
        println!("{} {}: {}", "!".red(), path, error);
    }
}

fn print_banner(project: &Project) {
    println!(
        "{}",
        format!(
            r#"
  ╔╦╗╔═╗╔╗╔╔╦╗╔═╗╔╦╗
   ║ ╠═╣║║║ ║║║╣ ║║║
   ╩ ╩ ╩╝╚╝═╩╝╚═╝╩ ╩  v{}
  Project {}
"#,
            env!("CARGO_PKG_VERSION"),
            project.project_id()
        )
        .cyan()
    );
}
