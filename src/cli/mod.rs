//! CLI commands for scriptkeeper.
//!
//! Manages the script registry of a profile directory without a browser:
//! install, toggle, reorder and remove scripts, edit the exclude list, dry-run
//! matching for a URL, and refresh the blocklist or catalog metadata.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use console::style;

use crate::config::{Preferences, Settings};
use crate::injection::is_injectable_url;
use crate::script::{RunAt, Script, ScriptId};
use crate::service::{KeeperConfig, Scriptkeeper};

#[derive(Parser)]
#[command(name = "scriptkeeper")]
#[command(about = "Userscript registry and injection manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (default: ~/.config/scriptkeeper/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Profile directory, overriding the one in the settings
    #[arg(long, value_name = "DIR", global = true)]
    pub profile: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List installed scripts in injection order
    List,

    /// Install a script from a file or URL
    Install {
        /// Path to a .user.js file, or an http(s) URL
        source: String,
    },

    /// Enable a script
    Enable { id: String },

    /// Disable a script
    Disable { id: String },

    /// Remove a script and its file
    Uninstall { id: String },

    /// Move a script up (negative) or down (positive) the injection order
    Move {
        id: String,
        #[arg(allow_hyphen_values = true)]
        delta: isize,
    },

    /// Manage URLs no script may run on
    Exclude {
        #[command(subcommand)]
        action: ExcludeCommands,
    },

    /// Show which scripts would run on a URL, and when
    Check {
        url: String,

        /// Treat the URL as a subframe instead of a top-level document
        #[arg(long)]
        frame: bool,
    },

    /// Blocklist maintenance
    Blocklist {
        #[command(subcommand)]
        action: BlocklistCommands,
    },

    /// userscripts.org catalog metadata
    Catalog {
        #[command(subcommand)]
        action: CatalogCommands,
    },
}

#[derive(Subcommand)]
pub enum ExcludeCommands {
    /// Add an exclude pattern
    Add { pattern: String },
    /// Remove an exclude pattern
    Remove { pattern: String },
    /// List exclude patterns
    List,
}

#[derive(Subcommand)]
pub enum BlocklistCommands {
    /// Fetch the blocklist now and re-check every script
    Refresh,
}

#[derive(Subcommand)]
pub enum CatalogCommands {
    /// Fetch catalog metadata for every catalog script now
    Refresh,
}

/// Parse arguments and run the requested command.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.unwrap_or_else(Preferences::config_path));
    let mut config = KeeperConfig::new(Arc::new(settings));
    if let Some(profile) = cli.profile {
        config.profile_dir = profile;
    }

    let keeper = Scriptkeeper::start(config)
        .await
        .context("Failed to open profile")?;
    let result = dispatch(&keeper, cli.command).await;
    keeper.shutdown().await;
    result
}

async fn dispatch(keeper: &Scriptkeeper, command: Commands) -> anyhow::Result<()> {
    let store = keeper.store();
    match command {
        Commands::List => list(keeper),
        Commands::Install { source } => install(keeper, &source).await,
        Commands::Enable { id } => {
            store.set_enabled(&ScriptId::new(id.as_str()), true)?;
            done(&format!("Enabled {}", id));
            Ok(())
        }
        Commands::Disable { id } => {
            store.set_enabled(&ScriptId::new(id.as_str()), false)?;
            done(&format!("Disabled {}", id));
            Ok(())
        }
        Commands::Uninstall { id } => {
            let id = ScriptId::new(id);
            store.queue_uninstall(&id)?;
            if !store.finalize_uninstall(&id) {
                bail!("Script '{}' not found", id);
            }
            done(&format!("Uninstalled {}", id));
            Ok(())
        }
        Commands::Move { id, delta } => {
            store.move_script(&ScriptId::new(id), delta)?;
            list(keeper)
        }
        Commands::Exclude { action } => exclude(keeper, action),
        Commands::Check { url, frame } => check(keeper, &url, !frame),
        Commands::Blocklist {
            action: BlocklistCommands::Refresh,
        } => {
            let changed = keeper
                .blocklist()
                .fetch_now()
                .await
                .context("Blocklist refresh failed")?;
            let blocked = store.scripts().iter().filter(|s| s.blocked).count();
            if changed {
                done(&format!("Blocklist updated, {} script(s) blocked", blocked));
            } else {
                println!("{} Blocklist unchanged", style("→").cyan());
            }
            Ok(())
        }
        Commands::Catalog {
            action: CatalogCommands::Refresh,
        } => {
            let changed = keeper.catalog().refresh_all().await;
            let updates = store.scripts().iter().filter(|s| s.update_available()).count();
            done(&format!(
                "Catalog metadata refreshed for {} script(s), {} update(s) available",
                changed, updates
            ));
            Ok(())
        }
    }
}

fn done(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

fn status(script: &Script) -> console::StyledObject<&'static str> {
    if script.blocked {
        style("blocked").red()
    } else if script.needs_uninstall {
        style("removing").yellow()
    } else if script.enabled {
        style("enabled").green()
    } else {
        style("disabled").dim()
    }
}

fn list(keeper: &Scriptkeeper) -> anyhow::Result<()> {
    let scripts = keeper.store().scripts();
    if scripts.is_empty() {
        println!("No scripts installed.");
        return Ok(());
    }

    for script in &scripts {
        let update = if script.update_available() {
            style(" update available").cyan().to_string()
        } else {
            String::new()
        };
        println!(
            "{:>4}  {:<8}  {}  {}{}",
            script.priority,
            status(script),
            style(&script.id).bold(),
            style(script.run_at).dim(),
            update
        );
    }
    Ok(())
}

async fn install(keeper: &Scriptkeeper, source: &str) -> anyhow::Result<()> {
    let script = if source.starts_with("http://") || source.starts_with("https://") {
        println!("{} Downloading {}...", style("→").cyan(), style(source).bold());
        keeper.install_from_url(source).await?
    } else {
        let path = PathBuf::from(source);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let script = keeper.store().install_source(&text, None).await?;
        keeper.blocklist().apply();
        keeper.store().get(&script.id).unwrap_or(script)
    };

    done(&format!("Installed {}", style(&script.id).bold()));
    if script.blocked {
        println!(
            "{} {}",
            style("!").red().bold(),
            "This script is on the blocklist and will not run."
        );
    }
    Ok(())
}

fn exclude(keeper: &Scriptkeeper, action: ExcludeCommands) -> anyhow::Result<()> {
    let store = keeper.store();
    match action {
        ExcludeCommands::Add { pattern } => {
            store.add_exclude(&pattern)?;
            done(&format!("Excluded {}", pattern));
        }
        ExcludeCommands::Remove { pattern } => {
            if !store.remove_exclude(&pattern) {
                bail!("No exclude pattern '{}'", pattern);
            }
            done(&format!("Removed {}", pattern));
        }
        ExcludeCommands::List => {
            for pattern in store.excludes() {
                println!("{}", pattern.as_str());
            }
        }
    }
    Ok(())
}

fn check(keeper: &Scriptkeeper, url: &str, is_top_level: bool) -> anyhow::Result<()> {
    let prefs = keeper.settings().get();
    if !prefs.general.enabled {
        println!("{} Injection is disabled", style("!").yellow().bold());
        return Ok(());
    }
    if !is_injectable_url(url, prefs.injection.allow_file_urls) {
        println!("{} Scripts never run on {}", style("!").yellow().bold(), url);
        return Ok(());
    }
    if keeper.store().is_url_excluded(url) {
        println!("{} {} is excluded", style("!").yellow().bold(), url);
        return Ok(());
    }

    let scripts = keeper.store().matching_scripts(url, is_top_level);
    if scripts.is_empty() {
        println!("No scripts match.");
        return Ok(());
    }

    for run_at in RunAt::ALL {
        let bucket: Vec<&Script> = scripts.iter().filter(|s| s.run_at == run_at).collect();
        if bucket.is_empty() {
            continue;
        }
        println!("{}", style(run_at).cyan().bold());
        for script in bucket {
            match script.delay_ms {
                Some(delay) => println!("  {} (after {} ms)", script.id, delay),
                None => println!("  {}", script.id),
            }
        }
    }
    Ok(())
}
