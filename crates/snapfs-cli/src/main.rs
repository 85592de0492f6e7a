//! # snapfs CLI
//!
//! Command-line interface for snapfs copy-on-write snapshots.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use snapfs_config::logging::{init_logging, LogLevel};
use snapfs_config::Config;
use snapfs_core::{SnapError, SnapFs};

mod mount;
mod snapshot;

/// snapfs - block-level copy-on-write snapshots of a directory tree
#[derive(Parser)]
#[command(name = "snapfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Backing root directory (overrides config and SNAPFS_ROOT)
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Preservation block size in bytes (power of two, 512..=1MiB)
    #[arg(long, global = true, value_name = "BYTES")]
    block_size: Option<u32>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the backing root and its snapshot namespace
    Init,

    /// Take a snapshot of the live tree
    Snapshot {
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Print the latest snapshot id
    Latest,

    /// List snapshot ids, newest first
    Chain,

    /// List a directory (live or under /snapshots)
    Ls {
        #[arg(value_name = "VPATH", default_value = "/")]
        path: String,
    },

    /// Print a file's contents (live or under /snapshots)
    Cat {
        #[arg(value_name = "VPATH")]
        path: String,
    },

    /// Write stdin into a live file, creating it if needed
    Write {
        #[arg(value_name = "VPATH")]
        path: String,

        #[arg(short, long, default_value = "0")]
        offset: u64,
    },

    /// Resize a live file
    Truncate {
        #[arg(value_name = "VPATH")]
        path: String,

        #[arg(value_name = "SIZE")]
        size: u64,
    },

    /// Remove a live file or empty directory
    Rm {
        #[arg(value_name = "VPATH")]
        path: String,
    },

    /// Mount the root with FUSE (requires the `fuse` feature)
    Mount(mount::MountArgs),

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file locations
    Path,
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();
    init_logging(if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Warn
    });

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Init => cmd_init(&config),
        Commands::Snapshot { id } => {
            let fs = open_fs(&config)?;
            let id = snapshot::run(&fs, &id)?;
            println!("Snapshot {id} created");
            Ok(())
        }
        Commands::Latest => {
            let fs = open_fs(&config)?;
            match fs.chain().get_latest()? {
                Some(id) => println!("{id}"),
                None => println!("(none)"),
            }
            Ok(())
        }
        Commands::Chain => {
            let fs = open_fs(&config)?;
            for id in fs.chain().chain()? {
                println!("{id}");
            }
            Ok(())
        }
        Commands::Ls { path } => cmd_ls(&open_fs(&config)?, &path),
        Commands::Cat { path } => cmd_cat(&open_fs(&config)?, &path),
        Commands::Write { path, offset } => cmd_write(&open_fs(&config)?, &path, offset),
        Commands::Truncate { path, size } => {
            open_fs(&config)?
                .truncate_path(&path, size)
                .with_context(|| format!("Failed to truncate {path}"))?;
            Ok(())
        }
        Commands::Rm { path } => cmd_rm(&open_fs(&config)?, &path),
        Commands::Mount(args) => mount::run(args, &config),
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigCommands::Path => {
                match Config::global_config_path() {
                    Some(p) => println!("Global:  {}", p.display()),
                    None => println!("Global:  (no home directory)"),
                }
                println!("Project: {}", Path::new(".snapfs/config.toml").display());
                Ok(())
            }
        },
    }
}

/// Config files, then env, then command-line flags.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(root) = &cli.root {
        config.storage.root = root.clone();
    }
    if let Some(block_size) = cli.block_size {
        config.storage.block_size = block_size;
    }
    config.storage.root = config.storage.resolved_root();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn open_fs(config: &Config) -> Result<SnapFs> {
    let root = &config.storage.root;
    if !root.is_dir() {
        anyhow::bail!(
            "Backing root {} does not exist (run `snapfs init`)",
            root.display()
        );
    }
    SnapFs::new(config).with_context(|| format!("Failed to open {}", root.display()))
}

fn cmd_init(config: &Config) -> Result<()> {
    let root = &config.storage.root;
    std::fs::create_dir_all(root)
        .with_context(|| format!("Failed to create {}", root.display()))?;
    let fs = SnapFs::new(config)?;
    println!("Initialized snapfs root at {}", root.display());
    println!("  Block size: {} bytes", config.storage.block_size);
    if !fs.chain().check_xattr_support() {
        println!("  Note: extended attributes are not supported on this filesystem");
    }
    Ok(())
}

fn cmd_ls(fs: &SnapFs, path: &str) -> Result<()> {
    let stat = fs.getattr(path)?;
    if !stat.is_dir() {
        println!("{}", format_entry(path, &stat));
        return Ok(());
    }
    for (name, stat) in fs.list(path)? {
        println!("{}", format_entry(&name, &stat));
    }
    Ok(())
}

fn format_entry(name: &str, stat: &snapfs_core::FileStat) -> String {
    let kind = if stat.is_dir() { 'd' } else { '-' };
    format!("{kind}{:04o} {:>12} {name}", stat.perm(), stat.size)
}

fn cmd_cat(fs: &SnapFs, path: &str) -> Result<()> {
    let handle = fs.open(path, false)?;
    let chunk = (fs.block_size() * 16) as usize;
    let mut stdout = io::stdout().lock();
    let mut offset = 0u64;
    loop {
        let data = fs.read(&handle, chunk, offset)?;
        if data.is_empty() {
            break;
        }
        stdout.write_all(&data)?;
        offset += data.len() as u64;
    }
    stdout.flush()?;
    fs.release(handle)?;
    Ok(())
}

fn cmd_write(fs: &SnapFs, path: &str, offset: u64) -> Result<()> {
    let mut data = Vec::new();
    io::stdin()
        .read_to_end(&mut data)
        .context("Failed to read stdin")?;

    let handle = match fs.getattr(path) {
        Ok(_) => fs.open(path, true)?,
        Err(SnapError::NotFound { .. }) => fs.create(path, 0o644)?,
        Err(e) => return Err(e.into()),
    };
    let written = fs.write(&handle, &data, offset)?;
    fs.fsync(&handle, false)?;
    fs.release(handle)?;
    tracing::debug!(path, written, "Wrote stdin");
    Ok(())
}

fn cmd_rm(fs: &SnapFs, path: &str) -> Result<()> {
    if fs.getattr(path)?.is_dir() {
        fs.rmdir(path)?;
    } else {
        fs.unlink(path)?;
    }
    Ok(())
}
