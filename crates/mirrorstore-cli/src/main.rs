#![deny(unsafe_code)]

//! Command-line interface for mirrorstore records and mirror files.

use std::io::{IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

use mirrorstore_core::engine::StorageEngine;
use mirrorstore_core::handle::DirectoryHandleProvider;
use mirrorstore_core::store::StateUpdate;
use mirrorstore_core::MirrorOutcome;

/// Local-first persistence with an encrypted mirror file
#[derive(Parser)]
#[command(name = "mirrorstore")]
#[command(author, version)]
#[command(after_help = "EXAMPLES:
    # Inspect the record store
    mirrorstore --store ./record.json status

    # Merge a JSON patch into the state and mirror it
    echo '{\"note\": \"hello\"}' | mirrorstore --store ./record.json save

    # Connect an encrypted mirror file in a cloud-synced folder
    mirrorstore --store ./record.json connect ~/Dropbox/mirrorstore

    # Move the record to another machine
    mirrorstore --store ./record.json export backup.enc
")]
struct Cli {
    /// Path of the local record store file
    #[arg(long, default_value = "mirrorstore-record.json", global = true)]
    store: PathBuf,

    /// Mirror password (insecure, prefer MIRRORSTORE_PASSWORD or the prompt)
    #[arg(
        long,
        env = "MIRRORSTORE_PASSWORD",
        hide_env_values = true,
        global = true
    )]
    password: Option<String>,

    /// Read the password from stdin (single line)
    #[arg(long, conflicts_with = "password", global = true)]
    password_stdin: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the record version, device id, and mirror status
    Status,
    /// Print the current state as JSON
    Load {
        /// Pretty-print the output
        #[arg(long)]
        pretty: bool,
    },
    /// Apply a JSON state update read from a file or stdin
    Save {
        /// Read the update from this file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
        /// Replace the whole state instead of shallow-merging
        #[arg(long)]
        replace: bool,
    },
    /// Grant a mirror file inside the given directory
    Connect {
        /// Directory that will hold the mirror file
        dir: PathBuf,
        /// Write the mirror without password protection
        #[arg(long)]
        plaintext: bool,
    },
    /// Forget the mirror handle (the external file is kept)
    Revoke,
    /// Encrypt the current state into a standalone container file
    Export {
        /// Output path for the container
        output: PathBuf,
    },
    /// Decrypt a container file and adopt its state if newer
    Import {
        /// Container file to import
        input: PathBuf,
    },
    /// Rotate the mirror password (rewraps the key, not the payload)
    ChangePassword,
    /// List backup files next to the mirror
    Backups,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // `connect` builds its own engine with the provider rooted at the
    // target directory; everything else shares the default one.
    if let Commands::Connect { dir, plaintext } = &cli.command {
        return cmd_connect(&cli, dir, *plaintext);
    }

    let engine = build_engine(&cli)?;
    match &cli.command {
        Commands::Status => cmd_status(&engine),
        Commands::Load { pretty } => cmd_load(&engine, *pretty),
        Commands::Save { file, replace } => cmd_save(&engine, file.as_deref(), *replace),
        Commands::Connect { .. } => unreachable!("handled above"),
        Commands::Revoke => {
            engine.revoke()?;
            println!("mirror disconnected");
            Ok(())
        }
        Commands::Export { output } => cmd_export(&cli, &engine, output),
        Commands::Import { input } => cmd_import(&cli, &engine, input),
        Commands::ChangePassword => cmd_change_password(&engine),
        Commands::Backups => cmd_backups(&engine),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_engine(cli: &Cli) -> Result<StorageEngine> {
    // Restored handles carry their own path, so the provider root only
    // matters for `connect` (which rebuilds the engine with the right one).
    tracing::debug!(store = %cli.store.display(), "opening record store");
    let provider = DirectoryHandleProvider::new(".");
    let prompt_password = password_resolver(cli);
    StorageEngine::builder(&cli.store)
        .with_provider(provider)
        .with_password_prompt(move || prompt_password())
        .open()
        .context("failed to open the record store")
}

/// Resolve the mirror password: flag/env first, then stdin, then an
/// interactive prompt when one is possible.
fn password_resolver(cli: &Cli) -> impl Fn() -> Option<SecretString> + Send + Sync + 'static {
    let fixed = cli.password.clone();
    let from_stdin = cli.password_stdin;
    move || {
        if let Some(password) = &fixed {
            return Some(SecretString::from(password.clone()));
        }
        if from_stdin {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).ok()?;
            let trimmed = line.trim_end_matches(['\r', '\n']);
            return Some(SecretString::from(trimmed.to_string()));
        }
        if !std::io::stdin().is_terminal() {
            return None;
        }
        rpassword::prompt_password("Mirror password: ")
            .ok()
            .filter(|p| !p.is_empty())
            .map(SecretString::from)
    }
}

fn require_password(cli: &Cli, prompt: &str) -> Result<SecretString> {
    if let Some(password) = &cli.password {
        return Ok(SecretString::from(password.clone()));
    }
    if cli.password_stdin {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        return Ok(SecretString::from(
            line.trim_end_matches(['\r', '\n']).to_string(),
        ));
    }
    let password = rpassword::prompt_password(prompt)?;
    if password.is_empty() {
        bail!("a password is required");
    }
    Ok(SecretString::from(password))
}

fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn cmd_status(engine: &StorageEngine) -> Result<()> {
    let loaded = engine.load()?;
    let settings = engine.settings();

    let mut table = create_table();
    table.set_header(vec!["Property", "Value"]);
    table.add_row(vec!["version".to_string(), loaded.version.to_string()]);
    table.add_row(vec!["device id".to_string(), settings.device_id]);
    table.add_row(vec![
        "mirror".to_string(),
        match &settings.external_handle {
            Some(path) => path.display().to_string(),
            None => "not connected".to_string(),
        },
    ]);
    table.add_row(vec![
        "mirror usable".to_string(),
        engine.is_mirror_connected().to_string(),
    ]);
    table.add_row(vec![
        "encrypted".to_string(),
        settings.mirror_encrypted.to_string(),
    ]);
    table.add_row(vec![
        "last backup".to_string(),
        settings
            .last_backup
            .map_or("never".to_string(), |at| at.to_rfc3339()),
    ]);
    println!("{table}");
    Ok(())
}

fn cmd_load(engine: &StorageEngine, pretty: bool) -> Result<()> {
    let loaded = engine.load()?;
    if pretty {
        println!("{}", serde_json::to_string_pretty(&loaded.state)?);
    } else {
        println!("{}", serde_json::to_string(&loaded.state)?);
    }
    Ok(())
}

fn cmd_save(engine: &StorageEngine, file: Option<&std::path::Path>, replace: bool) -> Result<()> {
    let input = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    let value: serde_json::Value =
        serde_json::from_str(&input).context("the state update must be valid JSON")?;
    let update = if replace {
        StateUpdate::Replace(value)
    } else {
        StateUpdate::Merge(value)
    };

    let receipt = engine.save(update)?;
    println!("saved version {}", receipt.version);
    match receipt.mirror {
        MirrorOutcome::Written => println!("mirror updated"),
        MirrorOutcome::NotConnected => {}
        MirrorOutcome::Locked => println!("mirror busy (locked by another writer); local save kept"),
        MirrorOutcome::PasswordRequired => println!("mirror skipped: password required"),
        MirrorOutcome::WriteFailed => println!("mirror write failed; local save kept"),
    }
    Ok(())
}

fn cmd_connect(cli: &Cli, dir: &std::path::Path, plaintext: bool) -> Result<()> {
    let prompt_password = password_resolver(cli);
    let engine = StorageEngine::builder(&cli.store)
        .with_provider(DirectoryHandleProvider::new(dir))
        .with_password_prompt(move || prompt_password())
        .open()
        .context("failed to open the record store")?;

    engine.connect_file(!plaintext)?;
    let settings = engine.settings();
    println!(
        "mirror connected: {}",
        settings
            .external_handle
            .map_or("?".to_string(), |p| p.display().to_string())
    );
    println!("the mirror file will be written on the next save");
    Ok(())
}

fn cmd_export(cli: &Cli, engine: &StorageEngine, output: &std::path::Path) -> Result<()> {
    let password = require_password(cli, "Export password: ")?;
    let bytes = engine.export_encrypted(&password)?;
    std::fs::write(output, bytes)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("exported to {}", output.display());
    Ok(())
}

fn cmd_import(cli: &Cli, engine: &StorageEngine, input: &std::path::Path) -> Result<()> {
    let bytes =
        std::fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let password = require_password(cli, "Import password: ")?;
    let result = engine.import_encrypted(&bytes, &password)?;
    println!("imported version {}", result.version);
    Ok(())
}

fn cmd_change_password(engine: &StorageEngine) -> Result<()> {
    let old = SecretString::from(rpassword::prompt_password("Current password: ")?);
    let new = rpassword::prompt_password("New password: ")?;
    let confirm = rpassword::prompt_password("Repeat new password: ")?;
    if new != confirm {
        bail!("passwords do not match");
    }
    if new.is_empty() {
        bail!("the new password must not be empty");
    }
    engine.change_password(&old, &SecretString::from(new))?;
    println!("password changed");
    Ok(())
}

fn cmd_backups(engine: &StorageEngine) -> Result<()> {
    let backups = engine.list_backups();
    if backups.is_empty() {
        println!("no backups");
        return Ok(());
    }
    let mut table = create_table();
    table.set_header(vec!["Name", "Date", "Version"]);
    for backup in backups {
        table.add_row(vec![
            backup.name,
            backup.date.to_rfc3339(),
            backup.version.to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}
