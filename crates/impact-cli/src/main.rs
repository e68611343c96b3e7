mod archives;
mod cli;
mod config;
mod fields;
mod keys;
mod render;
mod storage;

use std::path::Path;

use anyhow::{bail, Context};
use clap::Parser;
use color_eyre::Result;
use impact_core::CancelToken;
use impact_crypto::Purpose;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Command, ConfigCommand, FieldsCommand, KeysCommand};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load(cli.config.as_deref())?;
    let json = cli.json;

    match cli.command {
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(cli.config.as_deref())?,
        Command::Keys(KeysCommand::Provision) => keys::provision(&config).map_err(eyre)?,
        command => {
            let rt = storage::Runtime::from_config(&config).map_err(eyre)?;
            let cancel = cancel_on_ctrl_c();
            dispatch(&rt, command, &cancel, json).await.map_err(eyre)?;
        }
    }

    Ok(())
}

async fn dispatch(
    rt: &storage::Runtime,
    command: Command,
    cancel: &CancelToken,
    json: bool,
) -> anyhow::Result<()> {
    match command {
        Command::Backup { manual, note } => archives::backup(rt, manual, note, cancel, json).await,
        Command::Verify {
            archive_id,
            prefix_chunks,
        } => archives::verify(rt, &archive_id, prefix_chunks, json),
        Command::Plan => archives::plan(rt, json),
        Command::Prune {
            archive_ids,
            from_plan,
        } => archives::prune(rt, archive_ids, from_plan, json),
        Command::Delete { archive_id, force } => archives::delete(rt, &archive_id, force, json),
        Command::Restore {
            archive_id,
            confirm,
        } => archives::restore(rt, &archive_id, confirm, cancel, json).await,
        Command::List => archives::list(rt, json),
        Command::Status => archives::status(rt, json),
        Command::Keys(KeysCommand::Status) => keys::status(rt, json),
        Command::Keys(KeysCommand::Rotate { purpose }) => keys::rotate(rt, purpose, json),
        Command::Keys(KeysCommand::Retire {
            purpose,
            key_version,
        }) => keys::retire(rt, purpose, key_version, json).await,
        Command::Fields(FieldsCommand::Migrate { collection }) => {
            fields::migrate(rt, &collection, json).await
        }
        Command::Fields(FieldsCommand::Find {
            collection,
            field,
            value,
        }) => fields::find(rt, &collection, &field, &value, json).await,
        Command::Health => {
            run_health_check(rt).await?;
            println!("Keys: ok");
            println!("Field encryption: ok");
            println!("Storage: ok");
            Ok(())
        }
        Command::Version
        | Command::Config(_)
        | Command::Keys(KeysCommand::Provision) => Ok(()),
    }
}

fn eyre(err: anyhow::Error) -> color_eyre::eyre::Report {
    color_eyre::eyre::eyre!("{err:#}")
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("impact {}", env!("CARGO_PKG_VERSION"));
}

/// First Ctrl-C cancels the running operation at its next checkpoint.
fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
    cancel
}

fn init_config(path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config::default_path()?,
    };
    let path = config::write_if_missing(&config::Config::starter(), &path)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

/// Exercises key derivation, a field encryption round trip and both stores
/// without touching any live document.
async fn run_health_check(rt: &storage::Runtime) -> anyhow::Result<()> {
    for purpose in Purpose::ALL {
        rt.keys
            .derive_key(purpose, None)
            .with_context(|| format!("deriving {purpose} key"))?;
    }

    let field = rt
        .cipher
        .allowlist()
        .iter()
        .next()
        .context("encryption allowlist is empty")?;
    let probe = "health-probe";
    let stored = rt.cipher.encrypt_str(field, probe)?;
    if rt.cipher.decrypt_str(field, &stored)? != probe {
        bail!("field encryption round-trip failed");
    }

    let root = rt.service.store().root();
    std::fs::create_dir_all(root)
        .with_context(|| format!("creating archive dir {}", root.display()))?;
    tempfile::NamedTempFile::new_in(root)
        .with_context(|| format!("archive dir {} is not writable", root.display()))?;

    rt.service
        .live()
        .list_collections()
        .await
        .context("listing live collections")?;
    Ok(())
}
