use std::path::PathBuf;

use clap::{Parser, Subcommand};
use impact_crypto::Purpose;

/// Operator surface for field encryption keys and encrypted backups.
#[derive(Parser, Debug)]
#[command(
    name = "impact",
    about = "Field encryption and encrypted backup lifecycle for clinical data",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Print reports as JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Use this config file instead of the platform default.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Snapshot the configured collections into a new encrypted archive.
    Backup {
        /// Mark the archive manual; retention never prunes it.
        #[arg(long)]
        manual: bool,
        /// Free-text note stored in the manifest.
        #[arg(long)]
        note: Option<String>,
    },
    /// Check an archive's checksum, decryptability and manifest.
    Verify {
        archive_id: String,
        /// Only decrypt the first N chunks; skips the manifest cross-check.
        #[arg(long, value_name = "N")]
        prefix_chunks: Option<u32>,
    },
    /// Show which archives the retention policy keeps and why.
    Plan,
    /// Delete automatic archives.
    Prune {
        archive_ids: Vec<String>,
        /// Prune everything the current retention plan marks for deletion.
        #[arg(long, conflicts_with = "archive_ids")]
        from_plan: bool,
    },
    /// Delete one archive.
    Delete {
        archive_id: String,
        /// Allow deleting a manual archive.
        #[arg(long)]
        force: bool,
    },
    /// Replace live collections with an archive's contents.
    Restore {
        archive_id: String,
        /// Must read exactly `RESTORE <archive_id>`.
        #[arg(long, value_name = "TOKEN")]
        confirm: String,
    },
    /// List archives, oldest first.
    List,
    /// Summarise archive storage and key versions.
    Status,
    /// Manage key versions.
    #[command(subcommand)]
    Keys(KeysCommand),
    /// Work with encrypted fields in live collections.
    #[command(subcommand)]
    Fields(FieldsCommand),
    /// Run a health check against keys, field encryption and storage.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version and exit.
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum KeysCommand {
    /// List versions for every purpose.
    Status,
    /// Create a new current version.
    Rotate { purpose: Purpose },
    /// Retire a non-current version nothing references any more.
    Retire {
        purpose: Purpose,
        #[arg(value_name = "VERSION")]
        key_version: u32,
    },
    /// Store a fresh master secret in the OS keychain if none exists.
    Provision,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum FieldsCommand {
    /// Encrypt plaintext allowlisted values and move old versions forward.
    Migrate { collection: String },
    /// Find documents whose field equals a plaintext value.
    Find {
        collection: String,
        field: String,
        value: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("impact").chain(args.iter().copied()))
            .expect("parse should succeed")
    }

    #[test]
    fn parses_manual_backup_with_note() {
        let cli = parse(&["backup", "--manual", "--note", "before upgrade"]);
        assert_eq!(
            cli.command,
            Command::Backup {
                manual: true,
                note: Some("before upgrade".into()),
            }
        );
    }

    #[test]
    fn parses_prefix_verify_and_global_json() {
        let cli = parse(&["verify", "20261019T120000Z-0a1b2c3d", "--prefix-chunks", "4", "--json"]);
        assert!(cli.json);
        assert_eq!(
            cli.command,
            Command::Verify {
                archive_id: "20261019T120000Z-0a1b2c3d".into(),
                prefix_chunks: Some(4),
            }
        );
    }

    #[test]
    fn prune_ids_conflict_with_from_plan() {
        assert!(Cli::try_parse_from(["impact", "prune", "a", "--from-plan"]).is_err());
        let cli = parse(&["prune", "--from-plan"]);
        assert_eq!(
            cli.command,
            Command::Prune {
                archive_ids: vec![],
                from_plan: true,
            }
        );
    }

    #[test]
    fn restore_requires_confirmation() {
        assert!(Cli::try_parse_from(["impact", "restore", "abc"]).is_err());
        let cli = parse(&["restore", "abc", "--confirm", "RESTORE abc"]);
        assert_eq!(
            cli.command,
            Command::Restore {
                archive_id: "abc".into(),
                confirm: "RESTORE abc".into(),
            }
        );
    }

    #[test]
    fn parses_key_purposes() {
        let cli = parse(&["keys", "retire", "backup-encryption", "1"]);
        assert_eq!(
            cli.command,
            Command::Keys(KeysCommand::Retire {
                purpose: Purpose::BackupEncryption,
                key_version: 1,
            })
        );
        assert!(Cli::try_parse_from(["impact", "keys", "rotate", "session"]).is_err());
    }

    #[test]
    fn command_tree_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_field_search() {
        let cli = parse(&["fields", "find", "patients", "nhs_number", "9434765919"]);
        assert_eq!(
            cli.command,
            Command::Fields(FieldsCommand::Find {
                collection: "patients".into(),
                field: "nhs_number".into(),
                value: "9434765919".into(),
            })
        );
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli = parse(&["--config", "/tmp/impact.toml", "config", "init"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/impact.toml")));
        assert_eq!(cli.command, Command::Config(ConfigCommand::Init));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["impact"]).is_err());
    }
}
