use clap::{Parser, Subcommand, ValueEnum};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "vellum",
    about = "Encrypted key-value preferences backed by the OS keychain",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Optional subcommand; defaults to listing stored keys when absent.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print version and exit.
    Version,
    /// Run a health check against the encrypted store.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Store a value.
    Set {
        key: String,
        value: String,
        #[arg(long, value_enum, default_value_t = ValueKind::String)]
        kind: ValueKind,
    },
    /// Print a stored value.
    Get {
        key: String,
        #[arg(long, value_enum, default_value_t = ValueKind::String)]
        kind: ValueKind,
    },
    /// List stored keys.
    List,
    /// Delete a key.
    Remove { key: String },
    /// Delete every key.
    Clear,
    /// Rotate the preference keysets and re-encrypt all entries.
    Rotate,
    /// Show keyset metadata (never key material).
    Keysets,
    /// Encrypt text with the standalone AEAD keyset; prints base64.
    Encrypt {
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Decrypt base64 produced by `encrypt`.
    Decrypt { ciphertext: String },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

/// How a value given on the command line is interpreted.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Int,
    Long,
    Float,
    Bool,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_none_when_missing_subcommand() {
        let cli = Cli::try_parse_from(["vellum"]).expect("parse should succeed");
        assert_eq!(cli.command, None);
    }

    #[test]
    fn parses_health_subcommand() {
        let cli = Cli::try_parse_from(["vellum", "health"]).expect("parse should succeed");
        assert_eq!(cli.command, Some(Command::Health));
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli =
            Cli::try_parse_from(["vellum", "config", "init"]).expect("parse should succeed");
        assert_eq!(cli.command, Some(Command::Config(ConfigCommand::Init)));
    }

    #[test]
    fn set_defaults_to_string_kind() {
        let cli = Cli::try_parse_from(["vellum", "set", "token", "abc"]).expect("parse");
        assert_eq!(
            cli.command,
            Some(Command::Set {
                key: "token".into(),
                value: "abc".into(),
                kind: ValueKind::String,
            })
        );
    }

    #[test]
    fn get_accepts_kind_flag() {
        let cli = Cli::try_parse_from(["vellum", "get", "count", "--kind", "int"]).expect("parse");
        assert_eq!(
            cli.command,
            Some(Command::Get {
                key: "count".into(),
                kind: ValueKind::Int,
            })
        );
    }

    #[test]
    fn encrypt_requires_text() {
        assert!(Cli::try_parse_from(["vellum", "encrypt"]).is_err());
        let cli = Cli::try_parse_from(["vellum", "encrypt", "hello", "world"]).expect("parse");
        assert_eq!(
            cli.command,
            Some(Command::Encrypt {
                text: vec!["hello".into(), "world".into()],
            })
        );
    }
}
