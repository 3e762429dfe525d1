use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "pvc-undelete",
    about = "Clear stuck deletion markers from objects stored directly in etcd",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Config file to read instead of the platform default.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Clear deletionTimestamp and deletionGracePeriodSeconds on every PersistentVolumeClaim.
    Pvc(PvcArgs),
    /// Print version and exit.
    Version,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

/// Connection flags. Unset flags fall back to the config file, then to defaults.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct PvcArgs {
    /// CA bundle used to verify the etcd server.
    #[arg(short = 'c', long = "etcdca", value_name = "PATH")]
    pub etcd_ca: Option<PathBuf>,
    /// Client certificate presented to etcd.
    #[arg(short = 'a', long = "etcdcert", value_name = "PATH")]
    pub etcd_cert: Option<PathBuf>,
    /// Private key for the client certificate.
    #[arg(short = 'k', long = "etcdkey", value_name = "PATH")]
    pub etcd_key: Option<PathBuf>,
    /// etcd host [default: localhost]
    #[arg(short = 'o', long = "etcdhost")]
    pub etcd_host: Option<String>,
    /// etcd client port [default: 2379]
    #[arg(short = 'p', long = "etcdport")]
    pub etcd_port: Option<u16>,
    /// Name to verify in the server certificate when it differs from the host.
    #[arg(long)]
    pub tls_server_name: Option<String>,
    /// Keys fetched per range request; 0 reads the prefix in one request [default: 500]
    #[arg(long)]
    pub page_size: Option<i64>,
    /// Seconds allowed for establishing the connection [default: 10]
    #[arg(long)]
    pub connect_timeout_secs: Option<u64>,
    /// Decode and repair in memory without writing anything back.
    #[arg(long)]
    pub dry_run: bool,
    /// Print the run summary as JSON.
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_connection_flags() {
        let cli = Cli::try_parse_from([
            "pvc-undelete",
            "pvc",
            "-c",
            "/pki/ca.crt",
            "-a",
            "/pki/client.crt",
            "-k",
            "/pki/client.key",
            "-o",
            "10.0.0.5",
            "-p",
            "12379",
        ])
        .expect("parse should succeed");

        let Command::Pvc(args) = cli.command else {
            panic!("expected pvc subcommand");
        };
        assert_eq!(args.etcd_ca, Some(PathBuf::from("/pki/ca.crt")));
        assert_eq!(args.etcd_cert, Some(PathBuf::from("/pki/client.crt")));
        assert_eq!(args.etcd_key, Some(PathBuf::from("/pki/client.key")));
        assert_eq!(args.etcd_host.as_deref(), Some("10.0.0.5"));
        assert_eq!(args.etcd_port, Some(12379));
        assert!(!args.dry_run);
    }

    #[test]
    fn parses_long_flags_and_global_config() {
        let cli = Cli::try_parse_from([
            "pvc-undelete",
            "pvc",
            "--etcdca",
            "ca.crt",
            "--tls-server-name",
            "etcd.cluster.local",
            "--page-size",
            "0",
            "--dry-run",
            "--json",
            "--config",
            "/tmp/undelete.toml",
        ])
        .expect("parse should succeed");

        assert_eq!(cli.config, Some(PathBuf::from("/tmp/undelete.toml")));
        let Command::Pvc(args) = cli.command else {
            panic!("expected pvc subcommand");
        };
        assert_eq!(args.tls_server_name.as_deref(), Some("etcd.cluster.local"));
        assert_eq!(args.page_size, Some(0));
        assert!(args.dry_run);
        assert!(args.json);
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(Cli::try_parse_from(["pvc-undelete", "pvc", "-p", "etcd"]).is_err());
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli = Cli::try_parse_from(["pvc-undelete", "config", "init"])
            .expect("parse should succeed");
        assert_eq!(cli.command, Command::Config(ConfigCommand::Init));
    }

    #[test]
    fn requires_a_subcommand() {
        assert!(Cli::try_parse_from(["pvc-undelete"]).is_err());
    }
}
