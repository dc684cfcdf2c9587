use clap::{Arg, ArgMatches, Command};
use docksentinel::config::DEFAULT_CONFIG_PATH;
use docksentinel::scheduler::models::ScanMode;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Daemon,
    ScanOnce(ScanMode),
    Check(String),
}

pub struct Cli {
    pub config: PathBuf,
    pub action: Action,
}

impl From<ArgMatches> for Cli {
    fn from(matches: ArgMatches) -> Self {
        let action = if let Some(name) = matches.get_one::<String>("check") {
            Action::Check(name.clone())
        } else if let Some(mode) = matches.get_one::<ScanMode>("scan_once") {
            Action::ScanOnce(*mode)
        } else {
            Action::Daemon
        };
        Cli {
            config: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            action,
        }
    }
}

fn command() -> Command {
    Command::new("docksentinel")
        .version(env!("CARGO_PKG_VERSION"))
        .about("keep containers on their latest image, with health gated rollback")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help(format!("Configuration file (default: {DEFAULT_CONFIG_PATH})"))
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("scan_once")
                .long("scan-once")
                .help("Run a single scan, wait for queued updates and exit")
                .value_name("MODE")
                .num_args(0..=1)
                .default_missing_value("scan_only")
                .value_parser(|value: &str| value.parse::<ScanMode>().map_err(|e| e.to_string()))
                .conflicts_with("check"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .help("Print the update check of one container as JSON and exit")
                .value_name("NAME"),
        )
}

pub(crate) fn configure_cli() -> Cli {
    command().get_matches().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        command().get_matches_from(args).into()
    }

    #[test]
    fn test_defaults_to_daemon() {
        let cli = parse(&["docksentinel"]);
        assert_eq!(cli.action, Action::Daemon);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_scan_once_mode() {
        let cli = parse(&["docksentinel", "--scan-once"]);
        assert_eq!(cli.action, Action::ScanOnce(ScanMode::ScanOnly));
        let cli = parse(&["docksentinel", "-c", "/etc/ds.toml", "--scan-once", "scan_and_update"]);
        assert_eq!(cli.action, Action::ScanOnce(ScanMode::ScanAndUpdate));
        assert_eq!(cli.config, PathBuf::from("/etc/ds.toml"));
    }

    #[test]
    fn test_rejects_unknown_mode() {
        assert!(
            command()
                .try_get_matches_from(["docksentinel", "--scan-once", "everything"])
                .is_err()
        );
    }

    #[test]
    fn test_check() {
        let cli = parse(&["docksentinel", "--check", "web"]);
        assert_eq!(cli.action, Action::Check("web".to_string()));
    }
}
