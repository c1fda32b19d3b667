use crate::config::loader::FileConfig;
use crate::config::types::{
    parse_mount_list, BootstrapConfig, NetworkMode, PlatformPreference, Result as RunkResult,
};
use crate::exec::bootstrap::{self, Collaborators};
use crate::exec::process_state;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Run one process inside a sandbox built from host directories.
#[derive(Parser, Debug)]
#[command(name = "runk", author, version, about, long_about = None)]
pub struct Cli {
    /// Use the host network stack instead of the emulated one
    #[arg(long)]
    pub hostnet: bool,

    /// Share the invoking terminal with the sandboxed process
    #[arg(long)]
    pub tty: bool,

    /// Comma-separated host directories for the root filesystem, lowest
    /// priority first [default: rootfs]
    #[arg(long, value_name = "DIRS")]
    pub mounts: Option<String>,

    /// Execution backend [default: auto]
    #[arg(long, value_name = "auto|kvm|ptrace")]
    pub platform: Option<PlatformPreference>,

    /// Hostname inside the sandbox [default: runk]
    #[arg(long)]
    pub hostname: Option<String>,

    /// Environment entry for the sandboxed process (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// JSON configuration file; flags given on the command line win
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `runk=debug` (RUST_LOG takes precedence)
    #[arg(long, value_name = "FILTER")]
    pub log_level: Option<String>,

    /// Command and arguments to run in the sandbox
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub args: Vec<String>,
}

impl Cli {
    /// Merge defaults, the config file and the flags, in that order.
    pub fn into_config(self) -> RunkResult<BootstrapConfig> {
        let mut config = BootstrapConfig::default();
        if let Some(path) = &self.config {
            config = FileConfig::load_from_file(path)?.apply(config);
        }

        if self.hostnet {
            config.network = NetworkMode::Host;
        }
        if self.tty {
            config.tty = true;
        }
        if let Some(mounts) = &self.mounts {
            config.mounts = parse_mount_list(mounts);
        }
        if let Some(platform) = self.platform {
            config.platform = platform;
        }
        if let Some(hostname) = self.hostname {
            config.container_id = hostname.clone();
            config.hostname = hostname;
        }
        if !self.env.is_empty() {
            config.env = self.env;
        }
        if !self.args.is_empty() {
            config.args = self.args;
        }
        Ok(config)
    }
}

/// Parse the command line, bootstrap the sandbox and return the exit code
/// of the sandboxed process.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    process_state::initialize_process_wide_state(cli.log_level.as_deref())
        .context("process initialisation failed")?;

    let config = cli.into_config()?;
    log::debug!("Bootstrap config: {:?}", config);

    let collaborators = Collaborators::host(&config)?;
    let outcome = bootstrap::run(&config, &collaborators)?;

    log::info!(
        "Run {} on {}: {}",
        outcome.run_id,
        outcome.platform,
        outcome.exit_status
    );
    Ok(outcome.exit_status.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("runk").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["/bin/true"]).into_config().unwrap();
        assert_eq!(config.mounts, vec![PathBuf::from("rootfs")]);
        assert_eq!(config.network, NetworkMode::None);
        assert_eq!(config.platform, PlatformPreference::Auto);
        assert!(!config.tty);
        assert_eq!(config.args, vec!["/bin/true"]);
    }

    #[test]
    fn test_flags() {
        let config = parse(&[
            "--hostnet",
            "--tty",
            "--mounts",
            "base, overlay,,top",
            "--platform",
            "ptrace",
            "--env",
            "A=1",
            "--env",
            "B=2",
            "sh",
            "-c",
            "exit 3",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.network, NetworkMode::Host);
        assert!(config.tty);
        assert_eq!(
            config.mounts,
            vec![PathBuf::from("base"), PathBuf::from("overlay"), PathBuf::from("top")]
        );
        assert_eq!(config.platform, PlatformPreference::Ptrace);
        assert_eq!(config.env, vec!["A=1", "B=2"]);
        assert_eq!(config.args, vec!["sh", "-c", "exit 3"]);
    }

    #[test]
    fn test_bad_platform_rejected() {
        assert!(Cli::try_parse_from(["runk", "--platform", "xen", "true"]).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mounts": ["from-file"], "network": "host", "hostname": "filehost", "args": ["file-cmd"]}}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let config = parse(&["--config", path, "--hostname", "clihost"])
            .into_config()
            .unwrap();
        assert_eq!(config.mounts, vec![PathBuf::from("from-file")]);
        assert_eq!(config.network, NetworkMode::Host);
        assert_eq!(config.hostname, "clihost");
        assert_eq!(config.container_id, "clihost");
        assert_eq!(config.args, vec!["file-cmd"]);

        let config = parse(&["--config", path, "--mounts", "cli", "cli-cmd"])
            .into_config()
            .unwrap();
        assert_eq!(config.mounts, vec![PathBuf::from("cli")]);
        assert_eq!(config.args, vec!["cli-cmd"]);
    }

    #[test]
    fn test_missing_config_file() {
        assert!(parse(&["--config", "/no/such/runk.json", "true"])
            .into_config()
            .is_err());
    }
}
