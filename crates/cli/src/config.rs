//! Configuration resolution: command line and environment (clap) over the
//! yaml configuration file over built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::Cli;

const DEFAULT_CONFIG_FILE: &str = "/etc/katafygio/katafygio.yaml";
const DEFAULT_LOCAL_DIR: &str = "./kubernetes-backup";
const DEFAULT_RESYNC_SECS: u64 = 900;
const DEFAULT_CHECK_SECS: u64 = 10;
const DEFAULT_GIT_TIMEOUT_SECS: u64 = 300;
const COMMIT_MESSAGE: &str = "Kubernetes cluster change";
/// GC cadence used when periodic resyncs are disabled; the sweep must still
/// happen eventually.
const FALLBACK_GC_SECS: u64 = 2 * DEFAULT_RESYNC_SECS;

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_server: Option<String>,
    pub context: Option<String>,
    pub namespace: Option<String>,
    pub kube_config: Option<PathBuf>,
    pub dry_run: bool,
    pub dump_only: bool,
    pub log_level: String,
    pub log_output: String,
    pub log_server: Option<String>,
    pub local_dir: PathBuf,
    pub git_url: Option<String>,
    pub git_timeout: Duration,
    pub git_author: String,
    pub git_email: String,
    pub git_message: String,
    pub no_git: bool,
    pub exclude_kind: Vec<String>,
    pub exclude_object: Vec<String>,
    pub filter: Option<String>,
    pub healthcheck_port: u16,
    /// `None` disables periodic relists.
    pub resync: Option<Duration>,
    pub gc_interval: Duration,
    pub check_interval: Duration,
}

/// Optional overlay read from the yaml configuration file. Log settings live
/// in their own section, everything else mirrors the flag names.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileConfig {
    pub api_server: Option<String>,
    pub context: Option<String>,
    pub namespace: Option<String>,
    pub kube_config: Option<PathBuf>,
    pub dry_run: Option<bool>,
    pub dump_only: Option<bool>,
    pub log: LogSection,
    pub local_dir: Option<PathBuf>,
    pub git_url: Option<String>,
    pub git_timeout: Option<u64>,
    pub git_author: Option<String>,
    pub git_email: Option<String>,
    pub no_git: Option<bool>,
    pub exclude_kind: Option<Vec<String>>,
    pub exclude_object: Option<Vec<String>>,
    pub filter: Option<String>,
    pub healthcheck_port: Option<u16>,
    pub resync_interval: Option<u64>,
    pub check_interval: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct LogSection {
    pub level: Option<String>,
    pub output: Option<String>,
    pub server: Option<String>,
}

impl Settings {
    /// Load the configuration file (when present) and merge it under the
    /// command line.
    pub fn load(cli: Cli) -> Result<Settings> {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let file = read_file(&path)?;
        Ok(Self::resolve(cli, file))
    }

    fn resolve(cli: Cli, file: FileConfig) -> Settings {
        let resync_secs = cli
            .resync_interval
            .or(file.resync_interval)
            .unwrap_or(DEFAULT_RESYNC_SECS);
        let gc_secs = if resync_secs > 0 { 2 * resync_secs } else { FALLBACK_GC_SECS };

        Settings {
            api_server: nonempty(cli.api_server.or(file.api_server)),
            context: nonempty(cli.context.or(file.context)),
            namespace: nonempty(cli.namespace.or(file.namespace)),
            kube_config: cli.kube_config.or(file.kube_config),
            dry_run: cli.dry_run || file.dry_run.unwrap_or(false),
            dump_only: cli.dump_only || file.dump_only.unwrap_or(false),
            log_level: cli.log_level.or(file.log.level).unwrap_or_else(|| "info".into()),
            log_output: cli.log_output.or(file.log.output).unwrap_or_else(|| "stderr".into()),
            log_server: nonempty(cli.log_server.or(file.log.server)),
            local_dir: cli
                .local_dir
                .or(file.local_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_DIR)),
            git_url: nonempty(cli.git_url.or(file.git_url)),
            git_timeout: Duration::from_secs(
                cli.git_timeout.or(file.git_timeout).unwrap_or(DEFAULT_GIT_TIMEOUT_SECS),
            ),
            git_author: cli.git_author.or(file.git_author).unwrap_or_else(|| "Katafygio".into()),
            git_email: cli
                .git_email
                .or(file.git_email)
                .unwrap_or_else(|| "katafygio@localhost".into()),
            git_message: COMMIT_MESSAGE.into(),
            no_git: cli.no_git || file.no_git.unwrap_or(false),
            exclude_kind: pick_list(cli.exclude_kind, file.exclude_kind),
            exclude_object: pick_list(cli.exclude_object, file.exclude_object),
            filter: nonempty(cli.filter.or(file.filter)),
            healthcheck_port: cli.healthcheck_port.or(file.healthcheck_port).unwrap_or(0),
            resync: (resync_secs > 0).then(|| Duration::from_secs(resync_secs)),
            gc_interval: Duration::from_secs(gc_secs),
            check_interval: Duration::from_secs(
                cli.check_interval.or(file.check_interval).unwrap_or(DEFAULT_CHECK_SECS),
            ),
        }
    }
}

fn nonempty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}

fn pick_list(cli: Vec<String>, file: Option<Vec<String>>) -> Vec<String> {
    if !cli.is_empty() {
        cli
    } else {
        file.unwrap_or_default()
    }
}

/// Parse the configuration file. A missing file is fine; an unparsable one is
/// a startup failure.
fn read_file(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_flags_or_file() {
        let s = Settings::resolve(Cli::default(), FileConfig::default());
        assert_eq!(s.local_dir, PathBuf::from("./kubernetes-backup"));
        assert_eq!(s.log_level, "info");
        assert_eq!(s.log_output, "stderr");
        assert_eq!(s.git_author, "Katafygio");
        assert_eq!(s.git_email, "katafygio@localhost");
        assert_eq!(s.git_timeout, Duration::from_secs(300));
        assert_eq!(s.healthcheck_port, 0);
        assert_eq!(s.resync, Some(Duration::from_secs(900)));
        assert_eq!(s.gc_interval, Duration::from_secs(1800));
        assert_eq!(s.check_interval, Duration::from_secs(10));
        assert!(!s.dry_run && !s.dump_only && !s.no_git);
        assert!(s.git_url.is_none());
    }

    #[test]
    fn flags_win_over_file() {
        let cli = Cli {
            local_dir: Some(PathBuf::from("/tmp/dump")),
            resync_interval: Some(60),
            exclude_kind: vec!["secret".into()],
            ..Default::default()
        };
        let file: FileConfig = serde_yaml::from_str(
            "local-dir: /var/lib/katafygio\nresync-interval: 300\nexclude-kind: [configmap]\n",
        )
        .unwrap();
        let s = Settings::resolve(cli, file);
        assert_eq!(s.local_dir, PathBuf::from("/tmp/dump"));
        assert_eq!(s.resync, Some(Duration::from_secs(60)));
        assert_eq!(s.gc_interval, Duration::from_secs(120));
        assert_eq!(s.exclude_kind, vec!["secret".to_string()]);
    }

    #[test]
    fn file_values_apply_when_flags_are_absent() {
        let file: FileConfig = serde_yaml::from_str(
            "git-url: git@example.com:backup.git\nlog:\n  level: debug\n  output: stdout\nnamespace: prod\n",
        )
        .unwrap();
        let s = Settings::resolve(Cli::default(), file);
        assert_eq!(s.git_url.as_deref(), Some("git@example.com:backup.git"));
        assert_eq!(s.log_level, "debug");
        assert_eq!(s.log_output, "stdout");
        assert_eq!(s.namespace.as_deref(), Some("prod"));
    }

    #[test]
    fn zero_resync_disables_relists_but_not_gc() {
        let cli = Cli { resync_interval: Some(0), ..Default::default() };
        let s = Settings::resolve(cli, FileConfig::default());
        assert_eq!(s.resync, None);
        assert_eq!(s.gc_interval, Duration::from_secs(1800));
    }

    #[test]
    fn empty_strings_mean_unset() {
        let cli = Cli { api_server: Some(String::new()), git_url: Some(String::new()), ..Default::default() };
        let s = Settings::resolve(cli, FileConfig::default());
        assert!(s.api_server.is_none());
        assert!(s.git_url.is_none());
    }

    #[test]
    fn bad_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!(
            "katafygio-conf-{}",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("katafygio.yaml");
        std::fs::write(&path, "local-dir: [not: a: path\n").unwrap();
        assert!(read_file(&path).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_is_fine() {
        let cfg = read_file(Path::new("/nonexistent/katafygio.yaml")).unwrap();
        assert!(cfg.local_dir.is_none());
    }
}
