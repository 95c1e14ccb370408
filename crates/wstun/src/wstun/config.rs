use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::wstun::{
    net,
    tunnel::{
        handshake::RelayOptions,
        outbound::{ConnectorOptions, UdpIdlePolicy},
    },
};

const CONFIG_ENV: &str = "WSTUN_CONFIG";
const CANDIDATES: [&str; 3] = ["wstun.toml", "wstun.yaml", "wstun.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Picks the config file: `--config`, then `WSTUN_CONFIG`, then `wstun.*` in the working
/// directory, then the OS default location.
pub fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = flag {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join(CANDIDATES[0])));
        }
        return Ok(p.to_path_buf());
    }

    // Not there yet: it will be created, as TOML unless told otherwise.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).is_ok_and(|m| m.is_file()))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/wstun/wstun.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "wstun", "wstun")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join(CANDIDATES[0]))
    }
}

/// Writes the commented default config if nothing exists at `path`. Returns whether it did.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = match extension(path).as_str() {
        "toml" => DEFAULT_CONFIG_TEMPLATE_TOML,
        "yaml" | "yml" => DEFAULT_CONFIG_TEMPLATE_YAML,
        other => anyhow::bail!("config: unsupported config extension {other:?} (expected .toml or .yaml/.yml)"),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;

    let fc: FileConfig = match extension(path).as_str() {
        "toml" => toml::from_str(&data).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&data).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {other}"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// WebSocket path filter; empty accepts any path.
    pub path: String,
    pub admin_addr: Option<SocketAddr>,
    pub logging: LoggingConfig,
    pub buffer_size: usize,
    pub max_handshake_bytes: usize,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub handshake: Duration,
    pub connect: Duration,
    pub udp_idle: Duration,
    pub udp_idle_check: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub add_source: bool,
}

impl Config {
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            connector: ConnectorOptions {
                connect_timeout: self.timeouts.connect,
                read_buffer_size: self.buffer_size,
                udp_idle: UdpIdlePolicy {
                    timeout: self.timeouts.udp_idle,
                    check_interval: self.timeouts.udp_idle_check,
                },
            },
            handshake_timeout: self.timeouts.handshake,
            max_handshake_bytes: self.max_handshake_bytes,
        }
    }

    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let listen = fc.listen_addr.as_deref().map(str::trim).unwrap_or("");
        let listen_addr = net::parse_bind_addr(if listen.is_empty() { ":3000" } else { listen })
            .context("config: listen_addr")?;

        let admin = fc.admin_addr.trim();
        let admin_addr = if admin.is_empty() {
            None
        } else {
            Some(net::parse_bind_addr(admin).context("config: admin_addr")?)
        };

        let mut path = fc.path.trim().to_string();
        if !path.is_empty() && !path.starts_with('/') {
            path.insert(0, '/');
        }

        let t = fc.timeouts.unwrap_or_default();
        let timeouts = Timeouts {
            handshake: millis(t.handshake_timeout_ms, 10_000),
            connect: millis(t.connect_timeout_ms, 10_000),
            udp_idle: millis(t.udp_idle_timeout_ms, 30_000),
            udp_idle_check: millis(t.udp_idle_check_interval_ms, 10_000),
        };

        let l = fc.logging.unwrap_or_default();
        let logging = LoggingConfig {
            level: non_empty(l.level).unwrap_or_else(|| "info".into()),
            format: match non_empty(l.format).as_deref().map(str::to_ascii_lowercase).as_deref() {
                None | Some("json") => LogFormat::Json,
                Some("text") => LogFormat::Text,
                Some(other) => anyhow::bail!("config: logging.format must be text or json, got {other:?}"),
            },
            output: match non_empty(l.output).as_deref() {
                None | Some("stderr") => LogOutput::Stderr,
                Some("stdout") => LogOutput::Stdout,
                Some("discard") => LogOutput::Discard,
                Some(file) => LogOutput::File(PathBuf::from(file)),
            },
            add_source: l.add_source,
        };

        Ok(Config {
            listen_addr,
            path,
            admin_addr,
            logging,
            buffer_size: positive(fc.buffer_size, 32 * 1024),
            max_handshake_bytes: positive(fc.max_handshake_bytes, 64 * 1024),
            timeouts,
        })
    }
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

fn positive(v: i64, default: usize) -> usize {
    if v > 0 { v as usize } else { default }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<String>,

    #[serde(default)]
    path: String,

    #[serde(default)]
    admin_addr: String,

    #[serde(default)]
    buffer_size: i64,

    #[serde(default)]
    max_handshake_bytes: i64,

    logging: Option<FileLogging>,

    timeouts: Option<FileTimeouts>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    handshake_timeout_ms: Option<i64>,
    connect_timeout_ms: Option<i64>,
    udp_idle_timeout_ms: Option<i64>,
    udp_idle_check_interval_ms: Option<i64>,
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# wstun configuration (auto-generated)
#
# Created because no configuration file existed at the resolved path.
# Clients connect over WebSocket to listen_addr and relay TCP/UDP through it.

listen_addr = ":3000"

# Only accept WebSocket upgrades on this path. Empty accepts any path.
path = ""

# Admin API (/health, /metrics, /conns). Empty disables it.
admin_addr = ""

[logging]
level = "info"
format = "json"    # json | text
output = "stderr"  # stderr | stdout | discard | <file path>
add_source = false

[timeouts]
handshake_timeout_ms = 10000
connect_timeout_ms = 10000
udp_idle_timeout_ms = 30000
udp_idle_check_interval_ms = 10000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# wstun configuration (auto-generated)
#
# Created because no configuration file existed at the resolved path.
# Clients connect over WebSocket to listen_addr and relay TCP/UDP through it.

listen_addr: ":3000"

# Only accept WebSocket upgrades on this path. Empty accepts any path.
path: ""

# Admin API (/health, /metrics, /conns). Empty disables it.
admin_addr: ""

logging:
  level: "info"
  format: "json"    # json | text
  output: "stderr"  # stderr | stdout | discard | <file path>
  add_source: false

timeouts:
  handshake_timeout_ms: 10000
  connect_timeout_ms: 10000
  udp_idle_timeout_ms: 30000
  udp_idle_check_interval_ms: 10000
"#;
