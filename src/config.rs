use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fixed port for the plaintext listener.
pub const HTTP_PORT: u16 = 8080;
/// Fixed port for the TLS listener.
pub const HTTPS_PORT: u16 = 4430;

/// Environment variable carrying the resources root (spawn contract).
pub const RESOURCES_ENV: &str = "LAUNCHGATE_RESOURCES";
/// Environment variable set to "1" when running from a packaged layout.
pub const PACKAGED_ENV: &str = "LAUNCHGATE_PACKAGED";
/// Development/test overrides for the fixed listener ports.
pub const HTTP_PORT_ENV: &str = "LAUNCHGATE_HTTP_PORT";
pub const HTTPS_PORT_ENV: &str = "LAUNCHGATE_HTTPS_PORT";

/// The domain family the gateway serves. Responses for any hostname in this
/// family get the permissive CORS policy.
pub const DOMAIN_FAMILY: &str = "construct.net";

/// Hostname used when a request matches no configured virtual host.
pub const DEFAULT_HOST: &str = "editor.construct.net";

/// Served hostnames, each mapping to `resources/domains/<hostname>/` and an
/// `https://<hostname>` origin. The preview host also answers for loopback
/// names, matching how the launcher's preview windows address it.
const SERVED_HOSTS: &[(&str, &[&str])] = &[
    ("editor.construct.net", &[]),
    ("preview.construct.net", &["localhost", "127.0.0.1"]),
    ("account.construct.net", &[]),
    ("stats.construct.net", &[]),
];

/// One hostname-keyed routing unit: a local asset directory plus the remote
/// origin used when no local asset satisfies a request.
#[derive(Debug, Clone)]
pub struct VirtualHost {
    /// Canonical hostname, lowercase
    pub hostname: String,
    /// Additional hostnames that resolve to this virtual host
    pub aliases: Vec<String>,
    /// Directory holding bundled static assets for this host
    pub asset_dir: PathBuf,
    /// Remote origin URL (no trailing slash) for the fallback proxy
    pub origin: String,
}

/// Paths to the TLS material under the resources root.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub ca: PathBuf,
}

/// Runtime configuration for the gateway process.
///
/// The supervisor passes the resources root and packaged flag through the
/// environment (see [`RESOURCES_ENV`] / [`PACKAGED_ENV`]); everything else is
/// derived from them. Ports are fixed constants with an environment override
/// for development and tests.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Root directory the asset and certificate paths are derived from
    pub resources_root: PathBuf,
    /// Packaged-vs-development layout flag (affects only path reporting)
    pub packaged: bool,
    /// Bind address for both listeners
    pub bind: String,
    pub http_port: u16,
    pub https_port: u16,
}

impl GatewayConfig {
    pub fn new(resources_root: impl Into<PathBuf>) -> Self {
        Self {
            resources_root: resources_root.into(),
            packaged: false,
            bind: "127.0.0.1".to_string(),
            http_port: HTTP_PORT,
            https_port: HTTPS_PORT,
        }
    }

    /// Build the configuration from the spawn-contract environment.
    pub fn from_env() -> Self {
        let resources_root = std::env::var(RESOURCES_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let mut config = Self::new(resources_root);
        config.packaged = std::env::var(PACKAGED_ENV).as_deref() == Ok("1");

        if let Some(port) = env_port(HTTP_PORT_ENV) {
            config.http_port = port;
        }
        if let Some(port) = env_port(HTTPS_PORT_ENV) {
            config.https_port = port;
        }

        config
    }

    /// Directory holding per-host static asset directories.
    pub fn domains_root(&self) -> PathBuf {
        self.resources_root.join("resources").join("domains")
    }

    /// Directory holding the TLS material.
    pub fn certs_dir(&self) -> PathBuf {
        self.resources_root.join("resources").join("certs")
    }

    /// Well-known TLS material paths under the certs directory.
    pub fn tls_paths(&self) -> TlsPaths {
        let dir = self.certs_dir();
        TlsPaths {
            key: dir.join("server.key"),
            cert: dir.join("server.crt"),
            ca: dir.join("rootCA.crt"),
        }
    }

    /// The built-in virtual host table, rooted at this config's domains dir.
    pub fn virtual_hosts(&self) -> Vec<VirtualHost> {
        let domains_root = self.domains_root();
        SERVED_HOSTS
            .iter()
            .map(|(hostname, aliases)| VirtualHost {
                hostname: hostname.to_string(),
                aliases: aliases.iter().map(|a| a.to_string()).collect(),
                asset_dir: domains_root.join(hostname),
                origin: format!("https://{}", hostname),
            })
            .collect()
    }
}

fn env_port(var: &str) -> Option<u16> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

/// Top-level configuration for the supervisor binary.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Port for the local control API
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Authentication token for control API write operations.
    /// If not set, a random token is generated at startup and logged.
    pub control_token: Option<String>,

    /// Gateway executable to spawn. Defaults to the `launchgate-gateway`
    /// binary next to the running executable.
    pub gateway_command: Option<String>,

    /// Extra arguments passed to the gateway executable
    #[serde(default)]
    pub gateway_args: Vec<String>,

    /// Resources root handed to the gateway (also its working directory)
    #[serde(default = "default_resources_root")]
    pub resources_root: PathBuf,

    /// Whether the gateway runs from a packaged layout
    #[serde(default)]
    pub packaged: bool,

    /// Seconds to wait for the readiness marker before failing a start
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            control_port: default_control_port(),
            control_token: None,
            gateway_command: None,
            gateway_args: Vec::new(),
            resources_root: default_resources_root(),
            packaged: false,
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Resolve the gateway executable path, falling back to the sibling
    /// `launchgate-gateway` binary.
    pub fn resolve_gateway_command(&self) -> PathBuf {
        if let Some(ref command) = self.gateway_command {
            return PathBuf::from(command);
        }
        let mut path = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("launchgate"));
        path.pop();
        path.push("launchgate-gateway");
        path
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
        Ok(config)
    }
}

fn default_control_port() -> u16 {
    7770
}

fn default_resources_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_derivation() {
        let config = GatewayConfig::new("/opt/launcher");
        assert_eq!(
            config.domains_root(),
            PathBuf::from("/opt/launcher/resources/domains")
        );

        let tls = config.tls_paths();
        assert_eq!(
            tls.key,
            PathBuf::from("/opt/launcher/resources/certs/server.key")
        );
        assert_eq!(
            tls.cert,
            PathBuf::from("/opt/launcher/resources/certs/server.crt")
        );
        assert_eq!(
            tls.ca,
            PathBuf::from("/opt/launcher/resources/certs/rootCA.crt")
        );
    }

    #[test]
    fn test_virtual_host_table() {
        let config = GatewayConfig::new("/res");
        let hosts = config.virtual_hosts();

        assert_eq!(hosts.len(), 4);
        assert!(hosts.iter().any(|h| h.hostname == DEFAULT_HOST));

        let editor = hosts.iter().find(|h| h.hostname == DEFAULT_HOST).unwrap();
        assert_eq!(editor.origin, "https://editor.construct.net");
        assert_eq!(
            editor.asset_dir,
            PathBuf::from("/res/resources/domains/editor.construct.net")
        );

        let preview = hosts
            .iter()
            .find(|h| h.hostname == "preview.construct.net")
            .unwrap();
        assert!(preview.aliases.contains(&"localhost".to_string()));
        assert!(preview.aliases.contains(&"127.0.0.1".to_string()));
    }

    #[test]
    fn test_fixed_ports() {
        let config = GatewayConfig::new(".");
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.https_port, 4430);
    }

    #[test]
    fn test_supervisor_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.control_port, 7770);
        assert_eq!(config.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.shutdown_grace_period(), Duration::from_secs(5));
        assert!(config.gateway_command.is_none());
    }

    #[test]
    fn test_parse_supervisor_config() {
        let toml_str = r#"
            [supervisor]
            control_port = 9000
            control_token = "secret"
            gateway_command = "/usr/bin/launchgate-gateway"
            resources_root = "/opt/launcher"
            packaged = true
            startup_timeout_secs = 10
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.supervisor.control_port, 9000);
        assert_eq!(config.supervisor.control_token.as_deref(), Some("secret"));
        assert!(config.supervisor.packaged);
        assert_eq!(config.supervisor.startup_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.supervisor.resolve_gateway_command(),
            PathBuf::from("/usr/bin/launchgate-gateway")
        );
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let config = Config::load("/definitely/not/here/launchgate.toml").unwrap();
        assert_eq!(config.supervisor.control_port, 7770);
    }
}
