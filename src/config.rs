use crate::error::ErrorLog;
use crate::output::OutputMode;
use crate::process::StderrTarget;
use anyhow::Context;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Variables worth passing through to the executable on each platform
/// (dynamic linker search paths, Windows system locations).
const PLATFORM_INHERIT_ENV: &[(&str, &[&str])] = &[
    ("macos", &["DYLD_LIBRARY_PATH"]),
    ("freebsd", &["LD_LIBRARY_PATH"]),
    ("linux", &["LD_LIBRARY_PATH"]),
    ("openbsd", &["LD_LIBRARY_PATH"]),
    ("netbsd", &["LD_LIBRARY_PATH"]),
    ("solaris", &["LD_LIBRARY_PATH", "LD_LIBRARY_PATH_32", "LD_LIBRARY_PATH_64"]),
    ("illumos", &["LD_LIBRARY_PATH", "LD_LIBRARY_PATH_32", "LD_LIBRARY_PATH_64"]),
    ("windows", &["SystemRoot", "COMSPEC", "PATHEXT", "WINDIR"]),
];

/// Default inherited variable names for an OS name as reported by `std::env::consts::OS`
pub fn platform_inherit_env(os: &str) -> &'static [&'static str] {
    PLATFORM_INHERIT_ENV
        .iter()
        .find(|(name, _)| *name == os)
        .map(|(_, vars)| *vars)
        .unwrap_or(&[])
}

/// Everything a gateway needs to serve requests.
///
/// Built once and shared read-only by all requests. `default_headers` in
/// particular is only ever copied, never modified, while serving.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Executable as configured; also reported as `SCRIPT_FILENAME`
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Working directory; defaults to the executable's directory
    pub dir: Option<PathBuf>,
    /// URL prefix reported as `SCRIPT_NAME` and stripped from `PATH_INFO`
    pub root: String,
    /// Reported as `SERVER_SOFTWARE`
    pub software_name: String,
    /// Host variables passed through when set and non-empty
    pub inherit_env: Vec<String>,
    /// Variables set explicitly, after everything else
    pub extra_env: Vec<(String, String)>,
    pub default_headers: HeaderMap,
    pub output_mode: OutputMode,
    pub stderr: StderrTarget,
    /// Request deadline; the subprocess is killed when it expires
    pub timeout: Option<Duration>,
    /// Error destination; `tracing` when unset
    pub error_log: Option<Arc<dyn ErrorLog>>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("executable", &self.executable)
            .field("args", &self.args)
            .field("dir", &self.dir)
            .field("root", &self.root)
            .field("software_name", &self.software_name)
            .field("inherit_env", &self.inherit_env)
            .field("extra_env", &self.extra_env)
            .field("default_headers", &self.default_headers)
            .field("output_mode", &self.output_mode)
            .field("stderr", &self.stderr)
            .field("timeout", &self.timeout)
            .field("error_log", &self.error_log.is_some())
            .finish()
    }
}

impl GatewayConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            dir: None,
            root: "/".to_string(),
            software_name: env!("CARGO_PKG_NAME").to_string(),
            inherit_env: Vec::new(),
            extra_env: Vec::new(),
            default_headers: default_headers(),
            output_mode: OutputMode::default(),
            stderr: StderrTarget::default(),
            timeout: None,
            error_log: None,
        }
    }

    /// Run `command` through `shell -c`
    pub fn shell(shell: impl Into<PathBuf>, command: &str) -> Self {
        Self::new(shell).with_args(vec!["-c".to_string(), command.to_string()])
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_root(mut self, root: &str) -> Self {
        self.root = root.to_string();
        self
    }

    pub fn with_software_name(mut self, name: &str) -> Self {
        self.software_name = name.to_string();
        self
    }

    pub fn with_inherit_env(mut self, names: Vec<String>) -> Self {
        self.inherit_env = names;
        self
    }

    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        self.extra_env.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    pub fn with_stderr(mut self, stderr: StderrTarget) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_error_log(mut self, log: Arc<dyn ErrorLog>) -> Self {
        self.error_log = Some(log);
        self
    }

    /// `SCRIPT_NAME`; an empty root means `/`
    pub fn root(&self) -> &str {
        if self.root.is_empty() {
            "/"
        } else {
            &self.root
        }
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers
}

/// Parse a `Key: Value` header line
pub fn parse_header_line(line: &str) -> anyhow::Result<(HeaderName, HeaderValue)> {
    let (key, value) = line
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid header: {}", line))?;
    let name = HeaderName::from_bytes(key.trim().as_bytes())
        .with_context(|| format!("invalid header name in {:?}", line))?;
    let value = HeaderValue::from_str(value.trim())
        .with_context(|| format!("invalid header value in {:?}", line))?;
    Ok((name, value))
}

/// File configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub gateway: GatewaySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Enable TLS. Without cert/key files a self-signed certificate is generated.
    #[serde(default)]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Suppress gateway error messages
    #[serde(default)]
    pub quiet: bool,

    /// Time given to in-flight connections on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls || self.has_tls_files()
    }

    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            tls: false,
            tls_cert: None,
            tls_key: None,
            quiet: false,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// The `[gateway]` table
///
/// # Security Warning
///
/// `executable`, `command` and `args` are executed for every request with the
/// permissions of the gateway process. Protect configuration files accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewaySettings {
    /// Executable to run for each request
    pub executable: Option<String>,

    /// Arguments for the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Full command line, split shell-style, or run through `shell` when
    /// `shell_command` is set
    pub command: Option<String>,

    /// Interpret `command` (or `executable`) as a shell command
    #[serde(default)]
    pub shell_command: bool,

    /// Shell used for shell commands
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Working directory for the executable
    pub dir: Option<String>,

    /// URL prefix stripped from PATH_INFO
    #[serde(default = "default_root")]
    pub root: String,

    /// SERVER_SOFTWARE value
    pub software_name: Option<String>,

    /// Host variables passed through to the executable
    #[serde(default)]
    pub inherit_env: Vec<String>,

    /// Variables set explicitly for the executable
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Default response headers, `Key: Value`
    #[serde(default)]
    pub headers: Vec<String>,

    /// Output interpretation: verbatim, replace or cgi
    #[serde(default)]
    pub mode: OutputMode,

    /// stderr destination: inherit, null, log, or a file path
    pub stderr: Option<String>,

    /// Request deadline in seconds (default: none)
    pub timeout_secs: Option<u64>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            command: None,
            shell_command: false,
            shell: default_shell(),
            dir: None,
            root: default_root(),
            software_name: None,
            inherit_env: Vec::new(),
            env: BTreeMap::new(),
            headers: Vec::new(),
            mode: OutputMode::default(),
            stderr: None,
            timeout_secs: None,
        }
    }
}

impl GatewaySettings {
    /// Resolve the program and its arguments
    pub fn command_line(&self) -> anyhow::Result<(String, Vec<String>)> {
        if self.shell_command {
            let command = self
                .command
                .as_deref()
                .or(self.executable.as_deref())
                .ok_or_else(|| anyhow::anyhow!("shell_command requires a command"))?;
            return Ok((self.shell.clone(), vec!["-c".to_string(), command.to_string()]));
        }

        if let Some(ref executable) = self.executable {
            return Ok((executable.clone(), self.args.clone()));
        }

        if let Some(ref command) = self.command {
            let mut words = shell_words::split(command)
                .with_context(|| format!("cannot parse command {:?}", command))?;
            if words.is_empty() {
                anyhow::bail!("command is empty");
            }
            let program = words.remove(0);
            words.extend(self.args.iter().cloned());
            return Ok((program, words));
        }

        anyhow::bail!("no executable configured")
    }

    /// Build the runtime gateway configuration. `os` selects the platform's
    /// default inherited variables.
    pub fn build(&self, os: &str) -> anyhow::Result<GatewayConfig> {
        let (program, args) = self.command_line()?;

        let mut config = GatewayConfig::new(program)
            .with_args(args)
            .with_root(&self.root)
            .with_output_mode(self.mode);

        if let Some(ref dir) = self.dir {
            config = config.with_dir(dir);
        }
        if let Some(ref name) = self.software_name {
            config = config.with_software_name(name);
        }

        let mut inherit: Vec<String> = platform_inherit_env(os).iter().map(|s| s.to_string()).collect();
        for name in &self.inherit_env {
            if !inherit.contains(name) {
                inherit.push(name.clone());
            }
        }
        config.inherit_env = inherit;
        config.extra_env = self.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        if !self.headers.is_empty() {
            let mut headers = HeaderMap::new();
            for line in &self.headers {
                let (name, value) = parse_header_line(line)?;
                headers.insert(name, value);
            }
            config.default_headers = headers;
        }

        if let Some(ref target) = self.stderr {
            config.stderr = StderrTarget::parse(target)
                .with_context(|| format!("cannot open stderr target {:?}", target))?;
        }

        config.timeout = self.timeout_secs.filter(|&s| s > 0).map(Duration::from_secs);

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Err(e) = self.command_line() {
            return Err(e.to_string());
        }
        if !self.root.is_empty() && !self.root.starts_with('/') {
            return Err(format!("root '{}' must start with '/'", self.root));
        }
        for line in &self.headers {
            if let Err(e) = parse_header_line(line) {
                return Err(format!("{:#}", e));
            }
        }
        for name in self.env.keys() {
            if name.is_empty() || name.contains('=') {
                return Err(format!("invalid environment variable name {:?}", name));
            }
        }
        Ok(())
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_root() -> String {
    "/".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.gateway.validate() {
            errors.push(e);
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("tls_cert and tls_key must be given together".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
