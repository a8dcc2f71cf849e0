use crate::config::Config;
use crate::output::OutputMode;
use clap::Parser;
use std::path::PathBuf;

/// Serve HTTP by running an executable for every request
#[derive(Parser, Debug, Clone)]
#[command(name = "cgigate", version, about)]
pub struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Address to bind
    #[arg(short = 'b', long = "bind")]
    pub bind: Option<String>,

    /// Suppress gateway error messages
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Serve HTTPS; a self-signed certificate is generated without --tls-cert/--tls-key
    #[arg(long = "tls")]
    pub tls: bool,

    /// TLS certificate file (PEM)
    #[arg(long = "tls-cert", requires = "tls_key")]
    pub tls_cert: Option<String>,

    /// TLS private key file (PEM)
    #[arg(long = "tls-key", requires = "tls_cert")]
    pub tls_key: Option<String>,

    /// Default response header "KEY: VALUE" (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Let the executable override default headers
    #[arg(short = 'r', long = "replace")]
    pub replace: bool,

    /// Strict CGI output parsing (overrides --replace)
    #[arg(short = 'C', long = "cgi")]
    pub cgi: bool,

    /// Shell used with --shell-command
    #[arg(short = 's', long = "shell")]
    pub shell: Option<String>,

    /// Run the arguments as a shell command
    #[arg(short = 'S', long = "shell-command")]
    pub shell_command: bool,

    /// NAME passes the variable through from this process; NAME=VALUE sets it (repeatable)
    #[arg(short = 'e', long = "env-var")]
    pub env_vars: Vec<String>,

    /// Subprocess stderr: inherit, log, null or a file path
    #[arg(short = 'E', long = "stderr")]
    pub stderr: Option<String>,

    /// Working directory of the executable (default: current directory)
    #[arg(short = 'd', long = "dir")]
    pub dir: Option<String>,

    /// URL prefix reported as SCRIPT_NAME
    #[arg(long = "root")]
    pub root: Option<String>,

    /// Kill the executable after this many seconds
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    /// Executable and its arguments
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Overlay command line flags onto `config`.
    pub fn apply(self, config: &mut Config) {
        let server = &mut config.server;
        if let Some(port) = self.port {
            server.port = port;
        }
        if let Some(bind) = self.bind {
            server.bind = bind;
        }
        server.quiet |= self.quiet;
        server.tls |= self.tls;
        if self.tls_cert.is_some() {
            server.tls_cert = self.tls_cert;
            server.tls_key = self.tls_key;
        }

        let gateway = &mut config.gateway;
        if self.shell_command {
            gateway.shell_command = true;
        }
        if let Some(shell) = self.shell {
            gateway.shell = shell;
        }
        if !self.command.is_empty() {
            if gateway.shell_command {
                gateway.command = Some(self.command.join(" "));
                gateway.executable = None;
                gateway.args.clear();
            } else {
                let mut words = self.command.into_iter();
                gateway.executable = words.next();
                gateway.args = words.collect();
                gateway.command = None;
            }
        }

        if !self.headers.is_empty() {
            gateway.headers = self.headers;
        }
        if self.cgi {
            gateway.mode = OutputMode::Cgi;
        } else if self.replace {
            gateway.mode = OutputMode::Replace;
        }

        for var in self.env_vars {
            match var.split_once('=') {
                Some((name, value)) => {
                    gateway.env.insert(name.to_string(), value.to_string());
                }
                None => {
                    if !gateway.inherit_env.contains(&var) {
                        gateway.inherit_env.push(var);
                    }
                }
            }
        }

        if self.stderr.is_some() {
            gateway.stderr = self.stderr;
        }
        if self.dir.is_some() {
            gateway.dir = self.dir;
        }
        if let Some(root) = self.root {
            gateway.root = root;
        }
        if let Some(timeout) = self.timeout {
            gateway.timeout_secs = Some(timeout);
        }
    }
}
