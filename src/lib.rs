//! Cgigate - An HTTP gateway that runs an executable per request
//!
//! This library provides a relaxed CGI/1.1 gateway that:
//! - Translates each HTTP request into a CGI-style environment
//! - Runs the configured executable with the request body on stdin
//! - Streams stdout back as the response, passed through verbatim,
//!   with executable-supplied headers, or parsed as strict CGI output
//! - Tears the subprocess down when the response ends, fails or times out

pub mod cli;
pub mod config;
pub mod env;
pub mod error;
pub mod gateway;
pub mod output;
pub mod process;
pub mod server;
pub mod tls;

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
