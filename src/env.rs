//! CGI meta-variables (RFC 3875 section 4.1) built from an HTTP request

use crate::config::GatewayConfig;
use hyper::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::http::request::Parts;

/// Used for `PATH` when the host process has none
pub const FALLBACK_PATH: &str = "/bin:/usr/bin:/usr/ucb:/usr/bsd:/usr/local/bin";

/// Used for `SERVER_PORT` when the Host header carries no port
pub const DEFAULT_SERVER_PORT: &str = "8080";

/// The request facts the environment is derived from
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub query: String,
    /// Path plus query as sent by the client
    pub request_uri: String,
    pub remote_addr: String,
    pub host: String,
    pub is_tls: bool,
    /// Declared body length; `None` when unknown
    pub content_length: Option<u64>,
    pub headers: HeaderMap,
}

impl RequestContext {
    pub fn from_parts(parts: &Parts, remote_addr: impl Into<String>, is_tls: bool) -> Self {
        let uri = &parts.uri;
        let host = parts
            .headers
            .get(HOST)
            .map(|h| String::from_utf8_lossy(h.as_bytes()).into_owned())
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let content_length = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            method: parts.method.to_string(),
            path: uri.path().to_string(),
            query: uri.query().unwrap_or_default().to_string(),
            request_uri: uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            remote_addr: remote_addr.into(),
            host,
            is_tls,
            content_length,
            headers: parts.headers.clone(),
        }
    }
}

/// Build the subprocess environment, reading inherited variables from this process.
pub fn build_env(ctx: &RequestContext, config: &GatewayConfig) -> Vec<String> {
    build_env_with(ctx, config, |name| std::env::var(name).ok())
}

/// Build the subprocess environment with an explicit host variable lookup.
///
/// Entries come out in construction order with earlier duplicates removed,
/// so a later entry for a key (an inherited `PATH`, say) replaces an earlier one.
pub fn build_env_with<F>(ctx: &RequestContext, config: &GatewayConfig, host_var: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let root = config.root();
    let path_info = if root != "/" {
        ctx.path.strip_prefix(root).unwrap_or(&ctx.path)
    } else {
        &ctx.path
    };

    let mut env = vec![
        format!("SERVER_SOFTWARE={}", config.software_name),
        format!("SERVER_NAME={}", ctx.host),
        "SERVER_PROTOCOL=HTTP/1.1".to_string(),
        format!("HTTP_HOST={}", ctx.host),
        "GATEWAY_INTERFACE=CGI/1.1".to_string(),
        format!("REQUEST_METHOD={}", ctx.method),
        format!("QUERY_STRING={}", ctx.query),
        format!("REQUEST_URI={}", ctx.request_uri),
        format!("PATH_INFO={}", path_info),
        format!("SCRIPT_NAME={}", root),
        format!("SCRIPT_FILENAME={}", config.executable.display()),
        format!("SERVER_PORT={}", host_port(&ctx.host).unwrap_or(DEFAULT_SERVER_PORT)),
    ];

    match split_host_port(&ctx.remote_addr) {
        Some((ip, port)) => {
            env.push(format!("REMOTE_ADDR={}", ip));
            env.push(format!("REMOTE_HOST={}", ip));
            env.push(format!("REMOTE_PORT={}", port));
        }
        None => {
            env.push(format!("REMOTE_ADDR={}", ctx.remote_addr));
            env.push(format!("REMOTE_HOST={}", ctx.remote_addr));
        }
    }

    if ctx.is_tls {
        env.push("HTTPS=on".to_string());
    }

    for name in ctx.headers.keys() {
        let key = header_env_name(name.as_str());
        // httpoxy: never let a client set PROXY / HTTP_PROXY for the child
        if key == "PROXY" {
            continue;
        }
        let sep = if key == "COOKIE" { "; " } else { ", " };
        let value = ctx
            .headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()))
            .collect::<Vec<_>>()
            .join(sep);
        env.push(format!("HTTP_{}={}", key, value));
    }

    if let Some(len) = ctx.content_length.filter(|&len| len > 0) {
        env.push(format!("CONTENT_LENGTH={}", len));
    }
    if let Some(ctype) = ctx.headers.get(CONTENT_TYPE) {
        env.push(format!("CONTENT_TYPE={}", String::from_utf8_lossy(ctype.as_bytes())));
    }

    let path = host_var("PATH")
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| FALLBACK_PATH.to_string());
    env.push(format!("PATH={}", path));

    for name in &config.inherit_env {
        if let Some(value) = host_var(name).filter(|v| !v.is_empty()) {
            env.push(format!("{}={}", name, value));
        }
    }

    for (name, value) in &config.extra_env {
        env.push(format!("{}={}", name, value));
    }

    remove_leading_duplicates(env)
}

/// Drop every entry whose `key=` prefix occurs again later in the list.
pub fn remove_leading_duplicates(env: Vec<String>) -> Vec<String> {
    let mut kept = Vec::with_capacity(env.len());
    for (i, entry) in env.iter().enumerate() {
        let shadowed = entry.find('=').is_some_and(|eq| {
            let prefix = &entry[..=eq];
            env[i + 1..].iter().any(|later| later.starts_with(prefix))
        });
        if !shadowed {
            kept.push(entry.clone());
        }
    }
    kept
}

/// `x-forwarded-for` becomes `X_FORWARDED_FOR`
pub fn header_env_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' | '=' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Trailing `:digits` of a Host header value
fn host_port(host: &str) -> Option<&str> {
    let (_, port) = host.rsplit_once(':')?;
    (!port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())).then_some(port)
}

/// Split `host:port` or `[v6host]:port`. A bare host, or an unbracketed
/// address with several colons, does not split.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = after.strip_prefix(':')?;
        if port.contains([':', '[', ']']) {
            return None;
        }
        return Some((host, port));
    }

    let (host, port) = addr.rsplit_once(':')?;
    if host.contains([':', '[', ']']) || port.contains(['[', ']']) {
        return None;
    }
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderName, HeaderValue};
    use hyper::Request;

    fn config() -> GatewayConfig {
        GatewayConfig::new("/srv/cgi/app.sh")
    }

    fn context(builder: hyper::http::request::Builder) -> RequestContext {
        let (parts, _) = builder.body(()).unwrap().into_parts();
        RequestContext::from_parts(&parts, "192.0.2.10:51234", false)
    }

    fn lookup<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
        let prefix = format!("{}=", key);
        env.iter()
            .find(|e| e.starts_with(&prefix))
            .map(|e| &e[prefix.len()..])
    }

    fn no_host_vars(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_base_variables() {
        let ctx = context(
            Request::get("/hello/world?x=1&y=2").header("Host", "example.com:9000"),
        );
        let env = build_env_with(&ctx, &config(), no_host_vars);

        assert_eq!(lookup(&env, "SERVER_SOFTWARE"), Some("cgigate"));
        assert_eq!(lookup(&env, "SERVER_NAME"), Some("example.com:9000"));
        assert_eq!(lookup(&env, "SERVER_PROTOCOL"), Some("HTTP/1.1"));
        assert_eq!(lookup(&env, "HTTP_HOST"), Some("example.com:9000"));
        assert_eq!(lookup(&env, "GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(lookup(&env, "REQUEST_METHOD"), Some("GET"));
        assert_eq!(lookup(&env, "QUERY_STRING"), Some("x=1&y=2"));
        assert_eq!(lookup(&env, "REQUEST_URI"), Some("/hello/world?x=1&y=2"));
        assert_eq!(lookup(&env, "PATH_INFO"), Some("/hello/world"));
        assert_eq!(lookup(&env, "SCRIPT_NAME"), Some("/"));
        assert_eq!(lookup(&env, "SCRIPT_FILENAME"), Some("/srv/cgi/app.sh"));
        assert_eq!(lookup(&env, "SERVER_PORT"), Some("9000"));
        assert_eq!(lookup(&env, "REMOTE_ADDR"), Some("192.0.2.10"));
        assert_eq!(lookup(&env, "REMOTE_HOST"), Some("192.0.2.10"));
        assert_eq!(lookup(&env, "REMOTE_PORT"), Some("51234"));
        assert_eq!(lookup(&env, "PATH"), Some(FALLBACK_PATH));
        assert_eq!(lookup(&env, "HTTPS"), None);
        assert_eq!(lookup(&env, "CONTENT_LENGTH"), None);
        assert_eq!(lookup(&env, "CONTENT_TYPE"), None);
    }

    #[test]
    fn test_server_port_defaults() {
        let ctx = context(Request::get("/").header("Host", "example.com"));
        let env = build_env_with(&ctx, &config(), no_host_vars);
        assert_eq!(lookup(&env, "SERVER_PORT"), Some("8080"));

        let ctx = context(Request::get("/").header("Host", "[::1]"));
        let env = build_env_with(&ctx, &config(), no_host_vars);
        assert_eq!(lookup(&env, "SERVER_PORT"), Some("8080"));
    }

    #[test]
    fn test_root_is_stripped_from_path_info() {
        let config = config().with_root("/cgi-bin");
        let ctx = context(Request::get("/cgi-bin/users/7").header("Host", "h"));
        let env = build_env_with(&ctx, &config, no_host_vars);
        assert_eq!(lookup(&env, "PATH_INFO"), Some("/users/7"));
        assert_eq!(lookup(&env, "SCRIPT_NAME"), Some("/cgi-bin"));

        let ctx = context(Request::get("/elsewhere").header("Host", "h"));
        let env = build_env_with(&ctx, &config, no_host_vars);
        assert_eq!(lookup(&env, "PATH_INFO"), Some("/elsewhere"));
    }

    #[test]
    fn test_remote_addr_fallback() {
        let (parts, _) = Request::get("/").body(()).unwrap().into_parts();
        let ctx = RequestContext::from_parts(&parts, "unix-socket", false);
        let env = build_env_with(&ctx, &config(), no_host_vars);

        assert_eq!(lookup(&env, "REMOTE_ADDR"), Some("unix-socket"));
        assert_eq!(lookup(&env, "REMOTE_HOST"), Some("unix-socket"));
        assert_eq!(lookup(&env, "REMOTE_PORT"), None);
    }

    #[test]
    fn test_remote_addr_ipv6() {
        let (parts, _) = Request::get("/").body(()).unwrap().into_parts();
        let ctx = RequestContext::from_parts(&parts, "[2001:db8::1]:443", true);
        let env = build_env_with(&ctx, &config(), no_host_vars);

        assert_eq!(lookup(&env, "REMOTE_ADDR"), Some("2001:db8::1"));
        assert_eq!(lookup(&env, "REMOTE_PORT"), Some("443"));
        assert_eq!(lookup(&env, "HTTPS"), Some("on"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("1.2.3.4:80"), Some(("1.2.3.4", "80")));
        assert_eq!(split_host_port("[::1]:8080"), Some(("::1", "8080")));
        assert_eq!(split_host_port("localhost"), None);
        assert_eq!(split_host_port("::1"), None);
        assert_eq!(split_host_port("[::1]"), None);
    }

    #[test]
    fn test_header_variables() {
        let ctx = context(
            Request::post("/")
                .header("Host", "h")
                .header("X-Forwarded-For", "10.0.0.1")
                .header("Accept", "text/html")
                .header("Accept", "text/plain")
                .header("Cookie", "a=1")
                .header("Cookie", "b=2")
                .header("Content-Type", "application/json")
                .header("Content-Length", "42"),
        );
        let env = build_env_with(&ctx, &config(), no_host_vars);

        assert_eq!(lookup(&env, "HTTP_X_FORWARDED_FOR"), Some("10.0.0.1"));
        assert_eq!(lookup(&env, "HTTP_ACCEPT"), Some("text/html, text/plain"));
        assert_eq!(lookup(&env, "HTTP_COOKIE"), Some("a=1; b=2"));
        assert_eq!(lookup(&env, "CONTENT_TYPE"), Some("application/json"));
        assert_eq!(lookup(&env, "CONTENT_LENGTH"), Some("42"));
    }

    #[test]
    fn test_proxy_header_is_dropped() {
        for name in ["Proxy", "proxy", "PROXY"] {
            let mut ctx = context(Request::get("/").header("Host", "h"));
            ctx.headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_static("http://evil.example:3128"),
            );
            let env = build_env_with(&ctx, &config(), no_host_vars);

            assert_eq!(lookup(&env, "HTTP_PROXY"), None, "header {name}");
            assert!(!env.iter().any(|e| e.contains("evil.example")));
        }
    }

    #[test]
    fn test_zero_content_length_is_omitted() {
        let ctx = context(Request::post("/").header("Host", "h").header("Content-Length", "0"));
        let env = build_env_with(&ctx, &config(), no_host_vars);
        assert_eq!(lookup(&env, "CONTENT_LENGTH"), None);
    }

    #[test]
    fn test_inherited_variables_override_defaults() {
        let config = config().with_inherit_env(vec![
            "PATH".to_string(),
            "LD_LIBRARY_PATH".to_string(),
            "EMPTY".to_string(),
            "UNSET".to_string(),
        ]);
        let ctx = context(Request::get("/").header("Host", "h"));
        let env = build_env_with(&ctx, &config, |name| match name {
            "PATH" => Some("/opt/bin".to_string()),
            "LD_LIBRARY_PATH" => Some("/opt/lib".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        });

        assert_eq!(env.iter().filter(|e| e.starts_with("PATH=")).count(), 1);
        assert_eq!(lookup(&env, "PATH"), Some("/opt/bin"));
        assert_eq!(lookup(&env, "LD_LIBRARY_PATH"), Some("/opt/lib"));
        assert_eq!(lookup(&env, "EMPTY"), None);
        assert_eq!(lookup(&env, "UNSET"), None);
    }

    #[test]
    fn test_extra_env_wins() {
        let config = config().with_env("SERVER_SOFTWARE", "custom/1.0");
        let ctx = context(Request::get("/").header("Host", "h"));
        let env = build_env_with(&ctx, &config, no_host_vars);
        assert_eq!(lookup(&env, "SERVER_SOFTWARE"), Some("custom/1.0"));
        assert_eq!(env.last().map(String::as_str), Some("SERVER_SOFTWARE=custom/1.0"));
    }

    #[test]
    fn test_remove_leading_duplicates_keeps_last() {
        let env = vec![
            "A=1".to_string(),
            "B=2".to_string(),
            "A=3".to_string(),
            "AB=4".to_string(),
            "NOEQ".to_string(),
        ];
        assert_eq!(
            remove_leading_duplicates(env),
            vec!["B=2", "A=3", "AB=4", "NOEQ"]
        );
    }

    #[test]
    fn test_header_env_name() {
        assert_eq!(header_env_name("x-forwarded-for"), "X_FORWARDED_FOR");
        assert_eq!(header_env_name("weird=name"), "WEIRD_NAME");
        assert_eq!(header_env_name("cookie"), "COOKIE");
    }
}
