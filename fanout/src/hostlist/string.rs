use super::{HostInfo, HostInfoList, Provider, ResolveError, DEFAULT_PORT};
use once_cell::sync::Lazy;
use regex::Regex;

/// Separators accepted between hosts in a literal spec.
pub const SPLIT_PATTERN: &str = r"\s+|;|,";

static SPLIT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(SPLIT_PATTERN).expect("split regex should compile"));

/// Last-resort provider: the spec itself is the host list.
pub struct FromString {
    spec: String,
}

impl FromString {
    pub fn new(spec: &str) -> Self {
        Self {
            spec: spec.to_string(),
        }
    }
}

/// Parses one `[user@]host[:port]` token. The alias keeps the full token so
/// dedup and display see exactly what the operator wrote.
fn parse_token(token: &str) -> HostInfo {
    let mut rest = token;
    let mut user = None;
    if let Some((name, host)) = rest.split_once('@') {
        if !name.is_empty() {
            user = Some(name.to_string());
        }
        rest = host;
    }
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            (host, port)
        }
        _ => (rest, DEFAULT_PORT),
    };
    HostInfo {
        host: host.to_string(),
        alias: token.to_string(),
        port: port.to_string(),
        user,
        cmd: None,
        index: 0,
    }
}

impl Provider for FromString {
    fn name(&self) -> &'static str {
        "string"
    }

    fn priority(&self) -> i32 {
        i32::MAX
    }

    fn fetch(&self) -> Result<HostInfoList, ResolveError> {
        Ok(SPLIT_REGEX
            .split(&self.spec)
            .map(parse_token)
            .collect())
    }
}
