//! HTTP `Host:` header sniffing against a growing, not-yet-complete buffer.

use regex::bytes::Regex;
use std::sync::OnceLock;

/// Past this many buffered bytes without a `Host:` header, give up and
/// close the connection rather than buffer forever.
pub const HOST_HEADER_BUFFER_LIMIT: usize = 4096;

fn host_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Host:\s*(.*?)(:(\d+))?\r\n").expect("valid regex"))
}

/// Outcome of inspecting one connection's buffered bytes so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteVerdict {
    /// Proxy this connection to `host:port`.
    ForwardTo(String),
    /// Reject with a canned one-liner and hang up.
    Close { code: u16, reason: String },
    /// Not enough data yet; call again once more has arrived.
    NeedMoreData,
}

/// Find the `Host:` header in `buf`. Returns the hostname (lowercased is
/// NOT applied here -- callers compare case-sensitively against a
/// configured suffix, matching the reference).
///
/// If no header is found and `buf` has reached [`HOST_HEADER_BUFFER_LIMIT`],
/// returns `None` to signal the caller should close the connection; a
/// caller distinguishes "not found yet" from "not found, buffer full" via
/// `buf.len()`.
pub fn parse_host_header(buf: &[u8]) -> Option<String> {
    let caps = host_header_re().captures(buf)?;
    let hostname = caps.get(1)?;
    Some(String::from_utf8_lossy(hostname.as_bytes()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_host_header() {
        let buf = b"GET / HTTP/1.1\r\nHost: col-a.svc.example\r\n\r\n";
        assert_eq!(parse_host_header(buf).as_deref(), Some("col-a.svc.example"));
    }

    #[test]
    fn parses_host_header_with_explicit_port() {
        let buf = b"GET / HTTP/1.1\r\nHost: col-a.svc.example:8080\r\n\r\n";
        assert_eq!(parse_host_header(buf).as_deref(), Some("col-a.svc.example"));
    }

    #[test]
    fn returns_none_when_header_absent() {
        let buf = b"GET / HTTP/1.1\r\nAccept: */*\r\n";
        assert_eq!(parse_host_header(buf), None);
    }

    // Law 7 / S-like buffering behavior: short of the limit, caller should
    // wait; at the limit with no header, caller should close.
    #[test]
    fn buffer_limit_constant_matches_spec() {
        assert_eq!(HOST_HEADER_BUFFER_LIMIT, 4096);
    }
}
