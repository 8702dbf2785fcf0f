//! Worker startup handshake.
//!
//! A worker prints `[Ember: Listening on IP - <ip> Port - <port>]` exactly once,
//! as soon as it accepts invocations.

use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;

use regex::Regex;

/// Marker that prefixes the handshake line.
pub const HANDSHAKE_MARKER: &str = "Ember";

static HANDSHAKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^\[{}: Listening on IP - (?P<ip>[^ \]]+) Port - (?P<port>\d+)\]$",
        regex::escape(HANDSHAKE_MARKER)
    ))
    .expect("handshake pattern is valid")
});

/// Render the handshake line a worker should print.
pub fn handshake_line(ip: IpAddr, port: u16) -> String {
    format!("[{}: Listening on IP - {} Port - {}]", HANDSHAKE_MARKER, ip, port)
}

/// Parse a handshake message into the worker's socket address.
pub fn parse_handshake(message: &str) -> Option<SocketAddr> {
    let captures = HANDSHAKE.captures(message.trim())?;
    let ip: IpAddr = captures["ip"].parse().ok()?;
    let port: u16 = captures["port"].parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Base URL for the transport (`http://127.0.0.1:5000`, `http://[::1]:5000`).
pub fn base_url(addr: SocketAddr) -> String {
    format!("http://{}", addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_parse_ipv4() {
        let addr = parse_handshake("[Ember: Listening on IP - 127.0.0.1 Port - 50123]").unwrap();
        assert_eq!(addr, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50123));
        assert_eq!(base_url(addr), "http://127.0.0.1:50123");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = parse_handshake("[Ember: Listening on IP - ::1 Port - 8080]").unwrap();
        assert_eq!(addr.ip(), IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(base_url(addr), "http://[::1]:8080");
    }

    #[test]
    fn test_round_trip_line() {
        let line = handshake_line(IpAddr::V4(Ipv4Addr::LOCALHOST), 4310);
        assert_eq!(line, "[Ember: Listening on IP - 127.0.0.1 Port - 4310]");
        assert_eq!(parse_handshake(&line).map(|a| a.port()), Some(4310));
    }

    #[test]
    fn test_rejects_other_output() {
        assert!(parse_handshake("Listening on IP - 127.0.0.1 Port - 1").is_none());
        assert!(parse_handshake("[Other: Listening on IP - 127.0.0.1 Port - 1]").is_none());
        assert!(parse_handshake("[Ember: Listening on IP - localhost Port - 1]").is_none());
        assert!(parse_handshake("[Ember: Listening on IP - 127.0.0.1 Port - 99999]").is_none());
        assert!(parse_handshake("log: [Ember: Listening on IP - 127.0.0.1 Port - 1]").is_none());
    }
}
