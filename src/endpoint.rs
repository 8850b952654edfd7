use std::{fmt, str::FromStr};

/// A peer endpoint as reported by the data plane, split into host and port.
///
/// The host is kept as the literal text from the dump; no resolution or
/// normalization happens beyond the textual split.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// IPv6 detection for bucketing: the host contains a colon.
    pub fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }
}

impl FromStr for Endpoint {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("(none)") {
            return Err("no endpoint");
        }
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            rest.split_once("]:")
                .ok_or("couldn't parse in form of '[host]:port'")?
        } else {
            s.rsplit_once(':')
                .ok_or("couldn't parse in form of 'host:port'")?
        };
        if host.is_empty() {
            return Err("empty host");
        }
        let port: u16 = port.parse().map_err(|_| "couldn't parse port")?;
        if port == 0 {
            return Err("port must be positive");
        }
        Ok(Endpoint {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
