//! Subject normalization for leaf certificates.

use std::fmt;
use std::net::IpAddr;

/// The identity a leaf certificate is issued for, after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// An IP literal, encoded as an IP address SAN.
    Ip(IpAddr),
    /// An ASCII-compatible DNS name, encoded as a DNS SAN.
    Dns(String),
    /// No usable SAN; the raw string is only carried as the CommonName.
    CommonNameOnly(String),
}

impl Subject {
    /// Classify and normalize a caller-supplied subject.
    ///
    /// Never fails: anything that is neither an IP literal nor representable
    /// as an ASCII DNS name degrades to [`Subject::CommonNameOnly`].
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return Self::CommonNameOnly(String::new());
        }

        if let Some(ip) = parse_ip(raw) {
            return Self::Ip(ip);
        }

        match idna::domain_to_ascii(raw) {
            Ok(ascii) if !ascii.is_empty() && ascii.is_ascii() => Self::Dns(ascii),
            _ if raw.is_ascii() => Self::Dns(raw.to_ascii_lowercase()),
            _ => Self::CommonNameOnly(raw.to_string()),
        }
    }

    /// Value placed in the certificate's CommonName.
    pub fn common_name(&self) -> String {
        match self {
            Self::Ip(ip) => ip.to_string(),
            Self::Dns(name) | Self::CommonNameOnly(name) => name.clone(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "ip:{ip}"),
            Self::Dns(name) => write!(f, "dns:{name}"),
            Self::CommonNameOnly(name) => write!(f, "cn:{name:?}"),
        }
    }
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    let unbracketed = raw
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(raw);
    unbracketed.parse().ok()
}
