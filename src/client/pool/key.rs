use std::{fmt, str::FromStr};

use super::UriError;

/// Pool key which identifies the remote end of a connection - using host,
/// port and whether the connection is secured.
///
/// Keys are the only granularity used for pooling and for admission accounting,
/// so two requests with equal keys may share connections.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ConnectionKey {
    host: Box<str>,
    port: u16,
    secure: bool,
}

impl ConnectionKey {
    /// Create a new key. The host is normalized to lower case.
    pub fn new(host: impl AsRef<str>, port: u16, secure: bool) -> Self {
        Self {
            host: host.as_ref().to_ascii_lowercase().into(),
            port,
            secure,
        }
    }

    /// The remote host name or address, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The remote port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether connections for this key are secured with TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme(), self.host, self.port)
        }
    }
}

impl TryFrom<&http::Uri> for ConnectionKey {
    type Error = UriError;

    fn try_from(uri: &http::Uri) -> Result<Self, Self::Error> {
        let secure = match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => false,
            Some(scheme) if scheme.eq_ignore_ascii_case("https") => true,
            Some(scheme) => return Err(UriError::UnsupportedScheme(scheme.into())),
            None => return Err(UriError::MissingScheme(uri.clone())),
        };

        let host = uri
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| UriError::MissingHost(uri.clone()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        Ok(Self::new(host, port, secure))
    }
}

impl TryFrom<http::Uri> for ConnectionKey {
    type Error = UriError;

    fn try_from(uri: http::Uri) -> Result<Self, Self::Error> {
        Self::try_from(&uri)
    }
}

impl FromStr for ConnectionKey {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = http::Uri::from_str(s)?;
        uri.try_into()
    }
}
