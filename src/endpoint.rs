//! Endpoint URL construction: normalize the scheme, keep a pre-parsed host
//! around so reconnecting never has to re-derive it, and build the
//! `/websocket` path with query parameters appended.

use url::Url;

/// Errors building an [`Endpoint`] from a caller-supplied base URL.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// Scheme wasn't `http(s)` or `ws(s)`.
    #[error("invalid scheme `{0}`; only http(s) and ws(s) are allowed")]
    InvalidScheme(String),
    /// The URL had no host component.
    #[error("the url is missing a host")]
    MissingHost,
}

/// A validated Phoenix socket endpoint: a base URL plus the query
/// parameters the caller wants on every connect.
///
/// Reconnecting rebuilds the `/websocket` URL from this prototype, so the
/// host is parsed once and reused: it must stay the same as the host in
/// the original base URL for the lifetime of the endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    base: Url,
    host: String,
}

impl Endpoint {
    /// Validates `base` and normalizes its scheme to `ws`/`wss`.
    pub fn new(base: impl AsRef<str>) -> Result<Self, EndpointError> {
        let mut url = Url::parse(base.as_ref()).map_err(|_| EndpointError::MissingHost)?;
        set_ws_scheme(&mut url)?;
        let host = parse_host(&url)?;
        Ok(Self { base: url, host })
    }

    /// The parsed host, including port if present (e.g. `example.com:4000`).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Builds the full connect URL: `{base}/websocket?{params}&vsn={vsn}`.
    ///
    /// `params` are appended verbatim in iteration order; the caller is
    /// responsible for escaping values it cares about (spec section 6:
    /// "values are passed through verbatim").
    pub fn to_url<I, K, V>(&self, params: I, vsn: &str) -> Url
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .expect("scheme validated to be ws/wss, which always allows path segments");
            segments.pop_if_empty();
            segments.push("websocket");
        }
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (k, v) in params {
                query.append_pair(k.as_ref(), v.as_ref());
            }
            query.append_pair("vsn", vsn);
        }
        url
    }
}

fn set_ws_scheme(url: &mut Url) -> Result<(), EndpointError> {
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(EndpointError::InvalidScheme(other.to_owned())),
    };
    url.set_scheme(scheme)
        .expect("validated scheme is always settable");
    Ok(())
}

fn parse_host(url: &Url) -> Result<String, EndpointError> {
    let host = url.host_str().ok_or(EndpointError::MissingHost)?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_http_to_ws_and_builds_query() {
        let endpoint = Endpoint::new("http://example.com:4000/socket").unwrap();
        assert_eq!(endpoint.host(), "example.com:4000");

        let url = endpoint.to_url([("token", "abc")], "2.0.0");
        assert_eq!(
            url.as_str(),
            "ws://example.com:4000/socket/websocket?token=abc&vsn=2.0.0"
        );
    }

    #[test]
    fn normalizes_https_to_wss() {
        let endpoint = Endpoint::new("https://example.com/socket").unwrap();
        let url = endpoint.to_url(std::iter::empty::<(&str, &str)>(), "2.0.0");
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let err = Endpoint::new("ftp://example.com/socket").unwrap_err();
        assert!(matches!(err, EndpointError::InvalidScheme(s) if s == "ftp"));
    }
}
