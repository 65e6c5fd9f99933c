// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Which source URLs the proxy is willing to fetch

use http::StatusCode;
use url::{Origin, Url};

/// A source URL that can't be fetched.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OriginError {
    #[error("Invalid image url")]
    Invalid,
    #[error("Invalid image url origin")]
    NotAllowed,
}

impl OriginError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Invalid => StatusCode::BAD_REQUEST,
            Self::NotAllowed => StatusCode::FORBIDDEN,
        }
    }
}

/// A configured origin that can't be used for allow-listing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidOrigin {
    #[error("{origin:?} is not a valid url: {source}")]
    Parse {
        origin: String,
        source: url::ParseError,
    },
    #[error("{origin:?} is not an http(s) origin")]
    Opaque { origin: String },
}

fn http_origin(raw: &str) -> Result<(Url, Origin), InvalidOrigin> {
    let url = Url::parse(raw).map_err(|source| InvalidOrigin::Parse {
        origin: raw.to_owned(),
        source,
    })?;
    let origin = url.origin();
    if !origin.is_tuple() || !matches!(url.scheme(), "http" | "https") {
        return Err(InvalidOrigin::Opaque {
            origin: raw.to_owned(),
        });
    }
    Ok((url, origin))
}

/// Whether `raw` has neither a scheme nor a network-path (`//host`) prefix.
///
/// Such URLs are served from the proxy's own origin.
pub fn is_relative(raw: &str) -> bool {
    let scheme_len = raw
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic() || *b == b'+')
        .count();
    let rest = match raw[scheme_len..].strip_prefix(':') {
        Some(rest) if scheme_len > 0 => rest,
        _ => raw,
    };
    !rest.starts_with("//")
}

/// The allow-list guarding upstream fetches.
#[derive(Clone, Debug)]
pub struct AllowedOrigins {
    origins: Vec<Origin>,
    base: Url,
}

impl AllowedOrigins {
    /// `base_url` is the proxy's own origin, used to resolve relative URLs.
    pub fn new<S: AsRef<str>>(allowed: &[S], base_url: &str) -> Result<Self, InvalidOrigin> {
        let origins = allowed
            .iter()
            .map(|raw| http_origin(raw.as_ref()).map(|(_, origin)| origin))
            .collect::<Result<_, _>>()?;
        let (base, _) = http_origin(base_url)?;
        Ok(Self { origins, base })
    }

    /// Resolves a requested source URL to the URL that will actually be fetched.
    ///
    /// Relative URLs are joined onto the base URL and must still point at the base
    /// origin afterwards, which rules out tricks like `/\evil.example`. Absolute URLs
    /// must have exactly one of the allowed origins after canonicalization.
    pub fn resolve(&self, raw: &str) -> Result<Url, OriginError> {
        if is_relative(raw) {
            let url = self.base.join(raw).map_err(|_| OriginError::Invalid)?;
            if url.origin() != self.base.origin() {
                return Err(OriginError::NotAllowed);
            }
            return Ok(url);
        }

        let url = Url::parse(raw).map_err(|_| OriginError::Invalid)?;
        let origin = url.origin();
        if origin.is_tuple() && self.origins.contains(&origin) {
            Ok(url)
        } else {
            Err(OriginError::NotAllowed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origins() -> AllowedOrigins {
        AllowedOrigins::new(&["https://cdn.example"], "http://localhost:8080").unwrap()
    }

    #[test]
    fn detects_relative_urls() {
        assert!(is_relative("/images/cat.png"));
        assert!(is_relative("images/cat.png"));
        assert!(is_relative("/\\evil.example/x.png"));
        assert!(!is_relative("//evil.example/x.png"));
        assert!(!is_relative("https://cdn.example/x.png"));
        assert!(!is_relative("HTTPS://cdn.example/x.png"));
        assert!(!is_relative("svn+ssh://host/x"));
    }

    #[test]
    fn allows_listed_origins_only() {
        let origins = origins();
        assert_eq!(
            origins.resolve("https://cdn.example/x.png").unwrap().as_str(),
            "https://cdn.example/x.png"
        );
        assert_eq!(
            origins.resolve("https://evil.example/x.png"),
            Err(OriginError::NotAllowed)
        );
        assert_eq!(
            origins.resolve("http://cdn.example/x.png"),
            Err(OriginError::NotAllowed)
        );
    }

    #[test]
    fn compares_canonical_origins() {
        let origins = origins();
        assert!(origins.resolve("HTTPS://CDN.example:443/x.png").is_ok());
        assert_eq!(
            origins.resolve("https://cdn.example.evil.example/x.png"),
            Err(OriginError::NotAllowed)
        );
        assert_eq!(
            origins.resolve("https://cdn.example@evil.example/x.png"),
            Err(OriginError::NotAllowed)
        );
        assert_eq!(
            origins.resolve("https://cdn.example:8443/x.png"),
            Err(OriginError::NotAllowed)
        );
    }

    #[test]
    fn relative_urls_stay_on_the_base_origin() {
        let origins = origins();
        assert_eq!(
            origins.resolve("/images/cat.png").unwrap().as_str(),
            "http://localhost:8080/images/cat.png"
        );
        assert_eq!(
            origins.resolve("/\\evil.example/x.png"),
            Err(OriginError::NotAllowed)
        );
        assert_eq!(
            origins.resolve("javascript:alert(1)"),
            Err(OriginError::NotAllowed)
        );
        assert_eq!(
            origins.resolve("file:///etc/passwd"),
            Err(OriginError::NotAllowed)
        );
    }

    #[test]
    fn malformed_urls_are_invalid() {
        assert_eq!(origins().resolve("https://"), Err(OriginError::Invalid));
        assert_eq!(origins().resolve("https://exa mple.com/"), Err(OriginError::Invalid));
    }

    #[test]
    fn rejects_opaque_configured_origins() {
        assert!(matches!(
            AllowedOrigins::new(&["data:text/plain,hi"], "http://localhost"),
            Err(InvalidOrigin::Opaque { .. })
        ));
        assert!(matches!(
            AllowedOrigins::new(&["not a url"], "http://localhost"),
            Err(InvalidOrigin::Parse { .. })
        ));
    }
}
