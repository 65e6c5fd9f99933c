// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Output formats the proxy can encode to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Webp,
    Png,
    Jpeg,
    Avif,
}

impl ImageFormat {
    /// Every supported format, in default priority order.
    pub const ALL: [ImageFormat; 4] = [Self::Webp, Self::Png, Self::Jpeg, Self::Avif];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Avif => "avif",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Webp => "image/webp",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Avif => "image/avif",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unsupported image format: {0:?}")]
pub struct UnknownFormat(pub String);

impl FromStr for ImageFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str() == s)
            .ok_or_else(|| UnknownFormat(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lowercase_names_only() {
        assert_eq!("avif".parse(), Ok(ImageFormat::Avif));
        assert_eq!("jpeg".parse(), Ok(ImageFormat::Jpeg));
        assert!("jpg".parse::<ImageFormat>().is_err());
        assert!("PNG".parse::<ImageFormat>().is_err());
    }

    #[test]
    fn mime_types_match_names() {
        for format in ImageFormat::ALL {
            assert_eq!(format.mime_type(), format!("image/{format}"));
        }
    }
}
