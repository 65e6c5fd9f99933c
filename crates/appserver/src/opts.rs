// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::path::PathBuf;

use clap::{crate_version, Parser};

#[derive(Debug, Parser)]
#[clap(
    name = "appserver",
    about = "Image transform proxy and server-push stream demo server",
    version = crate_version!()
)]
pub struct Opts {
    #[clap(
        short,
        long,
        help = "Port to listen on.",
        default_value_t = Opts::default_port(),
        env = "APPSERVER_PORT"
    )]
    pub port: u16,

    #[clap(
        long,
        help = "Maximum simultaneous connections before 503 unavailable is returned",
        default_value_t = Opts::default_max_connections(),
        env = "APPSERVER_MAX_CONNECTIONS"
    )]
    pub max_connections: usize,

    #[clap(
        long,
        help = "TOML config file with [image] and [stream] sections. \
                Built-in defaults are used without one.",
        env = "APPSERVER_CONFIG"
    )]
    pub config: Option<PathBuf>,

    #[clap(
        long,
        help = "Run in production mode: ignore artificial delays and redact internal errors.",
        env = "APPSERVER_PRODUCTION"
    )]
    pub production: bool,
}

impl Opts {
    pub const fn default_port() -> u16 {
        8080
    }

    pub const fn default_max_connections() -> usize {
        1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = Opts::try_parse_from(["appserver"]).unwrap();
        assert_eq!(opts.port, 8080);
        assert_eq!(opts.max_connections, 1024);
        assert_eq!(opts.config, None);
        assert!(!opts.production);
    }

    #[test]
    fn parses_flags() {
        let opts = Opts::try_parse_from([
            "appserver",
            "--port",
            "9000",
            "--config",
            "app.toml",
            "--production",
        ])
        .unwrap();
        assert_eq!(opts.port, 9000);
        assert_eq!(opts.config, Some(PathBuf::from("app.toml")));
        assert!(opts.production);
    }
}
