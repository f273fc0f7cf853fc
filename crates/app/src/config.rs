//! Command-line arguments and the immutable run configuration

use std::path::PathBuf;

use clap::Parser;
use confab_net::{normalize_color, Config, TlsPaths};

/// Confab - terminal chat for small crews
#[derive(Debug, Parser)]
#[command(name = "confab", version, about)]
pub struct Args {
    /// Host to serve on or connect to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to serve on or connect to
    #[arg(short = 'P', long, default_value_t = confab_net::DEFAULT_PORT)]
    pub port: u16,

    /// Display name to use in the chat
    #[arg(short, long, default_value = "Anonymous")]
    pub username: String,

    /// Display color for your messages (hex RGB, leading '#' optional)
    #[arg(short, long, default_value = "000000")]
    pub color: String,

    /// Run the chat server for others to connect
    #[arg(short, long)]
    pub serve: bool,

    /// Require mutual TLS on every connection
    #[arg(long)]
    pub ssl: bool,

    /// PEM bundle holding this peer's certificate and private key
    #[arg(long, default_value = "./client.pem")]
    pub certfile: PathBuf,

    /// Certificate authority used to verify the remote peer
    #[arg(long, default_value = "./rootCA.pem")]
    pub cafile: PathBuf,
}

impl Args {
    /// Validate and freeze into the immutable runtime configuration.
    pub fn into_config(self) -> confab_net::Result<Config> {
        let color = normalize_color(&self.color)?;
        let tls = self.ssl.then(|| TlsPaths {
            certfile: self.certfile,
            cafile: self.cafile,
        });

        Ok(Config {
            host: self.host,
            port: self.port,
            username: self.username,
            color,
            serve: self.serve,
            tls,
        })
    }
}
