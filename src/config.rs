use crate::compression::{DEFAULT_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL, MIN_COMPRESSION_LEVEL};
use crate::error::Error;
use pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig as RustlsConfig;
use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;
use std::time::Duration;

/// Binds the listener to a kernel-assigned ephemeral port.
pub const RANDOM_PORT: i32 = -1;

#[derive(Debug, Clone)]
pub struct WsOptions {
    pub host: String,
    /// Listen port; `RANDOM_PORT` asks the kernel for one, `0` leaves the
    /// websocket transport disabled.
    pub port: i32,
    pub tls_config: Option<Arc<RustlsConfig>>,
    /// Deadline for the whole opening exchange, TLS handshake included.
    pub handshake_timeout: Duration,
    /// Whether the server is willing to negotiate permessage-deflate.
    pub compression: bool,
    pub compression_level: i32,
    /// When enabled, a request carrying an Origin header must match
    /// `origin`, or its own Host when `origin` is empty.
    pub check_origin: bool,
    pub origin: String,
}

impl Default for WsOptions {
    fn default() -> Self {
        WsOptions {
            host: "0.0.0.0".to_string(),
            port: RANDOM_PORT,
            tls_config: None,
            handshake_timeout: Duration::from_secs(5),
            compression: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            check_origin: false,
            origin: String::new(),
        }
    }
}

impl WsOptions {
    pub fn validate(&self) -> Result<(), Error> {
        if self.port < RANDOM_PORT || self.port > u16::MAX as i32 {
            return Err(Error::InvalidPort(self.port));
        }
        if self.compression_level < MIN_COMPRESSION_LEVEL
            || self.compression_level > MAX_COMPRESSION_LEVEL
        {
            return Err(Error::InvalidCompressionLevel(self.compression_level));
        }
        Ok(())
    }
}

/// Loads a PEM certificate chain and private key into a rustls server
/// config suitable for `WsOptions::tls_config`.
pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<Arc<RustlsConfig>, Error> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()?;

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))?;

    let config = RustlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}
