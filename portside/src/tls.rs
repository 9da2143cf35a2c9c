//! TLS channel: rustls driven over an async socket.
//!
//! rustls is used directly as a sans-IO engine, the same way the protocol
//! crates work: ciphertext is shuttled between the socket and the
//! `ServerConnection`'s record layer, plaintext between the record layer
//! and the HTTP drivers. The handshake loop alternates
//! flush-pending-records / read-more-ciphertext until the engine stops
//! handshaking, which covers client-hello retries, HelloRetryRequest and
//! session tickets without caring which is which.
//!
//! Half-close follows the same asymmetric rule as the TCP layer: on
//! shutdown the channel sends `close_notify`, flushes it, and closes the
//! write side without waiting for the peer's alert (the idle timeout
//! bounds the remaining read side).

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection, SupportedCipherSuite};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Error;

/// Orders and filters the cipher suites offered to clients. Receives the
/// provider's supported list and its default list; returns the list to use.
pub type CipherFilter =
    Arc<dyn Fn(&[SupportedCipherSuite], &[SupportedCipherSuite]) -> Vec<SupportedCipherSuite> + Send + Sync>;

/// TLS material and policy for the HTTPS listener.
#[derive(Clone)]
pub struct TlsSettings {
    source: TlsSource,
    cipher_filter: Option<CipherFilter>,
}

#[derive(Clone)]
enum TlsSource {
    /// Caller-built config used as-is (ALPN adjusted for the listener).
    Prebuilt(Arc<ServerConfig>),
    /// PEM-encoded certificate chain and private key.
    Pem { certs: Vec<u8>, key: Vec<u8> },
}

impl TlsSettings {
    /// Use a pre-built rustls config. The cipher filter does not apply;
    /// the caller already chose a provider.
    pub fn from_server_config(config: Arc<ServerConfig>) -> Self {
        Self {
            source: TlsSource::Prebuilt(config),
            cipher_filter: None,
        }
    }

    /// Build from a PEM certificate chain and private key.
    pub fn from_pem(certs: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            source: TlsSource::Pem {
                certs: certs.into(),
                key: key.into(),
            },
            cipher_filter: None,
        }
    }

    /// Install a cipher filter (PEM source only).
    pub fn cipher_filter(
        mut self,
        filter: impl Fn(&[SupportedCipherSuite], &[SupportedCipherSuite]) -> Vec<SupportedCipherSuite>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.cipher_filter = Some(Arc::new(filter));
        self
    }

    /// Resolve to a rustls config with the listener's ALPN list.
    pub(crate) fn build(&self, h2_enabled: bool) -> Result<Arc<ServerConfig>, Error> {
        let alpn: Vec<Vec<u8>> = if h2_enabled {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };

        match &self.source {
            TlsSource::Prebuilt(config) => {
                let mut config = (**config).clone();
                config.alpn_protocols = alpn;
                Ok(Arc::new(config))
            }
            TlsSource::Pem { certs, key } => {
                let certs: Vec<CertificateDer<'static>> =
                    rustls_pemfile::certs(&mut certs.as_slice())
                        .collect::<Result<_, _>>()
                        .map_err(|e| Error::TlsFailure(format!("bad certificate pem: {e}")))?;
                if certs.is_empty() {
                    return Err(Error::TlsFailure("no certificates in pem".into()));
                }
                let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key.as_slice())
                    .map_err(|e| Error::TlsFailure(format!("bad key pem: {e}")))?
                    .ok_or_else(|| Error::TlsFailure("no private key in pem".into()))?;

                let base = rustls::crypto::aws_lc_rs::default_provider();
                let suites = match &self.cipher_filter {
                    Some(filter) => {
                        let chosen = filter(&base.cipher_suites, &base.cipher_suites);
                        if chosen.is_empty() {
                            return Err(Error::TlsFailure(
                                "cipher filter returned an empty suite list".into(),
                            ));
                        }
                        chosen
                    }
                    None => base.cipher_suites.clone(),
                };
                let provider = CryptoProvider {
                    cipher_suites: suites,
                    ..base
                };

                let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
                    .with_safe_default_protocol_versions()
                    .map_err(|e| Error::TlsFailure(e.to_string()))?
                    .with_no_client_auth()
                    .with_single_cert(certs, key)
                    .map_err(|e| Error::TlsFailure(e.to_string()))?;
                config.alpn_protocols = alpn;
                Ok(Arc::new(config))
            }
        }
    }
}

/// Negotiated session parameters, surfaced on connection views.
#[derive(Debug, Clone, Default)]
pub struct TlsSessionInfo {
    pub protocol: Option<String>,
    pub cipher: Option<String>,
    pub alpn: Option<Vec<u8>>,
    pub sni: Option<String>,
}

/// A TLS-wrapped socket.
pub(crate) struct TlsChannel {
    stream: TcpStream,
    conn: ServerConnection,
    peer_closed: bool,
}

impl TlsChannel {
    /// Accept a TLS connection: run the handshake to completion within
    /// `timeout`. Failures here never create an exchange; the caller
    /// counts them as failed-to-connect.
    pub async fn accept(
        stream: TcpStream,
        config: Arc<ServerConfig>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let conn = ServerConnection::new(config)
            .map_err(|e| Error::TlsFailure(e.to_string()))?;
        let mut channel = Self {
            stream,
            conn,
            peer_closed: false,
        };
        tokio::time::timeout(timeout, channel.handshake())
            .await
            .map_err(|_| Error::TlsFailure("handshake timed out".into()))??;
        Ok(channel)
    }

    async fn handshake(&mut self) -> Result<(), Error> {
        while self.conn.is_handshaking() {
            self.flush_records().await?;
            if !self.conn.is_handshaking() {
                break;
            }
            if self.conn.wants_read() {
                let n = self.pump_ciphertext().await?;
                if n == 0 {
                    return Err(Error::TlsFailure("connection closed during handshake".into()));
                }
            }
        }
        self.flush_records().await?;
        Ok(())
    }

    /// Read decrypted plaintext. `Ok(0)` means the peer finished cleanly
    /// (close_notify or bare FIN).
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize, Error> {
        loop {
            match self.conn.reader().read(dst) {
                Ok(0) => {
                    // rustls reports a clean close_notify as EOF.
                    self.peer_closed = true;
                    return Ok(0);
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::TlsFailure(e.to_string())),
            }
            if self.peer_closed {
                return Ok(0);
            }
            // Key updates and tickets can require output while reading.
            self.flush_records().await?;
            let n = self.pump_ciphertext().await?;
            if n == 0 && !self.peer_closed {
                // FIN without close_notify: tolerated, treated as EOF.
                self.peer_closed = true;
                return Ok(0);
            }
        }
    }

    /// Encrypt and send plaintext.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut offset = 0;
        while offset < data.len() {
            let n = self
                .conn
                .writer()
                .write(&data[offset..])
                .map_err(|e| Error::TlsFailure(e.to_string()))?;
            offset += n;
            self.flush_records().await?;
        }
        Ok(())
    }

    /// Send close_notify and half-close the write side.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.conn.send_close_notify();
        self.flush_records().await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    pub fn session_info(&self) -> TlsSessionInfo {
        TlsSessionInfo {
            protocol: self.conn.protocol_version().map(|v| format!("{v:?}")),
            cipher: self
                .conn
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite())),
            alpn: self.conn.alpn_protocol().map(|p| p.to_vec()),
            sni: self.conn.server_name().map(|s| s.to_string()),
        }
    }

    /// The client selected `h2` via ALPN.
    pub fn negotiated_h2(&self) -> bool {
        self.conn.alpn_protocol() == Some(b"h2")
    }

    /// Write every pending TLS record to the socket.
    async fn flush_records(&mut self) -> Result<(), Error> {
        while self.conn.wants_write() {
            let mut out = Vec::with_capacity(4096);
            self.conn
                .write_tls(&mut out)
                .map_err(|e| Error::TlsFailure(e.to_string()))?;
            if out.is_empty() {
                break;
            }
            self.stream.write_all(&out).await?;
        }
        Ok(())
    }

    /// One socket read fed through the record layer. Returns the raw byte
    /// count (0 = FIN).
    async fn pump_ciphertext(&mut self) -> Result<usize, Error> {
        let mut buf = [0u8; 16 * 1024];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(0);
        }
        let mut slice = &buf[..n];
        while !slice.is_empty() {
            let consumed = self
                .conn
                .read_tls(&mut slice)
                .map_err(|e| Error::TlsFailure(e.to_string()))?;
            if consumed == 0 {
                break;
            }
        }
        let state = match self.conn.process_new_packets() {
            Ok(state) => state,
            Err(e) => {
                // Flush the alert before surfacing the failure.
                let _ = self.flush_records().await;
                return Err(Error::TlsFailure(e.to_string()));
            }
        };
        if state.peer_has_closed() {
            self.peer_closed = true;
        }
        Ok(n)
    }
}

/// The byte pipe the HTTP drivers run over: a bare socket or a TLS channel.
pub(crate) enum ServerStream {
    Plain(TcpStream),
    Tls(Box<TlsChannel>),
}

impl ServerStream {
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize, Error> {
        match self {
            ServerStream::Plain(s) => Ok(s.read(dst).await?),
            ServerStream::Tls(t) => t.read(dst).await,
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        match self {
            ServerStream::Plain(s) => Ok(s.write_all(data).await?),
            ServerStream::Tls(t) => t.write_all(data).await,
        }
    }

    /// Half-close the write side (TLS sends close_notify first).
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        match self {
            ServerStream::Plain(s) => Ok(s.shutdown().await?),
            ServerStream::Tls(t) => t.shutdown().await,
        }
    }

    pub fn session_info(&self) -> Option<TlsSessionInfo> {
        match self {
            ServerStream::Plain(_) => None,
            ServerStream::Tls(t) => Some(t.session_info()),
        }
    }
}
