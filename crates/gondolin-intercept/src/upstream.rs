#![forbid(unsafe_code)]

//! The host-side client used to replay guest requests: lazy per-connect
//! DNS resolution, admission over the freshly-resolved addresses, and an
//! optional TLS session with the original SNI.

use crate::InterceptError;
use gondolin_policy::Admission;
use rustls_pki_types::ServerName;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + 'a>>;

/// Host DNS. Resolution happens at connect time, every time; the guest's
/// earlier DNS answer is never reused (DNS-rebinding defence).
pub trait HostResolver: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str) -> ResolveFuture<'a>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> ResolveFuture<'a> {
        Box::pin(async move {
            // A literal IP "hostname" resolves to itself.
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Ok(vec![ip]);
            }
            let addrs = tokio::net::lookup_host((host, 0)).await?;
            let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            // The guest plane is IPv4; prefer IPv4 results first.
            ips.sort_by_key(|ip| ip.is_ipv6());
            if ips.is_empty() {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no addresses"));
            }
            Ok(ips)
        })
    }
}

pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// One upstream connection plus its read buffer.
pub struct UpstreamConn {
    io: Box<dyn Io>,
    pub(crate) buf: Vec<u8>,
    pub host: String,
    pub ip: IpAddr,
    pub port: u16,
    pub tls: bool,
    pub reusable: bool,
}

impl UpstreamConn {
    pub fn matches(&self, host: &str, port: u16, tls: bool) -> bool {
        self.reusable && self.host == host && self.port == port && self.tls == tls
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.io.write_all(bytes).await?;
        self.io.flush().await
    }

    /// Pull more bytes into the buffer; 0 means upstream EOF.
    pub async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 16 * 1024];
        let n = self.io.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

impl std::fmt::Debug for UpstreamConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConn")
            .field("host", &self.host)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .finish()
    }
}

#[derive(Clone)]
pub struct UpstreamClient {
    resolver: Arc<dyn HostResolver>,
    tls_config: Arc<rustls::ClientConfig>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub follow_redirects: bool,
}

impl UpstreamClient {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            resolver,
            tls_config: Arc::new(tls_config),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            follow_redirects: false,
        }
    }

    /// Swap the TLS roots (tests point this at a private CA).
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = config;
        self
    }

    /// Fresh resolution of `host`, no caching.
    pub async fn resolver_ips(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        self.resolver.resolve(host).await
    }

    /// Resolve `host` now, admit each candidate address in order, and
    /// connect to the first one that passes.
    pub async fn open(
        &self,
        host: &str,
        port: u16,
        tls: bool,
        admission: &Admission,
    ) -> Result<UpstreamConn, InterceptError> {
        let ips = self.resolver.resolve(host).await?;
        let mut denied = None;
        let mut chosen = None;
        for ip in ips {
            let decision = admission.admit(host, ip);
            if decision.is_allowed() {
                chosen = Some(ip);
                break;
            }
            denied = Some(decision);
        }
        let Some(ip) = chosen else {
            return Err(match denied {
                Some(decision) => InterceptError::AdmissionDenied {
                    host: host.to_string(),
                    decision,
                },
                None => InterceptError::NoAddress(host.to_string()),
            });
        };

        let addr = SocketAddr::new(ip, port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| InterceptError::Timeout)??;
        let _ = stream.set_nodelay(true);

        let io: Box<dyn Io> = if tls {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| InterceptError::BadRequest("invalid SNI host"))?;
            let connector = TlsConnector::from(self.tls_config.clone());
            let tls_stream = tokio::time::timeout(
                self.connect_timeout,
                connector.connect(server_name, stream),
            )
            .await
            .map_err(|_| InterceptError::Timeout)?
            .map_err(InterceptError::Upstream)?;
            Box::new(tls_stream)
        } else {
            Box::new(stream)
        };

        Ok(UpstreamConn {
            io,
            buf: Vec::new(),
            host: host.to_string(),
            ip,
            port,
            tls,
            reusable: true,
        })
    }
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("follow_redirects", &self.follow_redirects)
            .finish()
    }
}
