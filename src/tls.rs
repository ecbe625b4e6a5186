use std::io::{self, Error, ErrorKind};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::{fmt, fs};

use futures::FutureExt;
use futures::future::BoxFuture;
use pin_project_lite::pin_project;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("could not read {note} file {filename:?}: {err}")]
    FileReadFailed {
        note: &'static str,
        filename: PathBuf,
        err: std::io::Error,
    },
    #[error("certificate file contains no certificates")]
    MissingCertificate,
    #[error("could not parse certificate in {filename:?}: {err}")]
    CertificateParse {
        filename: PathBuf,
        err: std::io::Error,
    },
    #[error("could not parse private key in {filename:?}: {err}")]
    PrivateKeyParse {
        filename: PathBuf,
        err: std::io::Error,
    },
    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),
    #[error("incoming listener failed: {0}")]
    IncomingListener(std::io::Error),
    #[error("error building TLS config: {0}")]
    TlsBuild(rustls::Error),
    #[error("error adding a certificate to a store: {0}")]
    AddCertToStore(rustls::Error),
    #[error("{0}")]
    VerifierBuild(rustls::server::VerifierBuilderError),
    #[error("TCP bind failed: {0}")]
    TcpBind(std::io::Error),
}

/// TLS options for the serving endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Absolute path to the server certificate, in PEM format (X.509).
    pub cert: PathBuf,

    /// Absolute path to the server private key, in PEM format (PKCS#8).
    pub key: PathBuf,

    /// Absolute path to a CA certificate bundle. When set, clients must
    /// present a certificate signed by this CA (mutual TLS).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca: Option<PathBuf>,
}

impl TlsConfig {
    pub fn server_config(&self) -> Result<ServerConfig, TlsError> {
        let builder = if let Some(ca_file) = &self.client_ca {
            let certs = load_certs(ca_file)?;
            let mut store = RootCertStore::empty();
            for cert in certs {
                store.add(cert).map_err(TlsError::AddCertToStore)?;
            }

            let client_auth = WebPkiClientVerifier::builder(Arc::new(store))
                .build()
                .map_err(TlsError::VerifierBuild)?;
            ServerConfig::builder().with_client_cert_verifier(client_auth)
        } else {
            ServerConfig::builder().with_no_client_auth()
        };

        let certs = load_certs(&self.cert)?;
        let key = load_private_key(&self.key)?;

        builder
            .with_single_cert(certs, key)
            .map_err(TlsError::TlsBuild)
    }
}

fn load_certs(filename: &PathBuf) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let content = fs::read(filename).map_err(|err| TlsError::FileReadFailed {
        note: "certificate",
        filename: filename.clone(),
        err,
    })?;

    let certs = pem::parse_many(content)
        .map_err(|err| TlsError::CertificateParse {
            filename: filename.clone(),
            err: io::Error::new(ErrorKind::InvalidData, err),
        })?
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect::<Vec<_>>();

    if certs.is_empty() {
        return Err(TlsError::MissingCertificate);
    }

    Ok(certs)
}

fn load_private_key(filename: &PathBuf) -> Result<PrivateKeyDer<'static>, TlsError> {
    let content = fs::read(filename).map_err(|err| TlsError::FileReadFailed {
        note: "private key",
        filename: filename.clone(),
        err,
    })?;

    let parse_err = |err: io::Error| TlsError::PrivateKeyParse {
        filename: filename.clone(),
        err,
    };

    let key = pem::parse_many(content)
        .map_err(|err| parse_err(io::Error::new(ErrorKind::InvalidData, err)))?
        .into_iter()
        .find(|block| block.tag().ends_with("PRIVATE KEY"))
        .map(|block| block.into_contents())
        .ok_or_else(|| parse_err(io::Error::new(ErrorKind::InvalidData, "no private key found")))?;

    PrivateKeyDer::try_from(key)
        .map_err(|err| parse_err(io::Error::new(ErrorKind::InvalidData, err)))
}

pin_project! {
    /// A type wrapper for objects that can exist in either a raw state or
    /// wrapped by TLS handling.
    #[project = MaybeTlsProj]
    pub enum MaybeTls<R, T> {
        Raw{ #[pin] raw: R },
        Tls{ #[pin] tls: T },
    }
}

impl<R: fmt::Debug, T: fmt::Debug> fmt::Debug for MaybeTls<R, T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw { raw } => write!(fmt, "MaybeTls::Raw({:?})", raw),
            Self::Tls { tls } => write!(fmt, "MaybeTls::Tls({:?})", tls),
        }
    }
}

impl<R: AsyncRead, T: AsyncRead> AsyncRead for MaybeTls<R, T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsProj::Tls { tls } => tls.poll_read(cx, buf),
            MaybeTlsProj::Raw { raw } => raw.poll_read(cx, buf),
        }
    }
}

impl<R: AsyncWrite, T: AsyncWrite> AsyncWrite for MaybeTls<R, T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeTlsProj::Tls { tls } => tls.poll_write(cx, buf),
            MaybeTlsProj::Raw { raw } => raw.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsProj::Tls { tls } => tls.poll_flush(cx),
            MaybeTlsProj::Raw { raw } => raw.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsProj::Tls { tls } => tls.poll_shutdown(cx),
            MaybeTlsProj::Raw { raw } => raw.poll_shutdown(cx),
        }
    }
}

pub struct MaybeTlsListener {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

impl MaybeTlsListener {
    pub async fn bind(addr: &SocketAddr, tls: Option<&TlsConfig>) -> Result<Self, TlsError> {
        let listener = TcpListener::bind(addr).await.map_err(TlsError::TcpBind)?;

        let acceptor = match tls {
            Some(tls) => {
                let config = tls.server_config()?;
                Some(TlsAcceptor::from(Arc::new(config)))
            }
            None => None,
        };

        Ok(Self { listener, acceptor })
    }

    pub async fn accept(&mut self) -> Result<MaybeTlsIncomingStream<TcpStream>, TlsError> {
        self.listener
            .accept()
            .await
            .map(|(stream, peer_addr)| {
                MaybeTlsIncomingStream::new(stream, peer_addr, self.acceptor.clone())
            })
            .map_err(TlsError::IncomingListener)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl From<TcpListener> for MaybeTlsListener {
    fn from(listener: TcpListener) -> Self {
        Self {
            listener,
            acceptor: None,
        }
    }
}

pub struct MaybeTlsIncomingStream<S> {
    state: StreamState<S>,
    // BoxFuture doesn't allow access to the inner stream, but users
    // of MaybeTlsIncomingStream want access to the peer address while
    // still handshaking, so we have to cache it here.
    peer_addr: SocketAddr,
}

type MaybeTlsStream<S> = MaybeTls<S, TlsStream<S>>;

enum StreamState<S> {
    Accepted(MaybeTlsStream<S>),
    Accepting(BoxFuture<'static, Result<TlsStream<S>, TlsError>>),
    AcceptError(String),
    Closed,
}

impl<S> MaybeTlsIncomingStream<S> {
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl MaybeTlsIncomingStream<TcpStream> {
    fn new(stream: TcpStream, peer_addr: SocketAddr, acceptor: Option<TlsAcceptor>) -> Self {
        let state = match acceptor {
            Some(acceptor) => StreamState::Accepting(
                async move { acceptor.accept(stream).await.map_err(TlsError::Handshake) }.boxed(),
            ),
            None => StreamState::Accepted(MaybeTlsStream::Raw { raw: stream }),
        };

        Self { state, peer_addr }
    }

    fn poll_io<T, F>(self: Pin<&mut Self>, cx: &mut Context, poll_fn: F) -> Poll<io::Result<T>>
    where
        F: FnOnce(Pin<&mut MaybeTlsStream<TcpStream>>, &mut Context) -> Poll<io::Result<T>>,
    {
        let this = self.get_mut();
        loop {
            return match &mut this.state {
                StreamState::Accepted(stream) => poll_fn(Pin::new(stream), cx),
                StreamState::Accepting(fut) => match ready!(fut.as_mut().poll(cx)) {
                    Ok(stream) => {
                        this.state = StreamState::Accepted(MaybeTlsStream::Tls { tls: stream });
                        continue;
                    }
                    Err(err) => {
                        let err = Error::other(err);
                        this.state = StreamState::AcceptError(err.to_string());
                        Poll::Ready(Err(err))
                    }
                },
                StreamState::AcceptError(err) => Poll::Ready(Err(Error::other(err.to_owned()))),
                StreamState::Closed => Poll::Ready(Err(ErrorKind::BrokenPipe.into())),
            };
        }
    }
}

impl AsyncRead for MaybeTlsIncomingStream<TcpStream> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.poll_io(cx, |s, cx| s.poll_read(cx, buf))
    }
}

impl AsyncWrite for MaybeTlsIncomingStream<TcpStream> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.poll_io(cx, |s, cx| s.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        self.poll_io(cx, |s, cx| s.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            StreamState::Accepted(stream) => match Pin::new(stream).poll_shutdown(cx) {
                Poll::Ready(Ok(())) => {
                    this.state = StreamState::Closed;
                    Poll::Ready(Ok(()))
                }
                poll_result => poll_result,
            },
            StreamState::Accepting(fut) => match ready!(fut.as_mut().poll(cx)) {
                Ok(stream) => {
                    this.state = StreamState::Accepted(MaybeTlsStream::Tls { tls: stream });
                    Poll::Pending
                }
                Err(err) => {
                    let err = Error::other(err);
                    this.state = StreamState::AcceptError(err.to_string());
                    Poll::Ready(Err(err))
                }
            },
            StreamState::AcceptError(err) => Poll::Ready(Err(Error::other(err.to_owned()))),
            StreamState::Closed => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn plain_send_and_recv() {
        let addr = "127.0.0.1:0".parse::<SocketAddr>().unwrap();
        let mut listener = MaybeTlsListener::bind(&addr, None).await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"foobar").await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut incoming = listener.accept().await.unwrap();
        let mut received = String::new();
        incoming.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "foobar");
    }
}
