use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::select;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{rustls, TlsAcceptor};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::config::Config;
use crate::smtp::connection::{self, EnvelopeSink, SubmissionAuthenticator};
use crate::smtp::session::ListenerRole;

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to load TLS certificate: {0}")]
    Certificate(io::Error),
    #[error("failed to load TLS private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key file")]
    PrivateKeyNotFound,
    #[error("failed to configure TLS: {0}")]
    Tls(rustls::Error),
    #[error("failed to listen on address: {0}")]
    Listen(io::Error),
}

fn load_tls_materials(cert_path: &str, key_path: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SmtpServerError> {
    let mut cert_reader = io::BufReader::new(std::fs::File::open(cert_path).map_err(SmtpServerError::Certificate)?);
    let mut key_reader = io::BufReader::new(std::fs::File::open(key_path).map_err(SmtpServerError::PrivateKey)?);

    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, io::Error>>().map_err(SmtpServerError::Certificate)?;
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(SmtpServerError::PrivateKey)?
        .ok_or(SmtpServerError::PrivateKeyNotFound)?;

    Ok((certs, key))
}

fn build_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, SmtpServerError> {
    let (certs, key) = load_tls_materials(cert_path, key_path)?;
    let config = rustls::ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key).map_err(SmtpServerError::Tls)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// The no-auth, plaintext MX listener (port 25). Accepts mail for any
/// recipient and hands it to `sink` as `direction=inbound`.
pub async fn serve_mx(
    config: Arc<Config>,
    sink: Arc<dyn EnvelopeSink>,
    no_auth: Arc<dyn SubmissionAuthenticator>,
    shutdown: CancellationToken,
) -> Result<(), SmtpServerError> {
    let listener = TcpListener::bind(config.mx_addr).await.map_err(SmtpServerError::Listen)?;
    info!(addr = %config.mx_addr, "mx listener started");

    loop {
        select! {
            _ = shutdown.cancelled() => {
                info!("shutting down mx listener");
                return Ok(());
            }
            accepted = listener.accept() => {
                let Ok((mut stream, peer_addr)) = accepted.inspect_err(|err| error!("failed to accept mx connection: {err}")) else {
                    continue;
                };
                trace!(peer = %peer_addr, "new mx connection");
                let sink = sink.clone();
                let no_auth = no_auth.clone();
                let max_bytes = config.max_message_bytes;
                tokio::spawn(async move {
                    if let Err(err) = connection::handle(&mut stream, ListenerRole::Mx, peer_addr, max_bytes, false, no_auth.as_ref(), sink.as_ref()).await {
                        trace!("mx connection with {peer_addr} ended: {err}");
                    }
                });
            }
        }
    }
}

/// The SASL-authenticated Submission listener (port 587), wrapped in
/// implicit TLS at accept time. The certificate is reloaded periodically
/// so a renewed cert on disk takes effect without a restart.
pub async fn serve_submission(
    config: Arc<Config>,
    sink: Arc<dyn EnvelopeSink>,
    authenticator: Arc<dyn SubmissionAuthenticator>,
    shutdown: CancellationToken,
) -> Result<(), SmtpServerError> {
    let listener = TcpListener::bind(config.submission_addr).await.map_err(SmtpServerError::Listen)?;
    let acceptor = Arc::new(tokio::sync::RwLock::new(build_tls_acceptor(&config.tls.cert_path, &config.tls.key_path)?));
    info!(addr = %config.submission_addr, "submission listener started");

    {
        let acceptor = acceptor.clone();
        let cert_path = config.tls.cert_path.clone();
        let key_path = config.tls.key_path.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(23 * 3600));
            loop {
                select! {
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => {
                        match build_tls_acceptor(&cert_path, &key_path) {
                            Ok(new_acceptor) => {
                                *acceptor.write().await = new_acceptor;
                                info!("reloaded submission TLS certificate");
                            }
                            Err(err) => error!("failed to reload TLS certificate: {err}"),
                        }
                    }
                }
            }
        });
    }

    loop {
        select! {
            _ = shutdown.cancelled() => {
                info!("shutting down submission listener");
                return Ok(());
            }
            accepted = listener.accept() => {
                let Ok((stream, peer_addr)) = accepted.inspect_err(|err| error!("failed to accept submission connection: {err}")) else {
                    continue;
                };
                trace!(peer = %peer_addr, "new submission connection");
                let acceptor = acceptor.clone();
                let sink = sink.clone();
                let authenticator = authenticator.clone();
                let max_bytes = config.max_message_bytes;
                tokio::spawn(async move {
                    let tls_stream = match acceptor.read().await.accept(stream).await {
                        Ok(s) => s,
                        Err(err) => {
                            trace!("tls handshake with {peer_addr} failed: {err}");
                            return;
                        }
                    };
                    let mut tls_stream = tls_stream;
                    if let Err(err) =
                        connection::handle(&mut tls_stream, ListenerRole::Submission, peer_addr, max_bytes, true, authenticator.as_ref(), sink.as_ref()).await
                    {
                        trace!("submission connection with {peer_addr} ended: {err}");
                    }
                });
            }
        }
    }
}
