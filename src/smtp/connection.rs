use std::net::SocketAddr;

use smtp_proto::Request;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::models::TenantId;
use crate::smtp::session::{AcceptedEnvelope, DataReply, ListenerRole, SessionReply, SmtpSession};

const BUFFER_SIZE: usize = 16 * 1024;
const CODE_READY: u16 = 220;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),
    #[error("failed to write tcp stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read tcp stream: {0}")]
    Read(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
}

/// Resolves `(username, password)` offered over SASL to the tenant they
/// belong to. The submission credential model is an API key used as the
/// SASL password; the username is accepted but not otherwise checked,
/// matching the "only the session contract is referenced" scope note for
/// the authentication flow.
#[async_trait::async_trait]
pub trait SubmissionAuthenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Option<TenantId>;
}

/// Hands a fully-ingested envelope off to the pipeline. Implemented
/// differently for the MX listener (persists as `direction=inbound`) and
/// the Submission listener (re-enters the outbound pipeline).
#[async_trait::async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn accept(&self, role: ListenerRole, peer: SocketAddr, envelope: AcceptedEnvelope) -> Result<(), String>;
}

pub async fn handle(
    stream: &mut (impl AsyncReadExt + AsyncWriteExt + Unpin),
    role: ListenerRole,
    peer_addr: SocketAddr,
    max_message_bytes: usize,
    tls_active: bool,
    authenticator: &dyn SubmissionAuthenticator,
    sink: &dyn EnvelopeSink,
) -> Result<(), ConnectionError> {
    let (source, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(source);
    let mut buffer = Vec::with_capacity(BUFFER_SIZE);
    let mut session = SmtpSession::new(role, peer_addr, max_message_bytes, tls_active);

    write_reply(CODE_READY, "ultrazend ready", &mut write_half).await?;

    'session: loop {
        read_line(&mut reader, &mut buffer).await?;
        let request = Request::parse(&mut buffer.iter());

        match session.handle(request).await {
            SessionReply::ReplyAndContinue(code, message) => {
                write_reply(code, &message, &mut write_half).await?;
            }
            SessionReply::ReplyAndStop(code, message) => {
                write_reply(code, &message, &mut write_half).await?;
                break;
            }
            SessionReply::RawReply(buf) => {
                write_half.write_all(&buf).await.map_err(ConnectionError::Write)?;
            }
            SessionReply::IngestAuth(code, message) => {
                write_reply(code, &message, &mut write_half).await?;
                read_line(&mut reader, &mut buffer).await?;
                let trimmed = trim_crlf(&buffer);
                let (code, message) =
                    session.handle_auth_blob(trimmed, |u, p| async move { authenticator.authenticate(&u, &p).await }).await;
                write_reply(code, &message, &mut write_half).await?;
            }
            SessionReply::IngestData(code, message) => {
                write_reply(code, &message, &mut write_half).await?;

                'data: loop {
                    read_data_chunk(&mut reader, &mut buffer).await?;

                    match session.handle_data(&buffer).await {
                        DataReply::ContinueIngest => continue 'data,
                        DataReply::ReplyAndContinue(code, message) => {
                            write_reply(code, &message, &mut write_half).await?;
                            if let Some(envelope) = session.completed.take()
                                && let Err(reason) = sink.accept(role, peer_addr, envelope).await
                            {
                                write_reply(554, &format!("5.7.1 {reason}"), &mut write_half).await?;
                            }
                            continue 'session;
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn trim_crlf(buf: &[u8]) -> &[u8] {
    buf.strip_suffix(b"\r\n").or_else(|| buf.strip_suffix(b"\n")).unwrap_or(buf)
}

async fn read_line(reader: impl AsyncBufReadExt + Unpin, buffer: &mut Vec<u8>) -> Result<(), ConnectionError> {
    buffer.clear();
    let size = reader.take(BUFFER_SIZE as u64).read_until(b'\n', buffer).await.map_err(ConnectionError::Read)?;
    if size == 0 {
        return Err(ConnectionError::Dropped);
    }
    Ok(())
}

/// `DATA` bodies can arrive split across multiple reads; each call appends
/// whatever is currently available rather than requiring a full line.
async fn read_data_chunk(reader: impl AsyncBufReadExt + Unpin, buffer: &mut Vec<u8>) -> Result<(), ConnectionError> {
    buffer.clear();
    let size = reader.take(BUFFER_SIZE as u64).read_buf(buffer).await.map_err(ConnectionError::Read)?;
    if size == 0 {
        return Err(ConnectionError::Dropped);
    }
    Ok(())
}

async fn write_reply(code: u16, message: &str, mut sink: impl AsyncWriteExt + Unpin) -> Result<(), ConnectionError> {
    sink.write_all(format!("{code} {message}\r\n").as_bytes()).await.map_err(ConnectionError::Write)
}
