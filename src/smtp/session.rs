//! Protocol state machine shared by the MX and Submission listeners
//!. The two roles differ in whether SASL auth is required
//! before `MAIL FROM`; both listeners wrap connections in TLS at accept
//! time (see `smtp::server`), so `STARTTLS` is always reported already
//! active rather than negotiated mid-session.

use std::net::SocketAddr;

use email_address::EmailAddress;
use smtp_proto::{
    EhloResponse, Request, AUTH_LOGIN, AUTH_PLAIN, EXT_8BIT_MIME, EXT_AUTH, EXT_ENHANCED_STATUS_CODES,
    EXT_SMTP_UTF8,
};
use tracing::{debug, trace};

use crate::models::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerRole {
    /// Port 25: no auth, accepts mail for any recipient, persisted as
    /// `direction=inbound`.
    Mx,
    /// Port 587: SASL PLAIN/LOGIN required over TLS; accepted mail
    /// re-enters the outbound pipeline as if posted via the API.
    Submission,
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    IngestData(u16, String),
    IngestAuth(u16, String),
}

pub enum DataReply {
    ContinueIngest,
    ReplyAndContinue(u16, String),
}

/// A fully-formed envelope ready to be handed to the inbound pipeline.
pub struct AcceptedEnvelope {
    pub from: String,
    pub to: Vec<String>,
    pub raw: Vec<u8>,
    pub authenticated_tenant: Option<TenantId>,
}

enum PendingAuth {
    None,
    AwaitingPlainBlob,
    AwaitingLoginUsername,
    AwaitingLoginPassword { username: String },
}

pub struct SmtpSession {
    role: ListenerRole,
    peer_addr: SocketAddr,
    max_message_bytes: usize,
    ehlo_host: Option<String>,
    tls_active: bool,
    authenticated_tenant: Option<TenantId>,
    pending_auth: PendingAuth,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    data_buffer: Vec<u8>,
    pub completed: Option<AcceptedEnvelope>,
}

impl SmtpSession {
    const RESPONSE_OK: &'static str = "2.0.0 Ok";
    const RESPONSE_FROM_OK: &'static str = "2.1.0 Originator ok";
    const RESPONSE_TO_OK: &'static str = "2.1.5 Recipient ok";
    const RESPONSE_START_DATA: &'static str = "3.5.4 Start mail input; end with <CRLF>.<CRLF>";
    const RESPONSE_BYE: &'static str = "2.0.0 Goodbye";
    const RESPONSE_MESSAGE_ACCEPTED: &'static str = "2.6.0 Message queued for delivery";
    const RESPONSE_MESSAGE_TOO_LARGE: &'static str = "5.3.4 Message too large";
    const RESPONSE_BAD_SEQUENCE: &'static str = "5.5.1 Bad sequence of commands";
    const RESPONSE_MAIL_FIRST: &'static str = "5.5.1 Use MAIL first";
    const RESPONSE_HELLO_FIRST: &'static str = "5.5.1 Be nice and say EHLO first";
    const RESPONSE_NO_VALID_RECIPIENTS: &'static str = "5.5.1 No valid recipients";
    const RESPONSE_INVALID_ADDRESS: &'static str = "5.1.3 Address is not valid";
    const RESPONSE_NESTED_MAIL: &'static str = "5.5.1 Error: nested MAIL command";
    const RESPONSE_ALREADY_AUTHENTICATED: &'static str = "5.5.1 Already authenticated";
    const RESPONSE_AUTH_ERROR: &'static str = "5.7.8 Authentication credentials invalid";
    const RESPONSE_AUTHENTICATION_REQUIRED: &'static str = "5.7.1 Authentication required";
    const RESPONSE_STARTTLS_REQUIRED: &'static str = "5.7.1 STARTTLS required before AUTH";
    const RESPONSE_ALREADY_TLS: &'static str = "5.7.4 Already in TLS mode";
    const RESPONSE_COMMAND_NOT_IMPLEMENTED: &'static str = "5.5.1 Command not implemented";
    const RESPONSE_MUST_USE_ESMTP: &'static str = "5.5.1 Must use EHLO";
    const RESPONSE_SYNTAX_ERROR: &'static str = "5.5.2 Syntax error";

    /// `tls_active` reflects whether the listener already wrapped the
    /// connection in TLS before the session started (both listeners in this
    /// deployment use implicit TLS rather than mid-session `STARTTLS` — see
    /// `smtp::server`).
    pub fn new(role: ListenerRole, peer_addr: SocketAddr, max_message_bytes: usize, tls_active: bool) -> Self {
        SmtpSession {
            role,
            peer_addr,
            max_message_bytes,
            ehlo_host: None,
            tls_active,
            authenticated_tenant: None,
            pending_auth: PendingAuth::None,
            mail_from: None,
            rcpt_to: Vec::new(),
            data_buffer: Vec::new(),
            completed: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer_addr
    }

    fn requires_auth(&self) -> bool {
        matches!(self.role, ListenerRole::Submission)
    }

    pub async fn handle(&mut self, request: Result<Request<String>, smtp_proto::Error>) -> SessionReply {
        let request = match request {
            Ok(r) => r,
            Err(e) => return SessionReply::ReplyAndContinue(500, e.to_string()),
        };

        if !matches!(request, Request::Auth { .. }) {
            trace!(peer = %self.peer_addr, ?request, "smtp command");
        }

        match request {
            Request::Ehlo { host } => {
                let mut response = EhloResponse::new(&host);
                response.capabilities = EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_SMTP_UTF8;
                if self.requires_auth() {
                    response.capabilities |= EXT_AUTH;
                    response.auth_mechanisms = AUTH_PLAIN | AUTH_LOGIN;
                }
                let mut buf = Vec::with_capacity(64);
                response.write(&mut buf).ok();
                self.ehlo_host = Some(host);
                SessionReply::RawReply(buf)
            }
            Request::Helo { host: _ } => SessionReply::ReplyAndContinue(502, Self::RESPONSE_MUST_USE_ESMTP.into()),
            Request::StartTls => SessionReply::ReplyAndContinue(503, Self::RESPONSE_ALREADY_TLS.into()),
            Request::Auth { mechanism, .. } if mechanism == AUTH_PLAIN => {
                if self.requires_auth() && !self.tls_active {
                    return SessionReply::ReplyAndContinue(530, Self::RESPONSE_STARTTLS_REQUIRED.into());
                }
                if self.authenticated_tenant.is_some() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_ALREADY_AUTHENTICATED.into());
                }
                self.pending_auth = PendingAuth::AwaitingPlainBlob;
                SessionReply::IngestAuth(334, " ".into())
            }
            Request::Auth { mechanism, .. } if mechanism == AUTH_LOGIN => {
                if self.requires_auth() && !self.tls_active {
                    return SessionReply::ReplyAndContinue(530, Self::RESPONSE_STARTTLS_REQUIRED.into());
                }
                self.pending_auth = PendingAuth::AwaitingLoginUsername;
                SessionReply::IngestAuth(334, base64ct::Base64::encode_string(b"Username:"))
            }
            Request::Auth { .. } => SessionReply::ReplyAndContinue(504, "5.5.4 Unsupported authentication mechanism".into()),
            Request::Mail { from } => {
                if self.ehlo_host.is_none() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_HELLO_FIRST.into());
                }
                if self.requires_auth() && self.authenticated_tenant.is_none() {
                    return SessionReply::ReplyAndContinue(530, Self::RESPONSE_AUTHENTICATION_REQUIRED.into());
                }
                if self.mail_from.is_some() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NESTED_MAIL.into());
                }
                let address = from.address;
                if address.parse::<EmailAddress>().is_err() {
                    return SessionReply::ReplyAndContinue(553, Self::RESPONSE_INVALID_ADDRESS.into());
                }
                self.mail_from = Some(address);
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_FROM_OK.into())
            }
            Request::Rcpt { to } => {
                if self.mail_from.is_none() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into());
                }
                let address = to.address;
                if address.parse::<EmailAddress>().is_err() {
                    return SessionReply::ReplyAndContinue(553, Self::RESPONSE_INVALID_ADDRESS.into());
                }
                self.rcpt_to.push(address);
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_TO_OK.into())
            }
            Request::Data => {
                if self.rcpt_to.is_empty() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NO_VALID_RECIPIENTS.into());
                }
                self.data_buffer.clear();
                SessionReply::IngestData(354, Self::RESPONSE_START_DATA.into())
            }
            Request::Rset => {
                self.mail_from = None;
                self.rcpt_to.clear();
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Noop { .. } => SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into()),
            Request::Quit => SessionReply::ReplyAndStop(221, Self::RESPONSE_BYE.into()),
            Request::Vrfy { .. } | Request::Expn { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            _ => SessionReply::ReplyAndContinue(500, Self::RESPONSE_SYNTAX_ERROR.into()),
        }
    }

    /// Appends `chunk` to the in-progress `DATA` body; returns when the
    /// terminating `\r\n.\r\n` has been seen.
    pub async fn handle_data(&mut self, chunk: &[u8]) -> DataReply {
        self.data_buffer.extend_from_slice(chunk);

        if self.data_buffer.len() > self.max_message_bytes {
            self.mail_from = None;
            self.rcpt_to.clear();
            self.data_buffer.clear();
            return DataReply::ReplyAndContinue(552, Self::RESPONSE_MESSAGE_TOO_LARGE.into());
        }

        if !self.data_buffer.ends_with(b"\r\n.\r\n") {
            return DataReply::ContinueIngest;
        }

        let raw = self.data_buffer[..self.data_buffer.len() - 3].to_vec();
        self.completed = Some(AcceptedEnvelope {
            from: self.mail_from.take().unwrap_or_default(),
            to: std::mem::take(&mut self.rcpt_to),
            raw,
            authenticated_tenant: self.authenticated_tenant,
        });
        self.data_buffer.clear();

        DataReply::ReplyAndContinue(250, Self::RESPONSE_MESSAGE_ACCEPTED.into())
    }

    /// Feeds the base64 blob following an `AUTH` challenge; `authenticate`
    /// resolves `(username, password)` to a tenant.
    pub async fn handle_auth_blob<F, Fut>(&mut self, blob: &[u8], authenticate: F) -> (u16, String)
    where
        F: FnOnce(String, String) -> Fut,
        Fut: std::future::Future<Output = Option<TenantId>>,
    {
        use base64ct::{Base64, Encoding};

        match std::mem::replace(&mut self.pending_auth, PendingAuth::None) {
            PendingAuth::AwaitingPlainBlob => {
                let Ok(decoded) = Base64::decode_vec(std::str::from_utf8(blob).unwrap_or("").trim()) else {
                    return (501, Self::RESPONSE_SYNTAX_ERROR.into());
                };
                let mut parts = decoded.split(|&b| b == 0);
                let _authzid = parts.next();
                let Some(username) = parts.next() else {
                    return (501, Self::RESPONSE_SYNTAX_ERROR.into());
                };
                let Some(password) = parts.next() else {
                    return (501, Self::RESPONSE_SYNTAX_ERROR.into());
                };
                let username = String::from_utf8_lossy(username).to_string();
                let password = String::from_utf8_lossy(password).to_string();
                self.finish_auth(authenticate(username, password).await)
            }
            PendingAuth::AwaitingLoginUsername => {
                let Ok(decoded) = Base64::decode_vec(std::str::from_utf8(blob).unwrap_or("").trim()) else {
                    return (501, Self::RESPONSE_SYNTAX_ERROR.into());
                };
                let username = String::from_utf8_lossy(&decoded).to_string();
                self.pending_auth = PendingAuth::AwaitingLoginPassword { username };
                (334, Base64::encode_string(b"Password:"))
            }
            PendingAuth::AwaitingLoginPassword { username } => {
                let Ok(decoded) = Base64::decode_vec(std::str::from_utf8(blob).unwrap_or("").trim()) else {
                    return (501, Self::RESPONSE_SYNTAX_ERROR.into());
                };
                let password = String::from_utf8_lossy(&decoded).to_string();
                self.finish_auth(authenticate(username, password).await)
            }
            PendingAuth::None => (503, Self::RESPONSE_BAD_SEQUENCE.into()),
        }
    }

    fn finish_auth(&mut self, tenant: Option<TenantId>) -> (u16, String) {
        match tenant {
            Some(tenant_id) => {
                self.authenticated_tenant = Some(tenant_id);
                debug!(peer = %self.peer_addr, "smtp authentication succeeded");
                (235, "2.7.0 Authentication succeeded".into())
            }
            None => (535, Self::RESPONSE_AUTH_ERROR.into()),
        }
    }
}
