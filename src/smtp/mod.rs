//! Inbound SMTP: MX (25) and Submission (587) listeners.

mod connection;
pub mod server;
mod session;

pub use connection::{EnvelopeSink, SubmissionAuthenticator};
pub use session::{AcceptedEnvelope, ListenerRole};

/// Used by the MX listener, which never authenticates a sender.
pub struct NoAuth;

#[async_trait::async_trait]
impl SubmissionAuthenticator for NoAuth {
    async fn authenticate(&self, _username: &str, _password: &str) -> Option<crate::models::TenantId> {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Config, DkimConfig, Environment, RetryConfig, StorageBackend, TlsConfig, WorkerConfig};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct ChannelSink(mpsc::Sender<AcceptedEnvelope>);

    #[async_trait::async_trait]
    impl EnvelopeSink for ChannelSink {
        async fn accept(&self, _role: ListenerRole, _peer: std::net::SocketAddr, envelope: AcceptedEnvelope) -> Result<(), String> {
            self.0.send(envelope).await.map_err(|e| e.to_string())
        }
    }

    fn test_config(mx_port: u16) -> Config {
        Config {
            environment: Environment::Development,
            hostname: "mail.test.example".into(),
            api_addr: "127.0.0.1:0".parse().unwrap(),
            mx_addr: format!("127.0.0.1:{mx_port}").parse().unwrap(),
            submission_addr: "127.0.0.1:0".parse().unwrap(),
            max_message_bytes: 1024 * 1024,
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            dkim: DkimConfig { fallback_domain: "mail.test.example".into() },
            rate_limit: crate::config::RateLimitConfig::default(),
            tls: TlsConfig { cert_path: "cert.pem".into(), key_path: "key.pem".into() },
            database_url: "sqlite::memory:".into(),
            storage_backend: StorageBackend::Sqlite,
            log_level: "info".into(),
            session_key_material: b"test-key".to_vec(),
            analytics_retention_days: 30,
            idempotency_window_hours: 24,
            nameservers: vec!["9.9.9.9:853".parse().unwrap()],
        }
    }

    #[tokio::test]
    async fn mx_listener_accepts_plaintext_mail() {
        let port = 12525u16;
        let config = Arc::new(test_config(port));
        let (tx, mut rx) = mpsc::channel(4);
        let sink: Arc<dyn EnvelopeSink> = Arc::new(ChannelSink(tx));
        let auth: Arc<dyn SubmissionAuthenticator> = Arc::new(NoAuth);
        let shutdown = CancellationToken::new();

        let server_shutdown = shutdown.clone();
        let server_config = config.clone();
        let handle = tokio::spawn(server::serve_mx(server_config, sink, auth, server_shutdown));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut greeting = [0u8; 64];
        let _ = stream.read(&mut greeting).await.unwrap();

        stream.write_all(b"EHLO client.example\r\n").await.unwrap();
        let mut buf = [0u8; 256];
        let _ = stream.read(&mut buf).await.unwrap();

        stream.write_all(b"MAIL FROM:<a@b.com>\r\n").await.unwrap();
        let _ = stream.read(&mut buf).await.unwrap();
        stream.write_all(b"RCPT TO:<c@d.com>\r\n").await.unwrap();
        let _ = stream.read(&mut buf).await.unwrap();
        stream.write_all(b"DATA\r\n").await.unwrap();
        let _ = stream.read(&mut buf).await.unwrap();
        stream.write_all(b"Subject: hi\r\n\r\nbody\r\n.\r\n").await.unwrap();
        let _ = stream.read(&mut buf).await.unwrap();
        stream.write_all(b"QUIT\r\n").await.unwrap();

        let envelope = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(envelope.from, "a@b.com");
        assert_eq!(envelope.to, vec!["c@d.com".to_string()]);

        shutdown.cancel();
        handle.abort();
    }
}
