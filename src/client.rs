//! One-shot query client.
//!
//! Connects to a running server, sends a single query and returns the reply
//! token. It reads the same configuration file as the server: `host` and
//! `port` select the server, and with `use_ssl` on the certificate in
//! `certfile` is the only one trusted.

use crate::config::{CliArgs, FileConfig};
use crate::error::ClientError;
use crate::tls;
use rustls::pki_types::ServerName;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Ceiling on each of connecting, the handshake and the exchange
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest reply read back
const MAX_REPLY: u64 = 1024;

/// Where and how to reach the server
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Certificate to trust; `Some` means connect over TLS
    pub trust_cert: Option<PathBuf>,
    pub timeout: Duration,
}

impl ClientConfig {
    /// Resolve from CLI args and the optional config file.
    pub fn from_cli(cli: &CliArgs) -> Result<Self, ClientError> {
        let file = match cli.config {
            Some(ref path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::merge(cli, file))
    }

    /// CLI host and port win over file values.
    pub fn merge(cli: &CliArgs, file: FileConfig) -> Self {
        let trust_cert = if file.tls.use_ssl.unwrap_or(false) {
            Some(
                file.tls
                    .certfile
                    .unwrap_or_else(crate::config::default_certfile),
            )
        } else {
            None
        };

        ClientConfig {
            host: cli
                .host
                .clone()
                .or(file.server.host)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port: cli
                .port
                .or(file.server.port)
                .unwrap_or_else(crate::config::default_port),
            trust_cert,
            timeout: CLIENT_TIMEOUT,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Send `query` and return the server's reply with surrounding whitespace
/// removed.
pub async fn send_query(config: &ClientConfig, query: &str) -> Result<String, ClientError> {
    let address = config.address();
    let tcp = timeout(config.timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| ClientError::Timeout(config.timeout))?
        .map_err(|source| ClientError::Connect {
            address: address.clone(),
            source,
        })?;
    tcp.set_nodelay(true)?;
    debug!(address = %address, tls = config.trust_cert.is_some(), "Connected");

    match &config.trust_cert {
        Some(cert) => {
            let connector = tls::load_connector(cert)?;
            let server_name = ServerName::try_from(config.host.clone())
                .map_err(|_| ClientError::InvalidServerName(config.host.clone()))?;
            let stream = timeout(config.timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| ClientError::Timeout(config.timeout))?
                .map_err(ClientError::Handshake)?;
            exchange(stream, query, config.timeout).await
        }
        None => exchange(tcp, query, config.timeout).await,
    }
}

async fn exchange<S>(mut stream: S, query: &str, limit: Duration) -> Result<String, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let io = async {
        stream.write_all(query.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reply = Vec::new();
        // The server may close without a TLS close_notify once it has replied
        if let Err(e) = (&mut stream).take(MAX_REPLY).read_to_end(&mut reply).await {
            if reply.is_empty() {
                return Err(e);
            }
        }
        Ok::<_, std::io::Error>(reply)
    };

    let reply = timeout(limit, io)
        .await
        .map_err(|_| ClientError::Timeout(limit))??;
    Ok(String::from_utf8_lossy(&reply).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{dataset_file, fixture, test_config, tls_config, TestServer};

    fn client_config(server: &TestServer, trust_cert: Option<PathBuf>) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: server.addr.port(),
            trust_cert,
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_merge_defaults() {
        let config = ClientConfig::merge(&CliArgs::default(), FileConfig::default());
        assert_eq!(config.address(), "127.0.0.1:44445");
        assert_eq!(config.trust_cert, None);
    }

    #[test]
    fn test_merge_from_server_config_file() {
        let file = FileConfig::from_key_value(
            "linuxpath=data.txt\nhost=10.0.0.5\nport=5000\nuse_ssl=true",
        )
        .unwrap();
        let config = ClientConfig::merge(&CliArgs::default(), file);
        assert_eq!(config.address(), "10.0.0.5:5000");
        assert_eq!(config.trust_cert, Some(PathBuf::from("ssl/cert.pem")));
    }

    #[test]
    fn test_merge_cli_overrides_file() {
        let cli = CliArgs {
            host: Some("localhost".to_string()),
            port: Some(6000),
            ..CliArgs::default()
        };
        let file = FileConfig::from_key_value("host=10.0.0.5\nport=5000").unwrap();
        let config = ClientConfig::merge(&cli, file);
        assert_eq!(config.address(), "localhost:6000");
    }

    #[tokio::test]
    async fn test_query_plain_server() {
        let dataset = dataset_file(b"apple\nbanana\n");
        let server = TestServer::start(test_config(&dataset, false)).await;
        let config = client_config(&server, None);

        assert_eq!(send_query(&config, "apple").await.unwrap(), "STRING EXISTS");
        assert_eq!(
            send_query(&config, "cherry").await.unwrap(),
            "STRING NOT FOUND"
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_query_tls_server() {
        let dataset = dataset_file(b"apple\nbanana\n");
        let server = TestServer::start(tls_config(&dataset)).await;
        let config = client_config(&server, Some(fixture("cert.pem")));

        assert_eq!(send_query(&config, "banana").await.unwrap(), "STRING EXISTS");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_query_unreachable_server() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            trust_cert: None,
            timeout: Duration::from_secs(2),
        };

        let err = send_query(&config, "apple").await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
