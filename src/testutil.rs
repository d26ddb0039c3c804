//! Fixtures shared by tests that run a real server.

use crate::config::{Config, TlsConfig};
use crate::error::ServerError;
use crate::server::Server;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tokio::sync::oneshot;

pub fn dataset_file(contents: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents).unwrap();
    file
}

/// Path of a file under `testdata/`
pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("testdata")
        .join(name)
}

pub fn test_config(dataset: &NamedTempFile, reread_on_query: bool) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        dataset_path: dataset.path().to_path_buf(),
        reread_on_query,
        max_payload: 1024,
        tls: None,
        workers: None,
        max_connections: 64,
        log_level: "info".to_string(),
    }
}

pub fn tls_config(dataset: &NamedTempFile) -> Config {
    let mut config = test_config(dataset, false);
    config.tls = Some(TlsConfig {
        cert_path: fixture("cert.pem"),
        key_path: fixture("key.pem"),
    });
    config
}

/// Running server on an ephemeral port; `stop` shuts it down.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub async fn start(config: Config) -> Self {
        let server = Server::new(config).await.unwrap();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
        });

        Self {
            addr,
            shutdown: Some(tx),
            task,
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}
