#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tower_lsp_server::Server;

use super::fake::FakeSourcekitd;
use swiftls::lsp::Backend;

/// In-process LSP test client backed by `tokio::io::duplex`.
///
/// The server runs in a background task on the same tokio runtime, talking
/// to a scripted fake daemon instead of a real sourcekitd.
pub struct TestClient {
    write: tokio::io::DuplexStream,
    read: BufReader<tokio::io::DuplexStream>,
    _server: tokio::task::JoinHandle<()>,
    next_id: AtomicI64,
}

impl TestClient {
    pub fn new(fake: Arc<FakeSourcekitd>) -> Self {
        // Two duplex pairs: (client→server) and (server→client).
        let (client_write, server_read) = tokio::io::duplex(65536);
        let (server_write, client_read) = tokio::io::duplex(65536);

        let (service, socket) =
            swiftls::lsp::service(move |client| Backend::with_service(client, fake));
        let server_handle = tokio::spawn(async move {
            Server::new(server_read, server_write, socket)
                .serve(service)
                .await;
        });

        Self {
            write: client_write,
            read: BufReader::new(client_read),
            _server: server_handle,
            next_id: AtomicI64::new(1),
        }
    }

    /// Send a raw JSON-RPC message (request or notification) with LSP framing.
    pub async fn send(&mut self, msg: serde_json::Value) {
        let json = serde_json::to_string(&msg).unwrap();
        let header = format!("Content-Length: {}\r\n\r\n", json.len());
        self.write.write_all(header.as_bytes()).await.unwrap();
        self.write.write_all(json.as_bytes()).await.unwrap();
        self.write.flush().await.unwrap();
    }

    /// Receive the next LSP-framed JSON-RPC message.
    pub async fn recv(&mut self) -> serde_json::Value {
        let mut content_length: usize = 0;
        loop {
            let mut line = String::new();
            self.read.read_line(&mut line).await.unwrap();
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(len_str) = line.strip_prefix("Content-Length: ") {
                content_length = len_str.trim().parse().unwrap();
            }
        }
        let mut body = vec![0u8; content_length];
        self.read.read_exact(&mut body).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    /// Receive messages, discarding everything except the first message with
    /// the given `method` field. Returns the full message.
    pub async fn recv_notification(&mut self, method: &str) -> serde_json::Value {
        loop {
            let msg = self.recv().await;
            if msg["method"].as_str() == Some(method) {
                return msg;
            }
        }
    }

    /// Send a request and wait for its response, skipping notifications and
    /// server-to-client requests.
    pub async fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        }))
        .await;

        loop {
            let msg = self.recv().await;
            if msg.get("id") == Some(&serde_json::json!(id)) && msg.get("method").is_none() {
                return msg;
            }
        }
    }

    /// Send `initialize` request and `initialized` notification; return the
    /// `InitializeResult`.
    pub async fn initialize(&mut self) -> serde_json::Value {
        self.initialize_with_capabilities(serde_json::json!({})).await
    }

    pub async fn initialize_with_capabilities(
        &mut self,
        capabilities: serde_json::Value,
    ) -> serde_json::Value {
        let response = self
            .request(
                "initialize",
                serde_json::json!({
                    "capabilities": capabilities,
                    "processId": null,
                    "rootUri": null
                }),
            )
            .await;

        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "initialized",
            "params": {}
        }))
        .await;

        response["result"].clone()
    }

    pub async fn did_open(&mut self, uri: &str, version: i32, text: &str) {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didOpen",
            "params": {
                "textDocument": {
                    "uri": uri,
                    "languageId": "swift",
                    "version": version,
                    "text": text
                }
            }
        }))
        .await;
    }

    /// Send `textDocument/didChange` with incremental changes.
    pub async fn did_change(
        &mut self,
        uri: &str,
        version: i32,
        changes: serde_json::Value,
    ) {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didChange",
            "params": {
                "textDocument": { "uri": uri, "version": version },
                "contentChanges": changes
            }
        }))
        .await;
    }

    pub async fn did_close(&mut self, uri: &str) {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didClose",
            "params": {
                "textDocument": { "uri": uri }
            }
        }))
        .await;
    }

    pub async fn hover(&mut self, uri: &str, line: u32, character: u32) -> serde_json::Value {
        let response = self
            .request(
                "textDocument/hover",
                serde_json::json!({
                    "textDocument": { "uri": uri },
                    "position": { "line": line, "character": character }
                }),
            )
            .await;
        response["result"].clone()
    }

    pub async fn shutdown(&mut self) {
        let _ = self.request("shutdown", serde_json::Value::Null).await;
    }
}

/// Convenience: build a `file://` URI from an absolute path string.
pub fn file_uri(path: &str) -> String {
    format!("file://{path}")
}
