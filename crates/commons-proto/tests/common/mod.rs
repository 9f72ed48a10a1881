#![allow(dead_code)]

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// What the fake Icecast server does after reading the request.
pub enum Reply {
    /// Write status line, headers and body, then close.
    Full {
        status: &'static str,
        headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
    },
    /// Write headers, then hold the connection open without sending audio.
    Stall { metaint: usize },
}

impl Reply {
    pub fn icy(metaint: usize, body: Vec<u8>) -> Self {
        Reply::Full {
            status: "200 OK",
            headers: vec![
                ("content-type", "audio/mpeg".to_string()),
                ("icy-metaint", metaint.to_string()),
            ],
            body,
        }
    }

    pub fn plain(body: Vec<u8>) -> Self {
        Reply::Full {
            status: "200 OK",
            headers: vec![("content-type", "audio/mpeg".to_string())],
            body,
        }
    }
}

pub struct MockStream {
    pub url: String,
    /// Raw request head, lowercased.
    pub request: oneshot::Receiver<String>,
}

/// Serves exactly one connection on an ephemeral localhost port.
pub async fn serve_once(reply: Reply) -> MockStream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if socket.read(&mut byte).await.unwrap_or(0) == 0 {
                break;
            }
            head.push(byte[0]);
        }
        let _ = tx.send(String::from_utf8_lossy(&head).to_ascii_lowercase());

        match reply {
            Reply::Full {
                status,
                headers,
                body,
            } => {
                let mut out = format!("HTTP/1.1 {status}\r\nconnection: close\r\n");
                for (name, value) in headers {
                    out.push_str(&format!("{name}: {value}\r\n"));
                }
                out.push_str("\r\n");
                let _ = socket.write_all(out.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            }
            Reply::Stall { metaint } => {
                let out = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: audio/mpeg\r\nicy-metaint: {metaint}\r\n\r\n"
                );
                let _ = socket.write_all(out.as_bytes()).await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        }
    });

    MockStream {
        url: format!("http://{addr}/stream"),
        request: rx,
    }
}

/// `metaint` bytes of filler audio, a length byte, then `text` NUL-padded
/// to `blocks * 16` bytes, then a little more audio.
pub fn icy_body(metaint: usize, blocks: u8, text: &[u8]) -> Vec<u8> {
    let mut body = vec![0x55; metaint];
    body.push(blocks);
    let mut meta = text.to_vec();
    meta.resize(usize::from(blocks) * 16, 0);
    body.extend_from_slice(&meta);
    body.extend_from_slice(&[0x55; 512]);
    body
}
