//! Shared fixtures: a canned-response HTTP server and image helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A fixed HTTP response.
#[derive(Clone)]
pub struct Canned {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
    declared: Option<usize>,
}

impl Canned {
    pub fn ok(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type,
            body,
            declared: None,
        }
    }

    pub fn png(body: Vec<u8>) -> Self {
        Self::ok("image/png", body)
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain",
            body: b"not found".to_vec(),
            declared: None,
        }
    }

    /// Advertise a `Content-Length` different from the body actually sent.
    pub fn declaring(mut self, length: usize) -> Self {
        self.declared = Some(length);
        self
    }

    fn to_bytes(&self) -> Vec<u8> {
        let reason = match self.status {
            200 => "OK",
            404 => "Not Found",
            _ => "Unknown",
        };
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            reason,
            self.content_type,
            self.declared.unwrap_or(self.body.len())
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// Serve `routes` on an ephemeral local port until the test ends.
pub async fn serve(routes: Vec<(&str, Canned)>) -> SocketAddr {
    let routes: Arc<HashMap<String, Canned>> = Arc::new(
        routes
            .into_iter()
            .map(|(path, canned)| (path.to_string(), canned))
            .collect(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&chunk[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&head);
                let path = head.split_whitespace().nth(1).unwrap_or("/");
                let canned = routes.get(path).cloned().unwrap_or_else(Canned::not_found);
                let _ = socket.write_all(&canned.to_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

pub fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

/// PNG-encoded gradient image.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 4 % 256) as u8, (y * 4 % 256) as u8, 0x80, 0xFF])
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("photos_core=debug")
        .with_test_writer()
        .try_init();
}
