//! 测试用的本地 HTTP / TCP 服务

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
pub enum TestBody {
    /// 定长响应体
    Fixed(Vec<u8>),
    /// 无 Content-Length，按间隔持续写出直到客户端断开
    Trickle { chunk: Vec<u8>, interval: Duration },
}

#[derive(Debug, Clone)]
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: TestBody,
}

impl TestResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: TestBody::Fixed(body.into()),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: TestBody::Fixed(Vec::new()),
        }
    }

    pub fn trickle(chunk_size: usize, interval: Duration) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: TestBody::Trickle {
                chunk: vec![b'x'; chunk_size],
                interval,
            },
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// 启动只会返回固定响应的 HTTP 服务
pub async fn spawn_http_server(response: TestResponse) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_one(stream, response.clone()));
        }
    });

    addr
}

/// 接受连接后立即关闭的 TCP 服务
pub async fn spawn_tcp_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    addr
}

/// 接受连接后一直保持、从不回复的服务
pub async fn spawn_silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    addr
}

/// 获取一个当前无人监听的本地端口
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn serve_one(mut stream: TcpStream, response: TestResponse) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                request.extend_from_slice(&buf[..n]);
                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
        }
    }

    let mut head = format!("HTTP/1.1 {} X\r\nConnection: close\r\n", response.status);
    if let TestBody::Fixed(body) = &response.body {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    for (name, value) in &response.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");

    if stream.write_all(head.as_bytes()).await.is_err() {
        return;
    }

    match response.body {
        TestBody::Fixed(body) => {
            let _ = stream.write_all(&body).await;
        }
        TestBody::Trickle { chunk, interval } => loop {
            if stream.write_all(&chunk).await.is_err() {
                break;
            }
            tokio::time::sleep(interval).await;
        },
    }
    let _ = stream.shutdown().await;
}
