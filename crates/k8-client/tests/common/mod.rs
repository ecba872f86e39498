#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use k8_client::ConnectionManager;
use k8_client::Credential;

/// What the server sends back for one connection
#[derive(Debug, Clone)]
pub enum Reply {
    /// complete json response
    Json(u16, String),
    /// newline delimited events, then the connection closes
    Lines(Vec<String>),
    /// bytes written as soon as the connection is accepted
    Raw(Vec<u8>),
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Self::Json(200, body.to_owned())
    }

    pub fn status(code: u16) -> Self {
        Self::Json(
            code,
            format!(r#"{{"kind":"Status","status":"Failure","code":{code}}}"#),
        )
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }

    pub fn query(&self, name: &str) -> Option<String> {
        let (_, query) = self.target.split_once('?')?;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.to_owned())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Scripted HTTP/1.1 server; connection `n` gets reply `n`, the last reply repeats
pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(replies: Vec<Reply>) -> Self {
        assert!(!replies.is_empty());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let requests = Arc::new(Mutex::new(vec![]));
        let connections = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn({
            let requests = requests.clone();
            let connections = connections.clone();
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let index = connections.fetch_add(1, Ordering::SeqCst);
                    let reply = replies[index.min(replies.len() - 1)].clone();
                    tokio::spawn(serve(stream, reply, requests.clone()));
                }
            }
        });

        Self {
            addr,
            requests,
            connections,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn tls_url(&self) -> String {
        format!("https://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("lock").clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn manager(&self) -> Arc<ConnectionManager> {
        Arc::new(
            ConnectionManager::builder(self.url())
                .credential(Credential::token("test-token"))
                .build()
                .await
                .expect("manager"),
        )
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut stream: TcpStream, reply: Reply, requests: Arc<Mutex<Vec<RecordedRequest>>>) {
    if let Reply::Raw(bytes) = &reply {
        let _ = stream.write_all(bytes).await;
        // keep reading until the client hangs up so it sees our bytes before a reset
        let mut sink = [0u8; 1024];
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while let Ok(n) = stream.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        })
        .await;
        return;
    }

    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    requests.lock().expect("lock").push(request);

    let (code, body) = match reply {
        Reply::Json(code, body) => (code, body),
        Reply::Lines(lines) => {
            let mut body = String::new();
            for line in lines {
                body.push_str(&line);
                body.push('\n');
            }
            (200, body)
        }
        Reply::Raw(_) => return,
    };

    let head = format!(
        "HTTP/1.1 {code} Mock\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n"
    );
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(body.as_bytes()).await;
    let _ = stream.flush().await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let _ = stream.shutdown().await;
}

async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = vec![];
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_owned();
    let target = request_line.next()?.to_owned();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .collect();

    let length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(RecordedRequest {
        method,
        target,
        headers,
        body,
    })
}

/// log to the test output, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn event(event_type: &str, name: &str, resource_version: &str) -> String {
    format!(
        r#"{{"type":"{event_type}","object":{{"metadata":{{"name":"{name}","resourceVersion":"{resource_version}"}}}}}}"#
    )
}

pub fn error_event(code: u16) -> String {
    format!(
        r#"{{"type":"ERROR","object":{{"kind":"Status","status":"Failure","message":"watch ended","code":{code}}}}}"#
    )
}
