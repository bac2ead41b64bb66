//! Scriptable FastCGI application used by the integration tests.
#![allow(dead_code)]

use bytes::BytesMut;
use fcgated::fastcgi::proto::{
    decode_params, put_record, EndRequestBody, RecordHeader, RecordType, HEADER_LEN,
    MAX_CONTENT_LEN,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct CapturedRequest {
    pub request_id: u16,
    pub role: u16,
    pub keep_conn: bool,
    pub params: HashMap<String, Vec<u8>>,
    pub stdin: Vec<u8>,
    pub param_record_lens: Vec<usize>,
    pub stdin_record_lens: Vec<usize>,
}

impl CapturedRequest {
    pub fn param(&self, name: &str) -> Option<String> {
        self.params
            .get(name)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub stdout: Vec<Vec<u8>>,
    pub stderr: Vec<u8>,
    pub protocol_status: u8,
    pub delay: Duration,
    /// Request id to answer with instead of the one that was received.
    pub request_id: Option<u16>,
}

impl Reply {
    pub fn cgi(output: &str) -> Self {
        Self {
            stdout: vec![output.as_bytes().to_vec()],
            stderr: Vec::new(),
            protocol_status: 0,
            delay: Duration::ZERO,
            request_id: None,
        }
    }

    pub fn chunks(chunks: &[&str]) -> Self {
        let mut reply = Self::cgi("");
        reply.stdout = chunks.iter().map(|c| c.as_bytes().to_vec()).collect();
        reply
    }

    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.as_bytes().to_vec();
        self
    }

    pub fn with_protocol_status(mut self, status: u8) -> Self {
        self.protocol_status = status;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_request_id(mut self, id: u16) -> Self {
        self.request_id = Some(id);
        self
    }
}

type Responder = dyn Fn(&CapturedRequest) -> Reply + Send + Sync;

pub struct MockBackend {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    task: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&CapturedRequest) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let respond: Arc<Responder> = Arc::new(respond);

        let task = {
            let accepted = accepted.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let requests = requests.clone();
                    let respond = respond.clone();
                    tokio::spawn(async move {
                        let _ = serve_conn(stream, requests, respond).await;
                    });
                }
            })
        };
        Self {
            addr,
            accepted,
            requests,
            task,
        }
    }

    /// Answers every request with the same CGI output.
    pub async fn fixed(output: &'static str) -> Self {
        Self::start(move |_| Reply::cgi(output)).await
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_conn(
    mut stream: TcpStream,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    respond: Arc<Responder>,
) -> std::io::Result<()> {
    loop {
        let Some(request) = read_request(&mut stream).await? else {
            return Ok(());
        };
        let reply = respond(&request);
        requests.lock().unwrap().push(request.clone());
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        write_reply(&mut stream, &request, &reply).await?;
        if !request.keep_conn {
            return Ok(());
        }
    }
}

async fn read_record(stream: &mut TcpStream) -> std::io::Result<Option<(RecordHeader, Vec<u8>)>> {
    let mut raw = [0u8; HEADER_LEN];
    match stream.read_exact(&mut raw).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let header = RecordHeader::decode(&raw).unwrap();
    let mut body = vec![0u8; header.content_length as usize + header.padding_length as usize];
    stream.read_exact(&mut body).await?;
    body.truncate(header.content_length as usize);
    Ok(Some((header, body)))
}

pub async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<CapturedRequest>> {
    let Some((begin, body)) = read_record(stream).await? else {
        return Ok(None);
    };
    assert_eq!(begin.kind(), Some(RecordType::BeginRequest));
    let mut request = CapturedRequest {
        request_id: begin.request_id,
        role: u16::from_be_bytes([body[0], body[1]]),
        keep_conn: body[2] & 1 == 1,
        ..CapturedRequest::default()
    };

    let mut params = Vec::new();
    loop {
        let (header, body) = read_record(stream).await?.unwrap();
        assert_eq!(header.kind(), Some(RecordType::Params));
        assert_eq!(header.request_id, request.request_id);
        if body.is_empty() {
            break;
        }
        request.param_record_lens.push(body.len());
        params.extend_from_slice(&body);
    }
    for (name, value) in decode_params(&params).unwrap() {
        request
            .params
            .insert(String::from_utf8(name).unwrap(), value);
    }

    loop {
        let (header, body) = read_record(stream).await?.unwrap();
        assert_eq!(header.kind(), Some(RecordType::Stdin));
        if body.is_empty() {
            break;
        }
        request.stdin_record_lens.push(body.len());
        request.stdin.extend_from_slice(&body);
    }
    Ok(Some(request))
}

async fn write_reply(
    stream: &mut TcpStream,
    request: &CapturedRequest,
    reply: &Reply,
) -> std::io::Result<()> {
    let id = reply.request_id.unwrap_or(request.request_id);
    let mut out = BytesMut::new();
    if !reply.stderr.is_empty() {
        put_record(&mut out, RecordType::Stderr, id, &reply.stderr).unwrap();
    }
    for chunk in &reply.stdout {
        if chunk.is_empty() {
            put_record(&mut out, RecordType::Stdout, id, &[]).unwrap();
        }
        for part in chunk.chunks(MAX_CONTENT_LEN) {
            put_record(&mut out, RecordType::Stdout, id, part).unwrap();
        }
    }
    put_record(&mut out, RecordType::Stdout, id, &[]).unwrap();
    let end = EndRequestBody {
        app_status: 0,
        protocol_status: reply.protocol_status,
    };
    put_record(&mut out, RecordType::EndRequest, id, &end.encode()).unwrap();
    stream.write_all(&out).await?;
    stream.flush().await
}
