//! Scripted local backend for exercising the HTTP paths end to end.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tiny_http::{Header, Response, Server};

#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub url: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    body: String,
    json: bool,
}

impl Reply {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            json: true,
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            json: false,
        }
    }
}

pub struct Backend {
    pub base_url: String,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Backend {
    /// Answers incoming requests with `replies` in arrival order, then stops
    /// listening.
    pub fn serve(replies: Vec<Reply>) -> Self {
        let server = Server::http("127.0.0.1:0").expect("bind scripted backend");
        let base_url = format!("http://{}/", server.server_addr());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        thread::spawn(move || {
            for reply in replies {
                let mut request = match server.recv() {
                    Ok(request) => request,
                    Err(_) => break,
                };
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let header = |name: &'static str| {
                    request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv(name))
                        .map(|h| h.value.as_str().to_string())
                };
                let entry = Seen {
                    method: request.method().to_string(),
                    url: request.url().to_string(),
                    authorization: header("Authorization"),
                    content_type: header("Content-Type"),
                    body,
                };
                log.lock().push(entry);

                let mut response =
                    Response::from_data(reply.body.into_bytes()).with_status_code(reply.status);
                if reply.json {
                    response = response.with_header(
                        Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                            .expect("valid header"),
                    );
                }
                let _ = request.respond(response);
            }
        });

        Self { base_url, seen }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }
}

/// A base URL nothing is listening on.
pub fn closed_base_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
    let addr = listener.local_addr().expect("probe addr");
    drop(listener);
    format!("http://{addr}/")
}
