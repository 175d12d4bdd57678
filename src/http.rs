use crate::body::ParsedBody;
use std::collections::HashMap;

/// Product token sent in the `Server` header of every response.
pub const SERVER_HEADER: &str = concat!("nocturne/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Trace,
    Connect,
}

impl Method {
    /// `None` for anything outside the supported method set; the parser turns
    /// that into a 400.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"HEAD" => Some(Method::Head),
            b"OPTIONS" => Some(Method::Options),
            b"PATCH" => Some(Method::Patch),
            b"TRACE" => Some(Method::Trace),
            b"CONNECT" => Some(Method::Connect),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }
}

/// One fully parsed request. Header names are lowercased by the parser;
/// duplicate names keep the last value seen.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub parsed_body: ParsedBody,
}

impl Request {
    pub fn new(method: Method, path: String, version: String) -> Self {
        Self {
            method,
            path,
            version,
            headers: HashMap::new(),
            body: Vec::new(),
            parsed_body: ParsedBody::None,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn is_http_11(&self) -> bool {
        self.version == "HTTP/1.1"
    }

    /// Deserialize a JSON-classified body. `None` when the body was not
    /// classified as JSON or does not fit `T`.
    pub fn json<'a, T: serde::Deserialize<'a>>(&'a self) -> Option<T> {
        if self.parsed_body != ParsedBody::Json {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    /// Handshake detection only; no frame handling happens anywhere.
    pub fn wants_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let connection = self
            .header("connection")
            .map(|v| {
                v.split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false);
        upgrade && connection
    }
}

/// Response under construction by a handler, then serialized by the task.
///
/// Headers keep insertion order so the wire form is deterministic; setting a
/// name that already exists replaces the old value.
#[derive(Debug)]
pub struct Response {
    pub status_code: u16,
    pub status_text: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        Self {
            status_code,
            status_text: status_text.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn set_status(&mut self, code: u16, text: &str) {
        self.status_code = code;
        self.status_text = text.to_string();
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        for (k, v) in self.headers.iter_mut() {
            if k.eq_ignore_ascii_case(name) {
                *v = value.to_string();
                return;
            }
        }
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Minimal canned response for reactor-side rejections (400/413).
    pub fn canned(status_code: u16, status_text: &str) -> Self {
        let mut res = Response::new(status_code, status_text);
        res.set_header("Content-Type", "text/plain");
        res.set_header("Server", SERVER_HEADER);
        res.set_header("Connection", "close");
        res.set_body(format!("{} {}", status_code, status_text));
        res.set_header("Content-Length", &res.body.len().to_string());
        res
    }

    /// The on-the-wire form: status line, headers, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status_code, self.status_text).as_bytes(),
        );
        for (k, v) in &self.headers {
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}
