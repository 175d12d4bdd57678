use crate::body;
use crate::http::{Method, Request};

/// Total buffered bytes a single parse cycle may hold.
pub const MAX_BUFFER_SIZE: usize = 8 * 1024 * 1024;
/// Request line length cap.
pub const MAX_REQUEST_LINE: usize = 8 * 1024;
/// Header section length cap.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;
/// Header line count cap.
pub const MAX_HEADER_COUNT: usize = 100;
/// Body bytes cap applied to Content-Length when no other limit is set.
pub const DEFAULT_MAX_BODY: usize = 1024 * 1024;
/// State transitions allowed per feed before the input counts as pathological.
const MAX_TRANSITIONS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    BodyContent,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    InvalidRequestLine,
    InvalidHeaders,
    TooManyHeaders,
    InvalidContentLength,
    InvalidBodyFormat,
    BufferTooLarge,
    MalformedData,
}

/// Outcome of one [`HttpParser::feed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    NeedMore,
    Complete,
    Error(ParseErrorKind),
}

enum Step {
    Advanced,
    NeedMore,
    Failed(ParseErrorKind),
}

/// Incremental HTTP/1.x request parser.
///
/// Callers feed byte arrivals of any size; the machine advances through
/// request line, headers, and body, erasing each phase's consumed prefix from
/// the buffer as it completes. At `Complete` the buffer holds exactly the
/// bytes beyond the finished request, and [`reset`](HttpParser::reset)
/// preserves them; that leftover is what makes keep-alive pipelining safe.
pub struct HttpParser {
    buffer: Vec<u8>,
    state: ParseState,
    error: Option<ParseErrorKind>,
    content_length: usize,
    header_count: usize,
    max_body: usize,
    request: Option<Request>,
}

impl HttpParser {
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY)
    }

    pub fn with_max_body(max_body: usize) -> Self {
        Self {
            buffer: Vec::new(),
            state: ParseState::RequestLine,
            error: None,
            content_length: 0,
            header_count: 0,
            max_body,
            request: None,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn error_kind(&self) -> Option<ParseErrorKind> {
        self.error
    }

    pub fn header_count(&self) -> usize {
        self.header_count
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Consume `data` and advance as far as the bytes allow. An empty slice
    /// resumes work on buffered leftover, which is how the reactor picks up a
    /// pipelined request after a parser reset.
    pub fn feed(&mut self, data: &[u8]) -> ParseStatus {
        match self.state {
            ParseState::Error => {
                return ParseStatus::Error(self.error.unwrap_or(ParseErrorKind::MalformedData))
            }
            ParseState::Complete => return ParseStatus::Complete,
            _ => {}
        }

        if self.buffer.len() + data.len() > MAX_BUFFER_SIZE {
            return self.fail(ParseErrorKind::BufferTooLarge);
        }
        self.buffer.extend_from_slice(data);

        let mut transitions = 0usize;
        loop {
            transitions += 1;
            if transitions > MAX_TRANSITIONS {
                return self.fail(ParseErrorKind::MalformedData);
            }

            let step = match self.state {
                ParseState::RequestLine => self.step_request_line(),
                ParseState::Headers => self.step_headers(),
                ParseState::Body => self.step_body(),
                ParseState::BodyContent => self.step_body_content(),
                ParseState::Complete => return ParseStatus::Complete,
                ParseState::Error => {
                    return ParseStatus::Error(
                        self.error.unwrap_or(ParseErrorKind::MalformedData),
                    )
                }
            };

            match step {
                Step::Advanced => continue,
                Step::NeedMore => return ParseStatus::NeedMore,
                Step::Failed(kind) => return ParseStatus::Error(kind),
            }
        }
    }

    /// Hand out the parsed request once `Complete` is reached.
    pub fn take_request(&mut self) -> Option<Request> {
        if self.state == ParseState::Complete {
            self.request.take()
        } else {
            None
        }
    }

    /// Return to the initial state for the next request cycle. Buffered bytes
    /// beyond the finished request are kept.
    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.error = None;
        self.content_length = 0;
        self.header_count = 0;
        self.request = None;
    }

    fn fail(&mut self, kind: ParseErrorKind) -> ParseStatus {
        self.state = ParseState::Error;
        self.error = Some(kind);
        ParseStatus::Error(kind)
    }

    fn fail_step(&mut self, kind: ParseErrorKind) -> Step {
        self.state = ParseState::Error;
        self.error = Some(kind);
        Step::Failed(kind)
    }

    fn step_request_line(&mut self) -> Step {
        let line_end = match find_bytes(&self.buffer, b"\r\n") {
            Some(pos) => pos,
            None => {
                if self.buffer.len() > MAX_REQUEST_LINE {
                    return self.fail_step(ParseErrorKind::InvalidRequestLine);
                }
                return Step::NeedMore;
            }
        };
        if line_end > MAX_REQUEST_LINE {
            return self.fail_step(ParseErrorKind::InvalidRequestLine);
        }

        let parsed = parse_request_line(&self.buffer[..line_end]);
        match parsed {
            Ok(request) => {
                self.request = Some(request);
                self.buffer.drain(..line_end + 2);
                self.state = ParseState::Headers;
                Step::Advanced
            }
            Err(kind) => self.fail_step(kind),
        }
    }

    fn step_headers(&mut self) -> Step {
        // The empty header block is just the terminating blank line.
        let (section_len, consumed) = if self.buffer.starts_with(b"\r\n") {
            (0, 2)
        } else if let Some(pos) = find_bytes(&self.buffer, b"\r\n\r\n") {
            (pos + 2, pos + 4)
        } else {
            if self.buffer.len() > MAX_HEADER_BYTES {
                return self.fail_step(ParseErrorKind::InvalidHeaders);
            }
            return Step::NeedMore;
        };
        if section_len > MAX_HEADER_BYTES {
            return self.fail_step(ParseErrorKind::InvalidHeaders);
        }

        let headers = match parse_header_section(&self.buffer[..section_len]) {
            Ok(headers) => headers,
            Err(kind) => return self.fail_step(kind),
        };
        self.header_count = headers.len();

        let Some(request) = self.request.as_mut() else {
            return self.fail_step(ParseErrorKind::MalformedData);
        };
        for (name, value) in headers {
            // Duplicate names: last one wins.
            request.headers.insert(name, value);
        }

        if let Some(raw) = request.headers.get("content-length") {
            match raw.parse::<u64>() {
                Ok(len) if len as usize <= self.max_body => {
                    self.content_length = len as usize;
                }
                _ => return self.fail_step(ParseErrorKind::InvalidContentLength),
            }
        }

        self.buffer.drain(..consumed);
        self.state = if self.content_length > 0 {
            ParseState::Body
        } else {
            ParseState::BodyContent
        };
        Step::Advanced
    }

    fn step_body(&mut self) -> Step {
        if self.buffer.len() < self.content_length {
            return Step::NeedMore;
        }
        let Some(request) = self.request.as_mut() else {
            return self.fail_step(ParseErrorKind::MalformedData);
        };
        request.body = self.buffer[..self.content_length].to_vec();
        self.buffer.drain(..self.content_length);
        self.state = ParseState::BodyContent;
        Step::Advanced
    }

    fn step_body_content(&mut self) -> Step {
        let Some(request) = self.request.as_mut() else {
            return self.fail_step(ParseErrorKind::MalformedData);
        };
        let content_type = request.headers.get("content-type").map(|s| s.as_str());
        match body::classify(content_type, &request.body) {
            Ok(parsed) => {
                request.parsed_body = parsed;
                self.state = ParseState::Complete;
                Step::Advanced
            }
            Err(_) => self.fail_step(ParseErrorKind::InvalidBodyFormat),
        }
    }
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_request_line(line: &[u8]) -> Result<Request, ParseErrorKind> {
    let space1 = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or(ParseErrorKind::InvalidRequestLine)?;
    let space2 = line[space1 + 1..]
        .iter()
        .position(|&b| b == b' ')
        .map(|p| p + space1 + 1)
        .ok_or(ParseErrorKind::InvalidRequestLine)?;

    let method = Method::from_bytes(&line[..space1]).ok_or(ParseErrorKind::InvalidRequestLine)?;
    let path_bytes = &line[space1 + 1..space2];
    let version_bytes = &line[space2 + 1..];

    validate_path(path_bytes)?;
    let path = std::str::from_utf8(path_bytes)
        .map_err(|_| ParseErrorKind::InvalidRequestLine)?
        .to_string();

    if !version_bytes.starts_with(b"HTTP/") {
        return Err(ParseErrorKind::InvalidRequestLine);
    }
    let version = std::str::from_utf8(version_bytes)
        .map_err(|_| ParseErrorKind::InvalidRequestLine)?
        .to_string();

    Ok(Request::new(method, path, version))
}

fn validate_path(path: &[u8]) -> Result<(), ParseErrorKind> {
    if path.first() != Some(&b'/') {
        return Err(ParseErrorKind::InvalidRequestLine);
    }
    if path.iter().any(|&b| b < 0x20 || b == 0x7f) {
        return Err(ParseErrorKind::InvalidRequestLine);
    }
    if find_bytes(path, b"..").is_some() {
        return Err(ParseErrorKind::InvalidRequestLine);
    }
    Ok(())
}

fn valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn parse_header_section(section: &[u8]) -> Result<Vec<(String, String)>, ParseErrorKind> {
    let mut headers = Vec::new();
    for line in section.split(|&b| b == b'\n') {
        let line = match line.strip_suffix(b"\r") {
            Some(stripped) => stripped,
            None => line,
        };
        if line.is_empty() {
            continue;
        }

        let text = std::str::from_utf8(line).map_err(|_| ParseErrorKind::InvalidHeaders)?;
        // A line without a colon carries nothing usable; skip it.
        let Some(colon) = text.find(':') else {
            continue;
        };
        let name = text[..colon].trim().to_ascii_lowercase();
        let value = text[colon + 1..].trim().to_string();
        if !valid_header_name(&name) {
            return Err(ParseErrorKind::InvalidHeaders);
        }

        headers.push((name, value));
        if headers.len() > MAX_HEADER_COUNT {
            return Err(ParseErrorKind::TooManyHeaders);
        }
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::ParsedBody;

    const SIMPLE_GET: &[u8] = b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n";

    fn complete(parser: &mut HttpParser, bytes: &[u8]) -> Request {
        assert_eq!(parser.feed(bytes), ParseStatus::Complete);
        parser.take_request().unwrap()
    }

    #[test]
    fn parses_simple_get() {
        let mut parser = HttpParser::new();
        let req = complete(&mut parser, SIMPLE_GET);
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/hello");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.header("host"), Some("x"));
        assert!(req.body.is_empty());
        assert_eq!(req.parsed_body, ParsedBody::None);
    }

    #[test]
    fn parses_request_without_headers() {
        let mut parser = HttpParser::new();
        let req = complete(&mut parser, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(req.path, "/");
        assert!(req.headers.is_empty());
    }

    #[test]
    fn split_invariance_byte_by_byte() {
        let raw = b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: 15\r\n\r\n{\"k\":\"v\",\"n\":1}";

        let mut whole = HttpParser::new();
        let expected = complete(&mut whole, raw);

        let mut dripped = HttpParser::new();
        let mut last = ParseStatus::NeedMore;
        for byte in raw.iter() {
            last = dripped.feed(std::slice::from_ref(byte));
        }
        assert_eq!(last, ParseStatus::Complete);
        let got = dripped.take_request().unwrap();

        assert_eq!(got.method, expected.method);
        assert_eq!(got.path, expected.path);
        assert_eq!(got.version, expected.version);
        assert_eq!(got.headers, expected.headers);
        assert_eq!(got.body, expected.body);
        assert_eq!(got.parsed_body, ParsedBody::Json);
    }

    #[test]
    fn split_invariance_odd_chunks() {
        let raw = b"GET /a HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        for chunk_size in [2usize, 3, 7, 13] {
            let mut parser = HttpParser::new();
            let mut status = ParseStatus::NeedMore;
            for chunk in raw.chunks(chunk_size) {
                status = parser.feed(chunk);
            }
            assert_eq!(status, ParseStatus::Complete, "chunk size {}", chunk_size);
            let req = parser.take_request().unwrap();
            assert_eq!(req.path, "/a");
            assert_eq!(req.header("accept"), Some("*/*"));
        }
    }

    #[test]
    fn request_line_cap_enforced() {
        let mut parser = HttpParser::new();
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat(b'a').take(9_000));
        let status = parser.feed(&raw);
        assert_eq!(
            status,
            ParseStatus::Error(ParseErrorKind::InvalidRequestLine)
        );
        // terminal: further feeds keep reporting the same error
        assert_eq!(
            parser.feed(b" HTTP/1.1\r\n\r\n"),
            ParseStatus::Error(ParseErrorKind::InvalidRequestLine)
        );
    }

    #[test]
    fn header_section_cap_enforced() {
        let mut parser = HttpParser::new();
        parser.feed(b"GET / HTTP/1.1\r\n");
        let big_value = "v".repeat(70 * 1024);
        let status = parser.feed(format!("X-Big: {}\r\n", big_value).as_bytes());
        assert_eq!(status, ParseStatus::Error(ParseErrorKind::InvalidHeaders));
    }

    #[test]
    fn header_count_cap_enforced() {
        let mut parser = HttpParser::new();
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..101 {
            raw.extend_from_slice(format!("X-H{}: v\r\n", i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        assert_eq!(
            parser.feed(&raw),
            ParseStatus::Error(ParseErrorKind::TooManyHeaders)
        );
    }

    #[test]
    fn body_longer_than_cap_is_rejected() {
        let mut parser = HttpParser::with_max_body(1024);
        let status = parser.feed(b"POST / HTTP/1.1\r\nContent-Length: 2048\r\n\r\n");
        assert_eq!(
            status,
            ParseStatus::Error(ParseErrorKind::InvalidContentLength)
        );
    }

    #[test]
    fn non_numeric_content_length_is_rejected() {
        let mut parser = HttpParser::new();
        let status = parser.feed(b"POST / HTTP/1.1\r\nContent-Length: banana\r\n\r\n");
        assert_eq!(
            status,
            ParseStatus::Error(ParseErrorKind::InvalidContentLength)
        );
    }

    #[test]
    fn path_safety_rejections() {
        let bad_paths: &[&[u8]] = &[
            b"GET /../etc/passwd HTTP/1.1\r\n\r\n",
            b"GET /a/../b HTTP/1.1\r\n\r\n",
            b"GET relative HTTP/1.1\r\n\r\n",
            b"GET /nul\x00byte HTTP/1.1\r\n\r\n",
        ];
        for raw in bad_paths {
            let mut parser = HttpParser::new();
            assert_eq!(
                parser.feed(raw),
                ParseStatus::Error(ParseErrorKind::InvalidRequestLine),
                "path should be rejected: {:?}",
                raw
            );
        }
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let mut parser = HttpParser::new();
        assert_eq!(
            parser.feed(b"BREW /coffee HTTP/1.1\r\n\r\n"),
            ParseStatus::Error(ParseErrorKind::InvalidRequestLine)
        );
    }

    #[test]
    fn header_names_are_case_insensitive() {
        for variant in ["Content-Length", "CONTENT-LENGTH", "content-length"] {
            let mut parser = HttpParser::new();
            let raw = format!("POST / HTTP/1.1\r\n{}: 2\r\n\r\nhi", variant);
            let req = complete(&mut parser, raw.as_bytes());
            assert_eq!(req.body, b"hi");
            assert_eq!(req.header("content-length"), Some("2"));
        }
    }

    #[test]
    fn duplicate_headers_last_wins() {
        let mut parser = HttpParser::new();
        let req = complete(
            &mut parser,
            b"GET / HTTP/1.1\r\nX-Tag: first\r\nX-Tag: second\r\n\r\n",
        );
        assert_eq!(req.header("x-tag"), Some("second"));
    }

    #[test]
    fn bad_header_name_is_rejected() {
        let mut parser = HttpParser::new();
        assert_eq!(
            parser.feed(b"GET / HTTP/1.1\r\nBad Header: v\r\n\r\n"),
            ParseStatus::Error(ParseErrorKind::InvalidHeaders)
        );
    }

    #[test]
    fn json_body_is_classified() {
        let mut parser = HttpParser::new();
        let req = complete(
            &mut parser,
            b"POST /echo HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 15\r\n\r\n{\"k\":\"v\",\"n\":1}",
        );
        assert_eq!(req.parsed_body, ParsedBody::Json);
        assert_eq!(req.body, br#"{"k":"v","n":1}"#);
    }

    #[test]
    fn malformed_json_body_errors() {
        let mut parser = HttpParser::new();
        let status = parser.feed(
            b"POST / HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert_eq!(status, ParseStatus::Error(ParseErrorKind::InvalidBodyFormat));
    }

    #[test]
    fn pipelined_leftover_survives_reset() {
        let mut parser = HttpParser::new();
        let two = b"GET /first HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
        assert_eq!(parser.feed(two), ParseStatus::Complete);
        let first = parser.take_request().unwrap();
        assert_eq!(first.path, "/first");
        assert!(parser.buffered_len() > 0);

        parser.reset();
        // Resume on leftover without any new bytes.
        assert_eq!(parser.feed(&[]), ParseStatus::Complete);
        let second = parser.take_request().unwrap();
        assert_eq!(second.path, "/second");
        assert_eq!(second.header("connection"), Some("close"));
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn body_bytes_beyond_content_length_are_left_buffered() {
        let mut parser = HttpParser::new();
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcXYZ";
        assert_eq!(parser.feed(raw), ParseStatus::Complete);
        let req = parser.take_request().unwrap();
        assert_eq!(req.body, b"abc");
        assert_eq!(parser.buffered_len(), 3);
    }

    #[test]
    fn feed_on_empty_buffer_needs_more() {
        let mut parser = HttpParser::new();
        assert_eq!(parser.feed(&[]), ParseStatus::NeedMore);
        assert_eq!(parser.state(), ParseState::RequestLine);
    }

    #[test]
    fn total_buffer_cap_enforced() {
        let mut parser = HttpParser::new();
        parser.feed(b"GET /stall");
        let chunk = vec![b'a'; MAX_BUFFER_SIZE];
        assert_eq!(
            parser.feed(&chunk),
            ParseStatus::Error(ParseErrorKind::BufferTooLarge)
        );
    }
}
