//! Body classification by Content-Type.
//!
//! JSON gets a cheap structural check (matching outer braces/brackets), form
//! bodies are decoded into pairs, multipart bodies keep their raw bytes with
//! only the boundary recognized. Everything else stays raw.

/// Classified view of a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedBody {
    None,
    Json,
    FormUrlEncoded(Vec<(String, String)>),
    Multipart { boundary: String },
    Raw,
}

/// Classification failure maps to a 400 upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyFormatError;

pub fn classify(content_type: Option<&str>, body: &[u8]) -> Result<ParsedBody, BodyFormatError> {
    if body.is_empty() {
        return Ok(ParsedBody::None);
    }

    let Some(content_type) = content_type else {
        return Ok(ParsedBody::Raw);
    };
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match media_type.as_str() {
        "application/json" => {
            if json_shape_ok(body) {
                Ok(ParsedBody::Json)
            } else {
                Err(BodyFormatError)
            }
        }
        "application/x-www-form-urlencoded" => Ok(ParsedBody::FormUrlEncoded(form_decode(body))),
        "multipart/form-data" => match boundary_param(content_type) {
            Some(boundary) => Ok(ParsedBody::Multipart { boundary }),
            None => Err(BodyFormatError),
        },
        _ => Ok(ParsedBody::Raw),
    }
}

/// The first and last non-whitespace bytes must form `{...}` or `[...]`.
fn json_shape_ok(body: &[u8]) -> bool {
    let trimmed: &[u8] = {
        let start = body.iter().position(|b| !b.is_ascii_whitespace());
        let end = body.iter().rposition(|b| !b.is_ascii_whitespace());
        match (start, end) {
            (Some(s), Some(e)) => &body[s..=e],
            _ => return false,
        }
    };
    match (trimmed.first(), trimmed.last()) {
        (Some(&b'{'), Some(&b'}')) => true,
        (Some(&b'['), Some(&b']')) => true,
        _ => false,
    }
}

/// `&`-separated `key=value` pairs with `+` and percent decoding. Pairs with
/// an empty key are dropped; a missing `=` yields an empty value.
pub fn form_decode(body: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for piece in body.split(|&b| b == b'&') {
        if piece.is_empty() {
            continue;
        }
        let (key, value) = match piece.iter().position(|&b| b == b'=') {
            Some(eq) => (&piece[..eq], &piece[eq + 1..]),
            None => (piece, &[][..]),
        };
        if key.is_empty() {
            continue;
        }
        pairs.push((percent_decode(key), percent_decode(value)));
    }
    pairs
}

/// Percent-decoding with `+` as space. Malformed escapes pass through as
/// literal bytes.
fn percent_decode(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = input.get(i + 1..i + 3);
                match hex.and_then(decode_hex_pair) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn decode_hex_pair(pair: &[u8]) -> Option<u8> {
    fn nibble(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }
    if pair.len() != 2 {
        return None;
    }
    Some(nibble(pair[0])? << 4 | nibble(pair[1])?)
}

/// Extract the `boundary=` parameter from a multipart Content-Type value.
fn boundary_param(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("boundary=") {
            let value = value.trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_is_none() {
        assert_eq!(classify(Some("application/json"), b""), Ok(ParsedBody::None));
        assert_eq!(classify(None, b""), Ok(ParsedBody::None));
    }

    #[test]
    fn json_object_and_array_accepted() {
        assert_eq!(
            classify(Some("application/json"), br#"{"k":"v"}"#),
            Ok(ParsedBody::Json)
        );
        assert_eq!(
            classify(Some("application/json; charset=utf-8"), b"  [1, 2]\n"),
            Ok(ParsedBody::Json)
        );
    }

    #[test]
    fn non_json_json_is_rejected() {
        assert!(classify(Some("application/json"), b"hello").is_err());
        assert!(classify(Some("application/json"), b"{unterminated").is_err());
    }

    #[test]
    fn form_body_is_decoded() {
        let parsed = classify(
            Some("application/x-www-form-urlencoded"),
            b"name=J%C3%BCrgen&msg=hello+world&flag",
        )
        .unwrap();
        match parsed {
            ParsedBody::FormUrlEncoded(pairs) => {
                assert_eq!(
                    pairs,
                    vec![
                        ("name".to_string(), "J\u{fc}rgen".to_string()),
                        ("msg".to_string(), "hello world".to_string()),
                        ("flag".to_string(), String::new()),
                    ]
                );
            }
            other => panic!("expected form pairs, got {:?}", other),
        }
    }

    #[test]
    fn malformed_percent_escape_passes_through() {
        let pairs = form_decode(b"k=%zz%4");
        assert_eq!(pairs, vec![("k".to_string(), "%zz%4".to_string())]);
    }

    #[test]
    fn multipart_keeps_raw_body_and_boundary() {
        let parsed = classify(
            Some("multipart/form-data; boundary=----deadbeef"),
            b"----deadbeef\r\ncontent\r\n----deadbeef--",
        )
        .unwrap();
        assert_eq!(
            parsed,
            ParsedBody::Multipart {
                boundary: "----deadbeef".to_string()
            }
        );
        assert!(classify(Some("multipart/form-data"), b"x").is_err());
    }

    #[test]
    fn unknown_content_type_stays_raw() {
        assert_eq!(
            classify(Some("application/octet-stream"), b"\x00\x01"),
            Ok(ParsedBody::Raw)
        );
        assert_eq!(classify(None, b"plain"), Ok(ParsedBody::Raw));
    }
}
