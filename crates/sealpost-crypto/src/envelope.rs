//! CPIM-style envelope wrapped around encrypted message and stanza payloads.
//!
//! ```text
//! Content-Type: message/cpim
//!
//! From: <alice@example.com>
//! To: <bob@example.com>
//!
//! Content-Type: text/plain; charset=utf-8
//!
//! body
//! ```
//!
//! The envelope identities are covered by the signature, which lets the
//! receiver check that the message was meant for it and came from the key
//! owner.

pub const CPIM_CONTENT_TYPE: &str = "message/cpim";
pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
pub const XMPP_STANZA: &str = "application/xmpp+xml";

const CRLF: &str = "\r\n";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(
        from: impl Into<String>,
        to: Vec<String>,
        content_type: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            from: Some(from.into()),
            to,
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("Content-Type: {CPIM_CONTENT_TYPE}{CRLF}{CRLF}");
        if let Some(from) = &self.from {
            head.push_str(&format!("From: <{from}>{CRLF}"));
        }
        for to in &self.to {
            head.push_str(&format!("To: <{to}>{CRLF}"));
        }
        head.push_str(&format!("{CRLF}Content-Type: {}{CRLF}{CRLF}", self.content_type));

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse a decrypted payload. Payloads without the CPIM marker are
    /// returned whole as a `text/plain` body with no identities.
    pub fn parse(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let Some((outer, rest)) = split_headers(payload) else {
            return Ok(Self::plain(payload));
        };
        let is_cpim = outer.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("content-type")
                && value
                    .split(';')
                    .next()
                    .is_some_and(|t| t.trim().eq_ignore_ascii_case(CPIM_CONTENT_TYPE))
        });
        if !is_cpim {
            return Ok(Self::plain(payload));
        }

        let (message_headers, rest) =
            split_headers(rest).ok_or(EnvelopeError::Malformed("unterminated message headers"))?;
        let (content_headers, body) =
            split_headers(rest).ok_or(EnvelopeError::Malformed("unterminated content headers"))?;

        let mut from = None;
        let mut to = Vec::new();
        for (name, value) in message_headers {
            if name.eq_ignore_ascii_case("from") {
                from = Some(strip_angle(&value));
            } else if name.eq_ignore_ascii_case("to") {
                to.push(strip_angle(&value));
            }
        }
        let content_type = content_headers
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map_or_else(|| TEXT_PLAIN.to_string(), |(_, value)| value);

        Ok(Self {
            from,
            to,
            content_type,
            body: body.to_vec(),
        })
    }

    fn plain(payload: &[u8]) -> Self {
        Self {
            from: None,
            to: Vec::new(),
            content_type: TEXT_PLAIN.to_string(),
            body: payload.to_vec(),
        }
    }
}

/// Read `Name: value` lines up to the first empty line. `None` if the data
/// ends before the blank line or a line is not a header.
fn split_headers(data: &[u8]) -> Option<(Vec<(String, String)>, &[u8])> {
    let mut headers = Vec::new();
    let mut pos = 0;
    loop {
        let nl = data[pos..].iter().position(|b| *b == b'\n')? + pos;
        let line = &data[pos..nl];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        pos = nl + 1;
        if line.is_empty() {
            return Some((headers, &data[pos..]));
        }
        let line = std::str::from_utf8(line).ok()?;
        let (name, value) = line.split_once(':')?;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return None;
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
}

fn strip_angle(value: &str) -> String {
    let value = value.trim();
    // `From: Alice <alice@example.com>` carries a display name.
    match (value.rfind('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].to_string(),
        _ => value.to_string(),
    }
}
