//! STOMP 1.2 frame codec.
//!
//! One WebSocket text message carries zero or more frames. A bare EOL is a
//! heart-beat and decodes to nothing.

use std::fmt;

use thiserror::Error;

/// An EOL on its own: the STOMP heart-beat.
pub const HEARTBEAT: &str = "\n";

/// Errors produced while decoding inbound text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    #[error("invalid content-length: {0}")]
    BadContentLength(String),
    #[error("frame is not NUL terminated")]
    Unterminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of a header. Repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn connect(host: &str, heartbeat_ms: u64) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", "1.2,1.1")
            .header("host", host)
            .header("heart-beat", format!("{heartbeat_ms},{heartbeat_ms}"))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, content_type: &str, body: impl Into<String>) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", content_type)
            .with_body(body)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// Serialize to wire text, adding `content-length` when there is a body.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// The `heart-beat` header as `(sends_every_ms, wants_every_ms)`.
    pub fn heartbeat(&self) -> (u64, u64) {
        let Some(value) = self.get("heart-beat") else {
            return (0, 0);
        };
        let mut parts = value.split(',').map(|p| p.trim().parse::<u64>().unwrap_or(0));
        (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
    }
}

fn escape_header(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(text: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(text.to_string())),
        }
    }
    Ok(out)
}

/// Decode every frame in `input`. Heart-beats between frames are skipped.
pub fn decode(input: &str) -> Result<Vec<Frame>, FrameError> {
    let mut frames = Vec::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            return Ok(frames);
        }
        let (frame, remaining) = decode_one(rest)?;
        frames.push(frame);
        rest = remaining;
    }
}

fn next_line(input: &str) -> (&str, &str) {
    match input.find('\n') {
        Some(idx) => (input[..idx].trim_end_matches('\r'), &input[idx + 1..]),
        None => (input, ""),
    }
}

fn decode_one(input: &str) -> Result<(Frame, &str), FrameError> {
    let (command_line, mut rest) = next_line(input);
    let command = Command::parse(command_line)
        .ok_or_else(|| FrameError::UnknownCommand(command_line.to_string()))?;
    let escaped = command.escapes_headers();

    let mut frame = Frame::new(command);
    loop {
        if rest.is_empty() {
            return Err(FrameError::Unterminated);
        }
        let (line, remaining) = next_line(rest);
        rest = remaining;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if escaped {
            frame.headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            frame.headers.push((name.to_string(), value.to_string()));
        }
    }

    let body_end = match frame.get("content-length") {
        Some(length) => {
            let length: usize = length
                .trim()
                .parse()
                .map_err(|_| FrameError::BadContentLength(length.to_string()))?;
            if rest.as_bytes().get(length) != Some(&0) {
                return Err(FrameError::BadContentLength(length.to_string()));
            }
            length
        }
        None => rest.find('\0').ok_or(FrameError::Unterminated)?,
    };
    let body = rest
        .get(..body_end)
        .ok_or_else(|| FrameError::BadContentLength(body_end.to_string()))?;
    frame.body = body.to_string();

    Ok((frame, &rest[body_end + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_send_frame() {
        let frame = Frame::send("/app/chat.sendMessage", "application/json", "{\"a\":1}");
        assert_eq!(
            frame.encode(),
            "SEND\ndestination:/app/chat.sendMessage\ncontent-type:application/json\ncontent-length:7\n\n{\"a\":1}\0"
        );
    }

    #[test]
    fn test_encode_connect_is_not_escaped() {
        let frame = Frame::connect("localhost", 10_000);
        let text = frame.encode();
        assert!(text.starts_with("CONNECT\naccept-version:1.2,1.1\nhost:localhost\n"));
        assert!(text.contains("heart-beat:10000,10000\n"));
        assert!(text.ends_with("\n\n\0"));
    }

    #[test]
    fn test_decode_message_frame() {
        let text = "MESSAGE\ndestination:/topic/chat/1\nsubscription:sub-1\nmessage-id:7\n\n{\"id\":\"m1\"}\0";
        let frames = decode(text).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, Command::Message);
        assert_eq!(frames[0].get("subscription"), Some("sub-1"));
        assert_eq!(frames[0].body, "{\"id\":\"m1\"}");
    }

    #[test]
    fn test_decode_heartbeats_only() {
        assert!(decode("\n").unwrap().is_empty());
        assert!(decode("\r\n\n").unwrap().is_empty());
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn test_decode_multiple_frames_with_heartbeats() {
        let text = format!(
            "\n{}\n{}\n",
            Frame::new(Command::Receipt).header("receipt-id", "1").encode(),
            Frame::new(Command::Receipt).header("receipt-id", "2").encode()
        );
        let frames = decode(&text).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].get("receipt-id"), Some("2"));
    }

    #[test]
    fn test_header_escaping_survives_decode() {
        let frame = Frame::new(Command::Message)
            .header("destination", "/topic/a:b")
            .header("note", "line1\nline2\\end")
            .with_body("x");
        let text = frame.encode();
        assert!(text.contains("destination:/topic/a\\cb\n"));
        let decoded = decode(&text).unwrap();
        assert_eq!(decoded[0].get("destination"), Some("/topic/a:b"));
        assert_eq!(decoded[0].get("note"), Some("line1\nline2\\end"));
    }

    #[test]
    fn test_content_length_allows_nul_in_body() {
        let text = "MESSAGE\ncontent-length:3\n\na\0b\0";
        let frames = decode(text).unwrap();
        assert_eq!(frames[0].body, "a\0b");
    }

    #[test]
    fn test_content_length_counts_bytes() {
        let frame = Frame::send("/d", "text/plain", "héllo");
        let decoded = decode(&frame.encode()).unwrap();
        assert_eq!(decoded[0].get("content-length"), Some("6"));
        assert_eq!(decoded[0].body, "héllo");
    }

    #[test]
    fn test_repeated_header_keeps_first() {
        let text = "MESSAGE\nfoo:first\nfoo:second\n\n\0";
        let frames = decode(text).unwrap();
        assert_eq!(frames[0].get("foo"), Some("first"));
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            decode("HELLO\n\n\0"),
            Err(FrameError::UnknownCommand("HELLO".to_string()))
        );
        assert!(matches!(
            decode("MESSAGE\nnocolon\n\n\0"),
            Err(FrameError::MalformedHeader(_))
        ));
        assert_eq!(decode("MESSAGE\n\nbody"), Err(FrameError::Unterminated));
        assert!(matches!(
            decode("MESSAGE\nbad:\\x\n\n\0"),
            Err(FrameError::InvalidEscape(_))
        ));
        assert!(matches!(
            decode("MESSAGE\ncontent-length:9\n\nab\0"),
            Err(FrameError::BadContentLength(_))
        ));
    }

    #[test]
    fn test_crlf_line_endings() {
        let text = "CONNECTED\r\nversion:1.2\r\nheart-beat:0,5000\r\n\r\n\0";
        let frames = decode(text).unwrap();
        assert_eq!(frames[0].command, Command::Connected);
        assert_eq!(frames[0].get("version"), Some("1.2"));
        assert_eq!(frames[0].heartbeat(), (0, 5000));
    }

    #[test]
    fn test_heartbeat_header_defaults() {
        assert_eq!(Frame::new(Command::Connected).heartbeat(), (0, 0));
        let frame = Frame::new(Command::Connected).header("heart-beat", "250,junk");
        assert_eq!(frame.heartbeat(), (250, 0));
    }
}
