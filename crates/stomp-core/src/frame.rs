//! STOMP 1.2 frame parsing and assembly.
//!
//! A frame owns its backing text buffer; header values and the body are
//! byte ranges into that buffer, so lookups never allocate. Repeated
//! headers keep every occurrence in the raw frame but expose only the
//! first one, per the STOMP 1.2 rules.

use std::fmt;
use std::ops::Range;

use thiserror::Error;

// ---------------------------------------------------------------------------
// StompCommand
// ---------------------------------------------------------------------------

/// Frame commands defined by STOMP 1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StompCommand {
    Abort,
    Ack,
    Begin,
    Commit,
    Connect,
    Connected,
    Disconnect,
    Error,
    Message,
    Nack,
    Receipt,
    Send,
    Stomp,
    Subscribe,
    Unsubscribe,
}

impl StompCommand {
    /// The wire token for this command.
    pub fn as_str(self) -> &'static str {
        match self {
            StompCommand::Abort => "ABORT",
            StompCommand::Ack => "ACK",
            StompCommand::Begin => "BEGIN",
            StompCommand::Commit => "COMMIT",
            StompCommand::Connect => "CONNECT",
            StompCommand::Connected => "CONNECTED",
            StompCommand::Disconnect => "DISCONNECT",
            StompCommand::Error => "ERROR",
            StompCommand::Message => "MESSAGE",
            StompCommand::Nack => "NACK",
            StompCommand::Receipt => "RECEIPT",
            StompCommand::Send => "SEND",
            StompCommand::Stomp => "STOMP",
            StompCommand::Subscribe => "SUBSCRIBE",
            StompCommand::Unsubscribe => "UNSUBSCRIBE",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "ABORT" => StompCommand::Abort,
            "ACK" => StompCommand::Ack,
            "BEGIN" => StompCommand::Begin,
            "COMMIT" => StompCommand::Commit,
            "CONNECT" => StompCommand::Connect,
            "CONNECTED" => StompCommand::Connected,
            "DISCONNECT" => StompCommand::Disconnect,
            "ERROR" => StompCommand::Error,
            "MESSAGE" => StompCommand::Message,
            "NACK" => StompCommand::Nack,
            "RECEIPT" => StompCommand::Receipt,
            "SEND" => StompCommand::Send,
            "STOMP" => StompCommand::Stomp,
            "SUBSCRIBE" => StompCommand::Subscribe,
            "UNSUBSCRIBE" => StompCommand::Unsubscribe,
            _ => return None,
        })
    }

    /// Headers a frame with this command must carry to be valid.
    fn required_headers(self) -> &'static [StompHeader] {
        match self {
            StompCommand::Connect | StompCommand::Stomp => {
                &[StompHeader::AcceptVersion, StompHeader::Host]
            }
            StompCommand::Connected => &[StompHeader::Version],
            StompCommand::Send => &[StompHeader::Destination],
            StompCommand::Subscribe => &[StompHeader::Id, StompHeader::Destination],
            StompCommand::Unsubscribe => &[StompHeader::Id],
            StompCommand::Message => &[
                StompHeader::Subscription,
                StompHeader::MessageId,
                StompHeader::Destination,
            ],
            StompCommand::Receipt => &[StompHeader::ReceiptId],
            StompCommand::Ack | StompCommand::Nack => &[StompHeader::Id],
            StompCommand::Begin | StompCommand::Commit | StompCommand::Abort => {
                &[StompHeader::Transaction]
            }
            StompCommand::Disconnect | StompCommand::Error => &[],
        }
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StompHeader
// ---------------------------------------------------------------------------

/// Header names defined by STOMP 1.2.
///
/// The vocabulary is closed: a header name outside this set is a parse
/// error, not an ignored extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StompHeader {
    AcceptVersion,
    Ack,
    ContentLength,
    ContentType,
    Destination,
    HeartBeat,
    Host,
    Id,
    Login,
    Message,
    MessageId,
    Passcode,
    Receipt,
    ReceiptId,
    Server,
    Session,
    Subscription,
    Transaction,
    Version,
}

impl StompHeader {
    /// The wire name for this header.
    pub fn as_str(self) -> &'static str {
        match self {
            StompHeader::AcceptVersion => "accept-version",
            StompHeader::Ack => "ack",
            StompHeader::ContentLength => "content-length",
            StompHeader::ContentType => "content-type",
            StompHeader::Destination => "destination",
            StompHeader::HeartBeat => "heart-beat",
            StompHeader::Host => "host",
            StompHeader::Id => "id",
            StompHeader::Login => "login",
            StompHeader::Message => "message",
            StompHeader::MessageId => "message-id",
            StompHeader::Passcode => "passcode",
            StompHeader::Receipt => "receipt",
            StompHeader::ReceiptId => "receipt-id",
            StompHeader::Server => "server",
            StompHeader::Session => "session",
            StompHeader::Subscription => "subscription",
            StompHeader::Transaction => "transaction",
            StompHeader::Version => "version",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "accept-version" => StompHeader::AcceptVersion,
            "ack" => StompHeader::Ack,
            "content-length" => StompHeader::ContentLength,
            "content-type" => StompHeader::ContentType,
            "destination" => StompHeader::Destination,
            "heart-beat" => StompHeader::HeartBeat,
            "host" => StompHeader::Host,
            "id" => StompHeader::Id,
            "login" => StompHeader::Login,
            "message" => StompHeader::Message,
            "message-id" => StompHeader::MessageId,
            "passcode" => StompHeader::Passcode,
            "receipt" => StompHeader::Receipt,
            "receipt-id" => StompHeader::ReceiptId,
            "server" => StompHeader::Server,
            "session" => StompHeader::Session,
            "subscription" => StompHeader::Subscription,
            "transaction" => StompHeader::Transaction,
            "version" => StompHeader::Version,
            _ => return None,
        })
    }
}

impl fmt::Display for StompHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StompError
// ---------------------------------------------------------------------------

/// Typed codec errors.
///
/// Each grammar violation is reported as its own variant so callers can
/// distinguish, say, a truncated body from trailing junk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StompError {
    #[error("empty header value")]
    ParsingEmptyHeaderValue,
    #[error("content-length exceeds the frame length")]
    ParsingContentLengthExceedsFrameLength,
    #[error("content-length is not a non-negative integer")]
    ParsingInvalidContentLength,
    #[error("junk bytes after the frame body")]
    ParsingJunkAfterBody,
    #[error("missing blank line between headers and body")]
    ParsingMissingBlankLineAfterHeaders,
    #[error("missing colon in header line")]
    ParsingMissingColonInHeader,
    #[error("missing end of line after the command")]
    ParsingMissingEolAfterCommand,
    #[error("missing end of line after a header value")]
    ParsingMissingEolAfterHeaderValue,
    #[error("missing NUL terminator in the frame body")]
    ParsingMissingNullInBody,
    #[error("unrecognized command")]
    ParsingUnrecognizedCommand,
    #[error("unrecognized header")]
    ParsingUnrecognizedHeader,
    #[error("content-length does not match the body length")]
    ValidationContentLengthMismatch,
    #[error("missing required header: {0}")]
    ValidationMissingHeader(StompHeader),
}

// ---------------------------------------------------------------------------
// StompFrame
// ---------------------------------------------------------------------------

/// A parsed, validated STOMP 1.2 frame.
///
/// The frame owns the wire text; [`StompFrame::header_value`] and
/// [`StompFrame::body`] return slices into it.
#[derive(Debug, Clone)]
pub struct StompFrame {
    plain: String,
    command: StompCommand,
    headers: Vec<(StompHeader, Range<usize>)>,
    body: Range<usize>,
}

impl StompFrame {
    /// Parse and validate a frame from its wire representation.
    pub fn parse(plain: impl Into<String>) -> Result<Self, StompError> {
        let frame = Self::parse_unvalidated(plain.into())?;
        frame.validate_required_headers()?;
        Ok(frame)
    }

    /// Assemble a frame from its components.
    ///
    /// The headers are emitted in the given order. If a `content-length`
    /// header is supplied it must match the body length exactly.
    pub fn from_components(
        command: StompCommand,
        headers: &[(StompHeader, &str)],
        body: &str,
    ) -> Result<Self, StompError> {
        if let Some((_, value)) = headers
            .iter()
            .find(|(header, _)| *header == StompHeader::ContentLength)
        {
            let length: usize = value
                .parse()
                .map_err(|_| StompError::ParsingInvalidContentLength)?;
            if length != body.len() {
                return Err(StompError::ValidationContentLengthMismatch);
            }
        }

        let mut plain = String::new();
        plain.push_str(command.as_str());
        plain.push('\n');
        for (header, value) in headers {
            plain.push_str(header.as_str());
            plain.push(':');
            plain.push_str(value);
            plain.push('\n');
        }
        plain.push('\n');
        plain.push_str(body);
        plain.push('\0');
        Self::parse(plain)
    }

    /// The frame command.
    pub fn command(&self) -> StompCommand {
        self.command
    }

    /// Whether the frame carries the given header.
    pub fn has_header(&self, header: StompHeader) -> bool {
        self.headers.iter().any(|(name, _)| *name == header)
    }

    /// The value of the given header, if present.
    ///
    /// On repeated headers the first occurrence wins; later occurrences
    /// stay in the raw frame but are not exposed here.
    pub fn header_value(&self, header: StompHeader) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| *name == header)
            .map(|(_, range)| &self.plain[range.clone()])
    }

    /// The frame body.
    pub fn body(&self) -> &str {
        &self.plain[self.body.clone()]
    }

    /// The canonical wire text of the frame, including the NUL terminator.
    pub fn as_wire(&self) -> &str {
        &self.plain
    }

    // -----------------------------------------------------------------------
    // Parsing internals
    // -----------------------------------------------------------------------

    fn parse_unvalidated(plain: String) -> Result<Self, StompError> {
        let bytes = plain.as_bytes();

        // Command line.
        let command_end = memchr(bytes, 0, b'\n').ok_or(StompError::ParsingMissingEolAfterCommand)?;
        let command_token = strip_cr(&plain[..command_end]);
        let command = StompCommand::from_token(command_token)
            .ok_or(StompError::ParsingUnrecognizedCommand)?;

        // Header lines, up to the blank separator line.
        let mut headers: Vec<(StompHeader, Range<usize>)> = Vec::new();
        let mut pos = command_end + 1;
        let body_start = loop {
            if pos >= bytes.len() {
                return Err(StompError::ParsingMissingBlankLineAfterHeaders);
            }
            let Some(line_end) = memchr(bytes, pos, b'\n') else {
                // An unterminated trailing line. If it looks like a header,
                // the EOL after its value is what is missing.
                let line = &plain[pos..];
                if line.contains(':') {
                    return Err(StompError::ParsingMissingEolAfterHeaderValue);
                }
                return Err(StompError::ParsingMissingColonInHeader);
            };
            let line = strip_cr(&plain[pos..line_end]);
            if line.is_empty() {
                break line_end + 1;
            }
            let colon = line.find(':').ok_or(StompError::ParsingMissingColonInHeader)?;
            let header = StompHeader::from_name(&line[..colon])
                .ok_or(StompError::ParsingUnrecognizedHeader)?;
            let value_start = pos + colon + 1;
            let value_end = pos + line.len();
            if value_start == value_end {
                return Err(StompError::ParsingEmptyHeaderValue);
            }
            headers.push((header, value_start..value_end));
            pos = line_end + 1;
        };

        // Body: delimited by content-length when present, by the first NUL
        // otherwise.
        let content_length = headers
            .iter()
            .find(|(name, _)| *name == StompHeader::ContentLength)
            .map(|(_, range)| {
                plain[range.clone()]
                    .parse::<usize>()
                    .map_err(|_| StompError::ParsingInvalidContentLength)
            })
            .transpose()?;
        let body = match content_length {
            Some(length) => {
                let nul_at = body_start + length;
                if nul_at + 1 > bytes.len() {
                    return Err(StompError::ParsingContentLengthExceedsFrameLength);
                }
                if bytes[nul_at] != 0 || bytes[body_start..nul_at].contains(&0) {
                    return Err(StompError::ParsingMissingNullInBody);
                }
                body_start..nul_at
            }
            None => {
                let nul_at = memchr(bytes, body_start, 0)
                    .ok_or(StompError::ParsingMissingNullInBody)?;
                body_start..nul_at
            }
        };

        // Only EOLs are permitted after the terminating NUL.
        if bytes[body.end + 1..]
            .iter()
            .any(|byte| *byte != b'\n' && *byte != b'\r')
        {
            return Err(StompError::ParsingJunkAfterBody);
        }

        Ok(StompFrame {
            plain,
            command,
            headers,
            body,
        })
    }

    fn validate_required_headers(&self) -> Result<(), StompError> {
        for header in self.command.required_headers() {
            if !self.has_header(*header) {
                return Err(StompError::ValidationMissingHeader(*header));
            }
        }
        Ok(())
    }
}

impl fmt::Display for StompFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.plain)
    }
}

/// Frames are equal when their command, effective header set, and body
/// match. The raw text may differ (e.g. extra occurrences of a repeated
/// header, or CR-LF line endings).
impl PartialEq for StompFrame {
    fn eq(&self, other: &Self) -> bool {
        if self.command != other.command || self.body() != other.body() {
            return false;
        }
        let names = |frame: &Self| {
            let mut names: Vec<StompHeader> =
                frame.headers.iter().map(|(name, _)| *name).collect();
            names.sort_by_key(|name| name.as_str());
            names.dedup();
            names
        };
        let self_names = names(self);
        if self_names != names(other) {
            return false;
        }
        self_names
            .iter()
            .all(|name| self.header_value(*name) == other.header_value(*name))
    }
}

impl Eq for StompFrame {}

fn strip_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}

fn memchr(bytes: &[u8], from: usize, needle: u8) -> Option<usize> {
    bytes[from..]
        .iter()
        .position(|byte| *byte == needle)
        .map(|offset| from + offset)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
