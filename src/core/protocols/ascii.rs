use super::ProtocolError;
use crate::core::item::CacheItem;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Longest status/header line accepted before the frame is declared malformed
pub const MAX_LINE_LENGTH: usize = 2048;

/// Upper bound for a single value block announced by a `VALUE` header
pub const MAX_VALUE_SIZE: usize = 1024 * 1024 * 1024;

const CRLF: &[u8] = b"\r\n";

/// Storage command flavours sharing the `<cmd> <key> <flags> <exptime> <bytes>` layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl StoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
            StoreMode::Append => "append",
            StoreMode::Prepend => "prepend",
        }
    }
}

/// ASCII protocol command types
#[derive(Debug, Clone, PartialEq)]
pub enum AsciiCommand<'a> {
    Get {
        keys: Vec<&'a str>,
    },
    Gets {
        keys: Vec<&'a str>,
    },
    Store {
        mode: StoreMode,
        key: &'a str,
        flags: u32,
        exptime: u32,
        data: &'a [u8],
    },
    Cas {
        key: &'a str,
        flags: u32,
        exptime: u32,
        data: &'a [u8],
        cas: u64,
    },
    Delete {
        key: &'a str,
    },
    Incr {
        key: &'a str,
        delta: u64,
    },
    Decr {
        key: &'a str,
        delta: u64,
    },
    Touch {
        key: &'a str,
        exptime: u32,
    },
    FlushAll {
        delay: Option<u32>,
    },
    Stats {
        args: Option<&'a str>,
    },
    Version,
    Quit,
}

/// What shape of reply a command expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Retrieval,
    Storage,
    Delete,
    Arithmetic,
    Touch,
    Stats,
    Version,
    Ok,
    None,
}

impl ResponseKind {
    fn command(&self) -> &'static str {
        match self {
            ResponseKind::Retrieval => "get",
            ResponseKind::Storage => "storage command",
            ResponseKind::Delete => "delete",
            ResponseKind::Arithmetic => "incr/decr",
            ResponseKind::Touch => "touch",
            ResponseKind::Stats => "stats",
            ResponseKind::Version => "version",
            ResponseKind::Ok => "flush_all",
            ResponseKind::None => "quit",
        }
    }
}

/// ASCII protocol response types
#[derive(Debug, Clone, PartialEq)]
pub enum AsciiResponse {
    Values(Vec<CacheItem>),
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Touched,
    Ok,
    Numeric(u64),
    Stats(Vec<(String, String)>),
    Version(String),
    Error(String),
    ClientError(String),
    ServerError(String),
}

impl AsciiResponse {
    /// `ERROR`, `CLIENT_ERROR` and `SERVER_ERROR` replies
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            AsciiResponse::Error(_) | AsciiResponse::ClientError(_) | AsciiResponse::ServerError(_)
        )
    }
}

impl<'a> AsciiCommand<'a> {
    /// Serialize this command into a wire frame
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            AsciiCommand::Get { keys } => put_retrieval(buf, "get", keys),
            AsciiCommand::Gets { keys } => put_retrieval(buf, "gets", keys),
            AsciiCommand::Store {
                mode,
                key,
                flags,
                exptime,
                data,
            } => {
                buf.reserve(key.len() + data.len() + 48);
                put_line(
                    buf,
                    &format!(
                        "{} {} {} {} {}",
                        mode.as_str(),
                        key,
                        flags,
                        exptime,
                        data.len()
                    ),
                );
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            AsciiCommand::Cas {
                key,
                flags,
                exptime,
                data,
                cas,
            } => {
                buf.reserve(key.len() + data.len() + 64);
                put_line(
                    buf,
                    &format!("cas {} {} {} {} {}", key, flags, exptime, data.len(), cas),
                );
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            AsciiCommand::Delete { key } => put_line(buf, &format!("delete {}", key)),
            AsciiCommand::Incr { key, delta } => put_line(buf, &format!("incr {} {}", key, delta)),
            AsciiCommand::Decr { key, delta } => put_line(buf, &format!("decr {} {}", key, delta)),
            AsciiCommand::Touch { key, exptime } => {
                put_line(buf, &format!("touch {} {}", key, exptime))
            }
            AsciiCommand::FlushAll { delay } => match delay {
                Some(delay) => put_line(buf, &format!("flush_all {}", delay)),
                None => put_line(buf, "flush_all"),
            },
            AsciiCommand::Stats { args } => match args {
                Some(args) => put_line(buf, &format!("stats {}", args)),
                None => put_line(buf, "stats"),
            },
            AsciiCommand::Version => put_line(buf, "version"),
            AsciiCommand::Quit => put_line(buf, "quit"),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn response_kind(&self) -> ResponseKind {
        match self {
            AsciiCommand::Get { .. } | AsciiCommand::Gets { .. } => ResponseKind::Retrieval,
            AsciiCommand::Store { .. } | AsciiCommand::Cas { .. } => ResponseKind::Storage,
            AsciiCommand::Delete { .. } => ResponseKind::Delete,
            AsciiCommand::Incr { .. } | AsciiCommand::Decr { .. } => ResponseKind::Arithmetic,
            AsciiCommand::Touch { .. } => ResponseKind::Touch,
            AsciiCommand::FlushAll { .. } => ResponseKind::Ok,
            AsciiCommand::Stats { .. } => ResponseKind::Stats,
            AsciiCommand::Version => ResponseKind::Version,
            AsciiCommand::Quit => ResponseKind::None,
        }
    }

    /// Whether re-sending this command after an unknown outcome is harmless
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            AsciiCommand::Get { .. }
                | AsciiCommand::Gets { .. }
                | AsciiCommand::Delete { .. }
                | AsciiCommand::Touch { .. }
                | AsciiCommand::Stats { .. }
                | AsciiCommand::Version
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            AsciiCommand::Get { .. } => "get",
            AsciiCommand::Gets { .. } => "gets",
            AsciiCommand::Store { mode, .. } => mode.as_str(),
            AsciiCommand::Cas { .. } => "cas",
            AsciiCommand::Delete { .. } => "delete",
            AsciiCommand::Incr { .. } => "incr",
            AsciiCommand::Decr { .. } => "decr",
            AsciiCommand::Touch { .. } => "touch",
            AsciiCommand::FlushAll { .. } => "flush_all",
            AsciiCommand::Stats { .. } => "stats",
            AsciiCommand::Version => "version",
            AsciiCommand::Quit => "quit",
        }
    }
}

fn put_line(buf: &mut BytesMut, line: &str) {
    buf.put_slice(line.as_bytes());
    buf.put_slice(CRLF);
}

fn put_retrieval(buf: &mut BytesMut, cmd: &str, keys: &[&str]) {
    buf.put_slice(cmd.as_bytes());
    for key in keys {
        buf.put_u8(b' ');
        buf.put_slice(key.as_bytes());
    }
    buf.put_slice(CRLF);
}

/// Decode one complete response from the front of `buf`.
///
/// Returns `Ok(None)` without consuming anything while the frame is still
/// incomplete; on success exactly the frame's bytes are consumed.
pub fn decode(
    buf: &mut BytesMut,
    kind: ResponseKind,
) -> Result<Option<AsciiResponse>, ProtocolError> {
    let Some((parsed, consumed)) = parse_frame(&buf[..], kind)? else {
        return Ok(None);
    };

    let response = match parsed {
        ParsedFrame::Response(response) => {
            buf.advance(consumed);
            response
        }
        ParsedFrame::Values(blocks) => {
            // Values are slices of the frame, not copies of it
            let frame = buf.split_to(consumed).freeze();
            AsciiResponse::Values(
                blocks
                    .into_iter()
                    .map(|block| block.into_item(&frame))
                    .collect(),
            )
        }
    };
    Ok(Some(response))
}

enum ParsedFrame {
    Response(AsciiResponse),
    /// A complete retrieval frame; value bytes are still in the buffer
    Values(Vec<ValueBlock>),
}

/// Header of one `VALUE` entry and where its data starts within the frame
struct ValueBlock {
    header: ValueHeader,
    start: usize,
}

impl ValueBlock {
    fn into_item(self, frame: &Bytes) -> CacheItem {
        CacheItem {
            value: frame.slice(self.start..self.start + self.header.bytes),
            key: self.header.key,
            flags: self.header.flags,
            cas: self.header.cas,
        }
    }
}

fn parse_frame(
    buf: &[u8],
    kind: ResponseKind,
) -> Result<Option<(ParsedFrame, usize)>, ProtocolError> {
    let (first, mut pos) = match read_line(buf, 0)? {
        Some(line) => line,
        None => return Ok(None),
    };

    if let Some(error) = parse_error_line(first) {
        return Ok(Some((ParsedFrame::Response(error), pos)));
    }

    let unexpected = |line: &[u8]| ProtocolError::UnexpectedResponse {
        command: kind.command(),
        line: String::from_utf8_lossy(line).into_owned(),
    };

    let response = match kind {
        ResponseKind::Retrieval => {
            // Only headers are parsed here; data blocks are skipped over
            let mut blocks = Vec::new();
            let mut line = first;
            loop {
                if line == b"END" {
                    break;
                }
                let header = parse_value_header(line)?;
                let data_end = pos + header.bytes;
                if buf.len() < data_end + CRLF.len() {
                    return Ok(None);
                }
                if &buf[data_end..data_end + CRLF.len()] != CRLF {
                    return Err(ProtocolError::ParseError(format!(
                        "Value block for '{}' not terminated by CRLF",
                        header.key
                    )));
                }
                blocks.push(ValueBlock { header, start: pos });
                pos = data_end + CRLF.len();
                match read_line(buf, pos)? {
                    Some((next, next_pos)) => {
                        line = next;
                        pos = next_pos;
                    }
                    None => return Ok(None),
                }
            }
            return Ok(Some((ParsedFrame::Values(blocks), pos)));
        }
        ResponseKind::Stats => {
            let mut stats = Vec::new();
            let mut line = first;
            loop {
                if line == b"END" {
                    break;
                }
                let text = as_str(line)?;
                let rest = text.strip_prefix("STAT ").ok_or_else(|| unexpected(line))?;
                let (name, value) = rest.split_once(' ').unwrap_or((rest, ""));
                stats.push((name.to_string(), value.to_string()));
                match read_line(buf, pos)? {
                    Some((next, next_pos)) => {
                        line = next;
                        pos = next_pos;
                    }
                    None => return Ok(None),
                }
            }
            AsciiResponse::Stats(stats)
        }
        ResponseKind::Storage => match first {
            b"STORED" => AsciiResponse::Stored,
            b"NOT_STORED" => AsciiResponse::NotStored,
            b"EXISTS" => AsciiResponse::Exists,
            b"NOT_FOUND" => AsciiResponse::NotFound,
            other => return Err(unexpected(other)),
        },
        ResponseKind::Delete => match first {
            b"DELETED" => AsciiResponse::Deleted,
            b"NOT_FOUND" => AsciiResponse::NotFound,
            other => return Err(unexpected(other)),
        },
        ResponseKind::Touch => match first {
            b"TOUCHED" => AsciiResponse::Touched,
            b"NOT_FOUND" => AsciiResponse::NotFound,
            other => return Err(unexpected(other)),
        },
        ResponseKind::Arithmetic => match first {
            b"NOT_FOUND" => AsciiResponse::NotFound,
            // decr pads shrinking numbers with trailing spaces
            other => as_str(other)?
                .trim_end()
                .parse::<u64>()
                .map(AsciiResponse::Numeric)
                .map_err(|_| unexpected(other))?,
        },
        ResponseKind::Version => {
            let text = as_str(first)?;
            match text.strip_prefix("VERSION ") {
                Some(version) => AsciiResponse::Version(version.to_string()),
                None => return Err(unexpected(first)),
            }
        }
        ResponseKind::Ok => match first {
            b"OK" => AsciiResponse::Ok,
            other => return Err(unexpected(other)),
        },
        ResponseKind::None => return Err(unexpected(first)),
    };

    Ok(Some((ParsedFrame::Response(response), pos)))
}

/// Find the next CRLF-terminated line at `start`; returns the line without
/// its terminator and the offset just past it.
fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    let rest = &buf[start..];
    match rest.windows(2).position(|w| w == CRLF) {
        Some(end) if end > MAX_LINE_LENGTH => Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH)),
        Some(end) => Ok(Some((&rest[..end], start + end + CRLF.len()))),
        None if rest.len() > MAX_LINE_LENGTH => {
            Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH))
        }
        None => Ok(None),
    }
}

fn parse_error_line(line: &[u8]) -> Option<AsciiResponse> {
    let text = String::from_utf8_lossy(line);
    if text == "ERROR" {
        return Some(AsciiResponse::Error(String::new()));
    }
    if let Some(msg) = text.strip_prefix("ERROR ") {
        return Some(AsciiResponse::Error(msg.to_string()));
    }
    if let Some(msg) = text.strip_prefix("CLIENT_ERROR") {
        return Some(AsciiResponse::ClientError(msg.trim_start().to_string()));
    }
    if let Some(msg) = text.strip_prefix("SERVER_ERROR") {
        return Some(AsciiResponse::ServerError(msg.trim_start().to_string()));
    }
    None
}

struct ValueHeader {
    key: String,
    flags: u32,
    bytes: usize,
    cas: Option<u64>,
}

fn parse_value_header(line: &[u8]) -> Result<ValueHeader, ProtocolError> {
    let text = as_str(line)?;
    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.len() < 4 || parts.len() > 5 || parts[0] != "VALUE" {
        return Err(ProtocolError::ParseError(format!(
            "Invalid VALUE response: {}",
            text
        )));
    }
    let flags = parts[2]
        .parse::<u32>()
        .map_err(|_| ProtocolError::ParseError("Invalid flags".to_string()))?;
    let bytes = parts[3]
        .parse::<usize>()
        .map_err(|_| ProtocolError::ParseError("Invalid bytes".to_string()))?;
    if bytes > MAX_VALUE_SIZE {
        return Err(ProtocolError::ValueTooLarge {
            size: bytes,
            max: MAX_VALUE_SIZE,
        });
    }
    let cas = match parts.get(4) {
        Some(cas) => Some(
            cas.parse::<u64>()
                .map_err(|_| ProtocolError::ParseError("Invalid cas unique".to_string()))?,
        ),
        None => None,
    };
    Ok(ValueHeader {
        key: parts[1].to_string(),
        flags,
        bytes,
        cas,
    })
}

fn as_str(line: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(line)
        .map_err(|_| ProtocolError::ParseError("Response line is not valid UTF-8".to_string()))
}
