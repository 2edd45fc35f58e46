//! Protocol messages and their wire codec.
//!
//! Every message is one websocket binary frame: a UTF-8 header line of
//! space-separated fields terminated by `\n`, followed by a binary body
//! whose length is given in the header. UPLOAD and DOWNLOAD bodies are a
//! sequence of changesets, each with its own `changeset` header line.

use crate::error::ErrorInfo;
use crate::progress::{
    RequestIdent, SaltedFileIdent, SaltedVersion, SessionIdent, SyncProgress, Timestamp, Version,
};
use crate::progress::{DownloadCursor, UploadCursor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from decoding a wire frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The first header token names no known message.
    #[error("unknown message type: {0}")]
    UnknownMessage(String),

    /// A header field is missing or malformed.
    #[error("bad message syntax: {0}")]
    BadSyntax(&'static str),

    /// The declared body sizes do not match the frame length.
    #[error("message body size mismatch")]
    BadBodySize,

    /// A changeset sub-header within an UPLOAD/DOWNLOAD body is malformed.
    #[error("bad changeset header syntax")]
    BadChangesetHeader,

    /// A JSON body failed to parse.
    #[error("bad JSON body: {0}")]
    BadJsonBody(String),
}

fn split_frame(frame: &[u8]) -> Result<(&str, &[u8]), ParseError> {
    let newline = frame
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(ParseError::BadSyntax("missing header terminator"))?;
    let header = std::str::from_utf8(&frame[..newline])
        .map_err(|_| ParseError::BadSyntax("header is not UTF-8"))?;
    Ok((header, &frame[newline + 1..]))
}

/// Cursor over the whitespace-separated fields of a header line.
struct Fields<'a> {
    iter: std::str::SplitWhitespace<'a>,
}

impl<'a> Fields<'a> {
    fn new(header: &'a str) -> Self {
        Self {
            iter: header.split_whitespace(),
        }
    }

    fn token(&mut self) -> Result<&'a str, ParseError> {
        self.iter
            .next()
            .ok_or(ParseError::BadSyntax("missing header field"))
    }

    fn u64(&mut self) -> Result<u64, ParseError> {
        self.token()?
            .parse()
            .map_err(|_| ParseError::BadSyntax("expected unsigned integer"))
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        self.token()?
            .parse()
            .map_err(|_| ParseError::BadSyntax("expected unsigned integer"))
    }

    fn i64(&mut self) -> Result<i64, ParseError> {
        self.token()?
            .parse()
            .map_err(|_| ParseError::BadSyntax("expected integer"))
    }

    fn usize(&mut self) -> Result<usize, ParseError> {
        self.token()?
            .parse()
            .map_err(|_| ParseError::BadSyntax("expected size"))
    }

    fn flag(&mut self) -> Result<bool, ParseError> {
        match self.token()? {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(ParseError::BadSyntax("expected 0 or 1")),
        }
    }

    fn end(mut self) -> Result<(), ParseError> {
        match self.iter.next() {
            None => Ok(()),
            Some(_) => Err(ParseError::BadSyntax("trailing header fields")),
        }
    }
}

fn frame(header: String, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.len() + 1 + body.len());
    out.extend_from_slice(header.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(body);
    out
}

fn take<'a>(body: &mut &'a [u8], size: usize) -> Result<&'a [u8], ParseError> {
    if body.len() < size {
        return Err(ParseError::BadBodySize);
    }
    let (head, rest) = body.split_at(size);
    *body = rest;
    Ok(head)
}

fn body_str(bytes: &[u8]) -> Result<String, ParseError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ParseError::BadSyntax("body is not UTF-8"))
}

fn progress_fields(fields: &mut Fields<'_>) -> Result<SyncProgress, ParseError> {
    Ok(SyncProgress {
        latest_server_version: SaltedVersion {
            version: fields.u64()?,
            salt: fields.u64()?,
        },
        download: DownloadCursor {
            server_version: fields.u64()?,
            last_integrated_client_version: fields.u64()?,
        },
        upload: UploadCursor {
            client_version: fields.u64()?,
            last_integrated_server_version: fields.u64()?,
        },
    })
}

fn push_progress(header: &mut String, progress: &SyncProgress) {
    use std::fmt::Write;
    let _ = write!(
        header,
        " {} {} {} {} {} {}",
        progress.latest_server_version.version,
        progress.latest_server_version.salt,
        progress.download.server_version,
        progress.download.last_integrated_client_version,
        progress.upload.client_version,
        progress.upload.last_integrated_server_version,
    );
}

// ---------------------------------------------------------------------------
// Client -> server messages
// ---------------------------------------------------------------------------

/// BIND: opens a logical session on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    /// Session identifier chosen by the client, unique per connection.
    pub session_ident: SessionIdent,
    /// Whether the client needs the server to assign a file identity.
    pub need_file_ident: bool,
    /// Whether the session uses query-driven (FLX) sync.
    pub flx: bool,
    /// Access token placeholder (authorization happens at the HTTP layer;
    /// this field is carried for protocol compatibility).
    pub access_token: String,
    /// Server path of the bound store (partition-based sync; empty for FLX).
    pub path: String,
    /// Extra JSON metadata (FLX; empty when unused).
    pub json_data: String,
}

impl Bind {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let header = format!(
            "bind {} {} {} {} {} {}",
            self.session_ident,
            self.need_file_ident as u8,
            self.flx as u8,
            self.access_token.len(),
            self.path.len(),
            self.json_data.len(),
        );
        let mut body = Vec::new();
        body.extend_from_slice(self.access_token.as_bytes());
        body.extend_from_slice(self.path.as_bytes());
        body.extend_from_slice(self.json_data.as_bytes());
        frame(header, &body)
    }

    fn decode(mut fields: Fields<'_>, mut body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        let need_file_ident = fields.flag()?;
        let flx = fields.flag()?;
        let token_size = fields.usize()?;
        let path_size = fields.usize()?;
        let json_size = fields.usize()?;
        fields.end()?;
        let access_token = body_str(take(&mut body, token_size)?)?;
        let path = body_str(take(&mut body, path_size)?)?;
        let json_data = body_str(take(&mut body, json_size)?)?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self {
            session_ident,
            need_file_ident,
            flx,
            access_token,
            path,
            json_data,
        })
    }
}

/// IDENT: announces the client file identity and resume position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    /// Session identifier.
    pub session_ident: SessionIdent,
    /// Client file identity, as assigned by the server.
    pub file_ident: SaltedFileIdent,
    /// Progress cursors at which to resume.
    pub progress: SyncProgress,
    /// Active query set for FLX sessions: (version, body).
    pub query: Option<(i64, String)>,
}

impl Ident {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut header = format!(
            "ident {} {} {}",
            self.session_ident, self.file_ident.ident, self.file_ident.salt
        );
        push_progress(&mut header, &self.progress);
        use std::fmt::Write;
        match &self.query {
            Some((version, body)) => {
                let _ = write!(header, " 1 {} {}", version, body.len());
                frame(header, body.as_bytes())
            }
            None => {
                let _ = write!(header, " 0 0 0");
                frame(header, &[])
            }
        }
    }

    fn decode(mut fields: Fields<'_>, mut body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        let file_ident = SaltedFileIdent {
            ident: fields.u64()?,
            salt: fields.u64()?,
        };
        let progress = progress_fields(&mut fields)?;
        let has_query = fields.flag()?;
        let query_version = fields.i64()?;
        let query_size = fields.usize()?;
        fields.end()?;
        let query = if has_query {
            Some((query_version, body_str(take(&mut body, query_size)?)?))
        } else {
            None
        };
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self {
            session_ident,
            file_ident,
            progress,
            query,
        })
    }
}

/// One changeset within an UPLOAD message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChangeset {
    /// Client version produced by this changeset.
    pub client_version: Version,
    /// Server version integrated locally when the changeset was produced.
    pub last_integrated_server_version: Version,
    /// Origin timestamp, milliseconds.
    pub origin_timestamp: Timestamp,
    /// Origin file identifier (zero for changes of local origin).
    pub origin_file_ident: u64,
    /// Opaque changeset payload.
    pub payload: Vec<u8>,
}

/// UPLOAD: sends locally produced changesets to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    /// Session identifier.
    pub session_ident: SessionIdent,
    /// Client version the upload cursor has scanned to.
    pub progress_client_version: Version,
    /// Server version paired with the scan position.
    pub progress_server_version: Version,
    /// Server version the client asks the server to keep alive in its
    /// history while these changesets await integration.
    pub locked_server_version: Version,
    /// The changesets, oldest first.
    pub changesets: Vec<UploadChangeset>,
}

impl Upload {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for changeset in &self.changesets {
            let sub = format!(
                "changeset {} {} {} {} {}",
                changeset.client_version,
                changeset.last_integrated_server_version,
                changeset.origin_timestamp,
                changeset.origin_file_ident,
                changeset.payload.len(),
            );
            body.extend_from_slice(sub.as_bytes());
            body.push(b'\n');
            body.extend_from_slice(&changeset.payload);
        }
        let header = format!(
            "upload {} {} {} {} {} {}",
            self.session_ident,
            self.progress_client_version,
            self.progress_server_version,
            self.locked_server_version,
            self.changesets.len(),
            body.len(),
        );
        frame(header, &body)
    }

    fn decode(mut fields: Fields<'_>, mut body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        let progress_client_version = fields.u64()?;
        let progress_server_version = fields.u64()?;
        let locked_server_version = fields.u64()?;
        let num_changesets = fields.usize()?;
        let body_size = fields.usize()?;
        fields.end()?;
        if body.len() != body_size {
            return Err(ParseError::BadBodySize);
        }
        let mut changesets = Vec::with_capacity(num_changesets);
        for _ in 0..num_changesets {
            let (sub_header, rest) =
                split_frame(body).map_err(|_| ParseError::BadChangesetHeader)?;
            body = rest;
            let mut sub = Fields::new(sub_header);
            if sub.token()? != "changeset" {
                return Err(ParseError::BadChangesetHeader);
            }
            let client_version = sub.u64()?;
            let last_integrated_server_version = sub.u64()?;
            let origin_timestamp = sub.u64()?;
            let origin_file_ident = sub.u64()?;
            let payload_size = sub.usize()?;
            sub.end()?;
            let payload = take(&mut body, payload_size)?.to_vec();
            changesets.push(UploadChangeset {
                client_version,
                last_integrated_server_version,
                origin_timestamp,
                origin_file_ident,
                payload,
            });
        }
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self {
            session_ident,
            progress_client_version,
            progress_server_version,
            locked_server_version,
            changesets,
        })
    }
}

/// MARK: requests a download checkpoint acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    /// Session identifier.
    pub session_ident: SessionIdent,
    /// Request identifier to be echoed by the server.
    pub request_ident: RequestIdent,
}

impl Mark {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        frame(
            format!("mark {} {}", self.session_ident, self.request_ident),
            &[],
        )
    }

    fn decode(mut fields: Fields<'_>, body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        let request_ident = fields.u64()?;
        fields.end()?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self {
            session_ident,
            request_ident,
        })
    }
}

/// QUERY: announces a new subscription (query set) version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryChange {
    /// Session identifier.
    pub session_ident: SessionIdent,
    /// Version of the query set.
    pub query_version: i64,
    /// Serialized query set.
    pub query_body: String,
}

impl QueryChange {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let header = format!(
            "query {} {} {}",
            self.session_ident,
            self.query_version,
            self.query_body.len()
        );
        frame(header, self.query_body.as_bytes())
    }

    fn decode(mut fields: Fields<'_>, mut body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        let query_version = fields.i64()?;
        let query_size = fields.usize()?;
        fields.end()?;
        let query_body = body_str(take(&mut body, query_size)?)?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self {
            session_ident,
            query_version,
            query_body,
        })
    }
}

/// UNBIND: closes a logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unbind {
    /// Session identifier.
    pub session_ident: SessionIdent,
}

impl Unbind {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        frame(format!("unbind {}", self.session_ident), &[])
    }

    fn decode(mut fields: Fields<'_>, body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        fields.end()?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self { session_ident })
    }
}

#[derive(Serialize, Deserialize)]
struct ErrorReportBody {
    message: String,
}

/// ERROR (client to server): reports a client-detected integration failure
/// as a diagnostic, with a JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Session identifier.
    pub session_ident: SessionIdent,
    /// Error code (from the client error range).
    pub code: u16,
    /// Human-readable description.
    pub message: String,
}

impl ErrorReport {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let body = serde_json::to_string(&ErrorReportBody {
            message: self.message.clone(),
        })
        .unwrap_or_default();
        let header = format!(
            "error {} {} {}",
            self.session_ident,
            self.code,
            body.len()
        );
        frame(header, body.as_bytes())
    }

    fn decode(mut fields: Fields<'_>, mut body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        let code = fields.u16()?;
        let body_size = fields.usize()?;
        fields.end()?;
        let json = body_str(take(&mut body, body_size)?)?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        let parsed: ErrorReportBody =
            serde_json::from_str(&json).map_err(|e| ParseError::BadJsonBody(e.to_string()))?;
        Ok(Self {
            session_ident,
            code,
            message: parsed.message,
        })
    }
}

/// TEST_COMMAND: test-only request routed through the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    /// Session identifier.
    pub session_ident: SessionIdent,
    /// Request identifier to be echoed in the response.
    pub request_ident: RequestIdent,
    /// Command body.
    pub body: String,
}

impl TestCommand {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let header = format!(
            "test_command {} {} {}",
            self.session_ident,
            self.request_ident,
            self.body.len()
        );
        frame(header, self.body.as_bytes())
    }

    fn decode(mut fields: Fields<'_>, mut body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        let request_ident = fields.u64()?;
        let body_size = fields.usize()?;
        fields.end()?;
        let text = body_str(take(&mut body, body_size)?)?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self {
            session_ident,
            request_ident,
            body: text,
        })
    }
}

/// PING: connection keepalive probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    /// Millisecond timestamp at send time; echoed by PONG.
    pub timestamp: Timestamp,
    /// Round-trip time of the previous ping/pong exchange, milliseconds.
    pub rtt: u64,
}

impl Ping {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        frame(format!("ping {} {}", self.timestamp, self.rtt), &[])
    }

    fn decode(mut fields: Fields<'_>, body: &[u8]) -> Result<Self, ParseError> {
        let timestamp = fields.u64()?;
        let rtt = fields.u64()?;
        fields.end()?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self { timestamp, rtt })
    }
}

/// Any client-to-server message.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ClientMessage {
    Bind(Bind),
    Ident(Ident),
    Upload(Upload),
    Mark(Mark),
    QueryChange(QueryChange),
    Unbind(Unbind),
    Error(ErrorReport),
    TestCommand(TestCommand),
    Ping(Ping),
}

impl ClientMessage {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ClientMessage::Bind(m) => m.encode(),
            ClientMessage::Ident(m) => m.encode(),
            ClientMessage::Upload(m) => m.encode(),
            ClientMessage::Mark(m) => m.encode(),
            ClientMessage::QueryChange(m) => m.encode(),
            ClientMessage::Unbind(m) => m.encode(),
            ClientMessage::Error(m) => m.encode(),
            ClientMessage::TestCommand(m) => m.encode(),
            ClientMessage::Ping(m) => m.encode(),
        }
    }

    /// Decodes one wire frame.
    pub fn decode(frame: &[u8]) -> Result<Self, ParseError> {
        let (header, body) = split_frame(frame)?;
        let mut fields = Fields::new(header);
        let name = fields.token()?;
        match name {
            "bind" => Bind::decode(fields, body).map(ClientMessage::Bind),
            "ident" => Ident::decode(fields, body).map(ClientMessage::Ident),
            "upload" => Upload::decode(fields, body).map(ClientMessage::Upload),
            "mark" => Mark::decode(fields, body).map(ClientMessage::Mark),
            "query" => QueryChange::decode(fields, body).map(ClientMessage::QueryChange),
            "unbind" => Unbind::decode(fields, body).map(ClientMessage::Unbind),
            "error" => ErrorReport::decode(fields, body).map(ClientMessage::Error),
            "test_command" => TestCommand::decode(fields, body).map(ClientMessage::TestCommand),
            "ping" => Ping::decode(fields, body).map(ClientMessage::Ping),
            other => Err(ParseError::UnknownMessage(other.to_owned())),
        }
    }

    /// Short message name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Bind(_) => "BIND",
            ClientMessage::Ident(_) => "IDENT",
            ClientMessage::Upload(_) => "UPLOAD",
            ClientMessage::Mark(_) => "MARK",
            ClientMessage::QueryChange(_) => "QUERY",
            ClientMessage::Unbind(_) => "UNBIND",
            ClientMessage::Error(_) => "ERROR",
            ClientMessage::TestCommand(_) => "TEST_COMMAND",
            ClientMessage::Ping(_) => "PING",
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client messages
// ---------------------------------------------------------------------------

/// IDENT (server to client): assigns a client file identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentAllocation {
    /// Session identifier.
    pub session_ident: SessionIdent,
    /// The assigned identity.
    pub file_ident: SaltedFileIdent,
}

impl IdentAllocation {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        frame(
            format!(
                "ident {} {} {}",
                self.session_ident, self.file_ident.ident, self.file_ident.salt
            ),
            &[],
        )
    }

    fn decode(mut fields: Fields<'_>, body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        let file_ident = SaltedFileIdent {
            ident: fields.u64()?,
            salt: fields.u64()?,
        };
        fields.end()?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self {
            session_ident,
            file_ident,
        })
    }
}

/// One changeset within a DOWNLOAD message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChangeset {
    /// Server version produced by this changeset.
    pub remote_version: Version,
    /// Client version the server had integrated when it produced this
    /// changeset.
    pub last_integrated_local_version: Version,
    /// Origin timestamp, milliseconds.
    pub origin_timestamp: Timestamp,
    /// File identifier of the client that originated the change.
    pub origin_file_ident: u64,
    /// Opaque changeset payload.
    pub payload: Vec<u8>,
}

/// DOWNLOAD: delivers server-side changesets and updated progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    /// Session identifier.
    pub session_ident: SessionIdent,
    /// Updated progress cursors.
    pub progress: SyncProgress,
    /// Server's estimate of bytes remaining to download.
    pub downloadable_bytes: u64,
    /// Whether this message completes the current batch.
    pub last_in_batch: bool,
    /// Query set version these changesets belong to (FLX; zero otherwise).
    pub query_version: i64,
    /// The changesets, oldest first.
    pub changesets: Vec<RemoteChangeset>,
}

impl Download {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for changeset in &self.changesets {
            let sub = format!(
                "changeset {} {} {} {} {}",
                changeset.remote_version,
                changeset.last_integrated_local_version,
                changeset.origin_timestamp,
                changeset.origin_file_ident,
                changeset.payload.len(),
            );
            body.extend_from_slice(sub.as_bytes());
            body.push(b'\n');
            body.extend_from_slice(&changeset.payload);
        }
        let mut header = format!("download {}", self.session_ident);
        push_progress(&mut header, &self.progress);
        use std::fmt::Write;
        let _ = write!(
            header,
            " {} {} {} {} {}",
            self.downloadable_bytes,
            self.last_in_batch as u8,
            self.query_version,
            self.changesets.len(),
            body.len(),
        );
        frame(header, &body)
    }

    fn decode(mut fields: Fields<'_>, mut body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        let progress = progress_fields(&mut fields)?;
        let downloadable_bytes = fields.u64()?;
        let last_in_batch = fields.flag()?;
        let query_version = fields.i64()?;
        let num_changesets = fields.usize()?;
        let body_size = fields.usize()?;
        fields.end()?;
        if body.len() != body_size {
            return Err(ParseError::BadBodySize);
        }
        let mut changesets = Vec::with_capacity(num_changesets);
        for _ in 0..num_changesets {
            let (sub_header, rest) =
                split_frame(body).map_err(|_| ParseError::BadChangesetHeader)?;
            body = rest;
            let mut sub = Fields::new(sub_header);
            if sub.token()? != "changeset" {
                return Err(ParseError::BadChangesetHeader);
            }
            let remote_version = sub.u64()?;
            let last_integrated_local_version = sub.u64()?;
            let origin_timestamp = sub.u64()?;
            let origin_file_ident = sub.u64()?;
            let payload_size = sub.usize()?;
            sub.end()?;
            let payload = take(&mut body, payload_size)?.to_vec();
            changesets.push(RemoteChangeset {
                remote_version,
                last_integrated_local_version,
                origin_timestamp,
                origin_file_ident,
                payload,
            });
        }
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self {
            session_ident,
            progress,
            downloadable_bytes,
            last_in_batch,
            query_version,
            changesets,
        })
    }
}

/// MARK (server to client): acknowledges a download checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkResponse {
    /// Session identifier.
    pub session_ident: SessionIdent,
    /// The request identifier from the corresponding MARK request.
    pub request_ident: RequestIdent,
}

impl MarkResponse {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        frame(
            format!("mark {} {}", self.session_ident, self.request_ident),
            &[],
        )
    }

    fn decode(mut fields: Fields<'_>, body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        let request_ident = fields.u64()?;
        fields.end()?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self {
            session_ident,
            request_ident,
        })
    }
}

/// UNBOUND: confirms an UNBIND.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unbound {
    /// Session identifier.
    pub session_ident: SessionIdent,
}

impl Unbound {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        frame(format!("unbound {}", self.session_ident), &[])
    }

    fn decode(mut fields: Fields<'_>, body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        fields.end()?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self { session_ident })
    }
}

/// ERROR (server to client): connection-level (session_ident = 0) or
/// session-level error report.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    /// Session identifier; zero means the error concerns the connection.
    pub session_ident: SessionIdent,
    /// Raw error code; see [`crate::ProtocolErrorCode`].
    pub code: u16,
    /// Structured detail.
    pub info: ErrorInfo,
}

impl ErrorMessage {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let body = serde_json::to_string(&self.info).unwrap_or_default();
        let header = format!(
            "error {} {} {} {}",
            self.session_ident,
            self.code,
            self.info.try_again as u8,
            body.len()
        );
        frame(header, body.as_bytes())
    }

    fn decode(mut fields: Fields<'_>, mut body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        let code = fields.u16()?;
        let try_again = fields.flag()?;
        let body_size = fields.usize()?;
        fields.end()?;
        let json = body_str(take(&mut body, body_size)?)?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        let mut info: ErrorInfo =
            serde_json::from_str(&json).map_err(|e| ParseError::BadJsonBody(e.to_string()))?;
        // The header flag is authoritative.
        info.try_again = try_again;
        Ok(Self {
            session_ident,
            code,
            info,
        })
    }
}

/// QUERY_ERROR: the server rejected a query set version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryError {
    /// Session identifier.
    pub session_ident: SessionIdent,
    /// Raw error code.
    pub code: u16,
    /// The query version being rejected.
    pub query_version: i64,
    /// Human-readable description.
    pub message: String,
}

impl QueryError {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let header = format!(
            "query_error {} {} {} {}",
            self.session_ident,
            self.code,
            self.query_version,
            self.message.len()
        );
        frame(header, self.message.as_bytes())
    }

    fn decode(mut fields: Fields<'_>, mut body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        let code = fields.u16()?;
        let query_version = fields.i64()?;
        let message_size = fields.usize()?;
        fields.end()?;
        let message = body_str(take(&mut body, message_size)?)?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self {
            session_ident,
            code,
            query_version,
            message,
        })
    }
}

/// TEST_COMMAND response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommandResponse {
    /// Session identifier.
    pub session_ident: SessionIdent,
    /// The request identifier being answered.
    pub request_ident: RequestIdent,
    /// Response body.
    pub body: String,
}

impl TestCommandResponse {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let header = format!(
            "test_command {} {} {}",
            self.session_ident,
            self.request_ident,
            self.body.len()
        );
        frame(header, self.body.as_bytes())
    }

    fn decode(mut fields: Fields<'_>, mut body: &[u8]) -> Result<Self, ParseError> {
        let session_ident = fields.u64()?;
        let request_ident = fields.u64()?;
        let body_size = fields.usize()?;
        fields.end()?;
        let text = body_str(take(&mut body, body_size)?)?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self {
            session_ident,
            request_ident,
            body: text,
        })
    }
}

/// PONG: answers a PING, echoing its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    /// The timestamp of the PING being answered.
    pub timestamp: Timestamp,
}

impl Pong {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        frame(format!("pong {}", self.timestamp), &[])
    }

    fn decode(mut fields: Fields<'_>, body: &[u8]) -> Result<Self, ParseError> {
        let timestamp = fields.u64()?;
        fields.end()?;
        if !body.is_empty() {
            return Err(ParseError::BadBodySize);
        }
        Ok(Self { timestamp })
    }
}

/// Any server-to-client message.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ServerMessage {
    Ident(IdentAllocation),
    Download(Download),
    Mark(MarkResponse),
    Unbound(Unbound),
    Error(ErrorMessage),
    QueryError(QueryError),
    TestCommand(TestCommandResponse),
    Pong(Pong),
}

impl ServerMessage {
    /// Encodes the message into one wire frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ServerMessage::Ident(m) => m.encode(),
            ServerMessage::Download(m) => m.encode(),
            ServerMessage::Mark(m) => m.encode(),
            ServerMessage::Unbound(m) => m.encode(),
            ServerMessage::Error(m) => m.encode(),
            ServerMessage::QueryError(m) => m.encode(),
            ServerMessage::TestCommand(m) => m.encode(),
            ServerMessage::Pong(m) => m.encode(),
        }
    }

    /// Decodes one wire frame.
    pub fn decode(frame: &[u8]) -> Result<Self, ParseError> {
        let (header, body) = split_frame(frame)?;
        let mut fields = Fields::new(header);
        let name = fields.token()?;
        match name {
            "ident" => IdentAllocation::decode(fields, body).map(ServerMessage::Ident),
            "download" => Download::decode(fields, body).map(ServerMessage::Download),
            "mark" => MarkResponse::decode(fields, body).map(ServerMessage::Mark),
            "unbound" => Unbound::decode(fields, body).map(ServerMessage::Unbound),
            "error" => ErrorMessage::decode(fields, body).map(ServerMessage::Error),
            "query_error" => QueryError::decode(fields, body).map(ServerMessage::QueryError),
            "test_command" => {
                TestCommandResponse::decode(fields, body).map(ServerMessage::TestCommand)
            }
            "pong" => Pong::decode(fields, body).map(ServerMessage::Pong),
            other => Err(ParseError::UnknownMessage(other.to_owned())),
        }
    }

    /// Short message name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::Ident(_) => "IDENT",
            ServerMessage::Download(_) => "DOWNLOAD",
            ServerMessage::Mark(_) => "MARK",
            ServerMessage::Unbound(_) => "UNBOUND",
            ServerMessage::Error(_) => "ERROR",
            ServerMessage::QueryError(_) => "QUERY_ERROR",
            ServerMessage::TestCommand(_) => "TEST_COMMAND",
            ServerMessage::Pong(_) => "PONG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecoveryAction;
    use proptest::prelude::*;

    fn progress_sample() -> SyncProgress {
        SyncProgress {
            latest_server_version: SaltedVersion {
                version: 90,
                salt: 777,
            },
            download: DownloadCursor {
                server_version: 85,
                last_integrated_client_version: 40,
            },
            upload: UploadCursor {
                client_version: 41,
                last_integrated_server_version: 80,
            },
        }
    }

    #[test]
    fn bind_roundtrip() {
        let msg = Bind {
            session_ident: 3,
            need_file_ident: true,
            flx: false,
            access_token: "token-abc".into(),
            path: "/default".into(),
            json_data: String::new(),
        };
        let decoded = ClientMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, ClientMessage::Bind(msg));
    }

    #[test]
    fn ident_with_query_roundtrip() {
        let msg = Ident {
            session_ident: 3,
            file_ident: SaltedFileIdent { ident: 9, salt: 55 },
            progress: progress_sample(),
            query: Some((4, "{\"tables\":[]}".into())),
        };
        let decoded = ClientMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, ClientMessage::Ident(msg));
    }

    #[test]
    fn upload_roundtrip_preserves_binary_payloads() {
        let msg = Upload {
            session_ident: 1,
            progress_client_version: 10,
            progress_server_version: 20,
            locked_server_version: 18,
            changesets: vec![
                UploadChangeset {
                    client_version: 11,
                    last_integrated_server_version: 20,
                    origin_timestamp: 123456,
                    origin_file_ident: 0,
                    payload: vec![0x00, 0x0a, 0xff, b'\n', 0x7f],
                },
                UploadChangeset {
                    client_version: 12,
                    last_integrated_server_version: 20,
                    origin_timestamp: 123460,
                    origin_file_ident: 0,
                    payload: Vec::new(),
                },
            ],
        };
        let decoded = ClientMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, ClientMessage::Upload(msg));
    }

    #[test]
    fn download_roundtrip() {
        let msg = Download {
            session_ident: 2,
            progress: progress_sample(),
            downloadable_bytes: 4096,
            last_in_batch: true,
            query_version: 0,
            changesets: vec![RemoteChangeset {
                remote_version: 86,
                last_integrated_local_version: 40,
                origin_timestamp: 99,
                origin_file_ident: 12,
                payload: vec![1, 2, 3],
            }],
        };
        let decoded = ServerMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, ServerMessage::Download(msg));
    }

    #[test]
    fn error_message_roundtrip() {
        let mut info = ErrorInfo::transient("session closed");
        info.action = RecoveryAction::Transient;
        info.resumption_delay_ms = Some(1500);
        let msg = ErrorMessage {
            session_ident: 7,
            code: 200,
            info,
        };
        let decoded = ServerMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, ServerMessage::Error(msg));
    }

    #[test]
    fn ping_pong_roundtrip() {
        let ping = Ping {
            timestamp: 5000,
            rtt: 32,
        };
        assert_eq!(
            ClientMessage::decode(&ping.encode()).unwrap(),
            ClientMessage::Ping(ping)
        );

        let pong = Pong { timestamp: 5000 };
        assert_eq!(
            ServerMessage::decode(&pong.encode()).unwrap(),
            ServerMessage::Pong(pong)
        );
    }

    #[test]
    fn unknown_message_rejected() {
        assert_eq!(
            ClientMessage::decode(b"frobnicate 1 2\n"),
            Err(ParseError::UnknownMessage("frobnicate".into()))
        );
    }

    #[test]
    fn missing_terminator_rejected() {
        assert!(matches!(
            ServerMessage::decode(b"pong 123"),
            Err(ParseError::BadSyntax(_))
        ));
    }

    #[test]
    fn body_size_mismatch_rejected() {
        // Declared body larger than the frame.
        assert_eq!(
            ServerMessage::decode(b"query_error 1 223 4 10\nshort"),
            Err(ParseError::BadBodySize)
        );
        // Trailing garbage after the declared body.
        assert_eq!(
            ServerMessage::decode(b"query_error 1 223 4 2\nab-extra"),
            Err(ParseError::BadBodySize)
        );
    }

    #[test]
    fn bad_changeset_header_rejected() {
        // num_changesets says one, but the body starts with a bad sub-header.
        let frame = b"download 2 90 777 85 40 41 80 0 1 0 1 8\nnot-it\nx";
        assert!(matches!(
            ServerMessage::decode(frame),
            Err(ParseError::BadChangesetHeader) | Err(ParseError::BadBodySize)
        ));
    }

    proptest! {
        #[test]
        fn decode_never_panics(frame in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = ClientMessage::decode(&frame);
            let _ = ServerMessage::decode(&frame);
        }

        #[test]
        fn mark_roundtrip_any_idents(sess in 1u64..1_000_000, req in 0u64..1_000_000) {
            let msg = Mark { session_ident: sess, request_ident: req };
            prop_assert_eq!(
                ClientMessage::decode(&msg.encode()).unwrap(),
                ClientMessage::Mark(msg)
            );
        }
    }
}
