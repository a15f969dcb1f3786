//! Trace recorder: a lossless text format for raw directory responses.
//!
//! Each response is written as a comment header followed by one LDIF
//! record per entry or intermediate message:
//!
//! ```text
//! # result: 100
//! # control: <oid> <true|false> <base64>
//! #
//! dn: cn=alice,dc=example,dc=com
//! objectClass: person
//! control: 1.3.6.1.4.1.4203.1.9.1.2 false <base64>
//!
//! ```
//!
//! Header `control` lines carry response-level controls; entry-level
//! controls become a synthetic multi-valued `control` attribute. An
//! intermediate message is a record with an empty DN whose first `control`
//! value holds the response name and value.
//!
//! An attribute present with no values is written as a synthetic
//! `novalue` line holding its name. A real attribute whose name is
//! synthetic or starts with `~` is written with one extra leading `~`.
//! An empty OID is written as `-`.

pub mod cookie;
pub mod ldif;

use std::borrow::Cow;
use std::io::Write;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::trace;

use crate::errors::{TraceError, WatchError};
use crate::ldap::response::{
    LdapResponse, RawAttributes, RawControl, ResponseData, ResponseKind, ResponseSource,
};

pub use cookie::CookieFile;

const CONTROL_ATTR: &str = "control";
const NO_VALUE_ATTR: &str = "novalue";
const ESCAPE: char = '~';
const EMPTY_OID: &str = "-";

fn escape_name(name: &str) -> Cow<'_, str> {
    if name == CONTROL_ATTR || name == NO_VALUE_ATTR || name.starts_with(ESCAPE) {
        Cow::Owned(format!("{ESCAPE}{name}"))
    } else {
        Cow::Borrowed(name)
    }
}

/// A recognised `#` header line.
enum Header<'a> {
    Result(&'a str),
    Control(&'a str),
}

fn parse_header(line: &str) -> Option<Header<'_>> {
    let body = line.strip_prefix('#')?.trim_start();
    if let Some(code) = body.strip_prefix("result:") {
        Some(Header::Result(code.trim()))
    } else {
        body.strip_prefix("control:")
            .map(|ctrl| Header::Control(ctrl.trim()))
    }
}

// ---------------------------------------------------------------------------
// Controls
// ---------------------------------------------------------------------------

/// `<oid> <true|false> [<base64>]`; the value token is omitted when empty.
pub fn control_to_text(ctrl: &RawControl) -> String {
    let critical = if ctrl.critical { "true" } else { "false" };
    let oid = if ctrl.oid.is_empty() { EMPTY_OID } else { &ctrl.oid };
    if ctrl.value.is_empty() {
        format!("{oid} {critical}")
    } else {
        format!("{oid} {critical} {}", STANDARD.encode(&ctrl.value))
    }
}

/// Inverse of [`control_to_text`].
pub fn control_from_text(text: &str) -> Result<RawControl, TraceError> {
    let invalid = || TraceError::InvalidControl(text.to_string());
    let mut tokens = text.split_whitespace();
    let oid = match tokens.next().ok_or_else(invalid)? {
        EMPTY_OID => "",
        oid => oid,
    };
    let critical = match tokens.next() {
        Some("true") => true,
        Some("false") => false,
        _ => return Err(invalid()),
    };
    let value = match tokens.next() {
        Some(encoded) => STANDARD.decode(encoded).map_err(|_| invalid())?,
        None => Vec::new(),
    };
    if tokens.next().is_some() {
        return Err(invalid());
    }
    Ok(RawControl::new(oid, critical, value))
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Render one response in trace format.
pub fn render_response(response: &LdapResponse) -> String {
    let mut out = format!("# result: {}\n", response.kind.code());
    for ctrl in &response.ctrls {
        out.push_str(&format!("# control: {}\n", control_to_text(ctrl)));
    }
    out.push_str("#\n");

    for data in &response.data {
        match data {
            ResponseData::Entry { dn, attrs, ctrls } => {
                ldif::push_folded(&mut out, &ldif::attr_line("dn", dn.as_bytes()));
                for (name, values) in attrs {
                    let name = escape_name(name);
                    if values.is_empty() {
                        ldif::push_folded(&mut out, &ldif::attr_line(NO_VALUE_ATTR, name.as_bytes()));
                    }
                    for value in values {
                        ldif::push_folded(&mut out, &ldif::attr_line(&name, value));
                    }
                }
                push_controls(&mut out, ctrls);
            }
            ResponseData::Intermediate { name, value, ctrls } => {
                ldif::push_folded(&mut out, &ldif::attr_line("dn", b""));
                let message = RawControl::new(name.clone(), false, value.clone());
                push_controls(&mut out, std::iter::once(&message).chain(ctrls));
            }
        }
        out.push('\n');
    }
    out
}

fn push_controls<'a>(out: &mut String, ctrls: impl IntoIterator<Item = &'a RawControl>) {
    for ctrl in ctrls {
        let text = control_to_text(ctrl);
        ldif::push_folded(out, &ldif::attr_line(CONTROL_ATTR, text.as_bytes()));
    }
}

/// Render a whole response sequence.
pub fn encode(responses: &[LdapResponse]) -> String {
    responses.iter().map(render_response).collect()
}

/// Append one response to a trace stream and flush it.
pub fn write_response<W: Write + ?Sized>(
    writer: &mut W,
    response: &LdapResponse,
) -> Result<(), TraceError> {
    writer.write_all(render_response(response).as_bytes())?;
    writer.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// An LDIF record being accumulated, as logical (unfolded) lines.
struct Record {
    first_line: usize,
    lines: Vec<String>,
}

/// Parse a trace back into responses.
pub fn decode(text: &str) -> Result<Vec<LdapResponse>, TraceError> {
    let mut responses = Vec::new();
    let mut current: Option<LdapResponse> = None;
    let mut record: Option<Record> = None;

    for (index, line) in text.lines().enumerate() {
        let lineno = index + 1;
        if line.starts_with('#') {
            flush_record(&mut current, &mut record)?;
            match parse_header(line) {
                Some(Header::Result(code)) => {
                    let code = code.parse::<u32>().map_err(|e| TraceError::Malformed {
                        line: lineno,
                        detail: format!("bad result code '{code}': {e}"),
                    })?;
                    responses.extend(current.take());
                    current = Some(LdapResponse {
                        kind: ResponseKind::from_code(code),
                        data: Vec::new(),
                        ctrls: Vec::new(),
                    });
                }
                Some(Header::Control(text)) => {
                    let response = current.as_mut().ok_or_else(|| TraceError::Malformed {
                        line: lineno,
                        detail: "control before result header".into(),
                    })?;
                    response.ctrls.push(control_from_text(text)?);
                }
                // Bare `#` separator or free-form comment.
                None => {}
            }
        } else if line.is_empty() {
            flush_record(&mut current, &mut record)?;
        } else if let Some(continuation) = line.strip_prefix(' ') {
            let last = record
                .as_mut()
                .and_then(|r| r.lines.last_mut())
                .ok_or_else(|| TraceError::Malformed {
                    line: lineno,
                    detail: "continuation line outside a record".into(),
                })?;
            last.push_str(continuation);
        } else {
            record
                .get_or_insert_with(|| Record {
                    first_line: lineno,
                    lines: Vec::new(),
                })
                .lines
                .push(line.to_string());
        }
    }
    flush_record(&mut current, &mut record)?;
    responses.extend(current);
    trace!(count = responses.len(), "decoded trace");
    Ok(responses)
}

fn flush_record(
    current: &mut Option<LdapResponse>,
    record: &mut Option<Record>,
) -> Result<(), TraceError> {
    let Some(record) = record.take() else {
        return Ok(());
    };
    let malformed = |detail: String| TraceError::Malformed {
        line: record.first_line,
        detail,
    };
    let response = current
        .as_mut()
        .ok_or_else(|| malformed("record before result header".into()))?;

    let mut lines = record.lines.iter();
    let (name, dn) = ldif::parse_attr_line(lines.next().map_or("", String::as_str))
        .map_err(malformed)?;
    if name != "dn" {
        return Err(malformed(format!("record starts with '{name}', expected 'dn'")));
    }
    let dn = String::from_utf8(dn).map_err(|_| malformed("DN is not UTF-8".into()))?;

    let mut attrs = RawAttributes::new();
    let mut ctrls = Vec::new();
    for line in lines {
        let (name, value) = ldif::parse_attr_line(line).map_err(malformed)?;
        match name.as_str() {
            CONTROL_ATTR => {
                let text = String::from_utf8(value)
                    .map_err(|_| TraceError::InvalidControl(line.clone()))?;
                ctrls.push(control_from_text(&text)?);
            }
            NO_VALUE_ATTR => {
                let empty = String::from_utf8(value)
                    .map_err(|_| malformed("attribute name is not UTF-8".into()))?;
                let empty = empty.strip_prefix(ESCAPE).map(str::to_string).unwrap_or(empty);
                attrs.push((empty, Vec::new()));
            }
            _ => {
                let name = name.strip_prefix(ESCAPE).map(str::to_string).unwrap_or(name);
                match attrs.last_mut() {
                    Some((last, values)) if *last == name && !values.is_empty() => {
                        values.push(value)
                    }
                    _ => attrs.push((name, vec![value])),
                }
            }
        }
    }

    if response.kind == ResponseKind::Intermediate {
        if !dn.is_empty() || !attrs.is_empty() || ctrls.is_empty() {
            return Err(malformed("intermediate record must hold only controls".into()));
        }
        let message = ctrls.remove(0);
        response.data.push(ResponseData::Intermediate {
            name: message.oid,
            value: message.value,
            ctrls,
        });
    } else {
        response.data.push(ResponseData::Entry { dn, attrs, ctrls });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Recording source
// ---------------------------------------------------------------------------

/// A [`ResponseSource`] that records every response it hands on.
pub struct TracingSource<S, W> {
    inner: S,
    writer: W,
    recorded: usize,
}

impl<S, W> TracingSource<S, W> {
    pub fn new(inner: S, writer: W) -> Self {
        Self {
            inner,
            writer,
            recorded: 0,
        }
    }

    /// Number of responses written so far.
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    pub fn into_inner(self) -> (S, W) {
        (self.inner, self.writer)
    }
}

impl<S, W> ResponseSource for TracingSource<S, W>
where
    S: ResponseSource + Send,
    W: Write + Send,
{
    async fn next_response(&mut self) -> Result<Option<LdapResponse>, WatchError> {
        let response = self.inner.next_response().await?;
        if let Some(ref response) = response {
            write_response(&mut self.writer, response)?;
            self.recorded += 1;
        }
        Ok(response)
    }
}
