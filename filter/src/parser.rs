use super::*;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_till1},
    character::complete::{char, digit1},
    combinator::{map, map_opt, opt, rest},
    sequence::preceded,
    IResult, Parser,
};
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The two event streams the MTA sends once the handshake is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Report,
    Filter,
}

/// Line received before `config|ready`.
#[derive(Debug, PartialEq)]
pub enum ConfigLine {
    Ready,
    Option { key: String, value: String },
}

/// Fields shared by every report and filter line.
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext {
    pub version: String,
    pub timestamp: SystemTime,
    pub subsystem: String,
    pub session: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkConnect {
    pub rdns: String,
    pub fcrdns: String,
    pub src: String,
    pub dest: String,
}

/// Parameters of `tx-mail` and `tx-rcpt` reports.
#[derive(Debug, Clone, PartialEq)]
pub struct TxEnvelope {
    pub message_id: String,
    pub result: String,
    pub address: String,
}

impl TxEnvelope {
    pub fn is_ok(&self) -> bool {
        self.result == RESULT_OK
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    LinkConnect(LinkConnect),
    LinkDisconnect,
    LinkIdentify { method: String, identity: String },
    LinkAuth { username: String, result: String },
    TxMail(TxEnvelope),
    TxRcpt(TxEnvelope),
    RcptTo { token: String, recipient: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub context: EventContext,
    pub kind: EventKind,
}

struct Header<'a> {
    stream: Stream,
    version: &'a str,
    timestamp: SystemTime,
    subsystem: &'a str,
    event: &'a str,
    session: &'a str,
    params: Vec<&'a str>,
}

/// Parses one handshake line (`config|...`).
pub fn parse_config_line(input: &str) -> Result<ConfigLine, FilterError> {
    let parse_result: IResult<&str, ConfigLine> = preceded(
        tag("config|"),
        alt((
            map((tag("ready"), nom::combinator::eof), |_| ConfigLine::Ready),
            map(
                (take_till1(|c: char| c == '|'), opt(preceded(char('|'), rest))),
                |(key, value): (&str, Option<&str>)| ConfigLine::Option {
                    key: key.to_string(),
                    value: value.unwrap_or_default().to_string(),
                },
            ),
        )),
    )
    .parse(input);

    parse_result
        .map(|(_, line)| line)
        .map_err(|e| parse_error(input, e))
}

/// Parses a `report|...` or `filter|...` line into an [`Event`], checking the
/// parameter count of the event it names.
pub fn parse_event(input: &str) -> Result<Event, FilterError> {
    let (_, header) = parse_header(input).map_err(|e| parse_error(input, e))?;

    if header.subsystem != SUBSYSTEM {
        return Err(FilterError::UnexpectedSubsystem(header.subsystem.to_string()));
    }

    let kind = build_kind(header.stream, header.event, &header.params)?;

    Ok(Event {
        context: EventContext {
            version: header.version.to_string(),
            timestamp: header.timestamp,
            subsystem: header.subsystem.to_string(),
            session: header.session.to_string(),
        },
        kind,
    })
}

/// Extracts the IP address from a `link-connect` source such as
/// `192.0.2.1:25` or `[2001:db8::1]:25`. Anything else (a unix socket, for
/// instance) yields `None`.
pub fn parse_peer_address(src: &str) -> Option<IpAddr> {
    let (host, _port) = src.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.parse().ok()
}

fn parse_error(input: &str, e: nom::Err<nom::error::Error<&str>>) -> FilterError {
    let offset = match &e {
        nom::Err::Error(err) | nom::Err::Failure(err) => input.len() - err.input.len(),
        nom::Err::Incomplete(_) => input.len(),
    };
    FilterError::ParseError {
        message: e.to_string(),
        line: input.to_string(),
        span: (offset, input.len() - offset).into(),
    }
}

fn field(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c == '|').parse(input)
}

fn parse_stream(input: &str) -> IResult<&str, Stream> {
    alt((
        map(tag("report"), |_| Stream::Report),
        map(tag("filter"), |_| Stream::Filter),
    ))
    .parse(input)
}

/// `<seconds>.<fraction>` as sent by the MTA. Values past what `SystemTime`
/// can hold are rejected.
fn parse_timestamp(input: &str) -> IResult<&str, SystemTime> {
    map_opt(
        (digit1, opt(preceded(char('.'), digit1))),
        |(secs, frac): (&str, Option<&str>)| {
            let secs: u64 = secs.parse().ok()?;
            let nanos = match frac {
                Some(frac) => {
                    let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
                    digits.parse::<u32>().ok()?
                }
                None => 0,
            };
            UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
        },
    )
    .parse(input)
}

fn parse_header(input: &str) -> IResult<&str, Header<'_>> {
    let (input, stream) = parse_stream(input)?;
    let (input, version) = preceded(char('|'), field).parse(input)?;
    let (input, timestamp) = preceded(char('|'), parse_timestamp).parse(input)?;
    let (input, subsystem) = preceded(char('|'), field).parse(input)?;
    let (input, event) = preceded(char('|'), field).parse(input)?;
    let (input, session) = preceded(char('|'), field).parse(input)?;
    let (input, params) = opt(preceded(char('|'), rest)).parse(input)?;

    let params = match params {
        Some(params) => params.split('|').collect(),
        None => Vec::new(),
    };

    Ok((
        input,
        Header {
            stream,
            version,
            timestamp,
            subsystem,
            event,
            session,
            params,
        },
    ))
}

fn expect_exactly(event: &str, params: &[&str], n: usize) -> Result<(), FilterError> {
    if params.len() != n {
        return Err(FilterError::UnexpectedParams {
            event: event.to_string(),
            expected: format!("exactly {n}"),
            got: params.len(),
        });
    }
    Ok(())
}

fn expect_at_least(event: &str, params: &[&str], n: usize) -> Result<(), FilterError> {
    if params.len() < n {
        return Err(FilterError::UnexpectedParams {
            event: event.to_string(),
            expected: format!("at least {n}"),
            got: params.len(),
        });
    }
    Ok(())
}

fn tx_envelope(event: &str, params: &[&str]) -> Result<TxEnvelope, FilterError> {
    expect_at_least(event, params, 3)?;
    Ok(TxEnvelope {
        message_id: params[0].to_string(),
        result: params[1].to_string(),
        // Addresses may legitimately contain the separator.
        address: params[2..].join("|"),
    })
}

fn build_kind(stream: Stream, event: &str, params: &[&str]) -> Result<EventKind, FilterError> {
    match (stream, event) {
        (Stream::Report, "link-connect") => {
            expect_exactly(event, params, 4)?;
            Ok(EventKind::LinkConnect(LinkConnect {
                rdns: params[0].to_string(),
                fcrdns: params[1].to_string(),
                src: params[2].to_string(),
                dest: params[3].to_string(),
            }))
        }
        (Stream::Report, "link-disconnect") => {
            expect_exactly(event, params, 0)?;
            Ok(EventKind::LinkDisconnect)
        }
        (Stream::Report, "link-identify") => {
            expect_exactly(event, params, 2)?;
            Ok(EventKind::LinkIdentify {
                method: params[0].to_string(),
                identity: params[1].to_string(),
            })
        }
        (Stream::Report, "link-auth") => {
            expect_exactly(event, params, 2)?;
            Ok(EventKind::LinkAuth {
                username: params[0].to_string(),
                result: params[1].to_string(),
            })
        }
        (Stream::Report, "tx-mail") => Ok(EventKind::TxMail(tx_envelope(event, params)?)),
        (Stream::Report, "tx-rcpt") => Ok(EventKind::TxRcpt(tx_envelope(event, params)?)),
        (Stream::Filter, "rcpt-to") => {
            expect_at_least(event, params, 2)?;
            Ok(EventKind::RcptTo {
                token: params[0].to_string(),
                recipient: params[1..].join("|"),
            })
        }
        (stream, event) => Err(FilterError::UnknownEvent {
            stream: match stream {
                Stream::Report => "report",
                Stream::Filter => "filter",
            }
            .to_string(),
            event: event.to_string(),
        }),
    }
}
