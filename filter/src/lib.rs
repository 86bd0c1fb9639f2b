use async_trait::async_trait;
use miette::{Diagnostic, SourceSpan};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Split};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

mod parser;
pub use parser::*;

/// The only subsystem this filter registers for.
pub const SUBSYSTEM: &str = "smtp-in";

/// Result value the MTA reports for a successful transaction step.
pub const RESULT_OK: &str = "ok";

/// Result value the MTA reports for a successful authentication.
pub const AUTH_PASS: &str = "pass";

/// Report events consumed by the filter, registered during the handshake.
pub const REPORT_EVENTS: [&str; 6] = [
    "link-connect",
    "link-disconnect",
    "link-identify",
    "link-auth",
    "tx-mail",
    "tx-rcpt",
];

/// Filter phases answered by the filter, registered during the handshake.
pub const FILTER_PHASES: [&str; 1] = ["rcpt-to"];

/// Reply sent when a decision handle is dropped without an answer.
pub const UNANSWERED_REPLY: &str = "451 4.3.0 temporary filter failure";

#[derive(Debug, Error, Diagnostic)]
pub enum FilterError {
    #[error("IO error")]
    #[diagnostic(code(filter::io_error))]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {message}")]
    #[diagnostic(code(filter::parse_error))]
    ParseError {
        message: String,
        #[source_code]
        line: String,
        #[label("This bit here")]
        span: SourceSpan,
    },

    #[error("Unknown {stream} event '{event}'")]
    #[diagnostic(code(filter::unknown_event))]
    UnknownEvent { stream: String, event: String },

    #[error("Event '{event}' expects {expected} parameters, got {got}")]
    #[diagnostic(code(filter::unexpected_params))]
    UnexpectedParams {
        event: String,
        expected: String,
        got: usize,
    },

    #[error("Unexpected subsystem '{0}'")]
    #[diagnostic(code(filter::unexpected_subsystem))]
    UnexpectedSubsystem(String),

    #[error("Event '{event}' references unknown session {session}")]
    #[diagnostic(
        code(filter::unknown_session),
        help("the filter and the MTA are out of sync, restart the MTA")
    )]
    UnknownSession { event: &'static str, session: String },
}

/// Answer to a filter request.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterResponse {
    Proceed,
    /// Reject with a reply such as `451 try again later`.
    Reject(String),
}

impl FilterResponse {
    fn to_line(&self, session: &str, token: &str) -> String {
        match self {
            FilterResponse::Proceed => format!("filter-result|{session}|{token}|proceed\n"),
            FilterResponse::Reject(reply) => {
                format!("filter-result|{session}|{token}|reject|{reply}\n")
            }
        }
    }
}

/// Callbacks invoked for every event, in arrival order.
///
/// Returning an error stops the filter: the MTA and the filter can't recover
/// from a desynchronized stream.
#[async_trait]
pub trait FilterCallbacks: Send + Sync {
    async fn on_link_connect(&self, ctx: &EventContext, link: &LinkConnect)
        -> Result<(), FilterError>;
    async fn on_link_disconnect(&self, ctx: &EventContext) -> Result<(), FilterError>;
    async fn on_link_identify(
        &self,
        ctx: &EventContext,
        method: &str,
        identity: &str,
    ) -> Result<(), FilterError>;
    async fn on_link_auth(
        &self,
        ctx: &EventContext,
        username: &str,
        result: &str,
    ) -> Result<(), FilterError>;
    async fn on_tx_mail(&self, ctx: &EventContext, tx: &TxEnvelope) -> Result<(), FilterError>;
    async fn on_tx_rcpt(&self, ctx: &EventContext, tx: &TxEnvelope) -> Result<(), FilterError>;
    /// The responder may be moved into a spawned task and answered later;
    /// the intake loop does not wait for it.
    async fn on_rcpt_to(
        &self,
        ctx: &EventContext,
        recipient: &str,
        responder: Responder,
    ) -> Result<(), FilterError>;
}

/// Single writer for the output stream. Lines are queued by any number of
/// responders and written one at a time.
#[derive(Clone)]
struct Emitter {
    tx: mpsc::UnboundedSender<String>,
}

impl Emitter {
    fn spawn<W>(mut writer: W) -> (Self, JoinHandle<std::io::Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let handle = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await?;
            }
            writer.shutdown().await
        });
        (Emitter { tx }, handle)
    }

    fn emit(&self, line: String) {
        if self.tx.send(line).is_err() {
            warn!("output stream closed, dropping filter result");
        }
    }
}

/// One-shot handle answering a single filter request.
///
/// If it is dropped unanswered, a temporary failure is sent so the MTA never
/// waits forever on a token.
pub struct Responder {
    session: String,
    token: String,
    emitter: Option<Emitter>,
}

impl Responder {
    fn new(session: String, token: String, emitter: Emitter) -> Self {
        Responder {
            session,
            token,
            emitter: Some(emitter),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn respond(mut self, response: FilterResponse) {
        if let Some(emitter) = self.emitter.take() {
            emitter.emit(response.to_line(&self.session, &self.token));
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(emitter) = self.emitter.take() {
            warn!(
                session = %self.session,
                token = %self.token,
                "filter request dropped without an answer"
            );
            let response = FilterResponse::Reject(UNANSWERED_REPLY.to_string());
            emitter.emit(response.to_line(&self.session, &self.token));
        }
    }
}

/// Reads the next line without its terminator. A line that isn't UTF-8 is a
/// parse error pointing at the first invalid byte.
async fn next_line<R>(lines: &mut Split<R>) -> Result<Option<String>, FilterError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(mut bytes) = lines.next_segment().await? else {
        return Ok(None);
    };
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }

    String::from_utf8(bytes).map(Some).map_err(|e| {
        let offset = e.utf8_error().valid_up_to();
        let line = String::from_utf8_lossy(e.as_bytes()).into_owned();
        // Lossy decoding keeps the valid prefix byte for byte.
        let len = line.len() - offset;
        FilterError::ParseError {
            message: "line is not valid UTF-8".to_string(),
            line,
            span: (offset, len).into(),
        }
    })
}

#[derive(Clone)]
pub struct FilterServer {
    callbacks: Arc<dyn FilterCallbacks>,
}

impl FilterServer {
    pub fn new<T: FilterCallbacks + 'static>(callbacks: Arc<T>) -> Self {
        FilterServer { callbacks }
    }

    /// Runs the filter until the input stream ends.
    ///
    /// Waits for every outstanding answer to be written before returning.
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<(), FilterError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut lines = reader.split(b'\n');

        if !self.handshake(&mut lines, &mut writer).await? {
            debug!("input closed during handshake");
            return Ok(());
        }

        let (emitter, writer_task) = Emitter::spawn(writer);

        while let Some(line) = next_line(&mut lines).await? {
            let event = parse_event(&line)?;
            self.dispatch(event, &emitter).await?;
        }

        drop(emitter);
        writer_task
            .await
            .map_err(|e| FilterError::IoError(std::io::Error::other(e)))??;
        Ok(())
    }

    /// Skips configuration lines up to `config|ready` and registers the
    /// events this filter consumes. Returns false if input ended first.
    async fn handshake<R, W>(&self, lines: &mut Split<R>, writer: &mut W) -> Result<bool, FilterError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let Some(line) = next_line(lines).await? else {
                return Ok(false);
            };
            match parse_config_line(&line)? {
                ConfigLine::Ready => break,
                ConfigLine::Option { key, value } => {
                    debug!(%key, %value, "filter configuration");
                }
            }
        }

        let mut registration = String::new();
        for event in REPORT_EVENTS {
            registration.push_str(&format!("register|report|{SUBSYSTEM}|{event}\n"));
        }
        for phase in FILTER_PHASES {
            registration.push_str(&format!("register|filter|{SUBSYSTEM}|{phase}\n"));
        }
        registration.push_str("register|ready\n");

        writer.write_all(registration.as_bytes()).await?;
        writer.flush().await?;
        Ok(true)
    }

    async fn dispatch(&self, event: Event, emitter: &Emitter) -> Result<(), FilterError> {
        let ctx = &event.context;
        match &event.kind {
            EventKind::LinkConnect(link) => self.callbacks.on_link_connect(ctx, link).await,
            EventKind::LinkDisconnect => self.callbacks.on_link_disconnect(ctx).await,
            EventKind::LinkIdentify { method, identity } => {
                self.callbacks.on_link_identify(ctx, method, identity).await
            }
            EventKind::LinkAuth { username, result } => {
                self.callbacks.on_link_auth(ctx, username, result).await
            }
            EventKind::TxMail(tx) => self.callbacks.on_tx_mail(ctx, tx).await,
            EventKind::TxRcpt(tx) => self.callbacks.on_tx_rcpt(ctx, tx).await,
            EventKind::RcptTo { token, recipient } => {
                let responder = Responder::new(ctx.session.clone(), token.clone(), emitter.clone());
                self.callbacks.on_rcpt_to(ctx, recipient, responder).await
            }
        }
    }
}
