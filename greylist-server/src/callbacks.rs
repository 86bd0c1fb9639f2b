//! Filter callbacks tying the protocol events to the session registry and the
//! greylisting engine.
use async_trait::async_trait;
use filter::{
    parse_peer_address, EventContext, FilterCallbacks, FilterError, LinkConnect, Responder,
    TxEnvelope, AUTH_PASS,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    clock::Clock,
    engine::{DecisionRequest, GreylistEngine},
    session::{address_domain, Session, SessionRegistry},
};

pub struct Callbacks {
    engine: Arc<GreylistEngine>,
    sessions: SessionRegistry,
    clock: Arc<dyn Clock>,
}

fn unknown_session(event: &'static str, ctx: &EventContext) -> FilterError {
    FilterError::UnknownSession {
        event,
        session: ctx.session.clone(),
    }
}

impl Callbacks {
    pub fn new(engine: Arc<GreylistEngine>, sessions: SessionRegistry, clock: Arc<dyn Clock>) -> Self {
        Callbacks {
            engine,
            sessions,
            clock,
        }
    }

    /// Applies `f` to the event's session, failing if the MTA refers to a
    /// session it never opened.
    async fn with_session<F, T>(
        &self,
        event: &'static str,
        ctx: &EventContext,
        f: F,
    ) -> Result<T, FilterError>
    where
        F: FnOnce(&mut Session) -> T,
    {
        self.sessions
            .update(&ctx.session, f)
            .await
            .ok_or_else(|| unknown_session(event, ctx))
    }
}

#[async_trait]
impl FilterCallbacks for Callbacks {
    async fn on_link_connect(
        &self,
        ctx: &EventContext,
        link: &LinkConnect,
    ) -> Result<(), FilterError> {
        let source = parse_peer_address(&link.src);
        if source.is_none() {
            debug!(session = %ctx.session, src = %link.src, "local connection");
        }
        self.sessions
            .open(Session::new(&ctx.session, self.clock.now(), source))
            .await;
        Ok(())
    }

    async fn on_link_disconnect(&self, ctx: &EventContext) -> Result<(), FilterError> {
        let session = self
            .sessions
            .close(&ctx.session)
            .await
            .ok_or_else(|| unknown_session("link-disconnect", ctx))?;
        let open_sessions = self.sessions.len().await;
        debug!(
            session = %session.id,
            duration = self.clock.now() - session.created_at,
            open_sessions,
            "session closed"
        );
        Ok(())
    }

    async fn on_link_identify(
        &self,
        ctx: &EventContext,
        _method: &str,
        identity: &str,
    ) -> Result<(), FilterError> {
        self.with_session("link-identify", ctx, |session| {
            session.helo = identity.to_string();
        })
        .await
    }

    async fn on_link_auth(
        &self,
        ctx: &EventContext,
        username: &str,
        result: &str,
    ) -> Result<(), FilterError> {
        let authenticated = result == AUTH_PASS;
        self.with_session("link-auth", ctx, |session| {
            if authenticated {
                session.authenticate(username);
            }
        })
        .await?;
        if !authenticated {
            debug!(session = %ctx.session, username, result, "authentication failed");
        }
        Ok(())
    }

    async fn on_tx_mail(&self, ctx: &EventContext, tx: &TxEnvelope) -> Result<(), FilterError> {
        self.with_session("tx-mail", ctx, |session| {
            if tx.is_ok() {
                session.set_sender(&tx.address);
            }
        })
        .await
    }

    async fn on_tx_rcpt(&self, ctx: &EventContext, tx: &TxEnvelope) -> Result<(), FilterError> {
        let (trusted, user) = self
            .with_session("tx-rcpt", ctx, |session| (session.trusted, session.user.clone()))
            .await?;
        if !trusted || !tx.is_ok() {
            return Ok(());
        }

        match address_domain(&tx.address) {
            Some(domain) if !domain.is_empty() => {
                debug!(session = %ctx.session, user = ?user, domain, "trusted sender recipient");
                self.engine.whitelist_domain(domain, self.clock.now()).await;
            }
            _ => debug!(session = %ctx.session, address = %tx.address, "recipient without domain"),
        }
        Ok(())
    }

    async fn on_rcpt_to(
        &self,
        ctx: &EventContext,
        recipient: &str,
        responder: Responder,
    ) -> Result<(), FilterError> {
        let now = self.clock.now();
        let request = self
            .with_session("rcpt-to", ctx, |session| {
                session.recipient = recipient.to_string();
                DecisionRequest::from_session(session, now)
            })
            .await?;

        if let Some(decision) = self.engine.check_whitelists(&request).await {
            responder.respond(decision.verdict.into());
            return Ok(());
        }

        // SPF may take a while; answer from a task so the stream keeps flowing.
        let engine = self.engine.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let decision = engine.resolve(&request).await;
            if decision.promoted && !sessions.mark_pre_approved(&request.session).await {
                warn!(session = %request.session, "session closed before promotion");
            }
            responder.respond(decision.verdict.into());
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Timing;
    use crate::lists::{keys, Lists};
    use crate::spf::stub::StubResolver;
    use filter::FilterServer;
    use mail_auth::SpfResult;
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, BufReader};
    use tokio::sync::Notify;

    const NOW: i64 = 1_700_000_000;
    const REJECT: &str = "reject|451 greylisted, try again later";

    struct Harness {
        callbacks: Arc<Callbacks>,
        sessions: SessionRegistry,
        engine: Arc<GreylistEngine>,
        clock: Arc<ManualClock>,
        spf: Arc<StubResolver>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_resolver(StubResolver::new())
        }

        fn with_resolver(resolver: StubResolver) -> Self {
            let spf = Arc::new(resolver);
            let engine = Arc::new(GreylistEngine::new(
                Lists::in_memory(),
                HashSet::new(),
                spf.clone(),
                Timing::default(),
            ));
            let clock = Arc::new(ManualClock::new(NOW));
            let sessions = SessionRegistry::new();
            let callbacks = Arc::new(Callbacks::new(
                engine.clone(),
                sessions.clone(),
                clock.clone(),
            ));
            Harness {
                callbacks,
                sessions,
                engine,
                clock,
                spf,
            }
        }

        /// Runs the filter over `events` and returns the non-registration
        /// output lines.
        async fn run(&self, events: &str) -> (Result<(), FilterError>, Vec<String>) {
            let input = format!("config|ready\n{events}");
            let (writer, mut reader) = tokio::io::duplex(64 * 1024);
            let server = FilterServer::new(self.callbacks.clone());
            let result = server
                .run(BufReader::new(Cursor::new(input.into_bytes())), writer)
                .await;

            let mut output = String::new();
            if result.is_ok() {
                reader.read_to_string(&mut output).await.unwrap();
            }
            let lines = output
                .lines()
                .filter(|line| !line.starts_with("register|"))
                .map(str::to_string)
                .collect();
            (result, lines)
        }
    }

    fn connect(session: &str, src: &str) -> String {
        format!("report|0.6|1.0|smtp-in|link-connect|{session}|mx.example.com|pass|{src}|192.0.2.254:25\n")
    }

    fn report(session: &str, event: &str, params: &str) -> String {
        format!("report|0.6|1.0|smtp-in|{event}|{session}|{params}\n")
    }

    fn rcpt_to(session: &str, token: &str, recipient: &str) -> String {
        format!("filter|0.6|1.0|smtp-in|rcpt-to|{session}|{token}|{recipient}\n")
    }

    fn disconnect(session: &str) -> String {
        format!("report|0.6|1.0|smtp-in|link-disconnect|{session}\n")
    }

    fn remote_transaction(session: &str, sender: &str, recipient: &str, token: &str) -> String {
        connect(session, "192.0.2.1:41000")
            + &report(session, "link-identify", "EHLO|mx.example.com")
            + &report(session, "tx-mail", &format!("m1|ok|{sender}"))
            + &rcpt_to(session, token, recipient)
            + &disconnect(session)
    }

    #[tokio::test]
    async fn test_greylist_then_promote() {
        let harness = Harness::new();

        let (result, lines) = harness
            .run(&remote_transaction("s1", "alice@example.com", "bob@example.org", "t1"))
            .await;
        assert!(result.is_ok());
        assert_eq!(lines, vec![format!("filter-result|s1|t1|{REJECT}")]);
        assert_eq!(harness.sessions.len().await, 0);

        // Too early.
        harness.clock.advance(60);
        let (_, lines) = harness
            .run(&remote_transaction("s2", "alice@example.com", "bob@example.org", "t2"))
            .await;
        assert_eq!(lines, vec![format!("filter-result|s2|t2|{REJECT}")]);

        harness.clock.advance(Timing::default().passtime + 1);
        let (_, lines) = harness
            .run(&remote_transaction("s3", "alice@example.com", "bob@example.org", "t3"))
            .await;
        assert_eq!(lines, vec!["filter-result|s3|t3|proceed"]);

        // The address is whitelisted for other recipients too.
        let (_, lines) = harness
            .run(&remote_transaction("s4", "carol@example.net", "dave@example.org", "t4"))
            .await;
        assert_eq!(lines, vec!["filter-result|s4|t4|proceed"]);
        assert_eq!(harness.spf.calls(), 3);
    }

    #[tokio::test]
    async fn test_local_connection_proceeds() {
        let harness = Harness::new();
        let events = connect("s1", "unix:/var/run/smtpd.sock")
            + &report("s1", "tx-mail", "m1|ok|alice@example.com")
            + &rcpt_to("s1", "t1", "bob@example.org")
            + &disconnect("s1");

        let (result, lines) = harness.run(&events).await;
        assert!(result.is_ok());
        assert_eq!(lines, vec!["filter-result|s1|t1|proceed"]);
        assert_eq!(harness.spf.calls(), 0);
        assert_eq!(harness.engine.lists().greylist_ip.len().await, 0);
    }

    #[tokio::test]
    async fn test_authenticated_session_proceeds() {
        let harness = Harness::new();
        let events = connect("s1", "192.0.2.1:41000")
            + &report("s1", "link-auth", "alice|fail")
            + &report("s1", "tx-mail", "m1|ok|alice@example.com")
            + &rcpt_to("s1", "t1", "bob@example.org")
            + &report("s1", "link-auth", "alice|pass")
            + &rcpt_to("s1", "t2", "bob@example.org")
            + &disconnect("s1");

        let (result, mut lines) = harness.run(&events).await;
        assert!(result.is_ok());
        lines.sort();
        assert_eq!(
            lines,
            vec![
                format!("filter-result|s1|t1|{REJECT}"),
                "filter-result|s1|t2|proceed".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_trusted_sender_whitelists_recipient_domain() {
        let harness = Harness::new();
        let events = connect("s1", "192.0.2.50:41000")
            + &report("s1", "link-auth", "alice|pass")
            + &report("s1", "tx-mail", "m1|ok|alice@example.org")
            + &rcpt_to("s1", "t1", "bob@Partner.example")
            + &report("s1", "tx-rcpt", "m1|ok|bob@Partner.example")
            + &disconnect("s1");
        let (result, _) = harness.run(&events).await;
        assert!(result.is_ok());
        assert_eq!(
            harness
                .engine
                .lists()
                .whitelist_domain
                .get("domain=partner.example")
                .await,
            Some(NOW)
        );

        // Replies from the partner with a passing SPF record skip greylisting.
        harness.spf.set("198.51.100.7", "bob@partner.example", SpfResult::Pass).await;
        harness.clock.advance(3600);
        let events = connect("s2", "198.51.100.7:5000")
            + &report("s2", "link-identify", "EHLO|mail.partner.example")
            + &report("s2", "tx-mail", "m2|ok|bob@partner.example")
            + &rcpt_to("s2", "t1", "alice@example.org")
            + &disconnect("s2");
        let (_, lines) = harness.run(&events).await;
        assert_eq!(lines, vec!["filter-result|s2|t1|proceed"]);
        assert_eq!(harness.engine.lists().greylist_domain.len().await, 0);
    }

    #[tokio::test]
    async fn test_untrusted_sender_does_not_whitelist() {
        let harness = Harness::new();
        let events = connect("s1", "192.0.2.50:41000")
            + &report("s1", "tx-mail", "m1|ok|alice@example.org")
            + &report("s1", "tx-rcpt", "m1|ok|bob@partner.example")
            + &disconnect("s1");
        let (result, _) = harness.run(&events).await;
        assert!(result.is_ok());
        assert_eq!(harness.engine.lists().whitelist_domain.len().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_session_is_fatal() {
        let harness = Harness::new();
        let (result, _) = harness
            .run(&report("s9", "tx-mail", "m1|ok|alice@example.com"))
            .await;
        assert!(matches!(
            result,
            Err(FilterError::UnknownSession { event: "tx-mail", .. })
        ));

        let (result, _) = harness.run(&disconnect("s9")).await;
        assert!(matches!(
            result,
            Err(FilterError::UnknownSession { event: "link-disconnect", .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_during_spf_lookup() {
        let gate = Arc::new(Notify::new());
        let harness = Harness::with_resolver(StubResolver::gated(gate.clone()));

        // A retry inside the window: the pending decision will promote.
        let ip = "192.0.2.1".parse().unwrap();
        let key = keys::ip_triple(ip, "alice@example.com", "bob@example.org");
        harness.engine.lists().greylist_ip.set(&key, NOW - 600).await;

        let events = remote_transaction("s1", "alice@example.com", "bob@example.org", "t1");
        let sessions = harness.sessions.clone();
        let spf = harness.spf.clone();
        let run = tokio::spawn(async move { harness.run(&events).await });

        // Wait until the lookup is pending and the disconnect was processed.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if spf.calls() == 1 && sessions.len().await == 0 {
                    break;
                }
            }
        })
        .await
        .unwrap();
        gate.notify_one();

        let (result, lines) = run.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(lines, vec!["filter-result|s1|t1|proceed"]);
        assert!(sessions.get("s1").await.is_none());
    }
}
