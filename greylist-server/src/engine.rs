//! The greylisting state machine.
//!
//! A recipient request walks the following checks in order and stops at the
//! first one that decides:
//!
//! 1. pre-approved sessions (local, authenticated or already promoted) pass;
//! 2. a fresh `ip=<address>` whitelist entry passes and is refreshed;
//! 3. a statically whitelisted sender domain passes, as does a fresh
//!    `domain=<domain>` entry when SPF passes;
//! 4. otherwise the sender/recipient triple is greylisted, keyed by domain
//!    when SPF passes and by address when it doesn't. A retry between
//!    `passtime` and `greyexp` promotes the origin to the whitelist.
//!
//! Checks 1 to 3 without DNS are done by [`GreylistEngine::check_whitelists`],
//! which never waits on anything but a list lock. Everything needing SPF is
//! done by [`GreylistEngine::resolve`] with a single lookup.

use filter::FilterResponse;
use mail_auth::SpfResult;
use std::{collections::HashSet, net::IpAddr, sync::Arc};
use tracing::{debug, info};

use crate::config::Timing;
use crate::lists::{is_expired, keys, Lists};
use crate::session::Session;
use crate::spf::SpfResolver;

pub const REJECT_REPLY: &str = "451 greylisted, try again later";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    RejectTemporary,
}

impl From<Verdict> for FilterResponse {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Proceed => FilterResponse::Proceed,
            Verdict::RejectTemporary => FilterResponse::Reject(REJECT_REPLY.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    /// The origin left the greylist during this decision.
    pub promoted: bool,
}

impl Decision {
    fn proceed() -> Self {
        Decision {
            verdict: Verdict::Proceed,
            promoted: false,
        }
    }

    fn reject() -> Self {
        Decision {
            verdict: Verdict::RejectTemporary,
            promoted: false,
        }
    }

    fn promoted() -> Self {
        Decision {
            verdict: Verdict::Proceed,
            promoted: true,
        }
    }
}

/// Everything a decision needs, copied out of the session so it stays valid
/// after the connection closes.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRequest {
    pub session: String,
    pub source: Option<IpAddr>,
    pub helo: String,
    pub sender: String,
    pub sender_domain: String,
    pub recipient: String,
    pub pre_approved: bool,
    pub now: i64,
}

impl DecisionRequest {
    pub fn from_session(session: &Session, now: i64) -> Self {
        DecisionRequest {
            session: session.id.clone(),
            source: session.source,
            helo: session.helo.clone(),
            sender: session.sender.clone(),
            sender_domain: session.sender_domain.to_lowercase(),
            recipient: session.recipient.clone(),
            pre_approved: session.pre_approved,
            now,
        }
    }
}

pub struct GreylistEngine {
    lists: Lists,
    static_domains: HashSet<String>,
    spf: Arc<dyn SpfResolver>,
    timing: Timing,
}

impl GreylistEngine {
    pub fn new(
        lists: Lists,
        static_domains: HashSet<String>,
        spf: Arc<dyn SpfResolver>,
        timing: Timing,
    ) -> Self {
        GreylistEngine {
            lists,
            static_domains,
            spf,
            timing,
        }
    }

    #[cfg(test)]
    pub fn lists(&self) -> &Lists {
        &self.lists
    }

    /// Runs every check that doesn't need SPF. `None` means the request has
    /// to go through [`Self::resolve`].
    pub async fn check_whitelists(&self, req: &DecisionRequest) -> Option<Decision> {
        let Some(ip) = req.source else {
            debug!(session = %req.session, "local session, skipping greylist");
            return Some(Decision::proceed());
        };
        if req.pre_approved {
            debug!(session = %req.session, "pre-approved session, skipping greylist");
            return Some(Decision::proceed());
        }

        let key = keys::ip(ip);
        if let Some(seen_at) = self.lists.whitelist_ip.get(&key).await {
            if !is_expired(seen_at, req.now, self.timing.whiteexp) {
                self.lists.whitelist_ip.set(&key, req.now).await;
                debug!(session = %req.session, %ip, "address whitelisted");
                return Some(Decision::proceed());
            }
        }

        if self.static_domains.contains(&req.sender_domain) {
            debug!(
                session = %req.session,
                domain = %req.sender_domain,
                "sender domain statically whitelisted"
            );
            return Some(Decision::proceed());
        }

        None
    }

    /// Finishes a decision with one SPF lookup: the dynamic domain whitelist,
    /// then the greylist.
    pub async fn resolve(&self, req: &DecisionRequest) -> Decision {
        let Some(ip) = req.source else {
            return Decision::proceed();
        };

        let spf = self.spf.check_host(ip, &req.helo, &req.sender).await;
        let spf_pass = spf == SpfResult::Pass;
        debug!(session = %req.session, %ip, sender = %req.sender, ?spf, "SPF evaluated");

        if spf_pass {
            let key = keys::domain(&req.sender_domain);
            if let Some(seen_at) = self.lists.whitelist_domain.get(&key).await {
                if !is_expired(seen_at, req.now, self.timing.whiteexp) {
                    self.lists.whitelist_domain.set(&key, req.now).await;
                    debug!(
                        session = %req.session,
                        domain = %req.sender_domain,
                        "sender domain whitelisted"
                    );
                    return Decision::proceed();
                }
            }
        }

        let (greylist, key, whitelist, whitelist_key) = if spf_pass {
            (
                &self.lists.greylist_domain,
                keys::domain_triple(&req.sender_domain, &req.sender, &req.recipient),
                &self.lists.whitelist_domain,
                keys::domain(&req.sender_domain),
            )
        } else {
            (
                &self.lists.greylist_ip,
                keys::ip_triple(ip, &req.sender, &req.recipient),
                &self.lists.whitelist_ip,
                keys::ip(ip),
            )
        };

        let Some(seen_at) = greylist.get(&key).await else {
            greylist.set(&key, req.now).await;
            info!(session = %req.session, %key, verdict = "reject", "first attempt greylisted");
            return Decision::reject();
        };

        let delta = req.now - seen_at;
        if delta == 0 {
            debug!(session = %req.session, %key, verdict = "reject", "retry within the same second");
            return Decision::reject();
        }

        if delta > self.timing.passtime && delta < self.timing.greyexp {
            whitelist.set(&whitelist_key, req.now).await;
            info!(
                session = %req.session,
                %key,
                whitelisted = %whitelist_key,
                verdict = "proceed",
                "retry accepted, origin whitelisted"
            );
            return Decision::promoted();
        }

        greylist.set(&key, req.now).await;
        info!(session = %req.session, %key, delta, verdict = "reject", "retry outside the window");
        Decision::reject()
    }

    #[cfg(test)]
    pub async fn decide(&self, req: &DecisionRequest) -> Decision {
        match self.check_whitelists(req).await {
            Some(decision) => decision,
            None => self.resolve(req).await,
        }
    }

    /// Whitelists a recipient domain a trusted user just sent mail to.
    pub async fn whitelist_domain(&self, domain: &str, now: i64) {
        let key = keys::domain(&domain.to_lowercase());
        self.lists.whitelist_domain.set(&key, now).await;
        info!(%key, "recipient domain whitelisted");
    }
}
