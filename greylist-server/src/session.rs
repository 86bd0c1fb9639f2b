use std::{collections::HashMap, net::IpAddr, sync::Arc};
use tokio::sync::Mutex;

/// State of one SMTP connection, as reported by the MTA.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub created_at: i64,
    /// `None` for a local socket.
    pub source: Option<IpAddr>,
    pub helo: String,
    pub user: Option<String>,
    pub sender: String,
    pub sender_domain: String,
    pub recipient: String,
    /// Skips greylisting for the rest of the connection.
    pub pre_approved: bool,
    /// Local or authenticated, never set by a promotion.
    pub trusted: bool,
}

impl Session {
    pub fn new(id: &str, created_at: i64, source: Option<IpAddr>) -> Self {
        let local = source.is_none();
        Session {
            id: id.to_string(),
            created_at,
            source,
            helo: String::new(),
            user: None,
            sender: String::new(),
            sender_domain: String::new(),
            recipient: String::new(),
            pre_approved: local,
            trusted: local,
        }
    }

    pub fn authenticate(&mut self, user: &str) {
        self.user = Some(user.to_string());
        self.pre_approved = true;
        self.trusted = true;
    }

    /// Records the envelope sender. The sender domain falls back to the HELO
    /// identity for addresses without a domain part, such as the null sender.
    pub fn set_sender(&mut self, address: &str) {
        self.sender = address.to_string();
        self.sender_domain = address_domain(address)
            .unwrap_or(&self.helo)
            .to_string();
    }
}

/// The part of `address` after the first `@`, if any.
pub fn address_domain(address: &str) -> Option<&str> {
    address.split('@').nth(1)
}

/// Live sessions keyed by the MTA's session identifier.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self, session: Session) {
        self.sessions
            .lock()
            .await
            .insert(session.id.clone(), session);
    }

    pub async fn close(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.remove(id)
    }

    /// Applies `f` to the session and returns its result, or `None` if the
    /// session doesn't exist.
    pub async fn update<F, T>(&self, id: &str, f: F) -> Option<T>
    where
        F: FnOnce(&mut Session) -> T,
    {
        self.sessions.lock().await.get_mut(id).map(f)
    }

    #[cfg(test)]
    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Marks a session pre-approved after a promotion. Does nothing if the
    /// connection closed while the decision was pending.
    pub async fn mark_pre_approved(&self, id: &str) -> bool {
        self.update(id, |session| session.pre_approved = true)
            .await
            .is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
