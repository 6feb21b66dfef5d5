use std::fmt::Display;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tracing::{debug, info, trace};

use super::SessionError;
use crate::broker::BrokerSession;

/// Logs the events of one session under a session id.
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    session_id: String,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session got started; assigns the session id.
    pub fn start(&mut self, peer: impl Display) {
        let epoch = Utc.with_ymd_and_hms(2013, 1, 1, 0, 0, 0).single();
        let nanos = epoch
            .and_then(|epoch| (Utc::now() - epoch).num_nanoseconds())
            .unwrap_or_default();
        self.session_id = format!("{nanos:x}");
        debug!("session({}) connected {peer}", self.session_id);
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Session got registered with the broker.
    pub fn registered(&self, sess: &BrokerSession) {
        info!(
            "session({}) registered {} ({} {})",
            self.session_id,
            sess.device_id(),
            sess.device_image_model(),
            sess.device_image_channel()
        );
    }

    pub fn effective_ping_interval(&self, elapsed: Duration) {
        trace!("session({}) ping after {elapsed:?}", self.session_id);
    }

    /// Session ended; passes `result` through.
    pub fn end(&self, result: Result<(), SessionError>) -> Result<(), SessionError> {
        match &result {
            Ok(()) => debug!("session({}) ended", self.session_id),
            Err(e) => debug!("session({}) ended with: {e}", self.session_id),
        }
        result
    }
}
