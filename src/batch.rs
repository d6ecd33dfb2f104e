//! A named collection of sessions with a step-style API.
//!
//! The batch itself never fails as a whole: per-session failures come back
//! through the per-name error map, and a name without a session is skipped
//! silently.

use crate::config::{Region, SessionConfig};
use crate::error::{Error, Result};
use crate::event::VncEvent;
use crate::jpeg::JpegDecoder;
use crate::protocol::messages::FramebufferUpdate;
use crate::screen::Screen;
use crate::session::{Session, StepOutcome};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-name results of one batch step. A session that has failed
/// contributes `None` for its screen and its sticky error.
#[derive(Debug, Default)]
pub struct BatchStep {
    pub screens: HashMap<String, Option<Arc<Screen>>>,
    pub updates: HashMap<String, Vec<Arc<FramebufferUpdate>>>,
    pub errors: HashMap<String, Option<Error>>,
}

/// A named map of sessions.
#[derive(Default)]
pub struct Batch {
    sessions: HashMap<String, Session>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session under `name`, closing and replacing any session that
    /// already holds the name.
    pub fn open(&mut self, name: &str, config: SessionConfig) -> Result<()> {
        let session = Session::open(name, config)?;
        if let Some(evicted) = self.sessions.insert(name.to_string(), session) {
            evicted.close();
        }
        Ok(())
    }

    /// Like [`Batch::open`] with a JPEG decoder for Tight sessions.
    pub fn open_with_jpeg(
        &mut self,
        name: &str,
        config: SessionConfig,
        jpeg: Arc<dyn JpegDecoder>,
    ) -> Result<()> {
        let session = Session::open_with_jpeg(name, config, jpeg)?;
        if let Some(evicted) = self.sessions.insert(name.to_string(), session) {
            evicted.close();
        }
        Ok(())
    }

    /// Close one session, or every session when `name` is `None`.
    pub fn close(&mut self, name: Option<&str>) {
        match name {
            Some(name) => {
                if let Some(session) = self.sessions.remove(name) {
                    session.close();
                }
            }
            None => {
                for (_, session) in self.sessions.drain() {
                    session.close();
                }
            }
        }
    }

    /// Step every named session once with its events. Names without a
    /// session are skipped.
    pub async fn step(&self, actions: &HashMap<String, Vec<VncEvent>>) -> BatchStep {
        let mut result = BatchStep::default();
        for (name, events) in actions {
            let Some(session) = self.sessions.get(name) else {
                continue;
            };
            match session.step(events).await {
                Ok(StepOutcome { screen, updates }) => {
                    result.screens.insert(name.clone(), screen);
                    result.updates.insert(name.clone(), updates);
                    result.errors.insert(name.clone(), None);
                }
                Err(err) => {
                    result.screens.insert(name.clone(), None);
                    result.updates.insert(name.clone(), Vec::new());
                    result.errors.insert(name.clone(), Some(err));
                }
            }
        }
        result
    }

    pub fn set_subscription(&self, name: &str, regions: Vec<Region>) -> Result<()> {
        match self.sessions.get(name) {
            Some(session) => {
                session.set_subscription(regions);
                Ok(())
            }
            None => Err(Error::Config(format!("no such session: {name}"))),
        }
    }

    /// Current front buffers without flipping.
    pub fn peek(&self) -> HashMap<String, Option<Arc<Screen>>> {
        self.sessions
            .iter()
            .map(|(name, session)| (name.clone(), session.peek()))
            .collect()
    }

    /// Snapshots of the back buffers without flipping.
    pub fn peek_back(&self) -> HashMap<String, Option<Screen>> {
        self.sessions
            .iter()
            .map(|(name, session)| (name.clone(), session.peek_back()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&Session> {
        self.sessions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stepping_unknown_names_is_a_silent_skip() {
        let batch = Batch::new();
        let mut actions = HashMap::new();
        actions.insert("ghost".to_string(), Vec::new());
        let result = batch.step(&actions).await;
        assert!(result.screens.is_empty());
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn subscription_on_unknown_name_errors() {
        let batch = Batch::new();
        assert!(matches!(
            batch.set_subscription("ghost", Vec::new()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn open_rejects_invalid_configs() {
        let mut batch = Batch::new();
        let err = batch.open("a", SessionConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(batch.is_empty());
    }
}
