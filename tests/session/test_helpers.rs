//! Shared fixtures for session BDD scenarios.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8PathBuf;
use chrono::Utc;
use rstest::fixture;
use tempfile::TempDir;
use tether::deadman::Enforcement;
use tether::session::{Instance, SessionStore};
use tether::test_support::RecordingTerminator;

/// Result of the last deadman enforcement, with errors rendered to text.
pub type EnforceOutcome = Result<Enforcement, String>;

/// State shared by the steps of one scenario. Clones share everything.
#[derive(Clone, Debug)]
pub struct SessionContext {
    _dir: Arc<TempDir>,
    pub store: SessionStore,
    pub terminator: RecordingTerminator,
    pub refusing_terminator: RecordingTerminator,
    refuse_termination: Arc<AtomicBool>,
    outcome: Arc<Mutex<Option<EnforceOutcome>>>,
}

impl SessionContext {
    pub fn refuse_termination(&self) {
        self.refuse_termination.store(true, Ordering::SeqCst);
    }

    pub fn active_terminator(&self) -> &RecordingTerminator {
        if self.refuse_termination.load(Ordering::SeqCst) {
            &self.refusing_terminator
        } else {
            &self.terminator
        }
    }

    pub fn record_outcome(&self, outcome: EnforceOutcome) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
    }

    pub fn outcome(&self) -> Option<EnforceOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[fixture]
pub fn session_context() -> SessionContext {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let state_dir = Utf8PathBuf::from_path_buf(dir.path().join("state"))
        .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
    SessionContext {
        _dir: Arc::new(dir),
        store: SessionStore::new(state_dir),
        terminator: RecordingTerminator::new(),
        refusing_terminator: RecordingTerminator::failing(),
        refuse_termination: Arc::new(AtomicBool::new(false)),
        outcome: Arc::new(Mutex::new(None)),
    }
}

pub fn instance(id: &str) -> Instance {
    Instance {
        id: id.to_owned(),
        provider: String::from("vast"),
        gpu: String::from("RTX 4090"),
        region: String::from("eu-west"),
        instance_type: String::from("spot"),
        public_ip: String::from("203.0.113.7"),
        tunnel_ip: String::from("10.66.0.2"),
        created_at: Utc::now(),
    }
}
