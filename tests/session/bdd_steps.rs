//! BDD step definitions for session persistence and the deadman switch.

use chrono::{TimeDelta, Utc};
use rstest_bdd_macros::{given, then, when};
use tether::alert::AlertDispatcher;
use tether::deadman::{DeadmanMonitor, Enforcement};
use tether::session::{Deadman, SessionState};
use tokio::runtime::Runtime;

use super::test_helpers::{SessionContext, instance};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("session store failed: {0}")]
    Store(#[from] tether::session::SessionError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn save_instance(session_context: &SessionContext, id: &str) -> Result<(), StepError> {
    let state = SessionState::for_instance(instance(id));
    session_context.store.save(&state)?;
    Ok(())
}

#[given("an empty state directory")]
fn empty_state_directory(session_context: &SessionContext) -> Result<(), StepError> {
    if session_context.store.state_path().exists() {
        return Err(StepError::Assertion(String::from(
            "state directory should start empty",
        )));
    }
    Ok(())
}

#[given("a session for instance \"{id}\" with a \"{hours}\" hour deadman")]
fn session_with_deadman(
    session_context: &SessionContext,
    id: String,
    hours: u32,
) -> Result<(), StepError> {
    let mut state = SessionState::for_instance(instance(&id));
    state.deadman = Some(Deadman {
        timeout_hours: hours,
        last_heartbeat: Utc::now(),
    });
    session_context.store.save(&state)?;
    Ok(())
}

#[given("the last heartbeat was \"{hours}\" hours ago")]
fn heartbeat_hours_ago(session_context: &SessionContext, hours: i64) -> Result<(), StepError> {
    let at = Utc::now()
        .checked_sub_signed(TimeDelta::hours(hours))
        .ok_or_else(|| StepError::Assertion(format!("{hours} hours ago is out of range")))?;
    session_context.store.update_heartbeat_at(at)?;
    Ok(())
}

#[given("the provider refuses termination")]
fn provider_refuses(session_context: &SessionContext) {
    session_context.refuse_termination();
}

#[when("a session for instance \"{id}\" is saved")]
fn session_saved(session_context: &SessionContext, id: String) -> Result<(), StepError> {
    save_instance(session_context, &id)
}

#[when("the session is cleared")]
fn session_cleared(session_context: &SessionContext) -> Result<(), StepError> {
    session_context.store.clear()?;
    Ok(())
}

#[when("a heartbeat is recorded")]
fn heartbeat_recorded(session_context: &SessionContext) -> Result<(), StepError> {
    session_context.store.update_heartbeat()?;
    Ok(())
}

#[when("the deadman switch is enforced")]
fn deadman_enforced(session_context: &SessionContext) -> Result<(), StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let monitor = DeadmanMonitor::new(session_context.store.clone());
    let terminator = session_context.active_terminator();
    let alerts = AlertDispatcher::new();
    let result = runtime.block_on(async {
        let outcome = monitor.enforce(terminator, &alerts, Utc::now()).await;
        alerts.shutdown().await;
        outcome
    });
    session_context.record_outcome(result.map_err(|err| err.to_string()));
    Ok(())
}

#[then("no session is stored")]
fn no_session(session_context: &SessionContext) -> Result<(), StepError> {
    match session_context.store.load()? {
        None => Ok(()),
        Some(state) => Err(StepError::Assertion(format!(
            "expected no session, found {state:?}"
        ))),
    }
}

#[then("the stored instance is \"{id}\"")]
fn stored_instance(session_context: &SessionContext, id: String) -> Result<(), StepError> {
    let state = session_context.store.load()?;
    let stored = state.as_ref().and_then(SessionState::instance_id);
    if stored == Some(id.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected instance {id}, found {stored:?}"
        )))
    }
}

#[then("the deadman switch has not expired")]
fn deadman_not_expired(session_context: &SessionContext) -> Result<(), StepError> {
    let monitor = DeadmanMonitor::new(session_context.store.clone());
    if monitor.is_expired(Utc::now())? {
        Err(StepError::Assertion(String::from(
            "deadman switch should not have expired",
        )))
    } else {
        Ok(())
    }
}

#[then("the instance is left running")]
fn instance_left_running(session_context: &SessionContext) -> Result<(), StepError> {
    match session_context.outcome() {
        Some(Ok(Enforcement::Alive(_))) if session_context.terminator.calls().is_empty() => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected the instance to be left alone, got {other:?}"
        ))),
    }
}

#[then("the instance \"{id}\" was terminated")]
fn instance_terminated(session_context: &SessionContext, id: String) -> Result<(), StepError> {
    let Some(Ok(Enforcement::Terminated(_))) = session_context.outcome() else {
        return Err(StepError::Assertion(format!(
            "expected termination, got {:?}",
            session_context.outcome()
        )));
    };
    let calls = session_context.terminator.calls();
    if calls == vec![(String::from("vast"), id.clone())] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one termination of {id}, got {calls:?}"
        )))
    }
}

#[then("the deadman enforcement fails")]
fn enforcement_fails(session_context: &SessionContext) -> Result<(), StepError> {
    match session_context.outcome() {
        Some(Err(message)) if message.contains("simulated outage") => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a termination failure, got {other:?}"
        ))),
    }
}
