//! BDD scenarios for the session store and deadman switch.

use rstest_bdd_macros::scenario;

use super::test_helpers::{SessionContext, session_context};

#[scenario(
    path = "tests/features/session.feature",
    name = "A fresh state directory has no session"
)]
fn scenario_fresh_state(session_context: SessionContext) {
    drop(session_context);
}

#[scenario(path = "tests/features/session.feature", name = "Save and clear a session")]
fn scenario_save_and_clear(session_context: SessionContext) {
    drop(session_context);
}

#[scenario(
    path = "tests/features/session.feature",
    name = "A heartbeat keeps the deadman switch alive"
)]
fn scenario_heartbeat(session_context: SessionContext) {
    drop(session_context);
}

#[scenario(
    path = "tests/features/session.feature",
    name = "A live deadman switch leaves the instance running"
)]
fn scenario_deadman_alive(session_context: SessionContext) {
    drop(session_context);
}

#[scenario(
    path = "tests/features/session.feature",
    name = "An expired deadman switch terminates the instance"
)]
fn scenario_deadman_expired(session_context: SessionContext) {
    drop(session_context);
}

#[scenario(
    path = "tests/features/session.feature",
    name = "A failed termination keeps the session"
)]
fn scenario_termination_failure(session_context: SessionContext) {
    drop(session_context);
}
