//! Unit tests for the session store.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{TimeZone, Utc};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;

struct StoreFixture {
    store: SessionStore,
    _tmp: TempDir,
}

#[fixture]
fn store_fixture() -> StoreFixture {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let dir = Utf8PathBuf::from_path_buf(tmp.path().join("state"))
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    StoreFixture {
        store: SessionStore::new(dir),
        _tmp: tmp,
    }
}

fn sample_instance() -> Instance {
    Instance {
        id: String::from("inst-42"),
        provider: String::from("vast"),
        gpu: String::from("RTX 4090"),
        region: String::from("us-west"),
        instance_type: String::from("on-demand"),
        public_ip: String::from("203.0.113.7"),
        tunnel_ip: String::from("10.66.0.2"),
        created_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap_or_default(),
    }
}

fn full_state() -> SessionState {
    SessionState {
        version: CURRENT_VERSION,
        instance: Some(sample_instance()),
        model: Some(Model {
            name: String::from("llama-3-70b"),
            status: String::from("loading"),
        }),
        tunnel: Some(Tunnel {
            peer_public_key: String::from("HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw="),
            interface_name: String::from("wg-tether"),
        }),
        cost: Some(Cost {
            hourly_rate: 0.45,
            accumulated: 1.35,
            currency: String::from("USD"),
        }),
        deadman: Some(Deadman {
            timeout_hours: 4,
            last_heartbeat: Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).single().unwrap_or_default(),
        }),
    }
}

fn write_raw(fixture: &StoreFixture, contents: &str) {
    std::fs::create_dir_all(fixture.store.dir()).unwrap_or_else(|err| panic!("mkdir: {err}"));
    std::fs::write(fixture.store.state_path(), contents)
        .unwrap_or_else(|err| panic!("write state: {err}"));
}

#[rstest]
fn load_returns_none_when_directory_missing(store_fixture: StoreFixture) {
    let loaded = store_fixture.store.load().expect("load");
    assert_eq!(loaded, None);
}

#[rstest]
#[case("")]
#[case("   \n")]
fn load_treats_empty_file_as_no_session(store_fixture: StoreFixture, #[case] contents: &str) {
    write_raw(&store_fixture, contents);
    assert_eq!(store_fixture.store.load().expect("load"), None);
}

#[rstest]
fn load_reports_corrupt_state_and_keeps_file(store_fixture: StoreFixture) {
    write_raw(&store_fixture, "{not json");

    let err = store_fixture.store.load().expect_err("garbage should fail");
    assert!(matches!(err, SessionError::StateCorrupt { .. }), "got {err:?}");
    assert!(err.to_string().contains("session.json"));
    assert!(store_fixture.store.state_path().exists());
}

#[rstest]
fn save_then_load_round_trips_full_state(store_fixture: StoreFixture) {
    let state = full_state();
    store_fixture.store.save(&state).expect("save");
    assert_eq!(store_fixture.store.load().expect("load"), Some(state));
}

#[rstest]
fn save_then_load_round_trips_partial_state(store_fixture: StoreFixture) {
    let state = SessionState::for_instance(sample_instance());
    store_fixture.store.save(&state).expect("save");
    assert_eq!(store_fixture.store.load().expect("load"), Some(state));
}

#[rstest]
fn save_assigns_current_version(store_fixture: StoreFixture) {
    let state = SessionState {
        version: 0,
        ..full_state()
    };
    store_fixture.store.save(&state).expect("save");
    let loaded = store_fixture.store.load().expect("load").expect("state");
    assert_eq!(loaded.version, CURRENT_VERSION);
}

#[rstest]
fn save_rejects_absent_state(store_fixture: StoreFixture) {
    let err = store_fixture
        .store
        .save(None::<&SessionState>)
        .expect_err("absent state should fail");
    assert_eq!(err, SessionError::MissingState);
}

#[rstest]
fn save_leaves_no_temporary_files(store_fixture: StoreFixture) {
    store_fixture.store.save(&full_state()).expect("save");
    store_fixture.store.save(&full_state()).expect("save again");

    let names: Vec<String> = std::fs::read_dir(store_fixture.store.dir())
        .expect("read dir")
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().all(|name| !name.ends_with(".tmp")), "names: {names:?}");
}

#[cfg(unix)]
#[rstest]
fn saved_and_lock_files_are_owner_only(store_fixture: StoreFixture) {
    use std::os::unix::fs::PermissionsExt as _;

    store_fixture.store.save(&full_state()).expect("save");
    for path in [store_fixture.store.state_path(), store_fixture.store.lock_path()] {
        let mode = std::fs::metadata(&path)
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600, "{path} should be owner-only");
    }
}

#[rstest]
fn clear_is_idempotent(store_fixture: StoreFixture) {
    store_fixture.store.clear().expect("clear without state");
    store_fixture.store.save(&full_state()).expect("save");
    store_fixture.store.clear().expect("clear");
    store_fixture.store.clear().expect("clear again");
    assert_eq!(store_fixture.store.load().expect("load"), None);
}

#[rstest]
fn update_cost_changes_only_accumulated(store_fixture: StoreFixture) {
    store_fixture.store.save(&full_state()).expect("save");
    let updated = store_fixture.store.update_cost(2.5).expect("update");

    let mut expected = full_state();
    if let Some(cost) = expected.cost.as_mut() {
        cost.accumulated = 2.5;
    }
    assert_eq!(updated, expected);
    assert_eq!(store_fixture.store.load().expect("load"), Some(expected));
}

#[rstest]
fn update_heartbeat_at_records_time(store_fixture: StoreFixture) {
    store_fixture.store.save(&full_state()).expect("save");
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 15, 30, 0).single().unwrap_or_default();

    let updated = store_fixture.store.update_heartbeat_at(now).expect("heartbeat");
    assert_eq!(updated.deadman.map(|deadman| deadman.last_heartbeat), Some(now));
}

#[rstest]
fn update_model_status_persists(store_fixture: StoreFixture) {
    store_fixture.store.save(&full_state()).expect("save");
    store_fixture
        .store
        .update_model_status("ready")
        .expect("update status");
    let loaded = store_fixture.store.load().expect("load").expect("state");
    assert_eq!(loaded.model.map(|model| model.status), Some(String::from("ready")));
}

#[rstest]
fn mutators_fail_without_session(store_fixture: StoreFixture) {
    assert!(matches!(
        store_fixture.store.update_cost(1.0),
        Err(SessionError::NoActiveInstance(_))
    ));
    assert!(matches!(
        store_fixture.store.update_heartbeat(),
        Err(SessionError::NoActiveInstance(_))
    ));
    assert!(matches!(
        store_fixture.store.update_model_status("ready"),
        Err(SessionError::NoActiveInstance(_))
    ));
}

#[rstest]
fn mutators_fail_without_substructure(store_fixture: StoreFixture) {
    store_fixture
        .store
        .save(&SessionState::for_instance(sample_instance()))
        .expect("save");

    assert!(matches!(
        store_fixture.store.update_cost(1.0),
        Err(SessionError::NoActiveInstance(_))
    ));
    assert!(matches!(
        store_fixture.store.update_heartbeat(),
        Err(SessionError::NoActiveInstance(_))
    ));
}

#[rstest]
fn mutators_fail_without_instance(store_fixture: StoreFixture) {
    let state = SessionState {
        instance: None,
        ..full_state()
    };
    store_fixture.store.save(&state).expect("save");
    assert!(matches!(
        store_fixture.store.update_cost(1.0),
        Err(SessionError::NoActiveInstance(_))
    ));
}

#[rstest]
fn concurrent_mutators_do_not_lose_updates(store_fixture: StoreFixture) {
    store_fixture.store.save(&full_state()).expect("save");
    let store = Arc::new(store_fixture.store.clone());

    let cost_store = Arc::clone(&store);
    let model_store = Arc::clone(&store);
    let cost_thread = thread::spawn(move || {
        for step in 0..20_u32 {
            cost_store.update_cost(f64::from(step)).expect("cost");
        }
    });
    let model_thread = thread::spawn(move || {
        for step in 0..20_u32 {
            model_store
                .update_model_status(format!("step-{step}"))
                .expect("status");
        }
    });
    cost_thread.join().expect("cost thread");
    model_thread.join().expect("model thread");

    let loaded = store.load().expect("load").expect("state");
    assert_eq!(loaded.cost.map(|cost| cost.accumulated), Some(19.0));
    assert_eq!(
        loaded.model.map(|model| model.status),
        Some(String::from("step-19"))
    );
}

#[rstest]
fn held_lock_reports_state_locked(store_fixture: StoreFixture) {
    use nix::fcntl::{Flock, FlockArg};

    store_fixture.store.save(&full_state()).expect("save");
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(store_fixture.store.lock_path())
        .expect("open lock file");
    let _held = Flock::lock(file, FlockArg::LockExclusiveNonblock)
        .unwrap_or_else(|(_, errno)| panic!("lock: {errno}"));

    let impatient = SessionStore::with_lock_retry(
        store_fixture.store.dir().to_path_buf(),
        LockRetry {
            attempts: 2,
            delay: Duration::from_millis(5),
        },
    );
    let err = impatient.load().expect_err("lock should be busy");
    assert!(matches!(err, SessionError::StateLocked { .. }), "got {err:?}");
    assert!(err.to_string().contains("locked"));
}
