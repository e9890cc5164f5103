use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn should_skip_httpmock() -> bool {
    if can_bind_localhost() {
        return false;
    }
    eprintln!("skipping httpmock test: sandbox forbids binding to localhost");
    true
}

fn can_bind_localhost() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
    }
}

pub fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Redis used by live store tests; they return early when unset.
pub fn redis_url() -> Option<String> {
    env_nonempty("NEXUS_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))
}

/// Postgres used by live store tests; they return early when unset.
pub fn database_url() -> Option<String> {
    env_nonempty("NEXUS_DATABASE_URL").or_else(|| env_nonempty("DB_URL"))
}

static UNIQUE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A value that does not collide across tests or test runs.
pub fn unique_suffix() -> String {
    let n = UNIQUE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    format!("{millis}-{n}")
}
