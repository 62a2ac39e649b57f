//! Shared test helpers for core integration tests.
#![allow(dead_code)]

use scuttle_core::container::LifecycleController;
use scuttle_core::docker::mock::MockRuntime;
use scuttle_core::hooks::{HandleHook, LifecycleHookBundle, SpecHook};
use scuttle_core::session::SessionId;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Ordered record of hook invocations
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries starting with `prefix`, prefix stripped
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

/// A bundle with two hooks per edge, recording `{phase}:{tag}/1` then
/// `{phase}:{tag}/2`
pub fn recording_bundle(recorder: &Recorder, tag: &str) -> LifecycleHookBundle {
    let handle = |phase: &'static str, n: u8| {
        let recorder = recorder.clone();
        let entry = format!("{}:{}/{}", phase, tag, n);
        HandleHook::from_fn(move |_| {
            recorder.push(entry.clone());
            Ok(())
        })
    };
    let pre_create = |n: u8| {
        let recorder = recorder.clone();
        let entry = format!("pre-create:{}/{}", tag, n);
        SpecHook::from_fn(move |_| {
            recorder.push(entry.clone());
            Ok(())
        })
    };

    LifecycleHookBundle::new()
        .pre_create(pre_create(1))
        .pre_create(pre_create(2))
        .post_create(handle("post-create", 1))
        .post_create(handle("post-create", 2))
        .pre_start(handle("pre-start", 1))
        .pre_start(handle("pre-start", 2))
        .post_start(handle("post-start", 1))
        .post_start(handle("post-start", 2))
        .post_ready(handle("post-ready", 1))
        .post_ready(handle("post-ready", 2))
        .pre_stop(handle("pre-stop", 1))
        .pre_stop(handle("pre-stop", 2))
        .post_stop(handle("post-stop", 1))
        .post_stop(handle("post-stop", 2))
        .pre_terminate(handle("pre-terminate", 1))
        .pre_terminate(handle("pre-terminate", 2))
        .post_terminate(handle("post-terminate", 1))
        .post_terminate(handle("post-terminate", 2))
}

/// The entries `tags` produce in order, two per tag
pub fn expected_pairs(tags: &[&str]) -> Vec<String> {
    tags.iter()
        .flat_map(|tag| [format!("{}/1", tag), format!("{}/2", tag)])
        .collect()
}

pub fn controller(runtime: &Arc<MockRuntime>, session: &str) -> LifecycleController {
    LifecycleController::new(runtime.clone(), SessionId::new(session))
}

/// Stand-in for the reaper sidecar: acknowledges every filter line it receives
pub struct FakeReaper {
    pub port: u16,
    filters: Arc<Mutex<Vec<String>>>,
}

impl FakeReaper {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let filters = Arc::new(Mutex::new(Vec::new()));

        let seen = filters.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let seen = seen.clone();
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        seen.lock().unwrap().push(line);
                        if write.write_all(b"ACK\n").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self { port, filters }
    }

    pub fn filters(&self) -> Vec<String> {
        self.filters.lock().unwrap().clone()
    }
}

/// Mock runtime whose reaper port points at a fresh [`FakeReaper`]
pub async fn runtime_with_reaper() -> (Arc<MockRuntime>, FakeReaper) {
    let reaper = FakeReaper::start().await;
    let runtime = Arc::new(MockRuntime::new());
    runtime.bind_port(8080, reaper.port);
    (runtime, reaper)
}
