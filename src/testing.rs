//! Shared test doubles.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::AcquisitionError;
use crate::cache::Fetch;
use crate::dispatch::EventSink;
use crate::protocol::Event;

/// In-memory fetcher that counts downloads.
pub(crate) struct StaticFetcher {
    body: Result<Vec<u8>, String>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub(crate) fn serving(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Ok(body.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing(reason: &str) -> Self {
        Self {
            body: Err(reason.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for StaticFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, AcquisitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.body.clone().map_err(AcquisitionError::Download)
    }
}

/// Sink that records every event.
#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, wanted: &Event) -> usize {
        self.events().iter().filter(|e| *e == wanted).count()
    }

    /// Poll until `check` holds, panicking after five seconds.
    pub(crate) async fn wait_for(&self, what: &str, check: impl Fn(&[Event]) -> bool) {
        for _ in 0..500 {
            if check(&self.events()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}; got {:?}", self.events());
    }
}

impl EventSink for Recorder {
    fn handle_event(&self, event: Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Body of a `/bin/sh` monitor script.
pub(crate) fn script(body: &str) -> String {
    format!("#!/bin/sh\n{body}\n")
}

/// Write an executable script.
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, script(body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
