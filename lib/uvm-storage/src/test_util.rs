// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fakes of the UVM collaborators shared by the unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use slog::Drain;
use tokio::sync::watch;

use crate::access::AccessGranter;
use crate::modify::{ModifyRequest, Modifier};

/// Discards everything, unless `UVM_STORAGE_TEST_LOG` is set in the
/// environment, in which case records are printed to the test's stdout.
pub(crate) fn test_logger() -> slog::Logger {
    if std::env::var_os("UVM_STORAGE_TEST_LOG").is_none() {
        return slog::Logger::root(slog::Discard, slog::o!());
    }
    let dec = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(dec).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("component" => "uvm-storage-test"))
}

/// Records every request it is handed.
///
/// Requests can be made to fail, and can be held at a gate so that tests may
/// pile up concurrent callers behind an in-flight request.
pub(crate) struct RecordingModifier {
    requests: Mutex<Vec<ModifyRequest>>,
    failing: AtomicBool,
    gate: watch::Sender<bool>,
}

impl Default for RecordingModifier {
    fn default() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            gate: watch::channel(true).0,
        }
    }
}

impl RecordingModifier {
    /// A modifier whose requests block until [RecordingModifier::open] is
    /// called.
    pub fn gated() -> Self {
        let this = Self::default();
        this.gate.send_replace(false);
        this
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Hold subsequent requests until the next [RecordingModifier::open].
    pub fn close(&self) {
        self.gate.send_replace(false);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ModifyRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Modifier for RecordingModifier {
    async fn modify(&self, request: ModifyRequest) -> anyhow::Result<()> {
        self.requests.lock().unwrap().push(request);

        let mut gate = self.gate.subscribe();
        loop {
            let open = *gate.borrow_and_update();
            if open {
                break;
            }
            gate.changed().await?;
        }

        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("injected modify failure");
        }
        Ok(())
    }
}

/// Records grants as `(vm_id, path)`; group grants carry no VM ID.
#[derive(Default)]
pub(crate) struct RecordingGranter {
    grants: Mutex<Vec<(Option<String>, PathBuf)>>,
    failing: bool,
}

impl RecordingGranter {
    pub fn failing() -> Self {
        Self { failing: true, ..Default::default() }
    }

    pub fn grants(&self) -> Vec<(Option<String>, PathBuf)> {
        self.grants.lock().unwrap().clone()
    }

    fn record(&self, vm_id: Option<&str>, path: &Path) -> anyhow::Result<()> {
        if self.failing {
            anyhow::bail!("access denied");
        }
        self.grants
            .lock()
            .unwrap()
            .push((vm_id.map(str::to_string), path.to_path_buf()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl AccessGranter for RecordingGranter {
    async fn grant_vm_group_access(&self, path: &Path) -> anyhow::Result<()> {
        self.record(None, path)
    }

    async fn grant_vm_access(
        &self,
        vm_id: &str,
        path: &Path,
    ) -> anyhow::Result<()> {
        self.record(Some(vm_id), path)
    }
}
