//! Sync service: the orchestrator over local and remote stores.
//!
//! The service keeps gameplay responsive while converging both stores:
//!
//! - `save` / `delete` hit the local store synchronously and mirror to the
//!   remote store in the background when signed in
//! - `load` falls back to the remote store on a local miss and backfills
//! - `debounce_save` coalesces bursts of writes per key
//! - reconciliation passes run on sign-in and at startup, one at a time
//!
//! Construct one [`SyncService`] at application start and hand clones to
//! consumers; all clones share the same state.

mod debounce;
mod decision;
mod events;
mod lanes;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::SyncConfig;
use crate::local::LocalStore;
use crate::remote::RemoteStore;
use crate::schema::KeySchema;

use debounce::Debouncer;
use events::KeyOutcome;
use lanes::WriteLanes;

pub use decision::{Conflict, Resolution, UserDecision};
pub use events::{StorageEvent, SyncOutcome, SyncReport};

const EVENT_CAPACITY: usize = 256;

/// Which halves of a reconciliation pass to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Pull remote-only keys and settle conflicts.
    FromRemote,
    /// Push local-only keys.
    ToRemote,
    Both,
}

impl SyncDirection {
    fn pulls(self) -> bool {
        matches!(self, SyncDirection::FromRemote | SyncDirection::Both)
    }

    fn pushes(self) -> bool {
        matches!(self, SyncDirection::ToRemote | SyncDirection::Both)
    }
}

/// What `init` did on its first call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    /// Local records rewritten by the repair pass.
    pub repaired: usize,
    pub signed_in: bool,
    /// Whether the enforced-login prompt was offered.
    pub prompted: bool,
}

/// Clears the reconciliation flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct ServiceInner {
    config: SyncConfig,
    local: Arc<LocalStore>,
    remote: Arc<RemoteStore>,
    decision: Arc<dyn UserDecision>,
    events: broadcast::Sender<StorageEvent>,
    debouncer: Debouncer,
    lanes: WriteLanes,
    init_gate: tokio::sync::Mutex<bool>,
    syncing: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        local: Arc<LocalStore>,
        remote: Arc<RemoteStore>,
        decision: Arc<dyn UserDecision>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ServiceInner {
                config,
                local,
                remote,
                decision,
                events,
                debouncer: Debouncer::default(),
                lanes: WriteLanes::default(),
                init_gate: tokio::sync::Mutex::new(false),
                syncing: AtomicBool::new(false),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.events.subscribe()
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.inner.local
    }

    pub fn remote(&self) -> &Arc<RemoteStore> {
        &self.inner.remote
    }

    pub fn is_signed_in(&self) -> bool {
        self.inner.remote.is_user_signed_in()
    }

    /// Startup sequence. Only the first call does anything; later calls
    /// return `None`.
    ///
    /// Repairs local records, tries a bounded silent sign-in when auto-login
    /// is enabled, offers a bounded enforced-login prompt to a returning
    /// player who is still signed out, then starts a background
    /// reconciliation if a session is active. Never waits for that pass.
    pub async fn init(&self) -> Option<InitReport> {
        let inner = &self.inner;
        let mut initialized = inner.init_gate.lock().await;
        if *initialized {
            return None;
        }

        let mut report = InitReport {
            repaired: inner.local.fix_existing_data(),
            ..InitReport::default()
        };
        if report.repaired > 0 {
            tracing::info!(repaired = report.repaired, "repaired local records");
        }

        let session = inner.remote.session().clone();
        if !session.is_signed_in() && session.auto_login_enabled() {
            inner
                .remote
                .sign_in(true, inner.config.auto_login_timeout())
                .await;
        }

        if !session.is_signed_in() && session.has_logged_in_before() {
            report.prompted = true;
            let timeout = inner.config.enforced_login_timeout();
            let attempt = async {
                if inner.decision.confirm_login().await {
                    inner.remote.sign_in(false, timeout).await
                } else {
                    false
                }
            };
            if tokio::time::timeout(timeout, attempt).await.is_err() {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "enforced login timed out, continuing signed out"
                );
                session.set_auto_login(false);
            }
        }

        report.signed_in = session.is_signed_in();
        if report.signed_in {
            inner.emit(StorageEvent::SignedIn);
            ServiceInner::spawn_reconcile(inner);
        }

        *initialized = true;
        tracing::info!(signed_in = report.signed_in, "sync service initialized");
        Some(report)
    }

    /// Write locally now and mirror remotely in the background.
    ///
    /// Cancels any pending debounced save for `key`. The return value is the
    /// local result only.
    pub fn save(&self, key: &str, value: Value) -> bool {
        self.inner.debouncer.cancel(key);
        ServiceInner::save_now(&self.inner, key, value)
    }

    /// Save `value` after `delay`, unless another save for `key` arrives first.
    pub fn debounce_save(&self, key: &str, value: Value, delay: Duration) {
        let inner = self.inner.clone();
        let timer_key = key.to_string();
        self.inner.debouncer.schedule(key, value, move |id| {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(value) = inner.debouncer.take_if_current(&timer_key, id) {
                    ServiceInner::save_now(&inner, &timer_key, value);
                }
            })
        });
    }

    pub fn debounce_save_default(&self, key: &str, value: Value) {
        self.debounce_save(key, value, self.inner.config.debounce());
    }

    pub fn pending_saves(&self) -> Vec<String> {
        self.inner.debouncer.pending_keys()
    }

    /// Fire every pending debounced save immediately. Returns how many ran.
    pub fn flush_pending(&self) -> usize {
        let drained = self.inner.debouncer.drain();
        let count = drained.len();
        for (key, value) in drained {
            ServiceInner::save_now(&self.inner, &key, value);
        }
        count
    }

    /// Local first; on a miss, the remote store (when signed in) with a
    /// local backfill on hit.
    pub async fn load(&self, key: &str) -> Option<Value> {
        let inner = &self.inner;
        if let Some(value) = inner.local.load(key) {
            return Some(value);
        }
        if inner.local.schema().is_local_only(key) || !self.is_signed_in() {
            return None;
        }
        let value = inner.remote.load_data(key).await?;
        if !inner.local.save(key, &value) {
            tracing::warn!(key = %key, "backfill after remote load failed");
        }
        Some(value)
    }

    pub async fn has(&self, key: &str) -> bool {
        let inner = &self.inner;
        if inner.local.has(key) {
            return true;
        }
        if inner.local.schema().is_local_only(key) || !self.is_signed_in() {
            return false;
        }
        inner.remote.has_data(key).await
    }

    /// Delete locally now and remotely in the background.
    pub fn delete(&self, key: &str) -> bool {
        let inner = &self.inner;
        inner.debouncer.cancel(key);
        let deleted = inner.local.delete(key);
        if deleted {
            inner.emit(StorageEvent::Deleted {
                key: key.to_string(),
            });
        }
        if inner.should_mirror(key) {
            let ticket = inner.lanes.ticket(key);
            let remote = inner.remote.clone();
            let key = key.to_string();
            inner.track(tokio::spawn(async move {
                if ticket.run(remote.delete_data(&key)).await == Some(false) {
                    tracing::warn!(key = %key, "background remote delete failed");
                }
            }));
        }
        deleted
    }

    /// Interactive (or silent) sign-in; starts a reconciliation on success.
    pub async fn sign_in(&self, silent: bool) -> bool {
        let inner = &self.inner;
        let timeout = if silent {
            inner.config.auto_login_timeout()
        } else {
            inner.config.sign_in_timeout()
        };
        let signed_in = inner.remote.sign_in(silent, timeout).await;
        if signed_in {
            inner.emit(StorageEvent::SignedIn);
            ServiceInner::spawn_reconcile(inner);
        }
        signed_in
    }

    pub async fn sign_out(&self) {
        self.inner.remote.sign_out().await;
        self.inner.emit(StorageEvent::SignedOut);
    }

    /// The identity provider revoked the token.
    pub fn handle_revocation(&self) {
        self.inner.remote.handle_revocation();
        self.inner.emit(StorageEvent::SignedOut);
    }

    /// Pull remote-only keys and settle conflicts.
    pub async fn sync_from_remote(&self) -> SyncOutcome {
        ServiceInner::run_sync(&self.inner, SyncDirection::FromRemote).await
    }

    /// Push keys that only exist locally.
    pub async fn sync_to_remote(&self) -> SyncOutcome {
        ServiceInner::run_sync(&self.inner, SyncDirection::ToRemote).await
    }

    /// Full bidirectional pass.
    pub async fn reconcile(&self) -> SyncOutcome {
        ServiceInner::run_sync(&self.inner, SyncDirection::Both).await
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    /// Wait for background mirrors, reconciliations and cleanup started so far.
    pub async fn wait_for_background(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut background = self
                    .inner
                    .background
                    .lock()
                    .unwrap_or_else(|p| p.into_inner());
                background.drain(..).collect()
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
        self.inner.remote.wait_for_cleanup().await;
    }

    /// Abort pending timers and background work. Pending debounced values
    /// are dropped; call [`flush_pending`](Self::flush_pending) first to keep them.
    pub fn shutdown(&self) {
        let dropped = self.inner.debouncer.drain().len();
        let handles: Vec<JoinHandle<()>> = {
            let mut background = self
                .inner
                .background
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            background.drain(..).collect()
        };
        for handle in &handles {
            handle.abort();
        }
        tracing::info!(dropped, aborted = handles.len(), "sync service shut down");
    }
}

impl ServiceInner {
    fn emit(&self, event: StorageEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut background = self.background.lock().unwrap_or_else(|p| p.into_inner());
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    fn schema(&self) -> &KeySchema {
        self.local.schema()
    }

    fn should_mirror(&self, key: &str) -> bool {
        !self.schema().is_local_only(key) && self.remote.is_user_signed_in()
    }

    fn save_now(inner: &Arc<Self>, key: &str, value: Value) -> bool {
        let saved = inner.local.save(key, &value);
        if !saved {
            return false;
        }
        inner.emit(StorageEvent::Saved {
            key: key.to_string(),
        });
        if inner.should_mirror(key) {
            let ticket = inner.lanes.ticket(key);
            let remote = inner.remote.clone();
            let key = key.to_string();
            inner.track(tokio::spawn(async move {
                if ticket.run(remote.save_data(&key, &value)).await == Some(false) {
                    tracing::warn!(key = %key, "background remote save failed");
                }
            }));
        }
        true
    }

    fn spawn_reconcile(inner: &Arc<Self>) {
        let task_inner = inner.clone();
        inner.track(tokio::spawn(async move {
            Self::run_sync(&task_inner, SyncDirection::Both).await;
        }));
    }

    async fn run_sync(inner: &Arc<Self>, direction: SyncDirection) -> SyncOutcome {
        if !inner.remote.is_user_signed_in() {
            return SyncOutcome::NotSignedIn;
        }
        if inner.syncing.swap(true, Ordering::SeqCst) {
            tracing::debug!(?direction, "reconciliation already running");
            return SyncOutcome::AlreadyRunning;
        }
        let _guard = PassGuard(&inner.syncing);

        inner.emit(StorageEvent::SyncStarted);
        let local_keys = inner.local.keys();
        let keys = inner
            .schema()
            .syncable_keys(local_keys.iter().map(String::as_str));
        tracing::info!(?direction, keys = keys.len(), "reconciliation started");

        let mut tasks = JoinSet::new();
        for key in keys {
            let inner = inner.clone();
            tasks.spawn(async move { Self::reconcile_key(&inner, &key, direction).await });
        }

        let mut report = SyncReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    tracing::error!(error = %err, "reconciliation task failed");
                    report.record(KeyOutcome::Failed);
                }
            }
        }

        tracing::info!(
            pulled = report.pulled,
            pushed = report.pushed,
            kept_local = report.kept_local,
            took_remote = report.took_remote,
            failed = report.failed,
            "reconciliation finished"
        );
        inner.emit(StorageEvent::SyncCompleted(report.clone()));
        SyncOutcome::Completed(report)
    }

    async fn reconcile_key(inner: &Arc<Self>, key: &str, direction: SyncDirection) -> KeyOutcome {
        let local = inner.local.load(key);
        let remote = match inner.remote.try_load(key).await {
            Ok(remote) => remote,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "remote read failed during reconciliation");
                return KeyOutcome::Failed;
            }
        };

        match (local, remote) {
            (None, None) => KeyOutcome::Unchanged,
            (None, Some(remote)) if direction.pulls() => {
                // A save may have landed while the remote read was in flight.
                if inner.local.has(key) {
                    return KeyOutcome::Skipped;
                }
                if inner.local.save(key, &remote) {
                    tracing::debug!(key = %key, "pulled remote value");
                    KeyOutcome::Pulled
                } else {
                    KeyOutcome::Failed
                }
            }
            (Some(_), None) if direction.pushes() => {
                match Self::push(inner, key).await {
                    Some(true) => KeyOutcome::Pushed,
                    Some(false) => KeyOutcome::Failed,
                    None => KeyOutcome::Skipped,
                }
            }
            (Some(local), Some(remote)) => {
                if inner.same_serialized(key, &local, &remote) {
                    KeyOutcome::Unchanged
                } else if direction.pulls() {
                    Self::resolve_conflict(inner, key, local, remote).await
                } else {
                    KeyOutcome::Skipped
                }
            }
            _ => KeyOutcome::Skipped,
        }
    }

    /// Compare the canonical text both stores would hold for the values.
    fn same_serialized(&self, key: &str, local: &Value, remote: &Value) -> bool {
        let schema = self.schema();
        match (schema.encode(key, local), schema.encode(key, remote)) {
            (Ok(a), Ok(b)) => a == b,
            _ => local == remote,
        }
    }

    /// Mirror the key's current local state through its write lane.
    ///
    /// The local value is read once the lane is held, so a save or delete
    /// that landed after the pass read the key is what reaches the remote
    /// store. Returns `None` if superseded by a newer write, or if the key
    /// was deleted locally (the remote copy is deleted too).
    async fn push(inner: &Arc<Self>, key: &str) -> Option<bool> {
        let write = async {
            match inner.local.load(key) {
                Some(current) => Some(inner.remote.save_data(key, &current).await),
                None => {
                    tracing::debug!(key = %key, "key deleted during reconciliation");
                    if !inner.remote.delete_data(key).await {
                        tracing::warn!(key = %key, "remote delete failed during reconciliation");
                    }
                    None
                }
            }
        };
        inner.lanes.ticket(key).run(write).await.flatten()
    }

    async fn resolve_conflict(
        inner: &Arc<Self>,
        key: &str,
        local: Value,
        remote: Value,
    ) -> KeyOutcome {
        let (resolution, remote) = if inner.schema().is_save_game(key) {
            let conflict = Conflict {
                key: key.to_string(),
                local,
                remote,
            };
            match inner.decision.resolve_conflict(&conflict).await {
                Some(resolution) => (resolution, conflict.remote),
                None => {
                    tracing::info!(key = %key, "save conflict dismissed, leaving both copies");
                    return KeyOutcome::Skipped;
                }
            }
        } else {
            (Resolution::UseLocal, remote)
        };

        let outcome = match resolution {
            Resolution::UseLocal => match Self::push(inner, key).await {
                Some(true) => KeyOutcome::KeptLocal,
                Some(false) => KeyOutcome::Failed,
                None => KeyOutcome::Skipped,
            },
            Resolution::UseRemote => {
                if !inner.local.has(key) {
                    tracing::debug!(key = %key, "key deleted before the remote value was applied");
                    KeyOutcome::Skipped
                } else if inner.local.save(key, &remote) {
                    KeyOutcome::TookRemote
                } else {
                    KeyOutcome::Failed
                }
            }
        };

        if matches!(outcome, KeyOutcome::KeptLocal | KeyOutcome::TookRemote) {
            tracing::debug!(key = %key, ?resolution, "conflict resolved");
            inner.emit(StorageEvent::ConflictResolved {
                key: key.to_string(),
                resolution,
            });
        }
        outcome
    }
}
