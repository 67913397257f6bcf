//! Temporary, restorable override of selection, edit mode and visual flags
//! around a long-running generation.
//!
//! Every value forced while locked is snapshotted first and restored exactly
//! once, whether the wrapped operation succeeds, fails, or its future is
//! dropped.

use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::engine::{
    BlockId, BlockState, EngineApi, EngineEvent, EngineListener, HistoryId, SELECT_SCOPE,
    ScopePermission, SubscriptionId,
};

pub const DEFAULT_EDIT_MODE: &str = "Transform";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Edit mode forced while locked.
    pub edit_mode: String,
    /// Show targets as pending while the operation runs.
    pub pending_state: bool,
    /// Keep targets rendered above their siblings.
    pub always_on_top: bool,
    /// Stop parents from clipping the targets.
    pub disable_clipping: bool,
    /// Pin selection and edit mode, and isolate undo history.
    pub lock: bool,
    /// Restore as soon as the operation settles. When false the caller
    /// restores through the returned [`UnlockHandle`].
    pub automatically_unlock: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            edit_mode: DEFAULT_EDIT_MODE.to_string(),
            pending_state: true,
            always_on_top: true,
            disable_clipping: true,
            lock: true,
            automatically_unlock: true,
        }
    }
}

struct SelectionLock {
    previous_selection: Vec<BlockId>,
    previous_scope: ScopePermission,
    previous_edit_mode: String,
    previous_history: HistoryId,
    isolated_history: HistoryId,
    subscription: SubscriptionId,
}

/// Snapshots taken while acquiring a lock.
struct LockRecord {
    engine: Arc<dyn EngineApi>,
    always_on_top: Vec<(BlockId, bool)>,
    clipping: Vec<(BlockId, bool)>,
    selection: Option<SelectionLock>,
}

impl LockRecord {
    fn acquire(engine: &Arc<dyn EngineApi>, targets: &[BlockId], options: &LockOptions) -> Self {
        let mut record = Self {
            engine: engine.clone(),
            always_on_top: Vec::new(),
            clipping: Vec::new(),
            selection: None,
        };

        if options.always_on_top {
            for &block in targets {
                if let Ok(previous) = engine.always_on_top(block) {
                    record.always_on_top.push((block, previous));
                    log_engine_error(engine.set_always_on_top(block, true));
                }
            }
        }

        if options.disable_clipping {
            for &block in targets {
                let Ok(Some(parent)) = engine.parent(block) else {
                    continue;
                };
                if record.clipping.iter().any(|(p, _)| *p == parent) {
                    continue;
                }
                if let Ok(previous) = engine.clipped(parent) {
                    record.clipping.push((parent, previous));
                    log_engine_error(engine.set_clipped(parent, false));
                }
            }
        }

        if options.lock {
            record.selection = Some(lock_selection(engine, targets, &options.edit_mode));
        }

        record
    }

    fn restore(self) {
        let engine = &self.engine;

        if let Some(lock) = self.selection {
            // Stop re-asserting before putting the user's state back.
            engine.unsubscribe(lock.subscription);
            log_engine_error(engine.set_active_history(lock.previous_history));
            engine.destroy_history(lock.isolated_history);
            engine.set_global_scope(SELECT_SCOPE, lock.previous_scope);
            engine.set_edit_mode(&lock.previous_edit_mode);
            let selection: Vec<BlockId> = lock
                .previous_selection
                .into_iter()
                .filter(|b| engine.is_valid(*b))
                .collect();
            engine.set_selection(&selection);
        }

        for (parent, clipped) in self.clipping.into_iter().rev() {
            if engine.is_valid(parent) {
                log_engine_error(engine.set_clipped(parent, clipped));
            }
        }

        for (block, on_top) in self.always_on_top.into_iter().rev() {
            if engine.is_valid(block) {
                log_engine_error(engine.set_always_on_top(block, on_top));
            }
        }

        tracing::debug!("lock released");
    }
}

fn lock_selection(engine: &Arc<dyn EngineApi>, targets: &[BlockId], edit_mode: &str) -> SelectionLock {
    let previous_selection = engine.selection();
    let previous_scope = engine.global_scope(SELECT_SCOPE);
    let previous_edit_mode = engine.edit_mode();
    let previous_history = engine.active_history();

    engine.set_selection(targets);
    engine.set_global_scope(SELECT_SCOPE, ScopePermission::Deny);
    engine.set_edit_mode(edit_mode);

    let isolated_history = engine.create_history();
    log_engine_error(engine.set_active_history(isolated_history));

    let weak = Arc::downgrade(engine);
    let pinned = targets.to_vec();
    let mode = edit_mode.to_string();
    let listener: EngineListener = Arc::new(move |event| {
        let Some(engine) = weak.upgrade() else {
            return;
        };
        match event {
            EngineEvent::SelectionChanged => {
                let wanted: Vec<BlockId> =
                    pinned.iter().copied().filter(|b| engine.is_valid(*b)).collect();
                if engine.selection() != wanted {
                    tracing::debug!("selection changed while locked, re-asserting");
                    engine.set_selection(&wanted);
                }
            }
            EngineEvent::EditModeChanged => {
                if engine.edit_mode() != mode {
                    tracing::debug!("edit mode changed while locked, re-asserting");
                    engine.set_edit_mode(&mode);
                }
            }
        }
    });
    let subscription = engine.subscribe(listener);

    SelectionLock {
        previous_selection,
        previous_scope,
        previous_edit_mode,
        previous_history,
        isolated_history,
        subscription,
    }
}

fn log_engine_error(result: Result<(), crate::error::EngineError>) {
    if let Err(e) = result {
        tracing::debug!(error = %e, "engine call skipped while locking");
    }
}

/// Restores a lock when unlocked or dropped, whichever happens first.
pub struct UnlockHandle {
    record: Mutex<Option<LockRecord>>,
}

impl UnlockHandle {
    fn new(record: LockRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }

    /// Restore every snapshot. Returns false if already unlocked.
    pub fn unlock(&self) -> bool {
        let record = match self.record.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match record {
            Some(record) => {
                record.restore();
                true
            }
            None => false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.record
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for UnlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockHandle")
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl Drop for UnlockHandle {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Marks blocks pending and puts them back to ready when dropped.
struct PendingGuard {
    engine: Arc<dyn EngineApi>,
    blocks: Vec<BlockId>,
}

impl PendingGuard {
    fn new(engine: &Arc<dyn EngineApi>, blocks: &[BlockId], enabled: bool) -> Self {
        let blocks = if enabled { blocks.to_vec() } else { Vec::new() };
        for &block in &blocks {
            log_engine_error(engine.set_block_state(block, BlockState::Pending));
        }
        Self {
            engine: engine.clone(),
            blocks,
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        for &block in &self.blocks {
            if self.engine.is_valid(block) {
                log_engine_error(self.engine.set_block_state(block, BlockState::Ready));
            }
        }
    }
}

/// Value produced under a lock, plus the handle that releases it.
#[derive(Debug)]
pub struct Locked<T> {
    pub return_value: T,
    pub unlock: UnlockHandle,
}

impl<T> Locked<T> {
    /// Release the lock (if still held) and return the value.
    pub fn into_value(self) -> T {
        self.unlock.unlock();
        self.return_value
    }
}

/// Run `f` with `blocks` locked.
///
/// Invalid blocks are ignored. If `f` fails the lock is released before the
/// error is returned, regardless of `automatically_unlock`.
pub async fn with_lock<T, E, F, Fut>(
    engine: Arc<dyn EngineApi>,
    blocks: &[BlockId],
    options: &LockOptions,
    f: F,
) -> Result<Locked<T>, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let targets: Vec<BlockId> = blocks
        .iter()
        .copied()
        .filter(|b| engine.is_valid(*b))
        .collect();

    let pending = PendingGuard::new(&engine, &targets, options.pending_state);
    let unlock = UnlockHandle::new(LockRecord::acquire(&engine, &targets, options));
    tracing::debug!(blocks = targets.len(), lock = options.lock, "lock acquired");

    let result = f().await;
    drop(pending);

    match result {
        Ok(return_value) => {
            if options.automatically_unlock {
                unlock.unlock();
            }
            Ok(Locked {
                return_value,
                unlock,
            })
        }
        Err(e) => {
            unlock.unlock();
            Err(e)
        }
    }
}
