use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{
    BlockId, BlockState, EngineApi, EngineEvent, EngineListener, FillId, FillSource, HistoryId,
    SELECT_SCOPE, ScopePermission, SubscriptionId,
};
use crate::error::EngineError;

const DEFAULT_EDIT_MODE: &str = "Transform";

#[derive(Debug, Default)]
struct BlockRecord {
    state: BlockState,
    parent: Option<BlockId>,
    fill: Option<FillId>,
    clipped: bool,
    always_on_top: bool,
    metadata: HashMap<String, String>,
}

#[derive(Default)]
struct EngineState {
    next_id: u64,
    blocks: HashMap<BlockId, BlockRecord>,
    fills: HashMap<FillId, FillSource>,
    selection: Vec<BlockId>,
    scopes: HashMap<String, ScopePermission>,
    edit_mode: String,
    histories: HashMap<HistoryId, usize>,
    active_history: HistoryId,
    listeners: Vec<(SubscriptionId, EngineListener)>,
}

impl EngineState {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn block(&self, block: BlockId) -> Result<&BlockRecord, EngineError> {
        self.blocks.get(&block).ok_or(EngineError::InvalidBlock(block))
    }

    fn block_mut(&mut self, block: BlockId) -> Result<&mut BlockRecord, EngineError> {
        self.blocks
            .get_mut(&block)
            .ok_or(EngineError::InvalidBlock(block))
    }
}

/// In-process engine with a flat block table.
///
/// Besides the [`EngineApi`] surface it exposes the user-facing operations
/// (`user_select`, `user_set_edit_mode`) that respect scopes the way an
/// interactive editor does, plus inspection helpers for tests.
pub struct MemoryEngine {
    state: Mutex<EngineState>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        let mut state = EngineState {
            edit_mode: DEFAULT_EDIT_MODE.to_string(),
            ..Default::default()
        };
        let history = HistoryId(state.allocate());
        state.histories.insert(history, 0);
        state.active_history = history;
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        // Poisoning is ignored: the state holds no invariants a panic can break.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: EngineEvent) {
        let listeners: Vec<EngineListener> = self
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }

    pub fn create_block(&self, parent: Option<BlockId>) -> BlockId {
        let mut state = self.lock();
        let id = BlockId(state.allocate());
        state.blocks.insert(
            id,
            BlockRecord {
                parent,
                ..Default::default()
            },
        );
        id
    }

    /// Attach a fresh fill to `block`, replacing any previous fill identity.
    pub fn create_fill(&self, block: BlockId, source: FillSource) -> Result<FillId, EngineError> {
        let mut state = self.lock();
        let id = FillId(state.allocate());
        let previous = state.block_mut(block)?.fill.replace(id);
        if let Some(previous) = previous {
            state.fills.remove(&previous);
        }
        state.fills.insert(id, source);
        Ok(id)
    }

    pub fn destroy_block(&self, block: BlockId) {
        let removed = {
            let mut state = self.lock();
            let Some(record) = state.blocks.remove(&block) else {
                return;
            };
            if let Some(fill) = record.fill {
                state.fills.remove(&fill);
            }
            let before = state.selection.len();
            state.selection.retain(|b| *b != block);
            before != state.selection.len()
        };
        if removed {
            self.emit(EngineEvent::SelectionChanged);
        }
    }

    /// Selection change initiated by the user. Refused while the select scope
    /// is denied.
    pub fn user_select(&self, blocks: &[BlockId]) -> bool {
        if self.global_scope(SELECT_SCOPE) == ScopePermission::Deny {
            return false;
        }
        self.set_selection(blocks);
        true
    }

    /// Edit-mode change initiated by the user.
    pub fn user_set_edit_mode(&self, mode: &str) {
        self.set_edit_mode(mode);
    }

    pub fn undo_steps(&self, history: HistoryId) -> Option<usize> {
        self.lock().histories.get(&history).copied()
    }

    pub fn history_count(&self) -> usize {
        self.lock().histories.len()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}

impl EngineApi for MemoryEngine {
    fn is_valid(&self, block: BlockId) -> bool {
        self.lock().blocks.contains_key(&block)
    }

    fn block_state(&self, block: BlockId) -> Result<BlockState, EngineError> {
        Ok(self.lock().block(block)?.state)
    }

    fn set_block_state(&self, block: BlockId, state: BlockState) -> Result<(), EngineError> {
        self.lock().block_mut(block)?.state = state;
        Ok(())
    }

    fn selection(&self) -> Vec<BlockId> {
        self.lock().selection.clone()
    }

    fn set_selection(&self, blocks: &[BlockId]) {
        {
            let mut state = self.lock();
            let selection: Vec<BlockId> = blocks
                .iter()
                .copied()
                .filter(|b| state.blocks.contains_key(b))
                .collect();
            state.selection = selection;
        }
        self.emit(EngineEvent::SelectionChanged);
    }

    fn global_scope(&self, scope: &str) -> ScopePermission {
        self.lock().scopes.get(scope).copied().unwrap_or_default()
    }

    fn set_global_scope(&self, scope: &str, permission: ScopePermission) {
        self.lock().scopes.insert(scope.to_string(), permission);
    }

    fn edit_mode(&self) -> String {
        self.lock().edit_mode.clone()
    }

    fn set_edit_mode(&self, mode: &str) {
        self.lock().edit_mode = mode.to_string();
        self.emit(EngineEvent::EditModeChanged);
    }

    fn create_history(&self) -> HistoryId {
        let mut state = self.lock();
        let id = HistoryId(state.allocate());
        state.histories.insert(id, 0);
        id
    }

    fn destroy_history(&self, history: HistoryId) {
        let mut state = self.lock();
        if state.active_history != history {
            state.histories.remove(&history);
        }
    }

    fn active_history(&self) -> HistoryId {
        self.lock().active_history
    }

    fn set_active_history(&self, history: HistoryId) -> Result<(), EngineError> {
        let mut state = self.lock();
        if !state.histories.contains_key(&history) {
            return Err(EngineError::UnknownHistory(history));
        }
        state.active_history = history;
        Ok(())
    }

    fn add_undo_step(&self) {
        let mut state = self.lock();
        let active = state.active_history;
        if let Some(steps) = state.histories.get_mut(&active) {
            *steps += 1;
        }
    }

    fn fill(&self, block: BlockId) -> Result<Option<FillId>, EngineError> {
        Ok(self.lock().block(block)?.fill)
    }

    fn fill_source(&self, fill: FillId) -> Result<FillSource, EngineError> {
        self.lock()
            .fills
            .get(&fill)
            .cloned()
            .ok_or(EngineError::UnknownFill(fill))
    }

    fn set_fill_source(&self, fill: FillId, source: FillSource) -> Result<(), EngineError> {
        let mut state = self.lock();
        let slot = state
            .fills
            .get_mut(&fill)
            .ok_or(EngineError::UnknownFill(fill))?;
        *slot = source;
        Ok(())
    }

    fn parent(&self, block: BlockId) -> Result<Option<BlockId>, EngineError> {
        Ok(self.lock().block(block)?.parent)
    }

    fn clipped(&self, block: BlockId) -> Result<bool, EngineError> {
        Ok(self.lock().block(block)?.clipped)
    }

    fn set_clipped(&self, block: BlockId, clipped: bool) -> Result<(), EngineError> {
        self.lock().block_mut(block)?.clipped = clipped;
        Ok(())
    }

    fn always_on_top(&self, block: BlockId) -> Result<bool, EngineError> {
        Ok(self.lock().block(block)?.always_on_top)
    }

    fn set_always_on_top(&self, block: BlockId, on_top: bool) -> Result<(), EngineError> {
        self.lock().block_mut(block)?.always_on_top = on_top;
        Ok(())
    }

    fn metadata(&self, block: BlockId, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.lock().block(block)?.metadata.get(key).cloned())
    }

    fn set_metadata(&self, block: BlockId, key: &str, value: &str) -> Result<(), EngineError> {
        self.lock()
            .block_mut(block)?
            .metadata
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_metadata(&self, block: BlockId, key: &str) -> Result<(), EngineError> {
        self.lock().block_mut(block)?.metadata.remove(key);
        Ok(())
    }

    fn subscribe(&self, listener: EngineListener) -> SubscriptionId {
        let mut state = self.lock();
        let id = SubscriptionId(state.allocate());
        state.listeners.push((id, listener));
        id
    }

    fn unsubscribe(&self, subscription: SubscriptionId) {
        self.lock().listeners.retain(|(id, _)| *id != subscription);
    }
}
