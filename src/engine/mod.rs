//! Capability interface of the host editing engine.
//!
//! The orchestration core never owns the scene graph. Everything it needs from
//! the editor goes through [`EngineApi`], which the host implements on top of
//! its own engine handle. [`MemoryEngine`] is a self-contained implementation
//! for tests and the demo binary.

mod memory;

pub use memory::MemoryEngine;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

macro_rules! engine_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

engine_id!(
    /// A design block in the scene.
    BlockId
);
engine_id!(
    /// The fill attached to a block. A new fill id means a new fill identity.
    FillId
);
engine_id!(
    /// An undo history stack.
    HistoryId
);
engine_id!(SubscriptionId);

/// Global scope controlling whether selection may change.
pub const SELECT_SCOPE: &str = "editor/select";

/// Visual state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    #[default]
    Ready,
    Pending,
    Error,
}

/// Permission value of a global scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopePermission {
    #[default]
    Allow,
    Deny,
    Defer,
}

/// One image source of a fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub uri: String,
    pub width: u32,
    pub height: u32,
}

/// Source data of a fill. An empty source set renders as a loading state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FillSource {
    pub sources: Vec<Source>,
}

impl FillSource {
    pub fn from_uri(uri: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            sources: vec![Source {
                uri: uri.into(),
                width,
                height,
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Changes the engine broadcasts to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    SelectionChanged,
    EditModeChanged,
}

pub type EngineListener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Everything the orchestration core consumes from the host engine.
///
/// Calls are synchronous: the engine runs on the same task as the caller and
/// never suspends. Listeners must be invoked without holding internal locks,
/// because they call back into the engine.
pub trait EngineApi: Send + Sync {
    fn is_valid(&self, block: BlockId) -> bool;

    fn block_state(&self, block: BlockId) -> Result<BlockState, EngineError>;
    fn set_block_state(&self, block: BlockId, state: BlockState) -> Result<(), EngineError>;

    fn selection(&self) -> Vec<BlockId>;
    /// Select exactly `blocks`. Engine-level calls ignore scope permissions.
    fn set_selection(&self, blocks: &[BlockId]);

    fn global_scope(&self, scope: &str) -> ScopePermission;
    fn set_global_scope(&self, scope: &str, permission: ScopePermission);

    fn edit_mode(&self) -> String;
    fn set_edit_mode(&self, mode: &str);

    fn create_history(&self) -> HistoryId;
    fn destroy_history(&self, history: HistoryId);
    fn active_history(&self) -> HistoryId;
    fn set_active_history(&self, history: HistoryId) -> Result<(), EngineError>;
    fn add_undo_step(&self);

    fn fill(&self, block: BlockId) -> Result<Option<FillId>, EngineError>;
    fn fill_source(&self, fill: FillId) -> Result<FillSource, EngineError>;
    fn set_fill_source(&self, fill: FillId, source: FillSource) -> Result<(), EngineError>;

    fn parent(&self, block: BlockId) -> Result<Option<BlockId>, EngineError>;
    fn clipped(&self, block: BlockId) -> Result<bool, EngineError>;
    fn set_clipped(&self, block: BlockId, clipped: bool) -> Result<(), EngineError>;
    fn always_on_top(&self, block: BlockId) -> Result<bool, EngineError>;
    fn set_always_on_top(&self, block: BlockId, on_top: bool) -> Result<(), EngineError>;

    fn metadata(&self, block: BlockId, key: &str) -> Result<Option<String>, EngineError>;
    fn set_metadata(&self, block: BlockId, key: &str, value: &str) -> Result<(), EngineError>;
    fn remove_metadata(&self, block: BlockId, key: &str) -> Result<(), EngineError>;

    fn subscribe(&self, listener: EngineListener) -> SubscriptionId;
    fn unsubscribe(&self, subscription: SubscriptionId);
}
