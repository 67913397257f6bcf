//! Tests for `with_lock`: snapshot, force and exactly-once restoration of
//! selection, edit mode, undo history and visual flags.

use std::sync::Arc;

use gencore::engine::{
    BlockId, BlockState, EngineApi, MemoryEngine, SELECT_SCOPE, ScopePermission,
};
use gencore::error::GenError;
use gencore::lock::{LockOptions, with_lock};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Scene {
    memory: Arc<MemoryEngine>,
    engine: Arc<dyn EngineApi>,
    page: BlockId,
    target: BlockId,
    other: BlockId,
}

/// A page holding two blocks, with `other` selected and the page clipping.
fn scene() -> Scene {
    let memory = Arc::new(MemoryEngine::new());
    let page = memory.create_block(None);
    let target = memory.create_block(Some(page));
    let other = memory.create_block(Some(page));
    memory.set_clipped(page, true).unwrap();
    memory.set_selection(&[other]);
    memory.set_edit_mode("Crop");
    let engine: Arc<dyn EngineApi> = memory.clone();
    Scene {
        memory,
        engine,
        page,
        target,
        other,
    }
}

fn assert_restored(scene: &Scene, history_before: gencore::engine::HistoryId) {
    let engine = &scene.engine;
    assert_eq!(engine.selection(), vec![scene.other]);
    assert_eq!(engine.edit_mode(), "Crop");
    assert_eq!(engine.global_scope(SELECT_SCOPE), ScopePermission::Allow);
    assert_eq!(engine.active_history(), history_before);
    assert_eq!(engine.clipped(scene.page), Ok(true));
    assert_eq!(engine.always_on_top(scene.target), Ok(false));
    assert_eq!(engine.block_state(scene.target), Ok(BlockState::Ready));
    assert_eq!(scene.memory.history_count(), 1);
    assert_eq!(scene.memory.listener_count(), 0);
}

// ---------------------------------------------------------------------------
// Acquire and restore
// ---------------------------------------------------------------------------

#[tokio::test]
async fn state_is_forced_while_locked_and_restored_after() {
    let scene = scene();
    let history_before = scene.engine.active_history();
    let inner = scene.engine.clone();
    let target = scene.target;

    let locked = with_lock(
        scene.engine.clone(),
        &[target],
        &LockOptions::default(),
        move || async move {
            assert_eq!(inner.selection(), vec![target]);
            assert_eq!(inner.edit_mode(), "Transform");
            assert_eq!(inner.global_scope(SELECT_SCOPE), ScopePermission::Deny);
            assert_ne!(inner.active_history(), history_before);
            assert_eq!(inner.block_state(target), Ok(BlockState::Pending));
            assert_eq!(inner.always_on_top(target), Ok(true));
            Ok::<_, GenError>("done")
        },
    )
    .await
    .unwrap();

    assert_eq!(locked.return_value, "done");
    assert!(!locked.unlock.is_locked());
    assert_restored(&scene, history_before);
}

#[tokio::test]
async fn parents_stop_clipping_while_locked() {
    let scene = scene();
    let inner = scene.engine.clone();
    let page = scene.page;

    with_lock(
        scene.engine.clone(),
        &[scene.target, scene.other],
        &LockOptions::default(),
        move || async move {
            assert_eq!(inner.clipped(page), Ok(false));
            Ok::<_, GenError>(())
        },
    )
    .await
    .unwrap();

    assert_eq!(scene.engine.clipped(scene.page), Ok(true));
}

#[tokio::test]
async fn failure_restores_and_propagates() {
    let scene = scene();
    let history_before = scene.engine.active_history();

    let result = with_lock(
        scene.engine.clone(),
        &[scene.target],
        &LockOptions {
            automatically_unlock: false,
            ..LockOptions::default()
        },
        || async { Err::<(), _>(GenError::generation("vendor", "boom")) },
    )
    .await;

    let err = tokio_test::assert_err!(result);
    assert!(matches!(err, GenError::Generation { .. }));
    assert_restored(&scene, history_before);
}

#[tokio::test]
async fn undo_steps_land_in_isolated_history() {
    let scene = scene();
    let history_before = scene.engine.active_history();
    let inner = scene.engine.clone();

    with_lock(
        scene.engine.clone(),
        &[scene.target],
        &LockOptions::default(),
        move || async move {
            inner.add_undo_step();
            inner.add_undo_step();
            Ok::<_, GenError>(())
        },
    )
    .await
    .unwrap();

    assert_eq!(scene.memory.undo_steps(history_before), Some(0));
    assert_eq!(scene.memory.history_count(), 1);
}

#[tokio::test]
async fn disabled_options_leave_state_untouched() {
    let scene = scene();
    let history_before = scene.engine.active_history();
    let inner = scene.engine.clone();
    let (target, other, page) = (scene.target, scene.other, scene.page);
    let options = LockOptions {
        pending_state: false,
        always_on_top: false,
        disable_clipping: false,
        lock: false,
        ..LockOptions::default()
    };

    with_lock(scene.engine.clone(), &[target], &options, move || async move {
        assert_eq!(inner.selection(), vec![other]);
        assert_eq!(inner.edit_mode(), "Crop");
        assert_eq!(inner.active_history(), history_before);
        assert_eq!(inner.block_state(target), Ok(BlockState::Ready));
        assert_eq!(inner.clipped(page), Ok(true));
        Ok::<_, GenError>(())
    })
    .await
    .unwrap();

    assert_restored(&scene, history_before);
}

// ---------------------------------------------------------------------------
// Re-assertion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn user_changes_are_undone_while_locked() {
    let scene = scene();
    let memory = scene.memory.clone();
    let (target, other) = (scene.target, scene.other);

    with_lock(
        scene.engine.clone(),
        &[target],
        &LockOptions::default(),
        move || async move {
            assert!(!memory.user_select(&[other]));
            // Engine-level selection bypasses the scope; the listener pins it back.
            memory.set_selection(&[other]);
            assert_eq!(memory.selection(), vec![target]);

            memory.user_set_edit_mode("Text");
            assert_eq!(memory.edit_mode(), "Transform");
            Ok::<_, GenError>(())
        },
    )
    .await
    .unwrap();

    assert_eq!(scene.engine.edit_mode(), "Crop");
    assert!(scene.memory.user_select(&[target]));
}

#[tokio::test]
async fn invalid_blocks_are_ignored() {
    let scene = scene();
    let ghost = scene.memory.create_block(None);
    scene.memory.destroy_block(ghost);
    let inner = scene.engine.clone();
    let target = scene.target;

    with_lock(
        scene.engine.clone(),
        &[ghost, target],
        &LockOptions::default(),
        move || async move {
            assert_eq!(inner.selection(), vec![target]);
            Ok::<_, GenError>(())
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn block_destroyed_while_locked_is_skipped_on_restore() {
    let scene = scene();
    let memory = scene.memory.clone();
    let other = scene.other;

    with_lock(
        scene.engine.clone(),
        &[scene.target],
        &LockOptions::default(),
        move || async move {
            memory.destroy_block(other);
            Ok::<_, GenError>(())
        },
    )
    .await
    .unwrap();

    assert!(scene.engine.selection().is_empty());
    assert_eq!(scene.memory.listener_count(), 0);
}

// ---------------------------------------------------------------------------
// Manual unlock
// ---------------------------------------------------------------------------

#[tokio::test]
async fn manual_unlock_restores_exactly_once() {
    let scene = scene();
    let history_before = scene.engine.active_history();

    let locked = with_lock(
        scene.engine.clone(),
        &[scene.target],
        &LockOptions {
            automatically_unlock: false,
            ..LockOptions::default()
        },
        || async { Ok::<_, GenError>(7) },
    )
    .await
    .unwrap();

    // Still locked, but no longer pending.
    assert!(locked.unlock.is_locked());
    assert_eq!(scene.engine.selection(), vec![scene.target]);
    assert_eq!(scene.engine.block_state(scene.target), Ok(BlockState::Ready));

    assert!(locked.unlock.unlock());
    assert_restored(&scene, history_before);

    // A change made after unlocking must survive further unlocks and the drop.
    scene.engine.set_edit_mode("Vector");
    assert!(!locked.unlock.unlock());
    assert_eq!(locked.into_value(), 7);
    assert_eq!(scene.engine.edit_mode(), "Vector");
}

#[tokio::test]
async fn dropping_the_handle_unlocks() {
    let scene = scene();
    let history_before = scene.engine.active_history();

    let locked = with_lock(
        scene.engine.clone(),
        &[scene.target],
        &LockOptions {
            automatically_unlock: false,
            ..LockOptions::default()
        },
        || async { Ok::<_, GenError>(()) },
    )
    .await
    .unwrap();
    assert_eq!(scene.memory.listener_count(), 1);

    drop(locked);
    assert_restored(&scene, history_before);
}

#[tokio::test]
async fn dropped_future_restores_pending_state() {
    let scene = scene();
    let history_before = scene.engine.active_history();

    let targets = [scene.target];
    let options = LockOptions::default();
    let future = with_lock(
        scene.engine.clone(),
        &targets,
        &options,
        || async {
            std::future::pending::<()>().await;
            Ok::<_, GenError>(())
        },
    );
    let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), future).await;
    assert!(timed_out.is_err());

    assert_restored(&scene, history_before);
}
