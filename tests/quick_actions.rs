//! Tests for merging provider quick actions with deployment settings.

use std::sync::Arc;

use gencore::error::GenError;
use gencore::quick_actions::{
    QuickAction, QuickActionConfig, QuickActionMap, QuickActionSetting, QuickActionSettings,
    merge_quick_actions, settings_from_json,
};

fn config(label: &str) -> QuickActionConfig {
    QuickActionConfig {
        label: Some(label.to_string()),
        prompt: None,
    }
}

fn defaults() -> QuickActionMap<QuickActionConfig> {
    let mut map = QuickActionMap::new();
    map.insert("remove-background".to_string(), QuickAction::Enabled);
    map.insert(
        "vectorize".to_string(),
        QuickAction::configured(config("Vectorize")),
    );
    map.insert(
        "upscale".to_string(),
        QuickAction::configured(config("Upscale")),
    );
    map
}

fn ptr_eq(a: &QuickAction<QuickActionConfig>, b: &QuickAction<QuickActionConfig>) -> bool {
    match (a.config(), b.config()) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[test]
fn empty_settings_keep_defaults_by_identity() {
    let defaults = defaults();
    let merged = merge_quick_actions(&defaults, &QuickActionSettings::new());

    assert_eq!(merged.len(), 3);
    assert!(ptr_eq(&merged["vectorize"], &defaults["vectorize"]));
    assert!(ptr_eq(&merged["upscale"], &defaults["upscale"]));
    assert!(matches!(merged["remove-background"], QuickAction::Enabled));
}

#[test]
fn remove_deletes_entry() {
    let defaults = defaults();
    let mut settings = QuickActionSettings::new();
    settings.insert("vectorize".to_string(), QuickActionSetting::Remove);
    settings.insert("never-existed".to_string(), QuickActionSetting::Remove);

    let merged = merge_quick_actions(&defaults, &settings);
    assert!(!merged.contains_key("vectorize"));
    assert!(!merged.contains_key("never-existed"));
    assert_eq!(merged.len(), 2);
}

#[test]
fn keep_preserves_default_or_enables() {
    let defaults = defaults();
    let mut settings = QuickActionSettings::new();
    settings.insert("upscale".to_string(), QuickActionSetting::Keep);
    settings.insert("style-transfer".to_string(), QuickActionSetting::Keep);

    let merged = merge_quick_actions(&defaults, &settings);
    assert!(ptr_eq(&merged["upscale"], &defaults["upscale"]));
    assert!(matches!(merged["style-transfer"], QuickAction::Enabled));
}

#[test]
fn override_replaces_wholesale_and_shares_arc() {
    let defaults = defaults();
    let replacement = Arc::new(QuickActionConfig {
        label: None,
        prompt: Some("flat vector art".to_string()),
    });
    let mut settings = QuickActionSettings::new();
    settings.insert(
        "vectorize".to_string(),
        QuickActionSetting::Override(replacement.clone()),
    );

    let merged = merge_quick_actions(&defaults, &settings);
    let merged_config = merged["vectorize"].config().unwrap();
    assert!(Arc::ptr_eq(merged_config, &replacement));
    // Not a field-wise merge: the default label is gone.
    assert_eq!(merged_config.label, None);
}

#[test]
fn inputs_are_not_modified() {
    let defaults = defaults();
    let mut settings = QuickActionSettings::new();
    settings.insert("vectorize".to_string(), QuickActionSetting::Remove);
    settings.insert(
        "upscale".to_string(),
        QuickActionSetting::Override(Arc::new(config("Bigger"))),
    );

    let _ = merge_quick_actions(&defaults, &settings);
    assert_eq!(defaults.len(), 3);
    assert_eq!(
        defaults["upscale"].config().unwrap().label.as_deref(),
        Some("Upscale")
    );
    assert_eq!(settings.len(), 2);
}

// ---------------------------------------------------------------------------
// Loose input
// ---------------------------------------------------------------------------

#[test]
fn json_settings_translate_to_tagged_form() {
    let settings: QuickActionSettings<QuickActionConfig> = settings_from_json(serde_json::json!({
        "remove-background": true,
        "vectorize": false,
        "upscale": null,
        "style-transfer": { "label": "Restyle" }
    }))
    .unwrap();

    assert!(matches!(settings["remove-background"], QuickActionSetting::Keep));
    assert!(matches!(settings["vectorize"], QuickActionSetting::Remove));
    assert!(matches!(settings["upscale"], QuickActionSetting::Remove));
    match &settings["style-transfer"] {
        QuickActionSetting::Override(config) => {
            assert_eq!(config.label.as_deref(), Some("Restyle"));
        }
        other => panic!("expected Override, got {other:?}"),
    }

    let merged = merge_quick_actions(&defaults(), &settings);
    let mut ids: Vec<&str> = merged.keys().map(String::as_str).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["remove-background", "style-transfer"]);
}

#[test]
fn non_object_settings_are_rejected() {
    let err = settings_from_json::<QuickActionConfig>(serde_json::json!([true])).unwrap_err();
    assert!(matches!(err, GenError::Config(_)));
}
