//! Property-based tests for patch coercion and application.
//!
//! Presets are arbitrary JSON objects (including malformed `settings`), patches
//! are arbitrary finite maps, and raw model output is any JSON object.

use brain_core::coercion::coerce_patch;
use brain_core::patcher::{apply_patch, diff_settings};
use brain_core::protocol::{ParamPatch, PresetDocument, SETTINGS_KEY};
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Small key space so patches and presets overlap often.
const KEY: &str = "[a-c][0-9]";

fn arb_json() -> BoxedStrategy<Value> {
    let text = prop_oneof![
        any::<String>(),
        prop::sample::select(vec!["0.5", " -3 ", "1e999", "inf", "NaN", "loud", ""])
            .prop_map(String::from),
    ];
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        any::<f64>().prop_map(Value::from),
        text.prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(KEY, inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
    .boxed()
}

fn arb_preset() -> impl Strategy<Value = PresetDocument> {
    let settings = prop_oneof![
        Just(None),
        prop::collection::btree_map(KEY, arb_json(), 0..10)
            .prop_map(|m| Some(Value::Object(m.into_iter().collect()))),
        arb_json().prop_map(Some),
    ];
    (prop::collection::btree_map("[a-z]{1,6}", arb_json(), 0..4), settings).prop_map(
        |(top, settings)| {
            let mut map: Map<String, Value> = top.into_iter().collect();
            if let Some(s) = settings {
                map.insert(SETTINGS_KEY.to_string(), s);
            }
            PresetDocument::from_map(map)
        },
    )
}

fn arb_patch() -> impl Strategy<Value = ParamPatch> {
    prop::collection::btree_map(KEY, prop_oneof![-1e9f64..1e9, any::<f64>()], 0..8)
        .prop_map(|m| m.into_iter().collect::<ParamPatch>())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Every patched key reads back exactly; every other setting is unchanged.
    #[test]
    fn apply_sets_patched_keys_and_keeps_the_rest(doc in arb_preset(), patch in arb_patch()) {
        let out = apply_patch(&doc, &patch);
        let settings = out.settings();
        prop_assert!(settings.is_some(), "settings must be an object after apply");
        let settings = settings.unwrap();

        for (key, value) in patch.iter() {
            prop_assert_eq!(settings.get(key).and_then(Value::as_f64), Some(value));
        }

        if let Some(before) = doc.settings() {
            for (key, old) in before {
                if !patch.contains_key(key) {
                    prop_assert_eq!(settings.get(key), Some(old));
                }
            }
            prop_assert!(settings.keys().all(|k| before.contains_key(k) || patch.contains_key(k)));
        } else {
            prop_assert_eq!(settings.len(), patch.len());
        }

        for (key, value) in doc.as_map() {
            if key != SETTINGS_KEY {
                prop_assert_eq!(out.as_map().get(key), Some(value));
            }
        }
    }

    #[test]
    fn apply_never_mutates_its_input(doc in arb_preset(), patch in arb_patch()) {
        let before = doc.clone();
        let _ = apply_patch(&doc, &patch);
        prop_assert_eq!(doc, before);
    }

    #[test]
    fn apply_is_idempotent(doc in arb_preset(), patch in arb_patch()) {
        let once = apply_patch(&doc, &patch);
        let twice = apply_patch(&once, &patch);
        prop_assert_eq!(twice, once);
    }

    /// The diff lists exactly the keys whose value changes.
    #[test]
    fn diff_matches_applied_changes(doc in arb_preset(), patch in arb_patch()) {
        let diff = diff_settings(&doc, &patch);
        for item in &diff {
            prop_assert_eq!(patch.get(&item.key), Some(item.new_value));
            prop_assert_ne!(item.old_value, Some(item.new_value));
        }
        let unchanged = patch.iter().filter(|(k, v)| doc.setting(k) == Some(*v)).count();
        prop_assert_eq!(diff.len() + unchanged, patch.len());
    }

    /// Any raw map splits into finite values and diagnostics, one per key.
    #[test]
    fn coercion_is_total_and_finite(
        raw in prop::collection::btree_map(KEY, arb_json(), 0..10)
            .prop_map(|m| m.into_iter().collect::<Map<String, Value>>())
    ) {
        let outcome = coerce_patch(&raw);
        prop_assert!(outcome.patch.iter().all(|(_, v)| v.is_finite()));
        prop_assert_eq!(outcome.patch.len() + outcome.diagnostics.len(), raw.len());

        for (key, value) in &raw {
            let kept = outcome.patch.contains_key(key);
            let dropped = outcome.diagnostics.iter().any(|d| d.key() == key);
            prop_assert!(kept != dropped, "{key} must be kept or dropped, not both");
            if let Value::Bool(b) = value {
                prop_assert_eq!(outcome.patch.get(key), Some(if *b { 1.0 } else { 0.0 }));
            }
        }
    }
}
