use crate::modules::protocol::{DiffItem, ParamPatch, PresetDocument, SETTINGS_KEY};
use serde_json::{Map, Number, Value};

/// Returns a patched copy of `base`. `base` itself is never touched, so a cached
/// document can be shared across concurrent requests.
pub fn apply_patch(base: &PresetDocument, patch: &ParamPatch) -> PresetDocument {
    let mut out = base.clone();
    let root = out.as_map_mut();

    if !matches!(root.get(SETTINGS_KEY), Some(Value::Object(_))) {
        root.insert(SETTINGS_KEY.to_string(), Value::Object(Map::new()));
    }
    let Some(Value::Object(settings)) = root.get_mut(SETTINGS_KEY) else {
        return out;
    };

    for (key, value) in patch.iter() {
        if let Some(n) = Number::from_f64(value) {
            settings.insert(key.to_string(), Value::Number(n));
        }
    }
    out
}

/// Keys whose value the patch actually changes, in key order.
pub fn diff_settings(before: &PresetDocument, patch: &ParamPatch) -> Vec<DiffItem> {
    patch
        .iter()
        .filter_map(|(key, new_value)| {
            let old_value = before.setting(key);
            if old_value == Some(new_value) {
                return None;
            }
            Some(DiffItem {
                key: key.to_string(),
                old_value,
                new_value,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> PresetDocument {
        PresetDocument::from_value(v).unwrap()
    }

    fn patch(v: &[(&str, f64)]) -> ParamPatch {
        v.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn overwrites_only_patched_keys() {
        let base = doc(json!({
            "preset_name": "Glass Pad",
            "settings": {
                "filter_1_cutoff": 60.0,
                "env_1_attack": 0.2,
                "legacy_knob": "weird",
                "wavetables": [{"name": "Init", "groups": []}]
            },
            "author": "someone"
        }));
        let p = patch(&[("filter_1_cutoff", 90.0), ("reverb_dry_wet", 0.3)]);

        let out = apply_patch(&base, &p);

        assert_eq!(out.setting("filter_1_cutoff"), Some(90.0));
        assert_eq!(out.setting("reverb_dry_wet"), Some(0.3));
        assert_eq!(out.setting("env_1_attack"), Some(0.2));
        let settings = out.settings().unwrap();
        assert_eq!(settings["legacy_knob"], json!("weird"));
        assert_eq!(settings["wavetables"], base.settings().unwrap()["wavetables"]);
        assert_eq!(out.as_map()["preset_name"], json!("Glass Pad"));
        assert_eq!(out.as_map()["author"], json!("someone"));
    }

    #[test]
    fn never_mutates_input_and_is_repeatable() {
        let base = doc(json!({"settings": {"osc_1_level": 0.7}}));
        let snapshot = base.clone();
        let p = patch(&[("osc_1_level", 0.1)]);

        let a = apply_patch(&base, &p);
        let b = apply_patch(&base, &p);

        assert_eq!(a, b);
        assert_eq!(base, snapshot);
        assert_eq!(base.setting("osc_1_level"), Some(0.7));
    }

    #[test]
    fn idempotent() {
        let base = doc(json!({"settings": {"a": 1.0, "b": 2.0}}));
        let p = patch(&[("a", 5.0)]);
        let once = apply_patch(&base, &p);
        let twice = apply_patch(&once, &p);
        assert_eq!(once, twice);
    }

    #[test]
    fn creates_settings_when_missing_or_malformed() {
        let empty = apply_patch(&PresetDocument::new(), &patch(&[]));
        assert_eq!(empty.settings(), Some(&Map::new()));

        let malformed = doc(json!({"settings": [1, 2, 3], "name": "x"}));
        let out = apply_patch(&malformed, &patch(&[("volume", 0.5)]));
        assert_eq!(out.setting("volume"), Some(0.5));
        assert_eq!(out.settings().unwrap().len(), 1);
        assert_eq!(out.as_map()["name"], json!("x"));
    }

    #[test]
    fn preserves_top_level_key_order() {
        let base = doc(json!({"z_first": 1, "settings": {}, "a_last": 2}));
        let out = apply_patch(&base, &patch(&[("volume", 0.5)]));
        let keys: Vec<_> = out.as_map().keys().cloned().collect();
        assert_eq!(keys, vec!["z_first", "settings", "a_last"]);
    }

    #[test]
    fn diff_lists_only_real_changes() {
        let base = doc(json!({"settings": {"a": 1.0, "b": 2.0, "s": "text"}}));
        let d = diff_settings(&base, &patch(&[("a", 1.0), ("b", 3.0), ("c", 0.5), ("s", 1.0)]));
        assert_eq!(
            d,
            vec![
                DiffItem { key: "b".into(), old_value: Some(2.0), new_value: 3.0 },
                DiffItem { key: "c".into(), old_value: None, new_value: 0.5 },
                DiffItem { key: "s".into(), old_value: None, new_value: 1.0 },
            ]
        );
    }
}
