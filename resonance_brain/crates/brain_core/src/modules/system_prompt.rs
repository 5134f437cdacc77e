use crate::modules::param_registry::ParamRegistry;
use crate::modules::protocol::{PresetDocument, SETTINGS_KEY};
use serde_json::{Map, Value};

pub const SYSTEM_PROMPT_HEADER: &str = r#"You are an expert Vital synthesizer programmer. Given a Vital preset and a user request, recommend parameter changes to achieve the described sound.

Output a single raw JSON object with two keys:
- "changes": an object mapping parameter names to their new values
- "explanation": 2-4 sentences describing what you changed and why

All values in "changes" MUST be numbers. Never use strings, booleans, or null — they will corrupt the preset.
On/off parameters: 1.0 = on, 0.0 = off. Mode/type selectors: use numeric index (0.0, 1.0, 2.0 …).
Only use parameter names from the provided list."#;

const PARAMETER_SECTION_INTRO: &str = "## Available Parameters
The following is the exhaustive list of parameters you are allowed to read and modify. Do not use any parameter not on this list:";

const NO_PRESET_CONTEXT: &str = "(no existing preset: start from Vital's default init patch)";

pub fn build_system_prompt(registry: &ParamRegistry) -> String {
    format!(
        "{SYSTEM_PROMPT_HEADER}\n\n{PARAMETER_SECTION_INTRO}\n\n{}\n",
        registry.prompt_block()
    )
}

pub fn build_user_prompt(
    description: &str,
    preset: Option<&PresetDocument>,
    max_context_chars: usize,
) -> String {
    let context = match preset {
        Some(doc) => truncate_chars(&preset_context(doc), max_context_chars),
        None => NO_PRESET_CONTEXT.to_string(),
    };

    format!(
        r#"Here is a Vital preset to modify:

{context}

User request: {description}

What would you recommend changing about this preset to achieve the requested sound? Output your response as a raw JSON object of parameter changes and an explanation. No markdown, no code fences — raw JSON only.

{{
  "changes": {{
    "parameter_name": 0.0
  }},
  "explanation": "..."
}}"#,
        description = description.trim()
    )
}

/// Pretty JSON of the parts of a preset the model can reason about: top-level
/// scalar metadata and the numeric `settings`. Wavetables, modulation routings and
/// sample data are left out.
pub fn preset_context(doc: &PresetDocument) -> String {
    let mut view = Map::new();
    for (k, v) in doc.as_map() {
        if k == SETTINGS_KEY {
            continue;
        }
        if matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
            view.insert(k.clone(), v.clone());
        }
    }

    let numeric: Map<String, Value> = doc
        .settings()
        .map(|s| {
            s.iter()
                .filter(|(_, v)| v.is_number())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();
    view.insert(SETTINGS_KEY.to_string(), Value::Object(numeric));

    serde_json::to_string_pretty(&Value::Object(view)).unwrap_or_else(|_| "{}".to_string())
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("\n…(truncated)\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_prompt_embeds_every_registry_name() {
        let reg = ParamRegistry::from_names(["filter_1_cutoff", "env_1_attack"]);
        let p = build_system_prompt(&reg);
        assert!(p.starts_with(SYSTEM_PROMPT_HEADER));
        assert!(p.contains("filter_1_cutoff\nenv_1_attack"));
        assert!(p.contains("MUST be numbers"));
    }

    #[test]
    fn user_prompt_carries_description_and_context() {
        let doc = PresetDocument::from_value(json!({
            "preset_name": "Bass",
            "settings": {"filter_1_cutoff": 0.3, "wavetables": [{"big": "blob"}]}
        }))
        .unwrap();
        let p = build_user_prompt("  make it brighter ", Some(&doc), 10_000);
        assert!(p.contains("User request: make it brighter\n"));
        assert!(p.contains("\"filter_1_cutoff\": 0.3"));
        assert!(p.contains("\"preset_name\": \"Bass\""));
        assert!(!p.contains("blob"));
        assert!(p.contains("\"changes\": {"));
    }

    #[test]
    fn user_prompt_without_preset() {
        let p = build_user_prompt("warm pad", None, 100);
        assert!(p.contains(NO_PRESET_CONTEXT));
    }

    #[test]
    fn long_context_is_truncated() {
        let settings: Map<String, Value> = (0..500).map(|i| (format!("p{i}"), json!(i))).collect();
        let doc = PresetDocument::from_map(Map::from_iter([(SETTINGS_KEY.to_string(), Value::Object(settings))]));
        let p = build_user_prompt("x", Some(&doc), 200);
        assert!(p.contains("…(truncated)"));
        assert!(!p.contains("\"p499\""));
    }
}
