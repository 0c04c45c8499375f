//! Parameter patch + node bypass semantics (§4.10 "Patch semantics"),
//! grounded directly on the source's `parameter_patcher.py`: bypass first,
//! then two patch passes (exposed-parameter defaults/overrides, then direct
//! `"node_id:field_name"` overrides with a safety check).

use crate::models::{ApiForm, ExposedParameter};

/// Remove bypassed nodes and strip any remaining input value that still
/// points at one (ComfyUI links are `[node_id, output_index]` pairs).
pub fn apply_node_bypass(api_json: &mut ApiForm, bypassed_nodes: &[String]) {
    for id in bypassed_nodes {
        api_json.remove(id);
    }
    for node in api_json.values_mut() {
        node.inputs.retain(|_, value| !points_at_bypassed(value, bypassed_nodes));
    }
}

fn points_at_bypassed(value: &serde_json::Value, bypassed_nodes: &[String]) -> bool {
    let Some(arr) = value.as_array() else { return false };
    let Some(target_id) = arr.first().and_then(|v| v.as_str()) else { return false };
    bypassed_nodes.iter().any(|id| id == target_id)
}

/// Effective value for one exposed parameter: the caller-supplied value
/// (keyed by id, then by field-name), else the declared default.
fn value_for_parameter(
    parameter: &ExposedParameter,
    parameter_values: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
    parameter_values
        .get(&parameter.id)
        .or_else(|| parameter_values.get(&parameter.field_name))
        .cloned()
        .unwrap_or_else(|| parameter.default_value.clone())
}

/// Patch `api_json` in place: first every exposed parameter gets its
/// effective value, then any `"node_id:field_name"` key in `parameter_values`
/// patches directly into that node's inputs — but only if the field already
/// existed there (the safety check from the source).
pub fn patch_parameters(
    api_json: &mut ApiForm,
    exposed_parameters: &[ExposedParameter],
    parameter_values: &serde_json::Value,
) {
    let empty = serde_json::Map::new();
    let values = parameter_values.as_object().unwrap_or(&empty);

    for parameter in exposed_parameters {
        if let Some(node) = api_json.get_mut(&parameter.node_id) {
            let effective = value_for_parameter(parameter, values);
            node.inputs.insert(parameter.field_name.clone(), effective);
        }
    }

    for (key, value) in values {
        let Some((node_id, field_name)) = key.split_once(':') else { continue };
        if let Some(node) = api_json.get_mut(node_id) {
            if node.inputs.contains_key(field_name) {
                node.inputs.insert(field_name.to_string(), value.clone());
            }
        }
    }
}

/// Inject `seed` into the canonical seed field of every node whose class
/// declares one via `seed_field_for_class`. Returns `false` if no node in
/// the workflow has a known seed field (the caller must reject the request
/// per §4.11 step 2).
pub fn inject_seed(api_json: &mut ApiForm, seed: u64, seed_field_for_class: impl Fn(&str) -> Option<&'static str>) -> bool {
    let mut injected = false;
    for node in api_json.values_mut() {
        if let Some(field) = seed_field_for_class(&node.class) {
            node.inputs.insert(field.to_string(), serde_json::json!(seed));
            injected = true;
        }
    }
    injected
}

/// Data-driven class → seed-field mapping for standard sampler classes
/// (§9 Open Question: this is intentionally configuration, not hardcoded
/// beyond the well-known defaults).
pub fn default_seed_field_for_class(class: &str) -> Option<&'static str> {
    match class {
        "KSampler" | "KSamplerAdvanced" | "SamplerCustom" => Some("seed"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ApiNode;
    use serde_json::json;

    fn workflow() -> ApiForm {
        let mut wf = ApiForm::new();
        wf.insert(
            "3".to_string(),
            ApiNode {
                class: "KSampler".to_string(),
                inputs: serde_json::Map::from_iter([
                    ("seed".to_string(), json!(0)),
                    ("steps".to_string(), json!(20)),
                ]),
            },
        );
        wf.insert(
            "6".to_string(),
            ApiNode {
                class: "CLIPTextEncode".to_string(),
                inputs: serde_json::Map::from_iter([("text".to_string(), json!(""))]),
            },
        );
        wf
    }

    #[test]
    fn patch_and_bypass_matches_spec_scenario() {
        let mut wf = workflow();
        // node 3 references node 6's output as a link before bypass.
        wf.get_mut("3").unwrap().inputs.insert("positive".to_string(), json!(["6", 0]));

        let values = json!({ "3:seed": 7, "6:text": "hi" });
        patch_parameters(&mut wf, &[], &values);
        apply_node_bypass(&mut wf, &["6".to_string()]);

        assert!(!wf.contains_key("6"));
        assert_eq!(wf["3"].inputs["seed"], json!(7));
        assert!(!wf["3"].inputs.contains_key("positive"));
    }

    #[test]
    fn direct_override_is_ignored_when_field_does_not_exist() {
        let mut wf = workflow();
        let values = json!({ "3:nonexistent_field": 999 });
        patch_parameters(&mut wf, &[], &values);
        assert!(!wf["3"].inputs.contains_key("nonexistent_field"));
    }

    #[test]
    fn exposed_parameter_falls_back_to_default() {
        let mut wf = workflow();
        let param = ExposedParameter {
            id: "p1".to_string(),
            node_id: "3".to_string(),
            field_name: "steps".to_string(),
            display_name: "Steps".to_string(),
            param_type: crate::models::ParamType::Int,
            default_value: json!(40),
            constraints: None,
            order: 0,
        };
        patch_parameters(&mut wf, std::slice::from_ref(&param), &json!({}));
        assert_eq!(wf["3"].inputs["steps"], json!(40));
    }

    #[test]
    fn inject_seed_reports_false_when_no_sampler_present() {
        let mut wf = ApiForm::new();
        wf.insert("1".to_string(), ApiNode { class: "SaveImage".to_string(), inputs: Default::default() });
        assert!(!inject_seed(&mut wf, 42, default_seed_field_for_class));
    }

    #[test]
    fn inject_seed_sets_field_on_known_sampler_class() {
        let mut wf = workflow();
        assert!(inject_seed(&mut wf, 42, default_seed_field_for_class));
        assert_eq!(wf["3"].inputs["seed"], json!(42));
    }
}
