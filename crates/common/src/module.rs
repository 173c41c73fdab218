// Module parameter schemas.
//
// Only the shape of parameters matters here: a step depends on another tab
// when one of its parameters is typed `tab` or `multitab`.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Float,
    Checkbox,
    Column,
    Multicolumn,
    /// Reads the output of one other tab, by slug.
    Tab,
    /// Reads the outputs of several tabs, in the given order.
    Multitab,
    /// A repeated group of child parameters (value is a JSON array of objects).
    List {
        #[serde(default)]
        child_parameters: Vec<ParamSpec>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParamSpec {
    pub id_name: String,
    #[serde(flatten)]
    pub kind: ParamKind,
}

impl ParamSpec {
    pub fn new(id_name: impl Into<String>, kind: ParamKind) -> Self {
        Self { id_name: id_name.into(), kind }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleSpec {
    pub id_name: String,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
}

impl ModuleSpec {
    /// True if any parameter, at any nesting depth, can reference a tab.
    pub fn reads_tabs(&self) -> bool {
        schema_contains_tabs(&self.parameters)
    }

    /// Collect the tab slugs `params` references through tab-typed parameters.
    ///
    /// Values of the wrong JSON type are ignored rather than rejected.
    pub fn gather_tab_slugs(&self, params: &Value) -> BTreeSet<String> {
        let mut slugs = BTreeSet::new();
        gather_into(&self.parameters, params, &mut slugs);
        slugs
    }
}

fn schema_contains_tabs(parameters: &[ParamSpec]) -> bool {
    parameters.iter().any(|param| match &param.kind {
        ParamKind::Tab | ParamKind::Multitab => true,
        ParamKind::List { child_parameters } => schema_contains_tabs(child_parameters),
        _ => false,
    })
}

fn gather_into(parameters: &[ParamSpec], params: &Value, out: &mut BTreeSet<String>) {
    for param in parameters {
        let Some(value) = params.get(&param.id_name) else {
            continue;
        };

        match &param.kind {
            ParamKind::Tab => {
                if let Some(slug) = value.as_str().filter(|slug| !slug.is_empty()) {
                    out.insert(slug.to_owned());
                }
            }
            ParamKind::Multitab => {
                if let Some(items) = value.as_array() {
                    out.extend(items.iter().filter_map(Value::as_str).map(ToOwned::to_owned));
                }
            }
            ParamKind::List { child_parameters } => {
                if let Some(items) = value.as_array() {
                    for item in items {
                        gather_into(child_parameters, item, out);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Known modules keyed by `id_name`. Steps whose module is missing are
/// treated as having no tab dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleCatalog {
    modules: HashMap<String, ModuleSpec>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: impl IntoIterator<Item = ModuleSpec>) -> Self {
        let mut catalog = Self::new();
        for spec in specs {
            catalog.insert(spec);
        }
        catalog
    }

    pub fn insert(&mut self, spec: ModuleSpec) {
        self.modules.insert(spec.id_name.clone(), spec);
    }

    pub fn get(&self, id_name: &str) -> Option<&ModuleSpec> {
        self.modules.get(id_name)
    }

    /// Tab slugs a step with this module and these params reads.
    pub fn step_tab_dependencies(&self, module_id_name: &str, params: &Value) -> BTreeSet<String> {
        match self.get(module_id_name) {
            Some(spec) if spec.reads_tabs() => spec.gather_tab_slugs(params),
            _ => BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn join_module() -> ModuleSpec {
        ModuleSpec {
            id_name: "concat".into(),
            parameters: vec![
                ParamSpec::new("tabs", ParamKind::Multitab),
                ParamSpec::new("label", ParamKind::String),
            ],
        }
    }

    #[test]
    fn gathers_multitab_slugs() {
        let slugs = join_module().gather_tab_slugs(&json!({ "tabs": ["tab-2", "tab-3"] }));
        assert_eq!(slugs.into_iter().collect::<Vec<_>>(), vec!["tab-2", "tab-3"]);
    }

    #[test]
    fn gathers_nested_list_tab_params() {
        let spec = ModuleSpec {
            id_name: "lookup".into(),
            parameters: vec![ParamSpec::new(
                "joins",
                ParamKind::List { child_parameters: vec![ParamSpec::new("right", ParamKind::Tab)] },
            )],
        };

        assert!(spec.reads_tabs());
        let slugs =
            spec.gather_tab_slugs(&json!({ "joins": [{ "right": "tab-9" }, { "right": "" }] }));
        assert_eq!(slugs.into_iter().collect::<Vec<_>>(), vec!["tab-9"]);
    }

    #[test]
    fn ignores_values_of_wrong_type() {
        let slugs = join_module().gather_tab_slugs(&json!({ "tabs": "tab-2" }));
        assert!(slugs.is_empty());
    }

    #[test]
    fn unknown_module_has_no_dependencies() {
        let catalog = ModuleCatalog::from_specs([join_module()]);
        assert!(catalog.step_tab_dependencies("missing", &json!({ "tabs": ["tab-2"] })).is_empty());
        assert_eq!(catalog.step_tab_dependencies("concat", &json!({ "tabs": ["tab-2"] })).len(), 1);
    }

    #[test]
    fn param_spec_parses_from_toml_shape() {
        let spec: ModuleSpec = serde_json::from_value(json!({
            "id_name": "concat",
            "parameters": [
                { "id_name": "tabs", "type": "multitab" },
                { "id_name": "rows", "type": "list", "child_parameters": [
                    { "id_name": "tab", "type": "tab" }
                ] }
            ]
        }))
        .expect("module spec should deserialize");

        assert_eq!(spec.parameters[0].kind, ParamKind::Multitab);
        assert!(matches!(spec.parameters[1].kind, ParamKind::List { .. }));
    }
}
