//! Plugin capability contract and the build-time descriptor registry.
//!
//! Plugins are registered explicitly at startup (no runtime discovery). The
//! registry validates every descriptor against the capability contract and
//! produces the merged function-calling schema handed to the language model.
//! Schema generation is pure and deterministic: the same registered set
//! always yields byte-identical output, which the conversation engine relies
//! on for prompt caching.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ToolError;
use crate::executor::JobSpec;
use crate::session::SessionManager;

/// Parameter types supported by the function-calling schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }

    /// Type-check a JSON value against this parameter type. Integers are
    /// accepted where a number is expected.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

/// Declaration of a single function parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub param_type: ParamType,
    pub required: bool,
    /// Applied by the dispatcher when an optional parameter is absent.
    pub default: Option<Value>,
    /// Closed set of accepted values; only meaningful for string parameters.
    pub one_of: Option<Vec<&'static str>>,
}

impl ParamSpec {
    pub fn required(name: &'static str, param_type: ParamType, description: &'static str) -> Self {
        Self {
            name,
            description,
            param_type,
            required: true,
            default: None,
            one_of: None,
        }
    }

    pub fn optional(name: &'static str, param_type: ParamType, description: &'static str) -> Self {
        Self {
            name,
            description,
            param_type,
            required: false,
            default: None,
            one_of: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_one_of(mut self, values: Vec<&'static str>) -> Self {
        self.one_of = Some(values);
        self
    }
}

/// Declaration of a callable function exposed to the language model.
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
}

/// Declarative description of a plugin and its functions. Immutable after
/// the registry is built.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub functions: Vec<FunctionSpec>,
}

/// Outcome of a plugin invocation: either a value available right away, or a
/// deferred job to be run by the executor.
pub enum Invocation {
    Immediate(Value),
    Deferred(JobSpec),
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate(value) => f.debug_tuple("Immediate").field(value).finish(),
            Self::Deferred(_) => f.debug_tuple("Deferred").finish(),
        }
    }
}

/// Per-invocation context handed to plugins. Replaces any notion of a global
/// "current connection": every call carries its own session identity.
#[derive(Clone)]
pub struct InvokeContext {
    pub session_id: Uuid,
    pub call_id: Uuid,
    /// Pre-allocated id the executor will use if the invocation defers.
    /// Lets plugins record the job against session state before it runs.
    pub job_id: Uuid,
    pub sessions: Arc<SessionManager>,
}

/// A self-contained capability module exposing one or more callable
/// functions to the dispatcher.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn descriptor(&self) -> PluginDescriptor;

    /// Execute one of the plugin's functions. Arguments have already been
    /// validated and defaulted against the matching [`FunctionSpec`].
    async fn invoke(
        &self,
        ctx: &InvokeContext,
        function: &str,
        args: Map<String, Value>,
    ) -> Result<Invocation, ToolError>;
}

struct FunctionEntry {
    plugin: Arc<dyn Plugin>,
    spec: FunctionSpec,
}

/// Registry of all validated plugins, keyed by function name.
#[derive(Default)]
pub struct Registry {
    functions: BTreeMap<&'static str, FunctionEntry>,
    plugin_names: Vec<&'static str>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin, validating its descriptor against the capability
    /// contract. Fails on a duplicate function name or a malformed parameter
    /// schema; the registry is left unchanged on failure.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), ToolError> {
        let descriptor = plugin.descriptor();
        validate_descriptor(&descriptor)?;

        for spec in &descriptor.functions {
            if self.functions.contains_key(spec.name) {
                return Err(ToolError::Registration(format!(
                    "duplicate function name '{}' (plugin '{}')",
                    spec.name, descriptor.name
                )));
            }
        }

        for spec in descriptor.functions {
            self.functions.insert(
                spec.name,
                FunctionEntry {
                    plugin: plugin.clone(),
                    spec,
                },
            );
        }
        self.plugin_names.push(descriptor.name);
        info!("registered plugin '{}'", descriptor.name);
        Ok(())
    }

    /// Register a set of plugins at startup. A plugin failing validation is
    /// skipped with a warning and degrades the tool set; it never aborts
    /// startup.
    pub fn register_all(&mut self, plugins: Vec<Arc<dyn Plugin>>) {
        for plugin in plugins {
            let name = plugin.descriptor().name;
            if let Err(e) = self.register(plugin) {
                warn!("skipping plugin '{}': {}", name, e);
            }
        }
    }

    pub fn resolve(&self, function: &str) -> Option<(Arc<dyn Plugin>, &FunctionSpec)> {
        self.functions
            .get(function)
            .map(|entry| (entry.plugin.clone(), &entry.spec))
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn plugin_count(&self) -> usize {
        self.plugin_names.len()
    }

    /// Merged function-calling schema for all registered plugins. Iteration
    /// over the ordered map plus serde_json's sorted object keys make the
    /// output deterministic for a given registered set.
    pub fn build_schema(&self) -> Value {
        let functions: Vec<Value> = self
            .functions
            .values()
            .map(|entry| function_schema(&entry.spec))
            .collect();
        json!({ "functions": functions })
    }
}

fn function_schema(spec: &FunctionSpec) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in &spec.params {
        let mut prop = Map::new();
        prop.insert("type".into(), json!(param.param_type.as_str()));
        prop.insert("description".into(), json!(param.description));
        if let Some(ref one_of) = param.one_of {
            prop.insert("enum".into(), json!(one_of));
        }
        if let Some(ref default) = param.default {
            prop.insert("default".into(), default.clone());
        }
        properties.insert(param.name.to_string(), Value::Object(prop));
        if param.required {
            required.push(param.name);
        }
    }
    json!({
        "name": spec.name,
        "description": spec.description,
        "parameters": {
            "type": "object",
            "properties": properties,
            "required": required,
        }
    })
}

fn validate_descriptor(descriptor: &PluginDescriptor) -> Result<(), ToolError> {
    if descriptor.name.is_empty() {
        return Err(ToolError::Registration("plugin name is empty".into()));
    }
    if descriptor.functions.is_empty() {
        return Err(ToolError::Registration(format!(
            "plugin '{}' declares no functions",
            descriptor.name
        )));
    }

    let mut seen = std::collections::HashSet::new();
    for spec in &descriptor.functions {
        if spec.name.is_empty() {
            return Err(ToolError::Registration(format!(
                "plugin '{}' declares a function with an empty name",
                descriptor.name
            )));
        }
        if !seen.insert(spec.name) {
            return Err(ToolError::Registration(format!(
                "plugin '{}' declares function '{}' twice",
                descriptor.name, spec.name
            )));
        }
        for param in &spec.params {
            if param.name.is_empty() {
                return Err(ToolError::Registration(format!(
                    "function '{}' declares a parameter with an empty name",
                    spec.name
                )));
            }
            if let Some(ref default) = param.default {
                if !param.param_type.matches(default) {
                    return Err(ToolError::Registration(format!(
                        "function '{}' parameter '{}': default does not match declared type {}",
                        spec.name,
                        param.name,
                        param.param_type.as_str()
                    )));
                }
            }
            if param.one_of.is_some() && param.param_type != ParamType::String {
                return Err(ToolError::Registration(format!(
                    "function '{}' parameter '{}': enumerated values require a string type",
                    spec.name, param.name
                )));
            }
            if param.required && param.default.is_some() {
                return Err(ToolError::Registration(format!(
                    "function '{}' parameter '{}': required parameters cannot carry a default",
                    spec.name, param.name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePlugin {
        descriptor: PluginDescriptor,
    }

    #[async_trait]
    impl Plugin for FakePlugin {
        fn descriptor(&self) -> PluginDescriptor {
            self.descriptor.clone()
        }

        async fn invoke(
            &self,
            _ctx: &InvokeContext,
            _function: &str,
            _args: Map<String, Value>,
        ) -> Result<Invocation, ToolError> {
            Ok(Invocation::Immediate(json!({"ok": true})))
        }
    }

    fn plugin(name: &'static str, functions: Vec<FunctionSpec>) -> Arc<dyn Plugin> {
        Arc::new(FakePlugin {
            descriptor: PluginDescriptor {
                name,
                description: "test plugin",
                functions,
            },
        })
    }

    fn echo_spec(name: &'static str) -> FunctionSpec {
        FunctionSpec {
            name,
            description: "echoes input",
            params: vec![ParamSpec::required("text", ParamType::String, "input text")],
        }
    }

    #[test]
    fn rejects_duplicate_function_names_across_plugins() {
        let mut registry = Registry::new();
        registry.register(plugin("a", vec![echo_spec("echo")])).unwrap();
        let err = registry
            .register(plugin("b", vec![echo_spec("echo")]))
            .unwrap_err();
        assert!(matches!(err, ToolError::Registration(_)));
        assert_eq!(registry.plugin_count(), 1);
    }

    #[test]
    fn rejects_mismatched_default() {
        let mut registry = Registry::new();
        let spec = FunctionSpec {
            name: "f",
            description: "d",
            params: vec![ParamSpec::optional("n", ParamType::Integer, "count")
                .with_default(json!("not a number"))],
        };
        let err = registry.register(plugin("bad", vec![spec])).unwrap_err();
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn register_all_skips_invalid_plugins() {
        let mut registry = Registry::new();
        registry.register_all(vec![
            plugin("good", vec![echo_spec("echo")]),
            plugin("", vec![echo_spec("other")]),
        ]);
        assert_eq!(registry.plugin_count(), 1);
        assert!(registry.resolve("echo").is_some());
        assert!(registry.resolve("other").is_none());
    }

    #[test]
    fn schema_generation_is_deterministic() {
        let mut registry = Registry::new();
        registry
            .register(plugin("p", vec![echo_spec("zeta"), echo_spec("alpha")]))
            .unwrap();
        let first = serde_json::to_string(&registry.build_schema()).unwrap();
        let second = serde_json::to_string(&registry.build_schema()).unwrap();
        assert_eq!(first, second);

        // Functions are emitted in name order regardless of declaration order.
        let schema = registry.build_schema();
        let names: Vec<&str> = schema["functions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn schema_carries_required_flags_and_enums() {
        let mut registry = Registry::new();
        let spec = FunctionSpec {
            name: "analyze",
            description: "analyzes things",
            params: vec![
                ParamSpec::required("target", ParamType::String, "what to analyze"),
                ParamSpec::optional("mode", ParamType::String, "analysis mode")
                    .with_default(json!("fast"))
                    .with_one_of(vec!["fast", "thorough"]),
            ],
        };
        registry.register(plugin("p", vec![spec])).unwrap();

        let schema = registry.build_schema();
        let f = &schema["functions"][0];
        assert_eq!(f["parameters"]["required"], json!(["target"]));
        assert_eq!(
            f["parameters"]["properties"]["mode"]["enum"],
            json!(["fast", "thorough"])
        );
    }
}
