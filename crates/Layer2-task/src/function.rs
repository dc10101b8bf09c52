//! Function definitions and the registry
//!
//! A function is an ordinary Rust closure plus a declared argument schema.
//! The registry is built once at startup, by the server and again by every
//! worker process, so it must be constructed deterministically.

use fnjob_foundation::{Error, Result, DEFAULT_FUNCTION_TIMEOUT_SECS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Path prefixes owned by the HTTP API
pub const RESERVED_PREFIXES: &[&str] = &["task", "function", "terminate"];

/// Suffix of the blocking endpoint
pub const KEEP_CONNECTION: &str = "keep-connection";

// ============================================================================
// Argument schema
// ============================================================================

/// Declared type of an argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArgType {
    Integer,
    Float,
    String,
    Boolean,
    List,
    Dict,
}

impl ArgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgType::Integer => "INTEGER",
            ArgType::Float => "FLOAT",
            ArgType::String => "STRING",
            ArgType::Boolean => "BOOLEAN",
            ArgType::List => "LIST",
            ArgType::Dict => "DICT",
        }
    }
}

impl std::fmt::Display for ArgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: ArgType,
    pub is_required: bool,
    #[serde(default)]
    pub description: String,
}

impl ArgSpec {
    pub fn required(
        name: impl Into<String>,
        arg_type: ArgType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            arg_type,
            is_required: true,
            description: description.into(),
        }
    }

    pub fn optional(
        name: impl Into<String>,
        arg_type: ArgType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            arg_type,
            is_required: false,
            description: description.into(),
        }
    }
}

// ============================================================================
// Call arguments
// ============================================================================

/// Validated arguments handed to a function
///
/// Values already have the JSON shape of their declared type, so the typed
/// getters only fail when a function asks for an argument it did not declare
/// (or declared with another type).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallArguments(Map<String, Value>);

impl CallArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn require(&self, name: &str) -> Result<&Value> {
        self.0
            .get(name)
            .ok_or_else(|| Error::InvalidInput(format!("Missing argument: {}", name)))
    }

    pub fn integer(&self, name: &str) -> Result<i64> {
        self.require(name)?
            .as_i64()
            .ok_or_else(|| mismatch(name, ArgType::Integer))
    }

    pub fn float(&self, name: &str) -> Result<f64> {
        self.require(name)?
            .as_f64()
            .ok_or_else(|| mismatch(name, ArgType::Float))
    }

    pub fn string(&self, name: &str) -> Result<String> {
        self.require(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch(name, ArgType::String))
    }

    pub fn boolean(&self, name: &str) -> Result<bool> {
        self.require(name)?
            .as_bool()
            .ok_or_else(|| mismatch(name, ArgType::Boolean))
    }

    pub fn list(&self, name: &str) -> Result<Vec<Value>> {
        self.require(name)?
            .as_array()
            .cloned()
            .ok_or_else(|| mismatch(name, ArgType::List))
    }

    pub fn dict(&self, name: &str) -> Result<Map<String, Value>> {
        self.require(name)?
            .as_object()
            .cloned()
            .ok_or_else(|| mismatch(name, ArgType::Dict))
    }

    pub fn opt_integer(&self, name: &str) -> Result<Option<i64>> {
        self.optional(name, Self::integer)
    }

    pub fn opt_string(&self, name: &str) -> Result<Option<String>> {
        self.optional(name, Self::string)
    }

    pub fn opt_boolean(&self, name: &str) -> Result<Option<bool>> {
        self.optional(name, Self::boolean)
    }

    pub fn opt_list(&self, name: &str) -> Result<Option<Vec<Value>>> {
        self.optional(name, Self::list)
    }

    pub fn opt_dict(&self, name: &str) -> Result<Option<Map<String, Value>>> {
        self.optional(name, Self::dict)
    }

    fn optional<T>(&self, name: &str, get: fn(&Self, &str) -> Result<T>) -> Result<Option<T>> {
        if self.contains(name) {
            get(self, name).map(Some)
        } else {
            Ok(None)
        }
    }
}

fn mismatch(name: &str, expected: ArgType) -> Error {
    Error::InvalidInput(format!("Argument {} is not {}", name, expected))
}

// ============================================================================
// Function definition
// ============================================================================

/// Type-erased function body. The inner `serde_json::Result` carries a
/// return value that could not be converted to JSON.
pub type Callable =
    Arc<dyn Fn(&CallArguments) -> anyhow::Result<serde_json::Result<Value>> + Send + Sync>;

/// A named, schema-checked function
#[derive(Clone, Serialize)]
pub struct FunctionDefinition {
    pub function_name: String,
    pub arg_definitions: Vec<ArgSpec>,
    /// 0 means unlimited
    pub max_concurrency: u32,
    pub description: String,
    /// Seconds; filled in with the registry default on registration
    #[serde(rename = "timeout")]
    pub timeout_secs: Option<u64>,

    #[serde(skip)]
    callable: Callable,
}

impl std::fmt::Debug for FunctionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionDefinition")
            .field("function_name", &self.function_name)
            .field("arg_definitions", &self.arg_definitions)
            .field("max_concurrency", &self.max_concurrency)
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

impl FunctionDefinition {
    /// Wrap a closure returning any serializable value
    pub fn new<F, R>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&CallArguments) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Serialize,
    {
        let callable: Callable = Arc::new(move |args| func(args).map(|r| serde_json::to_value(r)));

        Self {
            function_name: name.into(),
            arg_definitions: Vec::new(),
            max_concurrency: 0,
            description: String::new(),
            timeout_secs: None,
            callable,
        }
    }

    pub fn arg(mut self, spec: ArgSpec) -> Self {
        self.arg_definitions.push(spec);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Timeouts are whole seconds; a fractional second rounds up
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let round_up = u64::from(timeout.subsec_nanos() > 0);
        self.timeout_secs = Some(timeout.as_secs().saturating_add(round_up));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_FUNCTION_TIMEOUT_SECS))
    }

    /// Run the function body in the current thread
    pub fn call(&self, args: &CallArguments) -> anyhow::Result<serde_json::Result<Value>> {
        (self.callable)(args)
    }

    /// Non-blocking endpoint path
    pub fn async_path(&self) -> String {
        format!("/{}", self.function_name)
    }

    /// Blocking endpoint path
    pub fn blocking_path(&self) -> String {
        format!("/{}/{}", self.function_name, KEEP_CONNECTION)
    }

    fn check(&self) -> Result<()> {
        check_name(&self.function_name)?;

        let mut seen = HashSet::new();
        for spec in &self.arg_definitions {
            if spec.name.is_empty() {
                return Err(Error::Validation(format!(
                    "{}: argument names must not be empty",
                    self.function_name
                )));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::Validation(format!(
                    "{}: duplicate argument {}",
                    self.function_name, spec.name
                )));
            }
        }

        if self.timeout_secs == Some(0) {
            return Err(Error::Validation(format!(
                "{}: timeout should be greater than 0",
                self.function_name
            )));
        }

        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("Function name must not be empty".to_string()));
    }

    let segments: Vec<&str> = name.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::Validation(format!(
            "Function name {} has an empty path segment",
            name
        )));
    }

    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/');
    if let Some(c) = name.chars().find(|c| !allowed(*c)) {
        return Err(Error::Validation(format!(
            "Function name {} contains {:?}",
            name, c
        )));
    }

    if RESERVED_PREFIXES.contains(&segments[0]) {
        return Err(Error::Validation(format!(
            "Function name {} collides with the /{} API",
            name, segments[0]
        )));
    }

    if segments.len() > 1 && segments.last() == Some(&KEEP_CONNECTION) {
        return Err(Error::Validation(format!(
            "Function name {} collides with a blocking endpoint",
            name
        )));
    }

    Ok(())
}

// ============================================================================
// Registry
// ============================================================================

/// Named function definitions, ordered by name
#[derive(Debug, Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, FunctionDefinition>,
    default_timeout: Duration,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: BTreeMap::new(),
            default_timeout: Duration::from_secs(DEFAULT_FUNCTION_TIMEOUT_SECS),
        }
    }

    /// Timeout given to definitions registered without one
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a definition; a definition with the same name is replaced
    pub fn register(&mut self, mut definition: FunctionDefinition) -> Result<()> {
        definition.function_name = definition.function_name.trim_matches('/').to_string();
        definition.check()?;

        if definition.timeout_secs.is_none() {
            definition.timeout_secs = Some(self.default_timeout.as_secs().max(1));
        }

        let name = definition.function_name.clone();
        if self.functions.insert(name.clone(), definition).is_some() {
            info!("Duplicate registration: {}", name);
        } else {
            debug!("Registered function: {}", name);
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&FunctionDefinition> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &FunctionDefinition> {
        self.functions.values()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Human-readable listing of every function
    pub fn to_text(&self) -> String {
        let mut rows = Vec::new();

        for definition in self.definitions() {
            rows.push(definition.function_name.clone());
            rows.push("  URL:".to_string());
            rows.push(format!("    async api: {}", definition.async_path()));
            rows.push(format!("    block api: {}", definition.blocking_path()));
            rows.push(format!("  Max Concurrency: {}", definition.max_concurrency));
            rows.push("  Description:".to_string());
            rows.push(format!("        {}", definition.description));

            if definition.arg_definitions.is_empty() {
                rows.push("  No Args".to_string());
            } else {
                rows.push("  Args".to_string());
                for arg in &definition.arg_definitions {
                    let required = if arg.is_required {
                        "Required"
                    } else {
                        "NOT-Required"
                    };
                    rows.push(format!("    {} {} {}", arg.name, arg.arg_type, required));
                    if !arg.description.is_empty() {
                        rows.push(format!("      {}", arg.description));
                    }
                }
            }

            rows.push(format!("  Timeout: {} sec", definition.timeout().as_secs()));
            rows.push("\n".to_string());
        }

        rows.join("\n")
    }
}
