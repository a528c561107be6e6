//! Service and operation registry.
//!
//! Plugins register two kinds of records:
//!
//! - **Operations** (no `type`, type `operator`, or a plugin config carrying
//!   `_id`). They are keyed by `provider[/op]`, projected into the workflow
//!   registry, and may declare `inputs` (which also registers an input loader)
//!   and `outputs` schemas.
//! - **Generic services** of any other type, keyed by a generated or supplied
//!   id.
//!
//! Every registration is validated before the registry lock is taken, and all
//! of its records become visible in a single write, so callers never observe a
//! half-registered service.

mod spec;
mod workflow;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

pub use spec::{CUSTOM_TYPE_PREFIX, known_service_types, service_schema};
pub use workflow::{WorkflowTemplate, normalize_ui, workflow_tag};

use crate::plugin::descriptor::{PluginDescriptor, rand_id};
use crate::plugin::error::PluginError;
use crate::plugin::schema::{Schema, op_schema};
use crate::sandbox::{Capability, PluginApi};

/// Service type given to operation records.
pub const OPERATOR: &str = "operator";

/// The plugin on whose behalf a service is registered.
#[derive(Clone)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub plugin_type: Option<String>,
    pub api: Option<Arc<PluginApi>>,
}

impl Provider {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            plugin_type: None,
            api: None,
        }
    }

    /// The host itself, for services registered outside any plugin.
    pub fn root() -> Self {
        Self::new("imjoy-root", "Host")
    }

    pub fn with_api(mut self, api: Arc<PluginApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn with_type(mut self, plugin_type: impl Into<String>) -> Self {
        self.plugin_type = Some(plugin_type.into());
        self
    }
}

/// A registration request: JSON fields plus optional callables.
#[derive(Clone, Default)]
pub struct ServiceConfig {
    pub fields: Map<String, Value>,
    pub run: Option<Arc<dyn Capability>>,
    pub update: Option<Arc<dyn Capability>>,
}

impl ServiceConfig {
    /// Fields from a JSON object; any other value yields an empty config.
    pub fn from_json(value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Operation registration for a loaded plugin's own config.
    pub fn from_descriptor(descriptor: &PluginDescriptor) -> Self {
        let mut fields = Map::new();
        fields.insert("_id".into(), json!(descriptor.doc_id));
        fields.insert("name".into(), json!(descriptor.name));
        fields.insert("type".into(), json!(descriptor.plugin_type.as_str()));
        fields.insert("ui".into(), descriptor.ui.clone());
        fields.insert("inputs".into(), json!(descriptor.inputs));
        fields.insert("outputs".into(), json!(descriptor.outputs));
        Self {
            fields,
            ..Self::default()
        }
    }

    pub fn with_run(mut self, run: Arc<dyn Capability>) -> Self {
        self.run = Some(run);
        self
    }

    pub fn with_update(mut self, update: Arc<dyn Capability>) -> Self {
        self.update = Some(update);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.fields.get("name").and_then(Value::as_str)
    }

    pub fn service_type(&self) -> Option<&str> {
        self.fields.get("type").and_then(Value::as_str)
    }

    pub fn is_operation(&self) -> bool {
        match self.service_type() {
            None => true,
            Some(t) => t == OPERATOR || self.fields.contains_key("_id"),
        }
    }
}

/// Something that can be invoked on behalf of an operation.
#[derive(Clone)]
pub enum Runner {
    Direct(Arc<dyn Capability>),
    /// Looked up on the plugin api at call time, so functions exported after
    /// registration (or swapped by hot reload) are picked up.
    Plugin(Arc<PluginApi>, String),
}

impl Runner {
    async fn call(&self, args: Vec<Value>) -> Result<Value, anyhow::Error> {
        match self {
            Self::Direct(function) => function.call(args).await,
            Self::Plugin(api, name) => match api.get(name) {
                Some(function) => function.call(args).await,
                None => anyhow::bail!("function '{name}' is not exported"),
            },
        }
    }

    fn is_available(&self) -> bool {
        match self {
            Self::Direct(_) => true,
            Self::Plugin(api, name) => api.has_capability(name),
        }
    }
}

/// A registered service as seen by lookups.
#[derive(Clone)]
pub struct ServiceRecord {
    pub id: String,
    pub service_type: String,
    pub name: String,
    pub provider: String,
    pub provider_id: String,
    pub fields: Map<String, Value>,
    pub run: Option<Runner>,
}

impl ServiceRecord {
    /// Declared fields plus `id`, `type`, `name` and `provider`.
    pub fn to_json(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert("id".into(), json!(self.id));
        map.insert("type".into(), json!(self.service_type));
        map.insert("name".into(), json!(self.name));
        map.insert("provider".into(), json!(self.provider));
        Value::Object(map)
    }

    /// Exact match on every filter key.
    pub fn matches(&self, filter: &Map<String, Value>) -> bool {
        let Value::Object(record) = self.to_json() else {
            return false;
        };
        filter.iter().all(|(k, v)| record.get(k) == Some(v))
    }

    pub fn is_operation(&self) -> bool {
        self.service_type == OPERATOR
    }
}

impl std::fmt::Debug for ServiceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRecord")
            .field("id", &self.id)
            .field("type", &self.service_type)
            .field("name", &self.name)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// A registered operation.
#[derive(Clone)]
pub struct Operation {
    pub key: String,
    pub name: String,
    pub plugin_id: String,
    pub plugin_name: String,
    pub ui: Value,
    pub show_panel: bool,
    pub inputs: Option<Schema>,
    pub outputs: Option<Schema>,
    run: Option<Runner>,
    update: Option<Runner>,
}

impl Operation {
    pub fn has_run(&self) -> bool {
        self.run.as_ref().is_some_and(Runner::is_available)
    }

    pub fn has_update(&self) -> bool {
        self.update.as_ref().is_some_and(Runner::is_available)
    }
}

/// Input loader registered for an operation that declares `inputs`.
#[derive(Clone)]
pub struct InputLoader {
    pub key: String,
    pub op_name: String,
    pub plugin_name: String,
    pub schema: Schema,
}

/// What to remove in [`ServiceRegistry::unregister`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRef {
    /// An operation by name, scoped to the provider.
    Operation(String),
    /// A service by id. Operation records are routed to the operation path.
    Service(String),
}

#[derive(Default)]
struct RegistryState {
    /// Generic services by id, operation records by op key.
    services: HashMap<String, ServiceRecord>,
    ops: HashMap<String, Operation>,
    loaders: HashMap<String, InputLoader>,
    workflow: HashMap<String, WorkflowTemplate>,
}

/// Global table of services and operations.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

fn op_key(provider: &str, op_name: &str) -> String {
    if op_name == provider {
        provider.to_string()
    } else {
        format!("{provider}/{op_name}")
    }
}

/// Wrap bare property maps into an object schema and require every property
/// unless `required` is given.
fn normalize_io_schema(schema: &Value, allow_array: bool) -> Option<Value> {
    let Value::Object(map) = schema else {
        return None;
    };
    let ty = map.get("type").and_then(Value::as_str);
    let is_object_schema = ty == Some("object") && map.contains_key("properties");
    let is_array_schema = allow_array && ty == Some("array") && map.contains_key("items");
    let mut normalized = if is_object_schema || is_array_schema {
        map.clone()
    } else {
        let mut wrapped = Map::new();
        wrapped.insert("type".into(), json!("object"));
        wrapped.insert("properties".into(), Value::Object(map.clone()));
        wrapped
    };
    if normalized.get("type").and_then(Value::as_str) == Some("object")
        && !normalized.contains_key("required")
    {
        let keys: Vec<Value> = normalized
            .get("properties")
            .and_then(Value::as_object)
            .map(|p| p.keys().map(|k| json!(k)).collect())
            .unwrap_or_default();
        normalized.insert("required".into(), Value::Array(keys));
    }
    Some(Value::Object(normalized))
}

fn compile_io_schema(op: &str, which: &str, value: Option<&Value>, allow_array: bool) -> Option<Schema> {
    let value = value.filter(|v| !v.is_null())?;
    let Some(normalized) = normalize_io_schema(value, allow_array) else {
        warn!(op = %op, which, "io schema must be an object, ignoring");
        return None;
    };
    match Schema::compile(normalized) {
        Ok(schema) => Some(schema),
        Err(e) => {
            warn!(op = %op, which, error = %e, "failed to compile io schema, ignoring");
            None
        }
    }
}

/// Everything an operation registration writes, prepared outside the lock.
struct PreparedOp {
    record: ServiceRecord,
    op: Operation,
    loader: Option<InputLoader>,
    template: WorkflowTemplate,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service after checking its identity and type.
    ///
    /// Returns the operation name for operations, the service id otherwise.
    pub fn register(&self, provider: &Provider, config: ServiceConfig) -> Result<String, PluginError> {
        let (Some(name), Some(service_type)) = (config.name(), config.service_type()) else {
            return Err(PluginError::MissingServiceIdentity {
                provider: provider.name.clone(),
            });
        };
        if let Some(schema) = service_schema(service_type) {
            let violations = schema.validate(&Value::Object(config.fields.clone()));
            if !violations.is_empty() {
                return Err(PluginError::ServiceSchemaViolation {
                    service: name.to_string(),
                    service_type: service_type.to_string(),
                    violations,
                });
            }
        } else if !service_type.starts_with(CUSTOM_TYPE_PREFIX) {
            return Err(PluginError::UnnamespacedUnknownServiceType {
                service: name.to_string(),
                service_type: service_type.to_string(),
            });
        }
        self.register_unchecked(provider, config)
    }

    /// Register without the identity and type checks of [`Self::register`].
    /// Used for a plugin's own config when it finishes loading.
    pub fn register_unchecked(
        &self,
        provider: &Provider,
        config: ServiceConfig,
    ) -> Result<String, PluginError> {
        if config.is_operation() {
            let prepared = self.prepare_op(provider, &config)?;
            let name = prepared.op.name.clone();
            let key = prepared.op.key.clone();
            let mut state = self.inner.write();
            state.services.insert(key.clone(), prepared.record);
            state.workflow.insert(key.clone(), prepared.template);
            match prepared.loader {
                Some(loader) => {
                    state.loaders.insert(key.clone(), loader);
                }
                None => {
                    state.loaders.remove(&key);
                }
            }
            state.ops.insert(key.clone(), prepared.op);
            debug!(op = %key, provider = %provider.name, "operation registered");
            return Ok(name);
        }

        let id = config
            .fields
            .get("id")
            .and_then(Value::as_str)
            .map_or_else(rand_id, str::to_string);
        let record = ServiceRecord {
            id: id.clone(),
            service_type: config.service_type().unwrap_or_default().to_string(),
            name: config.name().unwrap_or_default().to_string(),
            provider: provider.name.clone(),
            provider_id: provider.id.clone(),
            fields: config.fields,
            run: config.run.map(Runner::Direct),
        };
        self.inner.write().services.insert(id.clone(), record);
        debug!(service = %id, provider = %provider.name, "service registered");
        Ok(id)
    }

    fn prepare_op(&self, provider: &Provider, config: &ServiceConfig) -> Result<PreparedOp, PluginError> {
        let mut fields = config.fields.clone();
        let name = config.name().unwrap_or(&provider.name).to_string();
        fields.insert("name".into(), json!(name));
        if !fields.get("show_panel").is_some_and(Value::is_boolean) {
            fields.insert("show_panel".into(), json!(false));
        }
        if name == provider.name && fields.get("ui").is_none_or(Value::is_null) {
            fields.insert("ui".into(), json!(provider.description));
        }
        for key in ["inputs", "outputs", "ui"] {
            fields.entry(key).or_insert(Value::Null);
        }

        let violations = op_schema().validate(&Value::Object(fields.clone()));
        if !violations.is_empty() {
            return Err(PluginError::ServiceSchemaViolation {
                service: name,
                service_type: OPERATOR.to_string(),
                violations,
            });
        }

        let key = op_key(&provider.name, &name);
        let run = config.run.clone().map(Runner::Direct).or_else(|| {
            provider
                .api
                .as_ref()
                .map(|api| Runner::Plugin(Arc::clone(api), "run".to_string()))
        });
        let update = config.update.clone().map(Runner::Direct).or_else(|| {
            provider
                .api
                .as_ref()
                .filter(|api| api.has_capability("update"))
                .map(|api| Runner::Plugin(Arc::clone(api), "update".to_string()))
        });
        let inputs = compile_io_schema(&key, "inputs", fields.get("inputs"), true);
        let outputs = compile_io_schema(&key, "outputs", fields.get("outputs"), false);
        let loader = inputs.clone().map(|schema| InputLoader {
            key: key.clone(),
            op_name: name.clone(),
            plugin_name: provider.name.clone(),
            schema,
        });
        let plugin_type = fields
            .get("type")
            .and_then(Value::as_str)
            .filter(|t| *t != OPERATOR)
            .map(str::to_string)
            .or_else(|| provider.plugin_type.clone());
        let ui = fields.get("ui").cloned().unwrap_or(Value::Null);
        let template = WorkflowTemplate::new(&name, &key, plugin_type.as_deref(), &ui);

        let mut record_fields = Map::new();
        for k in ["ui", "inputs", "outputs"] {
            record_fields.insert(k.into(), fields.get(k).cloned().unwrap_or(Value::Null));
        }
        let record = ServiceRecord {
            id: name.clone(),
            service_type: OPERATOR.to_string(),
            name: name.clone(),
            provider: provider.name.clone(),
            provider_id: provider.id.clone(),
            fields: record_fields,
            run: run.clone(),
        };
        let op = Operation {
            key,
            name,
            plugin_id: provider.id.clone(),
            plugin_name: provider.name.clone(),
            show_panel: fields.get("show_panel").and_then(Value::as_bool).unwrap_or(false),
            ui,
            inputs,
            outputs,
            run,
            update,
        };
        Ok(PreparedOp {
            record,
            op,
            loader,
            template,
        })
    }

    /// Remove services of `provider`.
    ///
    /// With no target, removes every record the provider registered and its
    /// same-named operation. Returns the ids of removed records. Idempotent.
    pub fn unregister(&self, provider: &Provider, target: Option<ServiceRef>) -> Vec<String> {
        let mut state = self.inner.write();
        let mut removed = Vec::new();
        match target {
            None => {
                let keys: Vec<String> = state
                    .services
                    .iter()
                    .filter(|(_, r)| r.provider == provider.name)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in keys {
                    if let Some(record) = state.services.remove(&key) {
                        if record.is_operation() {
                            remove_op(&mut state, &key);
                        }
                        removed.push(record.id);
                    }
                }
                let own = op_key(&provider.name, &provider.name);
                remove_op(&mut state, &own);
                let op_keys: Vec<String> = state
                    .ops
                    .iter()
                    .filter(|(_, op)| op.plugin_name == provider.name)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in op_keys {
                    remove_op(&mut state, &key);
                }
            }
            Some(ServiceRef::Operation(name)) => {
                let key = op_key(&provider.name, &name);
                if let Some(record) = state.services.remove(&key) {
                    removed.push(record.id);
                }
                remove_op(&mut state, &key);
            }
            Some(ServiceRef::Service(id)) => {
                let key = op_key(&provider.name, &id);
                if state.services.get(&key).is_some_and(ServiceRecord::is_operation) {
                    if let Some(record) = state.services.remove(&key) {
                        removed.push(record.id);
                    }
                    remove_op(&mut state, &key);
                } else if let Some(record) = state.services.remove(&id) {
                    removed.push(record.id);
                }
            }
        }
        removed
    }

    /// Records matching every key of `filter`, ordered by id.
    pub fn find(&self, filter: &Map<String, Value>) -> Vec<ServiceRecord> {
        let state = self.inner.read();
        let mut found: Vec<ServiceRecord> = state
            .services
            .values()
            .filter(|r| r.matches(filter))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.provider.cmp(&b.provider)));
        found
    }

    pub fn operation(&self, key: &str) -> Option<Operation> {
        self.inner.read().ops.get(key).cloned()
    }

    pub fn operation_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().ops.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn workflow_template(&self, key: &str) -> Option<WorkflowTemplate> {
        self.inner.read().workflow.get(key).cloned()
    }

    pub fn input_loader(&self, key: &str) -> Option<InputLoader> {
        self.inner.read().loaders.get(key).cloned()
    }

    pub fn loader_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().loaders.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn output_schema(&self, key: &str) -> Option<Schema> {
        self.inner.read().ops.get(key).and_then(|op| op.outputs.clone())
    }

    /// Run an operation's `run` function with `args`.
    ///
    /// A result that violates the declared outputs schema is logged, not
    /// rejected.
    pub async fn execute(&self, key: &str, args: Value) -> Result<Value, PluginError> {
        let op = self
            .operation(key)
            .ok_or_else(|| PluginError::OperationNotFound { key: key.to_string() })?;
        let Some(run) = op.run.clone() else {
            return Err(PluginError::capability_missing(&op.plugin_name, "run"));
        };
        if !run.is_available() {
            return Err(PluginError::capability_missing(&op.plugin_name, "run"));
        }
        let result = run
            .call(vec![args])
            .await
            .map_err(|e| PluginError::call_failed(&op.plugin_name, "run", &e))?;
        if let Some(schema) = &op.outputs {
            let violations = schema.validate(&result);
            if !violations.is_empty() {
                warn!(op = %key, violations = ?violations, "operation result does not match its outputs schema");
            }
        }
        Ok(result)
    }

    /// Run an operation's `update` function.
    pub async fn update(&self, key: &str, args: Value) -> Result<Value, PluginError> {
        let op = self
            .operation(key)
            .ok_or_else(|| PluginError::OperationNotFound { key: key.to_string() })?;
        let Some(update) = op.update.clone() else {
            return Err(PluginError::capability_missing(&op.plugin_name, "update"));
        };
        update
            .call(vec![args])
            .await
            .map_err(|e| PluginError::call_failed(&op.plugin_name, "update", &e))
    }

    /// Invoke the input loader registered under `key` for a target object.
    pub async fn run_loader(&self, key: &str, target: Value, data: Value) -> Result<Value, PluginError> {
        let loader = self
            .input_loader(key)
            .ok_or_else(|| PluginError::OperationNotFound { key: key.to_string() })?;
        let mut target = match target {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".into(), other);
                map
            }
        };
        target.entry("transfer").or_insert(json!(false));
        let source_op = target.get("_op").cloned().unwrap_or(Value::Null);
        target.insert("_source_op".into(), source_op);
        target.insert("_op".into(), json!(loader.op_name));
        if target.get("_workflow_id").is_none_or(Value::is_null) {
            target.insert(
                "_workflow_id".into(),
                json!(format!(
                    "data_loader_{}{}",
                    loader.op_name.trim().replace(' ', "_"),
                    rand_id()
                )),
            );
        }
        let my = json!({
            "op": { "name": loader.op_name },
            "target": Value::Object(target),
            "data": data,
        });
        self.execute(key, my).await
    }

    pub fn len(&self) -> usize {
        self.inner.read().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().services.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.inner.write();
        *state = RegistryState::default();
    }
}

fn remove_op(state: &mut RegistryState, key: &str) {
    state.ops.remove(key);
    state.loaders.remove(key);
    state.workflow.remove(key);
    if state.services.get(key).is_some_and(ServiceRecord::is_operation) {
        state.services.remove(key);
    }
}
