//! Component G — the skill executor.
//!
//! A skill is a declarative pipeline: named inputs with types/defaults, an
//! ordered list of steps (each naming a built-in action, a params object
//! that may reference `{{inputs.x}}`/`{{steps.y}}` via interpolation, and an
//! optional `condition`), and an output template rendered once every step
//! has run. The executor halts on the first failing step and returns
//! whatever partial results it accumulated — there is no transactional
//! rollback, matching the donor's "fire requests, record what happened"
//! style rather than a workflow engine with compensating actions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputSpec {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SkillStep {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SkillDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: HashMap<String, InputSpec>,
    pub steps: Vec<SkillStep>,
    pub output_template: Value,
}

impl SkillDefinition {
    /// §4.4 register-time validation: non-empty id/name/version, at least
    /// one step, output template present, step ids unique within the skill.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("skill id must not be empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("skill name must not be empty".to_string());
        }
        if self.version.trim().is_empty() {
            return Err("skill version must not be empty".to_string());
        }
        if self.steps.is_empty() {
            return Err("skill must have at least one step".to_string());
        }
        if self.output_template.is_null() {
            return Err("skill must have an output template".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err("step id must not be empty".to_string());
            }
            if step.action.trim().is_empty() {
                return Err(format!("step {} has an empty action", step.id));
            }
            if !seen.insert(step.id.clone()) {
                return Err(format!("duplicate step id {}", step.id));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub id: String,
    pub output: Value,
    pub skipped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkillRunResult {
    pub skill_id: String,
    pub success: bool,
    pub output: Value,
    pub steps: Vec<StepResult>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("invalid skill: {0}")]
    Invalid(String),
    #[error("unknown skill: {0}")]
    NotFound(String),
    #[error("missing required input: {0}")]
    MissingInput(String),
}

#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, input: Value) -> Result<Value, String>;
}

/// Renders `{{a.b.c}}` references against the `{inputs, steps}` scope. A
/// template that is *exactly* one placeholder (no surrounding text)
/// resolves to the referenced JSON value verbatim (object/array/number
/// survive); a placeholder embedded in other text is spliced in as its
/// string form. A path with no match resolves to `undefined`, which the
/// inline-splice rule treats the same as resolving to `null` — both become
/// an empty string rather than the literal `{{a.b}}` (§8 invariant 8).
pub fn interpolate(template: &Value, scope: &Value) -> Value {
    match template {
        Value::String(s) => interpolate_string(s, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate(v, scope)).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), interpolate(v, scope));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn interpolate_string(s: &str, scope: &Value) -> Value {
    if let Some(path) = whole_placeholder(s) {
        return lookup_path(&path, scope).unwrap_or(Value::Null);
    }
    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        if let Some(end) = after.find("}}") {
            let path = after[..end].trim();
            let resolved = lookup_path(path, scope)
                .map(value_to_splice_string)
                .unwrap_or_default();
            out.push_str(&resolved);
            rest = &after[end + 2..];
        } else {
            out.push_str("{{");
            rest = after;
        }
    }
    out.push_str(rest);
    Value::String(out)
}

fn whole_placeholder(s: &str) -> Option<String> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim().to_string())
}

fn value_to_splice_string(v: Value) -> String {
    match v {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn lookup_path(path: &str, scope: &Value) -> Option<Value> {
    let mut parts = path.split('.');
    let root = parts.next()?;
    let mut current = scope.get(root)?.clone();
    for part in parts {
        current = match current {
            Value::Object(mut map) => map.remove(part)?,
            Value::Array(arr) => {
                let idx: usize = part.parse().ok()?;
                arr.get(idx)?.clone()
            }
            _ => return None,
        };
    }
    Some(current)
}

/// A condition is falsy for exactly the forms §4.4 names: JSON `false`,
/// the strings `"false"`/`"0"`, `null`, or an unresolved placeholder
/// (which interpolates to `null`). Everything else — including the
/// numeric `0` and empty string, which the source treats as present-but-
/// falsy only in their string forms — is truthy here to match the spec's
/// explicit enumeration rather than a generic JS-truthiness rule.
fn is_condition_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::String(s) => s != "false" && s != "0",
        _ => true,
    }
}

pub struct SkillExecutor {
    skills: Mutex<HashMap<String, SkillDefinition>>,
    actions: HashMap<String, Arc<dyn Action>>,
}

impl Default for SkillExecutor {
    fn default() -> Self {
        let mut executor = Self { skills: Mutex::new(HashMap::new()), actions: HashMap::new() };
        executor.register_action("fs.read", Arc::new(FsReadAction));
        executor.register_action("fs.write", Arc::new(FsWriteAction));
        executor.register_action("transform.json", Arc::new(TransformJsonAction));
        executor.register_action("transform.text", Arc::new(TransformTextAction));
        executor.register_action("http.get", Arc::new(HttpGetAction));
        executor.register_action("http.post", Arc::new(HttpPostAction));
        executor.register_action("shell.exec", Arc::new(ShellExecAction));
        executor.register_action("llm.complete", Arc::new(UnconfiguredLlmAction));
        executor
    }
}

impl SkillExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_action(&mut self, name: impl Into<String>, action: Arc<dyn Action>) {
        self.actions.insert(name.into(), action);
    }

    /// §4.4 `register`: validates then inserts/replaces by id. Re-
    /// registering by id replaces the existing definition without growing
    /// the list (§8 invariant 10).
    pub fn register(&self, skill: SkillDefinition) -> Result<(), SkillError> {
        skill.validate().map_err(SkillError::Invalid)?;
        self.skills.lock().unwrap().insert(skill.id.clone(), skill);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<SkillDefinition> {
        self.skills.lock().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<SkillDefinition> {
        let mut v: Vec<SkillDefinition> = self.skills.lock().unwrap().values().cloned().collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.skills.lock().unwrap().remove(id).is_some()
    }

    /// §4.4 `execute(skillId, inputs, context)`. Resolves declared inputs
    /// (applying defaults, erroring on a missing required input, passing
    /// through any extra keys the caller supplied), then runs steps in
    /// order against a `{inputs, steps}` scope.
    pub async fn execute(&self, skill_id: &str, inputs: Value) -> Result<SkillRunResult, SkillError> {
        let skill = self.get(skill_id).ok_or_else(|| SkillError::NotFound(skill_id.to_string()))?;
        let resolved_inputs = self.resolve_inputs(&skill, inputs)?;
        Ok(self.run_resolved(&skill, resolved_inputs).await)
    }

    /// Runs an unregistered, ad-hoc skill definition directly — used by
    /// callers (and tests) that already hold a full `SkillDefinition` and
    /// don't need it persisted in the registry first.
    pub async fn run(&self, skill: &SkillDefinition) -> SkillRunResult {
        if let Err(e) = skill.validate() {
            return SkillRunResult {
                skill_id: skill.id.clone(),
                success: false,
                output: Value::Null,
                steps: vec![],
                duration_ms: 0,
                error: Some(e),
            };
        }
        let resolved_inputs = match self.resolve_inputs(skill, Value::Object(Default::default())) {
            Ok(v) => v,
            Err(e) => {
                return SkillRunResult {
                    skill_id: skill.id.clone(),
                    success: false,
                    output: Value::Null,
                    steps: vec![],
                    duration_ms: 0,
                    error: Some(e.to_string()),
                }
            }
        };
        self.run_resolved(skill, resolved_inputs).await
    }

    fn resolve_inputs(&self, skill: &SkillDefinition, supplied: Value) -> Result<Value, SkillError> {
        let supplied = supplied.as_object().cloned().unwrap_or_default();
        let mut resolved = supplied.clone();
        for (name, spec) in &skill.inputs {
            if !resolved.contains_key(name) {
                if let Some(default) = &spec.default {
                    resolved.insert(name.clone(), default.clone());
                } else if spec.required {
                    return Err(SkillError::MissingInput(name.clone()));
                }
            }
        }
        Ok(Value::Object(resolved))
    }

    async fn run_resolved(&self, skill: &SkillDefinition, inputs: Value) -> SkillRunResult {
        let start = Instant::now();
        let mut scope = serde_json::json!({ "inputs": inputs, "steps": {} });
        let mut results = Vec::new();
        let mut error = None;

        for step in &skill.steps {
            if let Some(cond) = &step.condition {
                let cond_value = interpolate(&Value::String(cond.clone()), &scope);
                if !is_condition_truthy(&cond_value) {
                    results.push(StepResult { id: step.id.clone(), output: Value::Null, skipped: true });
                    continue;
                }
            }

            let Some(action) = self.actions.get(&step.action) else {
                error = Some(format!("unknown action: {}", step.action));
                break;
            };

            let params = interpolate(&step.params, &scope);
            match action.run(params).await {
                Ok(output) => {
                    scope["steps"][&step.id] = output.clone();
                    results.push(StepResult { id: step.id.clone(), output, skipped: false });
                }
                Err(e) => {
                    error = Some(format!("step {} failed: {e}", step.id));
                    results.push(StepResult { id: step.id.clone(), output: Value::Null, skipped: false });
                    break;
                }
            }
        }

        let success = error.is_none();
        let output = if success { interpolate(&skill.output_template, &scope) } else { Value::Null };

        SkillRunResult {
            skill_id: skill.id.clone(),
            success,
            output,
            steps: results,
            duration_ms: start.elapsed().as_millis() as u64,
            error,
        }
    }
}

// ── built-in actions ─────────────────────────────────────────────────────
//
// Every `transform.*` action returns the transformed value directly (not
// wrapped in an envelope object) so a step's `output` can be threaded
// straight into the next step or the output template without an extra
// unwrapping hop.

struct FsReadAction;
#[async_trait]
impl Action for FsReadAction {
    async fn run(&self, input: Value) -> Result<Value, String> {
        let path = input.get("path").and_then(Value::as_str).ok_or("missing path")?;
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "contents": contents }))
    }
}

struct FsWriteAction;
#[async_trait]
impl Action for FsWriteAction {
    async fn run(&self, input: Value) -> Result<Value, String> {
        let path = input.get("path").and_then(Value::as_str).ok_or("missing path")?;
        let contents = input.get("contents").and_then(Value::as_str).unwrap_or_default();
        tokio::fs::write(path, contents).await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "bytes_written": contents.len() }))
    }
}

struct TransformJsonAction;
#[async_trait]
impl Action for TransformJsonAction {
    async fn run(&self, input: Value) -> Result<Value, String> {
        let value = input.get("value").cloned().unwrap_or(Value::Null);
        let op = input.get("op").and_then(Value::as_str).unwrap_or("identity");
        match op {
            "identity" => Ok(value),
            "count" => {
                let arr = value.as_array().ok_or("count requires an array value")?;
                Ok(serde_json::json!(arr.len()))
            }
            "stringify" => Ok(Value::String(value.to_string())),
            "parse" => {
                let s = value.as_str().ok_or("parse requires a string value")?;
                serde_json::from_str(s).map_err(|e| e.to_string())
            }
            "pick" => {
                let path = input.get("path").and_then(Value::as_str).ok_or("missing path")?;
                let scoped = serde_json::json!({ "value": value });
                Ok(lookup_path(&format!("value.{path}"), &scoped).unwrap_or(Value::Null))
            }
            "pluck" => {
                let field = input.get("field").and_then(Value::as_str).ok_or("missing field")?;
                let arr = value.as_array().ok_or("pluck requires an array value")?;
                let plucked: Vec<Value> = arr
                    .iter()
                    .map(|item| item.get(field).cloned().unwrap_or(Value::Null))
                    .collect();
                Ok(Value::Array(plucked))
            }
            "filter" => {
                let arr = value.as_array().ok_or("filter requires an array value")?;
                let field = input.get("field").and_then(Value::as_str);
                let equals = input.get("equals");
                let filtered: Vec<Value> = arr
                    .iter()
                    .filter(|item| match (field, equals) {
                        (Some(f), Some(eq)) => item.get(f).map(|v| v == eq).unwrap_or(false),
                        (Some(f), None) => item.get(f).map(is_condition_truthy).unwrap_or(false),
                        (None, _) => is_condition_truthy(item),
                    })
                    .cloned()
                    .collect();
                Ok(Value::Array(filtered))
            }
            "flatten" => {
                let arr = value.as_array().ok_or("flatten requires an array value")?;
                let mut flat = Vec::new();
                for item in arr {
                    match item.as_array() {
                        Some(inner) => flat.extend(inner.iter().cloned()),
                        None => flat.push(item.clone()),
                    }
                }
                Ok(Value::Array(flat))
            }
            other => Err(format!("unknown transform.json op: {other}")),
        }
    }
}

struct TransformTextAction;
#[async_trait]
impl Action for TransformTextAction {
    async fn run(&self, input: Value) -> Result<Value, String> {
        let text = input.get("text").and_then(Value::as_str).unwrap_or_default();
        let op = input.get("op").and_then(Value::as_str).unwrap_or("identity");
        let out = match op {
            "identity" => Value::String(text.to_string()),
            "uppercase" => Value::String(text.to_uppercase()),
            "lowercase" => Value::String(text.to_lowercase()),
            "trim" => Value::String(text.trim().to_string()),
            "lines" => Value::Array(text.lines().map(|l| Value::String(l.to_string())).collect()),
            "split" => {
                let sep = input.get("separator").and_then(Value::as_str).unwrap_or(",");
                Value::Array(text.split(sep).map(|s| Value::String(s.to_string())).collect())
            }
            "join" => {
                let sep = input.get("separator").and_then(Value::as_str).unwrap_or(",");
                let parts = input
                    .get("parts")
                    .and_then(Value::as_array)
                    .ok_or("join requires a parts array")?;
                let joined = parts
                    .iter()
                    .map(value_to_splice_string)
                    .collect::<Vec<_>>()
                    .join(sep);
                Value::String(joined)
            }
            "replace" => {
                let from = input.get("from").and_then(Value::as_str).unwrap_or("");
                let to = input.get("to").and_then(Value::as_str).unwrap_or("");
                Value::String(text.replace(from, to))
            }
            "slice" => {
                let start = input.get("start").and_then(Value::as_u64).unwrap_or(0) as usize;
                let end = input
                    .get("end")
                    .and_then(Value::as_u64)
                    .map(|e| e as usize)
                    .unwrap_or(text.chars().count());
                let sliced: String = text.chars().skip(start).take(end.saturating_sub(start)).collect();
                Value::String(sliced)
            }
            other => return Err(format!("unknown transform.text op: {other}")),
        };
        Ok(out)
    }
}

struct HttpGetAction;
#[async_trait]
impl Action for HttpGetAction {
    async fn run(&self, input: Value) -> Result<Value, String> {
        let url = input.get("url").and_then(Value::as_str).ok_or("missing url")?;
        let response = reqwest::get(url).await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "status": status, "body": body }))
    }
}

struct HttpPostAction;
#[async_trait]
impl Action for HttpPostAction {
    async fn run(&self, input: Value) -> Result<Value, String> {
        let url = input.get("url").and_then(Value::as_str).ok_or("missing url")?;
        let body = input.get("body").cloned().unwrap_or(Value::Null);
        let client = reqwest::Client::new();
        let response = client.post(url).json(&body).send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "status": status, "body": text }))
    }
}

/// Runs an arbitrary shell command with an output cap and a hard timeout —
/// the one built-in action capable of leaving the sandboxed pipeline model,
/// so it is the most tightly bounded.
struct ShellExecAction;
#[async_trait]
impl Action for ShellExecAction {
    async fn run(&self, input: Value) -> Result<Value, String> {
        let command = input.get("command").and_then(Value::as_str).ok_or("missing command")?;
        let timeout_ms = input.get("timeout_ms").and_then(Value::as_u64).unwrap_or(30_000);
        let max_output_chars = input.get("max_output_chars").and_then(Value::as_u64).unwrap_or(20_000) as usize;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        let output = tokio::time::timeout(Duration::from_millis(timeout_ms), cmd.output())
            .await
            .map_err(|_| "shell command timed out".to_string())?
            .map_err(|e| e.to_string())?;

        let stdout: String = String::from_utf8_lossy(&output.stdout)
            .chars()
            .take(max_output_chars)
            .collect();
        Ok(serde_json::json!({
            "exit_code": output.status.code(),
            "stdout": stdout,
        }))
    }
}

/// Default `llm.complete` handler — model completion is pluggable per §1,
/// so the kernel ships only this stub; a real provider overrides it via
/// `register_action("llm.complete", ...)`.
struct UnconfiguredLlmAction;
#[async_trait]
impl Action for UnconfiguredLlmAction {
    async fn run(&self, _input: Value) -> Result<Value, String> {
        Err("no llm.complete provider registered".to_string())
    }
}

/// Minimal YAML subset loader for skill manifests: scalars, maps,
/// sequences, multi-line `|`/`>` blocks, and quoted strings. Ranges/lists/
/// steps in the cron sense are deliberately not part of this grammar —
/// per §4.4 that shorthand only applies to cron expressions, not skills.
pub fn load_manifest_yaml(yaml: &str) -> Result<SkillDefinition, SkillError> {
    let value = parse_yaml_subset(yaml).map_err(SkillError::Invalid)?;
    serde_json::from_value(value).map_err(|e| SkillError::Invalid(e.to_string()))
}

pub fn load_manifest_json(json: &str) -> Result<SkillDefinition, SkillError> {
    serde_json::from_str(json).map_err(|e| SkillError::Invalid(e.to_string()))
}

/// A deliberately small YAML-subset parser: indentation-based maps and
/// sequences, quoted/unquoted scalars, and `|`/`>` block scalars. No
/// anchors, tags, or flow collections — those aren't used by skill
/// manifests in this system.
fn parse_yaml_subset(yaml: &str) -> Result<Value, String> {
    let lines: Vec<&str> = yaml.lines().filter(|l| !l.trim_start().starts_with('#')).collect();
    let mut pos = 0;
    parse_block(&lines, &mut pos, 0)
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn parse_block(lines: &[&str], pos: &mut usize, min_indent: usize) -> Result<Value, String> {
    while *pos < lines.len() && lines[*pos].trim().is_empty() {
        *pos += 1;
    }
    if *pos >= lines.len() {
        return Ok(Value::Null);
    }
    let base_indent = indent_of(lines[*pos]);
    if base_indent < min_indent {
        return Ok(Value::Null);
    }
    if lines[*pos].trim_start().starts_with("- ") || lines[*pos].trim() == "-" {
        let mut seq = Vec::new();
        while *pos < lines.len() {
            if lines[*pos].trim().is_empty() {
                *pos += 1;
                continue;
            }
            let indent = indent_of(lines[*pos]);
            if indent != base_indent || !lines[*pos].trim_start().starts_with('-') {
                break;
            }
            let rest = lines[*pos].trim_start()[1..].trim_start();
            if rest.is_empty() {
                *pos += 1;
                seq.push(parse_block(lines, pos, base_indent + 1)?);
            } else if rest.contains(':') {
                // Inline first key of a mapped sequence item: splice a
                // synthetic line back at the item's content indent so the
                // map parser below can continue consuming sibling keys.
                let content_indent = lines[*pos].len() - rest.len();
                let mut rewritten: Vec<String> = vec![" ".repeat(content_indent) + rest];
                *pos += 1;
                while *pos < lines.len()
                    && (lines[*pos].trim().is_empty() || indent_of(lines[*pos]) >= content_indent)
                    && !(indent_of(lines[*pos]) == base_indent && lines[*pos].trim_start().starts_with('-'))
                {
                    rewritten.push(lines[*pos].to_string());
                    *pos += 1;
                }
                let owned: Vec<&str> = rewritten.iter().map(|s| s.as_str()).collect();
                let mut sub_pos = 0;
                seq.push(parse_block(&owned, &mut sub_pos, content_indent)?);
            } else {
                seq.push(parse_scalar(rest));
                *pos += 1;
            }
        }
        return Ok(Value::Array(seq));
    }

    let mut map = serde_json::Map::new();
    while *pos < lines.len() {
        if lines[*pos].trim().is_empty() {
            *pos += 1;
            continue;
        }
        let indent = indent_of(lines[*pos]);
        if indent < base_indent {
            break;
        }
        if indent > base_indent {
            break;
        }
        let line = lines[*pos].trim();
        let Some(colon) = line.find(':') else { break };
        let key = line[..colon].trim().trim_matches('"').to_string();
        let rest = line[colon + 1..].trim();

        if rest.is_empty() {
            *pos += 1;
            let value = parse_block(lines, pos, base_indent + 1)?;
            map.insert(key, value);
        } else if rest == "|" || rest == ">" {
            let folded = rest == ">";
            *pos += 1;
            let mut block_lines = Vec::new();
            let block_indent = if *pos < lines.len() { indent_of(lines[*pos]) } else { base_indent + 1 };
            while *pos < lines.len() && (lines[*pos].trim().is_empty() || indent_of(lines[*pos]) >= block_indent) {
                if lines[*pos].trim().is_empty() {
                    block_lines.push(String::new());
                } else {
                    block_lines.push(lines[*pos][block_indent.min(lines[*pos].len())..].to_string());
                }
                *pos += 1;
            }
            let text = if folded { block_lines.join(" ") } else { block_lines.join("\n") };
            map.insert(key, Value::String(text));
        } else {
            map.insert(key, parse_scalar(rest));
            *pos += 1;
        }
    }
    Ok(Value::Object(map))
}

fn parse_scalar(raw: &str) -> Value {
    let raw = raw.trim();
    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "~" | "" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, action: &str, params: Value) -> SkillStep {
        SkillStep { id: id.into(), action: action.into(), params, condition: None }
    }

    fn skill(id: &str, steps: Vec<SkillStep>, output_template: Value) -> SkillDefinition {
        SkillDefinition {
            id: id.into(),
            name: id.into(),
            version: "1.0.0".into(),
            description: "".into(),
            inputs: HashMap::new(),
            steps,
            output_template,
        }
    }

    #[test]
    fn validate_rejects_empty_steps() {
        let s = skill("x", vec![], serde_json::json!("{{steps.a}}"));
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_step_ids() {
        let s = skill(
            "x",
            vec![
                step("a", "transform.text", serde_json::json!({})),
                step("a", "transform.text", serde_json::json!({})),
            ],
            serde_json::json!("{{steps.a}}"),
        );
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_output_template() {
        let s = skill("x", vec![step("a", "transform.text", serde_json::json!({}))], Value::Null);
        assert!(s.validate().is_err());
    }

    #[test]
    fn whole_string_interpolation_preserves_type() {
        let scope = serde_json::json!({ "steps": { "fetch": { "status": 200 } } });
        let resolved = interpolate(&Value::String("{{steps.fetch.status}}".into()), &scope);
        assert_eq!(resolved, serde_json::json!(200));
    }

    #[test]
    fn inline_interpolation_splices_as_string() {
        let scope = serde_json::json!({ "steps": { "fetch": { "status": 200 } } });
        let resolved = interpolate(&Value::String("status was {{steps.fetch.status}}!".into()), &scope);
        assert_eq!(resolved, Value::String("status was 200!".to_string()));
    }

    #[test]
    fn missing_path_resolves_empty_not_literal() {
        let scope = serde_json::json!({ "steps": {} });
        let resolved = interpolate(&Value::String("{{steps.nope.field}}".into()), &scope);
        assert_eq!(resolved, Value::Null);
        let inline = interpolate(&Value::String("x{{steps.nope.field}}y".into()), &scope);
        assert_eq!(inline, Value::String("xy".to_string()));
    }

    #[tokio::test]
    async fn count_then_stringify_matches_output_template() {
        let executor = SkillExecutor::new();
        let s = skill(
            "counter",
            vec![
                step(
                    "count",
                    "transform.json",
                    serde_json::json!({ "value": [1, 2, 3], "op": "count" }),
                ),
                step(
                    "stringify",
                    "transform.json",
                    serde_json::json!({ "value": "{{steps.count}}", "op": "stringify" }),
                ),
            ],
            serde_json::json!("{{steps.stringify}}"),
        );
        let result = executor.run(&s).await;
        assert!(result.success);
        assert_eq!(result.steps[0].output, serde_json::json!(3));
        assert_eq!(result.output, Value::String("3".to_string()));
    }

    #[tokio::test]
    async fn pipeline_halts_on_first_failure() {
        let executor = SkillExecutor::new();
        let s = skill(
            "test",
            vec![
                step("ok", "transform.text", serde_json::json!({ "text": "hi", "op": "uppercase" })),
                step("bad", "transform.text", serde_json::json!({ "text": "hi", "op": "nope" })),
                step("unreached", "transform.text", serde_json::json!({ "text": "hi" })),
            ],
            serde_json::json!("{{steps.ok}}"),
        );
        let result = executor.run(&s).await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(result.steps.len(), 2);
    }

    #[tokio::test]
    async fn conditional_step_is_skipped_when_falsy() {
        let executor = SkillExecutor::new();
        let s = skill(
            "test",
            vec![SkillStep {
                id: "maybe".into(),
                action: "transform.text".into(),
                params: serde_json::json!({ "text": "hi" }),
                condition: Some("{{inputs.flag}}".into()),
            }],
            serde_json::json!("done"),
        );
        let result = executor.run(&s).await;
        assert!(result.steps[0].skipped);
    }

    #[tokio::test]
    async fn unknown_action_produces_error() {
        let executor = SkillExecutor::new();
        let s = skill("test", vec![step("x", "no.such.action", serde_json::json!({}))], serde_json::json!("done"));
        let result = executor.run(&s).await;
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn register_replaces_by_id_without_growing_list() {
        let executor = SkillExecutor::new();
        let s1 = skill("dup", vec![step("a", "transform.text", serde_json::json!({}))], serde_json::json!("x"));
        let mut s2 = s1.clone();
        s2.description = "replaced".to_string();
        executor.register(s1).unwrap();
        executor.register(s2).unwrap();
        assert_eq!(executor.list().len(), 1);
        assert_eq!(executor.get("dup").unwrap().description, "replaced");
    }

    #[tokio::test]
    async fn execute_applies_defaults_and_errors_on_missing_required() {
        let executor = SkillExecutor::new();
        let mut inputs = HashMap::new();
        inputs.insert(
            "name".to_string(),
            InputSpec { type_name: "string".into(), description: "".into(), required: true, default: None },
        );
        inputs.insert(
            "greeting".to_string(),
            InputSpec {
                type_name: "string".into(),
                description: "".into(),
                required: false,
                default: Some(Value::String("hello".into())),
            },
        );
        let s = SkillDefinition {
            id: "greet".into(),
            name: "greet".into(),
            version: "1.0.0".into(),
            description: "".into(),
            inputs,
            steps: vec![step(
                "say",
                "transform.text",
                serde_json::json!({ "text": "{{inputs.greeting}} {{inputs.name}}", "op": "identity" }),
            )],
            output_template: serde_json::json!("{{steps.say}}"),
        };
        executor.register(s).unwrap();

        let missing = executor.execute("greet", serde_json::json!({})).await;
        assert!(matches!(missing, Err(SkillError::MissingInput(_))));

        let ok = executor.execute("greet", serde_json::json!({ "name": "Ada" })).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.output, Value::String("hello Ada".to_string()));
    }

    #[test]
    fn yaml_subset_parses_scalars_maps_and_sequences() {
        let yaml = "id: demo\nname: Demo\nversion: \"1.0.0\"\nsteps:\n  - id: a\n    action: transform.text\n";
        let value = parse_yaml_subset(yaml).unwrap();
        assert_eq!(value["id"], serde_json::json!("demo"));
        assert_eq!(value["steps"][0]["action"], serde_json::json!("transform.text"));
    }

    #[test]
    fn yaml_subset_parses_block_scalar() {
        let yaml = "description: |\n  line one\n  line two\n";
        let value = parse_yaml_subset(yaml).unwrap();
        assert_eq!(value["description"], serde_json::json!("line one\nline two"));
    }
}
