//! Textual call surfaces parsed into execution plans.
//!
//! Two forms arrive from the front end:
//!
//! - the tag-delimited single-call form, one tool name as an enclosing tag
//!   with each parameter as a nested tag:
//!   `<read_file><path>/tmp/notes.md</path></read_file>`
//! - the structured multi-call document, a JSON object under an
//!   `execution` key carrying mode, tools, and options (camelCase on the
//!   wire).
//!
//! Both produce an [`ExecutionPlan`]; `parse_plan` sniffs the form from
//! the first non-whitespace character.

use serde::Deserialize;
use serde_json::Value;

use crate::errors::{PlanError, PlanResult};
use crate::plan::{
    ExecutionMode, ExecutionOptions, ExecutionPlan, RetryPolicy, ToolCall,
};

/// Parse either call surface into a plan.
pub fn parse_plan(text: &str) -> PlanResult<ExecutionPlan> {
    let trimmed = text.trim_start();
    match trimmed.chars().next() {
        Some('<') => parse_tagged(text),
        Some('{') => parse_structured(text),
        _ => Err(PlanError::Malformed(
            "expected a tag-delimited call or a JSON execution document".to_string(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Tag-delimited single-call form
// ---------------------------------------------------------------------------

/// Parse `<tool><param>value</param>...</tool>` into a single-mode plan.
///
/// Parameter values that parse as a JSON scalar keep that type; everything
/// else stays a string.
pub fn parse_tagged(text: &str) -> PlanResult<ExecutionPlan> {
    let mut scanner = TagScanner::new(text);

    let tool = scanner.open_tag()?;
    let mut params = serde_json::Map::new();
    loop {
        scanner.skip_whitespace();
        if scanner.try_close_tag(&tool)? {
            break;
        }
        let name = scanner.open_tag()?;
        let value = scanner.text_until_close(&name)?;
        params.insert(name, coerce_scalar(&value));
    }
    scanner.skip_whitespace();
    if !scanner.at_end() {
        return Err(PlanError::Malformed(format!(
            "trailing content after </{tool}>"
        )));
    }

    let params = if params.is_empty() {
        Value::Null
    } else {
        Value::Object(params)
    };
    Ok(ExecutionPlan::single(
        ToolCall::new(tool.clone(), tool).with_params(params),
    ))
}

fn coerce_scalar(text: &str) -> Value {
    let trimmed = text.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
        _ => Value::String(trimmed.to_string()),
    }
}

struct TagScanner<'a> {
    rest: &'a str,
}

impl<'a> TagScanner<'a> {
    fn new(text: &'a str) -> Self {
        Self { rest: text.trim() }
    }

    fn skip_whitespace(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn at_end(&self) -> bool {
        self.rest.is_empty()
    }

    /// Consume `<name>` and return the name.
    fn open_tag(&mut self) -> PlanResult<String> {
        self.skip_whitespace();
        let Some(rest) = self.rest.strip_prefix('<') else {
            return Err(PlanError::Malformed(format!(
                "expected an opening tag near '{}'",
                snippet(self.rest)
            )));
        };
        if rest.starts_with('/') {
            return Err(PlanError::Malformed(format!(
                "unexpected closing tag near '{}'",
                snippet(self.rest)
            )));
        }
        let Some(end) = rest.find('>') else {
            return Err(PlanError::Malformed("unterminated opening tag".to_string()));
        };
        let name = rest[..end].trim().to_string();
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || matches!(c, '_' | '-')) {
            return Err(PlanError::Malformed(format!("invalid tag name '{name}'")));
        }
        self.rest = &rest[end + 1..];
        Ok(name)
    }

    /// Consume `</name>` if it is next; false when something else follows.
    fn try_close_tag(&mut self, name: &str) -> PlanResult<bool> {
        let close = format!("</{name}>");
        if let Some(rest) = self.rest.strip_prefix(close.as_str()) {
            self.rest = rest;
            return Ok(true);
        }
        if self.rest.is_empty() {
            return Err(PlanError::Malformed(format!("missing closing tag </{name}>")));
        }
        Ok(false)
    }

    /// Everything up to `</name>`, consuming the closing tag.
    fn text_until_close(&mut self, name: &str) -> PlanResult<String> {
        let close = format!("</{name}>");
        let Some(pos) = self.rest.find(close.as_str()) else {
            return Err(PlanError::Malformed(format!("missing closing tag </{name}>")));
        };
        let text = self.rest[..pos].to_string();
        self.rest = &self.rest[pos + close.len()..];
        Ok(text)
    }
}

fn snippet(text: &str) -> &str {
    &text[..text.len().min(24)]
}

// ---------------------------------------------------------------------------
// Structured multi-call form
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PlanDocument {
    execution: ExecutionSection,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionSection {
    mode: ExecutionMode,
    tools: Vec<ToolEntry>,
    #[serde(default)]
    options: OptionsEntry,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolEntry {
    name: Option<String>,
    tool_id: Option<String>,
    #[serde(default)]
    depends_on: OneOrMany,
    #[serde(default)]
    params: Value,
    condition: Option<String>,
    retry: Option<RetryEntry>,
    fallback: Option<Box<ToolEntry>>,
    timeout_ms: Option<u64>,
    /// Nested calls for composite groups.
    #[serde(default)]
    tools: Vec<ToolEntry>,
}

#[derive(Deserialize, Default)]
#[serde(untagged)]
enum OneOrMany {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::None => Vec::new(),
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryEntry {
    max_attempts: u32,
    #[serde(default)]
    backoff_ms: u64,
    backoff_multiplier: Option<f64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct OptionsEntry {
    continue_on_error: Option<bool>,
    max_concurrency: Option<usize>,
}

/// Parse the structured JSON multi-call document.
pub fn parse_structured(text: &str) -> PlanResult<ExecutionPlan> {
    let doc: PlanDocument = serde_json::from_str(text)?;

    let calls = doc
        .execution
        .tools
        .into_iter()
        .map(convert_tool)
        .collect::<PlanResult<Vec<_>>>()?;

    // The concurrency bound stays unset unless the document names one, so
    // the engine's configured default can still apply.
    let options = ExecutionOptions {
        continue_on_error: doc.execution.options.continue_on_error.unwrap_or(false),
        max_concurrency: doc.execution.options.max_concurrency.map(|n| n.max(1)),
    };

    Ok(ExecutionPlan::new(doc.execution.mode, calls).with_options(options))
}

fn convert_tool(entry: ToolEntry) -> PlanResult<ToolCall> {
    let is_group = !entry.tools.is_empty();
    let name = entry.name.unwrap_or_default();
    if name.is_empty() && !is_group {
        return Err(PlanError::Malformed(
            "tool entry is missing a name".to_string(),
        ));
    }
    let tool_id = entry.tool_id.unwrap_or_else(|| name.clone());
    if tool_id.is_empty() {
        return Err(PlanError::Malformed(
            "group entry is missing a toolId".to_string(),
        ));
    }

    let mut call = ToolCall::new(tool_id, name).with_params(entry.params);
    call.depends_on = entry.depends_on.into_vec();
    call.condition = entry.condition;
    call.timeout_ms = entry.timeout_ms;
    if let Some(retry) = entry.retry {
        let mut policy = RetryPolicy::new(retry.max_attempts).with_backoff_ms(retry.backoff_ms);
        if let Some(multiplier) = retry.backoff_multiplier {
            policy.backoff_multiplier = multiplier;
        }
        call.retry = Some(policy);
    }
    if let Some(fallback) = entry.fallback {
        call.fallback = Some(Box::new(convert_tool(*fallback)?));
    }
    call.calls = entry
        .tools
        .into_iter()
        .map(convert_tool)
        .collect::<PlanResult<Vec<_>>>()?;
    Ok(call)
}
