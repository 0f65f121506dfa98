//! Computational (sandboxed python) and AI (LLM prompt) analysis over a run's
//! items and change events. Both strategies always produce a result.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::warn;
use tracker_adapters::{ChatMessage, CodeExecutionRequest, CodeExecutor, LlmClient};
use tracker_core::{
    AnalysisResult, AnalysisType, ChangeEvent, NormalizedItem, Tracker, TrackerAnalysis,
};

use crate::templates::TemplateRegistry;

pub const ANALYSIS_SYSTEM_PROMPT: &str =
    "You are a helpful analysis assistant. Output valid JSON only.";
const DEFAULT_COMPUTED_FOOTNOTE: &str = "Computed by Python";

/// Python source that rebuilds `value` at runtime. Going through `json.loads`
/// keeps JSON `true`/`false`/`null` valid inside the script.
pub fn python_json_literal(value: &JsonValue) -> serde_json::Result<String> {
    let json = serde_json::to_string(value)?;
    Ok(format!("json.loads({})", serde_json::to_string(&json)?))
}

/// Template prefixed with `items`, `changes` and `threshold_config` assignments.
pub fn build_python_script(
    template: &str,
    items: &[NormalizedItem],
    changes: &[ChangeEvent],
    threshold_config: &BTreeMap<String, JsonValue>,
) -> serde_json::Result<String> {
    let item_data: Vec<&tracker_core::ItemData> = items.iter().map(|i| &i.data).collect();
    Ok(format!(
        "import json\nitems = {}\nchanges = {}\nthreshold_config = {}\n{}",
        python_json_literal(&serde_json::to_value(item_data)?)?,
        python_json_literal(&serde_json::to_value(changes)?)?,
        python_json_literal(&serde_json::to_value(threshold_config)?)?,
        template
    ))
}

/// Last non-empty line of `output`, parsed as JSON.
pub fn parse_last_json_line(output: &str) -> Option<JsonValue> {
    let line = output.lines().rev().find(|l| !l.trim().is_empty())?;
    serde_json::from_str(line.trim()).ok()
}

/// Strips markdown code fences an LLM wraps around JSON replies.
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

fn non_empty_str(value: &JsonValue, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn truthy(value: &JsonValue, key: &str) -> bool {
    value.get(key).and_then(JsonValue::as_bool).unwrap_or(false)
}

pub struct AnalysisEngine {
    templates: Arc<TemplateRegistry>,
    executor: Arc<dyn CodeExecutor>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl AnalysisEngine {
    pub fn new(
        templates: Arc<TemplateRegistry>,
        executor: Arc<dyn CodeExecutor>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        Self {
            templates,
            executor,
            llm,
        }
    }

    pub async fn analyze(
        &self,
        tracker: &Tracker,
        items: &[NormalizedItem],
        changes: &[ChangeEvent],
        run_id: &str,
        now: DateTime<Utc>,
    ) -> AnalysisResult {
        let (kind, summary, triggered, footnote) = match &tracker.analysis {
            TrackerAnalysis::Computational {
                threshold_config,
                python_template_id,
            } => {
                let (summary, triggered, footnote) = self
                    .run_computational(
                        tracker,
                        python_template_id.as_deref(),
                        threshold_config,
                        items,
                        changes,
                    )
                    .await;
                (AnalysisType::Computational, summary, triggered, footnote)
            }
            TrackerAnalysis::Ai {
                prompt_template_id, ..
            } => {
                let (summary, triggered, footnote) = self
                    .run_ai(tracker, prompt_template_id.as_deref(), items, changes)
                    .await;
                (AnalysisType::Ai, summary, triggered, footnote)
            }
        };
        AnalysisResult {
            tracker_id: tracker.id.clone(),
            run_id: run_id.to_string(),
            timestamp: now,
            kind,
            summary,
            triggered,
            footnote,
        }
    }

    async fn run_computational(
        &self,
        tracker: &Tracker,
        template_id: Option<&str>,
        threshold_config: &BTreeMap<String, JsonValue>,
        items: &[NormalizedItem],
        changes: &[ChangeEvent],
    ) -> (String, bool, Option<String>) {
        let template = self.templates.python(template_id);
        let code = match build_python_script(template, items, changes, threshold_config) {
            Ok(code) => code,
            Err(err) => return (format!("Analysis execution error: {err}"), false, None),
        };

        let result = match self
            .executor
            .execute(CodeExecutionRequest {
                code,
                input_data: None,
            })
            .await
        {
            Ok(result) if result.success => result,
            Ok(result) => {
                let message = result.error.unwrap_or_else(|| "execution failed".to_string());
                return (format!("Analysis execution error: {message}"), false, None);
            }
            Err(err) => return (format!("Analysis execution error: {err}"), false, None),
        };

        match parse_last_json_line(&result.output) {
            Some(output) => (
                non_empty_str(&output, "summary").unwrap_or_else(|| "No output".to_string()),
                truthy(&output, "triggered"),
                Some(
                    non_empty_str(&output, "footnote")
                        .unwrap_or_else(|| DEFAULT_COMPUTED_FOOTNOTE.to_string()),
                ),
            ),
            None => {
                warn!(
                    tracker_id = %tracker.id,
                    output = %result.output,
                    "analysis output is not JSON"
                );
                (
                    "Failed to parse output".to_string(),
                    false,
                    Some(DEFAULT_COMPUTED_FOOTNOTE.to_string()),
                )
            }
        }
    }

    async fn run_ai(
        &self,
        tracker: &Tracker,
        template_id: Option<&str>,
        items: &[NormalizedItem],
        changes: &[ChangeEvent],
    ) -> (String, bool, Option<String>) {
        let Some(llm) = &self.llm else {
            return ("AI Adapter not available".to_string(), false, None);
        };

        let template = self.templates.prompt(template_id);
        let prompt = match render_prompt(template, tracker, items, changes) {
            Ok(prompt) => prompt,
            Err(err) => return (format!("AI Analysis failed: {err}"), false, None),
        };
        let messages = [ChatMessage::system(ANALYSIS_SYSTEM_PROMPT), ChatMessage::user(prompt)];

        let content = match llm.complete(&messages).await {
            Ok(content) => content,
            Err(err) => return (format!("AI Analysis failed: {err}"), false, None),
        };
        match serde_json::from_str::<JsonValue>(strip_code_fences(&content)) {
            Ok(reply) => (
                non_empty_str(&reply, "summary")
                    .unwrap_or_else(|| "AI Analysis complete".to_string()),
                truthy(&reply, "triggered"),
                non_empty_str(&reply, "footnote"),
            ),
            Err(err) => {
                warn!(tracker_id = %tracker.id, "llm reply is not JSON");
                (format!("AI Analysis failed: {err}"), false, None)
            }
        }
    }
}

pub fn render_prompt(
    template: &str,
    tracker: &Tracker,
    items: &[NormalizedItem],
    changes: &[ChangeEvent],
) -> serde_json::Result<String> {
    let item_data: Vec<&tracker_core::ItemData> = items.iter().map(|i| &i.data).collect();
    Ok(template
        .replace("{{TARGET}}", &serde_json::to_string(&tracker.target)?)
        .replace("{{ITEMS}}", &serde_json::to_string(&item_data)?)
        .replace("{{CHANGES}}", &serde_json::to_string(changes)?))
}
