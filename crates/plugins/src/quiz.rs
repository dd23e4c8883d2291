//! Quiz grading plugin.
//!
//! Scores a response against the correct answers stored in the plugin config
//! and writes the result onto the response as metadata. Grading itself is a
//! pure function ([`grade`]); the handler only fetches the response and
//! persists the outcome.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};

use formplug_core::{PluginError, PluginResult, ResponseId};
use formplug_events::Event;

use crate::context::{DataAccessError, PluginContext};
use crate::handler::{ExecutionMode, PluginHandler, PluginMetadata};
use crate::settings::{Issues, PluginSettings, ValidationError, parse_raw};

pub const PLUGIN_TYPE: &str = "quiz-grading";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizField {
    pub field_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_label: Option<String>,
    pub correct_answer: JsonValue,
    pub marks: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizGradingSettings {
    pub quiz_fields: Vec<QuizField>,
    pub pass_threshold: f64,
}

pub fn validate(raw: &JsonValue) -> Result<PluginSettings, ValidationError> {
    let settings: QuizGradingSettings = parse_raw(PLUGIN_TYPE, raw)?;
    let mut issues = Issues::default();

    issues.check(!settings.quiz_fields.is_empty(), || "quizFields is empty".to_string());
    issues.check((0.0..=100.0).contains(&settings.pass_threshold), || {
        format!("passThreshold must be between 0 and 100, got {}", settings.pass_threshold)
    });

    let mut seen = std::collections::BTreeSet::new();
    for (i, field) in settings.quiz_fields.iter().enumerate() {
        issues.check(!field.field_id.trim().is_empty(), || format!("quizFields[{i}].fieldId is empty"));
        issues.check(field.marks.is_finite() && field.marks > 0.0, || {
            format!("quizFields[{i}].marks must be a positive number, got {}", field.marks)
        });
        issues.check(seen.insert(field.field_id.as_str()), || {
            format!("quizFields[{i}].fieldId `{}` appears more than once", field.field_id)
        });
    }

    issues.finish(PLUGIN_TYPE, PluginSettings::QuizGrading(settings))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldScore {
    pub field_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_label: Option<String>,
    pub submitted_answer: JsonValue,
    pub correct_answer: JsonValue,
    pub is_correct: bool,
    pub marks_awarded: f64,
    pub max_marks: f64,
}

/// Outcome of grading one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizResult {
    pub quiz_score: f64,
    pub total_marks: f64,
    pub percentage: f64,
    pub passed: bool,
    pub field_results: Vec<FieldScore>,
}

/// Grade `answers` against `settings`.
///
/// Each field is all-or-nothing: full marks when the submitted value equals
/// the correct answer exactly (same JSON type and value), zero otherwise.
/// A missing answer counts as wrong. `passed` compares the exact ratio with
/// the threshold; only the reported `percentage` is rounded to two decimals.
pub fn grade(settings: &QuizGradingSettings, answers: &Map<String, JsonValue>) -> QuizResult {
    let field_results: Vec<FieldScore> = settings
        .quiz_fields
        .iter()
        .map(|field| {
            let submitted = answers.get(&field.field_id).cloned().unwrap_or(JsonValue::Null);
            let is_correct = submitted == field.correct_answer;
            FieldScore {
                field_id: field.field_id.clone(),
                field_label: field.field_label.clone(),
                submitted_answer: submitted,
                correct_answer: field.correct_answer.clone(),
                is_correct,
                marks_awarded: if is_correct { field.marks } else { 0.0 },
                max_marks: field.marks,
            }
        })
        .collect();

    let quiz_score: f64 = field_results.iter().map(|f| f.marks_awarded).sum();
    let total_marks: f64 = field_results.iter().map(|f| f.max_marks).sum();
    let exact = if total_marks > 0.0 {
        quiz_score / total_marks * 100.0
    } else {
        0.0
    };

    QuizResult {
        quiz_score,
        total_marks,
        percentage: round2(exact),
        passed: exact >= settings.pass_threshold,
        field_results,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Writes grading results onto the response record.
#[async_trait]
pub trait ResponseMetadataWriter: Send + Sync {
    async fn write_quiz_result(&self, response_id: ResponseId, result: &QuizResult) -> Result<(), DataAccessError>;
}

pub struct QuizGradingHandler {
    metadata: Arc<dyn ResponseMetadataWriter>,
}

impl QuizGradingHandler {
    pub fn new(metadata: Arc<dyn ResponseMetadataWriter>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl PluginHandler for QuizGradingHandler {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            plugin_type: PLUGIN_TYPE.into(),
            name: "Quiz grading".into(),
            description: "Score responses against correct answers and record the result".into(),
            execution_mode: ExecutionMode::Inline,
        }
    }

    async fn execute(
        &self,
        settings: &PluginSettings,
        event: &Event,
        ctx: &PluginContext,
    ) -> PluginResult<JsonValue> {
        let PluginSettings::QuizGrading(settings) = settings else {
            return Err(PluginError::validation("quiz handler received non-quiz settings"));
        };

        let Some(response_id) = event.response_id() else {
            ctx.logger().debug("event carries no response; nothing to grade");
            return Ok(json!({ "graded": false }));
        };
        let Some(response) = ctx.response(response_id).await? else {
            ctx.logger().warn("response not found; nothing to grade");
            return Ok(json!({ "graded": false, "responseId": response_id }));
        };

        let result = grade(settings, &response.data);
        self.metadata.write_quiz_result(response_id, &result).await?;
        ctx.logger().info(&format!(
            "graded response: {}/{} ({}%)",
            result.quiz_score, result.total_marks, result.percentage
        ));

        Ok(json!({ "graded": true, "responseId": response_id }))
    }
}
