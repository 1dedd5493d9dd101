use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::Language;
use crate::gemini::GeminiText;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationReport {
    pub score: u32,
    pub time_complexity: String,
    pub space_complexity: String,
    pub feedback: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
}

impl EvaluationReport {
    /// Stand-in returned whenever the reviewer call fails.
    pub fn unavailable() -> Self {
        Self {
            score: 0,
            time_complexity: "Unknown".to_string(),
            space_complexity: "Unknown".to_string(),
            feedback: "Failed to generate report due to server error.".to_string(),
            strengths: Vec::new(),
            improvements: Vec::new(),
        }
    }

    /// Parse a model reply, tolerating a surrounding markdown fence.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let body = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .and_then(|rest| rest.strip_suffix("```"))
            .unwrap_or(trimmed);
        let mut report: EvaluationReport =
            serde_json::from_str(body.trim()).context("Report is not valid JSON")?;
        report.score = report.score.min(100);
        Ok(report)
    }
}

/// Code execution and end-of-interview review, both backed by one-shot
/// text generation.
#[derive(Clone)]
pub struct ReportClient {
    gemini: GeminiText,
}

impl ReportClient {
    pub fn new(gemini: GeminiText) -> Self {
        Self { gemini }
    }

    pub async fn generate_report(
        &self,
        code: &str,
        language: Language,
        question_title: &str,
    ) -> EvaluationReport {
        let prompt = report_prompt(code, language, question_title);
        let result = async {
            let text = self.gemini.generate(&prompt, true).await?;
            EvaluationReport::parse(&text)
        }
        .await;
        match result {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Report generation failed: {e:#}");
                EvaluationReport::unavailable()
            }
        }
    }

    /// Simulated console output for `code`, or `"Error: ..."`.
    pub async fn run_code(&self, code: &str, language: Language) -> String {
        match self.gemini.generate(&run_prompt(code, language), false).await {
            Ok(text) if text.trim().is_empty() => "No output".to_string(),
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Code execution failed: {e:#}");
                format!("Error: {e}")
            }
        }
    }
}

fn report_prompt(code: &str, language: Language, question_title: &str) -> String {
    format!(
        "Act as a strict Senior Software Engineer Code Reviewer.
Analyze the following solution for the problem \"{question_title}\" written in {language}.

Code:
{code}

Return a JSON object with this exact schema (do not include markdown formatting):
{{
  \"score\": number (0-100),
  \"timeComplexity\": \"string (Big O)\",
  \"spaceComplexity\": \"string (Big O)\",
  \"feedback\": \"string (1-2 sentences summary)\",
  \"strengths\": [\"string\", \"string\"],
  \"improvements\": [\"string\", \"string\"]
}}"
    )
}

fn run_prompt(code: &str, language: Language) -> String {
    format!(
        "You are a {language} code execution engine.
Execute the following code and return the output.
If there are errors, return the error message.
Do not provide explanations, only the console output or return value.

CODE:
{code}"
    )
}
