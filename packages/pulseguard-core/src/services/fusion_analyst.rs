//! Generative "chief medical officer" analyst for episode fusion.
//!
//! Submits the full episode context (trigger, post-calming vitals, visual
//! check-in) to an external generative model and requires a strict JSON
//! verdict. Anything short of a complete, valid verdict makes the episode
//! engine fall through to threshold fusion.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::services::episodes::{AnalystVerdict, Episode, EpisodeAnalyst};
use crate::state::AnalystConfig;

const SYSTEM_PROMPT: &str = "You are the chief medical officer for a community \
health monitoring system. You analyze biometric data from smartwatches combined \
with visual check-in data from phone cameras to determine whether a detected \
health anomaly is a genuine medical event requiring escalation, or a false \
positive (e.g., exercise, stress, excitement).\n\
\n\
You must return a JSON object with exactly these fields:\n\
- decision: \"escalate\" | \"false_positive\" | \"ambiguous\"\n\
- severity_score: float 0.0-1.0\n\
- confidence: float 0.0-1.0\n\
- reasoning: string (2-3 sentence clinical reasoning)\n\
- caregiver_report: string (1-2 sentence plain-English summary for a family caregiver)\n\
- likely_cause: string (short label like \"exercise\", \"panic_attack\", \
\"cardiac_event\", \"stress\", \"unknown\")";

/// HTTP client for the external generative model.
pub struct GenerativeAnalyst {
    http: reqwest::Client,
    config: AnalystConfig,
}

impl GenerativeAnalyst {
    pub fn new(http: reqwest::Client, config: AnalystConfig) -> Self {
        Self { http, config }
    }

    fn build_prompt(episode: &Episode) -> String {
        let mut parts = vec!["Analyze this episode:\n".to_string()];

        let trigger = &episode.trigger;
        parts.push("## Watch Biometrics (trigger)".to_string());
        parts.push(format!("- Heart Rate: {} bpm", trigger.vitals.heart_rate));
        parts.push(format!("- HRV: {} ms", trigger.vitals.hrv));
        parts.push(format!("- Acceleration: {} g", trigger.vitals.acceleration));
        parts.push(format!("- Skin Temperature: {} C", trigger.vitals.skin_temp));
        parts.push(format!(
            "- Anomaly Type: {}",
            trigger.anomaly_type.as_deref().unwrap_or("N/A")
        ));
        parts.push(format!(
            "- Anomaly Score: {}",
            trigger
                .anomaly_score
                .map_or("N/A".to_string(), |s| s.to_string())
        ));

        if let Some(vitals) = &episode.calming_vitals {
            parts.push("\n## Post-Calming Vitals".to_string());
            parts.push(format!("- Heart Rate: {} bpm", vitals.heart_rate));
            parts.push(format!("- HRV: {} ms", vitals.hrv));
        }

        if let Some(presage) = &episode.presage {
            parts.push("\n## Visual Check-In".to_string());
            parts.push(format!("- Facial Expression: {}", presage.facial_expression));
            parts.push(format!("- Eye Responsiveness: {}", presage.eye_responsiveness));
            parts.push(format!("- Visual Heart Rate: {} bpm", presage.visual_heart_rate));
            parts.push(format!("- Breathing Rate: {}", presage.breathing_rate));
            parts.push(format!("- Confidence: {}", presage.confidence_score));
        } else {
            parts.push("\n## Visual Check-In: Not available".to_string());
        }

        parts.push("\nReturn your analysis as JSON.".to_string());
        parts.join("\n")
    }

    /// Extracts and validates a verdict from the model's response body.
    ///
    /// Field completeness and decision validity come from serde; ranges are
    /// checked explicitly. Any miss rejects the verdict.
    fn parse_verdict(body: &Value) -> Option<AnalystVerdict> {
        let text = body
            .pointer("/candidates/0/content/parts/0/text")?
            .as_str()?;
        let verdict: AnalystVerdict = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[Analyst] Response failed validation: {}", e);
                return None;
            }
        };
        if !(0.0..=1.0).contains(&verdict.severity_score)
            || !(0.0..=1.0).contains(&verdict.confidence)
        {
            log::warn!(
                "[Analyst] Out-of-range scores: severity={}, confidence={}",
                verdict.severity_score,
                verdict.confidence
            );
            return None;
        }
        Some(verdict)
    }
}

#[async_trait]
impl EpisodeAnalyst for GenerativeAnalyst {
    async fn analyze(&self, episode: &Episode) -> Option<AnalystVerdict> {
        if self.config.api_key.is_empty() {
            log::debug!("[Analyst] No API key configured, skipping AI analysis");
            return None;
        }

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.config.endpoint, self.config.model, self.config.api_key
        );
        let request = json!({
            "system_instruction": {"parts": [{"text": SYSTEM_PROMPT}]},
            "contents": [{"parts": [{"text": Self::build_prompt(episode)}]}],
            "generationConfig": {
                "responseMimeType": "application/json",
                "temperature": 0.3,
            },
        });

        let response = match self.http.post(&url).json(&request).send().await {
            Ok(r) => r,
            Err(e) => {
                log::error!("[Analyst] Request failed: {}", e);
                return None;
            }
        };
        if !response.status().is_success() {
            log::error!("[Analyst] Request returned status {}", response.status());
            return None;
        }
        let body: Value = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                log::error!("[Analyst] Invalid response body: {}", e);
                return None;
            }
        };

        let verdict = Self::parse_verdict(&body)?;
        log::info!(
            "[Analyst] decision={:?}, severity={}, cause={}",
            verdict.decision,
            verdict.severity_score,
            verdict.likely_cause
        );
        Some(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TriggerVitals;
    use crate::services::episodes::{EpisodeEngine, NoAnalyst};
    use std::sync::Arc;

    fn wrap(text: &str) -> Value {
        json!({"candidates": [{"content": {"parts": [{"text": text}]}}]})
    }

    #[test]
    fn parse_valid_verdict() {
        let body = wrap(
            r#"{"decision":"escalate","severity_score":0.8,"confidence":0.9,
                "reasoning":"r","caregiver_report":"c","likely_cause":"stress"}"#,
        );
        let verdict = GenerativeAnalyst::parse_verdict(&body).unwrap();
        assert_eq!(verdict.likely_cause, "stress");
    }

    #[test]
    fn parse_rejects_missing_field() {
        let body = wrap(r#"{"decision":"escalate","severity_score":0.8,"confidence":0.9}"#);
        assert!(GenerativeAnalyst::parse_verdict(&body).is_none());
    }

    #[test]
    fn parse_rejects_invalid_decision() {
        let body = wrap(
            r#"{"decision":"panic","severity_score":0.8,"confidence":0.9,
                "reasoning":"r","caregiver_report":"c","likely_cause":"x"}"#,
        );
        assert!(GenerativeAnalyst::parse_verdict(&body).is_none());
    }

    #[test]
    fn parse_rejects_out_of_range_severity() {
        let body = wrap(
            r#"{"decision":"escalate","severity_score":1.8,"confidence":0.9,
                "reasoning":"r","caregiver_report":"c","likely_cause":"x"}"#,
        );
        assert!(GenerativeAnalyst::parse_verdict(&body).is_none());
    }

    #[test]
    fn prompt_mentions_missing_visual_checkin() {
        let engine = EpisodeEngine::new(Arc::new(NoAnalyst));
        let episode = engine.start("d1", "u1", TriggerVitals::default(), None);
        let prompt = GenerativeAnalyst::build_prompt(&episode);
        assert!(prompt.contains("Visual Check-In: Not available"));
    }

    #[tokio::test]
    async fn unconfigured_analyst_declines() {
        let engine = EpisodeEngine::new(Arc::new(NoAnalyst));
        let episode = engine.start("d1", "u1", TriggerVitals::default(), None);
        let analyst = GenerativeAnalyst::new(reqwest::Client::new(), AnalystConfig::default());
        assert!(analyst.analyze(&episode).await.is_none());
    }
}
