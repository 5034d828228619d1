use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::site::{DeviceKind, SiteConfig};
use crate::types::{
    Decision, DeviceState, PanelNote, PlugState, Power, TransomDirection, TransomSpeed,
    TransomState,
};

pub const SET_TEMP_MIN_F: i64 = 60;
pub const SET_TEMP_MAX_F: i64 = 90;

#[derive(Clone)]
pub struct DecisionClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    id: Option<String>,
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

const SYSTEM_PROMPT: &str = "Return ONLY JSON that matches the schema described in the prompt. \
     Never claim to be real people; treat named experts as an imagined panel.";

fn schema_instructions(site: &SiteConfig) -> String {
    let device_lines: Vec<String> = site
        .devices
        .iter()
        .map(|d| match d.kind {
            DeviceKind::Transom => format!(
                "  \"{}\": {{\"kind\": \"transom\", \"power\": \"ON|OFF\", \"direction\": \"EXHAUST|DIRECT\", \"speed\": \"LOW|MED|HIGH|TURBO\", \"auto\": true|false, \"set_temp_f\": {}-{}}}",
                d.id, SET_TEMP_MIN_F, SET_TEMP_MAX_F
            ),
            DeviceKind::Plug => format!(
                "  \"{}\": {{\"kind\": \"plug\", \"power\": \"ON|OFF\"}}",
                d.id
            ),
        })
        .collect();

    format!(
        "Respond with JSON of this shape:\n\
         {{\n\
         \"panel\": [{{\"speaker\": \"<panel label>\", \"notes\": \"...\"}}],\n\
         \"actions\": {{\n{}\n}},\n\
         \"hypothesis\": \"...\",\n\
         \"confidence_0_1\": 0.0-1.0,\n\
         \"predictions\": [{{\"target_id\": \"<room or sensor id>\", \"temp_f_delta\": number|null, \"rh_pct_delta\": number|null}}]\n\
         }}\n\
         Every listed device must appear in actions exactly once.",
        device_lines.join(",\n")
    )
}

impl DecisionClient {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_url,
            api_key,
            model,
            timeout,
            client,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask the panel for a structured decision. Any non-conformant response
    /// (refusal, timeout, malformed or out-of-range output) is an error the
    /// caller handles with a fallback decision.
    pub async fn decide(&self, prompt: &str, site: &SiteConfig) -> Result<Decision> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: format!("{}\n\n{}", SYSTEM_PROMPT, schema_instructions(site)),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: 0.2,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let mut req = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow::anyhow!("LLM request timed out after {}s", self.timeout.as_secs())
            } else {
                anyhow::anyhow!("Failed to send LLM request: {e}")
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read body".to_string());
            bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response envelope")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .context("LLM returned no choices")?;

        let mut decision = parse_decision(&content)?;
        validate_decision(&decision, site)?;
        decision.llm_response_id = completion.id;
        Ok(decision)
    }
}

/// Parse a decision out of the raw completion text, tolerating markdown
/// fences and leading prose around the JSON object.
pub fn parse_decision(response: &str) -> Result<Decision> {
    if let Ok(decision) = serde_json::from_str::<Decision>(response) {
        return Ok(decision);
    }

    let json_content = if let Some(start) = response.find("```json") {
        let after_start = &response[start + 7..];
        match after_start.find("```") {
            Some(end) => after_start[..end].trim(),
            None => response,
        }
    } else if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
        &response[start..=end]
    } else {
        response
    };

    serde_json::from_str::<Decision>(json_content).with_context(|| {
        format!(
            "Failed to parse decision JSON. Raw response: {}",
            response.chars().take(500).collect::<String>()
        )
    })
}

/// Schema conformance beyond what serde enforces: value ranges, full device
/// coverage, and non-empty rationale.
pub fn validate_decision(decision: &Decision, site: &SiteConfig) -> Result<()> {
    if !(0.0..=1.0).contains(&decision.confidence_0_1) {
        bail!(
            "decision confidence {} outside [0,1]",
            decision.confidence_0_1
        );
    }
    if decision.hypothesis.trim().is_empty() {
        bail!("decision hypothesis is empty");
    }
    if decision.panel.is_empty() {
        bail!("decision panel is empty");
    }
    for device in &site.devices {
        let action = decision
            .actions
            .get(&device.id)
            .with_context(|| format!("decision missing action for device '{}'", device.id))?;
        match (device.kind, action) {
            (DeviceKind::Transom, DeviceState::Transom(t)) => {
                if !(SET_TEMP_MIN_F..=SET_TEMP_MAX_F).contains(&t.set_temp_f) {
                    bail!(
                        "device '{}' set_temp_f {} outside [{}, {}]",
                        device.id,
                        t.set_temp_f,
                        SET_TEMP_MIN_F,
                        SET_TEMP_MAX_F
                    );
                }
            }
            (DeviceKind::Plug, DeviceState::Plug(_)) => {}
            (expected, _) => {
                bail!(
                    "device '{}' action kind does not match its configured kind {:?}",
                    device.id,
                    expected
                );
            }
        }
    }
    Ok(())
}

fn safe_state_for(kind: DeviceKind) -> DeviceState {
    match kind {
        DeviceKind::Transom => DeviceState::Transom(TransomState {
            power: Power::Off,
            direction: TransomDirection::Exhaust,
            speed: TransomSpeed::Low,
            auto: false,
            set_temp_f: 70,
        }),
        DeviceKind::Plug => DeviceState::Plug(PlugState { power: Power::Off }),
    }
}

/// Deterministic no-op decision used whenever inputs are degraded or the
/// LLM call failed: every device commanded to its safe OFF state,
/// confidence zero, hypothesis naming the failure reason.
pub fn fallback_decision(reason: &str, curator_labels: &[String], site: &SiteConfig) -> Decision {
    let speakers: Vec<String> = if curator_labels.is_empty() {
        vec!["System (fallback)".to_string()]
    } else {
        curator_labels.to_vec()
    };

    let actions: BTreeMap<String, DeviceState> = site
        .devices
        .iter()
        .map(|d| (d.id.clone(), safe_state_for(d.kind)))
        .collect();

    Decision {
        panel: speakers
            .into_iter()
            .map(|speaker| PanelNote {
                speaker,
                notes: reason.to_string(),
            })
            .collect(),
        actions,
        hypothesis: format!("Fallback no-op decision due to error: {}", reason),
        confidence_0_1: 0.0,
        predictions: Vec::new(),
        llm_response_id: None,
    }
}
