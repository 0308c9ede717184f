use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tracing::debug;

use crate::agent::{LocateOutcome, LocateRequest, Locator, PlanRequest, Planner, PlannerError};
use crate::state::{Coordinates, Plan, Screenshot};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const PLAN_TOOL: &str = "report_next_step";
const LOCATE_TOOL: &str = "report_coordinates";

#[derive(Clone)]
pub struct LlmConfig {
    pub api_base: String,      // e.g. "https://api.anthropic.com/v1"
    pub api_key: String,       // env ANTHROPIC_API_KEY
    pub planner_model: String, // e.g. "claude-sonnet-4-20250514"
    pub locator_model: String, // e.g. "claude-3-5-sonnet-20241022"
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| "https://api.anthropic.com/v1".into()),
            api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            planner_model: env::var("SCREEN_COPILOT_PLANNER_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".into()),
            locator_model: env::var("SCREEN_COPILOT_LOCATOR_MODEL")
                .unwrap_or_else(|_| "claude-3-5-sonnet-20241022".into()),
            max_tokens: 1024,
            request_timeout: env::var("SCREEN_COPILOT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60)),
        }
    }
}

/// Anthropic Messages API client serving both the planning and the locate call.
#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    cfg: LlmConfig,
}

/// The parts of a Messages API reply we care about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageReply {
    pub text: String,
    pub tool_input: Option<Value>,
}

impl MessageReply {
    /// Everything the model said, text first, then the tool input as JSON.
    pub fn raw(&self) -> Option<String> {
        let mut parts = Vec::new();
        if !self.text.trim().is_empty() {
            parts.push(self.text.clone());
        }
        if let Some(input) = &self.tool_input {
            parts.push(input.to_string());
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

impl LlmClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("ANTHROPIC_API_KEY missing");
        }
        let http = Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, cfg })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.cfg
    }

    /// One multimodal request with a single tool the model is forced to call.
    pub async fn create_message(
        &self,
        model: &str,
        prompt: &str,
        screenshot: &Screenshot,
        tool: Value,
    ) -> Result<MessageReply> {
        let url = format!("{}/messages", self.cfg.api_base);
        let tool_name = tool.get("name").cloned().unwrap_or(Value::Null);
        let req = json!({
          "model": model,
          "max_tokens": self.cfg.max_tokens,
          "tools": [tool],
          "tool_choice": { "type": "tool", "name": tool_name },
          "messages": [
            { "role": "user", "content": [
                { "type": "image", "source": {
                    "type": "base64",
                    "media_type": media_type(screenshot.as_bytes()),
                    "data": B64.encode(screenshot.as_bytes())
                }},
                { "type": "text", "text": prompt }
            ]}
          ]
        });
        debug!(model, screenshot_bytes = screenshot.len(), "sending messages request");

        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("Anthropic error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse Anthropic response JSON")?;
        Self::parse_reply(v)
    }

    fn parse_reply(v: Value) -> Result<MessageReply> {
        // { id, content: [ { type: "text", text } | { type: "tool_use", name, input } ], stop_reason }
        let blocks = v
            .get("content")
            .and_then(|x| x.as_array())
            .context("missing content")?;

        let mut reply = MessageReply::default();
        let mut texts = Vec::new();
        for b in blocks {
            match b.get("type").and_then(|x| x.as_str()) {
                Some("text") => {
                    if let Some(t) = b.get("text").and_then(|x| x.as_str()) {
                        texts.push(t.to_string());
                    }
                }
                Some("tool_use") if reply.tool_input.is_none() => {
                    reply.tool_input = b.get("input").cloned();
                }
                _ => {}
            }
        }
        reply.text = texts.join("\n");
        Ok(reply)
    }

    fn decode_plan(reply: &MessageReply) -> Result<Plan, PlannerError> {
        let input = reply
            .tool_input
            .as_ref()
            .ok_or_else(|| PlannerError::Decoding(format!("no {} call in reply: {}", PLAN_TOOL, reply.text)))?;
        let step = input
            .get("task")
            .and_then(|x| x.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PlannerError::Decoding(format!("missing task in {}", input)))?;
        let description = input.get("description").and_then(|x| x.as_str()).unwrap_or_default();
        let is_complete = input.get("is_complete").and_then(|x| x.as_bool()).unwrap_or(false);
        Ok(Plan { step: step.to_string(), description: description.to_string(), is_complete })
    }

    fn decode_coordinates(reply: &MessageReply) -> LocateOutcome {
        let raw = reply.raw();
        let Some(input) = &reply.tool_input else {
            return LocateOutcome::Decoding { error: format!("no {} call in reply", LOCATE_TOOL), raw };
        };
        match (coordinate_field(input.get("x")), coordinate_field(input.get("y"))) {
            (Some(x), Some(y)) => LocateOutcome::Structured { coordinates: Coordinates::new(x, y), raw },
            _ => LocateOutcome::Decoding { error: format!("x/y not integers in {}", input), raw },
        }
    }
}

fn coordinate_field(v: Option<&Value>) -> Option<i32> {
    match v? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .and_then(|n| i32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn media_type(bytes: &[u8]) -> &'static str {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/png",
    }
}

fn plan_tool() -> Value {
    json!({
      "name": PLAN_TOOL,
      "description": "Report the single next action to take on the interface and whether the goal is already achieved.",
      "input_schema": {
        "type": "object",
        "properties": {
          "task": { "type": "string", "description": "One atomic action, e.g. \"Click the search bar\"" },
          "description": { "type": "string", "description": "What the interface currently shows" },
          "is_complete": { "type": "boolean", "description": "True when the goal is already achieved on this screen" }
        },
        "required": ["task", "description", "is_complete"]
      }
    })
}

fn locate_tool() -> Value {
    json!({
      "name": LOCATE_TOOL,
      "description": "Report the pixel position of the center of the element the action targets.",
      "input_schema": {
        "type": "object",
        "properties": {
          "x": { "type": "integer", "description": "Horizontal pixel position" },
          "y": { "type": "integer", "description": "Vertical pixel position" }
        },
        "required": ["x", "y"]
      }
    })
}

fn plan_prompt(request: &PlanRequest) -> String {
    let mut s = String::new();
    s.push_str("You are looking at a screenshot of a user's screen. The user wants to: ");
    s.push_str(&request.goal);
    s.push_str("\n\nDescribe what the interface currently shows and give exactly ONE next action ");
    s.push_str("(a click, a typed text, a key press) that moves toward the goal from this screen. ");
    s.push_str("Name the UI element precisely. If the goal is already achieved, set is_complete.");
    if !request.step_history.is_empty() {
        s.push_str("\n\nActions already performed, oldest first:\n");
        for step in &request.step_history {
            s.push_str("- ");
            s.push_str(step);
            s.push('\n');
        }
    }
    s
}

fn locate_prompt(request: &LocateRequest) -> String {
    format!(
        "Find the UI element needed for this action: \"{}\".\n\
         Screen context: {}\n\n\
         Return the pixel coordinates of the CENTER of that element. \
         If several elements match, pick the one that fits the context best.",
        request.step,
        if request.description.trim().is_empty() { "none" } else { request.description.as_str() }
    )
}

#[async_trait]
impl Planner for LlmClient {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan, PlannerError> {
        let reply = self
            .create_message(&self.cfg.planner_model, &plan_prompt(request), &request.screenshot, plan_tool())
            .await
            .map_err(|e| PlannerError::Provider(format!("{:#}", e)))?;
        Self::decode_plan(&reply)
    }
}

#[async_trait]
impl Locator for LlmClient {
    async fn locate(&self, request: &LocateRequest) -> LocateOutcome {
        match self
            .create_message(&self.cfg.locator_model, &locate_prompt(request), &request.screenshot, locate_tool())
            .await
        {
            Ok(reply) => Self::decode_coordinates(&reply),
            Err(e) => LocateOutcome::CallFailed { error: format!("{:#}", e) },
        }
    }
}
