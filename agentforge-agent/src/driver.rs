//! LLM Driver: model-agnostic invocation plus strict parsing of the
//! single-action response format.

use crate::error::DriverError;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::io::{self, BufRead, Write};

#[derive(Clone, Debug)]
pub struct AgentResponse {
    pub action: String,
    pub parameters: serde_json::Value,
    pub reasoning: Option<String>,
}

#[derive(Deserialize)]
struct ParsedActionBlock {
    name: String,
    #[serde(default)]
    parameters: serde_yaml::Value,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Model invocation contract: `{system, user}` in, text out.
/// Implementations must be deterministic at temperature 0.
#[async_trait]
pub trait LlmDriver: Send + Sync {
    async fn invoke(&self, system_prompt: &str, context_payload: &str) -> Result<String, DriverError>;
}

/// Parses the fenced `action` block out of a raw model response. Any
/// deviation from the documented shape yields `DriverError::MalformedResponse`
/// so the executor can record an `error` fact and retry once.
pub fn parse_action_block(raw: &str) -> Result<AgentResponse, DriverError> {
    let re = Regex::new(r"(?s)```(?:action)?\s*\n(.*?)```").map_err(|e| DriverError::MalformedResponse(e.to_string()))?;
    let captured = re
        .captures(raw)
        .and_then(|c| c.get(1))
        .ok_or_else(|| DriverError::MalformedResponse("no fenced action block found".to_string()))?;

    let block: ParsedActionBlock = serde_yaml::from_str(captured.as_str())
        .map_err(|e| DriverError::MalformedResponse(format!("action block did not parse as YAML: {e}")))?;

    if block.name.trim().is_empty() {
        return Err(DriverError::MalformedResponse("action name is empty".to_string()));
    }

    let parameters = serde_json::to_value(&block.parameters)
        .map_err(|e| DriverError::MalformedResponse(format!("parameters not representable as JSON: {e}")))?;

    Ok(AgentResponse { action: block.name, parameters, reasoning: block.reasoning })
}

/// Human-in-the-loop variant: prints the prompt to stdout and reads the
/// model's pasted response from stdin, terminated by a line containing only
/// `---END---`.
pub struct HumanInTheLoopDriver;

#[async_trait]
impl LlmDriver for HumanInTheLoopDriver {
    async fn invoke(&self, system_prompt: &str, context_payload: &str) -> Result<String, DriverError> {
        println!("=== SYSTEM ===\n{system_prompt}\n=== CONTEXT ===\n{context_payload}\n=== PASTE RESPONSE, then a line with ---END--- ===");
        io::stdout().flush().ok();

        let stdin = io::stdin();
        let mut response = String::new();
        for line in stdin.lock().lines() {
            let line = line.map_err(|e| DriverError::InvocationFailed(e.to_string()))?;
            if line.trim() == "---END---" {
                break;
            }
            response.push_str(&line);
            response.push('\n');
        }
        Ok(response)
    }
}

/// Automated variant (feature `http-driver`): posts `{system, user}` to a
/// configured HTTP endpoint at temperature 0 and returns the text response.
#[cfg(feature = "http-driver")]
pub struct HttpDriver {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[cfg(feature = "http-driver")]
impl HttpDriver {
    pub fn new(endpoint: String, model: String, api_key: String) -> Self {
        Self { client: reqwest::Client::new(), endpoint, model, api_key }
    }
}

#[cfg(feature = "http-driver")]
#[async_trait]
impl LlmDriver for HttpDriver {
    async fn invoke(&self, system_prompt: &str, context_payload: &str) -> Result<String, DriverError> {
        #[derive(serde::Serialize)]
        struct Request<'a> {
            model: &'a str,
            temperature: f32,
            system: &'a str,
            user: &'a str,
        }

        #[derive(Deserialize)]
        struct Response {
            text: String,
        }

        let body = Request { model: &self.model, temperature: 0.0, system: system_prompt, user: context_payload };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DriverError::InvocationFailed(e.to_string()))?;

        let parsed: Response = response.json().await.map_err(|e| DriverError::InvocationFailed(e.to_string()))?;
        Ok(parsed.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_action_block() {
        let raw = "I will read the file.\n```action\nname: read_file\nparameters:\n  path: src/foo.py\n```\n";
        let parsed = parse_action_block(raw).unwrap();
        assert_eq!(parsed.action, "read_file");
        assert_eq!(parsed.parameters["path"], "src/foo.py");
    }

    #[test]
    fn rejects_response_without_fenced_block() {
        let raw = "I don't know what to do.";
        assert!(parse_action_block(raw).is_err());
    }

    #[test]
    fn rejects_block_with_empty_name() {
        let raw = "```action\nname: \"\"\nparameters: {}\n```";
        assert!(parse_action_block(raw).is_err());
    }
}
