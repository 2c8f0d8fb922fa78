//! Code-generation collaborator: prompt construction, the generator trait,
//! and extraction of runnable code from a model response.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::error::{RelayError, Result};

/// Code returned by a generator, before extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedCode {
    /// Raw response text; may still contain fences.
    pub code: String,
    pub explanation: Option<String>,
}

impl GeneratedCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            explanation: None,
        }
    }
}

/// Why a generator could not produce code.
#[derive(Debug, Error)]
pub enum GenerationFailure {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<GenerationFailure> for RelayError {
    fn from(failure: GenerationFailure) -> Self {
        match failure {
            GenerationFailure::Authentication(_) | GenerationFailure::ModelNotFound(_) => {
                Self::Configuration(format!("Code generation is misconfigured: {failure}"))
            }
            GenerationFailure::RateLimited(_) | GenerationFailure::Other(_) => {
                Self::CodeGeneration {
                    message: format!("Failed to generate code: {failure}"),
                    cause: Some(Box::new(failure)),
                }
            }
        }
    }
}

/// Produces script code for a user request.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &str,
        system_prompt: &str,
    ) -> std::result::Result<GeneratedCode, GenerationFailure>;
}

/// System prompt describing the execution environment, the fan-out rule
/// and the available tools.
pub fn build_system_prompt(catalogue_doc: &str, instructions: Option<&str>) -> String {
    let extra = instructions
        .filter(|text| !text.trim().is_empty())
        .map(|text| format!("\n<additional_instructions>\n{text}\n</additional_instructions>\n"))
        .unwrap_or_default();

    format!(
        r#"<system>
<role>
You are an expert JavaScript programmer optimizing for SPEED. Write code that uses tools to accomplish the user's request as fast as possible.
</role>

<environment>
Your code is the body of an async function. Modern JavaScript is available,
but there is no network, filesystem, timers or console.
`await call("server.tool", {{ args }})` invokes a tool and resolves to its result.
A failed tool call rejects with "server.tool: message".
</environment>

<critical_performance_rules>
1. ALWAYS run independent tool calls in PARALLEL using Promise.all()
2. Only await sequentially when a call DEPENDS on a previous result
3. Minimize the number of tool calls
4. Do not use comments or any extra text - output ONLY the final code
</critical_performance_rules>

<output_rules>
Use `return` to output the final result. The return value is captured automatically.
</output_rules>

<example>
<task>Get users and orders, then summarize</task>
<code>
const [users, orders] = await Promise.all([
  call("host.get_users", {{}}),
  call("host.get_orders", {{}})
]);
const stats = await call("host.calculate_stats", {{ values: orders.map((o) => o.total) }});
return {{ users: users.length, stats }};
</code>
</example>

<output_format>
Return ONLY executable JavaScript in a ```javascript code block. No explanations.
</output_format>
{extra}
<available_tools>
{catalogue_doc}
</available_tools>
</system>"#
    )
}

fn code_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"```(?:javascript|js|relay)[ \t]*\r?\n([\s\S]*?)```").expect("valid regex"),
            Regex::new(r"```[ \t]*\r?\n([\s\S]*?)```").expect("valid regex"),
            Regex::new(r"\b(?:let|const|var|await|return)\b|\bcall\(").expect("valid regex"),
        ]
    })
}

/// Pull the script out of a model response.
///
/// Prefers a `js`/`javascript`/`relay` fenced block, then any fenced block,
/// then the raw text if it looks like code.
pub fn extract_code(response: &str) -> Result<String> {
    let [tagged, generic, code_like] = code_patterns();
    for fence in [tagged, generic] {
        if let Some(body) = fence.captures(response).and_then(|c| c.get(1)) {
            return Ok(body.as_str().trim().to_string());
        }
    }

    let trimmed = response.trim();
    if code_like.is_match(trimmed) {
        return Ok(trimmed.to_string());
    }

    let preview: String = trimmed.chars().take(100).collect();
    Err(RelayError::code_generation(format!(
        "No code block found in response. Expected a ```js block but got: \"{preview}...\""
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tagged_block_first() {
        let response = "Here:\n```\nignored\n```\n```js\nreturn 1\n```";
        assert_eq!(extract_code(response).unwrap(), "return 1");

        let response = "```javascript\nconst x = call(\"host.a\")\nreturn x\n```";
        assert_eq!(
            extract_code(response).unwrap(),
            "const x = call(\"host.a\")\nreturn x"
        );
    }

    #[test]
    fn falls_back_to_generic_block() {
        assert_eq!(extract_code("```\nreturn 2\n```").unwrap(), "return 2");
    }

    #[test]
    fn accepts_raw_code() {
        assert_eq!(
            extract_code("  return call(\"host.add\", {a: 1})  ").unwrap(),
            "return call(\"host.add\", {a: 1})"
        );
    }

    #[test]
    fn rejects_prose() {
        let err = extract_code("I cannot help with that.").unwrap_err();
        assert_eq!(err.code(), "CODE_GENERATION_ERROR");
        assert!(err.to_string().contains("No code block found"));
    }

    #[test]
    fn failures_map_to_typed_errors() {
        let err: RelayError = GenerationFailure::Authentication("bad key".into()).into();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
        let err: RelayError = GenerationFailure::ModelNotFound("m".into()).into();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");

        let err: RelayError = GenerationFailure::RateLimited("slow down".into()).into();
        assert_eq!(err.code(), "CODE_GENERATION_ERROR");
        assert_eq!(err.to_json()["cause"], "rate limited: slow down");

        let err: RelayError = GenerationFailure::from(anyhow::anyhow!("network")).into();
        assert_eq!(err.to_string(), "Failed to generate code: network");
    }

    #[test]
    fn prompt_embeds_catalogue_and_instructions() {
        let prompt = build_system_prompt("// No tools available", Some("Prefer tables."));
        assert!(prompt.contains("<available_tools>\n// No tools available\n</available_tools>"));
        assert!(prompt.contains("Prefer tables."));
        assert!(prompt.contains("Promise.all()"));

        let prompt = build_system_prompt("// No tools available", None);
        assert!(!prompt.contains("additional_instructions"));
    }
}
