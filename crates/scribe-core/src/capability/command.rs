//! Generation through a local command.
//!
//! Runs a configured program (e.g. `claude -p`), writes the prompt to its
//! stdin and reads generated text from stdout, either as plain text lines
//! or as JSONL stream events. The child is spawned with `kill_on_drop`, so
//! dropping the chunk stream (abort, stall timeout) kills the process.

use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::trait_def::{ChunkStream, GenerationRequest, Generator};

/// Env var through which the requested output size reaches the command.
pub const MAX_OUTPUT_TOKENS_ENV: &str = "SCRIBE_MAX_OUTPUT_TOKENS";

/// How the command's stdout is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Every stdout line is generated text.
    #[default]
    Text,
    /// JSONL events; text deltas are extracted, other events ignored.
    StreamJson,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "stream-json" => Ok(Self::StreamJson),
            other => Err(format!(
                "unknown output format {other:?} (expected text or stream-json)"
            )),
        }
    }
}

/// Generator backed by a local command.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    name: String,
    program: String,
    args: Vec<String>,
    format: OutputFormat,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>, format: OutputFormat) -> Self {
        let program = program.into();
        Self {
            name: format!("command:{program}"),
            program,
            args,
            format,
        }
    }

    /// Parse a whitespace-separated command line (`"claude -p"`).
    pub fn from_command_line(line: &str, format: OutputFormat) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next().context("generator command is empty")?;
        Ok(Self::new(program, parts.collect(), format))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }
}

// ---------------------------------------------------------------------------
// JSONL parsing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum StreamLine {
    Text(String),
    Error(String),
    Ignored,
}

/// Parse one JSONL line of a streaming model CLI.
///
/// Recognises incremental deltas (`content_block_delta`), whole assistant
/// messages and bare `{"type":"text"}` events. `result` events repeat text
/// already seen and are ignored.
fn parse_stream_json_line(line: &str) -> Result<StreamLine> {
    let v: serde_json::Value =
        serde_json::from_str(line).context("malformed JSON in stream output")?;
    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    let parsed = match event_type {
        "content_block_delta" => v
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(|t| t.as_str())
            .map_or(StreamLine::Ignored, |t| StreamLine::Text(t.to_string())),
        "assistant" => {
            let text: String = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                        .collect()
                })
                .unwrap_or_default();
            if text.is_empty() {
                StreamLine::Ignored
            } else {
                StreamLine::Text(text)
            }
        }
        "text" => v
            .get("text")
            .and_then(|t| t.as_str())
            .map_or(StreamLine::Ignored, |t| StreamLine::Text(t.to_string())),
        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                .or_else(|| v.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown error")
                .to_string();
            StreamLine::Error(message)
        }
        other => {
            debug!(event_type = other, "ignoring stream-json event");
            StreamLine::Ignored
        }
    };
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// Generator implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Generator for CommandGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let mut chunks = self.stream(request);
        let mut out = String::new();
        while let Some(chunk) = chunks.next().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }

    fn stream(&self, request: &GenerationRequest) -> ChunkStream {
        let program = self.program.clone();
        let args = self.args.clone();
        let format = self.format;
        let prompt = request.prompt.clone();
        let max_output_tokens = request.max_output_tokens;

        let stream = async_stream::stream! {
            let mut cmd = Command::new(&program);
            cmd.args(&args)
                .env(MAX_OUTPUT_TOKENS_ENV, max_output_tokens.to_string())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    yield Err(anyhow::Error::new(e).context(format!(
                        "failed to spawn generator '{program}' -- is it installed and on PATH?"
                    )));
                    return;
                }
            };

            // Feed stdin from its own task so a child that writes before it
            // finishes reading cannot deadlock us.
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                        debug!(error = %e, "generator closed stdin early");
                    }
                    let _ = stdin.shutdown().await;
                });
            }

            let Some(stdout) = child.stdout.take() else {
                yield Err(anyhow::anyhow!("generator stdout not captured"));
                return;
            };
            let mut lines = BufReader::new(stdout).lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match format {
                        OutputFormat::Text => {
                            yield Ok(format!("{line}\n"));
                        }
                        OutputFormat::StreamJson => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            match parse_stream_json_line(trimmed) {
                                Ok(StreamLine::Text(text)) => {
                                    yield Ok(text);
                                }
                                Ok(StreamLine::Error(message)) => {
                                    yield Err(anyhow::anyhow!("generator reported error: {message}"));
                                    return;
                                }
                                Ok(StreamLine::Ignored) => {}
                                Err(e) => {
                                    warn!(line = trimmed, error = %e, "skipping malformed JSONL line");
                                }
                            }
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(anyhow::Error::new(e).context("error reading generator stdout"));
                        return;
                    }
                }
            }

            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    yield Err(anyhow::anyhow!("generator '{program}' exited with {status}"));
                }
                Err(e) => {
                    yield Err(anyhow::Error::new(e).context("failed to wait for generator"));
                }
            }
        };

        Box::pin(stream)
    }
}

/// Fail early when the configured program cannot be found.
pub fn ensure_program_exists(program: &str) -> Result<()> {
    let path = std::path::Path::new(program);
    if path.components().count() > 1 {
        if path.exists() {
            return Ok(());
        }
        bail!("generator program {program} does not exist");
    }
    let found = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false);
    if !found {
        bail!("generator program '{program}' not found on PATH");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_content_block_delta() {
        let line = r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello"}}"#;
        assert_eq!(
            parse_stream_json_line(line).unwrap(),
            StreamLine::Text("Hello".to_string())
        );
    }

    #[test]
    fn parse_assistant_message_joins_text_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"A "},{"type":"tool_use","name":"x"},{"type":"text","text":"B"}]}}"#;
        assert_eq!(
            parse_stream_json_line(line).unwrap(),
            StreamLine::Text("A B".to_string())
        );
    }

    #[test]
    fn parse_result_is_ignored() {
        let line = r#"{"type":"result","result":"everything again"}"#;
        assert_eq!(parse_stream_json_line(line).unwrap(), StreamLine::Ignored);
    }

    #[test]
    fn parse_error_event() {
        let line = r#"{"type":"error","error":{"message":"overloaded"}}"#;
        assert_eq!(
            parse_stream_json_line(line).unwrap(),
            StreamLine::Error("overloaded".to_string())
        );
    }

    #[test]
    fn parse_malformed_line_errors() {
        assert!(parse_stream_json_line("{not json").is_err());
    }

    #[test]
    fn output_format_parses() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!(
            "stream-json".parse::<OutputFormat>().unwrap(),
            OutputFormat::StreamJson
        );
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn command_line_splits_program_and_args() {
        let g = CommandGenerator::from_command_line("claude -p --verbose", OutputFormat::Text)
            .unwrap();
        assert_eq!(g.program(), "claude");
        assert_eq!(g.args(), ["-p", "--verbose"]);
        assert_eq!(g.name(), "command:claude");
        assert!(CommandGenerator::from_command_line("   ", OutputFormat::Text).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn text_command_echoes_prompt() {
        let g = CommandGenerator::new("cat", vec![], OutputFormat::Text);
        let out = g
            .generate(&GenerationRequest::new("line one\nline two", 50))
            .await
            .unwrap();
        assert_eq!(out, "line one\nline two\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stream_json_command_extracts_deltas() {
        let script = r#"cat >/dev/null; printf '%s\n' '{"type":"content_block_delta","delta":{"text":"Hel"}}' 'garbage' '{"type":"content_block_delta","delta":{"text":"lo"}}' '{"type":"result","result":"Hello"}'"#;
        let g = CommandGenerator::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            OutputFormat::StreamJson,
        );
        let out = g.generate(&GenerationRequest::new("ignored", 10)).await.unwrap();
        assert_eq!(out, "Hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_receives_output_budget() {
        let g = CommandGenerator::new(
            "sh",
            vec![
                "-c".to_string(),
                format!("cat >/dev/null; echo ${MAX_OUTPUT_TOKENS_ENV}"),
            ],
            OutputFormat::Text,
        );
        let out = g.generate(&GenerationRequest::new("x", 321)).await.unwrap();
        assert_eq!(out.trim(), "321");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let g = CommandGenerator::new(
            "sh",
            vec!["-c".to_string(), "cat >/dev/null; echo partial; exit 3".to_string()],
            OutputFormat::Text,
        );
        let err = g.generate(&GenerationRequest::new("x", 10)).await.unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let g = CommandGenerator::new("scribe-no-such-binary-xyz", vec![], OutputFormat::Text);
        let err = g.generate(&GenerationRequest::new("x", 10)).await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn"));
        assert!(ensure_program_exists("scribe-no-such-binary-xyz").is_err());
    }
}
