use crate::config::CommandSpec;
use crate::database::WorkItem;
use crate::error::AppError;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    /// Upstream refused for now (rate limit, outage); the item should be retried later.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),
}

/// Performs one stage's work on one item and returns the artifact path.
pub trait StageExecutor: Send + Sync {
    fn execute(&self, item: &WorkItem) -> impl Future<Output = Result<String, ExecutorError>> + Send;
}

/// Runs a configured external program per item.
///
/// The last non-empty line the program prints on stdout is taken as the
/// artifact path. Stderr goes wherever the worker's own stderr goes.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    spec: CommandSpec,
    placeholder: Regex,
}

impl CommandExecutor {
    pub fn new(spec: CommandSpec) -> Result<Self, AppError> {
        Ok(Self {
            spec,
            placeholder: Regex::new(r"\{(\w+)\}").map_err(|e| AppError::Other(e.to_string()))?,
        })
    }

    /// Expand `{placeholder}` arguments for `item`.
    pub fn render_args(&self, item: &WorkItem) -> Vec<String> {
        let vars = item_vars(item);
        self.spec
            .args
            .iter()
            .map(|arg| self.substitute(arg, &vars))
            .collect()
    }

    /// Single left-to-right pass: inserted values are never expanded again.
    /// Unknown names are kept as written.
    fn substitute(&self, template: &str, vars: &HashMap<&'static str, String>) -> String {
        self.placeholder
            .replace_all(template, |caps: &Captures| match vars.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

impl StageExecutor for CommandExecutor {
    async fn execute(&self, item: &WorkItem) -> Result<String, ExecutorError> {
        let args = self.render_args(item);
        log::debug!("Running {} {:?}", self.spec.program, args);

        let child = Command::new(&self.spec.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutorError::Permanent(format!("Failed to spawn {}: {}", self.spec.program, e))
            })?;

        let output = match self.spec.timeout_secs {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output()).await
                {
                    Ok(output) => output,
                    Err(_) => {
                        return Err(ExecutorError::Permanent(format!(
                            "{} timed out after {}s",
                            self.spec.program, secs
                        )))
                    }
                }
            }
            None => child.wait_with_output().await,
        }
        .map_err(|e| {
            ExecutorError::Permanent(format!("Failed to wait for {}: {}", self.spec.program, e))
        })?;

        if !output.status.success() {
            let message = format!("{} failed with status: {}", self.spec.program, output.status);
            return match output.status.code() {
                Some(code) if self.spec.transient_exit_codes.contains(&code) => {
                    Err(ExecutorError::Transient(message))
                }
                _ => Err(ExecutorError::Permanent(message)),
            };
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(str::to_string)
            .ok_or_else(|| {
                ExecutorError::Permanent(format!("{} printed no artifact path", self.spec.program))
            })
    }
}

fn item_vars(item: &WorkItem) -> HashMap<&'static str, String> {
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    HashMap::from([
        ("id", item.id.to_string()),
        ("queue", item.queue_name.clone()),
        ("title", item.item_title.clone()),
        ("url", opt(&item.url)),
        ("guid", opt(&item.guid)),
        ("audio_path", opt(&item.audio_path)),
        ("transcript_path", opt(&item.transcript_path)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ItemStatus;

    fn item() -> WorkItem {
        WorkItem {
            id: 7,
            queue_name: "PodX".to_string(),
            item_title: "Ep 1".to_string(),
            url: Some("https://example.com/ep1.mp3".to_string()),
            guid: None,
            status: ItemStatus::Downloading,
            error_message: None,
            audio_path: None,
            transcript_path: None,
            enrichment_path: None,
            download_started_at: None,
            download_completed_at: None,
            transcribe_started_at: None,
            transcribe_completed_at: None,
            enrich_started_at: None,
            enrich_completed_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn shell(script: &str) -> CommandExecutor {
        CommandExecutor::new(CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            transient_exit_codes: vec![75],
            timeout_secs: None,
        })
        .unwrap()
    }

    #[test]
    fn test_render_args() {
        let exec = CommandExecutor::new(CommandSpec {
            program: "dl".to_string(),
            args: vec![
                "--out".to_string(),
                "episodes/{queue}/{id}.mp3".to_string(),
                "{url}".to_string(),
                "{guid}".to_string(),
                "{unknown}".to_string(),
            ],
            transient_exit_codes: vec![],
            timeout_secs: None,
        })
        .unwrap();
        assert_eq!(
            exec.render_args(&item()),
            vec![
                "--out",
                "episodes/PodX/7.mp3",
                "https://example.com/ep1.mp3",
                "",
                "{unknown}",
            ]
        );
    }

    #[test]
    fn test_values_are_inserted_verbatim() {
        let exec = CommandExecutor::new(CommandSpec {
            program: "dl".to_string(),
            args: vec!["{title}".to_string(), "{url}/{title}".to_string()],
            transient_exit_codes: vec![],
            timeout_secs: None,
        })
        .unwrap();
        let mut item = item();
        item.item_title = "Ask {url} anything {id}".to_string();

        for _ in 0..50 {
            assert_eq!(
                exec.render_args(&item),
                vec![
                    "Ask {url} anything {id}",
                    "https://example.com/ep1.mp3/Ask {url} anything {id}",
                ]
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_last_stdout_line_is_artifact() {
        let exec = shell("echo progress 50%; echo /data/{id}.mp3; echo");
        assert_eq!(exec.execute(&item()).await.unwrap(), "/data/7.mp3");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_transient_exit_code() {
        let result = shell("exit 75").execute(&item()).await;
        assert!(matches!(result, Err(ExecutorError::Transient(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_other_exit_code_is_permanent() {
        let result = shell("exit 2").execute(&item()).await;
        assert!(matches!(result, Err(ExecutorError::Permanent(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_no_output_is_permanent() {
        let result = shell("true").execute(&item()).await;
        assert!(matches!(result, Err(ExecutorError::Permanent(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_permanent() {
        let exec = CommandExecutor::new(CommandSpec {
            program: "sleep".to_string(),
            args: vec!["5".to_string()],
            transient_exit_codes: vec![],
            timeout_secs: Some(0),
        })
        .unwrap();
        let result = exec.execute(&item()).await;
        assert!(matches!(result, Err(ExecutorError::Permanent(msg)) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_missing_program_is_permanent() {
        let exec = CommandExecutor::new(CommandSpec {
            program: "/definitely/not/here".to_string(),
            args: vec![],
            transient_exit_codes: vec![],
            timeout_secs: None,
        })
        .unwrap();
        let result = exec.execute(&item()).await;
        assert!(matches!(result, Err(ExecutorError::Permanent(_))));
    }
}
