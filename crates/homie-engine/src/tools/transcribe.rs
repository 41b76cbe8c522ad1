//! Voice-note transcription via whisper-cli.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use homie_core::error::{HomieError, Result};

use crate::backend::spawn::{spawn_with_timeouts, SpawnTimeouts};

use super::{parse_args, Tool, ToolContext, ToolEffect, ToolTier};

/// Audio larger than this is refused rather than fed to the child.
const MAX_AUDIO_BYTES: u64 = 50 * 1024 * 1024;

pub struct TranscribeAudioTool {
    command: String,
    model_path: PathBuf,
    /// Directory downloaded attachments live in; input paths must stay inside.
    audio_dir: PathBuf,
}

#[derive(Deserialize)]
struct TranscribeArgs {
    path: String,
    #[serde(default)]
    language: Option<String>,
}

impl TranscribeAudioTool {
    pub fn new(command: Option<String>, model_path: PathBuf, audio_dir: PathBuf) -> Self {
        Self {
            command: command.unwrap_or_else(|| "whisper-cli".to_string()),
            model_path,
            audio_dir,
        }
    }
}

#[async_trait]
impl Tool for TranscribeAudioTool {
    fn name(&self) -> &str {
        "transcribe_audio"
    }
    fn description(&self) -> &str {
        "Transcribe a downloaded voice note to text"
    }
    fn tier(&self) -> ToolTier {
        ToolTier::Safe
    }
    fn effects(&self) -> &[ToolEffect] {
        &[ToolEffect::Filesystem, ToolEffect::Subprocess]
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "path to the audio file"},
                "language": {"type": "string", "description": "ISO language hint, e.g. \"en\""}
            },
            "required": ["path"]
        })
    }
    fn timeout_ms(&self) -> Option<u64> {
        Some(120_000)
    }

    async fn execute(&self, ctx: &ToolContext, input: serde_json::Value) -> Result<String> {
        let args: TranscribeArgs = parse_args("transcribe_audio", input)?;

        let audio = contain_path(&self.audio_dir, &args.path)?;
        let size = std::fs::metadata(&audio)
            .map_err(|e| HomieError::SchemaValidation(format!("audio file unreadable: {e}")))?
            .len();
        if size > MAX_AUDIO_BYTES {
            return Err(HomieError::PolicyDenied(format!(
                "audio file too large ({size} bytes)"
            )));
        }

        let out_base = audio.with_extension("transcript");
        let mut cmd = Command::new(&self.command);
        cmd.arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg(&audio)
            .arg("-oj")
            .arg("-of")
            .arg(&out_base)
            .arg("-np");
        if let Some(lang) = &args.language {
            cmd.arg("-l").arg(lang);
        }

        debug!(file = %audio.display(), "running whisper-cli");
        let result = spawn_with_timeouts(
            cmd,
            None,
            SpawnTimeouts::default(),
            &ctx.cancel,
            |_, _| {},
        )
        .await?;

        if !result.success() {
            return Err(HomieError::Internal(format!(
                "whisper-cli failed (exit {:?}): {}",
                result.exit_code,
                result.stderr.chars().take(300).collect::<String>()
            )));
        }

        let json_path = out_base.with_extension("transcript.json");
        let raw = std::fs::read_to_string(&json_path)
            .map_err(|e| HomieError::Internal(format!("transcript output missing: {e}")))?;
        let _ = std::fs::remove_file(&json_path);

        let parsed: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| HomieError::Internal(format!("transcript parse failed: {e}")))?;
        let text = parsed
            .get("transcription")
            .and_then(|t| t.as_array())
            .map(|segments| {
                segments
                    .iter()
                    .filter_map(|s| s.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(text.trim().to_string())
    }
}

/// Canonicalize `input` and require it to stay under `root`. Symlinks that
/// escape the directory are rejected along with `..` traversal.
fn contain_path(root: &Path, input: &str) -> Result<PathBuf> {
    let candidate = {
        let p = Path::new(input);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            root.join(p)
        }
    };
    let canonical = candidate
        .canonicalize()
        .map_err(|e| HomieError::SchemaValidation(format!("audio path invalid: {e}")))?;
    let canonical_root = root
        .canonicalize()
        .map_err(|e| HomieError::Internal(format!("audio dir invalid: {e}")))?;
    if !canonical.starts_with(&canonical_root) {
        return Err(HomieError::PolicyDenied(
            "audio path escapes the attachment directory".into(),
        ));
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.ogg"), b"x").unwrap();

        assert!(contain_path(dir.path(), "ok.ogg").is_ok());
        assert!(contain_path(dir.path(), "../../../etc/passwd").is_err());
    }

    #[test]
    fn symlink_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.ogg");
        std::fs::write(&secret, b"x").unwrap();

        let link = dir.path().join("sneaky.ogg");
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&secret, &link).unwrap();
            let err = contain_path(dir.path(), "sneaky.ogg").unwrap_err();
            assert!(matches!(err, HomieError::PolicyDenied(_)));
        }
    }
}
