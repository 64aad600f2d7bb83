//! Document Rendering Collaborator
//!
//! External interface boundary for the document-to-binary rendering
//! toolchain. The session manager only knows the call contract: hand over
//! finalized text and a format, get bytes back. Failures are their own
//! error class and are never retried by this subsystem — a rendering
//! failure is not a session failure.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ChorusError;

/// Output formats the rendering toolchain can produce
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderFormat {
    /// Typeset PDF
    Pdf,
    /// Standalone HTML
    Html,
}

impl RenderFormat {
    /// The conventional file extension for this format
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Html => "html",
        }
    }
}

/// Renders finalized content into a binary document
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    /// Render `content` into the requested format
    ///
    /// # Errors
    ///
    /// Returns `ChorusError::Render` on any toolchain failure. Callers must
    /// not retry: the input is deterministic, so the toolchain would fail
    /// again.
    async fn render(&self, content: &str, format: RenderFormat) -> Result<Vec<u8>, ChorusError>;
}

/// Renderer that shells out to an external command
///
/// The command receives the content on stdin and the format's extension as
/// its final argument; it must write the rendered document to stdout.
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    /// Create a renderer for the given program and base arguments
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl DocumentRenderer for CommandRenderer {
    async fn render(&self, content: &str, format: RenderFormat) -> Result<Vec<u8>, ChorusError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(format.extension())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ChorusError::Render(format!("failed to spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(content.as_bytes())
                .await
                .map_err(|e| ChorusError::Render(format!("failed to write content: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ChorusError::Render(format!("renderer did not finish: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ChorusError::Render(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}
