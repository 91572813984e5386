//! Annotators turn an image file into searchable text.
//!
//! The ingestion worker only depends on the [`Annotator`] trait. The
//! bundled [`CommandAnnotator`] delegates to an external program (an
//! OCR engine, an image classifier) and reads its stdout.

use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotatorKind {
    /// Text recognized in the image, one line per annotation.
    Ocr,
    /// Content labels with a confidence.
    Labels,
}

impl fmt::Display for AnnotatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ocr => "ocr",
            Self::Labels => "labels",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub text: String,
    pub confidence: Option<f32>,
}

impl Annotation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
        }
    }

    pub fn with_confidence(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence: Some(confidence),
        }
    }
}

#[async_trait]
pub trait Annotator: Send + Sync {
    fn kind(&self) -> AnnotatorKind;

    /// Start loading whatever the annotator needs. May be called again
    /// after a failure.
    async fn prepare(&self) -> Result<()>;

    async fn is_ready(&self) -> bool;

    async fn annotate(&self, path: &Path) -> Result<Vec<Annotation>>;
}

/// Placeholder argument replaced by the image path.
const PATH_PLACEHOLDER: &str = "{}";

/// Runs an external program per image.
///
/// The command line is split on whitespace. A `{}` argument is replaced
/// with the image path; without one the path is appended. Every
/// non-empty stdout line is an annotation, optionally followed by a tab
/// and a confidence in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct CommandAnnotator {
    kind: AnnotatorKind,
    program: String,
    args: Vec<String>,
}

impl CommandAnnotator {
    pub fn new(kind: AnnotatorKind, command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            Error::Config(format!("empty {kind} annotator command"))
        })?;
        Ok(Self {
            kind,
            program,
            args: parts.collect(),
        })
    }

    fn command_args(&self, path: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = self
            .args
            .iter()
            .map(|arg| {
                if arg == PATH_PLACEHOLDER {
                    path.as_os_str().to_os_string()
                } else {
                    OsString::from(arg)
                }
            })
            .collect();
        if !self.args.iter().any(|arg| arg == PATH_PLACEHOLDER) {
            args.push(path.as_os_str().to_os_string());
        }
        args
    }

    fn resolve_program(&self) -> Option<PathBuf> {
        let program = Path::new(&self.program);
        if program.components().count() > 1 {
            return program.is_file().then(|| program.to_path_buf());
        }
        let search_path = std::env::var_os("PATH")?;
        std::env::split_paths(&search_path)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }
}

#[async_trait]
impl Annotator for CommandAnnotator {
    fn kind(&self) -> AnnotatorKind {
        self.kind
    }

    async fn prepare(&self) -> Result<()> {
        match self.resolve_program() {
            Some(found) => {
                debug!(kind = %self.kind, program = %found.display(), "annotator found");
                Ok(())
            }
            None => Err(Error::Annotator(format!(
                "{} annotator program '{}' not found",
                self.kind, self.program
            ))),
        }
    }

    async fn is_ready(&self) -> bool {
        self.resolve_program().is_some()
    }

    async fn annotate(&self, path: &Path) -> Result<Vec<Annotation>> {
        let output = Command::new(&self.program)
            .args(self.command_args(path))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                Error::Annotator(format!("failed to run '{}': {e}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Annotator(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(parse_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `text[\tconfidence]` lines. Unparseable confidences are
/// treated as absent.
pub fn parse_output(stdout: &str) -> Vec<Annotation> {
    stdout
        .lines()
        .filter_map(|line| {
            let (text, confidence) = match line.rsplit_once('\t') {
                Some((text, conf)) => (text, conf.trim().parse::<f32>().ok()),
                None => (line, None),
            };
            let text = text.trim();
            (!text.is_empty()).then(|| Annotation {
                text: text.to_string(),
                confidence,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lines_and_confidences() {
        let parsed = parse_output("Golden Retriever\t0.92\n\n  receipt  \nbeach\tnan?\n");
        assert_eq!(parsed, vec![
            Annotation::with_confidence("Golden Retriever", 0.92),
            Annotation::new("receipt"),
            Annotation::new("beach"),
        ]);
    }

    #[test]
    fn command_line_substitutes_path() {
        let annotator =
            CommandAnnotator::new(AnnotatorKind::Ocr, "tesseract {} - quiet").unwrap();
        let args = annotator.command_args(Path::new("/img/a.png"));
        assert_eq!(args, vec![
            OsString::from("/img/a.png"),
            OsString::from("-"),
            OsString::from("quiet"),
        ]);

        let annotator =
            CommandAnnotator::new(AnnotatorKind::Labels, "classify --top 5").unwrap();
        let args = annotator.command_args(Path::new("/img/a.png"));
        assert_eq!(args.last().unwrap(), &OsString::from("/img/a.png"));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandAnnotator::new(AnnotatorKind::Ocr, "   ").is_err());
    }

    #[tokio::test]
    async fn missing_program_is_not_ready() {
        let annotator = CommandAnnotator::new(
            AnnotatorKind::Ocr,
            "/definitely/not/a/real/ocr-binary",
        )
        .unwrap();
        assert!(!annotator.is_ready().await);
        assert!(annotator.prepare().await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_external_program() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("img.png");
        std::fs::write(&image, "sunset\t0.9\nocean\n").unwrap();

        // `cat` echoes the file, which stands in for annotator output.
        let annotator = CommandAnnotator::new(AnnotatorKind::Labels, "cat").unwrap();
        assert!(annotator.is_ready().await);
        let annotations = annotator.annotate(&image).await.unwrap();
        assert_eq!(annotations, vec![
            Annotation::with_confidence("sunset", 0.9),
            Annotation::new("ocean"),
        ]);

        let failing = CommandAnnotator::new(AnnotatorKind::Labels, "false").unwrap();
        assert!(failing.annotate(&image).await.is_err());
    }
}
