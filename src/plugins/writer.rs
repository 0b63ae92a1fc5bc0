/// Built-in document writer: one markdown file per resolved gap.
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::artifact::KnowledgeArtifact;
use crate::error::{ResolutionError, StageError};

use super::{Capability, DocumentWriter, PluginParams, PluginRegistry};

pub fn register(registry: &mut PluginRegistry) -> Result<(), ResolutionError> {
    registry.register_document_writer("markdown", |params| {
        Ok(Arc::new(MarkdownWriter::from_params(params)?) as Arc<dyn DocumentWriter>)
    })
}

#[derive(Debug, Clone)]
pub struct MarkdownWriter {
    dir: PathBuf,
}

impl MarkdownWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_params(params: &PluginParams) -> Result<Self, ResolutionError> {
        let reader = params.reader(Capability::DocumentWriter, "markdown");
        Ok(Self::new(reader.required_str("dir")?))
    }

    /// Reserves the first free path for the artifact by creating it empty;
    /// same-second title collisions get a numeric suffix.
    fn claim_path(&self, artifact: &KnowledgeArtifact) -> io::Result<PathBuf> {
        let file_name = artifact.file_name();
        let stem = file_name.trim_end_matches(".md");
        let candidates = std::iter::once(self.dir.join(&file_name))
            .chain((2u32..).map(|n| self.dir.join(format!("{stem}_{n}.md"))));
        for path in candidates {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(path),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
        Err(io::Error::other("no free artifact file name"))
    }
}

#[async_trait::async_trait]
impl DocumentWriter for MarkdownWriter {
    async fn write(&self, artifact: &KnowledgeArtifact) -> Result<PathBuf, StageError> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            StageError::permanent(format!(
                "failed to create knowledge dir '{}': {err}",
                self.dir.display()
            ))
        })?;
        let path = self.claim_path(artifact).map_err(|err| {
            StageError::permanent(format!(
                "failed to reserve a knowledge file in '{}': {err}",
                self.dir.display()
            ))
        })?;
        let temp = path.with_extension("md.tmp");
        fs::write(&temp, artifact.to_markdown())
            .and_then(|()| fs::rename(&temp, &path))
            .map_err(|err| {
                let _ = fs::remove_file(&temp);
                let _ = fs::remove_file(&path);
                StageError::permanent(format!(
                    "failed to write knowledge file '{}': {err}",
                    path.display()
                ))
            })?;
        tracing::info!(path = %path.display(), title = %artifact.title, "knowledge file written");
        Ok(path)
    }

    async fn read(&self, path: &Path) -> Result<KnowledgeArtifact, StageError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            StageError::permanent(format!(
                "failed to read knowledge file '{}': {err}",
                path.display()
            ))
        })?;
        KnowledgeArtifact::parse_markdown(&raw).map_err(|reason| {
            StageError::permanent(format!(
                "malformed knowledge file '{}': {reason}",
                path.display()
            ))
        })
    }
}
