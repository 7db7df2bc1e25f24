//! Export runs: temporary outputters and artifact assembly.
//!
//! [`ExportCoordinator::prepare`] builds one outputter per requested spec,
//! pointing each at a private scratch directory, and attaches them all to
//! the model. When the run ends the coordinator (a [`RunFinalizer`])
//! detaches them, rewinds the model, and, only if the run completed,
//! gathers their files into the session directory: several files are
//! zipped into `<model_name>_output.zip`, a single file is moved as is.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};

use driftline_types::{ChannelEvent, OutputterId};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use crate::model::{ModelError, OutputterFactory, OutputterSpec, SimulationModel};
use crate::step::{RunContext, RunFinalizer, RunOutcome};

/// Errors raised while preparing an export or assembling its artifact.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The request named no outputters.
    #[error("export request has no outputters")]
    NoOutputters,

    /// A requested name is not a plain file name.
    #[error("invalid file name: {name}")]
    InvalidFilename {
        /// The rejected name.
        name: String,
    },

    /// Filesystem access failed.
    #[error("export I/O error on {}: {source}", path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// An outputter produced no file, not even a `.zip` variant.
    #[error("export output missing: {}", path.display())]
    MissingOutput {
        /// The expected output path.
        path: PathBuf,
    },

    /// Writing the zip archive failed.
    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Building outputters, detaching them, or rewinding the model failed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// The blocking archive task did not finish.
    #[error("archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Client request to run the model with temporary outputters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    /// Stem of the zip artifact when several outputters are requested.
    pub model_name: String,
    /// Outputters to attach for the run, keyed by client-chosen labels.
    pub outputters: BTreeMap<String, OutputterSpec>,
}

/// Return `name` if it is a single, normal path component.
pub fn plain_file_name(name: &str) -> Option<&str> {
    let path = Path::new(name);
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(part)), None) if part == path.as_os_str() => Some(name),
        _ => None,
    }
}

/// Name of the zip artifact for a multi-outputter export.
pub fn archive_name(model_name: &str) -> String {
    format!("{model_name}_output.zip")
}

/// Owns an export run's temporary outputters and scratch directory.
#[derive(Debug)]
pub struct ExportCoordinator {
    model_name: String,
    scratch: TempDir,
    outputs: Vec<(OutputterId, PathBuf)>,
}

impl ExportCoordinator {
    /// Build and attach the requested outputters.
    ///
    /// Every outputter is built before any is attached, so a failed build
    /// leaves the model untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError`] if the request is empty, names an invalid
    /// file or two files sharing a base name, the scratch directory cannot
    /// be created, or an outputter cannot be built.
    pub fn prepare(
        request: &ExportRequest,
        model: &mut dyn SimulationModel,
        factory: &dyn OutputterFactory,
        scratch_root: Option<&Path>,
    ) -> Result<Self, ExportError> {
        if request.outputters.is_empty() {
            return Err(ExportError::NoOutputters);
        }
        let model_name = plain_file_name(&request.model_name)
            .ok_or_else(|| ExportError::InvalidFilename {
                name: request.model_name.clone(),
            })?
            .to_owned();

        // Outputters share one scratch directory, keyed by base name.
        let mut names = BTreeSet::new();
        let mut placed = Vec::with_capacity(request.outputters.len());
        for (key, spec) in &request.outputters {
            let name = spec
                .filename
                .file_name()
                .ok_or_else(|| ExportError::InvalidFilename {
                    name: spec.filename.display().to_string(),
                })?;
            if !names.insert(name) {
                return Err(ExportError::InvalidFilename {
                    name: spec.filename.display().to_string(),
                });
            }
            placed.push((key, spec, name));
        }

        let scratch = create_scratch(scratch_root)?;

        let mut built = Vec::with_capacity(placed.len());
        for (key, spec, name) in placed {
            let mut spec = spec.clone();
            spec.filename = scratch.path().join(name);
            let outputter = factory.create(&spec, model)?;
            debug!(key = %key, filename = %spec.filename.display(), "export outputter built");
            built.push(outputter);
        }

        let outputs = built
            .iter()
            .map(|o| (o.id(), o.filename().to_path_buf()))
            .collect();
        for outputter in built {
            info!(filename = %outputter.filename().display(), "attaching export outputter");
            model.add_outputter(outputter);
        }

        Ok(Self {
            model_name,
            scratch,
            outputs,
        })
    }

    /// The private directory outputters write into.
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Files the attached outputters were told to write.
    pub fn output_files(&self) -> impl Iterator<Item = &Path> {
        self.outputs.iter().map(|(_, path)| path.as_path())
    }

    async fn finish(self, ctx: RunContext, outcome: RunOutcome) -> Result<(), ExportError> {
        let result = self.assemble(&ctx, &outcome).await;
        match &result {
            Ok(Some(artifact)) => {
                info!(session = %ctx.session.id(), %artifact, "export finished");
                ctx.emit(ChannelEvent::ExportFinished(artifact.clone())).await;
            }
            Ok(None) => {
                info!(session = %ctx.session.id(), ?outcome, "export run did not complete");
                ctx.emit(ChannelEvent::ExportFailed).await;
            }
            Err(err) => {
                error!(session = %ctx.session.id(), error = %err, "export assembly failed");
                ctx.emit(ChannelEvent::ExportFailed).await;
            }
        }
        result.map(|_| ())
    }

    /// Detach, rewind, and build the artifact. `None` if the run did not
    /// complete.
    async fn assemble(
        &self,
        ctx: &RunContext,
        outcome: &RunOutcome,
    ) -> Result<Option<String>, ExportError> {
        {
            let mut model = ctx.model.lock().await;
            for (id, path) in &self.outputs {
                if model.remove_outputter(*id).is_none() {
                    warn!(filename = %path.display(), "export outputter already detached");
                }
            }
            model.rewind()?;
        }
        debug!(session = %ctx.session.id(), count = self.outputs.len(), "export outputters detached");

        if !outcome.is_completed() {
            return Ok(None);
        }

        let session_dir = ctx.session.dir().to_path_buf();
        tokio::fs::create_dir_all(&session_dir)
            .await
            .map_err(io_error(&session_dir))?;

        let mut files = Vec::with_capacity(self.outputs.len());
        for (_, path) in &self.outputs {
            files.push(locate_output(path).await?);
        }

        if let [single] = files.as_slice() {
            let name = entry_name(single)?;
            move_file(single, &session_dir.join(&name)).await?;
            return Ok(Some(name));
        }

        let name = archive_name(&self.model_name);
        let target = session_dir.join(&name);
        tokio::task::spawn_blocking(move || write_archive(&target, &files)).await??;
        Ok(Some(name))
    }
}

impl RunFinalizer for ExportCoordinator {
    fn finalize(
        self: Box<Self>,
        ctx: RunContext,
        outcome: RunOutcome,
    ) -> BoxFuture<'static, Result<(), ExportError>> {
        (*self).finish(ctx, outcome).boxed()
    }
}

fn create_scratch(root: Option<&Path>) -> Result<TempDir, ExportError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("driftline-export-");
    match root {
        Some(root) => {
            std::fs::create_dir_all(root).map_err(io_error(root))?;
            builder.tempdir_in(root).map_err(io_error(root))
        }
        None => builder
            .tempdir()
            .map_err(io_error(&std::env::temp_dir())),
    }
}

/// The outputter's file, or its `.zip` variant.
async fn locate_output(path: &Path) -> Result<PathBuf, ExportError> {
    if tokio::fs::try_exists(path).await.map_err(io_error(path))? {
        return Ok(path.to_path_buf());
    }
    let mut zipped = OsString::from(path.as_os_str());
    zipped.push(".zip");
    let zipped = PathBuf::from(zipped);
    if tokio::fs::try_exists(&zipped).await.map_err(io_error(&zipped))? {
        return Ok(zipped);
    }
    Err(ExportError::MissingOutput {
        path: path.to_path_buf(),
    })
}

fn entry_name(path: &Path) -> Result<String, ExportError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| ExportError::InvalidFilename {
            name: path.display().to_string(),
        })
}

async fn move_file(from: &Path, to: &Path) -> Result<(), ExportError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Scratch may live on another filesystem.
    tokio::fs::copy(from, to).await.map_err(io_error(to))?;
    tokio::fs::remove_file(from).await.map_err(io_error(from))
}

fn write_archive(target: &Path, files: &[PathBuf]) -> Result<(), ExportError> {
    let file = File::create(target).map_err(io_error(target))?;
    let mut archive = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for path in files {
        archive.start_file(entry_name(path)?, options)?;
        let mut source = File::open(path).map_err(io_error(path))?;
        std::io::copy(&mut source, &mut archive).map_err(io_error(path))?;
    }
    archive.finish()?;
    Ok(())
}
