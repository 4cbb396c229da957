//! Build actions and the context they run in.

use std::{
    io::BufReader,
    path::{Path, PathBuf},
};

use filetime::FileTime;
use fs_err as fs;
use larder_manifest::{
    join_path, split_path, Manifest, ManifestDigest, ManifestDirectory, ManifestNode,
    MANIFEST_FILE_NAME,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    archive::{extract, mime_type_from_path, ExtractOptions},
    BuildError, DirectoryBuilder, PrefixBuilder, TaskHandler,
};

/// Everything a build step may need besides the builder itself.
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    /// Receives progress and answers questions.
    pub handler: &'a dyn TaskHandler,

    /// Finds the directory of an already stored implementation, used by
    /// [`RecipeStep::CopyFrom`].
    pub implementation_path: Option<&'a (dyn Fn(&ManifestDigest) -> Option<PathBuf> + Sync)>,

    /// Opens the files read by [`RecipeStep::Archive`] and [`RecipeStep::SingleFile`]. Without
    /// one they are opened with the rights of the current process.
    pub source_opener: Option<&'a (dyn Fn(&Path) -> Result<fs::File, BuildError> + Sync)>,
}

impl<'a> BuildContext<'a> {
    /// Creates a context without a way to look up other implementations.
    pub fn new(handler: &'a dyn TaskHandler) -> Self {
        Self {
            handler,
            implementation_path: None,
            source_opener: None,
        }
    }

    /// Sets the function used to locate other implementations.
    pub fn with_implementation_lookup(
        self,
        lookup: &'a (dyn Fn(&ManifestDigest) -> Option<PathBuf> + Sync),
    ) -> Self {
        Self {
            implementation_path: Some(lookup),
            ..self
        }
    }

    /// Sets the function used to open the files named by recipe steps.
    pub fn with_source_opener(
        self,
        opener: &'a (dyn Fn(&Path) -> Result<fs::File, BuildError> + Sync),
    ) -> Self {
        Self {
            source_opener: Some(opener),
            ..self
        }
    }

    /// Opens a file named by a recipe step.
    pub fn open_source(&self, path: &Path) -> Result<fs::File, BuildError> {
        match self.source_opener {
            Some(opener) => opener(path),
            None => fs::File::open(path)
                .map_err(|e| BuildError::IoError(format!("open '{}'", path.display()), e)),
        }
    }

    /// The cancellation token of the handler.
    pub fn cancellation_token(&self) -> &CancellationToken {
        self.handler.cancellation_token()
    }

    /// Returns [`BuildError::Cancelled`] if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), BuildError> {
        if self.cancellation_token().is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        Ok(())
    }
}

/// Produces the content of an implementation.
pub trait BuildAction: Send + Sync {
    /// Populates `builder`.
    fn build(
        &self,
        builder: &mut dyn DirectoryBuilder,
        context: &BuildContext<'_>,
    ) -> Result<(), BuildError>;

    /// A serialisable description of the action, if there is one. Only actions with a recipe can
    /// be forwarded to another process.
    fn recipe(&self) -> Option<&Recipe> {
        None
    }
}

/// A [`BuildAction`] backed by a closure, see [`build_fn`].
pub struct FnBuildAction<F>(F);

/// Wraps a closure as a [`BuildAction`].
pub fn build_fn<F>(f: F) -> FnBuildAction<F>
where
    F: Fn(&mut dyn DirectoryBuilder, &BuildContext<'_>) -> Result<(), BuildError> + Send + Sync,
{
    FnBuildAction(f)
}

impl<F> BuildAction for FnBuildAction<F>
where
    F: Fn(&mut dyn DirectoryBuilder, &BuildContext<'_>) -> Result<(), BuildError> + Send + Sync,
{
    fn build(
        &self,
        builder: &mut dyn DirectoryBuilder,
        context: &BuildContext<'_>,
    ) -> Result<(), BuildError> {
        (self.0)(builder, context)
    }
}

/// An ordered list of steps that produce an implementation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    /// The steps, applied in order.
    pub steps: Vec<RecipeStep>,
}

/// A single step of a [`Recipe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecipeStep {
    /// Extracts a local archive.
    Archive {
        /// The archive file.
        path: PathBuf,
        /// The MIME type, guessed from the file name if absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        /// Only extract this sub-directory of the archive.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extract: Option<String>,
        /// Where to place the content, the root if absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<String>,
    },

    /// Copies a single local file.
    SingleFile {
        /// The file to copy.
        path: PathBuf,
        /// The path inside the implementation.
        destination: String,
        /// Whether the file is executable.
        #[serde(default)]
        executable: bool,
        /// The modification time, taken from the source file if absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mtime: Option<i64>,
    },

    /// Removes an entry created by an earlier step.
    Remove {
        /// The entry to remove.
        path: String,
    },

    /// Moves an entry created by an earlier step.
    Rename {
        /// The current path.
        source: String,
        /// The new path.
        destination: String,
    },

    /// Copies (part of) an implementation that is already stored.
    CopyFrom {
        /// The implementation to copy from.
        digest: ManifestDigest,
        /// The directory inside that implementation to copy, the root if absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        /// Where to place the copy, the root if absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<String>,
    },
}

impl Recipe {
    /// Creates a recipe from a list of steps.
    pub fn new(steps: impl IntoIterator<Item = RecipeStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    /// Applies all steps to `builder`.
    pub fn apply(
        &self,
        builder: &mut dyn DirectoryBuilder,
        context: &BuildContext<'_>,
    ) -> Result<(), BuildError> {
        for step in &self.steps {
            context.check_cancelled()?;
            step.apply(builder, context)?;
        }
        Ok(())
    }
}

impl BuildAction for Recipe {
    fn build(
        &self,
        builder: &mut dyn DirectoryBuilder,
        context: &BuildContext<'_>,
    ) -> Result<(), BuildError> {
        self.apply(builder, context)
    }

    fn recipe(&self) -> Option<&Recipe> {
        Some(self)
    }
}

impl RecipeStep {
    fn apply(
        &self,
        builder: &mut dyn DirectoryBuilder,
        context: &BuildContext<'_>,
    ) -> Result<(), BuildError> {
        match self {
            RecipeStep::Archive {
                path,
                mime_type,
                extract: sub_directory,
                destination,
            } => {
                let mime_type = match mime_type {
                    Some(mime_type) => mime_type.as_str(),
                    None => path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .and_then(mime_type_from_path)
                        .ok_or_else(|| {
                            BuildError::UnsupportedArchive(path.display().to_string())
                        })?,
                };
                let file = context.open_source(path)?;
                let options = ExtractOptions {
                    extract: sub_directory.clone(),
                };
                tracing::debug!("extracting '{}' as {mime_type}", path.display());
                match destination {
                    Some(destination) => extract(
                        mime_type,
                        BufReader::new(file),
                        &mut PrefixBuilder::new(builder, destination.clone()),
                        &options,
                        context,
                    ),
                    None => extract(mime_type, BufReader::new(file), builder, &options, context),
                }
            }
            RecipeStep::SingleFile {
                path,
                destination,
                executable,
                mtime,
            } => {
                let mut file = context.open_source(path)?;
                let mtime = match mtime {
                    Some(mtime) => *mtime,
                    None => {
                        let metadata = file.metadata().map_err(|e| {
                            BuildError::IoError(format!("read metadata of '{}'", path.display()), e)
                        })?;
                        FileTime::from_last_modification_time(&metadata).unix_seconds()
                    }
                };
                builder.add_file(destination, &mut file, mtime, *executable)
            }
            RecipeStep::Remove { path } => builder.remove(path),
            RecipeStep::Rename {
                source,
                destination,
            } => builder.rename(source, destination),
            RecipeStep::CopyFrom {
                digest,
                source,
                destination,
            } => copy_from(
                digest,
                source.as_deref().unwrap_or_default(),
                destination.as_deref().unwrap_or_default(),
                builder,
                context,
            ),
        }
    }
}

fn copy_from(
    digest: &ManifestDigest,
    source: &str,
    destination: &str,
    builder: &mut dyn DirectoryBuilder,
    context: &BuildContext<'_>,
) -> Result<(), BuildError> {
    let missing = || BuildError::MissingImplementation(digest.clone());
    let (format, _) = digest.best().ok_or_else(missing)?;
    let root = context
        .implementation_path
        .and_then(|lookup| lookup(digest))
        .ok_or_else(missing)?;

    let manifest = Manifest::load(&root.join(MANIFEST_FILE_NAME), format)?;
    let directory = manifest
        .directory(source)
        .ok_or_else(|| BuildError::NotFound(source.to_string()))?;

    let mut source_root = root;
    source_root.extend(split_path(source));
    builder.add_directory(destination)?;
    copy_directory(directory, &source_root, destination, builder, context)
}

fn copy_directory(
    directory: &ManifestDirectory,
    source: &Path,
    destination: &str,
    builder: &mut dyn DirectoryBuilder,
    context: &BuildContext<'_>,
) -> Result<(), BuildError> {
    for (name, node) in directory.entries() {
        context.check_cancelled()?;
        let from = source.join(name);
        let to = join_path(destination, name);
        match node {
            ManifestNode::File(file) => {
                let mut content = fs::File::open(&from)
                    .map_err(|e| BuildError::IoError(format!("open '{}'", from.display()), e))?;
                builder.add_file(&to, &mut content, file.mtime, file.executable)?;
            }
            ManifestNode::Symlink(_) => {
                builder.add_symlink(&to, &read_symlink(&from)?)?;
            }
            ManifestNode::Directory(child) => {
                builder.add_directory(&to)?;
                copy_directory(child, &from, &to, builder, context)?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn read_symlink(path: &Path) -> Result<String, BuildError> {
    let target = fs::read_link(path)
        .map_err(|e| BuildError::IoError(format!("read link '{}'", path.display()), e))?;
    target
        .into_os_string()
        .into_string()
        .map_err(|_| BuildError::InvalidPath(path.display().to_string()))
}

#[cfg(not(unix))]
fn read_symlink(path: &Path) -> Result<String, BuildError> {
    fs::read_to_string(path)
        .map_err(|e| BuildError::IoError(format!("read '{}'", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SilentTaskHandler, StagingBuilder};
    use assert_matches::assert_matches;
    use larder_manifest::{ManifestFile, ManifestFormat};

    fn staging(dir: &Path) -> StagingBuilder {
        StagingBuilder::new(dir, ManifestFormat::Sha256New, CancellationToken::new())
    }

    #[test]
    fn test_recipe_json() {
        let json = r#"{"steps":[
            {"type":"archive","path":"/tmp/a.tar.gz","extract":"a-1.0"},
            {"type":"single_file","path":"/tmp/run","destination":"bin/run","executable":true},
            {"type":"rename","source":"bin","destination":"libexec"},
            {"type":"remove","path":"docs"}
        ]}"#;
        let recipe: Recipe = serde_json::from_str(json).unwrap();
        assert_eq!(
            recipe.steps[0],
            RecipeStep::Archive {
                path: PathBuf::from("/tmp/a.tar.gz"),
                mime_type: None,
                extract: Some("a-1.0".to_string()),
                destination: None,
            }
        );
        assert_matches!(
            &recipe.steps[1],
            RecipeStep::SingleFile { executable: true, mtime: None, .. }
        );

        let round_trip: Recipe =
            serde_json::from_str(&serde_json::to_string(&recipe).unwrap()).unwrap();
        assert_eq!(round_trip, recipe);
    }

    #[test]
    fn test_apply_recipe() {
        let inputs = tempfile::tempdir().unwrap();
        let script = inputs.path().join("script");
        std::fs::write(&script, "echo hi\n").unwrap();

        let mut tar = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_path("docs/README").unwrap();
        header.set_size(6);
        header.set_mode(0o644);
        header.set_mtime(1000);
        header.set_cksum();
        tar.append(&header, b"readme" as &[u8]).unwrap();
        let archive = inputs.path().join("input.tar");
        std::fs::write(&archive, tar.into_inner().unwrap()).unwrap();

        let recipe = Recipe::new([
            RecipeStep::Archive {
                path: archive,
                mime_type: None,
                extract: None,
                destination: Some("share".to_string()),
            },
            RecipeStep::SingleFile {
                path: script,
                destination: "bin/tool".to_string(),
                executable: true,
                mtime: Some(2000),
            },
            RecipeStep::Rename {
                source: "share/docs/README".to_string(),
                destination: "README".to_string(),
            },
            RecipeStep::Remove {
                path: "share".to_string(),
            },
        ]);

        let dir = tempfile::tempdir().unwrap();
        let mut builder = staging(dir.path());
        let handler = SilentTaskHandler::new();
        recipe
            .build(&mut builder, &BuildContext::new(&handler))
            .unwrap();
        assert!(recipe.recipe().is_some());

        let manifest = builder.into_manifest();
        assert_matches!(
            manifest.get("README"),
            Some(ManifestNode::File(ManifestFile { mtime: 1000, size: 6, .. }))
        );
        assert_matches!(
            manifest.get("bin/tool"),
            Some(ManifestNode::File(ManifestFile { mtime: 2000, executable: true, .. }))
        );
        assert!(manifest.get("share").is_none());
    }

    #[test]
    fn test_source_opener_is_used() {
        let inputs = tempfile::tempdir().unwrap();
        let script = inputs.path().join("script");
        std::fs::write(&script, "echo hi\n").unwrap();
        let recipe = Recipe::new([RecipeStep::SingleFile {
            path: script,
            destination: "run".to_string(),
            executable: true,
            mtime: Some(2000),
        }]);
        let deny = |path: &Path| -> Result<fs::File, BuildError> {
            Err(BuildError::IoError(
                format!("open '{}'", path.display()),
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            ))
        };
        let handler = SilentTaskHandler::new();
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            recipe.apply(
                &mut staging(dir.path()),
                &BuildContext::new(&handler).with_source_opener(&deny)
            ),
            Err(BuildError::IoError(_, e)) if e.kind() == std::io::ErrorKind::PermissionDenied
        );
        assert!(!dir.path().join("run").exists());
    }

    #[test]
    fn test_copy_from() {
        let existing = tempfile::tempdir().unwrap();
        let mut builder = staging(existing.path());
        builder
            .add_file("lib/a.so", &mut "a".as_bytes(), 10, false)
            .unwrap();
        builder
            .add_file("lib/sub/b.so", &mut "b".as_bytes(), 10, true)
            .unwrap();
        let existing_manifest = builder.into_manifest();
        existing_manifest
            .save(&existing.path().join(MANIFEST_FILE_NAME))
            .unwrap();
        let digest = existing_manifest.digest();

        let existing_path = existing.path().to_path_buf();
        let expected = digest.clone();
        let lookup = move |d: &ManifestDigest| (d == &expected).then(|| existing_path.clone());

        let recipe = Recipe::new([RecipeStep::CopyFrom {
            digest: digest.clone(),
            source: Some("lib".to_string()),
            destination: Some("copied".to_string()),
        }]);
        let handler = SilentTaskHandler::new();
        let dir = tempfile::tempdir().unwrap();
        let mut builder = staging(dir.path());
        recipe
            .apply(
                &mut builder,
                &BuildContext::new(&handler).with_implementation_lookup(&lookup),
            )
            .unwrap();

        let manifest = builder.into_manifest();
        assert_eq!(
            manifest.directory("copied"),
            existing_manifest.directory("lib")
        );

        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            recipe.apply(&mut staging(dir.path()), &BuildContext::new(&handler)),
            Err(BuildError::MissingImplementation(_))
        );
    }

    #[test]
    fn test_build_fn() {
        let action = build_fn(|builder, _context| {
            builder.add_file("x", &mut "x".as_bytes(), 1, false)
        });
        assert!(action.recipe().is_none());

        let dir = tempfile::tempdir().unwrap();
        let mut builder = staging(dir.path());
        let handler = SilentTaskHandler::new();
        action
            .build(&mut builder, &BuildContext::new(&handler))
            .unwrap();
        assert!(builder.manifest().get("x").is_some());
    }
}
