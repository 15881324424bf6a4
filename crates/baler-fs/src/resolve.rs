use crate::error::FsInfoError;
use crate::fs::InputFileSystem;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::io;
use std::path::{Component, Path, PathBuf};

/// Module-resolution collaborator (the equivalent of resolve/resolveContext).
pub trait Resolver: Send + Sync {
    /// Resolve a file request relative to a context directory.
    fn resolve(&self, context: &Path, request: &str) -> io::Result<PathBuf>;

    /// Resolve a directory request relative to a context directory.
    fn resolve_context(&self, context: &Path, request: &str) -> io::Result<PathBuf>;
}

/// Host-loader introspection: the module children of an already-loaded file.
///
/// There is no portable equivalent of a loader cache, so hosts that track
/// loaded modules supply one; `None` for a file falls back to recording its
/// containing directory as an over-approximation.
pub trait ModuleGraph: Send + Sync {
    fn children(&self, path: &Path) -> Option<Vec<PathBuf>>;
}

/// A [`ModuleGraph`] for hosts without loader introspection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoModuleGraph;

impl ModuleGraph for NoModuleGraph {
    fn children(&self, _path: &Path) -> Option<Vec<PathBuf>> {
        None
    }
}

/// The path sets produced by build-dependency resolution.
///
/// `files` and `directories` hold canonical paths. `missing` is filled by
/// callers before snapshotting; resolution itself never adds to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedBuildDependencies {
    pub files: BTreeSet<PathBuf>,
    pub directories: BTreeSet<PathBuf>,
    pub missing: BTreeSet<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum WorkItem {
    Resolve { context: PathBuf, request: String },
    ResolveDirectory { context: PathBuf, request: String },
    File(PathBuf),
    Directory(PathBuf),
    FileDependencies(PathBuf),
    DirectoryDependencies(PathBuf),
}

pub(crate) fn resolve_build_dependencies(
    fs: &dyn InputFileSystem,
    resolver: &dyn Resolver,
    module_graph: &dyn ModuleGraph,
    context: &Path,
    deps: impl IntoIterator<Item = String>,
) -> Result<ResolvedBuildDependencies, FsInfoError> {
    let mut result = ResolvedBuildDependencies::default();
    let mut work: VecDeque<WorkItem> = deps
        .into_iter()
        .map(|request| WorkItem::Resolve {
            context: context.to_path_buf(),
            request,
        })
        .collect();

    let mut seen: HashSet<WorkItem> = HashSet::new();
    while let Some(item) = work.pop_front() {
        if !seen.insert(item.clone()) {
            continue;
        }
        match item {
            WorkItem::Resolve { context, request } => {
                let (request, deps_only) = match request.strip_prefix("deps:") {
                    Some(rest) => (rest.to_string(), true),
                    None => (request, false),
                };
                if request.ends_with('/') || request.ends_with('\\') {
                    let resolved = resolver
                        .resolve_context(&context, &request)
                        .map_err(|err| FsInfoError::resolve(&context, &request, err))?;
                    work.push_back(if deps_only {
                        WorkItem::DirectoryDependencies(resolved)
                    } else {
                        WorkItem::Directory(resolved)
                    });
                } else {
                    let resolved = resolver
                        .resolve(&context, &request)
                        .map_err(|err| FsInfoError::resolve(&context, &request, err))?;
                    work.push_back(if deps_only {
                        WorkItem::FileDependencies(resolved)
                    } else {
                        WorkItem::File(resolved)
                    });
                }
            }
            WorkItem::ResolveDirectory { context, request } => {
                let resolved = resolver
                    .resolve_context(&context, &request)
                    .map_err(|err| FsInfoError::resolve(&context, &request, err))?;
                work.push_back(WorkItem::Directory(resolved));
            }
            WorkItem::File(path) => {
                let canonical = fs
                    .realpath(&path)
                    .map_err(|err| FsInfoError::io(&path, err))?;
                if result.files.insert(canonical.clone()) {
                    work.push_back(WorkItem::FileDependencies(canonical));
                }
            }
            WorkItem::Directory(path) => {
                let canonical = fs
                    .realpath(&path)
                    .map_err(|err| FsInfoError::io(&path, err))?;
                if result.directories.insert(canonical.clone()) {
                    work.push_back(WorkItem::DirectoryDependencies(canonical));
                }
            }
            WorkItem::FileDependencies(path) => match module_graph.children(&path) {
                Some(children) => {
                    for child in children {
                        work.push_back(WorkItem::File(child));
                    }
                }
                None => {
                    // Unknown loader state: over-approximate with the
                    // containing directory.
                    let parent = path.parent().unwrap_or(&path).to_path_buf();
                    work.push_back(WorkItem::Directory(parent));
                }
            },
            WorkItem::DirectoryDependencies(path) => {
                let mut package_root = innermost_package_root(&path);
                let manifest = loop {
                    let manifest_path = package_root.join("package.json");
                    match fs.read(&manifest_path) {
                        Ok(bytes) => break Some((manifest_path, bytes)),
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {
                            match package_root.parent() {
                                Some(parent) => package_root = parent.to_path_buf(),
                                None => break None,
                            }
                        }
                        Err(err) => return Err(FsInfoError::io(&manifest_path, err)),
                    }
                };
                let Some((manifest_path, bytes)) = manifest else {
                    continue;
                };
                let value: serde_json::Value =
                    serde_json::from_slice(&bytes).map_err(|err| FsInfoError::Manifest {
                        path: manifest_path,
                        message: err.to_string(),
                    })?;
                if let Some(dependencies) = value.get("dependencies").and_then(|v| v.as_object()) {
                    for request in dependencies.keys() {
                        work.push_back(WorkItem::ResolveDirectory {
                            context: package_root.clone(),
                            request: request.clone(),
                        });
                    }
                }
            }
        }
    }

    Ok(result)
}

/// The innermost `node_modules/[@scope/]pkg` prefix of `path`, or the path
/// itself when it contains no `node_modules` segment.
fn innermost_package_root(path: &Path) -> PathBuf {
    let components: Vec<Component<'_>> = path.components().collect();
    let Some(index) = components
        .iter()
        .rposition(|c| matches!(c, Component::Normal(name) if *name == "node_modules"))
    else {
        return path.to_path_buf();
    };

    let take = match components.get(index + 1) {
        Some(Component::Normal(name)) if name.to_string_lossy().starts_with('@') => index + 3,
        Some(Component::Normal(_)) => index + 2,
        _ => return path.to_path_buf(),
    };
    if components.len() < take {
        return path.to_path_buf();
    }

    let mut root = PathBuf::new();
    for component in &components[..take] {
        root.push(component.as_os_str());
    }
    root
}
