use crate::error::FsInfoError;
use crate::fs::InputFileSystem;
use std::path::{Component, Path, PathBuf};

/// Compute the managed item for `path` below `root`: the package directory,
/// i.e. the first path segment after the root, or the first two when the
/// segment is a scope (`@scope/name`).
///
/// Returns `None` when the path is not strictly below the root, when the
/// relevant segments are hidden (leading dot), or when a scope has no package
/// segment; such paths fall back to per-file tracking.
pub(crate) fn managed_item(root: &Path, path: &Path) -> Option<PathBuf> {
    if path == root || !path.starts_with(root) {
        return None;
    }
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components().filter_map(|c| match c {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    });

    let first = components.next()?;
    if first.starts_with('.') {
        return None;
    }
    if first.starts_with('@') {
        let second = components.next()?;
        if second.starts_with('.') {
            return None;
        }
        Some(root.join(first).join(second))
    } else {
        Some(root.join(first))
    }
}

/// Read `item/package.json` and render its identity as `"name@version"`,
/// with absent fields rendered as empty strings.
///
/// Unlike regular file reads, a missing manifest is a failure: a managed item
/// without a manifest cannot be summarized.
pub(crate) fn read_managed_item_info(
    fs: &dyn InputFileSystem,
    item: &Path,
) -> Result<String, FsInfoError> {
    let manifest = item.join("package.json");
    let bytes = fs
        .read(&manifest)
        .map_err(|err| FsInfoError::io(&manifest, err))?;
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|err| FsInfoError::Manifest {
            path: manifest.clone(),
            message: err.to_string(),
        })?;
    let name = value.get("name").and_then(|v| v.as_str()).unwrap_or("");
    let version = value.get("version").and_then(|v| v.as_str()).unwrap_or("");
    Ok(format!("{name}@{version}"))
}
