use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::PackError;

/// One deliverable input file, named by the virtual path consumers will use.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub virtual_path: String,
    pub physical_path: PathBuf,
    pub size: u64,
}

const VCS_DIRS: &[&str] = &[".git", ".svn", ".hg"];

fn excluded(name: &str, patterns: &[glob::Pattern]) -> bool {
    if name.starts_with('.') {
        return true;
    }
    patterns.iter().any(|p| p.matches(name))
}

/// Walk the positional inputs into `(virtual_path, physical_path)` pairs.
///
/// A plain file maps to its basename. A directory contributes its whole
/// tree, virtual paths rooted at the directory name. Dotfiles and VCS
/// artifacts are always skipped; `exclude` adds caller glob patterns
/// matched against file names.
pub fn discover(inputs: &[PathBuf], exclude: &[String]) -> Result<Vec<InputFile>, PackError> {
    let patterns = exclude
        .iter()
        .map(|p| {
            glob::Pattern::new(p).map_err(|e| PackError::InvalidArgs(format!("bad pattern {p}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut files = Vec::new();
    for input in inputs {
        if !input.exists() {
            return Err(PackError::InvalidArgs(format!(
                "input does not exist: {}",
                input.display()
            )));
        }
        if input.is_file() {
            let name = file_name(input)?;
            if excluded(&name, &patterns) {
                continue;
            }
            let size = input
                .metadata()
                .map_err(|e| PackError::io(input, e))?
                .len();
            files.push(InputFile {
                virtual_path: name,
                physical_path: input.clone(),
                size,
            });
            continue;
        }

        let root_name = file_name(input)?;
        for entry in WalkDir::new(input).follow_links(true) {
            let entry = entry.map_err(|e| PackError::io(input, e))?;
            if entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if excluded(&name, &patterns) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(input)
                .map_err(|e| PackError::io(entry.path(), e))?;
            if rel
                .components()
                .any(|c| VCS_DIRS.contains(&c.as_os_str().to_string_lossy().as_ref()))
            {
                continue;
            }
            let vp = Path::new(&root_name).join(rel);
            let size = entry
                .metadata()
                .map_err(|e| PackError::io(entry.path(), e))?
                .len();
            files.push(InputFile {
                virtual_path: vp.to_string_lossy().replace('\\', "/"),
                physical_path: entry.path().to_path_buf(),
                size,
            });
        }
    }
    files.sort_by(|a, b| a.virtual_path.cmp(&b.virtual_path));
    Ok(files)
}

fn file_name(path: &Path) -> Result<String, PackError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| PackError::InvalidArgs(format!("input has no name: {}", path.display())))
}
