//! Locating the native inference backend
//!
//! The backend is llama.cpp's `llama-server`. It is looked up in a fixed set
//! of directories; accelerator libraries next to it are picked up when
//! present but never required.

use std::path::{Path, PathBuf};

use crate::error::{PlannerError, Result};

/// What discovery found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendLibraries {
    /// Server executable
    pub server: PathBuf,
    /// Optional accelerator libraries found in the same directory
    pub accelerators: Vec<PathBuf>,
}

pub fn server_executable_name() -> &'static str {
    if cfg!(windows) {
        "llama-server.exe"
    } else {
        "llama-server"
    }
}

/// Accelerator libraries worth reporting for this platform
pub fn accelerator_library_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["ggml-cuda.dll", "ggml-vulkan.dll", "cudart64_12.dll", "cublas64_12.dll"]
    }
    #[cfg(target_os = "macos")]
    {
        &["libggml-metal.dylib", "libggml-blas.dylib"]
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        &["libggml-cuda.so", "libggml-vulkan.so", "libcudart.so.12", "libcublas.so.12"]
    }
}

/// Directories searched when no explicit ones are configured, in order
pub fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            dirs.push(parent.to_path_buf());
            dirs.push(parent.join("backend"));
        }
    }
    if let Some(data) = dirs::data_local_dir() {
        dirs.push(data.join("npc-planner").join("backend"));
    }
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".local").join("bin"));
    }
    if cfg!(unix) {
        dirs.push(PathBuf::from("/usr/local/bin"));
        dirs.push(PathBuf::from("/usr/bin"));
    }

    dirs
}

/// Search `extra` first, then the default directories
pub fn discover(extra: &[PathBuf]) -> Result<BackendLibraries> {
    let mut dirs = extra.to_vec();
    for dir in default_search_dirs() {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    discover_in(&dirs)
}

/// Find the server executable in the first directory that has it
pub fn discover_in(dirs: &[PathBuf]) -> Result<BackendLibraries> {
    let name = server_executable_name();

    for dir in dirs {
        let server = dir.join(name);
        if !server.is_file() {
            continue;
        }
        let accelerators = find_accelerators(dir);
        tracing::debug!(
            "Found {} with {} accelerator libraries",
            server.display(),
            accelerators.len()
        );
        return Ok(BackendLibraries {
            server,
            accelerators,
        });
    }

    Err(PlannerError::BackendNotFound {
        library: name.to_string(),
        searched: dirs.to_vec(),
    })
}

fn find_accelerators(dir: &Path) -> Vec<PathBuf> {
    accelerator_library_names()
        .iter()
        .map(|lib| dir.join(lib))
        .filter(|path| path.is_file())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_discover_first_match_wins() {
        let empty = TempDir::new().unwrap();
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::write(first.path().join(server_executable_name()), b"").unwrap();
        std::fs::write(second.path().join(server_executable_name()), b"").unwrap();

        let found = discover_in(&[
            empty.path().to_path_buf(),
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ])
        .unwrap();
        assert_eq!(found.server, first.path().join(server_executable_name()));
        assert!(found.accelerators.is_empty());
    }

    #[test]
    fn test_accelerators_are_optional_extras() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(server_executable_name()), b"").unwrap();
        let accel = accelerator_library_names()[0];
        std::fs::write(dir.path().join(accel), b"").unwrap();

        let found = discover_in(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(found.accelerators, vec![dir.path().join(accel)]);
    }

    #[test]
    fn test_not_found_lists_searched_dirs() {
        let dir = TempDir::new().unwrap();
        // An accelerator alone is not enough
        std::fs::write(dir.path().join(accelerator_library_names()[0]), b"").unwrap();

        match discover_in(&[dir.path().to_path_buf()]) {
            Err(PlannerError::BackendNotFound { library, searched }) => {
                assert_eq!(library, server_executable_name());
                assert_eq!(searched, vec![dir.path().to_path_buf()]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_discover_puts_extra_dirs_first() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(server_executable_name()), b"").unwrap();
        let found = discover(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(found.server, dir.path().join(server_executable_name()));
    }
}
