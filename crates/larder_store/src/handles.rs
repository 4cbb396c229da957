//! Finding processes that use files of an implementation.

use std::{fmt, io, path::Path, sync::Arc};

/// A process holding files of an implementation open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// The process id.
    pub pid: u32,
    /// A short name of the process, usually the executable name.
    pub name: String,
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.pid)
    }
}

/// Finds and stops processes that use a directory.
pub trait HandleInspector: Send + Sync {
    /// Returns the processes that have files below `path` open or are executing one of them.
    fn open_handles(&self, path: &Path) -> io::Result<Vec<ProcessInfo>>;

    /// Asks the given processes to shut down. Does not wait for them to exit.
    fn request_shutdown(&self, processes: &[ProcessInfo]) -> io::Result<()>;
}

/// A [`HandleInspector`] that never finds any process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHandleInspector;

impl HandleInspector for NoHandleInspector {
    fn open_handles(&self, _path: &Path) -> io::Result<Vec<ProcessInfo>> {
        Ok(Vec::new())
    }

    fn request_shutdown(&self, _processes: &[ProcessInfo]) -> io::Result<()> {
        Ok(())
    }
}

/// The best available [`HandleInspector`] for the current platform.
pub fn default_handle_inspector() -> Arc<dyn HandleInspector> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcfsHandleInspector::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(NoHandleInspector)
    }
}

/// Inspects `/proc` for processes whose executable or open file descriptors lie below a path.
///
/// Only processes the current user may inspect are found.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct ProcfsHandleInspector {
    proc_root: std::path::PathBuf,
}

#[cfg(target_os = "linux")]
impl Default for ProcfsHandleInspector {
    fn default() -> Self {
        Self {
            proc_root: std::path::PathBuf::from("/proc"),
        }
    }
}

#[cfg(target_os = "linux")]
impl ProcfsHandleInspector {
    fn uses(&self, process_dir: &Path, path: &Path) -> bool {
        let below = |target: io::Result<std::path::PathBuf>| {
            target.map(|target| target.starts_with(path)).unwrap_or(false)
        };
        if below(std::fs::read_link(process_dir.join("exe"))) {
            return true;
        }
        let Ok(fds) = std::fs::read_dir(process_dir.join("fd")) else {
            return false;
        };
        fds.flatten()
            .any(|fd| below(std::fs::read_link(fd.path())))
    }
}

#[cfg(target_os = "linux")]
impl HandleInspector for ProcfsHandleInspector {
    fn open_handles(&self, path: &Path) -> io::Result<Vec<ProcessInfo>> {
        let own_pid = std::process::id();
        let mut processes = Vec::new();
        for entry in fs_err::read_dir(&self.proc_root)? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if pid == own_pid || !self.uses(&entry.path(), path) {
                continue;
            }
            let name = std::fs::read_to_string(entry.path().join("comm"))
                .map(|name| name.trim_end().to_string())
                .unwrap_or_else(|_| String::from("unknown"));
            processes.push(ProcessInfo { pid, name });
        }
        Ok(processes)
    }

    fn request_shutdown(&self, processes: &[ProcessInfo]) -> io::Result<()> {
        for process in processes {
            let Ok(pid) = libc::pid_t::try_from(process.pid) else {
                continue;
            };
            tracing::info!("asking {process} to shut down");
            // SAFETY: kill has no memory safety requirements.
            if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
                let error = io::Error::last_os_error();
                // The process may have exited in the meantime.
                if error.raw_os_error() != Some(libc::ESRCH) {
                    return Err(error);
                }
            }
        }
        Ok(())
    }
}
