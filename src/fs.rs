//! Filesystem access used for staleness checks.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// MTime info gathered for a file.  This also models "file is absent".
/// It's not using an Option<> just because it makes the code using it easier
/// to follow.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MTime {
    Missing,
    /// Seconds since the epoch, as stored in the graph.
    Stamp(f64),
}

impl MTime {
    /// The value persisted in an entry's stamp column.  0.0 doubles as
    /// "never stamped".
    pub fn as_stamp(&self) -> f64 {
        match *self {
            MTime::Missing => 0.0,
            MTime::Stamp(t) => t,
        }
    }
}

pub trait FileSystem: Sync {
    /// stat() an on-disk path, producing its MTime.
    fn stat(&self, path: &str) -> std::io::Result<MTime>;
}

/// The real filesystem.  Relative paths resolve against `root`.
pub struct RealFileSystem {
    root: PathBuf,
}

impl RealFileSystem {
    pub fn new() -> Self {
        RealFileSystem {
            root: PathBuf::new(),
        }
    }

    pub fn rooted(root: &Path) -> Self {
        RealFileSystem {
            root: root.to_path_buf(),
        }
    }
}

impl Default for RealFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

pub fn stat(path: impl AsRef<Path>) -> std::io::Result<MTime> {
    Ok(match std::fs::metadata(path) {
        Ok(meta) => {
            let modified = meta.modified()?;
            let secs = modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            MTime::Stamp(secs)
        }
        Err(err) => {
            if err.kind() == std::io::ErrorKind::NotFound {
                MTime::Missing
            } else {
                return Err(err);
            }
        }
    })
}

impl FileSystem for RealFileSystem {
    fn stat(&self, path: &str) -> std::io::Result<MTime> {
        stat(self.root.join(path))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Implementation of FileSystem that is memory-backed.
    #[derive(Default)]
    pub struct TestFileSystem {
        files: Mutex<HashMap<String, f64>>,
    }

    impl TestFileSystem {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn touch(&self, path: &str, stamp: f64) {
            self.files.lock().unwrap().insert(path.to_string(), stamp);
        }

        pub fn remove(&self, path: &str) {
            self.files.lock().unwrap().remove(path);
        }
    }

    impl FileSystem for TestFileSystem {
        fn stat(&self, path: &str) -> std::io::Result<MTime> {
            Ok(match self.files.lock().unwrap().get(path) {
                Some(&t) => MTime::Stamp(t),
                None => MTime::Missing,
            })
        }
    }
}
