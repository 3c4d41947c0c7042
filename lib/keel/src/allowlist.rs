//! Client address allowlist with a background reloader. The reloader thread
//! polls the file's mtime and publishes a freshly parsed set with an atomic
//! pointer swap; the accept path does a lock-free load per connection. The
//! previous table stays alive until its last reader drops the reference.

use crate::logging::{self, Logger};
use arc_swap::ArcSwapOption;
use hashbrown::HashSet;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

pub struct Allowlist {
    addrs: HashSet<String>,
    mtime: SystemTime,
}

impl Allowlist {
    #[inline]
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    #[inline]
    pub fn contains(&self, addr: &str) -> bool {
        self.addrs.contains(addr)
    }
}

/// Shared view of the active allowlist. `None` means no allowlist file is
/// present and every client is admitted.
#[derive(Clone)]
pub struct AllowlistHandle {
    current: Arc<ArcSwapOption<Allowlist>>,
}

impl AllowlistHandle {
    pub fn disabled() -> AllowlistHandle {
        AllowlistHandle {
            current: Arc::new(ArcSwapOption::from(None)),
        }
    }

    #[inline]
    pub fn is_allowed(&self, addr: &str) -> bool {
        match &*self.current.load() {
            Some(list) => list.contains(addr),
            None => true,
        }
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Parses the allowlist file: one address per line, leading whitespace
/// stripped, `#` comments and blank lines skipped, trailing garbage after
/// the address digits/dots dropped.
fn load(path: &Path) -> Option<Allowlist> {
    let mtime = mtime(path)?;
    let file = fs::File::open(path).ok()?;

    let mut addrs = HashSet::new();

    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => return None,
        };

        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let end = line
            .find(|c: char| !c.is_ascii_digit() && c != '.' && c != ':')
            .unwrap_or_else(|| line.len());
        if end == 0 {
            continue;
        }

        addrs.insert(line[..end].to_string());
    }

    Some(Allowlist { addrs, mtime })
}

fn changed(current: &Option<Arc<Allowlist>>, path: &Path) -> bool {
    match (current, mtime(path)) {
        (None, None) => false,
        (None, Some(_)) => true,
        (Some(_), None) => true,
        (Some(list), Some(mtime)) => mtime > list.mtime,
    }
}

/// Loads the allowlist once and spawns the reloader thread. The thread runs
/// for the life of the process.
pub fn spawn(path: PathBuf, interval: Duration, log: Logger) -> AllowlistHandle {
    let handle = AllowlistHandle {
        current: Arc::new(ArcSwapOption::from(load(&path).map(Arc::new))),
    };

    if let Some(list) = &*handle.current.load() {
        logging::info!(log, "allowlist loaded"; "path" => %path.display(), "entries" => list.len());
    }

    let shared = handle.current.clone();

    thread::Builder::new()
        .name("allowlist".into())
        .spawn(move || loop {
            thread::sleep(interval);

            if !changed(&shared.load_full(), &path) {
                continue;
            }

            match load(&path) {
                Some(list) => {
                    logging::info!(log, "allowlist reloaded";
                                   "path" => %path.display(),
                                   "entries" => list.len());
                    shared.store(Some(Arc::new(list)));
                }
                None => {
                    logging::warn!(log, "allowlist file gone, admitting everyone";
                                   "path" => %path.display());
                    shared.store(None);
                }
            }
        })
        .expect("failed to spawn allowlist reloader");

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(name: &str, contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("keel-allowlist-{}-{}", std::process::id(), name));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_parses_lines() {
        let path = scratch_file(
            "parse",
            "10.0.0.1\n  10.0.0.2  trailing words\n# comment\n\n192.168.1.3\n",
        );
        let list = load(&path).unwrap();

        assert_eq!(list.len(), 3);
        assert!(list.contains("10.0.0.1"));
        assert!(list.contains("10.0.0.2"));
        assert!(list.contains("192.168.1.3"));
        assert!(!list.contains("# comment"));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_admits_everyone() {
        let handle = AllowlistHandle::disabled();
        assert!(handle.is_allowed("10.1.2.3"));
    }

    #[test]
    fn test_loaded_list_filters() {
        let path = scratch_file("filter", "10.0.0.1\n");
        let handle = AllowlistHandle {
            current: Arc::new(ArcSwapOption::from(load(&path).map(Arc::new))),
        };

        assert!(handle.is_allowed("10.0.0.1"));
        assert!(!handle.is_allowed("10.9.9.9"));

        fs::remove_file(&path).unwrap();
    }
}
