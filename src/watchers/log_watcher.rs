//! Log tail watcher (§4.6.1): tracks a text file's `(mtime, size, cursor)` and yields
//! only the lines appended since the last call.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

struct State {
    position: u64,
    last_mtime: Option<SystemTime>,
    last_size: u64,
}

pub struct LogWatcher {
    path: PathBuf,
    state: Mutex<State>,
}

impl LogWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(State {
                position: 0,
                last_mtime: None,
                last_size: 0,
            }),
        }
    }

    /// Lines appended since the previous call, and whether anything changed. Handles
    /// truncation (size shrank: cursor resets to the start) and non-existence (empty,
    /// cursor reset).
    pub fn get_new_lines(&self) -> (Vec<String>, bool) {
        let mut state = self.state.lock().unwrap();

        let Ok(metadata) = fs::metadata(&self.path) else {
            state.position = 0;
            state.last_mtime = None;
            state.last_size = 0;
            return (Vec::new(), false);
        };

        let size = metadata.len();
        let mtime = metadata.modified().ok();

        if size < state.last_size {
            state.position = 0;
        }

        if mtime == state.last_mtime && size == state.last_size {
            return (Vec::new(), false);
        }

        state.last_mtime = mtime;
        state.last_size = size;

        let Ok(content) = fs::read_to_string(&self.path) else {
            return (Vec::new(), false);
        };
        let Some(new_bytes) = content.get(state.position as usize..) else {
            state.position = content.len() as u64;
            return (Vec::new(), false);
        };
        if new_bytes.is_empty() {
            return (Vec::new(), false);
        }

        let lines: Vec<String> = new_bytes.lines().map(str::to_string).collect();
        state.position = content.len() as u64;
        (lines, true)
    }

    /// Up to the last `max_lines` lines, positioning the cursor at the current end.
    pub fn get_all_lines(&self, max_lines: usize) -> Vec<String> {
        let mut state = self.state.lock().unwrap();

        let Ok(content) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let Ok(metadata) = fs::metadata(&self.path) else {
            return Vec::new();
        };

        state.position = content.len() as u64;
        state.last_mtime = metadata.modified().ok();
        state.last_size = metadata.len();

        let all_lines: Vec<&str> = content.lines().collect();
        let start = all_lines.len().saturating_sub(max_lines);
        all_lines[start..].iter().map(|s| s.to_string()).collect()
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.position = 0;
        state.last_mtime = None;
        state.last_size = 0;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn missing_file_returns_empty_without_changes() {
        let dir = tempdir().unwrap();
        let watcher = LogWatcher::new(dir.path().join("missing.log"));
        let (lines, changed) = watcher.get_new_lines();
        assert!(lines.is_empty());
        assert!(!changed);
    }

    #[test]
    fn returns_only_appended_lines_on_subsequent_calls() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.log");
        fs::write(&path, "one\ntwo\n").unwrap();

        let watcher = LogWatcher::new(&path);
        let (first, changed) = watcher.get_new_lines();
        assert_eq!(first, vec!["one", "two"]);
        assert!(changed);

        let (second, changed) = watcher.get_new_lines();
        assert!(second.is_empty());
        assert!(!changed);

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "three").unwrap();
        drop(f);
        // ensure mtime advances on filesystems with coarse resolution
        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(&path, "one\ntwo\nthree\nfour\n").unwrap();

        let (third, changed) = watcher.get_new_lines();
        assert!(changed);
        assert!(third.contains(&"four".to_string()));
    }

    #[test]
    fn truncation_resets_cursor_to_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.log");
        fs::write(&path, "one\ntwo\nthree\n").unwrap();
        let watcher = LogWatcher::new(&path);
        watcher.get_new_lines();

        fs::write(&path, "x\n").unwrap();
        let (lines, changed) = watcher.get_new_lines();
        assert!(changed);
        assert_eq!(lines, vec!["x"]);
    }

    #[test]
    fn get_all_lines_caps_at_max_and_advances_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.log");
        let content: String = (0..10).map(|i| format!("line{i}\n")).collect();
        fs::write(&path, content).unwrap();

        let watcher = LogWatcher::new(&path);
        let lines = watcher.get_all_lines(3);
        assert_eq!(lines, vec!["line7", "line8", "line9"]);

        let (more, changed) = watcher.get_new_lines();
        assert!(more.is_empty());
        assert!(!changed);
    }

    #[test]
    fn reset_allows_full_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.log");
        fs::write(&path, "one\n").unwrap();
        let watcher = LogWatcher::new(&path);
        watcher.get_new_lines();
        watcher.reset();
        let (lines, changed) = watcher.get_new_lines();
        assert_eq!(lines, vec!["one"]);
        assert!(changed);
    }
}
