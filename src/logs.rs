use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use tracing::warn;

use crate::error::Result;
use crate::runtime::RuntimeDirectory;

/// Returns the last `n` lines of the file at `path`.
///
/// A missing file yields no lines.
pub fn tail_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut all_lines: Vec<String> = BufReader::new(file).lines().map_while(io::Result::ok).collect();
    let start = all_lines.len().saturating_sub(n);
    Ok(all_lines.split_off(start))
}

/// Prints the last `lines` lines of the server log, or of the watchdog log
/// when `watchdog` is set.
pub fn show_logs(runtime: &RuntimeDirectory, lines: usize, watchdog: bool) -> Result<()> {
    let log_path = if watchdog {
        runtime.watchdog_log_file()
    } else {
        runtime.server_log_file()
    };

    if !log_path.exists() {
        warn!("Log file {} not found", log_path.display());
        return Ok(());
    }

    for line in tail_lines(&log_path, lines)? {
        println!("{line}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn tail_returns_last_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.log");
        fs::write(&path, "one\ntwo\nthree\n").unwrap();

        assert_eq!(tail_lines(&path, 2).unwrap(), vec!["two", "three"]);
        assert_eq!(tail_lines(&path, 10).unwrap().len(), 3);
        assert!(tail_lines(&path, 0).unwrap().is_empty());
    }

    #[test]
    fn missing_log_is_empty() {
        let dir = tempdir().unwrap();
        assert!(tail_lines(&dir.path().join("absent.log"), 5).unwrap().is_empty());
    }
}
