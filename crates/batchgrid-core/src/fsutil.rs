//! File helpers used for every generated descriptor.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::{debug, info};

/// Write one line per item to `path`, creating parent directories.
pub fn write_list<I, S>(lines: I, path: &Path) -> io::Result<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut content = String::new();
    for line in lines {
        content.push_str(line.as_ref());
        content.push('\n');
    }
    fs::write(path, content)?;
    Ok(path.to_path_buf())
}

/// Read a list file. Blank lines and `#` comments are skipped, the rest is trimmed.
pub fn read_list(path: &Path) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Create `path` (and parents). With `clean_old`, an existing directory is
/// removed first. Refuses the empty path and `$HOME`.
pub fn create_directory(path: &Path, clean_old: bool) -> io::Result<()> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    if path.as_os_str().is_empty() || home.as_deref() == Some(path) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to manage directory '{}'", path.display()),
        ));
    }
    if clean_old && path.exists() {
        info!(path = %path.display(), "removing old copy of directory");
        fs::remove_dir_all(path)?;
    }
    if !path.exists() {
        debug!(path = %path.display(), "creating directory");
    }
    fs::create_dir_all(path)
}

/// Random alphanumeric identifier used for generated file names.
pub fn random_id(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Restrict `path` to its owner and mark it executable.
pub fn make_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Quote `value` for a POSIX shell single-quoted string.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Whether `name` carries the extension `ext`, also accepting the numbered
/// replicas storage systems append (`file.root.1`).
pub fn has_extension(name: &str, ext: &str) -> bool {
    if !name.contains('.') {
        return false;
    }
    let mut parts = name.rsplit('.');
    match (parts.next(), parts.next()) {
        (Some(last), _) if last == ext => true,
        (Some(last), Some(prev)) => {
            !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()) && prev == ext
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/list.txt");
        write_list(["# header", "a.root", "", "  b.root  "], &path).unwrap();
        assert_eq!(read_list(&path).unwrap(), vec!["a.root", "b.root"]);
    }

    #[test]
    fn create_directory_cleans_old_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("logs");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale.log"), "x").unwrap();

        create_directory(&target, false).unwrap();
        assert!(target.join("stale.log").exists());

        create_directory(&target, true).unwrap();
        assert!(target.exists());
        assert!(!target.join("stale.log").exists());
    }

    #[test]
    fn create_directory_refuses_empty_path() {
        assert!(create_directory(Path::new(""), false).is_err());
    }

    #[test]
    fn random_ids_have_requested_length() {
        let id = random_id(35);
        assert_eq!(id.len(), 35);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(random_id(35), id);
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn extension_matching() {
        assert!(has_extension("a/b/file.root", "root"));
        assert!(has_extension("file.root.2", "root"));
        assert!(!has_extension("file.txt", "root"));
        assert!(!has_extension("root", "root.1"));
        assert!(!has_extension("file.2", "root"));
    }
}
