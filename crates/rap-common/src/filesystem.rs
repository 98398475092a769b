//! Filesystem helpers: absolute paths, copying, extension filters, sizes and recursive walks.

use std::env;
use std::fs::{self, FileTimes, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// How much of the source file [`copy_with`] carries over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CopyMode {
    /// File contents and permission bits.
    #[default]
    Contents,
    /// Contents, permission bits, and access/modification times.
    PreserveMetadata,
}

/// Absolute, lexically normalized form of `path` (relative paths are resolved
/// against the current directory; `.` and `..` are folded away).
pub fn abspath(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()?.join(path)
    };
    Ok(normalize(&joined))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Maps every path to its absolute form, lazily and one-to-one.
pub fn absfiles<I, P>(files: I) -> impl Iterator<Item = io::Result<PathBuf>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    files.into_iter().map(abspath)
}

/// Copy a file to `dest`, creating missing destination directories first.
pub fn copy(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> io::Result<()> {
    copy_with(src, dest, CopyMode::Contents)
}

/// Copy a file to `dest` and keep its metadata (timestamps and permission bits).
pub fn deepcopy(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> io::Result<()> {
    copy_with(src, dest, CopyMode::PreserveMetadata)
}

/// Shared copy routine. If `dest` is an existing directory, or ends with a path
/// separator, the file lands inside it under its own name. Errors from the filesystem are returned unchanged.
pub fn copy_with(src: impl AsRef<Path>, dest: impl AsRef<Path>, mode: CopyMode) -> io::Result<()> {
    let src = src.as_ref();
    let dest = dest.as_ref();

    // `out/` names a directory to copy into, which is created like a parent would be
    let into_dir = ends_with_separator(dest);
    if into_dir {
        fs::create_dir_all(dest)?;
    } else if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let target = if into_dir || dest.is_dir() {
        let name = src.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("source has no file name: {}", src.display()),
            )
        })?;
        dest.join(name)
    } else {
        dest.to_path_buf()
    };

    fs::copy(src, &target)?;
    if mode == CopyMode::PreserveMetadata {
        copy_times(src, &target)?;
    }
    debug!(src = %src.display(), dest = %target.display(), ?mode, "copied file");
    Ok(())
}

fn ends_with_separator(path: &Path) -> bool {
    path.as_os_str()
        .to_string_lossy()
        .ends_with(std::path::is_separator)
}

fn copy_times(src: &Path, dest: &Path) -> io::Result<()> {
    let meta = fs::metadata(src)?;
    let times = FileTimes::new()
        .set_accessed(meta.accessed()?)
        .set_modified(meta.modified()?);

    // Setting times needs a writable handle; a read-only copy is opened up briefly.
    let permissions = meta.permissions();
    if permissions.readonly() {
        let mut writable = permissions.clone();
        #[allow(clippy::permissions_set_readonly_false)]
        writable.set_readonly(false);
        fs::set_permissions(dest, writable)?;
    }
    OpenOptions::new().write(true).open(dest)?.set_times(times)?;
    fs::set_permissions(dest, permissions)
}

/// Extension of the last path component, dot included: `"a.tar.gz"` -> `".gz"`.
/// Leading dots do not start an extension (`".bashrc"` -> `""`).
fn split_extension(filename: &str) -> &str {
    let base = filename
        .rsplit(std::path::is_separator)
        .next()
        .unwrap_or(filename);
    match base.rfind('.') {
        Some(dot) if base[..dot].chars().any(|c| c != '.') => &base[dot..],
        _ => "",
    }
}

/// Whether the extension of `filename` contains any of `extensions` (given without
/// the `.`). This is a case-sensitive substring test, so `"a.xgz"` matches `"gz"`.
pub fn file_has_extensions<I, S>(extensions: I, filename: impl AsRef<Path>) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let filename = filename.as_ref().to_string_lossy();
    let extension = split_extension(&filename);
    extensions
        .into_iter()
        .any(|candidate| extension.contains(candidate.as_ref()))
}

/// Size of the file at `path` in bytes (symlinks are followed).
pub fn get_filesize(path: impl AsRef<Path>) -> io::Result<u64> {
    Ok(fs::metadata(path)?.len())
}

/// Human-readable size with binary units: `500B`, `2.00KB`, `1.00MB`, `1.00GB`.
pub fn pretty_filesize(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.2}GB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2}MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2}KB", bytes as f64 / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Lazy recursive file listing returned by [`walk`] and [`walk_by_extensions`].
///
/// Directories are visited depth-first; inside each directory its files come
/// before the contents of its subdirectories. Yielded paths are the root joined
/// with the relative location. Symlinked directories are neither followed nor
/// yielded, and unreadable directories are skipped.
pub struct Walk {
    entries: walkdir::IntoIter,
    extensions: Option<Vec<String>>,
}

impl Walk {
    fn new(root: &Path, extensions: Option<Vec<String>>) -> Self {
        let entries = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by(|a, b| a.file_type().is_dir().cmp(&b.file_type().is_dir()))
            .into_iter();
        Self { entries, extensions }
    }
}

impl Iterator for Walk {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_dir() || (entry.path_is_symlink() && entry.path().is_dir()) {
                continue;
            }
            if let Some(extensions) = &self.extensions {
                if !file_has_extensions(extensions, entry.path()) {
                    continue;
                }
            }
            return Some(entry.into_path());
        }
    }
}

/// All files under `path` and its subdirectories.
pub fn walk(path: impl AsRef<Path>) -> Walk {
    Walk::new(path.as_ref(), None)
}

/// [`walk`] restricted to files matching [`file_has_extensions`].
pub fn walk_by_extensions<I, S>(path: impl AsRef<Path>, extensions: I) -> Walk
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let extensions = extensions.into_iter().map(Into::into).collect();
    Walk::new(path.as_ref(), Some(extensions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::{Duration, SystemTime};

    fn tree() -> tempfile::TempDir {
        let td = tempfile::tempdir().expect("tmp");
        let root = td.path();
        fs::create_dir_all(root.join("sub")).expect("sub dir");
        fs::write(root.join("a.txt"), "a").expect("a.txt");
        fs::write(root.join("sub").join("b.txt"), "bb").expect("b.txt");
        fs::write(root.join("sub").join("c.log"), "ccc").expect("c.log");
        td
    }

    #[test]
    fn test_pretty_filesize() {
        assert_eq!(pretty_filesize(0), "0B");
        assert_eq!(pretty_filesize(500), "500B");
        assert_eq!(pretty_filesize(1023), "1023B");
        assert_eq!(pretty_filesize(1024), "1.00KB");
        assert_eq!(pretty_filesize(2048), "2.00KB");
        assert_eq!(pretty_filesize(1536), "1.50KB");
        assert_eq!(pretty_filesize(1024 * 1024), "1.00MB");
        assert_eq!(pretty_filesize(1024 * 1024 * 1024), "1.00GB");
        assert_eq!(pretty_filesize(5 * 1024 * 1024 * 1024 / 2), "2.50GB");
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("a.tar.gz"), ".gz");
        assert_eq!(split_extension("dir.d/file"), "");
        assert_eq!(split_extension(".bashrc"), "");
        assert_eq!(split_extension("..a"), "");
        assert_eq!(split_extension("a."), ".");
        assert_eq!(split_extension("noext"), "");
    }

    #[test]
    fn test_file_has_extensions_is_substring_match() {
        assert!(file_has_extensions(["gz"], "a.tar.gz"));
        assert!(file_has_extensions(["gz"], "a.xgz"));
        assert!(file_has_extensions(["txt", "log"], "dir/notes.log"));
        // the extension is only the last suffix
        assert!(!file_has_extensions(["tar.gz"], "a.tar.gz"));
        assert!(!file_has_extensions(["TXT"], "a.txt"));
        assert!(!file_has_extensions(["txt"], "txt"));
        assert!(!file_has_extensions(Vec::<String>::new(), "a.txt"));
    }

    #[test]
    fn test_abspath_normalizes() {
        let cwd = env::current_dir().expect("cwd");
        assert_eq!(abspath("x/./y/../z").expect("abs"), cwd.join("x").join("z"));
        assert_eq!(abspath("").expect("abs"), normalize(&cwd));
        #[cfg(unix)]
        assert_eq!(abspath("/../a/b/..").expect("abs"), PathBuf::from("/a"));
    }

    #[test]
    fn test_absfiles_is_one_to_one() {
        let abs: Vec<PathBuf> = absfiles(["a", "b/c"]).collect::<io::Result<_>>().expect("abs");
        assert_eq!(abs.len(), 2);
        assert!(abs.iter().all(|p| p.is_absolute()));
        assert!(abs[1].ends_with("b/c"));
    }

    #[test]
    fn test_walk_yields_every_file() {
        let td = tree();
        let root = td.path();
        let found: HashSet<PathBuf> = walk(root).collect();
        let expected: HashSet<PathBuf> = [
            root.join("a.txt"),
            root.join("sub").join("b.txt"),
            root.join("sub").join("c.log"),
        ]
        .into_iter()
        .collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_walk_lists_files_before_subdirectories() {
        let td = tree();
        let found: Vec<PathBuf> = walk(td.path()).collect();
        assert_eq!(found[0], td.path().join("a.txt"));
    }

    #[test]
    fn test_walk_by_extensions() {
        let td = tree();
        let root = td.path();
        let found: HashSet<PathBuf> = walk_by_extensions(root, ["txt"]).collect();
        let expected: HashSet<PathBuf> =
            [root.join("a.txt"), root.join("sub").join("b.txt")].into_iter().collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_walk_missing_dir_is_empty() {
        let td = tempfile::tempdir().expect("tmp");
        assert_eq!(walk(td.path().join("nope")).count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_skips_symlinked_dirs() {
        let td = tree();
        let root = td.path();
        std::os::unix::fs::symlink(root.join("sub"), root.join("link")).expect("symlink");
        let found: HashSet<PathBuf> = walk(root).collect();
        assert_eq!(found.len(), 3);
        assert!(!found.iter().any(|p| p.starts_with(root.join("link"))));
    }

    #[test]
    fn test_get_filesize() {
        let td = tree();
        assert_eq!(get_filesize(td.path().join("sub").join("c.log")).expect("size"), 3);
        assert!(get_filesize(td.path().join("missing")).is_err());
    }

    #[test]
    fn test_copy_creates_destination_dirs() {
        let td = tree();
        let dest = td.path().join("out").join("deep").join("a.txt");
        copy(td.path().join("a.txt"), &dest).expect("copy");
        assert_eq!(fs::read_to_string(&dest).expect("read"), "a");

        // existing directory is not an error
        copy(td.path().join("a.txt"), &dest).expect("copy again");
    }

    #[test]
    fn test_copy_into_existing_directory() {
        let td = tree();
        copy(td.path().join("a.txt"), td.path().join("sub")).expect("copy");
        assert!(td.path().join("sub").join("a.txt").is_file());
    }

    #[test]
    fn test_copy_to_trailing_separator_creates_directory() {
        let td = tree();
        let out = td.path().join("out").join("nested");
        let dest = PathBuf::from(format!("{}{}", out.display(), std::path::MAIN_SEPARATOR));
        copy(td.path().join("a.txt"), &dest).expect("copy");
        assert_eq!(fs::read_to_string(out.join("a.txt")).expect("read"), "a");

        // an existing directory written with the separator works the same way
        deepcopy(td.path().join("sub").join("b.txt"), &dest).expect("deepcopy");
        assert!(out.join("b.txt").is_file());
    }

    #[test]
    fn test_copy_missing_source_surfaces_not_found() {
        let td = tempfile::tempdir().expect("tmp");
        let err = copy(td.path().join("missing"), td.path().join("out")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_deepcopy_preserves_times_and_permissions() {
        let td = tree();
        let src = td.path().join("a.txt");
        let past = SystemTime::now() - Duration::from_secs(3 * 24 * 3600);
        fs::File::options()
            .write(true)
            .open(&src)
            .expect("open")
            .set_times(FileTimes::new().set_accessed(past).set_modified(past))
            .expect("set times");
        let mut perms = fs::metadata(&src).expect("meta").permissions();
        perms.set_readonly(true);
        fs::set_permissions(&src, perms).expect("readonly");

        let dest = td.path().join("copy").join("a.txt");
        deepcopy(&src, &dest).expect("deepcopy");

        let meta = fs::metadata(&dest).expect("meta");
        assert!(meta.permissions().readonly());
        let modified = meta.modified().expect("mtime");
        let drift = modified
            .duration_since(past)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(1), "mtime not preserved: {:?}", drift);
    }
}
