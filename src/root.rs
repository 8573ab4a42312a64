// The directory tree a server exposes, and the rules for reaching into it.
//
// A requested filename is resolved lexically against the root first, so `..` can never climb
// above it, and then the deepest part of the result that exists on disk is canonicalized so a
// symlink cannot lead out of the tree either.

use std::error;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, PartialEq)]
pub enum PathError {
    /// The filename names an absolute or rooted path.
    Absolute(String),
    /// The filename resolves to something outside the server root.
    Escapes(String),
}

impl error::Error for PathError {}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Absolute(name) => write!(f, "Absolute paths are not allowed: {:?}", name),
            Self::Escapes(name) => write!(f, "Path leaves the server root: {:?}", name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerRoot {
    /// Canonical form of the served directory.
    root: PathBuf,
}

impl ServerRoot {
    pub fn new(root: &Path) -> io::Result<ServerRoot> {
        let root = root.canonicalize()?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Server root {:?} is not a directory", root),
            ));
        }
        Ok(ServerRoot { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Maps `filename` to an absolute path inside the root, or rejects it.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, PathError> {
        let mut resolved = self.root.clone();
        let mut depth = 0;

        for component in Path::new(filename).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(PathError::Escapes(filename.to_string()));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PathError::Absolute(filename.to_string()));
                }
            }
        }

        let mut existing = resolved.as_path();
        loop {
            if let Ok(canonical) = existing.canonicalize() {
                if !canonical.starts_with(&self.root) {
                    return Err(PathError::Escapes(filename.to_string()));
                }
                break;
            }
            match existing.parent() {
                Some(parent) => existing = parent,
                None => break,
            }
        }

        Ok(resolved)
    }

    /// Renders a listing of the root directory, one entry per line, sorted by name.
    pub async fn listing(&self) -> io::Result<Vec<u8>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            let kind = if metadata.is_dir() { 'd' } else { '-' };
            entries.push((entry.file_name().to_string_lossy().into_owned(), kind, metadata.len()));
        }
        entries.sort();

        let mut out = String::new();
        for (name, kind, size) in &entries {
            out.push_str(&format!("{kind} {size:>12} {name}\n"));
        }
        Ok(out.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;
    use tokio_test::assert_ok;

    fn scratch_root() -> (TempDir, ServerRoot) {
        let tmpdir = TempDir::new("root").unwrap();
        let served = tmpdir.path().join("served");
        std::fs::create_dir(&served).unwrap();
        std::fs::write(tmpdir.path().join("outside.txt"), b"secret").unwrap();
        let root = ServerRoot::new(&served).unwrap();
        (tmpdir, root)
    }

    #[test]
    fn test_escapes_are_rejected() {
        let (_tmpdir, root) = scratch_root();

        for name in ["../outside.txt", "sub/../../x"] {
            assert_eq!(root.resolve(name), Err(PathError::Escapes(name.to_string())));
        }
        let absolute = "/etc/passwd";
        assert_eq!(root.resolve(absolute), Err(PathError::Absolute(absolute.to_string())));
    }

    #[test]
    fn test_nested_path_resolves_inside_root() {
        let (_tmpdir, root) = scratch_root();

        let resolved = assert_ok!(root.resolve("sub/dir/file.txt"));
        assert!(resolved.starts_with(root.path()));
        assert_eq!(resolved, root.path().join("sub").join("dir").join("file.txt"));
        assert_eq!(assert_ok!(root.resolve("./a/../b.txt")), root.path().join("b.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_out_of_root_is_rejected() {
        let (tmpdir, root) = scratch_root();
        std::os::unix::fs::symlink(tmpdir.path(), root.path().join("link")).unwrap();

        for name in ["link/outside.txt", "link/new.txt"] {
            assert_eq!(root.resolve(name), Err(PathError::Escapes(name.to_string())));
        }
    }

    #[test]
    fn test_root_must_be_a_directory() {
        let (tmpdir, _root) = scratch_root();
        assert!(ServerRoot::new(&tmpdir.path().join("outside.txt")).is_err());
        assert!(ServerRoot::new(&tmpdir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn test_listing_names_every_entry() {
        let (_tmpdir, root) = scratch_root();
        std::fs::write(root.path().join("b.txt"), vec![0u8; 1000]).unwrap();
        std::fs::create_dir(root.path().join("a")).unwrap();

        let listing = String::from_utf8(assert_ok!(root.listing().await)).unwrap();
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('d'));
        assert!(lines[0].ends_with(" a"));
        assert_eq!(lines[1], format!("- {:>12} b.txt", 1000));
    }
}
