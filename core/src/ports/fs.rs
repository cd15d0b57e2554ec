//! The FS port: all paths are resolved against a base directory bound at
//! construction.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Options for `Fs::list`.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub recursive: bool,
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub max_depth: Option<usize>,
}

/// Metadata returned by `Fs::stat`.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub is_dir: bool,
    pub is_file: bool,
    pub size: u64,
}

#[async_trait]
pub trait Fs: Send + Sync {
    async fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;
    /// Writes `bytes` to `path`, creating parent directories as needed.
    async fn write(&self, path: &str, bytes: &[u8]) -> std::io::Result<()>;
    async fn exists(&self, path: &str) -> bool;
    async fn mkdir(&self, path: &str, recursive: bool) -> std::io::Result<()>;
    async fn delete(&self, path: &str) -> std::io::Result<()>;
    async fn list(&self, dir: &str, options: ListOptions) -> std::io::Result<Vec<String>>;
    async fn stat(&self, path: &str) -> std::io::Result<FileStat>;
}

/// A `tokio::fs`-backed `Fs` rooted at `base`.
pub struct LocalFs {
    base: PathBuf,
}

impl LocalFs {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base.join(p)
        }
    }

    fn matches(name: &str, patterns: &Option<Vec<String>>) -> bool {
        match patterns {
            None => true,
            Some(pats) => pats.iter().any(|p| name.contains(p.as_str())),
        }
    }

    fn walk(
        dir: &Path,
        root: &Path,
        recursive: bool,
        include: &Option<Vec<String>>,
        exclude: &Option<Vec<String>>,
        max_depth: Option<usize>,
        depth: usize,
        out: &mut Vec<String>,
    ) -> std::io::Result<()> {
        if let Some(max) = max_depth {
            if depth > max {
                return Ok(());
            }
        }
        let mut entries = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .collect::<Vec<_>>();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            let name = entry.file_name().to_string_lossy().to_string();
            if Self::matches(&name, exclude) {
                continue;
            }
            if path.is_dir() {
                if recursive {
                    Self::walk(&path, root, recursive, include, exclude, max_depth, depth + 1, out)?;
                }
            } else if Self::matches(&name, include) {
                out.push(rel);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Fs for LocalFs {
    async fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.resolve(path)).await
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> std::io::Result<()> {
        let resolved = self.resolve(path);
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(resolved, bytes).await
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::metadata(self.resolve(path)).await.is_ok()
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> std::io::Result<()> {
        let resolved = self.resolve(path);
        if recursive {
            tokio::fs::create_dir_all(resolved).await
        } else {
            tokio::fs::create_dir(resolved).await
        }
    }

    async fn delete(&self, path: &str) -> std::io::Result<()> {
        let resolved = self.resolve(path);
        let meta = tokio::fs::metadata(&resolved).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(resolved).await
        } else {
            tokio::fs::remove_file(resolved).await
        }
    }

    async fn list(&self, dir: &str, options: ListOptions) -> std::io::Result<Vec<String>> {
        let root = self.resolve(dir);
        let mut out = Vec::new();
        Self::walk(
            &root,
            &root,
            options.recursive,
            &options.include,
            &options.exclude,
            options.max_depth,
            0,
            &mut out,
        )?;
        Ok(out)
    }

    async fn stat(&self, path: &str) -> std::io::Result<FileStat> {
        let meta = tokio::fs::metadata(self.resolve(path)).await?;
        Ok(FileStat {
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
            size: meta.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_creates_parent_dirs_and_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path());
        fs.write("nested/dir/file.txt", b"hello").await.unwrap();
        let contents = fs.read("nested/dir/file.txt").await.unwrap();
        assert_eq!(contents, b"hello");
        assert!(fs.exists("nested/dir/file.txt").await);
    }

    #[tokio::test]
    async fn list_respects_recursive_and_exclude() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path());
        fs.write("a.rs", b"1").await.unwrap();
        fs.write("sub/b.rs", b"2").await.unwrap();
        fs.write("sub/c.test.rs", b"3").await.unwrap();

        let shallow = fs
            .list(".", ListOptions { recursive: false, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(shallow, vec!["a.rs".to_string()]);

        let deep = fs
            .list(
                ".",
                ListOptions {
                    recursive: true,
                    exclude: Some(vec![".test.".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(deep.iter().any(|p| p.ends_with("a.rs")));
        assert!(deep.iter().any(|p| p.ends_with("b.rs")));
        assert!(!deep.iter().any(|p| p.contains(".test.")));
    }
}
