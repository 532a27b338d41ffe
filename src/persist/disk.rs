use std::path::{Path, PathBuf};

use eyre::{ensure, WrapErr as _};
use tokio::fs;

use super::{Persist, PersistKey};

/// File system storage: one folder per namespace under a root directory.
///
/// ```text
/// root/
/// ├── account/a@b.com
/// ├── archive/sub.example.com
/// ├── authz/<token>
/// └── passphrase/sub.example.com
/// ```
///
/// Names are escaped into safe file names. Secrets are written with mode `0600` on Unix. Nothing
/// here is encrypted, so protect the root directory accordingly.
#[derive(Debug, Clone)]
pub struct DiskPersist {
    root: PathBuf,
}

impl DiskPersist {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DiskPersist { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &PersistKey) -> eyre::Result<PathBuf> {
        ensure!(!key.name.is_empty(), "empty key name in {}", key.kind);
        Ok(self.root.join(key.kind.name()).join(escape_name(&key.name)))
    }
}

/// Escapes a logical key name into a single path segment.
///
/// Bytes outside `[A-Za-z0-9_@.-]` (and a leading `.`) become `%XX`, so the mapping is
/// deterministic and injective.
fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());

    for (idx, byte) in name.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric()
            || matches!(byte, b'_' | b'@' | b'-')
            || (byte == b'.' && idx > 0);

        if plain {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }

    out
}

#[async_trait::async_trait]
impl Persist for DiskPersist {
    async fn put(&self, key: &PersistKey, value: &[u8]) -> eyre::Result<()> {
        let path = self.path_of(key)?;

        let dir = self.root.join(key.kind.name());
        fs::create_dir_all(&dir)
            .await
            .wrap_err_with(|| format!("failed to create {}", dir.display()))?;

        // write next to the target, then rename over it
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{file_name}.tmp"));

        fs::write(&tmp, value)
            .await
            .wrap_err_with(|| format!("failed to write {}", tmp.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            if key.kind.is_secret() {
                fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
            }
        }

        fs::rename(&tmp, &path)
            .await
            .wrap_err_with(|| format!("failed to move {} into place", path.display()))?;

        log::trace!("persisted {key}");
        Ok(())
    }

    async fn get(&self, key: &PersistKey) -> eyre::Result<Option<Vec<u8>>> {
        let path = self.path_of(key)?;

        match fs::read(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).wrap_err_with(|| format!("failed to read {}", path.display())),
        }
    }
}
