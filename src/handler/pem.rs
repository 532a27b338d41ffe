use std::path::{Path, PathBuf};

use eyre::WrapErr as _;
use tokio::fs;

use super::CertificateHandler;
use crate::cert::Certificate;

/// Writes the certificate chain and private key as PEM files into a directory.
///
/// Produces `<name>.crt` and `<name>.key`, which is the layout most reverse proxies read. Files
/// whose content is unchanged are not rewritten.
#[derive(Debug, Clone)]
pub struct PemExportHandler {
    dir: PathBuf,
    name: String,
}

impl PemExportHandler {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        PemExportHandler {
            dir: dir.into(),
            name: name.into(),
        }
    }

    pub fn certificate_path(&self) -> PathBuf {
        self.dir.join(format!("{}.crt", self.name))
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.dir.join(format!("{}.key", self.name))
    }

    async fn export(&self, certificate: &Certificate) -> eyre::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .wrap_err_with(|| format!("failed to create {}", self.dir.display()))?;

        let crt_changed =
            write_if_changed(&self.certificate_path(), certificate.certificate(), false).await?;
        let key_changed =
            write_if_changed(&self.private_key_path(), certificate.private_key(), true).await?;

        if crt_changed || key_changed {
            log::info!(
                "exported certificate to {}",
                self.certificate_path().display()
            );
        }

        Ok(())
    }
}

async fn write_if_changed(path: &Path, content: &str, secret: bool) -> eyre::Result<bool> {
    if let Ok(existing) = fs::read(path).await {
        if existing == content.as_bytes() {
            return Ok(false);
        }
    }

    fs::write(path, content)
        .await
        .wrap_err_with(|| format!("failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        if secret {
            fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        }
    }
    #[cfg(not(unix))]
    let _ = secret;

    Ok(true)
}

#[async_trait::async_trait]
impl CertificateHandler for PemExportHandler {
    async fn created(
        &self,
        certificate: &Certificate,
        _archive: &[u8],
        _passphrase: &str,
    ) -> eyre::Result<()> {
        self.export(certificate).await
    }

    async fn restored(
        &self,
        certificate: &Certificate,
        _archive: &[u8],
        _passphrase: &str,
    ) -> eyre::Result<()> {
        self.export(certificate).await
    }
}
