use std::path::Path;

use anyhow::Context as _;

/// Boot-time default application link. Whatever this points at is what the
/// device launches when nothing else is requested.
pub const DEFAULT_APP_LINK: &str = "/usr/bin/applauncher-default";

pub fn make_default(binary: &str) -> anyhow::Result<()> {
    make_default_at(Path::new(binary), Path::new(DEFAULT_APP_LINK))
}

pub fn remove_default() -> anyhow::Result<()> {
    remove_default_at(Path::new(DEFAULT_APP_LINK))
}

fn make_default_at(binary: &Path, link: &Path) -> anyhow::Result<()> {
    anyhow::ensure!(
        binary.exists(),
        "file {} does not exist",
        binary.display()
    );
    remove_default_at(link)?;
    std::os::unix::fs::symlink(binary, link)
        .with_context(|| format!("link default application {}", link.display()))?;
    nix::unistd::sync();
    Ok(())
}

fn remove_default_at(link: &Path) -> anyhow::Result<()> {
    // symlink_metadata instead of exists(): a dangling link must be removed
    // too, and exists() follows the link.
    if std::fs::symlink_metadata(link).is_ok() {
        std::fs::remove_file(link)
            .with_context(|| format!("remove default application {}", link.display()))?;
        nix::unistd::sync();
    }
    Ok(())
}
