pub mod identity;
pub mod positions;

pub use identity::{AssetMeta, IdentityCache};
pub use positions::{PositionsStore, SyncOutcome};

use std::path::Path;

/// All store files are created with user-only permissions.
#[cfg(unix)]
pub(crate) fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
pub(crate) fn restrict_permissions(_path: &Path) {}
