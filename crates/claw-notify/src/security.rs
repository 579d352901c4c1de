//! Plugin execution policy.
//!
//! Every plugin binary is inspected before the broker executes it. The checks
//! run in a fixed order and the first failure wins:
//!
//! 1. The binary exists and is a regular file
//! 2. It is not world writable
//! 3. It is not group writable, whatever group owns it
//! 4. It does not carry the setgid bit
//! 5. The run-as user and group are both set, or both unset
//! 6. Both names resolve to OS identities
//! 7. The resolved user is not root
//! 8. With no identity configured, the broker itself is not running as root
//!
//! Validation has no side effects and never spawns anything.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::unistd::{geteuid, Group, User};
use tracing::debug;

use crate::config::{PluginConfig, RunAs};
use crate::error::{BrokerError, IdentityKind, Result};

const WORLD_WRITE: u32 = 0o002;
const GROUP_WRITE: u32 = 0o020;
const SETGID: u32 = 0o2000;

/// A resolved, non-root identity a plugin is spawned under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAsIdentity {
    /// User name as configured.
    pub user: String,
    /// Numeric user id.
    pub uid: u32,
    /// Group name as configured.
    pub group: String,
    /// Numeric group id.
    pub gid: u32,
}

/// Runs the whole policy for one plugin.
///
/// Returns the identity to spawn the plugin under, or `None` when no
/// identity is configured and the plugin inherits the broker's own
/// unprivileged identity.
///
/// # Errors
///
/// Returns the first failed check.
pub fn validate_plugin(
    plugin: &PluginConfig,
    binary: &Path,
    default_run_as: &RunAs,
) -> Result<Option<RunAsIdentity>> {
    check_binary(&plugin.name, binary)?;
    let identity = resolve_run_as(&plugin.name, &plugin.effective_run_as(default_run_as))?;

    debug!(
        plugin = %plugin.name,
        binary = %binary.display(),
        uid = identity.as_ref().map(|i| i.uid),
        "plugin passed security validation"
    );

    Ok(identity)
}

/// Checks the binary's file type and permission bits.
///
/// # Errors
///
/// Returns [`BrokerError::PluginNotFound`] for a missing or non-regular
/// file, or the matching policy violation.
pub fn check_binary(plugin: &str, path: &Path) -> Result<()> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BrokerError::PluginNotFound {
                plugin: plugin.to_string(),
            });
        }
        Err(e) => return Err(BrokerError::Io(e)),
    };

    if !metadata.is_file() {
        return Err(BrokerError::PluginNotFound {
            plugin: plugin.to_string(),
        });
    }

    let mode = metadata.permissions().mode();

    if mode & WORLD_WRITE != 0 {
        return Err(BrokerError::WorldWritable {
            path: path.to_path_buf(),
        });
    }

    if mode & GROUP_WRITE != 0 {
        return Err(BrokerError::GroupWritable {
            path: path.to_path_buf(),
        });
    }

    if mode & SETGID != 0 {
        return Err(BrokerError::SetgidBinary {
            path: path.to_path_buf(),
        });
    }

    Ok(())
}

/// Resolves a run-as pair to numeric ids.
///
/// An unset pair inherits the broker's identity, which is only allowed when
/// the broker is not root.
///
/// # Errors
///
/// Returns [`BrokerError::IncompletePrivilegeSpec`],
/// [`BrokerError::UnknownIdentity`] or
/// [`BrokerError::RefusedRootExecution`].
pub fn resolve_run_as(plugin: &str, run_as: &RunAs) -> Result<Option<RunAsIdentity>> {
    let (user_name, group_name) = match (run_as.user(), run_as.group()) {
        (None, None) if geteuid().is_root() => {
            return Err(BrokerError::RefusedRootExecution {
                plugin: plugin.to_string(),
            });
        }
        (None, None) => return Ok(None),
        (Some(user), Some(group)) => (user, group),
        _ => {
            return Err(BrokerError::IncompletePrivilegeSpec {
                plugin: plugin.to_string(),
            });
        }
    };

    let user = User::from_name(user_name)
        .map_err(|errno| BrokerError::Io(io::Error::from(errno)))?
        .ok_or_else(|| BrokerError::UnknownIdentity {
            kind: IdentityKind::User,
            name: user_name.to_string(),
        })?;

    let group = Group::from_name(group_name)
        .map_err(|errno| BrokerError::Io(io::Error::from(errno)))?
        .ok_or_else(|| BrokerError::UnknownIdentity {
            kind: IdentityKind::Group,
            name: group_name.to_string(),
        })?;

    if user.uid.is_root() {
        return Err(BrokerError::RefusedRootExecution {
            plugin: plugin.to_string(),
        });
    }

    Ok(Some(RunAsIdentity {
        user: user_name.to_string(),
        uid: user.uid.as_raw(),
        group: group_name.to_string(),
        gid: group.gid.as_raw(),
    }))
}
