//! Discovery and launching of pre-configured plugins.
//!
//! At startup the engine scans a plugin binary directory for executables
//! named `<2-digit-index>-<name>` and spawns each with one end of a
//! socket pair as its only transport (fd 3). External plugin connections
//! are accepted separately on the engine's listening socket.

use std::os::fd::IntoRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::debug;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tokio::net::{UnixListener, UnixStream};

use crate::error::{Error, Result};
use crate::plugin::check_plugin_identity;

pub(crate) const PLUGIN_NAME_ENV: &str = "NRI_PLUGIN_NAME";
pub(crate) const PLUGIN_IDX_ENV: &str = "NRI_PLUGIN_IDX";
pub(crate) const PLUGIN_SOCKET_ENV: &str = "NRI_PLUGIN_SOCKET";

/// Fd number the plugin end of the socket pair lands on in the child.
pub(crate) const PLUGIN_SOCKET_FD: i32 = 3;

pub(crate) struct DiscoveredPlugin {
    pub idx: String,
    pub name: String,
    pub path: PathBuf,
}

/// Scan the plugin directory for launchable binaries, in registry order.
/// A missing directory simply yields nothing.
pub(crate) fn discover_plugins(dir: &Path) -> Result<Vec<DiscoveredPlugin>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("plugin directory {} does not exist", dir.display());
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(Error::Config(format!(
                "failed to read plugin directory {}: {}",
                dir.display(),
                e
            )));
        }
    };

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((idx, name)) = parse_plugin_filename(file_name) else {
            debug!("skipping {}: not a plugin binary name", file_name);
            continue;
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
            debug!("skipping {}: not executable", file_name);
            continue;
        }
        found.push(DiscoveredPlugin {
            idx: idx.to_string(),
            name: name.to_string(),
            path,
        });
    }
    found.sort_by(|a, b| a.idx.cmp(&b.idx).then_with(|| a.name.cmp(&b.name)));
    Ok(found)
}

/// Split `<2-digit-index>-<name>` into its parts.
pub(crate) fn parse_plugin_filename(file_name: &str) -> Option<(&str, &str)> {
    let (idx, name) = file_name.split_once('-')?;
    check_plugin_identity(idx, name).ok()?;
    Some((idx, name))
}

/// Read the plugin's configuration file from the config directory.
pub(crate) fn read_plugin_config(dir: &Path, name: &str) -> Result<Option<String>> {
    let path = dir.join(format!("{}.conf", name));
    match std::fs::read_to_string(&path) {
        Ok(config) => Ok(Some(config)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Config(format!(
            "failed to read plugin config {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Spawn a plugin binary with its end of a fresh socket pair as fd 3 and
/// return our end with the child process.
pub(crate) fn spawn_plugin(
    plugin: &DiscoveredPlugin,
) -> Result<(UnixStream, tokio::process::Child)> {
    let (local, remote) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|e| Error::Config(format!("socketpair failed: {}", e)))?;

    let mut cmd = tokio::process::Command::new(&plugin.path);
    cmd.env(PLUGIN_NAME_ENV, &plugin.name)
        .env(PLUGIN_IDX_ENV, &plugin.idx)
        .env(PLUGIN_SOCKET_ENV, PLUGIN_SOCKET_FD.to_string())
        .kill_on_drop(true);

    let remote_fd = remote.into_raw_fd();
    unsafe {
        cmd.pre_exec(move || {
            // The dup clears close-on-exec, so fd 3 survives into the plugin.
            nix::unistd::dup2(remote_fd, PLUGIN_SOCKET_FD).map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| {
        Error::Config(format!(
            "failed to launch plugin {}: {}",
            plugin.path.display(),
            e
        ))
    })?;
    let _ = nix::unistd::close(remote_fd);

    let local = std::os::unix::net::UnixStream::from(local);
    local
        .set_nonblocking(true)
        .map_err(|e| Error::Config(format!("failed to set up plugin socket: {}", e)))?;
    let stream = UnixStream::from_std(local)
        .map_err(|e| Error::Config(format!("failed to set up plugin socket: {}", e)))?;
    Ok((stream, child))
}

/// Bind the engine's listening socket, replacing a stale socket file.
pub(crate) fn bind_listener(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::Config(format!(
                "failed to create socket directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::Config(format!(
                "failed to remove stale socket {}: {}",
                path.display(),
                e
            )));
        }
    }
    UnixListener::bind(path)
        .map_err(|e| Error::Config(format!("failed to bind socket {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, name: &str, mode: u32) {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_parse_plugin_filename() {
        assert_eq!(parse_plugin_filename("00-test"), Some(("00", "test")));
        assert_eq!(parse_plugin_filename("10-foo-bar"), Some(("10", "foo-bar")));
        assert_eq!(parse_plugin_filename("test"), None);
        assert_eq!(parse_plugin_filename("0-test"), None);
        assert_eq!(parse_plugin_filename("0a-test"), None);
        assert_eq!(parse_plugin_filename("00-"), None);
    }

    #[test]
    fn test_discover_plugins_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "10-logger", 0o755);
        touch(dir.path(), "00-device", 0o755);
        touch(dir.path(), "05-skipped", 0o644);
        touch(dir.path(), "notaplugin", 0o755);
        touch(dir.path(), "xx-bad", 0o755);

        let found = discover_plugins(dir.path()).unwrap();
        let ids: Vec<_> = found
            .iter()
            .map(|p| format!("{}-{}", p.idx, p.name))
            .collect();
        assert_eq!(ids, vec!["00-device", "10-logger"]);
    }

    #[test]
    fn test_discover_plugins_missing_dir_is_empty() {
        let found = discover_plugins(Path::new("/nonexistent/nri/plugins")).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_read_plugin_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("logger.conf"), "verbose = true\n").unwrap();

        let config = read_plugin_config(dir.path(), "logger").unwrap();
        assert_eq!(config.as_deref(), Some("verbose = true\n"));
        assert!(read_plugin_config(dir.path(), "missing").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bind_listener_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nri.sock");

        let first = bind_listener(&path).unwrap();
        drop(first);
        // The socket file is still there; binding again must succeed.
        let _second = bind_listener(&path).unwrap();
    }
}
