//! External P2P distribution helper for large copies. Available when the
//! operator configured both `p2p.client` and `p2p.mkseed`; the seed file is
//! shipped through the normal transfer path and every host runs the client
//! command against it.

use crate::config;
use crate::util;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Report;
use std::path::{Path, PathBuf};

fn tmpdir(key: &str) -> String {
    let dir = config::get_string(key);
    if dir.is_empty() {
        "/tmp".to_string()
    } else {
        dir
    }
}

pub struct P2pManager {
    client: String,
    mkseed: String,
    src: String,
}

impl P2pManager {
    /// Some manager when both p2p commands are configured.
    pub fn from_config() -> Option<Self> {
        let client = config::get_string("p2p.client");
        let mkseed = config::get_string("p2p.mkseed");
        if client.is_empty() || mkseed.is_empty() {
            return None;
        }
        Some(Self {
            client,
            mkseed,
            src: String::new(),
        })
    }

    pub fn set_transfer(&mut self, src: &str) {
        self.src = src.to_string();
    }

    /// Local seed path: `local.tmpdir/<src with / replaced by _>.torrent`.
    pub fn torrent_path(&self) -> PathBuf {
        let mangled = self.src.replace('/', "_");
        Path::new(&tmpdir("local.tmpdir")).join(format!("{}.torrent", mangled))
    }

    fn remote_torrent_path(&self) -> PathBuf {
        let basename = self
            .torrent_path()
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Path::new(&tmpdir("remote.tmpdir")).join(basename)
    }

    /// Runs the configured mkseed command against the torrent path.
    pub fn mkseed(&self) -> Result<(), Report> {
        let cmdline = format!("{} {}", self.mkseed, self.torrent_path().display());
        let parts = util::split_by_space(&cmdline);
        let output = std::process::Command::new(&parts[0])
            .args(&parts[1..])
            .output()
            .wrap_err("run mkseed")?;
        if !output.status.success() {
            return Err(eyre!(
                "mkseed failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }

    /// The command every host runs to pull the payload.
    pub fn client_cmd(&self) -> String {
        format!("{} {}", self.client, self.remote_torrent_path().display())
    }

    /// The seed file itself still travels over scp.
    pub fn need_transfer_file(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(src: &str) -> P2pManager {
        let mut manager = P2pManager {
            client: "p2p-get".to_string(),
            mkseed: "p2p-seed".to_string(),
            src: String::new(),
        };
        manager.set_transfer(src);
        manager
    }

    #[test]
    fn unavailable_without_configuration() {
        assert!(P2pManager::from_config().is_none());
    }

    #[test]
    fn torrent_path_mangles_the_source_path() {
        let manager = manager("/srv/data/big.tar");
        assert_eq!(
            manager.torrent_path(),
            PathBuf::from("/tmp/_srv_data_big.tar.torrent")
        );
    }

    #[test]
    fn client_cmd_points_at_the_remote_torrent() {
        let manager = manager("/srv/data/big.tar");
        assert_eq!(
            manager.client_cmd(),
            "p2p-get /tmp/_srv_data_big.tar.torrent"
        );
        assert!(manager.need_transfer_file());
    }
}
