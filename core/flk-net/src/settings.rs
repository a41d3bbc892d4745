//! Settings replication.
//!
//! Every node holds one `GlobalSettings` record. Local mutations bump the
//! version and stamp the author; remote records win when their
//! `(version, last_updated_ms)` pair dominates. Convergence is driven by the
//! leader's periodic broadcast, but the dominance rule alone is enough for
//! any two peers to agree.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use flk_protocol::GlobalSettings;

use crate::error::{NetError, Result};
use crate::SETTINGS_BROADCAST_INTERVAL_SECS;

/// Unanswered settings requests are retried this often, this many times.
const REQUEST_RETRY_SECS: f64 = 2.0;
const REQUEST_MAX_ATTEMPTS: u32 = 3;

/// Outcome of processing a remote settings record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The remote record dominated and was applied.
    Applied,
    /// Same version and timestamp, nothing to do.
    Identical,
    /// Our record dominates; the sender is behind.
    StaleRemote,
    /// The record failed validation and was rejected.
    Invalid,
}

struct PendingRequest {
    attempts: u32,
    last_sent_secs: f64,
}

/// Replicated settings state for one node.
pub struct SettingsReplicator {
    identity: String,
    current: GlobalSettings,
    file_path: Option<PathBuf>,
    last_broadcast_secs: f64,
    pending_request: Option<PendingRequest>,
    version_rejections: u64,
}

impl SettingsReplicator {
    /// Build the replicator, loading persisted settings when the file
    /// exists. A corrupt or invalid file is ignored in favor of `initial`.
    pub fn new(identity: String, initial: GlobalSettings, file_path: Option<PathBuf>) -> Self {
        let mut replicator = Self {
            identity,
            current: initial,
            file_path,
            last_broadcast_secs: 0.0,
            pending_request: None,
            version_rejections: 0,
        };

        if let Some(path) = replicator.file_path.clone() {
            if path.exists() {
                match replicator.load_from(&path) {
                    Ok(()) => info!(path = %path.display(), "settings loaded from file"),
                    Err(err) => warn!(path = %path.display(), error = %err, "settings file unusable, using defaults"),
                }
            }
        }

        replicator
    }

    pub fn current(&self) -> &GlobalSettings {
        &self.current
    }

    /// Apply a local mutation. Validation failures leave the current
    /// settings untouched. Returns `true` when the record actually changed
    /// (and therefore deserves a notification and a broadcast).
    pub fn update_local(&mut self, mut new: GlobalSettings, now_ms: i64) -> Result<bool> {
        if !new.validate() {
            warn!("rejecting invalid local settings update");
            return Err(NetError::InvalidSettings);
        }

        if !self.current.is_materially_different_from(&new) {
            return Ok(false);
        }

        new.version = self.current.version + 1;
        new.last_updated_by = self.identity.clone();
        new.last_updated_ms = now_ms;
        self.current = new;

        info!(version = self.current.version, "settings updated locally");
        self.persist();
        Ok(true)
    }

    /// Apply a remote record under the dominance rule.
    pub fn handle_remote(&mut self, bytes: &[u8]) -> RemoteOutcome {
        let remote = match GlobalSettings::from_bytes(bytes) {
            Ok(remote) => remote,
            Err(err) => {
                debug!(error = %err, "undecodable remote settings");
                return RemoteOutcome::Invalid;
            }
        };

        if !remote.validate() {
            warn!(
                from = %remote.last_updated_by,
                "rejecting invalid remote settings"
            );
            return RemoteOutcome::Invalid;
        }

        if remote.dominates(&self.current) {
            info!(
                version = remote.version,
                from = %remote.last_updated_by,
                "adopting remote settings"
            );
            self.current = remote;
            self.pending_request = None;
            self.persist();
            RemoteOutcome::Applied
        } else if self.current.dominates(&remote) {
            self.version_rejections += 1;
            debug!(
                local = self.current.version,
                remote = remote.version,
                "ignoring stale remote settings"
            );
            RemoteOutcome::StaleRemote
        } else {
            RemoteOutcome::Identical
        }
    }

    /// Serialized current settings, for SettingsResponse / SettingsSync.
    pub fn serialized(&self) -> Result<Vec<u8>> {
        Ok(self.current.to_bytes()?)
    }

    /// Leader cadence: serialized settings to broadcast, every 5 s.
    pub fn maybe_broadcast(&mut self, is_leader: bool, now_secs: f64) -> Option<Vec<u8>> {
        if !is_leader {
            return None;
        }
        if now_secs - self.last_broadcast_secs < SETTINGS_BROADCAST_INTERVAL_SECS {
            return None;
        }
        self.last_broadcast_secs = now_secs;
        self.serialized().ok()
    }

    /// Begin asking the LAN for current settings (a follower that just
    /// joined). Retried by `maybe_retry_request`.
    pub fn begin_request(&mut self, now_secs: f64) {
        self.pending_request = Some(PendingRequest {
            attempts: 1,
            last_sent_secs: now_secs,
        });
    }

    /// True when an unanswered request should be re-sent now.
    pub fn maybe_retry_request(&mut self, now_secs: f64) -> bool {
        let Some(pending) = &mut self.pending_request else {
            return false;
        };
        if now_secs - pending.last_sent_secs < REQUEST_RETRY_SECS {
            return false;
        }
        if pending.attempts >= REQUEST_MAX_ATTEMPTS {
            warn!(
                attempts = pending.attempts,
                "settings request went unanswered, giving up"
            );
            self.pending_request = None;
            return false;
        }
        pending.attempts += 1;
        pending.last_sent_secs = now_secs;
        debug!(attempt = pending.attempts, "retrying settings request");
        true
    }

    /// A SettingsResponse arrived; stop retrying regardless of outcome.
    pub fn mark_response_received(&mut self) {
        self.pending_request = None;
    }

    pub fn version_rejections(&self) -> u64 {
        self.version_rejections
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn load_from(&mut self, path: &PathBuf) -> Result<()> {
        let bytes = fs::read(path)?;
        let loaded = GlobalSettings::from_bytes(&bytes)?;
        if !loaded.validate() {
            return Err(NetError::InvalidSettings);
        }
        self.current = loaded;
        Ok(())
    }

    fn persist(&self) {
        let Some(path) = &self.file_path else {
            return;
        };
        match self.write_file(path) {
            Ok(()) => debug!(path = %path.display(), "settings persisted"),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to persist settings"),
        }
    }

    fn write_file(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.current.to_bytes()?)?;
        Ok(())
    }

    /// Flush to disk; called on shutdown.
    pub fn save(&self) {
        self.persist();
    }

    /// Install a record verbatim, bypassing versioning. Test setup only.
    #[cfg(test)]
    pub(crate) fn force_current(&mut self, settings: GlobalSettings) {
        self.current = settings;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replicator(identity: &str) -> SettingsReplicator {
        SettingsReplicator::new(identity.to_string(), GlobalSettings::default(), None)
    }

    #[test]
    fn local_update_bumps_version_and_stamps_author() {
        let mut rep = replicator("render-01");
        let mut new = rep.current().clone();
        new.target_frame_rate = 48.0;

        assert!(rep.update_local(new, 1000).unwrap());
        assert_eq!(rep.current().version, 2);
        assert_eq!(rep.current().last_updated_by, "render-01");
        assert_eq!(rep.current().last_updated_ms, 1000);
        assert_eq!(rep.current().target_frame_rate, 48.0);
    }

    #[test]
    fn identical_update_is_a_noop() {
        let mut rep = replicator("render-01");
        let same = rep.current().clone();
        assert!(!rep.update_local(same, 1000).unwrap());
        assert_eq!(rep.current().version, 1);
    }

    #[test]
    fn invalid_update_rejected_and_current_retained() {
        let mut rep = replicator("render-01");
        let mut bad = rep.current().clone();
        bad.sync_port = 80;
        assert!(rep.update_local(bad, 1000).is_err());
        assert_eq!(rep.current().sync_port, 7000);
    }

    #[test]
    fn dominating_remote_applied() {
        let mut rep = replicator("render-01");
        let mut remote = rep.current().clone();
        remote.version = 5;
        remote.last_updated_by = "render-02".to_string();
        remote.last_updated_ms = 99;
        remote.target_frame_rate = 24.0;

        let bytes = remote.to_bytes().unwrap();
        assert_eq!(rep.handle_remote(&bytes), RemoteOutcome::Applied);
        assert_eq!(rep.current().target_frame_rate, 24.0);
        assert_eq!(rep.current().version, 5);
    }

    #[test]
    fn same_version_newer_timestamp_wins() {
        // Spec scenario S6: A has v5 at t=1000, B has v5 at t=2000.
        let mut a = replicator("a-node");
        let mut b = replicator("b-node");

        let mut a_settings = a.current().clone();
        a_settings.version = 5;
        a_settings.last_updated_ms = 1000;
        a_settings.target_frame_rate = 30.0;
        a.current = a_settings;

        let mut b_settings = b.current().clone();
        b_settings.version = 5;
        b_settings.last_updated_ms = 2000;
        b_settings.target_frame_rate = 50.0;
        b.current = b_settings;

        // One exchange in each direction.
        let from_b = b.serialized().unwrap();
        let from_a = a.serialized().unwrap();
        assert_eq!(a.handle_remote(&from_b), RemoteOutcome::Applied);
        assert_eq!(b.handle_remote(&from_a), RemoteOutcome::StaleRemote);

        assert_eq!(a.current().target_frame_rate, 50.0);
        assert_eq!(b.current().target_frame_rate, 50.0);
        assert_eq!(a.current(), b.current());
    }

    #[test]
    fn stale_remote_ignored() {
        let mut rep = replicator("render-01");
        let mut new = rep.current().clone();
        new.target_frame_rate = 48.0;
        rep.update_local(new, 5000).unwrap();

        let mut stale = rep.current().clone();
        stale.version = 1;
        stale.target_frame_rate = 999.0;
        let bytes = stale.to_bytes().unwrap();
        assert_eq!(rep.handle_remote(&bytes), RemoteOutcome::StaleRemote);
        assert_eq!(rep.current().target_frame_rate, 48.0);
        assert_eq!(rep.version_rejections(), 1);
    }

    #[test]
    fn invalid_remote_rejected() {
        let mut rep = replicator("render-01");
        let mut bad = rep.current().clone();
        bad.version = 50;
        bad.filter_weight = 7.0;
        let bytes = bad.to_bytes().unwrap();
        assert_eq!(rep.handle_remote(&bytes), RemoteOutcome::Invalid);
        assert_eq!(rep.current().version, 1);

        assert_eq!(rep.handle_remote(b"garbage"), RemoteOutcome::Invalid);
    }

    #[test]
    fn leader_broadcast_cadence() {
        let mut rep = replicator("render-01");
        assert!(rep.maybe_broadcast(false, 10.0).is_none());
        assert!(rep.maybe_broadcast(true, 10.0).is_some());
        assert!(rep.maybe_broadcast(true, 12.0).is_none());
        assert!(rep.maybe_broadcast(true, 15.1).is_some());
    }

    #[test]
    fn request_retry_gives_up_after_three_attempts() {
        let mut rep = replicator("render-01");
        rep.begin_request(0.0);

        assert!(!rep.maybe_retry_request(1.0)); // too soon
        assert!(rep.maybe_retry_request(2.5)); // attempt 2
        assert!(rep.maybe_retry_request(5.0)); // attempt 3
        assert!(!rep.maybe_retry_request(7.5)); // exhausted
        assert!(!rep.maybe_retry_request(100.0)); // cleared
    }

    #[test]
    fn response_stops_retries() {
        let mut rep = replicator("render-01");
        rep.begin_request(0.0);
        rep.mark_response_received();
        assert!(!rep.maybe_retry_request(10.0));
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("framelock").join("settings.bin");

        {
            let mut rep = SettingsReplicator::new(
                "render-01".to_string(),
                GlobalSettings::default(),
                Some(path.clone()),
            );
            let mut new = rep.current().clone();
            new.target_frame_rate = 23.976;
            new.master_priority = 0.8;
            rep.update_local(new, 777).unwrap();
        }

        let restored = SettingsReplicator::new(
            "render-01".to_string(),
            GlobalSettings::default(),
            Some(path),
        );
        assert_eq!(restored.current().target_frame_rate, 23.976);
        assert_eq!(restored.current().master_priority, 0.8);
        assert_eq!(restored.current().version, 2);
        assert_eq!(restored.current().last_updated_ms, 777);
    }
}
