//! Replicated global settings.
//!
//! One `GlobalSettings` record is shared by every node in a project. It is
//! carried verbatim in `SettingsSync` / `SettingsResponse` payloads and
//! persisted to disk as the same bytes, so the bincode round-trip must be
//! exact.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{bincode_config, Result};
use bincode::Options;

/// Project-wide tunables, replicated with last-writer-wins resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    // Project identification
    pub project_name: String,
    pub project_version: String,
    pub project_id: Uuid,

    // Networking
    pub sync_port: u16,
    pub broadcast_interval_secs: f32,
    pub connection_timeout_secs: u32,

    // Time synchronization
    pub sync_interval_ms: u32,
    pub max_time_offset_ms: u32,
    pub p_gain: f32,
    pub i_gain: f32,
    pub filter_weight: f32,

    // Frame synchronization
    pub target_frame_rate: f32,
    pub force_frame_lock: bool,
    pub max_frame_skew: u32,

    // Master election
    pub master_priority: f32,
    pub can_be_master: bool,
    pub force_master: bool,

    // Replication bookkeeping: a strictly larger (version, last_updated_ms)
    // pair dominates.
    pub version: u32,
    pub last_updated_by: String,
    pub last_updated_ms: i64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            project_name: "DefaultProject".to_string(),
            project_version: "1.0".to_string(),
            project_id: Uuid::new_v4(),

            sync_port: 7000,
            broadcast_interval_secs: 2.0,
            connection_timeout_secs: 10,

            sync_interval_ms: 1000,
            max_time_offset_ms: 5000,
            p_gain: 0.5,
            i_gain: 0.01,
            filter_weight: 0.5,

            target_frame_rate: 60.0,
            force_frame_lock: false,
            max_frame_skew: 1,

            master_priority: 0.5,
            can_be_master: true,
            force_master: false,

            version: 1,
            last_updated_by: "system".to_string(),
            last_updated_ms: 0,
        }
    }
}

impl GlobalSettings {
    /// Bounds-check every field. Invalid settings are rejected whether they
    /// come from the local embedder or from a remote peer.
    pub fn validate(&self) -> bool {
        if self.project_name.is_empty() || self.project_version.is_empty() {
            return false;
        }
        if self.project_id.is_nil() {
            return false;
        }

        if self.sync_port < 1024 {
            return false;
        }
        if self.broadcast_interval_secs <= 0.0 || self.connection_timeout_secs == 0 {
            return false;
        }

        if self.sync_interval_ms == 0 || self.max_time_offset_ms == 0 {
            return false;
        }
        if self.p_gain <= 0.0 || self.i_gain <= 0.0 {
            return false;
        }
        if self.filter_weight <= 0.0 || self.filter_weight >= 1.0 {
            return false;
        }

        if self.target_frame_rate <= 0.0 {
            return false;
        }

        if !(0.0..=1.0).contains(&self.master_priority) {
            return false;
        }

        true
    }

    /// True when this record strictly dominates `other` under the
    /// `(version, last_updated_ms)` partial order.
    pub fn dominates(&self, other: &GlobalSettings) -> bool {
        self.version > other.version
            || (self.version == other.version && self.last_updated_ms > other.last_updated_ms)
    }

    /// True when any tunable differs. Bookkeeping fields and the display
    /// name/version are ignored; two records that differ only in those do
    /// not warrant a broadcast.
    pub fn is_materially_different_from(&self, other: &GlobalSettings) -> bool {
        self.project_id != other.project_id
            || self.sync_port != other.sync_port
            || self.broadcast_interval_secs != other.broadcast_interval_secs
            || self.connection_timeout_secs != other.connection_timeout_secs
            || self.sync_interval_ms != other.sync_interval_ms
            || self.max_time_offset_ms != other.max_time_offset_ms
            || self.p_gain != other.p_gain
            || self.i_gain != other.i_gain
            || self.filter_weight != other.filter_weight
            || self.target_frame_rate != other.target_frame_rate
            || self.force_frame_lock != other.force_frame_lock
            || self.max_frame_skew != other.max_frame_skew
            || self.master_priority != other.master_priority
            || self.can_be_master != other.can_be_master
            || self.force_master != other.force_master
    }

    /// Serialize for the wire or for the settings file.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode_config().serialize(self)?)
    }

    /// Deserialize from the wire or from the settings file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode_config().deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(GlobalSettings::default().validate());
    }

    #[test]
    fn serialization_roundtrip_is_exact() {
        let mut settings = GlobalSettings::default();
        settings.version = 17;
        settings.last_updated_by = "render-03".to_string();
        settings.last_updated_ms = 1_726_000_000_123;
        settings.target_frame_rate = 48.0;

        let bytes = settings.to_bytes().unwrap();
        let restored = GlobalSettings::from_bytes(&bytes).unwrap();
        assert_eq!(restored, settings);
        assert_eq!(restored.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn validation_bounds() {
        let valid = GlobalSettings::default();

        let mut s = valid.clone();
        s.sync_port = 1023;
        assert!(!s.validate());

        let mut s = valid.clone();
        s.broadcast_interval_secs = 0.0;
        assert!(!s.validate());

        let mut s = valid.clone();
        s.filter_weight = 1.0;
        assert!(!s.validate());

        let mut s = valid.clone();
        s.p_gain = 0.0;
        assert!(!s.validate());

        let mut s = valid.clone();
        s.target_frame_rate = -60.0;
        assert!(!s.validate());

        let mut s = valid.clone();
        s.master_priority = 1.5;
        assert!(!s.validate());

        let mut s = valid;
        s.project_name.clear();
        assert!(!s.validate());
    }

    #[test]
    fn dominance_order() {
        let mut a = GlobalSettings::default();
        let mut b = a.clone();

        a.version = 5;
        a.last_updated_ms = 1000;
        b.version = 5;
        b.last_updated_ms = 2000;
        assert!(b.dominates(&a));
        assert!(!a.dominates(&b));

        b.version = 4;
        assert!(a.dominates(&b));

        b.version = 5;
        b.last_updated_ms = 1000;
        assert!(!a.dominates(&b));
        assert!(!b.dominates(&a));
    }

    #[test]
    fn material_difference_ignores_bookkeeping() {
        let a = GlobalSettings::default();
        let mut b = a.clone();
        b.version = 99;
        b.last_updated_by = "elsewhere".to_string();
        b.last_updated_ms = 12345;
        assert!(!a.is_materially_different_from(&b));

        b.target_frame_rate = 30.0;
        assert!(a.is_materially_different_from(&b));
    }
}
