//! The protocol engine.
//!
//! One `Engine` owns every piece of mutable protocol state: peer registry,
//! election, PTP clock, PLL, frame controller, settings replicator and
//! telemetry. It is a reducer: the caller feeds it received messages and
//! clock readings, and it returns the datagrams to put on the wire. It
//! touches no sockets and never sleeps, so the transport pumps it on the
//! protocol thread and tests pump it with virtual clocks.

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{debug, info, trace};
use uuid::Uuid;

use flk_protocol::{
    decode_frame_number, decode_payload, decode_utf16_payload, encode_frame_number,
    encode_payload, encode_utf16_payload, parse_host_port, GlobalSettings,
    MasterAnnouncePayload, MasterElectionPayload, MasterResignPayload, MasterVotePayload,
    Message, MessageType, PingKind, PingPayload, PtpKind, PtpMessage,
};
use flk_sync::{FrameSyncController, LatencyStats, PtpClock, QualityAssessment, SoftwarePll};

use crate::election::{Election, ElectionAction};
use crate::peers::{PeerRecord, PeerRegistry};
use crate::settings::{RemoteOutcome, SettingsReplicator};
use crate::telemetry::{MeasurementConfig, NetworkEvent, Telemetry};

/// Registry sweep cadence.
const SWEEP_INTERVAL_SECS: f64 = 1.0;

/// Clock readings for one engine call: monotonic seconds for liveness and
/// timeouts, wall microseconds for protocol timestamps.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    pub mono_secs: f64,
    pub wall_us: i64,
}

impl Clock {
    pub fn read() -> Self {
        Self {
            mono_secs: flk_sync::monotonic_us() as f64 / 1_000_000.0,
            wall_us: flk_sync::now_us(),
        }
    }
}

/// A datagram the caller must send.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Send to the LAN broadcast address.
    Broadcast(Message),
    /// Send to one endpoint.
    Unicast(SocketAddr, Message),
}

/// Events surfaced to the embedder.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RoleChanged { is_master: bool, term: i32 },
    SettingsChanged(GlobalSettings),
    NetworkStateChanged(NetworkEvent),
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub identity: String,
    pub project_id: Uuid,
    pub project_version: String,
    pub unicast_port: u16,
    pub settings_path: Option<PathBuf>,
    pub initial_settings: GlobalSettings,
}

/// The single owner of all protocol state.
pub struct Engine {
    identity: String,
    project_id: Uuid,
    project_version: String,
    unicast_port: u16,

    sequence: u16,
    registry: PeerRegistry,
    election: Election,
    ptp: PtpClock,
    pll: SoftwarePll,
    frame: FrameSyncController,
    settings: SettingsReplicator,
    telemetry: Telemetry,

    last_sweep_secs: f64,
    last_discovery_secs: f64,
    events: Vec<EngineEvent>,

    wire_drops: u64,
    foreign_project_drops: u64,
}

impl Engine {
    pub fn new(config: EngineConfig, clock: Clock) -> Self {
        let settings = SettingsReplicator::new(
            config.identity.clone(),
            config.initial_settings,
            config.settings_path,
        );
        let current = settings.current().clone();

        let election = Election::new(
            config.identity.clone(),
            current.master_priority,
            current.can_be_master,
            clock.mono_secs,
        );

        let mut engine = Self {
            identity: config.identity.clone(),
            project_id: config.project_id,
            project_version: config.project_version,
            unicast_port: config.unicast_port,
            sequence: 0,
            registry: PeerRegistry::new(config.identity),
            election,
            ptp: PtpClock::new(),
            pll: SoftwarePll::new(),
            frame: FrameSyncController::new(),
            settings,
            telemetry: Telemetry::new(),
            last_sweep_secs: clock.mono_secs,
            last_discovery_secs: f64::MIN,
            events: Vec::new(),
            wire_drops: 0,
            foreign_project_drops: 0,
        };
        engine.apply_settings(&current, clock);
        engine
    }

    // ------------------------------------------------------------------
    // Accessors used by the facade
    // ------------------------------------------------------------------

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_master(&self) -> bool {
        self.election.is_master()
    }

    pub fn current_term(&self) -> i32 {
        self.election.current_term()
    }

    pub fn master_identity(&self) -> Option<String> {
        self.election.master_identity()
    }

    /// Synchronized wall time: the master's own clock, or the PLL-adjusted
    /// clock on followers.
    pub fn synced_time_us(&self, clock: Clock) -> i64 {
        if self.is_master() {
            clock.wall_us
        } else {
            self.pll.adjusted_time_us(clock.wall_us)
        }
    }

    pub fn phase_adjustment_us(&self) -> i64 {
        self.pll.phase_adjustment_us()
    }

    pub fn estimated_error_us(&self) -> i64 {
        if self.is_master() {
            0
        } else {
            self.ptp.estimated_error_us()
        }
    }

    pub fn is_time_synchronized(&self) -> bool {
        self.ptp.is_synchronized()
    }

    pub fn is_frame_synchronized(&self) -> bool {
        self.frame.is_synchronized()
    }

    pub fn synced_frame_number(&self) -> i64 {
        self.frame.synced_frame_number()
    }

    pub fn frame_adjustment_ms(&self) -> f32 {
        self.frame.adjustment_ms()
    }

    pub fn pll_locked(&self) -> bool {
        self.pll.is_locked()
    }

    pub fn discovered_servers(&self) -> Vec<String> {
        self.registry.descriptions()
    }

    pub fn peer_endpoints(&self) -> Vec<SocketAddr> {
        self.registry.endpoints()
    }

    pub fn settings(&self) -> &GlobalSettings {
        self.settings.current()
    }

    pub fn latency_stats(&self, endpoint: SocketAddr) -> Option<LatencyStats> {
        self.telemetry.stats(endpoint)
    }

    pub fn evaluate_network_quality(&self, endpoint: SocketAddr) -> Option<QualityAssessment> {
        self.telemetry.evaluate(endpoint)
    }

    pub fn network_events(&self, endpoint: SocketAddr) -> Vec<NetworkEvent> {
        self.telemetry.events(endpoint)
    }

    /// Drain events accumulated since the last call.
    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// (undecodable datagrams, foreign-project datagrams)
    pub fn drop_counters(&self) -> (u64, u64) {
        (self.wire_drops, self.foreign_project_drops)
    }

    // ------------------------------------------------------------------
    // Commands from the facade
    // ------------------------------------------------------------------

    /// Broadcast a Discovery immediately.
    pub fn discover_now(&mut self, clock: Clock) -> Vec<Outbound> {
        self.last_discovery_secs = clock.mono_secs;
        vec![Outbound::Broadcast(self.make_message(
            MessageType::Discovery,
            encode_utf16_payload(&self.identity),
        ))]
    }

    /// Operator override: force or resign the master role.
    pub fn set_master_mode(&mut self, master: bool, clock: Clock) -> Vec<Outbound> {
        let mut out = Vec::new();
        if master {
            let actions = self.election.force_leadership(clock.mono_secs);
            self.process_election_actions(actions, clock, &mut out);
        } else {
            let was_master = self.is_master();
            let actions = self.election.resign(clock.mono_secs);
            self.process_election_actions(actions, clock, &mut out);
            if was_master {
                // Tell the LAN explicitly so followers elect right away.
                if let Ok(bytes) = encode_payload(&MasterResignPayload {
                    identity: self.identity.clone(),
                    term: self.election.current_term(),
                }) {
                    out.push(Outbound::Broadcast(
                        self.make_message(MessageType::MasterResign, bytes),
                    ));
                }
            }
        }
        out
    }

    /// Validate and adopt new settings; broadcast when we are the leader.
    pub fn update_settings(
        &mut self,
        new: GlobalSettings,
        clock: Clock,
    ) -> crate::Result<Vec<Outbound>> {
        let changed = self.settings.update_local(new, clock.wall_us / 1000)?;
        let mut out = Vec::new();
        if changed {
            let current = self.settings.current().clone();
            self.apply_settings(&current, clock);
            self.events.push(EngineEvent::SettingsChanged(current));
            if self.is_master() {
                if let Ok(bytes) = self.settings.serialized() {
                    out.push(Outbound::Broadcast(
                        self.make_message(MessageType::SettingsSync, bytes),
                    ));
                }
            }
        }
        Ok(out)
    }

    pub fn set_target_fps(&mut self, fps: f32) {
        self.frame.set_target_fps(fps);
    }

    pub fn start_latency_measurement(
        &mut self,
        endpoint: SocketAddr,
        config: MeasurementConfig,
        clock: Clock,
    ) {
        self.telemetry.start(endpoint, config, clock.mono_secs);
    }

    pub fn stop_latency_measurement(&mut self, endpoint: SocketAddr) {
        self.telemetry.stop(endpoint);
    }

    pub fn telemetry_mut(&mut self) -> &mut Telemetry {
        &mut self.telemetry
    }

    /// External frame tick. On the master this advances the counter and
    /// returns the FrameSync broadcast; on followers it refreshes the
    /// timing adjustment.
    pub fn frame_tick(&mut self, clock: Clock) -> Vec<Outbound> {
        match self.frame.tick(clock.wall_us) {
            Some(frame) => vec![Outbound::Broadcast(
                self.make_message(MessageType::FrameSync, encode_frame_number(frame)),
            )],
            None => Vec::new(),
        }
    }

    pub fn recommended_sleep(&self) -> Option<std::time::Duration> {
        self.frame.recommended_sleep()
    }

    /// Flush persistent state; called at shutdown.
    pub fn shutdown(&mut self) {
        self.settings.save();
    }

    // ------------------------------------------------------------------
    // Periodic tick (protocol thread, <= 50 Hz)
    // ------------------------------------------------------------------

    pub fn tick(&mut self, clock: Clock) -> Vec<Outbound> {
        let mut out = Vec::new();

        // Election timers.
        let actions = self.election.tick(clock.mono_secs);
        self.process_election_actions(actions, clock, &mut out);

        // PTP sync emission (master only).
        if let Some((sync, follow_up)) = self.ptp.maybe_emit_sync(clock.wall_us) {
            out.push(Outbound::Broadcast(
                self.make_message(MessageType::TimeSync, sync.encode()),
            ));
            out.push(Outbound::Broadcast(
                self.make_message(MessageType::TimeSync, follow_up.encode()),
            ));
        }

        // Settings replication cadence.
        if let Some(bytes) = self
            .settings
            .maybe_broadcast(self.is_master(), clock.mono_secs)
        {
            out.push(Outbound::Broadcast(
                self.make_message(MessageType::SettingsSync, bytes),
            ));
        }
        if self.settings.maybe_retry_request(clock.mono_secs) {
            out.push(Outbound::Broadcast(
                self.make_message(MessageType::SettingsRequest, Vec::new()),
            ));
        }

        // Telemetry probes and quality events.
        let (probes, events) = self.telemetry.tick(clock.mono_secs, clock.wall_us);
        for (endpoint, payload) in probes {
            out.push(Outbound::Unicast(
                endpoint,
                self.make_message(MessageType::PingRequest, payload.encode()),
            ));
        }
        self.events
            .extend(events.into_iter().map(EngineEvent::NetworkStateChanged));

        // Periodic re-discovery keeps the registry warm.
        let discovery_interval = f64::from(self.settings.current().broadcast_interval_secs);
        if clock.mono_secs - self.last_discovery_secs >= discovery_interval {
            out.extend(self.discover_now(clock));
        }

        // Liveness sweep.
        if clock.mono_secs - self.last_sweep_secs >= SWEEP_INTERVAL_SECS {
            self.last_sweep_secs = clock.mono_secs;
            self.registry.sweep(clock.mono_secs);
        }

        out
    }

    // ------------------------------------------------------------------
    // Message dispatch
    // ------------------------------------------------------------------

    pub fn handle_message(
        &mut self,
        msg: &Message,
        sender: SocketAddr,
        clock: Clock,
    ) -> Vec<Outbound> {
        // Multi-tenant isolation: datagrams from other projects are dropped
        // without any side effect.
        if !msg.project_id.is_nil() && msg.project_id != self.project_id {
            self.foreign_project_drops += 1;
            return Vec::new();
        }

        if let Some(identity) = self.registry.touch_addr(sender, clock.mono_secs) {
            self.registry.observe_sequence(&identity, msg.sequence);
        }

        let mut out = Vec::new();
        match msg.msg_type {
            MessageType::Discovery => self.on_discovery(msg, sender, clock, &mut out),
            MessageType::DiscoveryResponse => self.on_discovery_response(msg, sender, clock),
            MessageType::TimeSync => self.on_time_sync(msg, sender, clock, &mut out),
            MessageType::FrameSync => self.on_frame_sync(msg),
            MessageType::MasterAnnouncement | MessageType::MasterResponse => {
                self.on_master_announcement(msg, sender, clock, &mut out)
            }
            MessageType::MasterQuery => self.on_master_query(sender, &mut out),
            MessageType::MasterElection => self.on_master_election(msg, clock, &mut out),
            MessageType::MasterVote => self.on_master_vote(msg),
            MessageType::MasterResign => self.on_master_resign(msg, clock, &mut out),
            MessageType::RoleChange => {
                trace!(from = %sender, "role change notification");
            }
            MessageType::SettingsSync => self.on_settings_sync(msg, sender, clock, &mut out),
            MessageType::SettingsRequest => self.on_settings_request(sender, &mut out),
            MessageType::SettingsResponse => self.on_settings_response(msg, clock),
            MessageType::PingRequest => self.on_ping_request(msg, sender, &mut out),
            MessageType::PingResponse => self.on_ping_response(msg, sender, clock),
            MessageType::Command | MessageType::Data | MessageType::Custom => {
                trace!(from = %sender, len = msg.payload.len(), "application message");
            }
        }
        out
    }

    fn on_discovery(
        &mut self,
        msg: &Message,
        sender: SocketAddr,
        clock: Clock,
        out: &mut Vec<Outbound>,
    ) {
        let hostname = match decode_utf16_payload(&msg.payload) {
            Ok(hostname) => hostname,
            Err(err) => {
                debug!(from = %sender, error = %err, "bad discovery payload");
                self.wire_drops += 1;
                return;
            }
        };
        let identity = if hostname.is_empty() {
            sender.to_string()
        } else {
            hostname.clone()
        };

        self.registry.upsert(PeerRecord {
            identity,
            ip: sender.ip(),
            port: sender.port(),
            project_id: msg.project_id,
            project_version: String::new(),
            last_seen_secs: clock.mono_secs,
            priority: 0.0,
            election_term_heard: 0,
            last_sequence: Some(msg.sequence),
        });

        // Answer with our own coordinates so the sender learns our unicast
        // port.
        let response = format!("{}:{}", self.identity, self.unicast_port);
        out.push(Outbound::Unicast(
            sender,
            self.make_message(
                MessageType::DiscoveryResponse,
                encode_utf16_payload(&response),
            ),
        ));
    }

    fn on_discovery_response(&mut self, msg: &Message, sender: SocketAddr, clock: Clock) {
        let text = match decode_utf16_payload(&msg.payload) {
            Ok(text) => text,
            Err(err) => {
                debug!(from = %sender, error = %err, "bad discovery response payload");
                self.wire_drops += 1;
                return;
            }
        };
        let (hostname, port) = parse_host_port(&text, crate::DEFAULT_PORT);
        let identity = if hostname.is_empty() {
            sender.to_string()
        } else {
            hostname
        };

        self.registry.upsert(PeerRecord {
            identity,
            ip: sender.ip(),
            port,
            project_id: msg.project_id,
            project_version: self.project_version.clone(),
            last_seen_secs: clock.mono_secs,
            priority: 0.0,
            election_term_heard: 0,
            last_sequence: Some(msg.sequence),
        });
    }

    fn on_time_sync(
        &mut self,
        msg: &Message,
        sender: SocketAddr,
        clock: Clock,
        out: &mut Vec<Outbound>,
    ) {
        let ptp = match PtpMessage::decode(&msg.payload) {
            Ok(ptp) => ptp,
            Err(err) => {
                debug!(error = %err, "bad ptp payload");
                self.wire_drops += 1;
                return;
            }
        };

        match ptp.kind {
            PtpKind::Sync => {
                if let Some(delay_req) = self.ptp.handle_sync(&ptp, clock.wall_us) {
                    // The delay request goes straight back to the master.
                    out.push(Outbound::Unicast(
                        sender,
                        self.make_message(MessageType::TimeSync, delay_req.encode()),
                    ));
                }
            }
            PtpKind::FollowUp => {
                if let Some(sample) = self.ptp.handle_follow_up(&ptp, clock.wall_us) {
                    if let Err(err) = self.pll.update(sample.offset_us, sample.timestamp_us) {
                        debug!(error = %err, "offset sample dropped");
                    }
                }
            }
            PtpKind::DelayReq => {
                if let Some(resp) = self.ptp.handle_delay_req(&ptp, clock.wall_us) {
                    // Answer the requester directly; a broadcast would be
                    // ambiguous when several followers probe the same sync
                    // sequence.
                    out.push(Outbound::Unicast(
                        sender,
                        self.make_message(MessageType::TimeSync, resp.encode()),
                    ));
                }
            }
            PtpKind::DelayResp => {
                if let Some(sample) = self.ptp.handle_delay_resp(&ptp, clock.wall_us) {
                    if let Err(err) = self.pll.update(sample.offset_us, sample.timestamp_us) {
                        debug!(error = %err, "offset sample dropped");
                    }
                }
            }
        }
    }

    fn on_frame_sync(&mut self, msg: &Message) {
        match decode_frame_number(&msg.payload) {
            Ok(frame) => {
                if let Err(err) = self.frame.handle_frame_sync(frame) {
                    trace!(error = %err, "stale frame counter dropped");
                }
            }
            Err(err) => {
                debug!(error = %err, "bad frame sync payload");
                self.wire_drops += 1;
            }
        }
    }

    fn on_master_announcement(
        &mut self,
        msg: &Message,
        sender: SocketAddr,
        clock: Clock,
        out: &mut Vec<Outbound>,
    ) {
        let payload: MasterAnnouncePayload = match decode_payload(&msg.payload) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(from = %sender, error = %err, "bad announcement payload");
                self.wire_drops += 1;
                return;
            }
        };

        self.registry.observe_term(&payload.identity, payload.term);
        self.registry.touch(&payload.identity, clock.mono_secs);

        let actions = self.election.handle_announcement(&payload, clock.mono_secs);
        self.process_election_actions(actions, clock, out);
    }

    fn on_master_query(&mut self, sender: SocketAddr, out: &mut Vec<Outbound>) {
        if let Some(master) = self.election.master_info() {
            let payload = MasterAnnouncePayload {
                identity: master.identity,
                priority: master.priority,
                term: master.term,
            };
            if let Ok(bytes) = encode_payload(&payload) {
                out.push(Outbound::Unicast(
                    sender,
                    self.make_message(MessageType::MasterResponse, bytes),
                ));
            }
        }
    }

    fn on_master_election(&mut self, msg: &Message, clock: Clock, out: &mut Vec<Outbound>) {
        let payload: MasterElectionPayload = match decode_payload(&msg.payload) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(error = %err, "bad election payload");
                self.wire_drops += 1;
                return;
            }
        };
        self.registry.observe_term(&payload.candidate, payload.term);
        let actions = self.election.handle_election(&payload, clock.mono_secs);
        self.process_election_actions(actions, clock, out);
    }

    fn on_master_vote(&mut self, msg: &Message) {
        let payload: MasterVotePayload = match decode_payload(&msg.payload) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(error = %err, "bad vote payload");
                self.wire_drops += 1;
                return;
            }
        };
        self.election.handle_vote(&payload);
    }

    fn on_master_resign(&mut self, msg: &Message, clock: Clock, out: &mut Vec<Outbound>) {
        let payload: MasterResignPayload = match decode_payload(&msg.payload) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(error = %err, "bad resign payload");
                self.wire_drops += 1;
                return;
            }
        };
        let actions = self.election.handle_resign(&payload, clock.mono_secs);
        self.process_election_actions(actions, clock, out);
    }

    fn on_settings_sync(
        &mut self,
        msg: &Message,
        sender: SocketAddr,
        clock: Clock,
        out: &mut Vec<Outbound>,
    ) {
        match self.settings.handle_remote(&msg.payload) {
            RemoteOutcome::Applied => {
                let current = self.settings.current().clone();
                self.apply_settings(&current, clock);
                self.events.push(EngineEvent::SettingsChanged(current));
            }
            RemoteOutcome::StaleRemote => {
                // Help the laggard along with our newer copy.
                if let Ok(bytes) = self.settings.serialized() {
                    out.push(Outbound::Unicast(
                        sender,
                        self.make_message(MessageType::SettingsResponse, bytes),
                    ));
                }
            }
            RemoteOutcome::Identical | RemoteOutcome::Invalid => {}
        }
    }

    fn on_settings_request(&mut self, sender: SocketAddr, out: &mut Vec<Outbound>) {
        if let Ok(bytes) = self.settings.serialized() {
            out.push(Outbound::Unicast(
                sender,
                self.make_message(MessageType::SettingsResponse, bytes),
            ));
        }
    }

    fn on_settings_response(&mut self, msg: &Message, clock: Clock) {
        self.settings.mark_response_received();
        if self.settings.handle_remote(&msg.payload) == RemoteOutcome::Applied {
            let current = self.settings.current().clone();
            self.apply_settings(&current, clock);
            self.events.push(EngineEvent::SettingsChanged(current));
        }
    }

    fn on_ping_request(&mut self, msg: &Message, sender: SocketAddr, out: &mut Vec<Outbound>) {
        let payload = match PingPayload::decode(&msg.payload) {
            Ok(payload) if payload.kind == PingKind::Request => payload,
            Ok(_) => return,
            Err(err) => {
                debug!(from = %sender, error = %err, "bad ping payload");
                self.wire_drops += 1;
                return;
            }
        };
        let response = Telemetry::make_response(&payload);
        out.push(Outbound::Unicast(
            sender,
            self.make_message(MessageType::PingResponse, response.encode()),
        ));
    }

    fn on_ping_response(&mut self, msg: &Message, sender: SocketAddr, clock: Clock) {
        let payload = match PingPayload::decode(&msg.payload) {
            Ok(payload) if payload.kind == PingKind::Response => payload,
            Ok(_) => return,
            Err(err) => {
                debug!(from = %sender, error = %err, "bad ping payload");
                self.wire_drops += 1;
                return;
            }
        };
        self.telemetry
            .handle_response(&payload, sender, clock.mono_secs, clock.wall_us);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn make_message(&mut self, msg_type: MessageType, payload: Vec<u8>) -> Message {
        self.sequence = self.sequence.wrapping_add(1);
        Message::new(msg_type, self.project_id, self.sequence, payload)
    }

    fn process_election_actions(
        &mut self,
        actions: Vec<ElectionAction>,
        clock: Clock,
        out: &mut Vec<Outbound>,
    ) {
        for action in actions {
            match action {
                ElectionAction::Announce(payload) => {
                    if let Ok(bytes) = encode_payload(&payload) {
                        out.push(Outbound::Broadcast(
                            self.make_message(MessageType::MasterAnnouncement, bytes),
                        ));
                    }
                }
                ElectionAction::StartElection(payload) => {
                    if let Ok(bytes) = encode_payload(&payload) {
                        out.push(Outbound::Broadcast(
                            self.make_message(MessageType::MasterElection, bytes),
                        ));
                    }
                }
                ElectionAction::Vote(payload) => {
                    if let Ok(bytes) = encode_payload(&payload) {
                        out.push(Outbound::Broadcast(
                            self.make_message(MessageType::MasterVote, bytes),
                        ));
                    }
                }
                ElectionAction::RoleChange(payload) => {
                    if let Ok(bytes) = encode_payload(&payload) {
                        out.push(Outbound::Broadcast(
                            self.make_message(MessageType::RoleChange, bytes),
                        ));
                    }
                }
                ElectionAction::BecameLeader { term } => {
                    info!(term, "node is now the master");
                    self.ptp.set_master_mode(true);
                    self.frame.set_master_mode(true);
                    self.events.push(EngineEvent::RoleChanged {
                        is_master: true,
                        term,
                    });
                }
                ElectionAction::BecameFollower { master, term } => {
                    info!(master = master.as_deref().unwrap_or("<none>"), term, "node is now a follower");
                    self.ptp.set_master_mode(false);
                    self.frame.set_master_mode(false);
                    self.events.push(EngineEvent::RoleChanged {
                        is_master: false,
                        term,
                    });
                    // A fresh follower asks the LAN for current settings.
                    self.settings.begin_request(clock.mono_secs);
                    out.push(Outbound::Broadcast(
                        self.make_message(MessageType::SettingsRequest, Vec::new()),
                    ));
                }
            }
        }
    }

    fn apply_settings(&mut self, settings: &GlobalSettings, clock: Clock) {
        self.pll.configure(
            f64::from(settings.p_gain),
            f64::from(settings.i_gain),
            f64::from(settings.filter_weight),
        );
        self.ptp
            .set_sync_interval_us(i64::from(settings.sync_interval_ms) * 1000);
        self.frame.set_target_fps(settings.target_frame_rate);
        self.election.set_priority(settings.master_priority);
        self.election.set_can_be_master(settings.can_be_master);

        if settings.force_master && !self.is_master() {
            let actions = self.election.force_leadership(clock.mono_secs);
            let mut out = Vec::new();
            self.process_election_actions(actions, clock, &mut out);
            // Outbound announcements from a forced promotion ride the next
            // tick; state is already consistent here.
        }
    }
}
