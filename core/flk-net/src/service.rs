//! The FrameLock facade.
//!
//! `SyncService` owns the transport, the protocol thread and the shared
//! snapshots. Embedders create one, call `initialize()`, drive `tick()`
//! from their frame loop and read synchronized time / frame numbers from
//! any thread; every mutable piece of protocol state stays on the protocol
//! thread and is reached only through the command channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use flk_protocol::{GlobalSettings, Message};
use flk_sync::{LatencyStats, QualityAssessment};

use crate::engine::{Clock, Engine, EngineConfig, EngineEvent, Outbound};
use crate::env::EnvironmentProbe;
use crate::error::{NetError, Result};
use crate::telemetry::{MeasurementConfig, NetworkEvent};
use crate::transport::{receive_queue, Transport};
use crate::{BROADCAST_PORT, DEFAULT_PORT};

/// Protocol tick cadence (50 Hz).
const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Facade configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Stable node identity; defaults to the hostname.
    pub identity: Option<String>,
    pub project_id: Uuid,
    pub project_version: String,
    pub unicast_port: u16,
    pub broadcast_port: u16,
    pub settings_path: Option<PathBuf>,
    pub initial_settings: GlobalSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let initial_settings = GlobalSettings::default();
        Self {
            identity: None,
            project_id: initial_settings.project_id,
            project_version: initial_settings.project_version.clone(),
            unicast_port: DEFAULT_PORT,
            broadcast_port: BROADCAST_PORT,
            settings_path: None,
            initial_settings,
        }
    }
}

type SettingsListener = Box<dyn Fn(&GlobalSettings) + Send + Sync>;
type RoleListener = Box<dyn Fn(bool, i32) + Send + Sync>;
type NetworkListener = Box<dyn Fn(&NetworkEvent) + Send + Sync>;

/// Snapshots readable from any thread.
struct Shared {
    is_master: AtomicBool,
    term: AtomicI32,
    phase_adjustment_us: AtomicI64,
    estimated_error_us: AtomicI64,
    time_synchronized: AtomicBool,
    frame_synchronized: AtomicBool,
    frame_number: AtomicI64,
    frame_adjustment_bits: AtomicU32, // f32 bits
    pll_locked: AtomicBool,
    dropped_datagrams: AtomicU64,

    peers: RwLock<Vec<String>>,
    peer_endpoints: RwLock<Vec<SocketAddr>>,
    settings: RwLock<GlobalSettings>,
    latency: RwLock<HashMap<SocketAddr, LatencyStats>>,
    quality: RwLock<HashMap<SocketAddr, QualityAssessment>>,

    settings_listeners: RwLock<Vec<SettingsListener>>,
    role_listeners: RwLock<Vec<RoleListener>>,
    network_listeners: RwLock<Vec<NetworkListener>>,
}

impl Shared {
    fn new(settings: GlobalSettings) -> Self {
        Self {
            is_master: AtomicBool::new(false),
            term: AtomicI32::new(0),
            phase_adjustment_us: AtomicI64::new(0),
            estimated_error_us: AtomicI64::new(1_000_000),
            time_synchronized: AtomicBool::new(false),
            frame_synchronized: AtomicBool::new(false),
            frame_number: AtomicI64::new(0),
            frame_adjustment_bits: AtomicU32::new(0f32.to_bits()),
            pll_locked: AtomicBool::new(false),
            dropped_datagrams: AtomicU64::new(0),
            peers: RwLock::new(Vec::new()),
            peer_endpoints: RwLock::new(Vec::new()),
            settings: RwLock::new(settings),
            latency: RwLock::new(HashMap::new()),
            quality: RwLock::new(HashMap::new()),
            settings_listeners: RwLock::new(Vec::new()),
            role_listeners: RwLock::new(Vec::new()),
            network_listeners: RwLock::new(Vec::new()),
        }
    }
}

enum Command {
    SetMasterMode(bool),
    Discover,
    UpdateSettings(GlobalSettings, Sender<Result<()>>),
    SetTargetFps(f32),
    FrameTick,
    StartLatency(SocketAddr, MeasurementConfig),
    StopLatency(SocketAddr),
    SetOutlierFiltering(SocketAddr, bool),
    Shutdown,
}

/// The FrameLock node facade.
pub struct SyncService {
    config: ServiceConfig,
    identity: String,
    environment: EnvironmentProbe,
    shared: Arc<Shared>,
    command_tx: Option<Sender<Command>>,
    protocol_thread: Option<JoinHandle<()>>,
    initialized: bool,
}

impl SyncService {
    pub fn new(config: ServiceConfig) -> Self {
        let identity = config
            .identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| format!("node-{}", std::process::id()));

        let shared = Arc::new(Shared::new(config.initial_settings.clone()));

        Self {
            config,
            identity,
            environment: EnvironmentProbe::detect(),
            shared,
            command_tx: None,
            protocol_thread: None,
            initialized: false,
        }
    }

    /// Bind sockets, start the receiver and protocol threads and send the
    /// initial discovery. Safe to call twice.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        info!(identity = %self.identity, "initializing sync service");

        let mut transport = Transport::bind(self.config.unicast_port, self.config.broadcast_port)?;
        let (net_tx, net_rx) = receive_queue();
        transport.start_receiver(net_tx)?;

        let engine = Engine::new(
            EngineConfig {
                identity: self.identity.clone(),
                project_id: self.config.project_id,
                project_version: self.config.project_version.clone(),
                unicast_port: transport.local_unicast().port(),
                settings_path: self.config.settings_path.clone(),
                initial_settings: self.config.initial_settings.clone(),
            },
            Clock::read(),
        );

        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let shared = Arc::clone(&self.shared);

        let handle = std::thread::Builder::new()
            .name("flk-protocol".to_string())
            .spawn(move || protocol_loop(engine, transport, net_rx, command_rx, shared))
            .map_err(|e| NetError::BindFailed(e.to_string()))?;

        self.command_tx = Some(command_tx);
        self.protocol_thread = Some(handle);
        self.initialized = true;

        // Kick off discovery right away.
        self.send_command(Command::Discover);
        Ok(())
    }

    /// Stop both threads and flush persistent state. Safe to call without
    /// `initialize()` and safe to call twice.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        info!("shutting down sync service");

        self.send_command(Command::Shutdown);
        self.command_tx = None;
        if let Some(handle) = self.protocol_thread.take() {
            let _ = handle.join();
        }
        self.initialized = false;
    }

    fn send_command(&self, command: Command) {
        if let Some(tx) = &self.command_tx {
            if tx.send(command).is_err() {
                warn!("protocol thread is gone, command dropped");
            }
        }
    }

    // ------------------------------------------------------------------
    // Frame tick
    // ------------------------------------------------------------------

    /// Per-frame tick from the render loop. On the master this advances and
    /// broadcasts the shared frame counter; on followers it refreshes the
    /// timing adjustment.
    pub fn tick(&self, _dt_secs: f32) {
        self.send_command(Command::FrameTick);
    }

    /// How long the caller should hold the next frame, if at all.
    pub fn recommended_sleep(&self) -> Option<Duration> {
        let adjustment = self.frame_adjustment_ms();
        if !self.is_master() && adjustment > 0.1 {
            Some(Duration::from_micros((adjustment.min(5.0) * 1000.0) as u64))
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // Role and discovery
    // ------------------------------------------------------------------

    pub fn set_master_mode(&self, master: bool) {
        self.send_command(Command::SetMasterMode(master));
    }

    pub fn is_master(&self) -> bool {
        self.shared.is_master.load(Ordering::Acquire)
    }

    pub fn current_term(&self) -> i32 {
        self.shared.term.load(Ordering::Acquire)
    }

    /// Broadcast a Discovery immediately.
    pub fn discover_servers(&self) {
        self.send_command(Command::Discover);
    }

    pub fn get_discovered_servers(&self) -> Vec<String> {
        self.shared.peers.read().clone()
    }

    pub fn peer_endpoints(&self) -> Vec<SocketAddr> {
        self.shared.peer_endpoints.read().clone()
    }

    // ------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------

    /// Synchronized wall time in microseconds: the local clock on the
    /// master, the PLL-adjusted clock on followers.
    pub fn get_synced_time_us(&self) -> i64 {
        let now = flk_sync::now_us();
        if self.is_master() {
            now
        } else {
            now + self.shared.phase_adjustment_us.load(Ordering::Acquire)
        }
    }

    pub fn get_estimated_error_us(&self) -> i64 {
        if self.is_master() {
            0
        } else {
            self.shared.estimated_error_us.load(Ordering::Acquire)
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.is_master() || self.shared.time_synchronized.load(Ordering::Acquire)
    }

    pub fn is_pll_locked(&self) -> bool {
        self.shared.pll_locked.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    pub fn get_synced_frame_number(&self) -> i64 {
        self.shared.frame_number.load(Ordering::Acquire)
    }

    pub fn is_frame_synchronized(&self) -> bool {
        self.is_master() || self.shared.frame_synchronized.load(Ordering::Acquire)
    }

    pub fn frame_adjustment_ms(&self) -> f32 {
        f32::from_bits(self.shared.frame_adjustment_bits.load(Ordering::Acquire))
    }

    pub fn set_target_fps(&self, fps: f32) {
        self.send_command(Command::SetTargetFps(fps));
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn get_settings(&self) -> GlobalSettings {
        self.shared.settings.read().clone()
    }

    /// Validate and adopt new settings. Blocks until the protocol thread
    /// has applied or rejected them.
    pub fn update_settings(&self, settings: GlobalSettings) -> Result<()> {
        let Some(tx) = &self.command_tx else {
            return Err(NetError::NotInitialized);
        };
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        tx.send(Command::UpdateSettings(settings, reply_tx))
            .map_err(|_| NetError::NotInitialized)?;
        reply_rx
            .recv_timeout(Duration::from_secs(2))
            .map_err(|_| NetError::NotInitialized)?
    }

    pub fn on_settings_changed(&self, listener: impl Fn(&GlobalSettings) + Send + Sync + 'static) {
        self.shared.settings_listeners.write().push(Box::new(listener));
    }

    pub fn on_role_changed(&self, listener: impl Fn(bool, i32) + Send + Sync + 'static) {
        self.shared.role_listeners.write().push(Box::new(listener));
    }

    pub fn on_network_state_changed(&self, listener: impl Fn(&NetworkEvent) + Send + Sync + 'static) {
        self.shared.network_listeners.write().push(Box::new(listener));
    }

    // ------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------

    pub fn start_latency_measurement(&self, endpoint: SocketAddr, config: MeasurementConfig) {
        self.send_command(Command::StartLatency(endpoint, config));
    }

    pub fn stop_latency_measurement(&self, endpoint: SocketAddr) {
        self.send_command(Command::StopLatency(endpoint));
    }

    pub fn set_outlier_filtering(&self, endpoint: SocketAddr, enabled: bool) {
        self.send_command(Command::SetOutlierFiltering(endpoint, enabled));
    }

    pub fn get_latency_stats(&self, endpoint: SocketAddr) -> Option<LatencyStats> {
        self.shared.latency.read().get(&endpoint).cloned()
    }

    pub fn evaluate_network_quality(&self, endpoint: SocketAddr) -> Option<QualityAssessment> {
        self.shared.quality.read().get(&endpoint).cloned()
    }

    // ------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------

    pub fn genlock_present(&self) -> bool {
        self.environment.genlock_present()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Datagrams dropped by the protocol layer (malformed or foreign).
    pub fn dropped_datagrams(&self) -> u64 {
        self.shared.dropped_datagrams.load(Ordering::Relaxed)
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----------------------------------------------------------------------
// Protocol thread
// ----------------------------------------------------------------------

fn protocol_loop(
    mut engine: Engine,
    mut transport: Transport,
    net_rx: Receiver<(Message, SocketAddr)>,
    command_rx: Receiver<Command>,
    shared: Arc<Shared>,
) {
    info!("protocol thread started");
    let mut last_tick = std::time::Instant::now() - TICK_INTERVAL;
    let mut running = true;

    // The initial discovery rides the first tick.
    while running {
        select! {
            recv(net_rx) -> item => {
                match item {
                    Ok((msg, sender)) => {
                        let out = engine.handle_message(&msg, sender, Clock::read());
                        send_all(&mut transport, out);
                        // Drain whatever else queued up behind it.
                        while let Ok((msg, sender)) = net_rx.try_recv() {
                            let out = engine.handle_message(&msg, sender, Clock::read());
                            send_all(&mut transport, out);
                        }
                    }
                    // The receiver thread is gone; nothing more will arrive.
                    Err(_) => running = false,
                }
            }
            recv(command_rx) -> command => {
                match command {
                    Ok(command) => {
                        running = handle_command(command, &mut engine, &mut transport);
                    }
                    Err(_) => running = false,
                }
            }
            default(TICK_INTERVAL) => {}
        }

        if last_tick.elapsed() >= TICK_INTERVAL {
            last_tick = std::time::Instant::now();
            let out = engine.tick(Clock::read());
            send_all(&mut transport, out);
        }

        publish(&mut engine, &shared);
    }

    engine.shutdown();
    transport.stop();
    info!("protocol thread stopped");
}

fn handle_command(command: Command, engine: &mut Engine, transport: &mut Transport) -> bool {
    match command {
        Command::SetMasterMode(master) => {
            let out = engine.set_master_mode(master, Clock::read());
            send_all(transport, out);
        }
        Command::Discover => {
            let out = engine.discover_now(Clock::read());
            send_all(transport, out);
        }
        Command::UpdateSettings(settings, reply) => {
            let result = engine
                .update_settings(settings, Clock::read())
                .map(|out| send_all(transport, out));
            let _ = reply.send(result);
        }
        Command::SetTargetFps(fps) => engine.set_target_fps(fps),
        Command::FrameTick => {
            let out = engine.frame_tick(Clock::read());
            send_all(transport, out);
        }
        Command::StartLatency(endpoint, config) => {
            engine.start_latency_measurement(endpoint, config, Clock::read());
        }
        Command::StopLatency(endpoint) => engine.stop_latency_measurement(endpoint),
        Command::SetOutlierFiltering(endpoint, enabled) => {
            engine.telemetry_mut().set_outlier_filtering(endpoint, enabled);
        }
        Command::Shutdown => return false,
    }
    true
}

fn send_all(transport: &mut Transport, outbound: Vec<Outbound>) {
    for item in &outbound {
        transport.send(item);
    }
}

/// Mirror engine state into the shared snapshots and fire listeners.
fn publish(engine: &mut Engine, shared: &Shared) {
    shared
        .is_master
        .store(engine.is_master(), Ordering::Release);
    shared.term.store(engine.current_term(), Ordering::Release);
    shared
        .phase_adjustment_us
        .store(engine.phase_adjustment_us(), Ordering::Release);
    shared
        .estimated_error_us
        .store(engine.estimated_error_us(), Ordering::Release);
    shared
        .time_synchronized
        .store(engine.is_time_synchronized(), Ordering::Release);
    shared
        .frame_synchronized
        .store(engine.is_frame_synchronized(), Ordering::Release);
    shared
        .frame_number
        .store(engine.synced_frame_number(), Ordering::Release);
    shared.frame_adjustment_bits.store(
        engine.frame_adjustment_ms().to_bits(),
        Ordering::Release,
    );
    shared
        .pll_locked
        .store(engine.pll_locked(), Ordering::Release);
    let (wire, foreign) = engine.drop_counters();
    shared
        .dropped_datagrams
        .store(wire + foreign, Ordering::Relaxed);

    *shared.peers.write() = engine.discovered_servers();
    let endpoints = engine.peer_endpoints();
    {
        let mut latency = shared.latency.write();
        let mut quality = shared.quality.write();
        latency.clear();
        quality.clear();
        for endpoint in &endpoints {
            if let Some(stats) = engine.latency_stats(*endpoint) {
                latency.insert(*endpoint, stats);
            }
            if let Some(assessment) = engine.evaluate_network_quality(*endpoint) {
                quality.insert(*endpoint, assessment);
            }
        }
    }
    *shared.peer_endpoints.write() = endpoints;

    for event in engine.take_events() {
        match event {
            EngineEvent::RoleChanged { is_master, term } => {
                shared.is_master.store(is_master, Ordering::Release);
                for listener in shared.role_listeners.read().iter() {
                    listener(is_master, term);
                }
            }
            EngineEvent::SettingsChanged(settings) => {
                *shared.settings.write() = settings.clone();
                for listener in shared.settings_listeners.read().iter() {
                    listener(&settings);
                }
            }
            EngineEvent::NetworkStateChanged(event) => {
                for listener in shared.network_listeners.read().iter() {
                    listener(&event);
                }
            }
        }
    }

    // Settings can change without an event only at startup; keep the
    // snapshot fresh regardless.
    {
        let mut snapshot = shared.settings.write();
        if &*snapshot != engine.settings() {
            *snapshot = engine.settings().clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_config() -> ServiceConfig {
        ServiceConfig {
            identity: Some("test-node".to_string()),
            // Ephemeral ports so tests never collide with a real node.
            unicast_port: 0,
            broadcast_port: 0,
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn lifecycle_is_idempotent() {
        let mut service = SyncService::new(service_config());

        // Shutdown before initialize is a no-op.
        service.shutdown();

        service.initialize().unwrap();
        service.initialize().unwrap();

        assert_eq!(service.identity(), "test-node");
        assert_eq!(service.get_synced_frame_number(), 0);
        assert!(!service.is_master());

        service.shutdown();
        service.shutdown();
    }

    #[test]
    fn uninitialized_accessors_are_safe() {
        let service = SyncService::new(service_config());
        assert!(!service.is_master());
        assert!(!service.is_synchronized());
        assert!(service.get_discovered_servers().is_empty());
        assert!(service.get_latency_stats("127.0.0.1:9999".parse().unwrap()).is_none());
        assert!(service.update_settings(GlobalSettings::default()).is_err());
        // Synced time falls back to the local clock.
        assert!(service.get_synced_time_us() > 0);
        assert_eq!(service.get_estimated_error_us(), 1_000_000);
    }

    #[test]
    fn settings_update_roundtrip() {
        let mut service = SyncService::new(service_config());
        service.initialize().unwrap();

        let mut new = service.get_settings();
        new.target_frame_rate = 48.0;
        service.update_settings(new).unwrap();

        // The protocol thread applies it and republishes the snapshot.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while service.get_settings().target_frame_rate != 48.0
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(service.get_settings().target_frame_rate, 48.0);
        assert_eq!(service.get_settings().version, 2);

        let mut invalid = service.get_settings();
        invalid.filter_weight = 3.0;
        assert!(service.update_settings(invalid).is_err());

        service.shutdown();
    }

    #[test]
    fn forced_master_mode_promotes() {
        let mut service = SyncService::new(service_config());
        service.initialize().unwrap();

        service.set_master_mode(true);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !service.is_master() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(service.is_master());
        assert!(service.is_synchronized());
        assert_eq!(service.get_estimated_error_us(), 0);

        // Master frame ticks advance the shared counter.
        service.tick(1.0 / 60.0);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while service.get_synced_frame_number() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(service.get_synced_frame_number(), 1);

        service.shutdown();
    }
}
