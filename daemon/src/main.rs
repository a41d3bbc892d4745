//! # FrameLock Daemon
//!
//! Runs one FrameLock node on the LAN: discovery, election, time sync and
//! frame lockstep, with a status line once a second. Rendering hosts embed
//! `flk_net::SyncService` directly; this binary is the same engine driven
//! by a plain timer loop, useful for bring-up and soak testing.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use flk_net::{MeasurementConfig, ServiceConfig, SyncService};
use flk_protocol::GlobalSettings;

#[derive(Parser, Debug)]
#[command(name = "flk-daemon", about = "FrameLock sync node", version)]
struct Args {
    /// Node identity; defaults to the hostname.
    #[arg(long)]
    identity: Option<String>,

    /// Unicast port.
    #[arg(long, default_value_t = flk_net::DEFAULT_PORT)]
    port: u16,

    /// Broadcast port; all peers must agree.
    #[arg(long, default_value_t = flk_net::BROADCAST_PORT)]
    broadcast_port: u16,

    /// Project id shared by all nodes of this rig (UUID). Nodes from other
    /// projects on the same LAN are ignored.
    #[arg(long)]
    project_id: Option<Uuid>,

    /// Master election priority in [0, 1].
    #[arg(long, default_value_t = 0.5)]
    priority: f32,

    /// Claim the master role immediately instead of electing.
    #[arg(long)]
    force_master: bool,

    /// Target frame rate driven by the internal frame loop.
    #[arg(long, default_value_t = 60.0)]
    fps: f32,

    /// Settings file (binary), loaded at startup and kept current.
    #[arg(long)]
    settings_file: Option<PathBuf>,

    /// Measure RTT against this endpoint (repeatable).
    #[arg(long = "ping")]
    ping: Vec<SocketAddr>,

    /// Use adaptive ping cadence.
    #[arg(long)]
    dynamic_ping: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut settings = GlobalSettings::default();
    settings.master_priority = args.priority.clamp(0.0, 1.0);
    settings.force_master = args.force_master;
    settings.target_frame_rate = args.fps;
    settings.sync_port = args.port.max(1024);
    if let Some(project_id) = args.project_id {
        settings.project_id = project_id;
    }

    let config = ServiceConfig {
        identity: args.identity,
        project_id: settings.project_id,
        project_version: settings.project_version.clone(),
        unicast_port: args.port,
        broadcast_port: args.broadcast_port,
        settings_path: args.settings_file,
        initial_settings: settings,
    };

    let mut service = SyncService::new(config);
    service
        .initialize()
        .context("failed to start the sync service")?;

    info!(
        identity = service.identity(),
        genlock = service.genlock_present(),
        "node up"
    );

    for endpoint in &args.ping {
        service.start_latency_measurement(
            *endpoint,
            MeasurementConfig {
                dynamic_sampling: args.dynamic_ping,
                ..MeasurementConfig::default()
            },
        );
    }

    service.on_role_changed(|is_master, term| {
        info!(is_master, term, "role changed");
    });
    service.on_network_state_changed(|event| {
        info!(
            peer = %event.endpoint,
            score = event.assessment.score,
            previous = event.previous_score,
            "network state changed: {}",
            event.assessment.description
        );
    });

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })
        .context("failed to install the ctrl-c handler")?;
    }

    run_frame_loop(&service, args.fps, &running);

    service.shutdown();
    Ok(())
}

/// Drive the frame tick at the target rate, honoring the controller's
/// timing adjustment, and print a status line once a second.
fn run_frame_loop(service: &SyncService, fps: f32, running: &AtomicBool) {
    let frame_interval = Duration::from_secs_f32(1.0 / fps.max(1.0));
    let mut last_status = Instant::now();

    while running.load(Ordering::SeqCst) {
        let frame_start = Instant::now();
        service.tick(frame_interval.as_secs_f32());

        if let Some(hold) = service.recommended_sleep() {
            std::thread::sleep(hold);
        }

        if last_status.elapsed() >= Duration::from_secs(1) {
            last_status = Instant::now();
            print_status(service);
        }

        let elapsed = frame_start.elapsed();
        if elapsed < frame_interval {
            std::thread::sleep(frame_interval - elapsed);
        }
    }
}

fn print_status(service: &SyncService) {
    let role = if service.is_master() { "master" } else { "follower" };
    info!(
        role,
        term = service.current_term(),
        frame = service.get_synced_frame_number(),
        synced = service.is_synchronized(),
        error_us = service.get_estimated_error_us(),
        adjustment_ms = service.frame_adjustment_ms(),
        peers = service.get_discovered_servers().len(),
        "status"
    );

    for endpoint in service.peer_endpoints() {
        if let Some(stats) = service.get_latency_stats(endpoint) {
            if stats.sample_count > 0 {
                info!(
                    peer = %endpoint,
                    avg_ms = format!("{:.2}", stats.avg_rtt_ms),
                    jitter_ms = format!("{:.2}", stats.jitter_ms),
                    loss = format!("{:.1}%", stats.loss_rate() * 100.0),
                    "latency"
                );
            }
        }
    }
}
