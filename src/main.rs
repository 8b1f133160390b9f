mod clock;
mod config;
mod engine;
mod gps_reader;
mod interfaces;
mod nmea;
mod packet;
mod security;
mod sntp;
mod telemetry;
mod timeval;
mod web_server;

use anyhow::{Context, Result};
use config::Config;
use engine::Engine;
use gps_reader::{GpsReader, GpsReaderConfig};
use interfaces::InterfaceRegistry;
use nmea::NmeaConfig;
use security::{IpFilter, RateLimiter};
use sntp::{SntpConfig, SntpEngine};
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use telemetry::TelemetryExporter;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use web_server::WebServer;

fn main() -> Result<()> {
    init_logging()?;
    info!("pendulum {} starting", env!("CARGO_PKG_VERSION"));

    let config_path = get_config_path();
    let config = load_or_create_config(&config_path)?;

    info!(bind = %config.server.bind_address, gps_enabled = config.gps.enabled, "configuration loaded");

    let (gps_tx, gps_rx) = mpsc::channel();
    let gps_snapshot;
    let mut gps_thread = None;

    if config.gps.enabled {
        let reader = GpsReader::new(
            GpsReaderConfig {
                serial_port: config.gps.serial_port.clone(),
                baud_rate: config.gps.baud_rate,
                decoder: NmeaConfig {
                    latency_ms: config.gps.latency_ms,
                    burst_mode: config.gps.burst_mode,
                    privacy: config.gps.privacy,
                    min_satellites: config.gps.min_satellites,
                },
            },
            gps_tx,
        );
        gps_snapshot = reader.snapshot_arc();
        gps_thread = Some(reader.start());
    } else {
        warn!("GPS disabled in configuration, serving from the upstream pool only");
        gps_snapshot = Arc::new(std::sync::RwLock::new(gps_reader::GpsSnapshot::default()));
    }

    let socket = UdpSocket::bind(&config.server.bind_address)
        .with_context(|| format!("failed to bind SNTP socket on {}", config.server.bind_address))?;

    // server.precision_ms drives the disciplinarian's hysteresis thresholds;
    // it is independent of server.precision, the wire reply's log2-seconds
    // precision byte.
    let clock_disciplinarian = clock::ClockDisciplinarian::new(config.server.precision_ms);

    let sntp_engine = SntpEngine::new(SntpConfig {
        port: socket.local_addr().map(|a| a.port()).unwrap_or(123),
        broadcast_period_secs: config.ntp.broadcast_period_secs,
        broadcast_without_gps: config.ntp.broadcast_without_gps,
        precision: config.server.precision,
    });

    let rate_limiter = if config.security.enable_rate_limiting {
        Some(RateLimiter::new(config.security.max_requests_per_second))
    } else {
        None
    };
    let ip_filter = IpFilter::new(config.security.ip_whitelist.clone(), config.security.ip_blacklist.clone());

    let telemetry = TelemetryExporter::new();

    let mut engine = Engine::new(
        socket,
        clock_disciplinarian,
        sntp_engine,
        InterfaceRegistry::new(),
        telemetry,
        rate_limiter,
        ip_filter,
        gps_rx,
        gps_snapshot,
    )?;

    let web_bind = format!("{}:{}", config.webserver.bind_address, config.webserver.port);
    info!(bind = %web_bind, "starting web console");
    let web_server = WebServer::new(web_bind, engine.telemetry_arc());
    let _web_thread = web_server.start();

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let ctrl_c_count = Arc::new(AtomicU8::new(0));
    install_ctrlc_handler(Arc::clone(&shutdown_requested), Arc::clone(&ctrl_c_count))?;

    info!("serving SNTP, press Ctrl+C twice (within 5 seconds) to stop");
    engine.run(&shutdown_requested);

    if let Some(handle) = gps_thread.take() {
        let _ = handle.join();
    }
    Ok(())
}

fn install_ctrlc_handler(shutdown: Arc<AtomicBool>, count: Arc<AtomicU8>) -> Result<()> {
    ctrlc::set_handler(move || {
        let current = count.fetch_add(1, Ordering::SeqCst);
        if current == 0 {
            warn!("Ctrl+C received, press again within 5 seconds to confirm shutdown");
            let disarm_count = Arc::clone(&count);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_secs(5));
                if disarm_count.load(Ordering::SeqCst) == 1 {
                    disarm_count.store(0, Ordering::SeqCst);
                    info!("shutdown request timed out, continuing to serve");
                }
            });
        } else {
            warn!("shutdown confirmed, stopping");
            shutdown.store(true, Ordering::SeqCst);
            std::thread::spawn(|| {
                std::thread::sleep(std::time::Duration::from_secs(2));
                error!("forced exit after shutdown timeout");
                std::process::exit(0);
            });
        }
    })
    .context("failed to install Ctrl+C handler")
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to build log filter")?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(filter)
        .init();
    Ok(())
}

fn get_config_path() -> PathBuf {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        return PathBuf::from(&args[1]);
    }
    #[cfg(target_os = "linux")]
    return PathBuf::from("/etc/pendulum/config.toml");
    #[cfg(not(target_os = "linux"))]
    return PathBuf::from("config.toml");
}

fn load_or_create_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        info!(path = %path.display(), "loading configuration");
        Config::from_file(path)
    } else {
        warn!(path = %path.display(), "configuration not found, writing an example");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("failed to create config directory")?;
            }
        }
        Config::create_example_config(path).context("failed to create example config")?;
        info!("edit the generated configuration and restart");
        Config::from_file(path)
    }
}
