//! Scopinator CLI
//!
//! Control and monitor a networked telescope from the command line.
//!
//! ## Usage
//!
//! ```bash
//! # Check a device answers on its control port
//! scopinator connect 192.168.42.41
//!
//! # One-shot status report
//! scopinator status 192.168.42.41
//!
//! # Follow events until interrupted
//! scopinator monitor 192.168.42.41
//!
//! # Find devices on the LAN
//! scopinator discover
//!
//! # Slew to coordinates
//! scopinator goto 192.168.42.41 10.68 41.27 --name M31
//!
//! # Stow the mount
//! scopinator park 192.168.42.41
//!
//! # Stream stacked frames for 30 seconds
//! scopinator stream 192.168.42.41 --duration 30
//!
//! # With verbose logging
//! RUST_LOG=scopinator=debug scopinator monitor 192.168.42.41
//! ```
//!
//! Timeouts and queue sizes come from `SCOPINATOR_*` environment
//! variables; see `config_from_env`.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use scopinator::{
    kind, ClientConfig, ControlClient, Endpoint, Error, ImagingClient, ReconnectConfig, StreamMode,
};

/// UDP port the device answers discovery probes on
const DISCOVERY_PORT: u16 = 4720;

const EXIT_OK: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_CONNECT_FAILED: u8 = 2;
const EXIT_COMMAND_REJECTED: u8 = 3;
const EXIT_INTERRUPTED: u8 = 130;

fn usage() -> ! {
    eprintln!(
        "usage: scopinator <command> [args]\n\
         \n\
         commands:\n\
         \x20 connect  <host>                 check the device answers\n\
         \x20 status   <host>                 one-shot status report\n\
         \x20 monitor  <host>                 follow events until ctrl-c\n\
         \x20 discover [--timeout SECS]       find devices on the LAN\n\
         \x20 goto     <host> <ra> <dec> [--name NAME]\n\
         \x20 park     <host>\n\
         \x20 stream   <host> [--duration SECS]"
    );
    std::process::exit(EXIT_FAILURE as i32);
}

/// Build the library config from SCOPINATOR_* environment variables.
fn config_from_env() -> ClientConfig {
    fn env_ms(name: &str) -> Option<Duration> {
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
    }
    fn env_secs(name: &str) -> Option<Duration> {
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    }
    fn env_usize(name: &str) -> Option<usize> {
        std::env::var(name).ok().and_then(|v| v.parse().ok())
    }

    let defaults = ClientConfig::default();
    let reconnect_defaults = ReconnectConfig::default();
    ClientConfig {
        connect_timeout: env_secs("SCOPINATOR_CONNECT_TIMEOUT")
            .unwrap_or(defaults.connect_timeout),
        read_idle_timeout: env_secs("SCOPINATOR_READ_IDLE_TIMEOUT")
            .unwrap_or(defaults.read_idle_timeout),
        command_timeout: env_secs("SCOPINATOR_COMMAND_TIMEOUT")
            .unwrap_or(defaults.command_timeout),
        reconnect: ReconnectConfig {
            base: env_ms("SCOPINATOR_RECONNECT_BASE_MS").unwrap_or(reconnect_defaults.base),
            cap: env_ms("SCOPINATOR_RECONNECT_CAP_MS").unwrap_or(reconnect_defaults.cap),
            max_attempts: std::env::var("SCOPINATOR_RECONNECT_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok()),
        },
        write_queue_size: env_usize("SCOPINATOR_WRITE_QUEUE_SIZE")
            .unwrap_or(defaults.write_queue_size),
        subscriber_queue_size: env_usize("SCOPINATOR_SUBSCRIBER_QUEUE_SIZE")
            .unwrap_or(defaults.subscriber_queue_size),
        ..defaults
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scopinator=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else { usage() };

    let run = run_command(command, &args[1..]);
    let outcome = tokio::select! {
        outcome = run => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            return ExitCode::from(EXIT_INTERRUPTED);
        }
    };

    match outcome {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// Map library errors onto the documented exit codes.
fn exit_code_for(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<Error>() {
        Some(Error::ConnectFailed(_)) => EXIT_CONNECT_FAILED,
        Some(Error::CommandRejected { .. }) => EXIT_COMMAND_REJECTED,
        _ => EXIT_FAILURE,
    }
}

async fn run_command(command: &str, args: &[String]) -> Result<()> {
    match command {
        "connect" => cmd_connect(args).await,
        "status" => cmd_status(args).await,
        "monitor" => cmd_monitor(args).await,
        "discover" => cmd_discover(args).await,
        "goto" => cmd_goto(args).await,
        "park" => cmd_park(args).await,
        "stream" => cmd_stream(args).await,
        _ => usage(),
    }
}

fn host_arg(args: &[String]) -> Result<Endpoint> {
    let host = args.first().context("missing <host> argument")?;
    Ok(Endpoint::new(host.clone()))
}

async fn cmd_connect(args: &[String]) -> Result<()> {
    let endpoint = host_arg(args)?;
    let client = ControlClient::connect(endpoint.clone(), config_from_env()).await?;
    println!("connected to {}", endpoint.control_addr());

    let time = client.get_time().await?;
    println!("device time: {}", time.time);

    client.disconnect().await;
    Ok(())
}

async fn cmd_status(args: &[String]) -> Result<()> {
    let endpoint = host_arg(args)?;
    let client = ControlClient::connect(endpoint.clone(), config_from_env()).await?;

    let status = client.status().await;
    println!("device: {}", endpoint.control_addr());
    if let (Some(ra), Some(dec)) = (status.pointing.ra, status.pointing.dec) {
        println!("pointing: ra={ra:.4} dec={dec:.4}");
    }
    if let Some(position) = status.focus.position {
        println!("focuser: {position}");
    }
    if let Some(battery) = status.pi.battery_capacity {
        println!("battery: {battery}%");
    }
    if let Some(temp) = status.pi.temp {
        println!("temperature: {temp:.1} C");
    }
    if let Some(stage) = &status.view.stage {
        let target = status.view.target_name.as_deref().unwrap_or("");
        println!("view: {stage} {target}");
    }
    println!(
        "stack: {} stacked, {} dropped, {} skipped",
        status.stack.stacked, status.stack.dropped, status.stack.skipped
    );

    client.disconnect().await;
    Ok(())
}

async fn cmd_monitor(args: &[String]) -> Result<()> {
    let endpoint = host_arg(args)?;
    let client = ControlClient::connect(endpoint.clone(), config_from_env()).await?;
    info!(host = %endpoint.host, "monitoring; ctrl-c to stop");

    let mut events = client.subscribe(None);
    while let Some(event) = events.recv().await {
        match event.kind.as_str() {
            kind::INTERNAL_DISCONNECTED => warn!("link lost, reconnecting"),
            kind::INTERNAL_RECONNECTED => info!("link restored"),
            _ => println!("{} {}", event.kind, event.payload),
        }
    }
    client.disconnect().await;
    Ok(())
}

async fn cmd_discover(args: &[String]) -> Result<()> {
    let wait: u64 = flag_value(args, "--timeout")
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    let probe = serde_json::json!({"id": 1, "method": "scan_iscope", "params": {}}).to_string();
    socket
        .send_to(probe.as_bytes(), ("255.255.255.255", DISCOVERY_PORT))
        .await
        .context("broadcast failed")?;
    println!("searching for {wait}s...");

    let mut found = Vec::new();
    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Ok(received) = timeout(remaining, socket.recv_from(&mut buf)).await else {
            break;
        };
        let Ok((len, peer)) = received else { break };
        match serde_json::from_slice::<serde_json::Value>(&buf[..len]) {
            Ok(reply) => {
                let name = reply["name"].as_str().unwrap_or("telescope").to_string();
                let ip = reply["ip"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| peer.ip().to_string());
                let port = reply["port"].as_u64().unwrap_or(4700);
                if !found.contains(&(ip.clone(), port)) {
                    println!("  {name} at {ip}:{port}");
                    found.push((ip, port));
                }
            }
            Err(e) => debug!(peer = %peer, error = %e, "undecodable discovery reply"),
        }
    }

    if found.is_empty() {
        println!("no devices found");
    } else {
        println!("{} device(s) found", found.len());
    }
    Ok(())
}

async fn cmd_goto(args: &[String]) -> Result<()> {
    let endpoint = host_arg(args)?;
    let ra: f64 = args
        .get(1)
        .context("missing <ra>")?
        .parse()
        .context("ra must be a number")?;
    let dec: f64 = args
        .get(2)
        .context("missing <dec>")?
        .parse()
        .context("dec must be a number")?;
    let name = flag_value(args, "--name");

    let client = ControlClient::connect(endpoint, config_from_env()).await?;
    let label = name.clone().unwrap_or_else(|| format!("ra={ra:.2} dec={dec:.2}"));
    println!("slewing to {label}...");

    client.goto_target(name, ra, dec).await?;
    client
        .wait_for_event_completion(kind::AUTO_GOTO, Duration::from_secs(120))
        .await?;

    let coord = client.get_equ_coord().await?;
    println!("arrived: ra={:.4} dec={:.4}", coord.ra, coord.dec);

    client.disconnect().await;
    Ok(())
}

async fn cmd_park(args: &[String]) -> Result<()> {
    let endpoint = host_arg(args)?;
    let client = ControlClient::connect(endpoint, config_from_env()).await?;
    println!("parking...");
    client.park().await?;
    println!("parked");
    client.disconnect().await;
    Ok(())
}

async fn cmd_stream(args: &[String]) -> Result<()> {
    let endpoint = host_arg(args)?;
    let duration: u64 = flag_value(args, "--duration")
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);
    let config = config_from_env();

    let control = ControlClient::connect(endpoint.clone(), config.clone()).await?;
    let imaging = ImagingClient::connect(
        endpoint,
        config,
        control.bus().clone(),
        control.status_store(),
    )
    .await?;

    imaging.start_streaming(StreamMode::Stack).await?;
    println!("streaming for {duration}s...");

    let mut report = tokio::time::interval(Duration::from_secs(1));
    report.tick().await;
    let stop_at = tokio::time::Instant::now() + Duration::from_secs(duration);
    while tokio::time::Instant::now() < stop_at {
        report.tick().await;
        let status = imaging.status().await;
        println!(
            "frames: {} stacked, {} dropped, {} skipped",
            status.stacked, status.dropped, status.skipped
        );
    }

    imaging.stop_streaming().await?;
    imaging.disconnect().await;
    control.disconnect().await;
    println!("streaming stopped");
    Ok(())
}
