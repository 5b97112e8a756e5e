//! usbmode - usb_moded 命令行入口

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use usb_mode_proxy::{
    BusType, ModeKind, ModeVocabulary, ProtocolRevision, ProxyEvent, ProxySnapshot, UsbModeClient,
    UsbModeConfig,
};

/// usb_moded CLI
#[derive(Parser, Debug)]
#[command(name = "usbmode")]
#[command(version, about = "Inspect and switch USB modes through usb_moded")]
struct Args {
    /// Bus to connect to (system, session)
    #[arg(short, long)]
    bus: Option<BusType>,

    /// usb_moded service name
    #[arg(long)]
    service: Option<String>,

    /// Protocol revision (legacy, current)
    #[arg(long)]
    revision: Option<ProtocolRevision>,

    /// Seconds to wait for usb_moded
    #[arg(short, long, default_value = "5")]
    timeout: u64,

    /// Print JSON instead of text
    #[arg(long, default_value = "false")]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current mode properties
    Status,
    /// Print property changes until interrupted
    Watch,
    /// Request a new current mode
    SetMode {
        mode: String,
        /// Wait until the daemon reports the resulting mode
        #[arg(short, long, default_value = "false")]
        wait: bool,
    },
    /// Set the default mode used on connect
    SetConfig { mode: String },
    /// Hide a mode from the user
    Hide { mode: String },
    /// Make a hidden mode visible again
    Unhide { mode: String },
    /// Classify mode tokens without contacting the daemon
    Classify { modes: Vec<String> },
}

/// watch 输出的一行
#[derive(Serialize)]
struct WatchLine<'a> {
    timestamp: DateTime<Local>,
    #[serde(flatten)]
    event: &'a ProxyEvent,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // 命令行参数覆盖环境变量
    let mut config = UsbModeConfig::default();
    if let Some(bus) = args.bus {
        config.bus = bus;
    }
    if let Some(service) = args.service.clone() {
        config.service = service;
    }
    if let Some(revision) = args.revision {
        config.revision = revision;
    }

    if let Command::Classify { modes } = &args.command {
        classify(&ModeVocabulary::new(config.revision), modes, args.json)?;
        return Ok(());
    }

    let timeout = Duration::from_secs(args.timeout);
    let client = UsbModeClient::start(config.clone())
        .await
        .with_context(|| format!("failed to connect to {} bus", config.bus.as_str()))?;

    let result = match &args.command {
        Command::Status => {
            let snapshot = wait_available(&client, timeout, &config).await?;
            print_snapshot(&snapshot, args.json)
        }
        Command::Watch => watch(&client, args.json).await,
        Command::SetMode { mode, wait } => set_mode(&client, mode, *wait, timeout, &config).await,
        Command::SetConfig { mode } => {
            wait_available(&client, timeout, &config).await?;
            let mut events = client.subscribe();
            if !client.set_config_mode(mode).await {
                bail!("usb_moded went away before the request was sent");
            }
            match wait_for(&mut events, timeout, |e| {
                matches!(e, ProxyEvent::ConfigModeChanged(m) if m == mode)
            })
            .await
            {
                Some(_) => println!("config mode: {}", mode),
                None => println!("config mode: {}", client.config_mode()),
            }
            Ok(())
        }
        Command::Hide { mode } => change_visibility(&client, mode, true, timeout, &config).await,
        Command::Unhide { mode } => change_visibility(&client, mode, false, timeout, &config).await,
        Command::Classify { .. } => Ok(()),
    };

    client.shutdown();
    result
}

async fn wait_available(
    client: &UsbModeClient,
    timeout: Duration,
    config: &UsbModeConfig,
) -> Result<ProxySnapshot> {
    match tokio::time::timeout(timeout, client.wait_available()).await {
        Ok(snapshot) => Ok(snapshot?),
        Err(_) => bail!(
            "{} did not become available within {}s",
            config.service,
            timeout.as_secs()
        ),
    }
}

/// 等待满足条件的事件，超时返回 None
async fn wait_for<F>(
    events: &mut broadcast::Receiver<ProxyEvent>,
    timeout: Duration,
    mut matches: F,
) -> Option<ProxyEvent>
where
    F: FnMut(&ProxyEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}

async fn set_mode(
    client: &UsbModeClient,
    mode: &str,
    wait: bool,
    timeout: Duration,
    config: &UsbModeConfig,
) -> Result<()> {
    wait_available(client, timeout, config).await?;

    let mut events = client.subscribe();
    if !client.set_current_mode(mode).await {
        bail!("usb_moded went away before the request was sent");
    }
    info!("Requested mode {}", mode);

    if !wait {
        println!("requested: {}", mode);
        return Ok(());
    }

    // daemon 可能落到其他模式，以广播的最终状态为准
    let vocabulary = ModeVocabulary::new(config.revision);
    let reached = wait_for(&mut events, timeout, |e| match e {
        ProxyEvent::CurrentModeChanged(m) => vocabulary.is_final_state(m),
        _ => false,
    })
    .await;

    match reached {
        Some(ProxyEvent::CurrentModeChanged(m)) if m == mode => println!("mode: {}", m),
        Some(ProxyEvent::CurrentModeChanged(m)) => {
            println!("mode: {} (requested {})", m, mode);
        }
        _ => println!("mode: {} (no change reported)", client.current_mode()),
    }
    Ok(())
}

async fn change_visibility(
    client: &UsbModeClient,
    mode: &str,
    hide: bool,
    timeout: Duration,
    config: &UsbModeConfig,
) -> Result<()> {
    wait_available(client, timeout, config).await?;

    let mut events = client.subscribe();
    let sent = if hide {
        client.hide_mode(mode).await
    } else {
        client.unhide_mode(mode).await
    };
    if !sent {
        bail!("usb_moded went away before the request was sent");
    }

    // 成功只会体现在隐藏列表的变化上
    let outcome = wait_for(&mut events, timeout, |e| match e {
        ProxyEvent::HiddenModesChanged(modes) => modes.iter().any(|m| m == mode) == hide,
        ProxyEvent::HideModeFailed { mode: m, .. } | ProxyEvent::UnhideModeFailed { mode: m, .. } => {
            m == mode
        }
        _ => false,
    })
    .await;

    match outcome {
        Some(ProxyEvent::HideModeFailed { error, .. })
        | Some(ProxyEvent::UnhideModeFailed { error, .. }) => {
            bail!("usb_moded refused {}: {}", mode, error)
        }
        Some(_) => {
            println!("hidden modes: {}", client.hidden_modes().join(","));
            Ok(())
        }
        None => {
            debug!("No hidden mode change reported for {}", mode);
            println!("hidden modes: {}", client.hidden_modes().join(","));
            Ok(())
        }
    }
}

async fn watch(client: &UsbModeClient, json: bool) -> Result<()> {
    let mut events = client.subscribe();
    info!("Watching usb_moded, press Ctrl+C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event, json)?,
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }
    Ok(())
}

fn print_event(event: &ProxyEvent, json: bool) -> Result<()> {
    let line = WatchLine {
        timestamp: Local::now(),
        event,
    };
    if json {
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }

    let detail = match event {
        ProxyEvent::AvailableChanged(available) => available.to_string(),
        ProxyEvent::CurrentModeChanged(m)
        | ProxyEvent::TargetModeChanged(m)
        | ProxyEvent::ConfigModeChanged(m)
        | ProxyEvent::UsbEvent(m)
        | ProxyEvent::UsbStateError(m) => m.clone(),
        ProxyEvent::SupportedModesChanged(modes)
        | ProxyEvent::AvailableModesChanged(modes)
        | ProxyEvent::HiddenModesChanged(modes) => modes.join(","),
        ProxyEvent::HideModeFailed { mode, error } | ProxyEvent::UnhideModeFailed { mode, error } => {
            format!("{}: {}", mode, error)
        }
    };
    println!(
        "{} {:<22} {}",
        line.timestamp.format("%H:%M:%S%.3f"),
        event.name(),
        detail
    );
    Ok(())
}

fn print_snapshot(snapshot: &ProxySnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }
    println!("available:       {}", snapshot.available);
    println!("current mode:    {}", snapshot.current_mode);
    println!("target mode:     {}", snapshot.target_mode);
    println!("config mode:     {}", snapshot.config_mode);
    println!("supported modes: {}", snapshot.supported_modes.join(","));
    println!("available modes: {}", snapshot.available_modes.join(","));
    println!("hidden modes:    {}", snapshot.hidden_modes.join(","));
    Ok(())
}

fn classify(vocabulary: &ModeVocabulary, modes: &[String], json: bool) -> Result<()> {
    for mode in modes {
        let kind = match vocabulary.classify(mode) {
            ModeKind::Event => "event",
            ModeKind::WaitingState => "waiting-state",
            ModeKind::FinalState => "final-state",
        };
        let known = vocabulary.is_known(mode);
        if json {
            let value = serde_json::json!({ "mode": mode, "kind": kind, "known": known });
            println!("{}", value);
        } else if known {
            println!("{:<28} {}", mode, kind);
        } else {
            println!("{:<28} {} (unknown)", mode, kind);
        }
    }
    Ok(())
}
