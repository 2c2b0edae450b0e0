//! `barcal` command line.
//!
//! ```bash
//! barcal ports
//! barcal detect config.json
//! barcal calibrate config.json --flash
//! barcal flash config_calibrated.json
//! barcal test config.json --tick-ms 100
//! ```

use anyhow::{bail, Context, Result};
use barcal::config::AppConfig;
use barcal::logging::{self, LogFormat};
use barcal::session::{
    ConnectReport, DeviceSession, OperationKind, SamplingPhase, SessionEvent, TestConfig,
};
use barcal::Parameters;
use barcal_core::parameters::{calibrated_file_name, rewrite_serial_port};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "barcal")]
#[command(about = "Calibrate, flash and test load-cell bars", long_about = None)]
struct Cli {
    /// Settings file (defaults to ./barcal.toml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log level, overrides the settings file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format, overrides the settings file
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List candidate serial ports
    Ports,

    /// Probe ports for the bus described by a descriptor
    Detect {
        /// Device descriptor (config.json)
        config: PathBuf,
    },

    /// Report the firmware version of every bar
    Version {
        /// Device descriptor
        config: PathBuf,
        /// Write a discovered port back into the descriptor
        #[arg(long)]
        persist_port: bool,
    },

    /// Guided calibration run
    Calibrate {
        /// Device descriptor
        config: PathBuf,
        /// Flash the result when done
        #[arg(long)]
        flash: bool,
        /// Calibrated output (defaults to <name>_calibrated.json next to the descriptor)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Write a discovered port back into the descriptor
        #[arg(long)]
        persist_port: bool,
    },

    /// Flash a calibrated descriptor
    Flash {
        /// Calibrated descriptor
        calibrated: PathBuf,
        /// Write a discovered port back into the descriptor
        #[arg(long)]
        persist_port: bool,
    },

    /// Stream live weights until Ctrl-C
    Test {
        /// Device descriptor
        config: PathBuf,
        /// Tick in ms (10..1000)
        #[arg(long)]
        tick_ms: Option<u64>,
        /// Strict ADC read timeout in ms
        #[arg(long)]
        ad_timeout_ms: Option<u64>,
        /// Include debug details in every snapshot
        #[arg(long)]
        debug: bool,
        /// Write a discovered port back into the descriptor
        #[arg(long)]
        persist_port: bool,
    },

    /// Print the factors stored in every bar
    ReadFactors {
        /// Device descriptor
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("failed to load settings")?;
    if let Some(level) = &cli.log_level {
        settings.log.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        settings.log.format = format;
    }
    settings.validate().map_err(anyhow::Error::msg)?;

    let device_debug = descriptor_path(&cli.command)
        .and_then(|p| Parameters::load(p).ok())
        .is_some_and(|p| p.debug);
    let log_config = settings
        .log_config()
        .map_err(anyhow::Error::msg)?
        .with_device_debug(device_debug);
    logging::init(log_config).map_err(anyhow::Error::msg)?;

    let session = DeviceSession::new(settings.session_settings());

    match cli.command {
        Commands::Ports => {
            let ports = barcal::hardware::list_ports();
            if ports.is_empty() {
                println!("no serial ports found");
            }
            for port in ports {
                println!("{}", port);
            }
            Ok(())
        }
        Commands::Detect { config } => detect(&config).await,
        Commands::Version {
            config,
            persist_port,
        } => version(&session, &config, persist_port).await,
        Commands::Calibrate {
            config,
            flash,
            output,
            persist_port,
        } => calibrate(&session, &config, flash, output, persist_port).await,
        Commands::Flash {
            calibrated,
            persist_port,
        } => flash(&session, &calibrated, persist_port).await,
        Commands::Test {
            config,
            tick_ms,
            ad_timeout_ms,
            debug,
            persist_port,
        } => {
            let test_config = TestConfig {
                debug,
                tick_ms: tick_ms.unwrap_or(settings.session.test.tick_ms),
                ad_timeout_ms: ad_timeout_ms.unwrap_or(settings.session.test.ad_timeout_ms),
            };
            test(&session, &config, test_config, persist_port).await
        }
        Commands::ReadFactors { config } => read_factors(&session, &config).await,
    }
}

fn descriptor_path(command: &Commands) -> Option<&Path> {
    match command {
        Commands::Ports => None,
        Commands::Detect { config }
        | Commands::Version { config, .. }
        | Commands::Calibrate { config, .. }
        | Commands::Test { config, .. }
        | Commands::ReadFactors { config } => Some(config),
        Commands::Flash { calibrated, .. } => Some(calibrated),
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Loads the descriptor, connects, and optionally persists a discovered port.
async fn connect(session: &DeviceSession, path: &Path, persist_port: bool) -> Result<ConnectReport> {
    let params = Parameters::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    let report = session
        .connect(params)
        .await
        .context("failed to connect to the bar bus")?;

    println!(
        "connected on {} ({} bars, {} load cells each)",
        report.port, report.bars, report.lcs
    );
    for line in &report.discovery_trace {
        println!("  {}", line);
    }
    if let Some(warning) = &report.warning {
        println!("warning: {}", warning);
    }
    if report.port_updated {
        if persist_port {
            let raw = std::fs::read(path)?;
            let updated = rewrite_serial_port(&raw, &report.port)?;
            std::fs::write(path, updated).with_context(|| format!("failed to update {}", path.display()))?;
            println!("SERIAL.PORT in {} set to {}", path.display(), report.port);
        } else {
            println!("port differs from {} (use --persist-port to save it)", path.display());
        }
    }
    Ok(report)
}

/// Waits for the terminal event of `kind`, printing progress along the way.
async fn follow(rx: &mut broadcast::Receiver<SessionEvent>, kind: OperationKind) -> Result<()> {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
        };
        match event {
            SessionEvent::Sample(s) if s.phase != SamplingPhase::Live => {
                eprint!(
                    "\r  {} {}/{} {}/{}   ",
                    s.phase, s.ignore_done, s.ignore_target, s.avg_done, s.avg_target
                );
            }
            SessionEvent::StepDone {
                label,
                received,
                total,
                ..
            } => eprintln!("\r  {} done ({}/{})", label, received, total),
            SessionEvent::FlashProgress(p) => match p.bar_index {
                Some(bar) => println!("  bar {}: {}", bar, p.message),
                None => println!("  {}", p.message),
            },
            SessionEvent::Done { operation } if operation == kind => return Ok(()),
            SessionEvent::Stopped { operation } if operation == kind => bail!("{} stopped", kind),
            SessionEvent::Error {
                operation,
                message,
                bar_index: None,
            } if operation == kind => bail!("{} failed: {}", kind, message),
            _ => {}
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn detect(path: &Path) -> Result<()> {
    let params = Parameters::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    params.validate()?;
    let outcome = barcal::hardware::auto_detect(&params).await;
    for line in &outcome.trace {
        println!("{}", line);
    }
    match outcome.port {
        Some(port) => {
            println!("found: {}", port);
            Ok(())
        }
        None => bail!("no port responded"),
    }
}

async fn version(session: &DeviceSession, path: &Path, persist_port: bool) -> Result<()> {
    connect(session, path, persist_port).await?;
    for entry in session.check_versions().await? {
        match (&entry.version, &entry.error) {
            (Some(v), _) => {
                let note = if entry.id_mismatch {
                    " (product ID mismatch)"
                } else if entry.revision_mismatch {
                    " (revision differs)"
                } else {
                    ""
                };
                println!("bar {} (id {}): {}{}", entry.bar, entry.id, v, note);
            }
            (None, Some(e)) => println!("bar {} (id {}): {}", entry.bar, entry.id, e),
            (None, None) => println!("bar {} (id {}): no answer", entry.bar, entry.id),
        }
    }
    session.disconnect().await;
    Ok(())
}

async fn calibrate(
    session: &DeviceSession,
    path: &Path,
    flash: bool,
    output: Option<PathBuf>,
    persist_port: bool,
) -> Result<()> {
    connect(session, path, persist_port).await?;
    let plan = session.plan()?;
    let mut events = session.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    for step in &plan.steps {
        println!("{} {}  (Enter to sample)", step.label, step.prompt);
        if stdin.next_line().await?.is_none() {
            bail!("input closed before the run finished");
        }
        session.start_step(step.step_index).await?;
        follow(&mut events, OperationKind::CalibrationSampling).await?;
    }

    let report = session.compute().context("calibration failed")?;
    println!("error = {:.3e}", report.error);
    for (i, (factor, ieee)) in report.factors.iter().zip(&report.ieee).enumerate() {
        println!("  [{:02}] zero {:>9} factor {:>16.10} {}", i, report.zeros[i], factor, ieee);
    }

    let output = output.unwrap_or_else(|| path.with_file_name(calibrated_file_name(path)));
    std::fs::write(&output, session.calibrated_json()?)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("calibration written to {}", output.display());

    if flash {
        session.flash_calibration().await?;
        follow(&mut events, OperationKind::CalibrationFlash).await?;
        println!("flash complete");
    }
    session.disconnect().await;
    Ok(())
}

async fn flash(session: &DeviceSession, path: &Path, persist_port: bool) -> Result<()> {
    connect(session, path, persist_port).await?;
    let calibrated = session.parameters()?;
    let mut events = session.subscribe();
    session.flash(calibrated).await?;
    let result = follow(&mut events, OperationKind::Flash).await;
    session.disconnect().await;
    result?;
    println!("flash complete");
    Ok(())
}

async fn test(session: &DeviceSession, path: &Path, config: TestConfig, persist_port: bool) -> Result<()> {
    connect(session, path, persist_port).await?;
    let mut events = session.subscribe();
    session.start_test(Some(config)).await?;
    println!("reading factors and zeros, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = session.wait_idle() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::FactorsRead { bars }) => {
                    for bar in bars {
                        println!("bar {} factors {:?}", bar.bar, bar.factors);
                    }
                }
                Ok(SessionEvent::ZerosSummary { zeros }) => {
                    for bar in zeros {
                        println!("bar {} zeros {:?}", bar.bar, bar.zeros);
                    }
                }
                Ok(SessionEvent::Snapshot(s)) => {
                    let bars: Vec<String> = s
                        .bars
                        .iter()
                        .map(|b| match &b.error {
                            Some(_) => "   --   ".to_string(),
                            None => format!("{:>8.1}", b.total),
                        })
                        .collect();
                    eprint!("\r{}  total {:>10.1}   ", bars.join(" "), s.grand_total);
                }
                Ok(SessionEvent::Error { operation: OperationKind::Test, message, .. }) => {
                    eprintln!("\nerror: {}", message);
                }
                Ok(SessionEvent::Stopped { operation: OperationKind::Test }) => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    eprintln!();
    session.stop().await;
    session.disconnect().await;
    Ok(())
}

async fn read_factors(session: &DeviceSession, path: &Path) -> Result<()> {
    connect(session, path, false).await?;
    let result = session.read_factors().await;
    session.disconnect().await;
    for bar in result? {
        let text: Vec<String> = bar.factors.iter().map(|f| format!("{:.10}", f)).collect();
        println!("bar {}: {}", bar.bar, text.join("  "));
    }
    Ok(())
}
