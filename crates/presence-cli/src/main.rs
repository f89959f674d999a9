use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use presence_core::{DescriptorService, OnnxLoader};
use presence_hw::{CameraBackend, DeviceManager, V4l2Backend};
use presence_session::{
    AttendancePhase, EnrollmentEvent, EnrollmentFlow, EnrollmentPhase, SubmissionGateway,
    VerificationError, VerificationFlow, VerificationPhase,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

mod config;

use config::Config;

/// Attempts at grabbing a first preview frame before giving up.
const CAPTURE_ATTEMPTS: usize = 15;
const CAPTURE_RETRY: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "presence", about = "Face enrollment and attendance capture")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/presence/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cameras
    Devices,
    /// Record a face profile from the camera
    Enroll {
        /// Camera device path (e.g. /dev/video0)
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Record a check-in
    Checkin(AttendanceArgs),
    /// Record a check-out
    Checkout(AttendanceArgs),
    /// Show the enrolled face profile
    Status,
}

#[derive(clap::Args)]
struct AttendanceArgs {
    /// Use an image file instead of the camera
    #[arg(short, long)]
    file: Option<PathBuf>,
    /// Attendance status sent with the capture
    #[arg(short, long, default_value = "present")]
    status: String,
    /// Camera device path (e.g. /dev/video0)
    #[arg(short, long)]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Devices => devices(),
        Commands::Enroll { device } => enroll(&config, device).await,
        Commands::Checkin(args) => attend(&config, AttendancePhase::Checkin, args).await,
        Commands::Checkout(args) => attend(&config, AttendancePhase::Checkout, args).await,
        Commands::Status => status(&config).await,
    }
}

fn camera() -> Arc<dyn CameraBackend> {
    Arc::new(V4l2Backend::default())
}

fn descriptors(config: &Config) -> DescriptorService {
    DescriptorService::new(OnnxLoader::new(&config.model_dir))
}

fn devices() -> Result<()> {
    let mut manager = DeviceManager::new(camera());
    let devices = manager.enumerate().context("enumerating cameras")?;
    for device in devices {
        let marker = if device.is_preferred { " (rear)" } else { "" };
        println!("{}  {}{marker}", device.id, device.label);
    }
    Ok(())
}

async fn enroll(config: &Config, device: Option<String>) -> Result<()> {
    let flow = EnrollmentFlow::new(
        camera(),
        descriptors(config),
        Arc::new(config.gateway()?),
        config.enrollment_options(),
    );
    if let Some(device) = device.or_else(|| config.camera_device.clone()) {
        if !flow.select_device(&device)? {
            bail!("camera {device} not found; see `presence devices`");
        }
    }

    let mut events = flow.subscribe();
    flow.start().await?;
    println!(
        "Look at the camera. Capturing {} samples...",
        flow.target_count()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                flow.close();
                bail!("enrollment cancelled");
            }
            event = events.recv() => match event {
                Ok(EnrollmentEvent::SampleAdded { count }) => {
                    println!("  sample {count}/{}", flow.target_count());
                }
                Ok(EnrollmentEvent::Notice(message)) => eprintln!("  {message}"),
                Ok(EnrollmentEvent::Phase(EnrollmentPhase::Complete)) => break,
                Ok(EnrollmentEvent::Phase(EnrollmentPhase::Failed)) => {
                    bail!("enrollment failed");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("enrollment ended unexpectedly"),
            }
        }
    }

    let receipt = flow.submit().await?;
    println!("{}", receipt.message);
    println!(
        "Profile: {} descriptors stored",
        receipt.profile.descriptors_count
    );
    Ok(())
}

async fn attend(config: &Config, phase: AttendancePhase, args: AttendanceArgs) -> Result<()> {
    let flow = VerificationFlow::new(
        camera(),
        descriptors(config),
        Arc::new(config.gateway()?),
        phase,
        config.verification_policy(),
    );

    if args.file.is_none() {
        if let Some(device) = args.device.or_else(|| config.camera_device.clone()) {
            if !flow.select_device(&device)? {
                bail!("camera {device} not found; see `presence devices`");
            }
        }
    }

    let opened = flow.open().await;
    let attempt = match args.file {
        Some(path) => flow.choose_file(&path).await?,
        None if opened == VerificationPhase::CameraReady => capture_with_retry(&flow).await?,
        None => bail!("no camera available; pass --file with a photo instead"),
    };

    if let Some(warning) = &attempt.warning {
        eprintln!("warning: {warning}");
    }
    if let Some(blocker) = flow.submit_blocker() {
        bail!("cannot submit {phase}: {blocker}");
    }

    let receipt = flow.submit(args.status).await?;
    println!("{}", receipt.message);
    Ok(())
}

/// The V4L2 stream needs a moment to publish its first frame.
async fn capture_with_retry(
    flow: &VerificationFlow,
) -> Result<presence_session::VerificationAttempt> {
    let mut attempts = 0;
    loop {
        match flow.capture().await {
            Err(VerificationError::CaptureFailed(reason)) if attempts < CAPTURE_ATTEMPTS => {
                tracing::debug!(%reason, attempts, "no preview frame yet");
                attempts += 1;
                tokio::time::sleep(CAPTURE_RETRY).await;
            }
            other => return Ok(other?),
        }
    }
}

async fn status(config: &Config) -> Result<()> {
    let profile = config.gateway()?.profile_status().await?;
    if !profile.registered {
        println!("No face profile enrolled");
        return Ok(());
    }
    print!("Enrolled: {} descriptors", profile.descriptors_count);
    match profile.updated_at {
        Some(at) => println!(", updated {}", at.format("%Y-%m-%d %H:%M UTC")),
        None => println!(),
    }
    Ok(())
}
