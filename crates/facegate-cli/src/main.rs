use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[zbus::proxy(
    interface = "org.facegate.Daemon1",
    default_service = "org.facegate.Daemon1",
    default_path = "/org/facegate/Daemon1"
)]
trait Facegate {
    async fn enroll(&self, email: &str, password: &str, image: &[u8]) -> zbus::Result<String>;
    async fn verify_face(&self, email: &str, image: &[u8]) -> zbus::Result<String>;
    async fn verify_password(&self, email: &str, password: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face/password authentication CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll face samples (the first sample also registers the password)
    Enroll {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
        /// One or more face images; stops early once enrollment completes
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Log in with a face image
    Verify {
        #[arg(short, long)]
        email: String,
        image: PathBuf,
    },
    /// Log in with a password
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = FacegateProxy::new(&conn)
        .await
        .context("facegated is not reachable")?;

    let success = match cli.command {
        Commands::Enroll {
            email,
            password,
            images,
        } => {
            let mut success = true;
            for path in &images {
                let image = read_image(path)?;
                let reply = Reply::parse(&proxy.enroll(&email, &password, &image).await?)?;
                println!("{}: {}", path.display(), reply.msg);
                success = reply.success;
                if !reply.success || reply.completed {
                    break;
                }
            }
            success
        }
        Commands::Verify { email, image } => {
            let image = read_image(&image)?;
            let reply = Reply::parse(&proxy.verify_face(&email, &image).await?)?;
            println!("{}", reply.msg);
            reply.success
        }
        Commands::Login { email, password } => {
            let reply = Reply::parse(&proxy.verify_password(&email, &password).await?)?;
            println!("{}", reply.msg);
            reply.success
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            true
        }
    };

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Read an image file, checking locally that it decodes before sending it.
fn read_image(path: &Path) -> Result<Vec<u8>> {
    let (width, height) = image::image_dimensions(path)
        .with_context(|| format!("{} is not a readable image", path.display()))?;
    tracing::debug!(path = %path.display(), width, height, "sending image");
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// The daemon's `{success, completed?, msg}` reply.
struct Reply {
    success: bool,
    completed: bool,
    msg: String,
}

impl Reply {
    fn parse(raw: &str) -> Result<Self> {
        let body: serde_json::Value =
            serde_json::from_str(raw).context("daemon returned malformed reply")?;
        Ok(Self {
            success: body["success"].as_bool().unwrap_or(false),
            completed: body["completed"].as_bool().unwrap_or(false),
            msg: body["msg"].as_str().unwrap_or_default().to_string(),
        })
    }
}
