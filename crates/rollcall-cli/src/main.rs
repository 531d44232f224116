use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn scan(&self) -> zbus::Result<String>;
    async fn add_employee(&self, code: &str, name: &str) -> zbus::Result<i64>;
    async fn enroll(
        &self,
        employee: i64,
        image: Vec<u8>,
        make_primary: bool,
    ) -> zbus::Result<String>;
    async fn deactivate(&self, employee: i64) -> zbus::Result<bool>;
    async fn confirm(&self, employee: i64, image: Vec<u8>) -> zbus::Result<String>;
    async fn rebuild(&self) -> zbus::Result<String>;
    async fn start_challenge(&self, kind: &str) -> zbus::Result<()>;
    async fn challenge_frame(&self, image: Vec<u8>) -> zbus::Result<String>;
    async fn presence(&self, employee: i64) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn reset_presence(&self) -> zbus::Result<u32>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one presence scan cycle now
    Scan,
    /// Show daemon status
    Status,
    /// Rebuild the recognition model from stored templates
    Rebuild,
    /// Register a new employee
    AddEmployee {
        /// Employee code, e.g. EMP001
        code: String,
        /// Display name
        name: String,
    },
    /// Enroll a face template for an employee from an image file
    Enroll {
        /// Employee ID
        employee: i64,
        /// Path to a snapshot image (PNG or JPEG)
        image: String,
        /// Make this the employee's primary template
        #[arg(long)]
        primary: bool,
    },
    /// Deactivate an employee and retire their templates from the model
    Deactivate {
        /// Employee ID
        employee: i64,
    },
    /// Show today's presence and attendance for an employee
    Presence {
        /// Employee ID
        employee: i64,
    },
    /// Confirm an identity from an image file and check the employee in
    Confirm {
        /// Employee ID being claimed
        employee: i64,
        /// Path to a snapshot image (PNG or JPEG)
        image: String,
    },
    /// Start a liveness challenge
    Challenge {
        /// Challenge kind: blink, turn_left, turn_right, nod
        kind: String,
    },
    /// Feed one frame to the active liveness challenge
    ChallengeFrame {
        /// Path to a frame image (PNG or JPEG)
        image: String,
    },
    /// Clear today's presence records
    ResetPresence,
    /// List available camera devices (bypasses the daemon)
    Devices,
}

/// Re-indent a JSON reply for the terminal; passes non-JSON through as-is.
fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{raw}"),
        },
        Err(_) => println!("{raw}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Diagnostics run directly against the hardware, daemon or not.
    if let Commands::Devices = cli.command {
        let devices = rollcall_hw::Camera::list_devices();
        if devices.is_empty() {
            println!("no V4L2 capture devices found");
        }
        for device in devices {
            println!("{}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
        }
        return Ok(());
    }

    let connection = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let proxy = AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable on the bus")?;

    match cli.command {
        Commands::Scan => {
            let summary = proxy.scan().await?;
            print_json(&summary);
        }
        Commands::Status => {
            let status = proxy.status().await?;
            print_json(&status);
        }
        Commands::Rebuild => {
            let report = proxy.rebuild().await?;
            print_json(&report);
        }
        Commands::AddEmployee { code, name } => {
            let id = proxy.add_employee(&code, &name).await?;
            println!("registered {name} ({code}) as employee {id}");
        }
        Commands::Enroll {
            employee,
            image,
            primary,
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("failed to read image {image}"))?;
            let reply = proxy.enroll(employee, bytes, primary).await?;
            print_json(&reply);
        }
        Commands::Deactivate { employee } => {
            if proxy.deactivate(employee).await? {
                println!("employee {employee} deactivated");
            } else {
                println!("no such employee: {employee}");
            }
        }
        Commands::Presence { employee } => {
            let day = proxy.presence(employee).await?;
            if day == "null" {
                println!("no record today for employee {employee}");
            } else {
                print_json(&day);
            }
        }
        Commands::Confirm { employee, image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("failed to read image {image}"))?;
            let reply = proxy.confirm(employee, bytes).await?;
            print_json(&reply);
        }
        Commands::Challenge { kind } => {
            proxy.start_challenge(&kind).await?;
            println!("challenge '{kind}' started");
        }
        Commands::ChallengeFrame { image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("failed to read image {image}"))?;
            let reply = proxy.challenge_frame(bytes).await?;
            print_json(&reply);
        }
        Commands::ResetPresence => {
            let cleared = proxy.reset_presence().await?;
            println!("cleared {cleared} presence record(s)");
        }
        Commands::Devices => unreachable!("handled before bus connection"),
    }

    Ok(())
}
