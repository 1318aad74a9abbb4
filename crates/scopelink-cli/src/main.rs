//! Command-line driver for ScopeLink microscopes.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use scopelink_access::{
    broker_username, AccessGate, BrokerAdminClient, Issuance, KeyPolicy, RedbKeyStore,
};
use scopelink_session::{
    CommandSession, Corner, Correlation, FocusAmount, ScanArea, SessionOptions, StatusRegistry,
    StitchTool,
};
use scopelink_transport::TransportConnection;

use crate::config::{env_vars, Settings};

/// ScopeLink - drive remote microscopes over MQTT.
#[derive(Parser, Debug)]
#[command(name = "scopelink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Broker host (falls back to SCOPELINK_BROKER_HOST).
    #[arg(long, global = true)]
    broker_host: Option<String>,

    /// Broker TLS port (falls back to SCOPELINK_BROKER_PORT, then 8883).
    #[arg(long, global = true)]
    broker_port: Option<u16>,

    /// CA certificate of the broker (falls back to SCOPELINK_CA_FILE).
    #[arg(long, global = true)]
    ca_file: Option<PathBuf>,

    /// Key database (falls back to SCOPELINK_KEY_STORE).
    #[arg(long, global = true)]
    key_store: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Device and credentials for a command.
#[derive(ClapArgs, Debug)]
struct Target {
    /// Device id, e.g. `microscope2`.
    device: String,

    /// Access key issued for the device.
    #[arg(short, long)]
    key: String,

    /// Match responses by arrival order, for devices that do not echo ids.
    #[arg(long)]
    ordinal: bool,
}

/// Scan rectangle.
#[derive(ClapArgs, Debug)]
struct Area {
    /// First corner: `x,y[,z]` or a named position.
    c1: Corner,
    /// Opposite corner.
    c2: Corner,
    /// Overlap between tiles.
    #[arg(long, default_value_t = 1200)]
    ov: i64,
    /// Focus adjustment between tiles.
    #[arg(long, default_value_t = 0)]
    foc: i64,
}

impl Area {
    fn to_scan_area(&self) -> ScanArea {
        ScanArea::new(self.c1.clone(), self.c2.clone())
            .with_overlap(self.ov)
            .with_focus_step(self.foc)
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Issue an access key for a device.
    IssueKey {
        device: String,
        /// Key lifetime in seconds, overriding the policy.
        #[arg(long)]
        lifetime_secs: Option<u64>,
    },
    /// Check that a key grants access to a device.
    CheckKey { key: String, device: String },
    /// Print the stage position.
    GetPos {
        #[command(flatten)]
        target: Target,
    },
    /// Capture one image.
    TakeImage {
        #[command(flatten)]
        target: Target,
        /// Where to write the image.
        #[arg(short, long, default_value = "image.jpeg")]
        output: PathBuf,
    },
    /// Move the stage.
    Move {
        #[command(flatten)]
        target: Target,
        #[arg(allow_hyphen_values = true)]
        x: i64,
        #[arg(allow_hyphen_values = true)]
        y: i64,
        #[arg(long, allow_hyphen_values = true)]
        z: Option<i64>,
        /// Move relative to the current position.
        #[arg(long)]
        relative: bool,
    },
    /// Adjust focus by a preset (huge, fast, medium, fine) or a step count.
    Focus {
        #[command(flatten)]
        target: Target,
        #[arg(default_value = "fast", allow_hyphen_values = true)]
        amount: FocusAmount,
    },
    /// Scan an area and save the tiles.
    Scan {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        area: Area,
        /// Directory the tiles are written to.
        #[arg(short, long, default_value = "scan")]
        output_dir: PathBuf,
    },
    /// Scan an area and stitch the tiles into one image.
    ScanStitch {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        area: Area,
        /// Scratch directory; deleted and recreated.
        #[arg(long, default_value = "scan_tiles")]
        scratch: PathBuf,
        #[arg(short, long, default_value = "stitched.jpg")]
        output: PathBuf,
    },
    /// Listen for device status reports.
    Status {
        /// How long to listen, in seconds.
        #[arg(long, default_value_t = 3)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = Settings::from_env()?;

    init_logging(args.verbose, settings.log_json);

    // Flags win over the environment.
    if args.broker_host.is_some() {
        settings.broker_host = args.broker_host.clone();
    }
    if args.broker_port.is_some() {
        settings.broker_port = args.broker_port;
    }
    if args.ca_file.is_some() {
        settings.ca_file = args.ca_file.clone();
    }
    if args.key_store.is_some() {
        settings.key_store = args.key_store.clone();
    }

    match args.command {
        Command::IssueKey {
            device,
            lifetime_secs,
        } => issue_key(&settings, &device, lifetime_secs).await,
        Command::CheckKey { key, device } => check_key(&settings, &key, &device).await,
        Command::GetPos { target } => {
            let session = open_session(&settings, &target).await?;
            let result = session.get_pos().await;
            session.close().await?;
            let pos = result.context("get_pos failed")?;
            println!("{}", serde_json::to_string(&pos)?);
            Ok(())
        }
        Command::TakeImage { target, output } => {
            let session = open_session(&settings, &target).await?;
            let result = session.take_image().await;
            session.close().await?;
            let image = result.context("take_image failed")?;
            tokio::fs::write(&output, &image)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Saved {} bytes to {}", image.len(), output.display());
            Ok(())
        }
        Command::Move {
            target,
            x,
            y,
            z,
            relative,
        } => {
            let session = open_session(&settings, &target).await?;
            let result = session.move_to(x, y, z, relative).await;
            session.close().await?;
            println!("{}", result.context("move failed")?);
            Ok(())
        }
        Command::Focus { target, amount } => {
            let session = open_session(&settings, &target).await?;
            let result = session.focus(amount).await;
            session.close().await?;
            println!("{}", result.context("focus failed")?);
            Ok(())
        }
        Command::Scan {
            target,
            area,
            output_dir,
        } => {
            let session = open_session(&settings, &target).await?;
            let result = session.scan(&area.to_scan_area()).await;
            session.close().await?;
            let tiles = result.context("scan failed")?;
            tokio::fs::create_dir_all(&output_dir).await?;
            for (i, tile) in tiles.iter().enumerate() {
                tokio::fs::write(output_dir.join(format!("{}.jpeg", i)), tile).await?;
            }
            println!("Saved {} tile(s) to {}", tiles.len(), output_dir.display());
            Ok(())
        }
        Command::ScanStitch {
            target,
            area,
            scratch,
            output,
        } => {
            let session = open_session(&settings, &target).await?;
            let result = session
                .scan_and_stitch(&area.to_scan_area(), &scratch, &output)
                .await;
            session.close().await?;
            let stitched = result.context("scan_and_stitch failed")?;
            println!("Stitched image written to {}", stitched.display());
            Ok(())
        }
        Command::Status { wait_secs } => show_status(&settings, wait_secs).await,
    }
}

fn init_logging(verbose: bool, json_logging: bool) {
    let default_directive = if verbose {
        "scopelink=debug"
    } else {
        "scopelink=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Gate over the local key database.
///
/// With broker admin settings keys become broker passwords, otherwise they
/// are short-lived local tokens.
fn open_gate(settings: &Settings) -> Result<AccessGate> {
    let path = settings.key_store_path();
    let store = RedbKeyStore::open(&path)
        .with_context(|| format!("Failed to open key store {}", path.display()))?;

    let gate = match settings.admin() {
        Some(admin) => {
            let client = BrokerAdminClient::new(admin)?;
            AccessGate::new(KeyPolicy::provisioned()).with_provisioner(Arc::new(client))
        }
        None => AccessGate::new(KeyPolicy::ephemeral()),
    };
    Ok(gate.with_store(Arc::new(store)))
}

async fn issue_key(settings: &Settings, device: &str, lifetime_secs: Option<u64>) -> Result<()> {
    let gate = open_gate(settings)?;
    let issuance = match lifetime_secs {
        Some(secs) => gate.issue_for(device, Duration::from_secs(secs)).await?,
        None => gate.issue(device).await?,
    };

    match issuance {
        Issuance::Issued(key) => {
            println!("{}", key.value);
            if let Some(expires_at) = key.expires_at {
                eprintln!("Valid for {} until {}", device, expires_at.to_rfc3339());
            }
            Ok(())
        }
        Issuance::Cooldown { remaining } => anyhow::bail!(
            "Cooldown: a key for {} was issued recently, try again in {} seconds",
            device,
            remaining.as_secs().max(1)
        ),
    }
}

async fn check_key(settings: &Settings, key: &str, device: &str) -> Result<()> {
    let gate = open_gate(settings)?;
    if gate.check_access(key, device).await? {
        println!("Access granted to {}", device);
        Ok(())
    } else {
        anyhow::bail!("InvalidKey: key does not grant access to {}", device)
    }
}

async fn open_session(settings: &Settings, target: &Target) -> Result<CommandSession> {
    let transport = authorize(settings, &target.device, &target.key).await?;

    let mut options = SessionOptions::default();
    if target.ordinal {
        options = options.with_correlation(Correlation::Ordinal);
    }
    if let Some(program) = &settings.stitch_tool {
        options = options.with_stitch_tool(StitchTool::new(program.clone()));
    }

    CommandSession::connect(&transport, target.device.clone(), options)
        .await
        .with_context(|| {
            format!(
                "Failed to open a session with {} via {}",
                target.device,
                transport.full_broker_addr()
            )
        })
}

/// Broker connection for a caller holding `key` for `device`.
///
/// Provisioned keys are broker passwords and the broker decides. Ephemeral
/// keys are checked against the local gate before anything connects.
async fn authorize(
    settings: &Settings,
    device: &str,
    key: &str,
) -> Result<scopelink_transport::TransportConfig> {
    let transport = settings.transport()?;

    if settings.admin().is_some() {
        return Ok(transport.with_auth(broker_username(device), key));
    }

    let gate = open_gate(settings)?;
    if !gate.check_access(key, device).await? {
        anyhow::bail!("InvalidKey: key does not grant access to {}", device);
    }
    Ok(with_env_auth(transport, settings))
}

fn with_env_auth(
    transport: scopelink_transport::TransportConfig,
    settings: &Settings,
) -> scopelink_transport::TransportConfig {
    match (&settings.mqtt_username, &settings.mqtt_password) {
        (Some(user), Some(password)) => transport.with_auth(user.clone(), password.clone()),
        (Some(_), None) | (None, Some(_)) => {
            tracing::warn!(
                "Ignoring incomplete broker credentials, set both {} and {}",
                env_vars::MQTT_USERNAME,
                env_vars::MQTT_PASSWORD
            );
            transport
        }
        (None, None) => transport,
    }
}

async fn show_status(settings: &Settings, wait_secs: u64) -> Result<()> {
    let transport = with_env_auth(settings.transport()?, settings);
    let conn = TransportConnection::connect(&transport)
        .await
        .with_context(|| format!("Failed to connect to {}", transport.full_broker_addr()))?;

    let registry = StatusRegistry::attach(&conn).await?;
    tokio::time::sleep(Duration::from_secs(wait_secs)).await;
    println!("{}", registry.render());

    registry.detach().await?;
    conn.disconnect().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &tempfile::TempDir) -> Settings {
        Settings {
            broker_host: Some("broker.example.org".to_string()),
            mqtt_username: Some("operator".to_string()),
            mqtt_password: Some("secret".to_string()),
            key_store: Some(dir.path().join("keys.redb")),
            ..Default::default()
        }
    }

    #[test]
    fn test_device_commands_require_a_key() {
        assert!(Args::try_parse_from(["scopelink", "get-pos", "microscope2"]).is_err());

        let args =
            Args::try_parse_from(["scopelink", "get-pos", "microscope2", "--key", "abc"]).unwrap();
        match args.command {
            Command::GetPos { target } => assert_eq!(target.key, "abc"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_key_is_refused_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);

        let err = authorize(&settings, "microscope2", "not-a-key")
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("InvalidKey"));
    }

    #[tokio::test]
    async fn test_ephemeral_key_grants_its_device_only() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);

        let key = {
            let gate = open_gate(&settings).unwrap();
            match gate.issue("microscope2").await.unwrap() {
                Issuance::Issued(key) => key.value,
                other => panic!("expected a key, got {:?}", other),
            }
        };

        let transport = authorize(&settings, "microscope2", &key).await.unwrap();
        assert_eq!(transport.username.as_deref(), Some("operator"));
        assert_eq!(transport.password.as_deref(), Some("secret"));

        let err = authorize(&settings, "deltastagereflection", &key)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("InvalidKey"));
    }

    #[tokio::test]
    async fn test_provisioned_key_is_the_broker_password() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            admin_url: Some("https://admin.example.org".to_string()),
            admin_token: Some("tok".to_string()),
            ..settings(&dir)
        };

        let transport = authorize(&settings, "microscope2", "k3y").await.unwrap();
        assert_eq!(transport.username.as_deref(), Some("microscope2clientuser"));
        assert_eq!(transport.password.as_deref(), Some("k3y"));
    }
}
