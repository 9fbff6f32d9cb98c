use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::broadcast::BroadcastSettings;
use crate::connection::DEFAULT_OUTBOUND_BUFFER;
use crate::reconcile::ReconcileSettings;
use crate::remote::FirebaseSettings;

#[derive(Debug, Parser)]
#[command(
    name = "fitness-relay",
    author,
    version,
    about = "WebSocket relay between remote workout control and fitness devices"
)]
pub struct Cli {
    /// Port to listen on; overrides the port of --listen-addr.
    pub port: Option<u16>,

    /// Address to bind the websocket listener to.
    #[arg(long, env = "FITNESS_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Firebase Realtime Database URL holding the remote control document.
    #[arg(long, env = "FIREBASE_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Path of the control document inside the database.
    #[arg(long, env = "FIREBASE_DB_PATH", default_value = "fitness")]
    pub database_path: String,

    /// Database secret or ID token passed as the `auth` query parameter.
    #[arg(long, env = "FIREBASE_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Device (index or id) that remote commands are sent to.
    #[arg(long, env = "FITNESS_RELAY_PRIMARY_DEVICE", default_value = "1")]
    pub primary_device: String,

    #[arg(long, env = "FITNESS_RELAY_POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u64,

    #[arg(long, env = "FITNESS_RELAY_BROADCAST_INTERVAL_MS", default_value_t = 1000)]
    pub broadcast_interval_ms: u64,

    #[arg(long, env = "FITNESS_RELAY_FEEDBACK_INTERVAL_SECS", default_value_t = 10)]
    pub feedback_interval_secs: u64,

    /// Delay before answering a pose_data frame with feedback.
    #[arg(long, env = "FITNESS_RELAY_POSE_FEEDBACK_DELAY_MS", default_value_t = 50)]
    pub pose_feedback_delay_ms: u64,

    #[arg(long, env = "FITNESS_RELAY_FETCH_TIMEOUT_MS", default_value_t = 2000)]
    pub fetch_timeout_ms: u64,

    /// Messages buffered per connection before new ones are dropped.
    #[arg(long, env = "FITNESS_RELAY_OUTBOUND_BUFFER", default_value_t = DEFAULT_OUTBOUND_BUFFER)]
    pub outbound_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "FITNESS_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub firebase: Option<FirebaseSettings>,
    pub reconcile: ReconcileSettings,
    pub broadcast: BroadcastSettings,
    pub connection: ConnectionSettings,
    pub shutdown_grace: Duration,
}

/// Per-connection knobs used by the websocket handler.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub outbound_buffer: usize,
    pub pose_feedback_delay: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            pose_feedback_delay: Duration::from_millis(50),
        }
    }
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let mut listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if let Some(port) = cli.port {
            listen_addr.set_port(port);
        }
        if cli.poll_interval_ms == 0 || cli.broadcast_interval_ms == 0 {
            anyhow::bail!("poll and broadcast intervals must be greater than zero");
        }

        let firebase = cli
            .database_url
            .filter(|url| !url.trim().is_empty())
            .map(|database_url| FirebaseSettings {
                database_url,
                path: cli.database_path.clone(),
                auth_token: cli.auth_token.clone(),
                timeout: Duration::from_millis(cli.fetch_timeout_ms),
            });

        Ok(RelayConfig {
            listen_addr,
            firebase,
            reconcile: ReconcileSettings {
                target: cli.primary_device,
                poll_interval: Duration::from_millis(cli.poll_interval_ms),
                ..ReconcileSettings::default()
            },
            broadcast: BroadcastSettings {
                interval: Duration::from_millis(cli.broadcast_interval_ms),
                feedback_interval: Duration::from_secs(cli.feedback_interval_secs),
            },
            connection: ConnectionSettings {
                outbound_buffer: cli.outbound_buffer,
                pose_feedback_delay: Duration::from_millis(cli.pose_feedback_delay_ms),
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
