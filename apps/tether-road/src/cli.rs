use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::{SinkExt, StreamExt};
use tether_proto::{decode_server, encode, generate_device_id, ClientControl, ClientEnvelope, Role};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "tether-road")]
#[command(about = "Tether signaling server and debug probe")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Listen port (overrides TETHER_ROAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Always issue the pairing code 0000
    #[arg(long)]
    pub debug_pairing_code: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register against a running server and print what comes back
    Probe {
        /// Server websocket URL
        #[arg(short, long, default_value = "ws://localhost:3000/ws")]
        url: String,

        /// Register as this role
        #[arg(long, value_enum, default_value_t = ProbeRole::Host)]
        role: ProbeRole,

        /// Redeem this pairing code after registering (viewer only)
        #[arg(long)]
        code: Option<String>,

        /// Seconds to keep listening
        #[arg(long, default_value_t = 5)]
        listen: u64,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ProbeRole {
    Host,
    Viewer,
}

impl From<ProbeRole> for Role {
    fn from(role: ProbeRole) -> Self {
        match role {
            ProbeRole::Host => Role::Host,
            ProbeRole::Viewer => Role::Viewer,
        }
    }
}

pub async fn run_probe(url: String, role: ProbeRole, code: Option<String>, listen: u64) -> Result<()> {
    debug!(%url, "probe connecting");
    let (stream, _) = match timeout(Duration::from_secs(5), connect_async(url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return Err(anyhow!("connection to {url} failed: {err}")),
        Err(_) => return Err(anyhow!("connection timeout, is the server running?")),
    };
    let (mut write, mut read) = stream.split();

    let register = ClientEnvelope::from(ClientControl::Register {
        role: role.into(),
        device_id: generate_device_id(),
        token: None,
    });
    write.send(Message::Text(encode(&register)?.into())).await?;

    if let Some(code) = code {
        let pair = ClientEnvelope::from(ClientControl::Pair {
            pairing_code: code,
            cols: None,
            rows: None,
        });
        write.send(Message::Text(encode(&pair)?.into())).await?;
    }

    let deadline = Instant::now() + Duration::from_secs(listen);
    loop {
        let frame = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) | Err(_) => break,
        };
        if let Message::Text(text) = frame {
            match decode_server(&text) {
                Ok(envelope) => println!("{envelope:?}"),
                Err(_) => println!("unrecognised: {}", &*text),
            }
        }
    }
    Ok(())
}
