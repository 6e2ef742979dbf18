use clap::Parser;
use server::network::{GeoServer, ServerConfig, ServerMessage};
use server::proximity::RolePair;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Reconciliation sweep interval in seconds (0 = disabled; the
    /// sweep is opt-in)
    #[clap(short, long, default_value = "0")]
    sweep_interval: u64,
    /// Idle session timeout in seconds
    #[clap(short = 't', long, default_value = "60")]
    session_timeout: u64,
    /// First role of the proximity pair
    #[clap(long, default_value = "customer")]
    role_a: String,
    /// Second role of the proximity pair
    #[clap(long, default_value = "technician")]
    role_b: String,
    /// Base URL of the alert enrichment backend (optional)
    #[clap(long)]
    enrichment_url: Option<String>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            sweep_interval: match self.sweep_interval {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            session_timeout: Duration::from_secs(self.session_timeout),
            roles: RolePair::new(&self.role_a, &self.role_b),
            enrichment_url: self.enrichment_url,
        }
    }
}

/// Main-method of the application.
/// Parses command-line arguments, then starts the geofence server.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let mut server = GeoServer::new(args.into_config()).await?;
    let control = server.control_sender();

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
            let _ = control.send(ServerMessage::Shutdown);
        }
    }

    Ok(())
}
