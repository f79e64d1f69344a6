use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "proxy-cli")]
#[command(about = "Management CLI for the uplink proxy", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "UPLINK_PROXY_API_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check proxy system status
    Status,
    /// List backends with health and error counts
    Backends,
    /// Register a new backend (starts unhealthy)
    Add {
        /// Service tier, e.g. basic or priority
        tier: String,
        /// ws:// or wss:// endpoint
        endpoint: String,
    },
    /// Mark a backend healthy
    Up { id: String },
    /// Mark a backend unhealthy
    Down { id: String },
    /// Mark a backend unhealthy and move its sessions elsewhere
    Migrate { id: String },
    /// List connected client sessions
    Sessions {
        /// Include buffered messages and subscription commands
        #[arg(long)]
        details: bool,
    },
    /// Disconnect a client session
    Kill { id: u64 },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let base = cli.url.trim_end_matches('/');
    let request = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", base)),
        Commands::Backends => client.get(format!("{}/admin/backends", base)),
        Commands::Add { tier, endpoint } => client
            .post(format!("{}/admin/backends", base))
            .json(&json!({ "tier": tier, "endpoint": endpoint })),
        Commands::Up { id } => client.post(format!("{}/admin/backends/{}/up", base, id)),
        Commands::Down { id } => client.post(format!("{}/admin/backends/{}/down", base, id)),
        Commands::Migrate { id } => client.post(format!("{}/admin/backends/{}/migrate", base, id)),
        Commands::Sessions { details } => client
            .get(format!("{}/admin/sessions", base))
            .query(&[("details", details)]),
        Commands::Kill { id } => client.post(format!("{}/admin/sessions/{}/kill", base, id)),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let text = res.text().await?;
    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }

    let json: Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
