//! reasoner-probe - connect to a reasoning server and report its state
//!
//! Prints a JSON report with the server image fingerprint and lease state,
//! optionally after running one ground query.

use clap::Parser;
use serde::Serialize;
use tracing::{error, info};

use reasoner_client::{
    logging, ClientConfig, ConnectionArgs, QueryProperties, ReasonerClient, Term,
};

#[derive(Parser, Debug)]
#[command(name = "reasoner-probe")]
#[command(about = "Check connectivity to a reasoning server")]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Ask whether `<symbol>` is an instance of `<collection>` in this context
    #[arg(long, num_args = 2, value_names = ["SYMBOL", "COLLECTION"])]
    isa: Option<Vec<String>>,

    /// Context (microtheory) for --isa
    #[arg(long, default_value = "BaseKB")]
    context: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Serialize)]
struct Report {
    server: String,
    image: Option<String>,
    lease_enabled: bool,
    lease_valid: bool,
    lease_remaining_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    isa: Option<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    logging::init(&args.log_level, args.log_json)?;

    let config: ClientConfig = args.connection.into();
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!(server = %config.identity(), "Probing reasoning server");
    let client = ReasonerClient::connect_websocket(config).await?;

    let isa = match args.isa.as_deref() {
        Some([symbol, collection]) => {
            let sentence = Term::list([
                Term::symbol("isa"),
                Term::symbol(symbol.as_str()),
                Term::symbol(collection.as_str()),
            ]);
            let query = client.query(
                sentence,
                Term::symbol(args.context.as_str()),
                QueryProperties::default().with_max_answers(1),
            );
            let proven = query.is_true().await;
            query.close().await;
            Some(proven?)
        }
        _ => None,
    };

    let lease = client.connection().lease();
    let report = Report {
        server: client.identity().to_string(),
        image: client.fingerprint().map(|f| f.to_string()),
        lease_enabled: lease.is_enabled(),
        lease_valid: lease.is_valid(),
        lease_remaining_ms: lease.remaining().map(|d| d.as_millis() as u64),
        isa,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    client.close().await;
    Ok(())
}
