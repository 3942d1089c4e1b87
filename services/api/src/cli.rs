use crate::demo::{run_demo, DemoArgs};
use crate::infra::SANDBOX_CONSENT_URL;
use crate::server;
use clap::{Args, Parser, Subcommand};
use deal_signing::config::AppConfig;
use deal_signing::error::AppError;
use deal_signing::workflows::signing::{JwtTokenBroker, SigningError, TokenBroker};

#[derive(Parser, Debug)]
#[command(
    name = "Deal Contract Signing",
    about = "Run and demonstrate buyer/seller contract e-signature orchestration",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Walk one contract through both signing rounds against the sandbox provider
    Demo(DemoArgs),
    /// Print the one-time administrator consent URL for the signing integration
    ConsentUrl,
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Demo(args) => run_demo(args).await,
        Command::ConsentUrl => print_consent_url(),
    }
}

fn print_consent_url() -> Result<(), AppError> {
    let config = AppConfig::load()?;
    match &config.signing {
        Some(signing) => {
            let broker = JwtTokenBroker::from_config(signing).map_err(SigningError::from)?;
            println!("{}", broker.consent_url());
        }
        None => {
            println!("{SANDBOX_CONSENT_URL}");
            eprintln!("SIGNING_INTEGRATION_KEY is not set; showing the sandbox consent URL");
        }
    }
    Ok(())
}
