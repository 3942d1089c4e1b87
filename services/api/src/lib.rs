mod cli;
mod demo;
mod infra;
mod routes;
mod server;

use deal_signing::error::AppError;

pub async fn run() -> Result<(), AppError> {
    cli::run().await
}
