use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    pricewatch::app::run().await
}
