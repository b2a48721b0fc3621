use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match turbidity_lib::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
