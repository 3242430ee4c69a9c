#[tokio::main]
async fn main() -> std::process::ExitCode {
    viaduct::run().await
}
