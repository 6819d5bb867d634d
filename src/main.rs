#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = learning_worker::run_worker().await {
        eprintln!("learning-worker fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
