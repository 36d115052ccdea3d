#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = grading_assistant::run().await {
        eprintln!("grading-assistant fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
