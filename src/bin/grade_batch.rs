#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = grading_assistant::run_cli().await {
        eprintln!("grade-batch: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
