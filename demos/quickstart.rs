use anyhow::Result;
use screenpilot::{
    Agent, BrowserConfig, ChromiumComputer, ConversationItem, DiskScreenshotStore, SafetyGate,
    TurnOutcome,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let goal = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let goal = if goal.trim().is_empty() {
        "Open example.com and tell me the page heading.".to_string()
    } else {
        goal
    };

    let cfg = BrowserConfig { headless: false, ..Default::default() };
    let computer = match std::env::var("CHROME_WS_URL") {
        Ok(ws) if !ws.trim().is_empty() => ChromiumComputer::connect(&ws, cfg).await?,
        _ => ChromiumComputer::launch(cfg).await?,
    };
    computer.open_url("https://example.com").await?;

    let auto_ack = std::env::var("SCREENPILOT_ACK").is_ok_and(|v| v == "1");
    let runs_dir = std::env::temp_dir().join("screenpilot_runs");
    let agent = Agent::from_env(Arc::new(computer))?
        .with_safety_gate(SafetyGate::new(move |message| {
            println!("safety check: {message} -> {}", if auto_ack { "acknowledged" } else { "declined" });
            auto_ack
        }))
        .with_screenshot_store(Arc::new(DiskScreenshotStore::new(&runs_dir)))
        .on_item(|item| println!("{item}"));

    println!("{} / {}", agent.config().provider, agent.config().model);

    // Ctrl-C stops the turn cleanly instead of killing the process mid-action.
    let stop = agent.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    match agent.run_turn(vec![ConversationItem::user(goal)]).await? {
        TurnOutcome::Completed { items } => println!("completed after {} items", items.len()),
        TurnOutcome::Stopped { .. } => println!("stopped"),
    }
    println!("screenshots under {}", runs_dir.display());
    Ok(())
}
