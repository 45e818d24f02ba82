//! Ctrl-C handling: pause, confirm, or retune logging.
//!
//! An interrupt does not kill the run outright. Workers are suspended at
//! their next checkpoint while the operator is asked what to do: `yes` ends
//! the session with the USER exit code, `debug`/`info` retune the log level
//! and resume, anything else just resumes.

use gadfly_core::signal::{ExitCode, ShutdownSignal};

use crate::logging::{filter_for, LevelHandle};

/// Spawn the interrupt listener.
pub fn spawn(signal: ShutdownSignal, level_handle: LevelHandle) {
    tokio::spawn(run(signal, level_handle));
}

async fn run(signal: ShutdownSignal, level_handle: LevelHandle) {
    loop {
        tokio::select! {
            () = signal.cancelled() => return,
            result = tokio::signal::ctrl_c() => {
                if result.is_err() {
                    tracing::error!("Failed to listen for Ctrl+C");
                    return;
                }
            }
        }

        tracing::info!("SIGINT received");
        println!("\nFuzzer PAUSED");

        // Workers stall at their next checkpoint until this guard drops.
        let pause = signal.pause().await;
        let answer = tokio::task::spawn_blocking(prompt)
            .await
            .unwrap_or_default();
        drop(pause);

        match answer.trim() {
            "yes" => {
                signal.trigger(ExitCode::User);
                return;
            }
            "debug" | "info" => {
                let level = answer.trim().to_string();
                if level_handle.reload(filter_for(&level)).is_ok() {
                    println!("Log level set to {level}; resuming");
                }
            }
            _ => println!("Resuming"),
        }
    }
}

/// Blocking confirmation prompt.
fn prompt() -> String {
    dialoguer::Input::<String>::new()
        .with_prompt("Are you sure you want to exit? Type (yes/no)")
        .allow_empty(true)
        .interact_text()
        .unwrap_or_default()
}
