//! Session management command

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use request_lens::config;
use std::path::Path;

/// List recorded sessions, or delete one
#[derive(Debug, Clone, Parser)]
pub struct SessionsArgs {
    /// Delete the session with this id together with its events
    #[arg(short, long)]
    pub delete: Option<String>,
}

pub async fn execute(config_path: &Path, args: SessionsArgs) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    let Some(db) = super::open_history(&cfg).await? else {
        return Ok(());
    };

    if let Some(id) = args.delete {
        if db.delete_session(&id).await? {
            println!("{}", format!("✓ Deleted session {}", id).green());
        } else {
            println!("{}", format!("No session with id {}", id).yellow());
        }
        db.close().await;
        return Ok(());
    }

    let sessions = db.list_sessions().await?;
    if sessions.is_empty() {
        println!("{}", "No sessions recorded".yellow());
    } else {
        println!(
            "{}",
            format!(
                "{:<36}  {:<19}  {:>7}  {:>7}  {:>10}  {}",
                "ID", "STARTED", "HITS", "LOGS", "EXCEPTIONS", "LABEL"
            )
            .bold()
        );
        for session in &sessions {
            println!(
                "{:<36}  {:<19}  {:>7}  {:>7}  {:>10}  {}",
                session.id.cyan(),
                session.started_at.format("%Y-%m-%d %H:%M:%S"),
                session.hits,
                session.logs,
                if session.exceptions > 0 {
                    session.exceptions.to_string().red()
                } else {
                    session.exceptions.to_string().normal()
                },
                session.label.dimmed()
            );
        }
    }

    db.close().await;
    Ok(())
}
