//! Operator controls against the shared work store.

use anyhow::{Result, bail};
use buildfarm_core::TriggerOutcome;
use buildfarm_db::WorkStore;

use super::StoreOptions;

pub async fn trigger(options: &StoreOptions, description: &str, operator: &str) -> Result<()> {
    let store = options.store().await?;
    match store.trigger_build(description, operator).await? {
        TriggerOutcome::Triggered => println!("✓ Triggered '{description}' for {operator}"),
        TriggerOutcome::AlreadyBuilding => println!("'{description}' is already building"),
        TriggerOutcome::NotFound => bail!("No build request named '{description}'"),
    }
    Ok(())
}

pub async fn kill(options: &StoreOptions, description: &str, killer: &str) -> Result<()> {
    let store = options.store().await?;
    if !store.request_kill(description, killer).await? {
        bail!("'{description}' is not building");
    }
    println!("✓ Kill requested for '{description}'");
    Ok(())
}

pub async fn restart(options: &StoreOptions, machine: &str) -> Result<()> {
    let store = options.store().await?;
    if !store.request_restart(machine).await? {
        bail!("No live agent on '{machine}'");
    }
    println!("✓ Restart requested for {machine}");
    Ok(())
}

pub async fn agents(options: &StoreOptions, json: bool) -> Result<()> {
    let store = options.store().await?;
    let agents = store.list_agents().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&agents)?);
        return Ok(());
    }

    if agents.is_empty() {
        println!("No agents registered");
        return Ok(());
    }

    println!("{:<20} {:<12} {:<20} {:<20}", "MACHINE", "STATE", "STARTED", "HEARTBEAT");
    for agent in agents.iter().filter(|a| a.ended_at.is_none()) {
        println!(
            "{:<20} {:<12} {:<20} {:<20}{}",
            agent.machine,
            agent.state.as_str(),
            agent.started_at.format("%Y-%m-%d %H:%M:%S"),
            agent.heartbeat_at.format("%Y-%m-%d %H:%M:%S"),
            if agent.restart { "  (restart pending)" } else { "" }
        );
    }
    Ok(())
}
