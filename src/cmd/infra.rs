//! Infrastructure lifecycle commands (`shipyard infra`).

use anyhow::{Context, Result};

use shipyard::config::ShipyardConfig;
use shipyard::infra::InfraLifecycleManager;

use super::super::InfraCommands;

pub async fn cmd_infra(config: &ShipyardConfig, command: InfraCommands) -> Result<()> {
    let manager = InfraLifecycleManager::from_config(config);

    match command {
        InfraCommands::Status { project } => {
            let status = manager.status(&project)?;
            println!();
            let title = format!("Infrastructure - {}", project);
            println!("{}", title);
            println!("{}", "=".repeat(title.len()));
            println!();
            println!(
                "Authoritative location: {}",
                status.authoritative.as_deref().unwrap_or("(none)")
            );
            for loc in &status.locations {
                println!();
                println!("[{}] {}", loc.location, loc.path.display());
                println!("  state:       {}", if loc.has_state { "yes" } else { "no" });
                println!("  artifacts:   {}", if loc.has_artifacts { "yes" } else { "no" });
                if loc.placeholder {
                    println!("  placeholder: yes");
                }
                for resource in &loc.resources {
                    println!("  - {}", resource);
                }
            }
        }
        InfraCommands::Destroy { project } => {
            let report = manager.destroy_existing(&project).await?;
            if report.destroyed {
                println!(
                    "Destroyed {} resource(s) in {}",
                    report.resources_destroyed.len(),
                    report.locations.join(", ")
                );
                for resource in &report.resources_destroyed {
                    println!("  - {}", resource);
                }
            } else {
                println!("No infrastructure state found for {}", project);
            }
        }
        InfraCommands::Provision { project, source } => {
            let code = std::fs::read_to_string(&source)
                .with_context(|| format!("Failed to read {}", source.display()))?;
            let report = match manager.provision(&project, &code).await {
                Ok(report) => report,
                Err(e) => {
                    for line in e.logs() {
                        eprintln!("{}", line);
                    }
                    return Err(e.into());
                }
            };
            if report.cleanup.destroyed {
                println!(
                    "Destroyed {} previous resource(s)",
                    report.cleanup.resources_destroyed.len()
                );
            }
            println!("Provisioned {}", project);
            for (name, value) in report.resources.redacted() {
                println!("  {} = {}", name, value);
            }
        }
    }

    Ok(())
}
