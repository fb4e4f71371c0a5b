//! Standalone binary to validate orchestrator configuration files.
//! Used by CI to catch bad thresholds and duplicate services before deploy.
//!
//! Usage: `validate-config [--status] <file>...`
//!
//! With `--status` each valid file is also used to start a backend manager, and its initial
//! status is printed as JSON.

use anyhow::{bail, Context};
use backend_orchestrator::{BackendConfig, BackendManager};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("warn".parse()?),
        )
        .try_init();

    let mut show_status = false;
    let mut files = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--status" => show_status = true,
            _ => files.push(PathBuf::from(arg)),
        }
    }
    if files.is_empty() {
        if let Ok(path) = std::env::var("BACKEND_CONFIG") {
            files.push(PathBuf::from(path));
        }
    }
    if files.is_empty() {
        bail!("usage: validate-config [--status] <file>... (or set BACKEND_CONFIG)");
    }

    let mut errors = Vec::new();
    println!("=== Validating Configuration ===");
    for path in &files {
        print!("{}... ", path.display());
        let config = match BackendConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                println!("❌");
                errors.push(format!("  {}: {}", path.display(), e));
                continue;
            }
        };
        println!("✅ {} service(s)", config.services.len());
        for warning in config.warnings() {
            println!("  ⚠ {}", warning);
        }

        if show_status {
            let manager = BackendManager::new(config)
                .with_context(|| format!("building manager from {}", path.display()))?;
            manager.initialize().await?;
            let status = serde_json::to_string_pretty(&manager.status())?;
            println!("{}", status);
            manager.shutdown().await?;
        }
    }

    println!("\n=== Summary ===");
    if errors.is_empty() {
        println!("✅ All configuration files are valid!");
        Ok(())
    } else {
        println!("❌ Found {} invalid file(s):\n", errors.len());
        for err in &errors {
            println!("{}", err);
        }
        std::process::exit(1);
    }
}
