//! Styled terminal output for the outbox CLI

use crate::json_output::{CapabilityJson, OperationJson, PlanStepJson, PolicyJson, QueueJson};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use outbox_types::CapabilityTier;
use std::time::Duration;

/// Spinner shown while sampling; `None` in quiet mode
pub fn create_spinner(quiet: bool, message: &str) -> Option<ProgressBar> {
    if quiet {
        return None;
    }

    let pb = ProgressBar::new_spinner();
    if let Ok(spinner) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(spinner);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

fn operation_line(op: &OperationJson) -> String {
    let target = match &op.entity_id {
        Some(id) => format!("{} {}", op.entity_type, id),
        None => op.entity_type.clone(),
    };
    let mut line = format!(
        "{:>5}  {:<7} {:<24} {}",
        style(format!("#{}", op.id)).bold(),
        op.kind.to_string(),
        style(target).cyan(),
        style(&op.method).dim()
    );
    if let Some(dep) = op.depends_on {
        line.push_str(&format!("  after #{}", dep));
    }
    if op.attempts > 0 {
        line.push_str(&format!(
            "  {}",
            style(format!("{} attempts", op.attempts)).yellow()
        ));
    }
    line
}

/// Print the queue contents
pub fn display_queue(queue: &QueueJson) {
    if queue.operations.is_empty() {
        println!("{} Queue is empty", style("✓").green());
        return;
    }

    println!(
        "{} {} pending operations",
        style("→").green().bold(),
        style(queue.length).bold()
    );
    for op in &queue.operations {
        println!("{}", operation_line(op));
        println!(
            "        queued {} ago",
            format_duration(age(op.created_at))
        );
    }
}

/// Print the replay order
pub fn display_plan(steps: &[PlanStepJson]) {
    if steps.is_empty() {
        println!("{} Nothing to replay", style("✓").green());
        return;
    }

    println!("{}", style("Replay order:").bold().underlined());
    for step in steps {
        let marker = if step.syncable {
            style(format!("{:>3}.", step.position)).green()
        } else {
            style(format!("{:>3}.", step.position)).dim()
        };
        print!("{} {}", marker, operation_line(&step.operation));
        if step.syncable {
            println!();
        } else {
            println!("  {}", style("(skipped by policy)").yellow());
        }
    }
}

/// Print a capability sample
pub fn display_capability(report: &CapabilityJson) {
    let snapshot = &report.snapshot;
    let strategy = &report.strategy;

    println!();
    println!("{}", style("Device Capabilities").bold().underlined());
    println!("  CPU cores: {}", style(snapshot.cpu_cores).cyan());
    println!("  Memory: {}", style(format_bytes(snapshot.memory_bytes)).cyan());
    println!(
        "  Network: {:?} ({:?}){}",
        snapshot.network_type,
        snapshot.network_quality,
        if snapshot.online { "" } else { ", offline" }
    );
    match snapshot.battery_level {
        Some(level) => println!(
            "  Battery: {:.0}%{}",
            level * 100.0,
            if snapshot.charging { ", charging" } else { "" }
        ),
        None => println!("  Battery: none"),
    }
    println!("  Tier: {}", tier_style(report.tier));

    println!();
    println!("{}", style("Adaptation Strategy").bold().underlined());
    println!("  Max batch size: {}", style(strategy.max_batch_size).green());
    println!("  Cache budget: {}", format_bytes(strategy.cache_budget));
    println!("  Workers: {}", strategy.worker_count);
    println!(
        "  Polling interval: {}",
        format_duration(strategy.polling_interval)
    );
    println!("  Compression level: {}", strategy.compression_level.get());
    let features = [
        ("background sync", strategy.features.background_sync),
        ("prefetch", strategy.features.prefetch),
        ("compression", strategy.features.compression),
        ("realtime updates", strategy.features.realtime_updates),
    ];
    for (name, enabled) in features {
        let mark = if enabled {
            style("on").green()
        } else {
            style("off").dim()
        };
        println!("    • {}: {}", name, mark);
    }
}

fn tier_style(tier: CapabilityTier) -> console::StyledObject<String> {
    let text = tier.to_string();
    match tier {
        CapabilityTier::High => style(text).green().bold(),
        CapabilityTier::Medium => style(text).cyan().bold(),
        CapabilityTier::Low => style(text).yellow().bold(),
        CapabilityTier::Minimal => style(text).red().bold(),
    }
}

/// Print the selective-sync policy
pub fn display_policy(report: &PolicyJson) {
    let policy = &report.policy;
    println!("{}", style("Selective Sync").bold().underlined());
    println!(
        "  Sync: {}",
        if policy.enabled {
            style("enabled").green()
        } else {
            style("disabled").red()
        }
    );
    println!(
        "  Undeclared types: {}",
        if policy.default_enabled { "sync" } else { "skip" }
    );
    println!("  Compress: {}", policy.transfer.compress);
    if let Some(size) = policy.transfer.max_batch_size {
        println!("  Max batch size: {}", size);
    }

    if policy.rules.is_empty() {
        return;
    }
    println!("  Entity types:");
    for (entity_type, rule) in &policy.rules {
        let syncable = report
            .syncable
            .get(entity_type.as_str())
            .copied()
            .unwrap_or(rule.enabled);
        let state = if syncable {
            style("sync").green()
        } else if rule.enabled {
            style("blocked by dependency").yellow()
        } else {
            style("disabled").dim()
        };
        let mut line = format!("    • {}: {}", style(entity_type).cyan(), state);
        if rule.required {
            line.push_str(" (required)");
        }
        if !rule.depends_on.is_empty() {
            let deps: Vec<&str> = rule.depends_on.iter().map(|dep| dep.as_str()).collect();
            line.push_str(&format!(" depends on {}", deps.join(", ")));
        }
        println!("{}", line);
    }
}

fn age(since: chrono::DateTime<chrono::Utc>) -> Duration {
    (chrono::Utc::now() - since).to_std().unwrap_or_default()
}

/// Human readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Human readable duration
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{:.2}s", duration.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
