//! CLI handlers for workflow instance commands.
//!
//! Every handler has a JSON branch (`--json`) printing the serialized result
//! and a styled branch for terminals.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;

use phasegate_types::gate::{Decision, ResumeSignal};
use phasegate_types::workflow::{InstanceId, InstanceStatus, StatusReport, WorkflowState};

use crate::state::AppState;

/// Resolve the initial input from `--input` or `--input-file`.
///
/// No input at all yields an empty object.
pub async fn read_input(inline: Option<&str>, file: Option<&Path>) -> Result<Value> {
    let raw = match (inline, file) {
        (Some(raw), _) => raw.to_string(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read input file {}", path.display()))?,
        (None, None) => return Ok(Value::Object(serde_json::Map::new())),
    };
    parse_json_object(&raw, "input")
}

fn parse_json_object(raw: &str, what: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("Invalid JSON {what}"))?;
    if !value.is_object() {
        bail!("The {what} must be a JSON object");
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Start / resume / cancel
// ---------------------------------------------------------------------------

pub async fn start(
    state: &AppState,
    instance_id: Option<String>,
    input: Value,
    json: bool,
) -> Result<()> {
    let instance_id = instance_id
        .map(InstanceId::new)
        .unwrap_or_else(|| InstanceId::new(uuid::Uuid::now_v7().to_string()));

    let result = state
        .engine
        .start(instance_id.clone(), input)
        .await
        .with_context(|| format!("Failed to start instance '{instance_id}'"))?;

    report_after_drive(state, &result, "Started", json).await
}

pub async fn resume(
    state: &AppState,
    instance_id: String,
    decision: Decision,
    gate: Option<String>,
    payload: Option<&str>,
    json: bool,
) -> Result<()> {
    let mut signal = ResumeSignal::new(InstanceId::new(instance_id), decision);
    if let Some(gate) = gate {
        signal = signal.for_gate(gate);
    }
    if let Some(raw) = payload {
        let payload: Value = serde_json::from_str(raw).context("Invalid JSON payload")?;
        signal = signal.with_payload(payload);
    }

    let instance_id = signal.instance_id.clone();
    let result = state
        .engine
        .resume(signal)
        .await
        .with_context(|| format!("Failed to resume instance '{instance_id}'"))?;

    report_after_drive(state, &result, "Resumed", json).await
}

pub async fn cancel(state: &AppState, instance_id: String, reason: &str, json: bool) -> Result<()> {
    let instance_id = InstanceId::new(instance_id);
    let result = state
        .engine
        .cancel(&instance_id, reason)
        .await
        .with_context(|| format!("Failed to cancel instance '{instance_id}'"))?;

    report_after_drive(state, &result, "Cancelled", json).await
}

/// Print the status an instance settled in after the engine drove it.
async fn report_after_drive(
    state: &AppState,
    result: &WorkflowState,
    verb: &str,
    json: bool,
) -> Result<()> {
    let report = state.engine.status(&result.instance_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {verb} instance '{}'",
        style("*").green().bold(),
        style(&report.instance_id).cyan()
    );
    print_report(&report);
    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn status(state: &AppState, instance_id: String, json: bool) -> Result<()> {
    let instance_id = InstanceId::new(instance_id);
    let report = state
        .engine
        .status(&instance_id)
        .await
        .with_context(|| format!("Failed to load instance '{instance_id}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("  Instance: {}", style(&report.instance_id).cyan().bold());
    print_report(&report);
    Ok(())
}

fn print_report(report: &StatusReport) {
    println!("  Status:   {}", styled_status(report.status));
    println!("  Phase:    {}", report.phase);
    println!("  Sequence: {}", report.sequence_no);
    println!(
        "  Updated:  {}",
        report.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    if let Some(interrupt) = &report.interrupt {
        println!();
        println!(
            "  {} Waiting on gate '{}'",
            style("?").yellow().bold(),
            style(&interrupt.gate_name).yellow()
        );
        println!("  {}", interrupt.question);
        let decisions: Vec<&str> = interrupt.allowed_decisions.iter().map(|d| d.as_str()).collect();
        println!("  Allowed:  {}", decisions.join(", "));
        println!(
            "  Answer with: {}",
            style(format!(
                "pgate resume {} --decision <{}> --gate {}",
                report.instance_id,
                decisions.join("|"),
                interrupt.gate_name
            ))
            .dim()
        );
    }

    if let Some(artifacts) = &report.artifacts {
        println!();
        println!("  Artifacts:");
        for (phase, payload) in artifacts {
            println!("    {}: {}", style(phase).cyan(), truncate(&payload.to_string(), 80));
        }
    }

    if !report.blocking_issues.is_empty() {
        println!();
        println!("  Blocking issues:");
        for issue in &report.blocking_issues {
            let marker = if issue.is_open() {
                style("x").red().bold()
            } else {
                style("-").dim()
            };
            println!(
                "    {marker} #{} {} ({:?}, attempt {}): {}",
                issue.id, issue.operation, issue.kind, issue.attempt, issue.message
            );
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list(state: &AppState, status: Option<InstanceStatus>, json: bool) -> Result<()> {
    let instances = state.engine.list(status).await.context("Failed to list instances")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!("  No workflow instances found.");
        println!("  Start one with: {}", style("pgate start --input '{...}'").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Instance").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Phase"),
            Cell::new("Seq"),
            Cell::new("Updated"),
        ]);

    for summary in &instances {
        table.add_row(vec![
            Cell::new(&summary.instance_id),
            Cell::new(summary.status).fg(status_color(summary.status)),
            Cell::new(summary.phase),
            Cell::new(summary.sequence_no),
            Cell::new(summary.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

pub async fn history(
    state: &AppState,
    instance_id: String,
    limit: u32,
    at: Option<u64>,
    json: bool,
) -> Result<()> {
    let instance_id = InstanceId::new(instance_id);

    if let Some(sequence_no) = at {
        let checkpoint = state
            .engine
            .checkpoint_at(&instance_id, sequence_no)
            .await
            .with_context(|| format!("Failed to load checkpoint {sequence_no} of '{instance_id}'"))?;
        // A single checkpoint is always printed in full.
        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        return Ok(());
    }

    let checkpoints = state
        .engine
        .checkpoints(&instance_id, limit)
        .await
        .with_context(|| format!("Failed to load history of '{instance_id}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&checkpoints)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Seq").fg(Color::Cyan),
            Cell::new("Phase"),
            Cell::new("Status"),
            Cell::new("Loop"),
            Cell::new("Last event"),
            Cell::new("Saved"),
        ]);

    for checkpoint in &checkpoints {
        let status = checkpoint.state.status();
        let last_event = checkpoint
            .state
            .history
            .last()
            .map(|entry| format!("{:?}", entry.event))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(checkpoint.sequence_no),
            Cell::new(checkpoint.state.phase),
            Cell::new(status).fg(status_color(status)),
            Cell::new(checkpoint.state.loop_counter),
            Cell::new(last_event),
            Cell::new(checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("  History of {}", style(&instance_id).cyan().bold());
    println!("{table}");
    println!(
        "  Inspect one: {}",
        style(format!("pgate history {instance_id} --at <seq>")).dim()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Recover
// ---------------------------------------------------------------------------

pub async fn recover(state: &AppState, instance_id: Option<String>, json: bool) -> Result<()> {
    let recovered = match instance_id {
        Some(id) => {
            let id = InstanceId::new(id);
            vec![
                state
                    .engine
                    .recover(&id)
                    .await
                    .with_context(|| format!("Failed to recover instance '{id}'"))?,
            ]
        }
        None => state
            .engine
            .recover_all()
            .await
            .context("Failed to recover instances")?,
    };

    if json {
        let out: Vec<_> = recovered
            .iter()
            .map(|s| {
                serde_json::json!({
                    "instance_id": s.instance_id,
                    "phase": s.phase,
                    "status": s.status(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if recovered.is_empty() {
        println!("  No interrupted instances to recover.");
    }
    for s in &recovered {
        println!(
            "  {} {} now {} at {}",
            style("*").green().bold(),
            style(&s.instance_id).cyan(),
            styled_status(s.status()),
            s.phase
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn status_color(status: InstanceStatus) -> Color {
    match status {
        InstanceStatus::Running => Color::Blue,
        InstanceStatus::AwaitingInput => Color::Yellow,
        InstanceStatus::Complete => Color::Green,
        InstanceStatus::Failed => Color::Red,
    }
}

fn styled_status(status: InstanceStatus) -> console::StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        InstanceStatus::Running => s.blue(),
        InstanceStatus::AwaitingInput => s.yellow(),
        InstanceStatus::Complete => s.green(),
        InstanceStatus::Failed => s.red().bold(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_input_is_empty_object() {
        let value = read_input(None, None).await.unwrap();
        assert_eq!(value, serde_json::json!({}));
    }

    #[tokio::test]
    async fn input_must_be_an_object() {
        assert!(read_input(Some("[1, 2]"), None).await.is_err());
        assert!(read_input(Some("not json"), None).await.is_err());
        let value = read_input(Some(r#"{"topic": "sales"}"#), None).await.unwrap();
        assert_eq!(value["topic"], "sales");
    }

    #[tokio::test]
    async fn input_file_is_read() {
        let dir = std::env::temp_dir().join(format!("pgate-input-{}", uuid::Uuid::now_v7()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("input.json");
        tokio::fs::write(&path, r#"{"dataset": "q3"}"#).await.unwrap();

        let value = read_input(None, Some(&path)).await.unwrap();
        assert_eq!(value["dataset"], "q3");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééééé", 6), "ééé...");
    }
}
