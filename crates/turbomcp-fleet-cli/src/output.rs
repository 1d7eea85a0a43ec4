//! Human and JSON output

use comfy_table::{Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use owo_colors::OwoColorize;
use serde::Serialize;
use std::time::Duration;
use turbomcp_fleet::{
    CircuitState, Event, HealthStatus, ServerConfig, ServerState, ServerStatusReport,
};

/// Renders command results
#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    json: bool,
    colored: bool,
}

impl Formatter {
    /// Formatter printing JSON when `json` is set, ANSI colors when `colored`
    #[must_use]
    pub fn new(json: bool, colored: bool) -> Self {
        Self { json, colored }
    }

    /// Whether output is JSON
    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Print any serializable value as pretty JSON
    pub fn display_json<T: Serialize + ?Sized>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    /// Print the registered servers
    pub fn display_servers(&self, servers: &[ServerConfig]) -> anyhow::Result<()> {
        if self.json {
            return self.display_json(servers);
        }
        if servers.is_empty() {
            self.print_info("No servers registered");
            return Ok(());
        }

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec!["Name", "Id", "Kind", "Enabled", "Target"]);
        for server in servers {
            table.add_row(vec![
                server.name.clone(),
                server.id.clone(),
                server.kind().to_string(),
                if server.enabled { "yes" } else { "no" }.to_string(),
                server.connection.target(),
            ]);
        }
        println!("{table}");
        Ok(())
    }

    /// Print a status summary table for several servers
    pub fn display_statuses(&self, reports: &[ServerStatusReport]) -> anyhow::Result<()> {
        if self.json {
            return self.display_json(reports);
        }
        if reports.is_empty() {
            self.print_info("No servers registered");
            return Ok(());
        }

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec!["Name", "State", "Circuit", "Errors", "Quarantine", "Last error"]);
        for report in reports {
            table.add_row(vec![
                report.name.clone(),
                report.state.to_string(),
                report.circuit.state.to_string(),
                report.errors.consecutive_errors.to_string(),
                report
                    .quarantine_remaining
                    .map_or_else(|| "-".to_string(), format_duration),
                report
                    .errors
                    .last_error_category
                    .map_or_else(|| "-".to_string(), |c| c.to_string()),
            ]);
        }
        println!("{table}");
        Ok(())
    }

    /// Print the full status of one server
    pub fn display_status(&self, report: &ServerStatusReport) -> anyhow::Result<()> {
        if self.json {
            return self.display_json(report);
        }

        self.print_header(&format!("{} ({})", report.name, report.id));
        self.print_kv("Kind", &report.kind.to_string());
        self.print_kv("Target", &report.target);
        self.print_kv("Enabled", if report.enabled { "yes" } else { "no" });
        self.print_kv("State", &self.paint_state(report.state));
        self.print_kv(
            "Uptime",
            &report.uptime.map_or_else(|| "-".to_string(), format_duration),
        );
        self.print_kv("Circuit", &self.paint_circuit(report.circuit.state));
        self.print_kv("Circuit trips", &report.circuit.trips.to_string());
        self.print_kv("Total errors", &report.errors.total_errors.to_string());
        self.print_kv(
            "Consecutive errors",
            &report.errors.consecutive_errors.to_string(),
        );
        self.print_kv("Quarantines", &report.errors.quarantine_count.to_string());
        if let Some(remaining) = report.quarantine_remaining {
            self.print_kv("Quarantined for", &format_duration(remaining));
        }
        if let (Some(category), Some(message)) =
            (report.errors.last_error_category, &report.errors.last_error)
        {
            self.print_kv("Last error", &format!("[{category}] {message}"));
        }
        for problem in &report.config_errors {
            self.print_kv("Config error", problem);
        }
        if let Some(hint) = report.hint {
            self.print_kv("Hint", hint);
        }
        if let Some(sample) = &report.last_health {
            let outcome = if sample.healthy { "healthy" } else { "unhealthy" };
            self.print_kv(
                "Last probe",
                &format!("{outcome} in {}ms", sample.latency.as_millis()),
            );
        }
        if report.retries.total_retries > 0 {
            self.print_kv(
                "Retries",
                &format!(
                    "{} ({} recovered, {} exhausted)",
                    report.retries.total_retries,
                    report.retries.successful_retries,
                    report.retries.failed_retries
                ),
            );
        }
        Ok(())
    }

    /// Print the outcome of an ad-hoc probe
    pub fn display_health(&self, name: &str, health: &HealthStatus) -> anyhow::Result<()> {
        if self.json {
            return self.display_json(health);
        }

        let sample = &health.sample;
        if sample.healthy {
            let line = format!(
                "{name}: healthy ({} in {}ms)",
                sample.probe_kind,
                sample.latency.as_millis()
            );
            if self.colored {
                println!("{}", line.bright_green());
            } else {
                println!("{line}");
            }
        } else {
            let line = format!(
                "{name}: unhealthy ({} after {}ms)",
                sample.probe_kind,
                sample.latency.as_millis()
            );
            if self.colored {
                println!("{}", line.bright_red());
            } else {
                println!("{line}");
            }
            if let Some(category) = sample.category {
                self.print_kv("Category", category.as_str());
                self.print_kv("Hint", category.hint());
            }
            if let Some(error) = &sample.error {
                self.print_kv("Error", error);
            }
        }
        self.print_kv("State", &self.paint_state(health.state));
        self.print_kv("Circuit", &self.paint_circuit(health.circuit_state));
        if let Some(remaining) = health.quarantine_remaining {
            self.print_kv("Quarantined for", &format_duration(remaining));
        }
        Ok(())
    }

    /// Print events, oldest first
    pub fn display_events(&self, events: &[Event]) -> anyhow::Result<()> {
        if self.json {
            return self.display_json(events);
        }
        for event in events {
            self.print_event(event);
        }
        Ok(())
    }

    /// Print one event line
    pub fn print_event(&self, event: &Event) {
        let time = event.timestamp.format("%Y-%m-%d %H:%M:%S");
        let details = serde_json::Value::Object(event.details.clone());
        if self.colored {
            println!(
                "{} {:<13} {}",
                time.bright_black(),
                event.event_type.to_string().bright_blue(),
                details
            );
        } else {
            println!("{time} {:<13} {details}", event.event_type.to_string());
        }
    }

    pub fn print_success(&self, text: &str) {
        if self.json {
            return;
        }
        if self.colored {
            println!("{} {}", "✓".bright_green(), text);
        } else {
            println!("{text}");
        }
    }

    pub fn print_info(&self, text: &str) {
        if self.colored {
            println!("{}", text.bright_blue());
        } else {
            println!("{text}");
        }
    }

    fn print_header(&self, text: &str) {
        if self.colored {
            println!("\n{}", text.bright_cyan().bold());
            println!("{}", "=".repeat(text.len()).bright_cyan());
        } else {
            println!("\n{text}");
            println!("{}", "=".repeat(text.len()));
        }
    }

    fn print_kv(&self, key: &str, value: &str) {
        if self.colored {
            println!("  {}: {}", key.bright_green().bold(), value);
        } else {
            println!("  {key}: {value}");
        }
    }

    fn paint_state(&self, state: ServerState) -> String {
        if !self.colored {
            return state.to_string();
        }
        match state {
            ServerState::Running => state.bright_green().to_string(),
            ServerState::Error | ServerState::Quarantined => state.bright_red().to_string(),
            _ => state.yellow().to_string(),
        }
    }

    fn paint_circuit(&self, state: CircuitState) -> String {
        if !self.colored {
            return state.to_string();
        }
        match state {
            CircuitState::Closed => state.bright_green().to_string(),
            CircuitState::HalfOpen => state.yellow().to_string(),
            CircuitState::Open => state.bright_red().to_string(),
        }
    }
}

/// `1h 2m 3s` style rendering, second precision
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (hours, minutes) {
        (0, 0) => format!("{seconds}s"),
        (0, _) => format!("{minutes}m {seconds}s"),
        _ => format!("{hours}h {minutes}m {seconds}s"),
    }
}
