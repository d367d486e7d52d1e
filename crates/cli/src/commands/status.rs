//! Status of a running descheduler

use anyhow::Result;
use descheduler_lib::{ComponentStatus, HealthResponse, RunSummary};
use serde::Serialize;
use tabled::Tabled;

use super::simulate::print_summary;
use crate::client::ApiClient;
use crate::output::{color_status, print_json, print_table, print_warning, OutputFormat};

#[derive(Serialize)]
struct Status {
    health: HealthResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_cycle: Option<RunSummary>,
}

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

fn status_str(status: ComponentStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Show component health and the summary of the last completed cycle
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let (_, health): (_, HealthResponse) = client.fetch_json("healthz").await?;
    let (code, summary): (_, serde_json::Value) = client.fetch_json("api/v1/summary").await?;
    let last_cycle = if code.is_success() {
        Some(serde_json::from_value::<RunSummary>(summary)?)
    } else {
        None
    };

    match format {
        OutputFormat::Json => print_json(&Status { health, last_cycle })?,
        OutputFormat::Table => {
            println!("Descheduler: {}", color_status(&status_str(health.status)));

            let mut components: Vec<_> = health.components.iter().collect();
            components.sort_by(|a, b| a.0.cmp(b.0));
            let rows = components
                .into_iter()
                .map(|(name, component)| ComponentRow {
                    name: name.clone(),
                    status: color_status(&status_str(component.status)),
                    message: component.message.clone().unwrap_or_default(),
                })
                .collect();
            print_table(rows, "No components registered");

            match &last_cycle {
                Some(summary) => print_summary(summary),
                None => print_warning("No descheduling cycle has completed yet"),
            }
        }
    }
    Ok(())
}
