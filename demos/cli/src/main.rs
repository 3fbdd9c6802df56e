use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use stitch_core::{ReferenceMaps, StitchConfig};
use stitch_fhir::stitch_record_str;

#[derive(Parser, Debug)]
#[command(
    name = "stitch-cli",
    about = "Ghép hồ sơ bệnh nhân MIMIC theo từng đợt điều trị."
)]
struct Args {
    /// Đường dẫn tới file JSON hồ sơ bệnh nhân.
    #[arg(short, long)]
    input: PathBuf,
    /// File NDJSON MimicLocation để tra tên vị trí.
    #[arg(long)]
    locations: Option<PathBuf>,
    /// File NDJSON MimicMedication để tra tên thuốc.
    #[arg(long)]
    medications: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let data = std::fs::read_to_string(&args.input)
        .with_context(|| format!("Không đọc được file {:?}", args.input))?;

    let maps = ReferenceMaps {
        locations: match &args.locations {
            Some(path) => location_map(&load_ndjson(path)?),
            None => HashMap::new(),
        },
        medications: match &args.medications {
            Some(path) => medication_map(&load_ndjson(path)?),
            None => HashMap::new(),
        },
    };

    let config = StitchConfig::default();
    let stitched = stitch_record_str(&data, &maps, &config)?;

    if let Some(patient_id) = &stitched.patient_id {
        println!("Patient: {patient_id}");
    }
    println!("Encounters: {}", stitched.encounters.len());
    for bundle in stitched.encounters() {
        println!(
            "- {} [{}] {} .. {}: {} conditions, {} procedures, {} med requests, {} vitals, {} labs, {} documents",
            bundle.id,
            bundle.class.as_deref().unwrap_or("?"),
            bundle
                .period_start
                .map(|start| start.to_string())
                .unwrap_or_else(|| "?".to_string()),
            bundle
                .period_end
                .map(|end| end.to_string())
                .unwrap_or_else(|| "?".to_string()),
            bundle.conditions.len(),
            bundle.procedures.len(),
            bundle.medication_requests.len(),
            bundle.vitals.len(),
            bundle.labs.len(),
            bundle.documents.len(),
        );
    }

    Ok(())
}

fn load_ndjson(path: &Path) -> anyhow::Result<Vec<Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Không đọc được file {path:?}"))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).with_context(|| format!("Dòng NDJSON không hợp lệ trong {path:?}"))
        })
        .collect()
}

fn location_map(rows: &[Value]) -> HashMap<String, String> {
    rows.iter()
        .filter_map(|row| {
            let id = row.get("id").and_then(Value::as_str)?;
            let name = row.get("name").and_then(Value::as_str)?;
            Some((id.to_string(), name.to_string()))
        })
        .collect()
}

fn medication_map(rows: &[Value]) -> HashMap<String, String> {
    rows.iter()
        .filter_map(|row| {
            let id = row.get("id").and_then(Value::as_str)?;
            let name = medication_display_name(row)?;
            Some((id.to_string(), name))
        })
        .collect()
}

/// The display name lives in the identifier entry whose system carries the
/// mimic-medication-name marker.
fn medication_display_name(row: &Value) -> Option<String> {
    let identifiers = row.get("identifier").and_then(Value::as_array)?;
    identifiers.iter().find_map(|identifier| {
        let system = identifier.get("system").and_then(Value::as_str)?;
        if !system.contains("mimic-medication-name") {
            return None;
        }
        identifier
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}
