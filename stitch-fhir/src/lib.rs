//! MIMIC-on-FHIR collections to per-encounter `EncounterBundle` stitcher.

use std::collections::HashSet;
use std::hash::Hash;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use stitch_core::{
    classify_group_label, format_magnitude, format_scalar_text, ConditionRow, DocumentRow,
    EncounterBundle, LabRow, LocationStay, MeasurementClass, MeasurementRow,
    MedicationAdministrationRow, MedicationDispenseRow, MedicationRequestRow, MicrobiologyRow,
    ProcedureRow, ReferenceMaps, StitchConfig, StitchError, StitchedRecord,
};

/// Stitch a patient record from a JSON string.
pub fn stitch_record_str(
    record_json: &str,
    maps: &ReferenceMaps,
    config: &StitchConfig,
) -> Result<StitchedRecord, StitchError> {
    let value: Value =
        serde_json::from_str(record_json).map_err(|err| StitchError::Parse(err.to_string()))?;
    stitch_record_value(&value, maps, config)
}

/// Stitch a patient record from a `serde_json::Value`.
///
/// The value may be the upload envelope (`{"patient_id", "data": {..}}`) or
/// the bare collections object; absent collections count as empty.
pub fn stitch_record_value(
    record: &Value,
    maps: &ReferenceMaps,
    config: &StitchConfig,
) -> Result<StitchedRecord, StitchError> {
    let (patient_id, data) = split_envelope(record);
    if !data.is_object() {
        return Err(StitchError::MissingData);
    }

    let sources = SourceTables::from_record(data);
    let groups = build_encounter_groups(
        &sources.root_encounters,
        &sources.ed_encounters,
        &sources.icu_encounters,
    );

    let mut encounters = Vec::new();
    for group in &groups {
        // Sub-encounters must never surface as bundles, even if one slipped
        // past the grouping stage.
        if resolve_any(group.root, PART_OF).is_some() {
            continue;
        }
        encounters.push(build_bundle(group, &sources, maps, config));
    }

    Ok(StitchedRecord::new(patient_id, encounters))
}

fn split_envelope(record: &Value) -> (Option<String>, &Value) {
    match record.get("data") {
        Some(data) if data.is_object() => (
            record
                .get("patient_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            data,
        ),
        _ => (None, record),
    }
}

/// One step of a document path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seg {
    Key(&'static str),
    Idx(usize),
}

use Seg::{Idx, Key};

/// Walks `segs` through a document. Absent keys, wrong-typed intermediates,
/// out-of-range indices and JSON nulls all count as missing.
pub fn resolve<'a>(doc: &'a Value, segs: &[Seg]) -> Option<&'a Value> {
    let mut current = doc;
    for seg in segs {
        current = match seg {
            Key(key) => current.get(key)?,
            Idx(index) => current.get(index)?,
        };
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Returns the first alternative path that resolves to a non-missing value.
pub fn resolve_any<'a>(doc: &'a Value, alternatives: &[&[Seg]]) -> Option<&'a Value> {
    alternatives.iter().find_map(|segs| resolve(doc, segs))
}

fn text_at(doc: &Value, alternatives: &[&[Seg]]) -> Option<String> {
    resolve_any(doc, alternatives)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn timestamp_at(doc: &Value, alternatives: &[&[Seg]]) -> Option<DateTime<Utc>> {
    resolve_any(doc, alternatives)
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
}

/// Tolerant timestamp parser; unparseable input is simply missing.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Display form of a scalar value: numbers through the magnitude formatter,
/// numeric-looking strings likewise, everything else verbatim.
fn scalar_display(value: &Value) -> String {
    match value {
        Value::Number(number) => number
            .as_f64()
            .map(format_magnitude)
            .unwrap_or_else(|| number.to_string()),
        Value::String(text) => format_scalar_text(text),
        other => other.to_string(),
    }
}

// Foreign-key candidates and field paths, each in its nested and flattened
// encoding where the source data is known to carry both.
const PART_OF: &[&[Seg]] = &[&[Key("partOf"), Key("reference")], &[Key("partOf.reference")]];
const ENCOUNTER_REF: &[&[Seg]] = &[
    &[Key("encounter"), Key("reference")],
    &[Key("encounter.reference")],
];
const CONTEXT_REF: &[&[Seg]] = &[
    &[Key("context"), Key("reference")],
    &[Key("context.reference")],
];
const MEASUREMENT_REF: &[&[Seg]] = &[
    &[Key("encounter"), Key("reference")],
    &[Key("encounter.reference")],
    &[Key("context"), Key("reference")],
    &[Key("context.reference")],
];
const DOCUMENT_CONTEXT: &[&[Seg]] = &[
    &[Key("context"), Key("encounter")],
    &[Key("context.encounter")],
];
const PERIOD_START: &[&[Seg]] = &[&[Key("period"), Key("start")], &[Key("period.start")]];
const PERIOD_END: &[&[Seg]] = &[&[Key("period"), Key("end")], &[Key("period.end")]];
const CODE_DISPLAY: &[&[Seg]] = &[
    &[Key("code.coding"), Idx(0), Key("display")],
    &[Key("code"), Key("coding"), Idx(0), Key("display")],
];
const CODE_CODE: &[&[Seg]] = &[
    &[Key("code.coding"), Idx(0), Key("code")],
    &[Key("code"), Key("coding"), Idx(0), Key("code")],
];
const CLASS_DISPLAY: &[&[Seg]] = &[&[Key("class"), Key("display")], &[Key("class.display")]];
const ADMIT_SOURCE: &[&[Seg]] = &[
    &[Key("hospitalization"), Key("admitSource"), Key("coding"), Idx(0), Key("code")],
    &[Key("hospitalization.admitSource.coding"), Idx(0), Key("code")],
];
const DISCHARGE_DISPOSITION: &[&[Seg]] = &[
    &[Key("hospitalization"), Key("dischargeDisposition"), Key("coding"), Idx(0), Key("code")],
    &[Key("hospitalization.dischargeDisposition.coding"), Idx(0), Key("code")],
];
const LOCATION_REF: &[&[Seg]] = &[
    &[Key("location"), Key("reference")],
    &[Key("location.reference")],
];
const MEDICATION_REF: &[&[Seg]] = &[
    &[Key("medicationReference"), Key("reference")],
    &[Key("medicationReference.reference")],
];
const MED_CODED_DISPLAY: &[&[Seg]] = &[
    &[Key("medicationCodeableConcept.coding"), Idx(0), Key("display")],
    &[Key("medicationCodeableConcept"), Key("coding"), Idx(0), Key("display")],
];
const MED_CODED_CODE: &[&[Seg]] = &[
    &[Key("medicationCodeableConcept.coding"), Idx(0), Key("code")],
    &[Key("medicationCodeableConcept"), Key("coding"), Idx(0), Key("code")],
];
const VALIDITY_START: &[&[Seg]] = &[
    &[Key("dispenseRequest"), Key("validityPeriod"), Key("start")],
    &[Key("dispenseRequest.validityPeriod.start")],
];
const VALIDITY_END: &[&[Seg]] = &[
    &[Key("dispenseRequest"), Key("validityPeriod"), Key("end")],
    &[Key("dispenseRequest.validityPeriod.end")],
];
const DOSAGE_TEXT: &[&[Seg]] = &[&[Key("dosageInstruction"), Idx(0), Key("text")]];
const DOSAGE_ROUTE: &[&[Seg]] = &[&[
    Key("dosageInstruction"),
    Idx(0),
    Key("route"),
    Key("coding"),
    Idx(0),
    Key("code"),
]];
const DOSAGE_TIMING: &[&[Seg]] = &[&[
    Key("dosageInstruction"),
    Idx(0),
    Key("timing"),
    Key("code"),
    Key("coding"),
    Idx(0),
    Key("code"),
]];
const DOSE_VALUE: &[&[Seg]] = &[
    &[Key("dosage"), Key("dose"), Key("value")],
    &[Key("dosage.dose.value")],
];
const DOSE_UNIT: &[&[Seg]] = &[
    &[Key("dosage"), Key("dose"), Key("unit")],
    &[Key("dosage.dose.unit")],
];
const ADMIN_ROUTE: &[&[Seg]] = &[
    &[Key("dosage"), Key("method"), Key("coding"), Idx(0), Key("code")],
    &[Key("dosage.method.coding"), Idx(0), Key("code")],
];
const AUTHORED_ON: &[&[Seg]] = &[&[Key("authoredOn")]];
const WHEN_HANDED_OVER: &[&[Seg]] = &[&[Key("whenHandedOver")]];
const EFFECTIVE_DATE: &[&[Seg]] = &[&[Key("effectiveDateTime")]];
const PERFORMED_START: &[&[Seg]] = &[
    &[Key("performedDateTime")],
    &[Key("performedPeriod"), Key("start")],
    &[Key("performedPeriod.start")],
];
const PERFORMED_END: &[&[Seg]] = &[
    &[Key("performedPeriod"), Key("end")],
    &[Key("performedPeriod.end")],
];
const CATEGORY_LABEL: &[&[Seg]] = &[
    &[Key("category"), Idx(0), Key("coding"), Idx(0), Key("display")],
    &[Key("category"), Idx(0), Key("coding"), Idx(0), Key("code")],
];
const MICRO_VALUE_CONCEPT: &[&[Seg]] = &[
    &[Key("valueCodeableConcept.coding"), Idx(0), Key("display")],
    &[Key("valueCodeableConcept"), Key("coding"), Idx(0), Key("display")],
];
const REF_RANGE_LOW: &[&[Seg]] = &[&[Key("referenceRange"), Idx(0), Key("low"), Key("value")]];
const REF_RANGE_HIGH: &[&[Seg]] = &[&[Key("referenceRange"), Idx(0), Key("high"), Key("value")]];
const ATTACHMENT_TITLE: &[&[Seg]] =
    &[&[Key("content"), Idx(0), Key("attachment"), Key("title")]];
const ATTACHMENT_DATA: &[&[Seg]] = &[&[Key("content"), Idx(0), Key("attachment"), Key("data")]];
const DOCUMENT_DATE: &[&[Seg]] = &[&[Key("date")]];

// Collection union order is fixed; deduplication keeps the first row seen in
// this order.
const ROOT_ENCOUNTER_SOURCES: &[&str] = &["MimicEncounter", "MimicEncounterED"];
const ED_ENCOUNTER_SOURCES: &[&str] = &["MimicEncounterED"];
const ICU_ENCOUNTER_SOURCES: &[&str] = &["MimicEncounterICU"];
const CONDITION_SOURCES: &[&str] = &["MimicCondition", "MimicConditionED"];
const PROCEDURE_SOURCES: &[&str] = &["MimicProcedure", "MimicProcedureED", "MimicProcedureICU"];
const MED_REQUEST_SOURCES: &[&str] = &["MimicMedicationRequest"];
const MED_DISPENSE_SOURCES: &[&str] = &["MimicMedicationDispense", "MimicMedicationDispenseED"];
const MED_ADMIN_SOURCES: &[&str] = &[
    "MimicMedicationAdministration",
    "MimicMedicationAdministrationICU",
];
const MEASUREMENT_SOURCES: &[&str] = &[
    "MimicObservationVitalSignsED",
    "MimicObservationChartevents",
    "MimicObservationED",
    "MimicObservationOutputevents",
    "MimicObservationDatetimeevents",
];
const MICRO_SOURCES: &[&str] = &[
    "MimicObservationMicroSusc",
    "MimicObservationMicroTest",
    "MimicObservationMicroOrg",
];
const LAB_SOURCES: &[&str] = &["MimicObservationLabevents"];
const DOCUMENT_SOURCES: &[&str] = &["MimicDocumentReference"];

fn collection<'a>(data: &'a Value, name: &str) -> &'a [Value] {
    data.get(name)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn union<'a>(data: &'a Value, names: &[&str]) -> Vec<&'a Value> {
    names
        .iter()
        .flat_map(|name| collection(data, name).iter())
        .collect()
}

/// All source collections, unioned once per record and only ever borrowed.
struct SourceTables<'a> {
    root_encounters: Vec<&'a Value>,
    ed_encounters: Vec<&'a Value>,
    icu_encounters: Vec<&'a Value>,
    conditions: Vec<&'a Value>,
    procedures: Vec<&'a Value>,
    medication_requests: Vec<&'a Value>,
    medication_dispenses: Vec<&'a Value>,
    medication_administrations: Vec<&'a Value>,
    measurements: Vec<&'a Value>,
    microbiology: Vec<&'a Value>,
    labs: Vec<&'a Value>,
    documents: Vec<&'a Value>,
}

impl<'a> SourceTables<'a> {
    fn from_record(data: &'a Value) -> Self {
        Self {
            root_encounters: union(data, ROOT_ENCOUNTER_SOURCES),
            ed_encounters: union(data, ED_ENCOUNTER_SOURCES),
            icu_encounters: union(data, ICU_ENCOUNTER_SOURCES),
            conditions: union(data, CONDITION_SOURCES),
            procedures: union(data, PROCEDURE_SOURCES),
            medication_requests: union(data, MED_REQUEST_SOURCES),
            medication_dispenses: union(data, MED_DISPENSE_SOURCES),
            medication_administrations: union(data, MED_ADMIN_SOURCES),
            measurements: union(data, MEASUREMENT_SOURCES),
            microbiology: union(data, MICRO_SOURCES),
            labs: union(data, LAB_SOURCES),
            documents: union(data, DOCUMENT_SOURCES),
        }
    }
}

/// One root encounter plus the reference set of its ED/ICU sub-encounters.
struct EncounterGroup<'a> {
    root: &'a Value,
    id: String,
    period_start: Option<DateTime<Utc>>,
    members: HashSet<String>,
}

/// Groups each root encounter with the sub-encounters whose `partOf` points
/// at it. Roots are ordered by period start; missing starts sort first, ties
/// break on the encounter id.
fn build_encounter_groups<'a>(
    roots: &[&'a Value],
    ed: &[&'a Value],
    icu: &[&'a Value],
) -> Vec<EncounterGroup<'a>> {
    let mut groups = Vec::new();
    for &root in roots {
        if resolve_any(root, PART_OF).is_some() {
            continue;
        }
        let Some(id) = root.get("id").and_then(Value::as_str) else {
            continue;
        };
        let root_reference = format!("Encounter/{id}");
        let mut members = HashSet::from([root_reference.clone()]);
        for &sub in icu.iter().chain(ed.iter()) {
            if text_at(sub, PART_OF).as_deref() != Some(root_reference.as_str()) {
                continue;
            }
            if let Some(sub_id) = sub.get("id").and_then(Value::as_str) {
                members.insert(format!("Encounter/{sub_id}"));
            }
        }
        groups.push(EncounterGroup {
            root,
            id: id.to_string(),
            period_start: timestamp_at(root, PERIOD_START),
            members,
        });
    }
    groups.sort_by(|a, b| {
        a.period_start
            .cmp(&b.period_start)
            .then_with(|| a.id.cmp(&b.id))
    });
    groups
}

fn reference_matches(doc: &Value, candidates: &[&[Seg]], members: &HashSet<String>) -> bool {
    candidates.iter().any(|segs| {
        resolve(doc, segs)
            .and_then(Value::as_str)
            .is_some_and(|reference| members.contains(reference))
    })
}

/// `context.encounter` may be a single reference or a one-element list of
/// reference objects; both normalize to the same comparison string.
fn document_encounter_reference(doc: &Value) -> Option<&str> {
    let context = resolve_any(doc, DOCUMENT_CONTEXT)?;
    let entry = match context {
        Value::Array(items) => items.first()?,
        other => other,
    };
    match entry {
        Value::String(reference) => Some(reference.as_str()),
        other => other.get("reference").and_then(Value::as_str),
    }
}

/// Keeps the first row per natural key, in input order.
fn dedup_first<T, K>(rows: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T>
where
    K: Eq + Hash,
{
    let mut seen = HashSet::new();
    rows.into_iter().filter(|row| seen.insert(key(row))).collect()
}

fn build_bundle(
    group: &EncounterGroup,
    sources: &SourceTables,
    maps: &ReferenceMaps,
    config: &StitchConfig,
) -> EncounterBundle {
    let members = &group.members;

    let (vitals, observations, labs_from_observations) =
        split_measurements(collect_measurements(&sources.measurements, members, config));
    let labs = collect_labs(&sources.labs, members, labs_from_observations);

    EncounterBundle {
        id: group.id.clone(),
        class: text_at(group.root, CLASS_DISPLAY),
        period_start: group.period_start,
        period_end: timestamp_at(group.root, PERIOD_END),
        admit_source: text_at(group.root, ADMIT_SOURCE),
        discharge_disposition: text_at(group.root, DISCHARGE_DISPOSITION),
        locations: location_stays(group.root, maps),
        conditions: collect_conditions(&sources.conditions, members),
        procedures: collect_procedures(&sources.procedures, members),
        medication_requests: collect_medication_requests(
            &sources.medication_requests,
            members,
            maps,
            config,
        ),
        medication_dispenses: collect_medication_dispenses(
            &sources.medication_dispenses,
            members,
            maps,
        ),
        medication_administrations: collect_medication_administrations(
            &sources.medication_administrations,
            members,
        ),
        vitals,
        observations,
        labs,
        microbiology: collect_microbiology(&sources.microbiology, members),
        documents: collect_documents(&sources.documents, members),
    }
}

fn location_stays(root: &Value, maps: &ReferenceMaps) -> Vec<LocationStay> {
    let mut stays = Vec::new();
    if let Some(entries) = resolve(root, &[Key("location")]).and_then(Value::as_array) {
        for entry in entries {
            let Some(reference) = resolve_any(entry, LOCATION_REF).and_then(Value::as_str) else {
                continue;
            };
            let id = reference.strip_prefix("Location/").unwrap_or(reference);
            let name = maps
                .locations
                .get(id)
                .cloned()
                .unwrap_or_else(|| id.to_string());
            stays.push(LocationStay {
                name,
                start: timestamp_at(entry, PERIOD_START),
                end: timestamp_at(entry, PERIOD_END),
            });
        }
    }
    stays.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.name.cmp(&b.name)));
    stays
}

fn collect_conditions(sources: &[&Value], members: &HashSet<String>) -> Vec<ConditionRow> {
    let mut rows = Vec::new();
    for &doc in sources {
        if !reference_matches(doc, ENCOUNTER_REF, members) {
            continue;
        }
        rows.push(ConditionRow {
            condition: text_at(doc, CODE_DISPLAY),
            code: text_at(doc, CODE_CODE),
        });
    }
    dedup_first(rows, |row| (row.condition.clone(), row.code.clone()))
}

fn collect_procedures(sources: &[&Value], members: &HashSet<String>) -> Vec<ProcedureRow> {
    let mut rows = Vec::new();
    for &doc in sources {
        if !reference_matches(doc, ENCOUNTER_REF, members) {
            continue;
        }
        rows.push(ProcedureRow {
            procedure: text_at(doc, CODE_DISPLAY),
            code: text_at(doc, CODE_CODE),
            start: timestamp_at(doc, PERFORMED_START),
            end: timestamp_at(doc, PERFORMED_END),
        });
    }
    let mut rows = dedup_first(rows, |row| (row.procedure.clone(), row.start));
    rows.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| a.procedure.cmp(&b.procedure))
    });
    rows
}

/// Medication display name: the reference map wins when the id resolves,
/// otherwise the coded fallback; no name means the row is dropped.
fn medication_name(doc: &Value, coded: &[&[Seg]], maps: &ReferenceMaps) -> Option<String> {
    let mut name = text_at(doc, coded);
    if let Some(reference) = text_at(doc, MEDICATION_REF) {
        let id = reference
            .strip_prefix("Medication/")
            .unwrap_or(reference.as_str());
        if let Some(mapped) = maps.medications.get(id) {
            name = Some(mapped.clone());
        }
    }
    name
}

fn collect_medication_requests(
    sources: &[&Value],
    members: &HashSet<String>,
    maps: &ReferenceMaps,
    config: &StitchConfig,
) -> Vec<MedicationRequestRow> {
    let mut rows = Vec::new();
    for &doc in sources {
        if !reference_matches(doc, ENCOUNTER_REF, members) {
            continue;
        }
        let Some(medication) = medication_name(doc, MED_CODED_DISPLAY, maps) else {
            continue;
        };
        let Some(time) = timestamp_at(doc, AUTHORED_ON) else {
            continue;
        };
        rows.push(MedicationRequestRow {
            time,
            medication,
            status: text_at(doc, &[&[Key("status")]]),
            validity: validity_window(doc, config),
            dose: text_at(doc, DOSAGE_TEXT),
            route: text_at(doc, DOSAGE_ROUTE),
        });
    }
    let mut rows = dedup_first(rows, |row| (row.medication.clone(), row.time));
    rows.sort_by(|a, b| a.medication.cmp(&b.medication).then_with(|| a.time.cmp(&b.time)));
    rows
}

fn validity_window(doc: &Value, config: &StitchConfig) -> Option<String> {
    let start = resolve_any(doc, VALIDITY_START).and_then(Value::as_str);
    let end = resolve_any(doc, VALIDITY_END).and_then(Value::as_str);
    if start.is_none() && end.is_none() {
        return None;
    }
    Some(format!(
        "{} - {}",
        validity_bound(start, config),
        validity_bound(end, config)
    ))
}

fn validity_bound(raw: Option<&str>, config: &StitchConfig) -> String {
    match raw {
        Some(text) => match parse_timestamp(text) {
            Some(parsed) => parsed.format(&config.validity_display_format).to_string(),
            None => text.to_string(),
        },
        None => "N/A".to_string(),
    }
}

fn collect_medication_dispenses(
    sources: &[&Value],
    members: &HashSet<String>,
    maps: &ReferenceMaps,
) -> Vec<MedicationDispenseRow> {
    let mut rows = Vec::new();
    for &doc in sources {
        if !reference_matches(doc, CONTEXT_REF, members) {
            continue;
        }
        let Some(medication) = medication_name(doc, MED_CODED_CODE, maps) else {
            continue;
        };
        let Some(time) = timestamp_at(doc, WHEN_HANDED_OVER) else {
            continue;
        };
        rows.push(MedicationDispenseRow {
            time,
            medication,
            status: text_at(doc, &[&[Key("status")]]),
            dose: text_at(doc, DOSAGE_TEXT),
            route: text_at(doc, DOSAGE_ROUTE),
            timing: text_at(doc, DOSAGE_TIMING),
        });
    }
    let mut rows = dedup_first(rows, |row| (row.medication.clone(), row.time));
    rows.sort_by(|a, b| a.medication.cmp(&b.medication).then_with(|| a.time.cmp(&b.time)));
    rows
}

fn collect_medication_administrations(
    sources: &[&Value],
    members: &HashSet<String>,
) -> Vec<MedicationAdministrationRow> {
    let mut rows = Vec::new();
    for &doc in sources {
        if !reference_matches(doc, CONTEXT_REF, members) {
            continue;
        }
        let Some(medication) = text_at(doc, MED_CODED_DISPLAY) else {
            continue;
        };
        let Some(time) = timestamp_at(doc, EFFECTIVE_DATE) else {
            continue;
        };
        let dose = resolve_any(doc, DOSE_VALUE).map(scalar_display);
        let unit = text_at(doc, DOSE_UNIT);
        let details = match (dose, unit) {
            (Some(dose), Some(unit)) => format!("{dose} {unit}"),
            (Some(dose), None) => dose,
            (None, Some(unit)) => unit,
            (None, None) => String::new(),
        };
        rows.push(MedicationAdministrationRow {
            time,
            medication,
            status: text_at(doc, &[&[Key("status")]]),
            details,
            route: text_at(doc, ADMIN_ROUTE),
        });
    }
    let mut rows = dedup_first(rows, |row| (row.medication.clone(), row.time));
    rows.sort_by(|a, b| a.medication.cmp(&b.medication).then_with(|| a.time.cmp(&b.time)));
    rows
}

fn collect_measurements(
    sources: &[&Value],
    members: &HashSet<String>,
    config: &StitchConfig,
) -> Vec<MeasurementRow> {
    let mut rows = Vec::new();
    for &doc in sources {
        if !reference_matches(doc, MEASUREMENT_REF, members) {
            continue;
        }
        let Some(timestamp) = timestamp_at(doc, EFFECTIVE_DATE) else {
            continue;
        };
        // A `component` sequence is a multi-parameter panel: one row per
        // component, all inheriting the panel timestamp.
        match resolve(doc, &[Key("component")]).and_then(Value::as_array) {
            Some(components) => {
                for component in components {
                    if let Some(row) = measurement_row(component, timestamp, config) {
                        rows.push(row);
                    }
                }
            }
            None => {
                if let Some(row) = measurement_row(doc, timestamp, config) {
                    rows.push(row);
                }
            }
        }
    }
    rows
}

fn measurement_row(
    doc: &Value,
    timestamp: DateTime<Utc>,
    config: &StitchConfig,
) -> Option<MeasurementRow> {
    let value = measurement_value(doc)?;
    Some(MeasurementRow {
        timestamp,
        name: text_at(doc, CODE_DISPLAY),
        group: text_at(doc, CATEGORY_LABEL)
            .unwrap_or_else(|| config.default_vital_group.clone()),
        value,
    })
}

/// Scalar value of an observation-like document: `valueString`, then nested
/// `valueQuantity`, then the flattened pair. Quantity units abut the number
/// with no separator, matching the established output format.
fn measurement_value(doc: &Value) -> Option<String> {
    if let Some(text) = resolve(doc, &[Key("valueString")]).and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(quantity) = resolve(doc, &[Key("valueQuantity")]) {
        if let Some(value) = quantity.get("value").filter(|value| !value.is_null()) {
            let mut rendered = scalar_display(value);
            if let Some(unit) = quantity.get("unit").and_then(Value::as_str) {
                rendered.push_str(unit);
            }
            return Some(rendered);
        }
    }
    if let Some(value) = resolve(doc, &[Key("valueQuantity.value")]) {
        let mut rendered = scalar_display(value);
        if let Some(unit) = resolve(doc, &[Key("valueQuantity.unit")]).and_then(Value::as_str) {
            rendered.push_str(unit);
        }
        return Some(rendered);
    }
    None
}

/// Routes each measurement row to vitals, observations, or the labs table
/// according to its group label, then normalizes the first two.
fn split_measurements(
    rows: Vec<MeasurementRow>,
) -> (Vec<MeasurementRow>, Vec<MeasurementRow>, Vec<LabRow>) {
    let mut vitals = Vec::new();
    let mut observations = Vec::new();
    let mut labs = Vec::new();
    for row in rows {
        match classify_group_label(&row.group) {
            MeasurementClass::Vitals => vitals.push(row),
            MeasurementClass::Observations => observations.push(row),
            MeasurementClass::Labs => labs.push(LabRow {
                timestamp: row.timestamp,
                test: row.name,
                value: row.value,
                low_ref: None,
                high_ref: None,
            }),
        }
    }
    (
        normalize_measurements(vitals),
        normalize_measurements(observations),
        labs,
    )
}

fn normalize_measurements(rows: Vec<MeasurementRow>) -> Vec<MeasurementRow> {
    let mut rows = dedup_first(rows, |row| {
        (row.name.clone(), row.group.clone(), row.timestamp)
    });
    rows.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.group.cmp(&b.group))
    });
    rows
}

fn collect_labs(
    sources: &[&Value],
    members: &HashSet<String>,
    from_observations: Vec<LabRow>,
) -> Vec<LabRow> {
    let mut rows = Vec::new();
    for &doc in sources {
        if !reference_matches(doc, ENCOUNTER_REF, members) {
            continue;
        }
        let Some(timestamp) = timestamp_at(doc, EFFECTIVE_DATE) else {
            continue;
        };
        let Some(value) = measurement_value(doc) else {
            continue;
        };
        rows.push(LabRow {
            timestamp,
            test: text_at(doc, CODE_DISPLAY),
            value,
            low_ref: resolve_any(doc, REF_RANGE_LOW).and_then(Value::as_f64),
            high_ref: resolve_any(doc, REF_RANGE_HIGH).and_then(Value::as_f64),
        });
    }
    // Dedicated lab rows precede reclassified observation rows, so they win
    // natural-key collisions.
    rows.extend(from_observations);
    let mut rows = dedup_first(rows, |row| (row.test.clone(), row.timestamp));
    rows.sort_by(|a, b| a.test.cmp(&b.test).then_with(|| a.timestamp.cmp(&b.timestamp)));
    rows
}

fn collect_microbiology(sources: &[&Value], members: &HashSet<String>) -> Vec<MicrobiologyRow> {
    let mut rows = Vec::new();
    for &doc in sources {
        if !reference_matches(doc, MEASUREMENT_REF, members) {
            continue;
        }
        let value = text_at(doc, &[&[Key("valueString")]])
            .or_else(|| text_at(doc, MICRO_VALUE_CONCEPT));
        rows.push(MicrobiologyRow {
            time: timestamp_at(doc, EFFECTIVE_DATE),
            name: text_at(doc, CODE_DISPLAY),
            value,
        });
    }
    let mut rows = dedup_first(rows, |row| (row.name.clone(), row.time));
    rows.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.name.cmp(&b.name)));
    rows
}

fn collect_documents(sources: &[&Value], members: &HashSet<String>) -> Vec<DocumentRow> {
    let mut rows = Vec::new();
    for &doc in sources {
        let Some(reference) = document_encounter_reference(doc) else {
            continue;
        };
        if !members.contains(reference) {
            continue;
        }
        rows.push(DocumentRow {
            date: timestamp_at(doc, DOCUMENT_DATE),
            title: text_at(doc, ATTACHMENT_TITLE),
            id: text_at(doc, &[&[Key("id")]]),
            data: text_at(doc, ATTACHMENT_DATA),
        });
    }
    let mut rows = dedup_first(rows, |row| (row.title.clone(), row.date));
    rows.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.title.cmp(&b.title)));
    rows
}
