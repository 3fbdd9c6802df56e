use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use stitch_core::{ReferenceMaps, StitchConfig, StitchError, StitchedRecord};
use stitch_fhir::stitch_record_value;

fn stitch(data: Value) -> StitchedRecord {
    stitch_with(data, ReferenceMaps::default())
}

fn stitch_with(data: Value, maps: ReferenceMaps) -> StitchedRecord {
    stitch_record_value(&data, &maps, &StitchConfig::default()).expect("Không ghép được hồ sơ")
}

fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0).unwrap()
}

fn encounter(id: &str, start: &str) -> Value {
    json!({"id": id, "period": {"start": start}})
}

#[test]
fn icu_vitals_attach_to_the_parent_stay() {
    let data = json!({
        "MimicEncounter": [{
            "id": "E1",
            "class": {"display": "Inpatient"},
            "period": {"start": "2024-01-01T08:00:00", "end": "2024-01-05T12:00:00"}
        }],
        "MimicEncounterICU": [{
            "id": "ICU1",
            "partOf": {"reference": "Encounter/E1"},
            "period": {"start": "2024-01-02T00:00:00"}
        }],
        "MimicObservationChartevents": [{
            "context": {"reference": "Encounter/ICU1"},
            "effectiveDateTime": "2024-01-02T10:00",
            "code": {"coding": [{"display": "Temperature"}]},
            "valueQuantity": {"value": 98.6, "unit": "F"}
        }]
    });

    let stitched = stitch(data);
    assert_eq!(stitched.encounters.len(), 1);

    let bundle = &stitched.encounters[0];
    assert_eq!(bundle.id, "E1");
    assert_eq!(bundle.class.as_deref(), Some("Inpatient"));
    assert_eq!(bundle.vitals.len(), 1);

    let vital = &bundle.vitals[0];
    assert_eq!(vital.name.as_deref(), Some("Temperature"));
    assert_eq!(vital.value, "98.60F");
    assert_eq!(vital.group, "Vital Signs");
    assert_eq!(vital.timestamp, at(2024, 1, 2, 10, 0));
}

#[test]
fn unreferenced_medication_requests_are_dropped() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicMedicationRequest": [{
            "authoredOn": "2024-01-02T09:00:00",
            "medicationCodeableConcept": {"coding": [{"display": "Aspirin"}]}
        }]
    });

    let stitched = stitch(data);
    assert!(stitched.encounters[0].medication_requests.is_empty());
}

#[test]
fn lab_values_format_integral_and_fractional_magnitudes() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicObservationLabevents": [
            {
                "encounter": {"reference": "Encounter/E1"},
                "effectiveDateTime": "2024-01-02T06:00:00",
                "code": {"coding": [{"display": "Glucose"}]},
                "valueQuantity": {"value": 7.0},
                "referenceRange": [{"low": {"value": 3.9}, "high": {"value": 5.6}}]
            },
            {
                "encounter": {"reference": "Encounter/E1"},
                "effectiveDateTime": "2024-01-03T06:00:00",
                "code": {"coding": [{"display": "Glucose"}]},
                "valueQuantity": {"value": 7.25}
            }
        ]
    });

    let labs = &stitch(data).encounters[0].labs;
    assert_eq!(labs.len(), 2);
    assert_eq!(labs[0].value, "7");
    assert_eq!(labs[0].low_ref, Some(3.9));
    assert_eq!(labs[0].high_ref, Some(5.6));
    assert_eq!(labs[1].value, "7.25");
    assert_eq!(labs[1].high_ref, None);
}

#[test]
fn duplicate_vitals_across_collections_collapse_to_one_row() {
    let reading = json!({
        "encounter": {"reference": "Encounter/E1"},
        "effectiveDateTime": "2024-01-02T10:00:00",
        "code": {"coding": [{"display": "Heart Rate"}]},
        "valueQuantity": {"value": 88.0, "unit": "bpm"}
    });
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicObservationChartevents": [reading.clone()],
        "MimicObservationED": [reading]
    });

    let vitals = &stitch(data).encounters[0].vitals;
    assert_eq!(vitals.len(), 1);
    assert_eq!(vitals[0].value, "88bpm");
}

#[test]
fn sub_encounters_never_surface_as_bundles() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicEncounterED": [{
            "id": "ED1",
            "partOf": {"reference": "Encounter/E1"},
            "period": {"start": "2024-01-01T02:00:00"}
        }],
        "MimicConditionED": [{
            "encounter": {"reference": "Encounter/ED1"},
            "code": {"coding": [{"display": "Chest pain", "code": "R07.9"}]}
        }]
    });

    let stitched = stitch(data);
    assert_eq!(stitched.encounters.len(), 1);
    assert_eq!(stitched.encounters[0].id, "E1");

    let conditions = &stitched.encounters[0].conditions;
    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].condition.as_deref(), Some("Chest pain"));
}

#[test]
fn flattened_field_encodings_are_equivalent_to_nested_ones() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicCondition": [{
            "encounter.reference": "Encounter/E1",
            "code.coding": [{"display": "Septicemia", "code": "0389"}]
        }],
        "MimicMedicationAdministration": [{
            "context.reference": "Encounter/E1",
            "effectiveDateTime": "2024-01-02T12:00:00",
            "medicationCodeableConcept.coding": [{"display": "Heparin"}],
            "dosage.dose.value": 5000.0,
            "dosage.dose.unit": "units",
            "dosage.method.coding": [{"code": "IV"}]
        }]
    });

    let bundle = &stitch(data).encounters[0];
    assert_eq!(bundle.conditions.len(), 1);
    assert_eq!(bundle.conditions[0].code.as_deref(), Some("0389"));

    let administrations = &bundle.medication_administrations;
    assert_eq!(administrations.len(), 1);
    assert_eq!(administrations[0].medication, "Heparin");
    assert_eq!(administrations[0].details, "5000 units");
    assert_eq!(administrations[0].route.as_deref(), Some("IV"));
}

#[test]
fn observations_labeled_labs_merge_into_the_labs_table() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicObservationChartevents": [{
            "encounter": {"reference": "Encounter/E1"},
            "effectiveDateTime": "2024-01-02T06:00:00",
            "code": {"coding": [{"display": "Lactate"}]},
            "category": [{"coding": [{"display": "Labs"}]}],
            "valueQuantity": {"value": 3.2, "unit": "mmol/L"}
        }]
    });

    let bundle = &stitch(data).encounters[0];
    assert!(bundle.observations.is_empty());
    assert!(bundle.vitals.is_empty());
    assert_eq!(bundle.labs.len(), 1);
    assert_eq!(bundle.labs[0].test.as_deref(), Some("Lactate"));
    assert_eq!(bundle.labs[0].value, "3.20mmol/L");
    assert_eq!(bundle.labs[0].low_ref, None);
}

#[test]
fn dedicated_lab_rows_win_natural_key_collisions() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicObservationLabevents": [{
            "encounter": {"reference": "Encounter/E1"},
            "effectiveDateTime": "2024-01-02T06:00:00",
            "code": {"coding": [{"display": "Glucose"}]},
            "valueQuantity": {"value": 7.0}
        }],
        "MimicObservationChartevents": [{
            "encounter": {"reference": "Encounter/E1"},
            "effectiveDateTime": "2024-01-02T06:00:00",
            "code": {"coding": [{"display": "Glucose"}]},
            "category": [{"coding": [{"display": "Labs"}]}],
            "valueQuantity": {"value": 9.0}
        }]
    });

    let labs = &stitch(data).encounters[0].labs;
    assert_eq!(labs.len(), 1);
    assert_eq!(labs[0].value, "7");
}

#[test]
fn component_panels_explode_into_one_row_per_component() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicObservationChartevents": [{
            "encounter": {"reference": "Encounter/E1"},
            "effectiveDateTime": "2024-01-02T10:00:00",
            "component": [
                {
                    "code": {"coding": [{"display": "Systolic blood pressure"}]},
                    "valueQuantity": {"value": 120.0, "unit": "mmHg"}
                },
                {
                    "code": {"coding": [{"display": "Diastolic blood pressure"}]},
                    "valueQuantity": {"value": 80.0, "unit": "mmHg"}
                }
            ]
        }]
    });

    let vitals = &stitch(data).encounters[0].vitals;
    assert_eq!(vitals.len(), 2);
    assert!(vitals.iter().all(|row| row.timestamp == at(2024, 1, 2, 10, 0)));
    assert!(vitals
        .iter()
        .any(|row| row.name.as_deref() == Some("Systolic blood pressure")
            && row.value == "120mmHg"));
}

#[test]
fn blank_values_drop_the_row() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicObservationChartevents": [{
            "encounter": {"reference": "Encounter/E1"},
            "effectiveDateTime": "2024-01-02T10:00:00",
            "code": {"coding": [{"display": "Comment"}]},
            "valueString": ""
        }]
    });

    assert!(stitch(data).encounters[0].vitals.is_empty());
}

#[test]
fn roots_order_by_period_start_with_missing_starts_first() {
    let data = json!({
        "MimicEncounter": [
            encounter("B", "2024-03-01T08:00:00"),
            {"id": "C"},
            {"id": "A"}
        ]
    });

    let stitched = stitch(data);
    let order: Vec<&str> = stitched
        .encounters
        .iter()
        .map(|bundle| bundle.id.as_str())
        .collect();
    assert_eq!(order, vec!["A", "C", "B"]);
}

#[test]
fn events_attach_to_exactly_one_encounter() {
    let data = json!({
        "MimicEncounter": [
            encounter("E1", "2024-01-01T08:00:00"),
            encounter("E2", "2024-02-01T08:00:00")
        ],
        "MimicObservationLabevents": [{
            "encounter": {"reference": "Encounter/E2"},
            "effectiveDateTime": "2024-02-02T06:00:00",
            "code": {"coding": [{"display": "Creatinine"}]},
            "valueQuantity": {"value": 1.1}
        }]
    });

    let stitched = stitch(data);
    assert!(stitched.encounters[0].labs.is_empty());
    assert_eq!(stitched.encounters[1].labs.len(), 1);
}

#[test]
fn medication_map_overrides_the_coded_display() {
    let mut maps = ReferenceMaps::default();
    maps.medications
        .insert("M1".to_string(), "Vancomycin".to_string());

    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicMedicationRequest": [
            {
                "encounter": {"reference": "Encounter/E1"},
                "authoredOn": "2024-01-02T09:00:00",
                "medicationCodeableConcept": {"coding": [{"display": "Vanco IV"}]},
                "medicationReference": {"reference": "Medication/M1"},
                "dispenseRequest": {"validityPeriod": {
                    "start": "2024-01-02T09:00:00",
                    "end": "2024-01-04T09:00:00"
                }}
            },
            {
                "encounter": {"reference": "Encounter/E1"},
                "authoredOn": "2024-01-03T09:00:00",
                "medicationCodeableConcept": {"coding": [{"display": "Cefepime"}]},
                "medicationReference": {"reference": "Medication/unknown"}
            }
        ]
    });

    let requests = &stitch_with(data, maps).encounters[0].medication_requests;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].medication, "Cefepime");
    assert_eq!(requests[1].medication, "Vancomycin");
    assert_eq!(
        requests[1].validity.as_deref(),
        Some("2024-01-02 09:00:00 - 2024-01-04 09:00:00")
    );
}

#[test]
fn dispenses_match_on_context_and_fall_back_to_the_coded_code() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicMedicationDispense": [{
            "context": {"reference": "Encounter/E1"},
            "whenHandedOver": "2024-01-03T08:00:00",
            "status": "completed",
            "medicationCodeableConcept": {"coding": [{"code": "ASA81"}]},
            "dosageInstruction": [{
                "text": "81 mg daily",
                "route": {"coding": [{"code": "PO"}]},
                "timing": {"code": {"coding": [{"code": "QD"}]}}
            }]
        }]
    });

    let dispenses = &stitch(data).encounters[0].medication_dispenses;
    assert_eq!(dispenses.len(), 1);
    assert_eq!(dispenses[0].medication, "ASA81");
    assert_eq!(dispenses[0].route.as_deref(), Some("PO"));
    assert_eq!(dispenses[0].timing.as_deref(), Some("QD"));
}

#[test]
fn document_references_accept_both_context_forms() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicDocumentReference": [
            {
                "id": "note-1",
                "date": "2024-01-04T09:00:00",
                "context": {"encounter": [{"reference": "Encounter/E1"}]},
                "content": [{"attachment": {"title": "Progress note", "data": "Tm90ZQ=="}}]
            },
            {
                "id": "note-2",
                "date": "2024-01-05T09:00:00",
                "context": {"encounter": "Encounter/E1"},
                "content": [{"attachment": {"title": "Discharge summary"}}]
            },
            {
                "id": "elsewhere",
                "date": "2024-01-05T09:00:00",
                "context": {"encounter": [{"reference": "Encounter/OTHER"}]},
                "content": [{"attachment": {"title": "Unrelated"}}]
            }
        ]
    });

    let documents = &stitch(data).encounters[0].documents;
    assert_eq!(documents.len(), 2);
    assert_eq!(documents[0].title.as_deref(), Some("Progress note"));
    assert_eq!(documents[0].data.as_deref(), Some("Tm90ZQ=="));
    assert_eq!(documents[1].title.as_deref(), Some("Discharge summary"));
}

#[test]
fn procedures_accept_all_three_time_encodings() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicProcedure": [
            {
                "encounter": {"reference": "Encounter/E1"},
                "code": {"coding": [{"display": "Intubation", "code": "0BH17EZ"}]},
                "performedDateTime": "2024-01-02T09:00:00"
            },
            {
                "encounter": {"reference": "Encounter/E1"},
                "code": {"coding": [{"display": "Dialysis"}]},
                "performedPeriod": {"start": "2024-01-03T09:00:00", "end": "2024-01-03T13:00:00"}
            }
        ],
        "MimicProcedureICU": [{
            "encounter": {"reference": "Encounter/E1"},
            "code.coding": [{"display": "Central line placement"}],
            "performedPeriod.start": "2024-01-01T22:00:00",
            "performedPeriod.end": "2024-01-01T22:30:00"
        }]
    });

    let procedures = &stitch(data).encounters[0].procedures;
    assert_eq!(procedures.len(), 3);
    assert_eq!(
        procedures[0].procedure.as_deref(),
        Some("Central line placement")
    );
    assert_eq!(procedures[0].end, Some(at(2024, 1, 1, 22, 30)));
    assert_eq!(procedures[1].procedure.as_deref(), Some("Intubation"));
    assert_eq!(procedures[2].start, Some(at(2024, 1, 3, 9, 0)));
}

#[test]
fn microbiology_rows_are_membership_filtered() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicObservationMicroOrg": [
            {
                "encounter": {"reference": "Encounter/E1"},
                "effectiveDateTime": "2024-01-02T11:00:00",
                "code": {"coding": [{"display": "Blood culture"}]},
                "valueCodeableConcept": {"coding": [{"display": "E. coli"}]}
            },
            {
                "effectiveDateTime": "2024-01-02T11:00:00",
                "code": {"coding": [{"display": "Urine culture"}]},
                "valueString": "No growth"
            }
        ]
    });

    let microbiology = &stitch(data).encounters[0].microbiology;
    assert_eq!(microbiology.len(), 1);
    assert_eq!(microbiology[0].name.as_deref(), Some("Blood culture"));
    assert_eq!(microbiology[0].value.as_deref(), Some("E. coli"));
}

#[test]
fn vitals_and_observations_split_on_the_group_label() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicObservationChartevents": [
            {
                "encounter": {"reference": "Encounter/E1"},
                "effectiveDateTime": "2024-01-02T10:00:00",
                "code": {"coding": [{"display": "Heart Rate"}]},
                "category": [{"coding": [{"display": "Routine Vital Signs"}]}],
                "valueQuantity": {"value": 88.0, "unit": "bpm"}
            },
            {
                "encounter": {"reference": "Encounter/E1"},
                "effectiveDateTime": "2024-01-02T10:00:00",
                "code": {"coding": [{"display": "Ventilator Mode"}]},
                "category": [{"coding": [{"display": "Respiratory"}]}],
                "valueString": "CMV"
            }
        ]
    });

    let bundle = &stitch(data).encounters[0];
    assert_eq!(bundle.vitals.len(), 1);
    assert_eq!(bundle.observations.len(), 1);
    assert!(bundle.vitals[0].group.to_lowercase().contains("vital"));
    assert_eq!(bundle.observations[0].value, "CMV");
}

#[test]
fn missing_collections_degrade_to_empty_tables() {
    let stitched = stitch(json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")]
    }));

    let bundle = &stitched.encounters[0];
    assert!(bundle.conditions.is_empty());
    assert!(bundle.procedures.is_empty());
    assert!(bundle.medication_requests.is_empty());
    assert!(bundle.medication_dispenses.is_empty());
    assert!(bundle.medication_administrations.is_empty());
    assert!(bundle.vitals.is_empty());
    assert!(bundle.observations.is_empty());
    assert!(bundle.labs.is_empty());
    assert!(bundle.microbiology.is_empty());
    assert!(bundle.documents.is_empty());

    assert!(stitch(json!({})).encounters.is_empty());
}

#[test]
fn repeated_invocations_yield_identical_output() {
    let data = json!({
        "MimicEncounter": [encounter("E1", "2024-01-01T08:00:00")],
        "MimicObservationChartevents": [{
            "encounter": {"reference": "Encounter/E1"},
            "effectiveDateTime": "2024-01-02T10:00:00",
            "code": {"coding": [{"display": "Heart Rate"}]},
            "valueQuantity": {"value": 88.0, "unit": "bpm"}
        }],
        "MimicObservationLabevents": [{
            "encounter": {"reference": "Encounter/E1"},
            "effectiveDateTime": "2024-01-02T06:00:00",
            "code": {"coding": [{"display": "Glucose"}]},
            "valueQuantity": {"value": 7.0}
        }]
    });

    let first = stitch(data.clone());
    let second = stitch(data);
    assert_eq!(first, second);
}

#[test]
fn non_object_input_is_rejected() {
    let err = stitch_record_value(
        &json!(["not", "a", "record"]),
        &ReferenceMaps::default(),
        &StitchConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, StitchError::MissingData));
}
