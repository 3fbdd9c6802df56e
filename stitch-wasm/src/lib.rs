//! Cầu nối WASM <-> JavaScript trung lập framework.

use std::collections::HashMap;

use serde::Deserialize;
use serde_wasm_bindgen::{from_value, to_value};
use stitch_core::{ReferenceMaps, StitchConfig, StitchError};
use wasm_bindgen::prelude::*;

#[derive(Deserialize)]
struct JsStitchConfig {
    #[serde(default)]
    default_vital_group: Option<String>,
    #[serde(default)]
    validity_display_format: Option<String>,
}

impl From<JsStitchConfig> for StitchConfig {
    fn from(cfg: JsStitchConfig) -> Self {
        let mut base = StitchConfig::default();
        if let Some(group) = cfg.default_vital_group {
            base.default_vital_group = group;
        }
        if let Some(format) = cfg.validity_display_format {
            base.validity_display_format = format;
        }
        base
    }
}

#[derive(Deserialize, Default)]
struct JsReferenceMaps {
    #[serde(default)]
    locations: Option<HashMap<String, String>>,
    #[serde(default)]
    medications: Option<HashMap<String, String>>,
}

impl From<JsReferenceMaps> for ReferenceMaps {
    fn from(maps: JsReferenceMaps) -> Self {
        Self {
            locations: maps.locations.unwrap_or_default(),
            medications: maps.medications.unwrap_or_default(),
        }
    }
}

#[wasm_bindgen]
pub fn stitch_record(
    input_record: JsValue,
    maps: Option<JsValue>,
    config: Option<JsValue>,
) -> Result<JsValue, JsValue> {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let record_value = from_value::<serde_json::Value>(input_record)
        .map_err(|err| JsValue::from_str(&format!("Không đọc được JSON hồ sơ: {err}")))?;

    let reference_maps = match maps {
        Some(js_maps) => {
            let maps: JsReferenceMaps = from_value(js_maps)
                .map_err(|err| JsValue::from_str(&format!("Không đọc được bảng tra cứu: {err}")))?;
            ReferenceMaps::from(maps)
        }
        None => ReferenceMaps::default(),
    };

    let cfg = match config {
        Some(js_cfg) => {
            let cfg: JsStitchConfig = from_value(js_cfg)
                .map_err(|err| JsValue::from_str(&format!("Không đọc được config: {err}")))?;
            StitchConfig::from(cfg)
        }
        None => StitchConfig::default(),
    };

    let stitched = stitch_fhir::stitch_record_value(&record_value, &reference_maps, &cfg)
        .map_err(|err| JsValue::from_str(&format_stitch_error(err)))?;

    to_value(&stitched)
        .map_err(|err| JsValue::from_str(&format!("Không serialize kết quả: {err}")))
}

fn format_stitch_error(err: StitchError) -> String {
    format!("Stitch error: {err}")
}
