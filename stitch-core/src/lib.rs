//! Mô hình dữ liệu lõi cho việc ghép hồ sơ lâm sàng theo từng đợt điều trị.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cấu hình điều chỉnh nhãn mặc định và định dạng hiển thị thời gian.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StitchConfig {
    /// Nhãn nhóm gán cho bản ghi quan sát không có phân loại.
    pub default_vital_group: String,
    /// Định dạng `chrono` dùng khi hiển thị khoảng hiệu lực của đơn thuốc.
    pub validity_display_format: String,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            default_vital_group: "Vital Signs".to_string(),
            validity_display_format: "%Y-%m-%d %H:%M:%S".to_string(),
        }
    }
}

/// Bảng tra cứu id -> tên hiển thị do lớp ngoài cung cấp sẵn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReferenceMaps {
    pub locations: HashMap<String, String>,
    pub medications: HashMap<String, String>,
}

/// Phân loại một bản ghi quan sát tự do theo nhãn nhóm của nó.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementClass {
    Vitals,
    Labs,
    Observations,
}

/// Quy tắc phân loại nhãn nhóm, tách riêng để kiểm thử độc lập.
///
/// Nhãn chứa "vital" (không phân biệt hoa thường) là chỉ số sống; nhãn đúng
/// bằng "labs" gộp vào bảng xét nghiệm; còn lại là quan sát chung.
pub fn classify_group_label(label: &str) -> MeasurementClass {
    let lower = label.to_lowercase();
    if lower.contains("vital") {
        MeasurementClass::Vitals
    } else if lower == "labs" {
        MeasurementClass::Labs
    } else {
        MeasurementClass::Observations
    }
}

/// Chuẩn hóa một số đo: giá trị nguyên bỏ phần thập phân, còn lại giữ đúng
/// hai chữ số.
pub fn format_magnitude(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

/// Chuẩn hóa chuỗi giá trị: nếu đọc được thành số thì áp dụng
/// [`format_magnitude`], ngược lại giữ nguyên chuỗi.
pub fn format_scalar_text(raw: &str) -> String {
    match raw.trim().parse::<f64>() {
        Ok(number) => format_magnitude(number),
        Err(_) => raw.to_string(),
    }
}

/// Một giai đoạn nằm tại một vị trí trong đợt điều trị.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationStay {
    pub name: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Chẩn đoán ghi nhận trong đợt điều trị.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionRow {
    pub condition: Option<String>,
    pub code: Option<String>,
}

/// Thủ thuật hoặc can thiệp, kèm khoảng thời gian thực hiện nếu có.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcedureRow {
    pub procedure: Option<String>,
    pub code: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Đơn thuốc được kê.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MedicationRequestRow {
    pub time: DateTime<Utc>,
    pub medication: String,
    pub status: Option<String>,
    /// Khoảng hiệu lực hiển thị dạng "bắt đầu - kết thúc".
    pub validity: Option<String>,
    pub dose: Option<String>,
    pub route: Option<String>,
}

/// Lần cấp phát thuốc.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MedicationDispenseRow {
    pub time: DateTime<Utc>,
    pub medication: String,
    pub status: Option<String>,
    pub dose: Option<String>,
    pub route: Option<String>,
    pub timing: Option<String>,
}

/// Lần dùng thuốc thực tế, liều và đơn vị gộp vào `details`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MedicationAdministrationRow {
    pub time: DateTime<Utc>,
    pub medication: String,
    pub status: Option<String>,
    pub details: String,
    pub route: Option<String>,
}

/// Một điểm đo (chỉ số sống hoặc quan sát chung) đã chuẩn hóa.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementRow {
    pub timestamp: DateTime<Utc>,
    pub name: Option<String>,
    pub group: String,
    pub value: String,
}

/// Kết quả xét nghiệm kèm ngưỡng tham chiếu để lớp hiển thị tô màu.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabRow {
    pub timestamp: DateTime<Utc>,
    pub test: Option<String>,
    pub value: String,
    pub low_ref: Option<f64>,
    pub high_ref: Option<f64>,
}

/// Kết quả vi sinh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MicrobiologyRow {
    pub time: Option<DateTime<Utc>>,
    pub name: Option<String>,
    pub value: Option<String>,
}

/// Tài liệu lâm sàng; phần `data` giữ nguyên base64 cho lớp hiển thị.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRow {
    pub date: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub id: Option<String>,
    pub data: Option<String>,
}

/// Một đợt điều trị gốc cùng các bảng dữ liệu lâm sàng đã ghép của nó.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncounterBundle {
    pub id: String,
    pub class: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub admit_source: Option<String>,
    pub discharge_disposition: Option<String>,
    pub locations: Vec<LocationStay>,
    pub conditions: Vec<ConditionRow>,
    pub procedures: Vec<ProcedureRow>,
    pub medication_requests: Vec<MedicationRequestRow>,
    pub medication_dispenses: Vec<MedicationDispenseRow>,
    pub medication_administrations: Vec<MedicationAdministrationRow>,
    pub vitals: Vec<MeasurementRow>,
    pub observations: Vec<MeasurementRow>,
    pub labs: Vec<LabRow>,
    pub microbiology: Vec<MicrobiologyRow>,
    pub documents: Vec<DocumentRow>,
}

/// Kết quả ghép cuối cùng cho một hồ sơ bệnh nhân.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StitchedRecord {
    pub patient_id: Option<String>,
    pub encounters: Vec<EncounterBundle>,
}

impl StitchedRecord {
    /// Khởi tạo từ các bundle đã dựng sẵn theo thứ tự thời gian.
    pub fn new(patient_id: Option<String>, encounters: Vec<EncounterBundle>) -> Self {
        Self {
            patient_id,
            encounters,
        }
    }

    /// Danh sách đợt điều trị đã sắp xếp.
    pub fn encounters(&self) -> &[EncounterBundle] {
        &self.encounters
    }
}

/// Lỗi chung khi ghép hồ sơ.
#[derive(Debug, thiserror::Error)]
pub enum StitchError {
    #[error("Dữ liệu đầu vào thiếu thông tin tối thiểu")]
    MissingData,
    #[error("Không đọc được dữ liệu: {0}")]
    Parse(String),
}
