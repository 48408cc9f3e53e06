pub mod error;
pub mod geodesy;
pub mod gpx_types;
pub mod options;
pub mod parser;
pub mod schema;
pub mod summary;
pub mod timestamp;
pub mod validator;

use wasm_bindgen::prelude::*;

pub use crate::error::{GpxError, Result, SchemaError};
pub use crate::geodesy::Coordinate;
pub use crate::gpx_types::{Gpx, Metadata, Track, TrackPoint, TrackSegment};
pub use crate::options::{DistanceUnit, SummaryOptions};
pub use crate::summary::{GpxSummary, TrackSummary, summarize};
pub use crate::timestamp::{Instant, parse_timestamp};

/// Parse a GPX string and summarize its tracks, returned as a JS object.
#[wasm_bindgen(js_name = gpxSummary)]
pub fn gpx_summary(gpx_string: &str, options: JsValue) -> std::result::Result<JsValue, JsValue> {
    console_error_panic_hook::set_once();

    let opts = parse_options(options)?;
    let gpx = Gpx::parse(gpx_string.as_bytes())?;
    let summary = summarize(&gpx, &opts);
    serde_wasm_bindgen::to_value(&summary).map_err(|e| JsValue::from_str(&e.to_string()))
}

/// Parse a GPX string and summarize its tracks, returned as a JSON string.
#[wasm_bindgen(js_name = gpxSummaryString)]
pub fn gpx_summary_string(
    gpx_string: &str,
    options: JsValue,
) -> std::result::Result<String, JsValue> {
    console_error_panic_hook::set_once();

    let opts = parse_options(options)?;
    let gpx = Gpx::parse(gpx_string.as_bytes())?;
    let summary = summarize(&gpx, &opts);
    serde_json::to_string(&summary).map_err(|e| JsValue::from_str(&e.to_string()))
}

fn parse_options(options: JsValue) -> std::result::Result<SummaryOptions, JsValue> {
    if options.is_undefined() || options.is_null() {
        Ok(SummaryOptions::default())
    } else {
        serde_wasm_bindgen::from_value(options).map_err(|e| JsValue::from_str(&e.to_string()))
    }
}
