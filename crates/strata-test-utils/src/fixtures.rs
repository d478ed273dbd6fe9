//! Reusable schema fixtures.
//!
//! - [`pipe_schema`]: a small piping component with mixed widths.
//! - [`vessel_schema`]: a wide type using every value type, for packing
//!   and growth tests.

use strata_props::{PropertySchema, PropertyType};
use tracing_subscriber::EnvFilter;

/// Install a test-writer `fmt` subscriber honouring `RUST_LOG`, defaulting
/// to warnings only.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}

/// `Pipe`: diameter f64, pressure_class u32, lined bool, material Byte16,
/// wall_thickness f32; variable `notes` and `spec_ref`.
pub fn pipe_schema() -> PropertySchema {
    PropertySchema::builder("Pipe")
        .fixed("diameter", PropertyType::F64)
        .fixed("pressure_class", PropertyType::U32)
        .fixed("lined", PropertyType::Bool)
        .var("notes")
        .fixed("material", PropertyType::Byte16)
        .fixed("wall_thickness", PropertyType::F32)
        .var("spec_ref")
        .build()
        .expect("pipe schema is valid")
}

/// `Vessel`: one property of each value type (14 fixed) and three
/// variable properties.
pub fn vessel_schema() -> PropertySchema {
    PropertySchema::builder("Vessel")
        .fixed("in_service", PropertyType::Bool)
        .fixed("nozzles", PropertyType::U8)
        .fixed("trim", PropertyType::I8)
        .fixed("shell_courses", PropertyType::U16)
        .fixed("min_temp", PropertyType::I16)
        .fixed("fill_ratio", PropertyType::Bf16)
        .fixed("design_code", PropertyType::U32)
        .fixed("elevation_mm", PropertyType::I32)
        .fixed("volume", PropertyType::F32)
        .fixed("serial", PropertyType::U64)
        .fixed("offset_um", PropertyType::I64)
        .fixed("design_pressure", PropertyType::F64)
        .fixed("tag", PropertyType::Byte16)
        .fixed("service", PropertyType::Byte32)
        .var("datasheet")
        .var("inspection_log")
        .var("remarks")
        .build()
        .expect("vessel schema is valid")
}
