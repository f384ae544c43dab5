/// Column-name constants for the rateio working tables.
/// Single source of truth for every column the engine reads or writes.

// ── Entry (value-side) columns ──────────────────────────────────────────────
pub mod entry {
    pub const CENTER_ID: &str = "center_id";
    pub const SEGMENT_ID: &str = "segment_id";
    pub const VALUE: &str = "value";
    pub const BOOKING_DATE: &str = "booking_date";
    pub const DUE_DATE: &str = "due_date";
    pub const PAYMENT_DATE: &str = "payment_date";
}

// ── Metric (driver-side) columns ────────────────────────────────────────────
pub mod metric {
    pub const METRIC_NAME: &str = "metric_name";
    pub const CHANNEL: &str = "channel";
    pub const SEGMENT_ID: &str = "segment_id";
    pub const CENTER_ID: &str = "center_id";
    pub const REFERENCE_DATE: &str = "reference_date";
    pub const TOTAL: &str = "total";
}

// ── Allocation output columns ───────────────────────────────────────────────
pub mod allocation {
    pub const ALLOCATED_VALUE: &str = "allocated_value";
    pub const ALLOCATION_RATIO: &str = "allocation_ratio";
    pub const STAGE: &str = "allocation_stage";
}
