// =============================================================================
// Frame generation — the finite timestamp sequence a backtest walks
// =============================================================================

use tracing::debug;

use crate::error::ConfigError;
use crate::schema::FrameSchema;

/// Produce the ordered per-step timestamps for `schema`: starting exactly at
/// `start_date`, stepped by the frame interval, strictly before `end_date`.
pub fn generate(schema: &FrameSchema) -> Result<Vec<i64>, ConfigError> {
    let start = schema.start_date.timestamp_millis();
    let end = schema.end_date.timestamp_millis();
    if end <= start {
        return Err(ConfigError::InvalidField {
            kind: "frame",
            name: schema.name.clone(),
            field: "end_date",
            reason: "must be after start_date".into(),
        });
    }

    let step = schema.interval.ms();
    let mut timestamps = Vec::with_capacity(((end - start) / step) as usize);
    let mut when = start;
    while when < end {
        timestamps.push(when);
        when += step;
    }

    debug!(
        name = %schema.name,
        interval = %schema.interval,
        frames = timestamps.len(),
        "frame sequence generated"
    );
    Ok(timestamps)
}

// =============================================================================
// Tests
// =============================================================================
