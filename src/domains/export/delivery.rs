use crate::domains::export::definition::{DeliveryPolicy, ResolvedDefinition};
use crate::domains::export::types::{DeliveryMode, ExportRequest};

/// Maps a request to `Sync` or `Async`. Never returns `Auto`.
pub fn select_delivery(
    request: &ExportRequest,
    definition: &ResolvedDefinition,
    base: &DeliveryPolicy,
) -> DeliveryMode {
    match request.delivery {
        Some(DeliveryMode::Sync) => return DeliveryMode::Sync,
        Some(DeliveryMode::Async) => return DeliveryMode::Async,
        _ => {}
    }

    let policy = match &definition.delivery_policy {
        Some(over) => base.merge(over),
        None => base.clone(),
    };
    let thresholds = &policy.thresholds;

    let over_rows = thresholds.max_rows > 0
        && request.estimated_rows.map_or(false, |rows| rows > thresholds.max_rows);
    let over_bytes = thresholds.max_bytes > 0
        && request.estimated_bytes.map_or(false, |bytes| bytes > thresholds.max_bytes);
    let over_duration = !thresholds.max_duration.is_zero()
        && request
            .estimated_duration
            .map_or(false, |d| d > thresholds.max_duration);
    if over_rows || over_bytes || over_duration {
        return DeliveryMode::Async;
    }

    match policy.default {
        Some(DeliveryMode::Async) => DeliveryMode::Async,
        _ => DeliveryMode::Sync,
    }
}
