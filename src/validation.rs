//! Input validation module
//!
//! Validates the period selection sent by clients before any upstream fetch.

use crate::error::{AppError, AppResult};
use crate::period::{Boundary, DateRange, YearMonth};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use validator::Validate;

/// Period selection constraints
pub struct RangeConstraints;

impl RangeConstraints {
    pub const YEAR_MIN: i32 = 1900;
    pub const YEAR_MAX: i32 = 2100;
}

/// Body of `POST /api/snapshot/range`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RangeRequest {
    #[validate(range(min = 1900, max = 2100, message = "Year must be between 1900 and 2100"))]
    pub start_year: i32,

    #[validate(range(min = 1, max = 12, message = "Month must be between 1 and 12"))]
    pub start_month: u32,

    #[validate(range(min = 1900, max = 2100, message = "Year must be between 1900 and 2100"))]
    pub end_year: i32,

    #[validate(range(min = 1, max = 12, message = "Month must be between 1 and 12"))]
    pub end_month: u32,

    /// Boundary the user just changed; the other one snaps to keep the
    /// range ordered. Without it an inverted range is rejected.
    #[serde(default)]
    pub edited: Option<Boundary>,
}

/// Validate a range request and normalize it into a [`DateRange`]
pub fn validate_range_request(input: &RangeRequest) -> AppResult<DateRange> {
    if let Err(validation_errors) = input.validate() {
        let mut error_messages: Vec<String> = validation_errors
            .field_errors()
            .iter()
            .map(|(field, errors)| {
                let msgs: Vec<&str> = errors
                    .iter()
                    .filter_map(|e| e.message.as_ref().map(|c| c.as_ref()))
                    .collect();
                format!("{}: {}", field, msgs.join(", "))
            })
            .collect();
        error_messages.sort();

        warn!(errors = ?error_messages, "Range request validation failed");
        return Err(AppError::ValidationError(error_messages.join("; ")));
    }

    let start = year_month(input.start_year, input.start_month)?;
    let end = year_month(input.end_year, input.end_month)?;

    let range = match input.edited {
        Some(boundary) => DateRange::resolve(start, end, boundary),
        None => DateRange::new(start, end).ok_or_else(|| {
            AppError::ValidationError(format!(
                "Start month {} is after end month {}",
                start, end
            ))
        })?,
    };

    debug!(range = %range, "Range request validation passed");
    Ok(range)
}

fn year_month(year: i32, month: u32) -> AppResult<YearMonth> {
    if !(RangeConstraints::YEAR_MIN..=RangeConstraints::YEAR_MAX).contains(&year) {
        return Err(AppError::ValidationError(format!(
            "Year {} out of valid range [{}, {}]",
            year,
            RangeConstraints::YEAR_MIN,
            RangeConstraints::YEAR_MAX
        )));
    }

    YearMonth::new(year, month)
        .ok_or_else(|| AppError::ValidationError(format!("Invalid month {}", month)))
}
