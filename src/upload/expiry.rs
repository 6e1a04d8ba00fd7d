//! Artifact expiry policies
//!
//! A completed upload carries an `(expire_value, expire_style)` pair. Time
//! based styles resolve to an absolute deadline; `count` limits the number of
//! retrievals; `forever` never expires.

use chrono::{DateTime, Duration, Utc};

use super::types::UploadError;

/// Upper bound on a time-based expiry (10,000 years)
const MAX_EXPIRY_SECS: i64 = 10_000 * 365 * 24 * 60 * 60;

/// Unit of an expiry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireStyle {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
    Count,
    Forever,
}

impl ExpireStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
            Self::Count => "count",
            Self::Forever => "forever",
        }
    }

    /// Length of one unit, for time-based styles
    fn unit(&self) -> Option<Duration> {
        match self {
            Self::Minute => Some(Duration::minutes(1)),
            Self::Hour => Some(Duration::hours(1)),
            Self::Day => Some(Duration::days(1)),
            Self::Week => Some(Duration::weeks(1)),
            Self::Month => Some(Duration::days(30)),
            Self::Year => Some(Duration::days(365)),
            Self::Count | Self::Forever => None,
        }
    }
}

impl std::str::FromStr for ExpireStyle {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            "count" => Ok(Self::Count),
            "forever" => Ok(Self::Forever),
            other => Err(UploadError::InvalidExpirePolicy(format!(
                "unknown expire_style: {other:?}"
            ))),
        }
    }
}

/// Validated expiry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirePolicy {
    pub value: i64,
    pub style: ExpireStyle,
}

/// Where an expiry policy lands on an artifact record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedExpiry {
    /// Absolute deadline, for time-based styles
    pub expired_at: Option<DateTime<Utc>>,
    /// Remaining retrievals, `-1` for unlimited
    pub expired_count: i64,
}

impl ExpirePolicy {
    pub fn parse(value: i64, style: &str) -> Result<Self, UploadError> {
        let style: ExpireStyle = style.parse()?;

        if style != ExpireStyle::Forever && value <= 0 {
            return Err(UploadError::InvalidExpirePolicy(format!(
                "expire_value must be positive for {}",
                style.as_str()
            )));
        }

        if let Some(unit) = style.unit() {
            let in_range = unit
                .num_seconds()
                .checked_mul(value)
                .is_some_and(|secs| secs <= MAX_EXPIRY_SECS);
            if !in_range {
                return Err(UploadError::InvalidExpirePolicy(format!(
                    "expire_value {value} {} is too far in the future",
                    style.as_str()
                )));
            }
        }

        Ok(Self { value, style })
    }

    /// Resolve against `now`
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<ResolvedExpiry, UploadError> {
        match self.style {
            ExpireStyle::Forever => Ok(ResolvedExpiry {
                expired_at: None,
                expired_count: -1,
            }),
            ExpireStyle::Count => Ok(ResolvedExpiry {
                expired_at: None,
                expired_count: self.value,
            }),
            style => {
                let overflow =
                    || UploadError::InvalidExpirePolicy("expire_value too large".to_string());
                let unit = style.unit().ok_or_else(overflow)?;
                let secs = unit
                    .num_seconds()
                    .checked_mul(self.value)
                    .filter(|secs| *secs <= MAX_EXPIRY_SECS)
                    .ok_or_else(overflow)?;
                let deadline = now
                    .checked_add_signed(Duration::seconds(secs))
                    .ok_or_else(overflow)?;

                Ok(ResolvedExpiry {
                    expired_at: Some(deadline),
                    expired_count: -1,
                })
            }
        }
    }
}
