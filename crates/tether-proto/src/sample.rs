use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// One raw position reading from the positioning subsystem.
#[derive(Debug, Clone)]
pub struct PositionFix {
    pub lat: f64,
    pub lon: f64,
    pub accuracy: Option<f32>,
    pub speed: Option<f32>,
    pub bearing: Option<f32>,
    pub ts: OffsetDateTime,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("latitude {0} outside [-90, 90]")]
    Latitude(f64),
    #[error("longitude {0} outside [-180, 180]")]
    Longitude(f64),
    #[error("{field} must be finite and non-negative, got {value}")]
    Metric { field: &'static str, value: f32 },
}

/// A validated, timestamped sample ready for delivery.
///
/// Field names mirror the store's `locations` schema; the timestamp is
/// serialized as ISO-8601 UTC with millisecond precision. Samples are not
/// mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub child_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "location_timestamp", with = "ts_millis")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f32>,
}

impl LocationSample {
    /// Builds a sample from a raw fix, stamping the fix's capture instant.
    pub fn from_fix(child_id: &str, fix: &PositionFix) -> Result<Self, ValidationError> {
        let sample = Self {
            child_id: child_id.to_string(),
            latitude: fix.lat,
            longitude: fix.lon,
            timestamp: fix.ts,
            accuracy: fix.accuracy,
            speed: fix.speed,
            bearing: fix.bearing,
        };
        sample.validate()?;
        Ok(sample)
    }

    /// Range rules also apply to rows decoded off the wire, where serde
    /// alone cannot enforce them.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ValidationError::Latitude(self.latitude));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ValidationError::Longitude(self.longitude));
        }
        check_metric("accuracy", self.accuracy)?;
        check_metric("speed", self.speed)?;
        check_metric("bearing", self.bearing)?;
        Ok(())
    }
}

fn check_metric(field: &'static str, value: Option<f32>) -> Result<(), ValidationError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(ValidationError::Metric { field, value: v }),
        _ => Ok(()),
    }
}

/// A row as echoed by the store: the sample plus server-assigned columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub sample: LocationSample,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

mod ts_millis {
    use serde::{de::Error as _, ser::Error as _, Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::format_description::BorrowedFormatItem;
    use time::macros::format_description;
    use time::OffsetDateTime;

    const MILLIS: &[BorrowedFormatItem<'_>] =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

    pub fn serialize<S: Serializer>(ts: &OffsetDateTime, ser: S) -> Result<S::Ok, S::Error> {
        let text = ts
            .to_offset(time::UtcOffset::UTC)
            .format(&MILLIS)
            .map_err(S::Error::custom)?;
        ser.serialize_str(&text)
    }

    // The store may render timestamps back with an explicit offset, so
    // parsing accepts any RFC 3339 form, not only the millisecond shape.
    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<OffsetDateTime, D::Error> {
        let text = String::deserialize(de)?;
        OffsetDateTime::parse(&text, &Rfc3339).map_err(D::Error::custom)
    }
}
