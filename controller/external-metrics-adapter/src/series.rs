//! Decoding and reduction of CAQL time series responses

use crate::error::ProviderError;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;

/// One point of a CAQL result: a timestamp and one value per output stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesPoint {
    pub timestamp: f64,
    pub values: Vec<Option<f64>>,
}

impl TimeSeriesPoint {
    /// Value of the first stream; the remaining streams are ignored.
    pub fn first_value(&self) -> Option<f64> {
        self.values.first().copied().flatten()
    }
}

/// Stream values of a point, either nested (`[ts, [v0, v1]]`) or flat (`[ts, v0, v1]`).
#[derive(Deserialize)]
#[serde(untagged)]
enum StreamValues {
    Many(Vec<Option<f64>>),
    One(Option<f64>),
}

impl<'de> Deserialize<'de> for TimeSeriesPoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PointVisitor;

        impl<'de> Visitor<'de> for PointVisitor {
            type Value = TimeSeriesPoint;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a [timestamp, [values...]] pair")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let timestamp: f64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;

                let mut values = Vec::new();
                while let Some(stream) = seq.next_element::<StreamValues>()? {
                    match stream {
                        StreamValues::Many(many) => values.extend(many),
                        StreamValues::One(one) => values.push(one),
                    }
                }

                Ok(TimeSeriesPoint { timestamp, values })
            }
        }

        deserializer.deserialize_seq(PointVisitor)
    }
}

#[derive(Debug, Deserialize)]
struct CaqlResponse {
    #[serde(rename = "_data", default)]
    data: Option<Vec<Option<TimeSeriesPoint>>>,
}

/// Decodes a CAQL response body into its points. Null points are kept as `None`.
pub fn decode_series(body: &[u8]) -> Result<Vec<Option<TimeSeriesPoint>>, ProviderError> {
    let response: CaqlResponse =
        serde_json::from_slice(body).map_err(|e| ProviderError::MalformedResponse {
            message: e.to_string(),
        })?;

    let data = response.data.ok_or(ProviderError::MissingData)?;
    if data.is_empty() {
        return Err(ProviderError::EmptySeries);
    }
    Ok(data)
}

/// Result of reducing a window of points
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reduction {
    pub value: f64,
    /// Latest timestamp among the points that contributed a value.
    pub timestamp: f64,
    pub count: usize,
}

/// Averages the first-stream values of `points`.
///
/// Null points and points without a first value are skipped. Any point stamped
/// after `end_time` (epoch seconds) fails the whole reduction.
pub fn average_points(
    points: &[Option<TimeSeriesPoint>],
    end_time: f64,
) -> Result<Reduction, ProviderError> {
    let mut sum = 0.0;
    let mut count = 0usize;
    let mut latest = f64::MIN;

    for point in points.iter().flatten() {
        if point.timestamp > end_time {
            return Err(ProviderError::FutureDatapoint {
                timestamp: point.timestamp,
                end: end_time,
            });
        }

        let Some(value) = point.first_value() else {
            continue;
        };

        sum += value;
        count += 1;
        if point.timestamp > latest {
            latest = point.timestamp;
        }
    }

    if count == 0 {
        return Err(ProviderError::NoDatapoints);
    }

    Ok(Reduction {
        value: sum / count as f64,
        timestamp: latest,
        count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(timestamp: f64, value: f64) -> Option<TimeSeriesPoint> {
        Some(TimeSeriesPoint {
            timestamp,
            values: vec![Some(value)],
        })
    }

    #[test]
    fn test_decode_nested_points() {
        let body = br#"{"_data": [[100, [5.0, 7.0]], [160, [4.0]]], "_query": "q"}"#;
        let points = decode_series(body).unwrap();

        assert_eq!(points.len(), 2);
        let first = points[0].as_ref().unwrap();
        assert_eq!(first.timestamp, 100.0);
        assert_eq!(first.values, vec![Some(5.0), Some(7.0)]);
        assert_eq!(first.first_value(), Some(5.0));
    }

    #[test]
    fn test_decode_flat_points() {
        let body = br#"{"_data": [[100, 2.5, 9.0]]}"#;
        let points = decode_series(body).unwrap();
        assert_eq!(
            points[0],
            Some(TimeSeriesPoint {
                timestamp: 100.0,
                values: vec![Some(2.5), Some(9.0)],
            })
        );
    }

    #[test]
    fn test_decode_keeps_null_points_and_values() {
        let body = br#"{"_data": [null, [120, [null]], [180, []]]}"#;
        let points = decode_series(body).unwrap();

        assert_eq!(points.len(), 3);
        assert!(points[0].is_none());
        assert_eq!(points[1].as_ref().unwrap().first_value(), None);
        assert_eq!(points[2].as_ref().unwrap().first_value(), None);
    }

    #[test]
    fn test_missing_data_differs_from_empty_series() {
        assert!(matches!(
            decode_series(br#"{"_meta": {}}"#),
            Err(ProviderError::MissingData)
        ));
        assert!(matches!(
            decode_series(br#"{"_data": null}"#),
            Err(ProviderError::MissingData)
        ));
        assert!(matches!(
            decode_series(br#"{"_data": []}"#),
            Err(ProviderError::EmptySeries)
        ));
    }

    #[test]
    fn test_wrong_shapes_are_malformed() {
        for body in [
            &br#"{"_data": "nope"}"#[..],
            &br#"{"_data": [["yesterday", [1.0]]]}"#[..],
            &br#"{"_data": [[]]}"#[..],
            &br#"not json"#[..],
        ] {
            assert!(
                matches!(
                    decode_series(body),
                    Err(ProviderError::MalformedResponse { .. })
                ),
                "body {:?} should be malformed",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_single_point_average() {
        let reduction = average_points(&[point(100.0, 5.0)], 200.0).unwrap();
        assert_eq!(reduction.value, 5.0);
        assert_eq!(reduction.timestamp, 100.0);
        assert_eq!(reduction.count, 1);
    }

    #[test]
    fn test_two_point_average_uses_latest_timestamp() {
        let reduction =
            average_points(&[point(160.0, 4.0), point(100.0, 2.0)], 200.0).unwrap();
        assert_eq!(reduction.value, 3.0);
        assert_eq!(reduction.timestamp, 160.0);
    }

    #[test]
    fn test_null_points_are_skipped() {
        let points = vec![
            None,
            point(100.0, 6.0),
            Some(TimeSeriesPoint {
                timestamp: 150.0,
                values: vec![None, Some(100.0)],
            }),
        ];
        let reduction = average_points(&points, 200.0).unwrap();
        assert_eq!(reduction.value, 6.0);
        assert_eq!(reduction.timestamp, 100.0);
        assert_eq!(reduction.count, 1);
    }

    #[test]
    fn test_point_after_end_time_fails() {
        let err = average_points(&[point(100.0, 1.0), point(201.0, 2.0)], 200.0).unwrap_err();
        assert!(matches!(err, ProviderError::FutureDatapoint { .. }));

        // A point exactly at the boundary is accepted.
        assert!(average_points(&[point(200.0, 1.0)], 200.0).is_ok());
    }

    #[test]
    fn test_all_null_points_fail() {
        let err = average_points(&[None, None], 200.0).unwrap_err();
        assert!(matches!(err, ProviderError::NoDatapoints));
    }
}
