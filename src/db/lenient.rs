//! # 관대한(lenient) 역직렬화 헬퍼
//!
//! 저장된 JSON은 오래된 버전이 썼거나, 손으로 고쳤거나, 중간에 깨졌을 수 있습니다.
//! 읽기 경로에서는 레코드를 거부하지 않고, 필드 단위로 기본값을 채웁니다.
//!
//! 사용법: 필드에 `#[serde(default, deserialize_with = "lenient::or_default")]`처럼 붙입니다.
//! - 필드가 없으면 → `#[serde(default)]`가 기본값을 넣음
//! - 필드가 있지만 타입이 틀리면 → 헬퍼가 기본값으로 대체
//!
//! 패치(부분 수정) 입력에는 이 헬퍼를 쓰지 않습니다. 잘못된 입력은 `InvalidInput`이어야 합니다.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// 타입이 맞지 않으면 `T::default()`
pub fn or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// 음수가 아닌 정수 카운터. 숫자 문자열("12")도 받아들입니다.
/// 음수, NaN, 숫자가 아닌 값은 0이 됩니다. 소수는 버림합니다.
pub fn count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(to_f64(&value)
        .filter(|n| *n >= 0.0)
        .map(|n| n.floor() as u64)
        .unwrap_or(0))
}

/// 유한한 실수. 숫자 문자열도 받아들이고, 그 외에는 0.0
pub fn decimal<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(to_f64(&value).unwrap_or(0.0))
}

/// 밀리초 타임스탬프. 숫자, 숫자 문자열, RFC 3339 문자열을 받아들입니다.
pub fn millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match &value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.timestamp_millis())
            .ok()
            .or_else(|| to_f64(&value).map(|n| n as i64))
            .unwrap_or(0),
        _ => to_f64(&value).map(|n| n as i64).unwrap_or(0),
    })
}

/// ISO 문자열 또는 밀리초 숫자를 `DateTime<Utc>`로. 실패 시 에포크(1970-01-01).
pub fn timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(parse_timestamp(&value).unwrap_or_default())
}

/// `timestamp`의 Option 버전. null이나 해석할 수 없는 값은 `None`.
pub fn optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(parse_timestamp(&value))
}

/// 기본값이 `true`인 플래그. 불리언이 아니면 `true`.
pub fn flag_or_true<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::String(s) => !s.trim().eq_ignore_ascii_case("false"),
        _ => true,
    })
}

/// 배열에서 해석 가능한 원소만 남깁니다. 배열이 아니면 빈 목록.
pub fn list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

/// 객체에서 불리언 값인 항목만 남깁니다. 객체가 아니면 빈 맵.
pub fn flag_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Object(entries) => entries
            .into_iter()
            .filter_map(|(key, value)| value.as_bool().map(|flag| (key, flag)))
            .collect(),
        _ => BTreeMap::new(),
    })
}

/// 패치 입력용: 필드 없음(`None`), `null`(`Some(None)`), 값(`Some(Some(v))`)을 구분합니다.
pub fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// 최상위 레코드 하나를 해석합니다. 객체가 아니거나 해석에 실패하면 기본값.
pub fn document<T>(value: Value) -> T
where
    T: DeserializeOwned + Default,
{
    if !value.is_object() {
        return T::default();
    }
    serde_json::from_value(value).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Unreadable record replaced with defaults");
        T::default()
    })
}

fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(n) => n
            .as_f64()
            .filter(|n| n.is_finite())
            .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    struct Sample {
        #[serde(deserialize_with = "count")]
        steps: u64,
        #[serde(deserialize_with = "decimal")]
        distance: f64,
        #[serde(deserialize_with = "or_default")]
        name: String,
        #[serde(deserialize_with = "millis")]
        at: i64,
        #[serde(deserialize_with = "list")]
        tags: Vec<String>,
    }

    #[test]
    fn test_mistyped_fields_fall_back() {
        let sample: Sample = document(json!({
            "steps": "12",
            "distance": "oops",
            "name": 42,
            "at": "2024-01-01T00:00:00Z",
            "tags": ["a", 1, "b", null]
        }));

        assert_eq!(sample.steps, 12);
        assert_eq!(sample.distance, 0.0);
        assert_eq!(sample.name, "");
        assert_eq!(sample.at, 1_704_067_200_000);
        assert_eq!(sample.tags, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_negative_count_is_zero() {
        let sample: Sample = document(json!({ "steps": -5, "distance": -1.5 }));
        assert_eq!(sample.steps, 0);
        assert_eq!(sample.distance, -1.5);
    }

    #[test]
    fn test_non_object_document_is_default() {
        let sample: Sample = document(json!("garbage"));
        assert_eq!(sample.steps, 0);
        assert!(sample.tags.is_empty());
    }
}
