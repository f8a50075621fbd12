//! Captured response data and the field lookups shared by extraction and
//! assertions.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{DataSource, ResponseInfo};

/// Everything the engine keeps from one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: IndexMap<String, String>,
    pub cookies: IndexMap<String, String>,
    pub body: String,
    /// Parsed body when it is valid JSON.
    pub json: Option<Value>,
    pub elapsed_ms: u64,
}

impl ResponseSnapshot {
    pub fn new(
        status: u16,
        headers: IndexMap<String, String>,
        cookies: IndexMap<String, String>,
        body: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        let body = body.into();
        let json = serde_json::from_str::<Value>(&body).ok();
        Self {
            status,
            headers,
            cookies,
            body,
            json,
            elapsed_ms,
        }
    }

    /// Parsed JSON body, or the raw text when it is not JSON.
    pub fn body_value(&self) -> Value {
        self.json
            .clone()
            .unwrap_or_else(|| Value::String(self.body.clone()))
    }

    pub fn header(&self, name: &str) -> Option<&String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn cookie(&self, name: &str) -> Option<&String> {
        self.cookies.get(name)
    }

    /// Read `locator` from one section of the response. An empty locator
    /// selects the whole section.
    pub fn lookup(
        &self,
        source: DataSource,
        locator: &str,
    ) -> Result<Value, String> {
        match source {
            DataSource::Body => {
                let body = self.body_value();
                get_value_by_path(&body, locator).cloned().ok_or_else(|| {
                    format!("path '{locator}' not found in response body")
                })
            }
            DataSource::Header => {
                if locator.is_empty() {
                    return Ok(string_map(&self.headers));
                }
                self.header(locator)
                    .map(|v| Value::String(v.clone()))
                    .ok_or_else(|| {
                        format!("header '{locator}' not found in response")
                    })
            }
            DataSource::Cookie => {
                if locator.is_empty() {
                    return Ok(string_map(&self.cookies));
                }
                self.cookie(locator)
                    .map(|v| Value::String(v.clone()))
                    .ok_or_else(|| {
                        format!("cookie '{locator}' not found in response")
                    })
            }
            DataSource::Status => Ok(Value::from(self.status)),
            other => Err(format!("{other:?} is not a response section")),
        }
    }

    /// Resolve a prefixed field such as `content.data.id`,
    /// `headers.Content-Type`, `cookies.sid` or `status_code`.
    pub fn resolve_field(&self, field: &str) -> Result<Value, String> {
        let (prefix, rest) = match field.split_once('.') {
            Some((prefix, rest)) => (prefix, rest),
            None => (field, ""),
        };
        let source = match prefix {
            "content" | "body" | "json" => DataSource::Body,
            "headers" => DataSource::Header,
            "cookies" => DataSource::Cookie,
            "status_code" => DataSource::Status,
            _ => return Err(format!("unknown response field '{field}'")),
        };
        self.lookup(source, rest)
    }

    pub fn to_info(&self) -> ResponseInfo {
        ResponseInfo {
            status: self.status,
            headers: self.headers.clone(),
            cookies: self.cookies.clone(),
            body: Some(self.body.clone()),
            elapsed_ms: self.elapsed_ms,
        }
    }
}

fn string_map(map: &IndexMap<String, String>) -> Value {
    let mut obj = Map::new();
    for (k, v) in map {
        obj.insert(k.clone(), Value::String(v.clone()));
    }
    Value::Object(obj)
}

/// Dotted-path lookup; numeric segments index into arrays.
pub fn get_value_by_path<'a>(
    value: &'a Value,
    path: &str,
) -> Option<&'a Value> {
    let mut current = value;

    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }

        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            Value::Array(array) => {
                let index = part.parse::<usize>().ok()?;
                current = array.get(index)?;
            }
            _ => {
                return None;
            }
        }
    }

    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(body: &str) -> ResponseSnapshot {
        let mut headers = IndexMap::new();
        headers.insert(
            "Content-Type".to_string(),
            "application/json".to_string(),
        );
        let mut cookies = IndexMap::new();
        cookies.insert("sid".to_string(), "abc".to_string());
        ResponseSnapshot::new(201, headers, cookies, body, 5)
    }

    #[test]
    fn body_paths_walk_objects_and_arrays() {
        let res = snapshot(r#"{"data":{"items":[{"id":"x"},{"id":"y"}]}}"#);
        assert_eq!(
            res.lookup(DataSource::Body, "data.items.1.id").unwrap(),
            json!("y")
        );
        assert_eq!(
            res.lookup(DataSource::Body, "").unwrap(),
            json!({"data":{"items":[{"id":"x"},{"id":"y"}]}})
        );
        assert!(res.lookup(DataSource::Body, "data.missing").is_err());
    }

    #[test]
    fn headers_are_case_insensitive() {
        let res = snapshot("{}");
        assert_eq!(
            res.lookup(DataSource::Header, "content-type").unwrap(),
            json!("application/json")
        );
        assert!(res.lookup(DataSource::Header, "x-missing").is_err());
    }

    #[test]
    fn prefixed_fields_select_sections() {
        let res = snapshot(r#"{"token":"t1"}"#);
        assert_eq!(res.resolve_field("content.token").unwrap(), json!("t1"));
        assert_eq!(res.resolve_field("cookies.sid").unwrap(), json!("abc"));
        assert_eq!(res.resolve_field("status_code").unwrap(), json!(201));
        assert!(res.resolve_field("elsewhere.x").is_err());
    }

    #[test]
    fn non_json_body_is_text() {
        let res = snapshot("plain text");
        assert_eq!(res.json, None);
        assert_eq!(
            res.lookup(DataSource::Body, "").unwrap(),
            json!("plain text")
        );
    }
}
