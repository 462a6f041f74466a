//! Provides the query engine which is applied to collection reads.
//!
//! A GET request for a whole collection may carry query parameters. Every parameter whose
//! name doesn't start with `_` is a filter, the reserved `_sort`, `_order`, `_page` and
//! `_limit` parameters control sorting and pagination. [Directives](Directives) captures
//! the parsed form of such a query string, [Directives::apply](Directives::apply) executes
//! it against a collection snapshot.
use std::cmp::Ordering;

use serde_json::Value;

use crate::store::access::{is_private, resolve, stringify};

/// Contains the parsed query directives of a collection read.
///
/// Application order is fixed: filter, then sort, then paginate.
#[derive(Default, Debug)]
pub struct Directives {
    filters: Vec<(String, String)>,
    sort: Option<String>,
    descending: bool,
    page: Option<(usize, usize)>,
}

impl Directives {
    /// Parses the given raw query string (the part after `?`, without the leading `?`).
    ///
    /// Keys and values are percent-decoded. Filter keys may be dotted paths into nested
    /// objects. Reserved parameters other than the four known ones are ignored, as are
    /// parameters without a value.
    ///
    /// # Example
    ///
    /// ```
    /// # use serde_json::json;
    /// # use shdb::store::query::Directives;
    /// let directives = Directives::parse("address.city=Kiel&_sort=age&_order=desc");
    /// let records = vec![
    ///     json!({ "age": 23, "address": { "city": "Kiel" } }),
    ///     json!({ "age": 42, "address": { "city": "Kiel" } }),
    ///     json!({ "age": 30, "address": { "city": "Hamburg" } }),
    /// ];
    ///
    /// let result = directives.apply(&records);
    /// assert_eq!(result.len(), 2);
    /// assert_eq!(result[0]["age"], json!(42));
    /// ```
    pub fn parse(raw_query: &str) -> Self {
        let mut directives = Directives::default();
        let mut page = None;
        let mut limit = None;

        for parameter in raw_query.split('&').filter(|part| !part.is_empty()) {
            let (key, value) = match parameter.split_once('=') {
                Some((key, value)) => (percent_decode(key), percent_decode(value)),
                None => continue,
            };

            if !is_private(&key) {
                directives.filters.push((key, value));
            } else {
                match key.as_str() {
                    "_sort" => directives.sort = Some(value),
                    "_order" => directives.descending = value.eq_ignore_ascii_case("desc"),
                    "_page" => page = value.parse::<usize>().ok().filter(|page| *page > 0),
                    "_limit" => limit = value.parse::<usize>().ok().filter(|limit| *limit > 0),
                    _ => (),
                }
            }
        }

        // Pagination only takes place if both parameters are positive integers...
        if let (Some(page), Some(limit)) = (page, limit) {
            directives.page = Some((page, limit));
        }

        directives
    }

    /// Determines if these directives would simply return the collection as is.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.sort.is_none() && self.page.is_none()
    }

    /// Applies the directives to the given collection snapshot.
    ///
    /// The snapshot itself is never modified, the result is an independent copy of the
    /// matching records.
    pub fn apply(&self, records: &[Value]) -> Vec<Value> {
        let mut result: Vec<Value> = records
            .iter()
            .filter(|record| self.matches(record))
            .cloned()
            .collect();

        if let Some(sort_key) = &self.sort {
            // Stable sort, so records with equal keys keep their document order...
            result.sort_by(|left, right| {
                let left_value = left.get(sort_key.as_str()).unwrap_or(&Value::Null);
                let right_value = right.get(sort_key.as_str()).unwrap_or(&Value::Null);
                let ordering = compare_values(left_value, right_value);
                if self.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        if let Some((page, limit)) = self.page {
            let start = (page - 1).saturating_mul(limit);
            if start >= result.len() {
                result.clear();
            } else {
                result = result
                    .into_iter()
                    .skip(start)
                    .take(limit)
                    .collect();
            }
        }

        result
    }

    /// Determines if all filters match the given record.
    fn matches(&self, record: &Value) -> bool {
        self.filters.iter().all(|(path, expected)| {
            resolve(record, path)
                .map(|value| stringify(value) == *expected)
                .unwrap_or(false)
        })
    }
}

/// Imposes a total order over heterogeneous JSON values.
///
/// Values of different types order by type rank (null < bool < number < string < rest),
/// values of the same type order naturally. Arrays and objects share the top rank and
/// compare as equal, which keeps the sort stable for them.
fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Bool(left), Value::Bool(right)) => left.cmp(right),
        (Value::Number(left), Value::Number(right)) => left
            .as_f64()
            .unwrap_or(f64::NAN)
            .partial_cmp(&right.as_f64().unwrap_or(f64::NAN))
            .unwrap_or(Ordering::Equal),
        (Value::String(left), Value::String(right)) => left.cmp(right),
        _ => type_rank(left).cmp(&type_rank(right)),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        _ => 4,
    }
}

/// Decodes `%XX` escapes and `+` within a query parameter.
///
/// Malformed escape sequences are passed through verbatim rather than rejected, as a
/// filter against a literal `%` should still be expressible.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                result.push(b' ');
                index += 1;
            }
            b'%' => {
                if index + 2 < bytes.len() {
                    if let Ok(value) = u8::from_str_radix(
                        std::str::from_utf8(&bytes[index + 1..index + 3]).unwrap_or(""),
                        16,
                    ) {
                        result.push(value);
                        index += 3;
                        continue;
                    }
                }
                result.push(b'%');
                index += 1;
            }
            byte => {
                result.push(byte);
                index += 1;
            }
        }
    }

    String::from_utf8_lossy(&result).into_owned()
}
