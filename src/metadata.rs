use crate::config::DrainConfig;
use crate::naming::Fields;
use crate::remote::Headers;
use chrono::{Datelike, NaiveDateTime};
use serde::Serialize;
use std::collections::BTreeMap;

/// A metadata value. Multi-valued fields are sent as numbered headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MetaValue {
    Single(String),
    Multi(Vec<String>),
}

pub type Metadata = BTreeMap<String, MetaValue>;

impl MetaValue {
    /// Scalars become `Single`, sequences `Multi`. Null and mappings are dropped.
    pub fn from_yaml(value: &serde_yaml::Value) -> Option<MetaValue> {
        match value {
            serde_yaml::Value::Sequence(seq) => Some(MetaValue::Multi(
                seq.iter().filter_map(yaml_scalar).collect(),
            )),
            other => yaml_scalar(other).map(MetaValue::Single),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MetaValue::Single(s) => s.is_empty(),
            MetaValue::Multi(v) => v.iter().all(|s| s.is_empty()),
        }
    }

    pub fn joined(&self, sep: &str) -> String {
        match self {
            MetaValue::Single(s) => s.clone(),
            MetaValue::Multi(v) => v.join(sep),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Single(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Single(s)
    }
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Merge layers in order; a key in a later layer replaces the earlier value.
pub fn merge_layers(layers: impl IntoIterator<Item = Metadata>) -> Metadata {
    let mut merged = Metadata::new();
    for layer in layers {
        merged.extend(layer);
    }
    merged
}

/// Dates and serials recovered from the first and last file of a series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesProps {
    pub first_serial: String,
    pub first_file_date: String,
    pub start_date_iso: String,
    pub start_date_hr: String,
    pub scandate: String,
    pub metadate: String,
    pub last_serial: String,
    pub last_date: String,
    pub end_date_iso: String,
    pub end_date_hr: String,
}

impl SeriesProps {
    pub fn from_fields(first: &Fields, last: &Fields) -> Self {
        let first_ts = first.get("timestamp").cloned().unwrap_or_default();
        let last_ts = last.get("timestamp").cloned().unwrap_or_default();
        let start = parse_timestamp(&first_ts);
        let end = parse_timestamp(&last_ts);

        let metadate = match start {
            Some(dt) => dt.year().to_string(),
            None => first_ts.chars().take(4).collect(),
        };

        Self {
            first_serial: first.get("serial").cloned().unwrap_or_default(),
            first_file_date: first_ts.clone(),
            start_date_iso: format_or_raw(start, ISO_FORMAT, &first_ts),
            start_date_hr: format_or_raw(start, HR_FORMAT, &first_ts),
            scandate: first_ts.chars().take(14).collect(),
            metadate,
            last_serial: last.get("serial").cloned().unwrap_or_default(),
            last_date: last_ts.clone(),
            end_date_iso: format_or_raw(end, ISO_FORMAT, &last_ts),
            end_date_hr: format_or_raw(end, HR_FORMAT, &last_ts),
        }
    }

    pub fn date_range(&self) -> String {
        format!("{} to {}", self.start_date_iso, self.end_date_iso)
    }
}

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const HR_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// First 14 digits of a capture timestamp as a date-time.
pub fn parse_timestamp(ts: &str) -> Option<NaiveDateTime> {
    let head = ts.get(..14)?;
    NaiveDateTime::parse_from_str(head, "%Y%m%d%H%M%S").ok()
}

fn format_or_raw(dt: Option<NaiveDateTime>, fmt: &str, raw: &str) -> String {
    match dt {
        Some(dt) => dt.format(fmt).to_string(),
        None => raw.to_string(),
    }
}

/// Plain keyword substitution for the description template.
pub fn expand_description(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter()
        .fold(template.to_string(), |acc, (key, value)| acc.replace(*key, value))
}

/// Full metadata for one item: run metadata plus title, description and
/// the per-series fields.
pub fn derive_item_metadata(
    config: &DrainConfig,
    item: &str,
    props: &SeriesProps,
    num_files: usize,
) -> Metadata {
    let mut md = config.metadata();

    let title = format!("{} {}", config.title_prefix, props.date_range())
        .trim()
        .to_string();
    let crawlhost = config.crawlhost();
    let description = expand_description(
        &config.description,
        &[
            ("CRAWLHOST", crawlhost.as_str()),
            ("CRAWLJOB", config.crawljob.as_str()),
            ("START_DATE", props.start_date_hr.as_str()),
            ("END_DATE", props.end_date_hr.as_str()),
        ],
    );

    md.insert("title".into(), title.into());
    md.insert("description".into(), description.into());
    md.insert("identifier-access".into(), config.details_url(item).into());
    md.insert("scandate".into(), props.scandate.clone().into());
    md.insert("date".into(), props.metadate.clone().into());
    md.insert("crawljob".into(), config.crawljob.clone().into());
    md.insert("numwarcs".into(), num_files.to_string().into());
    md.insert("firstfileserial".into(), props.first_serial.clone().into());
    md.insert("firstfiledate".into(), props.first_file_date.clone().into());
    md.insert("lastfileserial".into(), props.last_serial.clone().into());
    md.insert("lastfiledate".into(), props.last_date.clone().into());
    md.insert("lastdate".into(), props.end_date_iso.clone().into());

    let collections = config.collections();
    if !collections.is_empty() {
        md.insert("collection".into(), MetaValue::Multi(collections));
    }
    md
}

/// RFC 7230 token: what may follow `x-archive-meta-` in a header name.
pub fn is_header_token(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

/// Encode as archive metadata headers. Keys that are not header tokens and
/// empty values are skipped.
pub fn metadata_headers(md: &Metadata) -> Headers {
    let mut headers = Headers::new();
    for (key, value) in md {
        if !is_header_token(key) {
            tracing::warn!(key = %key, "metadata key is not a valid header name, skipped");
            continue;
        }
        match value {
            MetaValue::Single(v) if v.is_empty() => {}
            MetaValue::Single(v) => headers.push((format!("x-archive-meta-{}", key), header_value(v))),
            MetaValue::Multi(values) => {
                for (i, v) in values.iter().filter(|v| !v.is_empty()).enumerate() {
                    headers.push((format!("x-archive-meta{:02}-{}", i + 1, key), header_value(v)));
                }
            }
        }
    }
    headers
}

/// Header-safe form of a value. Anything outside printable ASCII goes
/// through the `uri(...)` percent-encoded wrapper the archive understands.
pub fn header_value(value: &str) -> String {
    if value.bytes().all(|b| (0x20..0x7f).contains(&b)) {
        return value.to_string();
    }
    let mut out = String::from("uri(");
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || b"-_.~ ".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out.push(')');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_merge_precedence() {
        let mut low = Metadata::new();
        low.insert("a".into(), "low".into());
        low.insert("b".into(), "low".into());
        let mut high = Metadata::new();
        high.insert("b".into(), "high".into());

        let merged = merge_layers([low, high]);
        assert_eq!(merged["a"], MetaValue::from("low"));
        assert_eq!(merged["b"], MetaValue::from("high"));
    }

    #[test]
    fn test_series_props() {
        let first = fields(&[("timestamp", "20101212000000123"), ("serial", "00001")]);
        let last = fields(&[("timestamp", "20101213235959000"), ("serial", "00009")]);
        let p = SeriesProps::from_fields(&first, &last);

        assert_eq!(p.start_date_iso, "2010-12-12T00:00:00");
        assert_eq!(p.start_date_hr, "2010-12-12 00:00:00");
        assert_eq!(p.end_date_iso, "2010-12-13T23:59:59");
        assert_eq!(p.scandate, "20101212000000");
        assert_eq!(p.metadate, "2010");
        assert_eq!(p.first_serial, "00001");
        assert_eq!(p.last_serial, "00009");
        assert_eq!(p.date_range(), "2010-12-12T00:00:00 to 2010-12-13T23:59:59");
    }

    #[test]
    fn test_unparseable_timestamp_kept_raw() {
        let first = fields(&[("timestamp", "2010")]);
        let p = SeriesProps::from_fields(&first, &first);
        assert_eq!(p.start_date_iso, "2010");
        assert_eq!(p.metadate, "2010");
    }

    #[test]
    fn test_headers_encoding() {
        let mut md = Metadata::new();
        md.insert("creator".into(), "Internet Archive".into());
        md.insert("collection".into(), MetaValue::Multi(vec!["c1".into(), "c2".into()]));
        md.insert("bad key".into(), "x".into());
        md.insert("dc:title".into(), "x".into());
        md.insert("empty".into(), "".into());

        let headers = metadata_headers(&md);
        assert_eq!(
            headers,
            vec![
                ("x-archive-meta01-collection".to_string(), "c1".to_string()),
                ("x-archive-meta02-collection".to_string(), "c2".to_string()),
                ("x-archive-meta-creator".to_string(), "Internet Archive".to_string()),
            ]
        );
    }

    #[test]
    fn test_header_token() {
        assert!(is_header_token("scanningcenter"));
        assert!(is_header_token("identifier-access"));
        assert!(!is_header_token("dc:title"));
        assert!(!is_header_token("bad key"));
        assert!(!is_header_token(""));
    }

    #[test]
    fn test_header_value_escapes_non_ascii() {
        assert_eq!(header_value("plain text"), "plain text");
        assert_eq!(header_value("caf\u{e9}"), "uri(caf%C3%A9)");
        assert_eq!(header_value("a\nb"), "uri(a%0Ab)");
    }

    #[test]
    fn test_expand_description() {
        let out = expand_description(
            "CRAWLHOST:CRAWLJOB from START_DATE to END_DATE",
            &[
                ("CRAWLHOST", "crawl01"),
                ("CRAWLJOB", "wide"),
                ("START_DATE", "2010-01-01 00:00:00"),
                ("END_DATE", "2010-01-02 00:00:00"),
            ],
        );
        assert_eq!(out, "crawl01:wide from 2010-01-01 00:00:00 to 2010-01-02 00:00:00");
    }
}
