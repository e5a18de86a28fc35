//! Filename patterns and item-name templates.
//!
//! A pattern such as `{prefix}-{timestamp}-{serial}-{host}` is compiled into an
//! anchored regex that also captures the segment suffix (`.warc.gz`, `.arc`,
//! ...). Templates are rendered by plain `{field}` substitution.

use crate::DrainError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

pub const PRESET_HOST: &str = "{prefix}-{timestamp}-{serial}-{host}";
pub const PRESET_PID_HOST_PORT: &str = "{prefix}-{timestamp}-{serial}-{pid}~{host}~{port}";
pub const COMPACT_UPLOAD_PATTERN: &str = "{prefix}-{timestamp}-{serial}";
pub const COMPACT_FILENAME: &str = "{prefix}-{timestamp14}-{serial}{ext}";

const SEGMENT_SUFFIX: &str = r"(?P<ext>\.w?arc(?P<gz>\.gz)?)$";

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^}\s]+)\}").expect("static regex"));
static FIELD_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z][A-Za-z0-9]*)\}").expect("static regex"));
static FIELD_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]*$").expect("static regex"));

/// Named fields pulled out of a segment filename.
pub type Fields = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct FilenamePattern {
    template: String,
    regex: Regex,
    fields: Vec<String>,
}

impl FilenamePattern {
    pub fn compile(template: &str) -> Result<Self, DrainError> {
        let mut source = String::from("^");
        let mut fields = Vec::new();
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(template) {
            let whole = caps.get(0).ok_or("placeholder without match")?;
            source.push_str(&regex::escape(&template[last..whole.start()]));

            let spec = &caps[1];
            let (name, sub) = match spec.split_once(':') {
                Some((name, sub)) => (name, sub),
                None => (spec, ".+?"),
            };
            if !FIELD_NAME.is_match(name) {
                return Err(DrainError::Naming(format!(
                    "invalid field name {:?} in pattern {:?}",
                    name, template
                )));
            }
            if fields.iter().any(|f| f == name) {
                return Err(DrainError::Naming(format!(
                    "field {:?} appears twice in pattern {:?}",
                    name, template
                )));
            }
            source.push_str(&format!("(?P<{}>{})", name, sub));
            fields.push(name.to_string());
            last = whole.end();
        }
        source.push_str(&regex::escape(&template[last..]));
        source.push_str(SEGMENT_SUFFIX);

        Ok(Self {
            template: template.to_string(),
            regex: Regex::new(&source)?,
            fields,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Fields named in the pattern, in order of appearance.
    pub fn field_names(&self) -> &[String] {
        &self.fields
    }

    pub fn matches(&self, basename: &str) -> bool {
        self.regex.is_match(basename)
    }

    /// Extract the pattern fields plus `ext`, `gz`, and the derived
    /// `shost` / `timestamp14` when their sources are present.
    pub fn parse(&self, basename: &str) -> Option<Fields> {
        let caps = self.regex.captures(basename)?;
        let mut fields = Fields::new();
        for name in &self.fields {
            if let Some(m) = caps.name(name) {
                fields.insert(name.clone(), m.as_str().to_string());
            }
        }
        let ext = caps.name("ext").map(|m| m.as_str()).unwrap_or_default();
        let gz = caps.name("gz").map(|m| m.as_str()).unwrap_or_default();
        fields.insert("ext".to_string(), ext.to_string());
        fields.insert("gz".to_string(), gz.to_string());

        if let Some(host) = fields.get("host") {
            let shost = host.split('.').next().unwrap_or(host).to_string();
            fields.insert("shost".to_string(), shost);
        }
        if let Some(ts) = fields.get("timestamp") {
            let ts14: String = ts.chars().take(14).collect();
            fields.insert("timestamp14".to_string(), ts14);
        }
        Some(fields)
    }

    pub fn parse_or_err(&self, basename: &str) -> Result<Fields, DrainError> {
        self.parse(basename).ok_or_else(|| {
            DrainError::Naming(format!(
                "{:?} does not match pattern {:?}",
                basename, self.template
            ))
        })
    }

    /// Every field an item-name template may reference given this pattern.
    pub fn derivable_fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for f in &self.fields {
            out.insert(f.clone());
            out.insert(format!("last{}", f));
        }
        if self.fields.iter().any(|f| f == "host") {
            out.insert("shost".to_string());
            out.insert("lastshost".to_string());
        }
        if self.fields.iter().any(|f| f == "timestamp") {
            out.insert("timestamp14".to_string());
            out.insert("lasttimestamp14".to_string());
        }
        out.insert("suffix".to_string());
        out
    }

    /// Reject templates that reference fields this pattern cannot supply.
    pub fn validate_template(&self, item_template: &str) -> Result<(), DrainError> {
        let known = self.derivable_fields();
        let undefined: Vec<String> = placeholders(item_template)
            .into_iter()
            .filter(|f| !known.contains(f))
            .collect();
        if undefined.is_empty() {
            Ok(())
        } else {
            Err(DrainError::Naming(format!(
                "item_naming has undefined field(s): {}",
                undefined.join(", ")
            )))
        }
    }
}

/// Field references in a template, in order, duplicates kept.
pub fn placeholders(template: &str) -> Vec<String> {
    FIELD_REF
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Substitute `{field}` references. Braces that are not a field reference
/// pass through untouched.
pub fn render(template: &str, fields: &Fields) -> Result<String, DrainError> {
    let mut out = String::with_capacity(template.len() + 32);
    let mut last = 0;
    for caps in FIELD_REF.captures_iter(template) {
        let whole = caps.get(0).ok_or("placeholder without match")?;
        let name = &caps[1];
        let value = fields.get(name).ok_or_else(|| {
            DrainError::Naming(format!("template {:?} needs missing field {:?}", template, name))
        })?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Fields for an item name: the first file's fields, the last file's fields
/// under a `last` prefix, and the collision `suffix`.
pub fn item_fields(first: &Fields, last: &Fields, suffix: &str) -> Fields {
    let mut fields = first.clone();
    for (k, v) in last {
        fields.insert(format!("last{}", k), v.clone());
    }
    fields.insert("suffix".to_string(), suffix.to_string());
    fields
}

/// Render an item name. A non-empty suffix is appended when the template
/// has no `{suffix}` slot of its own.
pub fn item_name(
    template: &str,
    first: &Fields,
    last: &Fields,
    suffix: &str,
) -> Result<String, DrainError> {
    let name = render(template, &item_fields(first, last, suffix))?;
    if !suffix.is_empty() && !placeholders(template).iter().any(|p| p == "suffix") {
        return Ok(format!("{}{}", name, suffix));
    }
    Ok(name)
}

pub fn compact_name(fields: &Fields) -> Result<String, DrainError> {
    render(COMPACT_FILENAME, fields)
}
