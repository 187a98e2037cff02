//! `${name}` placeholder expansion against a [`Payload`].
//!
//! Lookup order for a placeholder: caller-supplied extras, then payload
//! metadata, then the built-ins below. Unknown placeholders are left as-is.
//!
//! | name | value |
//! |---|---|
//! | `timestamp` | payload timestamp in milliseconds |
//! | `date` | `%Y-%m-%d` (UTC) |
//! | `time` | `%H-%M-%S` (UTC) |
//! | `year`, `month`, `day`, `hour` | zero-padded parts of the timestamp |
//! | `size` | byte length, or sub-payload count for a batch |

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::{Captures, Regex};

use super::Payload;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").expect("static regex");
}

impl Payload {
    /// Expands `template` against this payload.
    pub fn expand(&self, template: &str) -> String {
        self.expand_with(template, &[])
    }

    /// Expands `template`, consulting `extras` before anything else.
    pub fn expand_with(&self, template: &str, extras: &[(&str, String)]) -> String {
        if !template.contains("${") {
            return template.to_string();
        }
        let time = DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms());
        PLACEHOLDER
            .replace_all(template, |caps: &Captures| {
                let name = &caps[1];
                self.lookup(name, extras, time.as_ref())
                    .map(Cow::into_owned)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    fn lookup<'a>(
        &'a self,
        name: &str,
        extras: &'a [(&str, String)],
        time: Option<&DateTime<Utc>>,
    ) -> Option<Cow<'a, str>> {
        if let Some((_, value)) = extras.iter().find(|(key, _)| *key == name) {
            return Some(Cow::Borrowed(value.as_str()));
        }
        if let Some(value) = self.metadata().get(name) {
            return Some(Cow::Borrowed(value.as_str()));
        }
        let formatted = match name {
            "timestamp" => self.timestamp_ms().to_string(),
            "size" => self.size().to_string(),
            "date" => time?.format("%Y-%m-%d").to_string(),
            "time" => time?.format("%H-%M-%S").to_string(),
            "year" => time?.format("%Y").to_string(),
            "month" => time?.format("%m").to_string(),
            "day" => time?.format("%d").to_string(),
            "hour" => time?.format("%H").to_string(),
            _ => return None,
        };
        Some(Cow::Owned(formatted))
    }
}
