//! Variable namespace and `{{name}}` expansion.
//!
//! All names are case-insensitive and stored upper-cased. Names starting with
//! `!` are *system* variables and must belong to a fixed, recognized set;
//! anything else is a *custom* variable.
//!
//! Writing an unrecognized `!` name is a silent no-op: [`Variables::set`]
//! returns a [`SetResult`] with `success == false` and leaves the store
//! untouched, and a later read returns `None`. Existing macros depend on this,
//! so it is kept even though it hides typos such as `!VAR11`.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Local, Timelike};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Recognized system variable names.
pub const SYSTEM_VARIABLES: &[&str] = &[
    "!VAR0", "!VAR1", "!VAR2", "!VAR3", "!VAR4", "!VAR5", "!VAR6", "!VAR7", "!VAR8", "!VAR9",
    "!COL1", "!COL2", "!COL3", "!COL4", "!COL5", "!COL6", "!COL7", "!COL8", "!COL9", "!COL10",
    "!LOOP",
    "!EXTRACT",
    "!EXTRACT_TEST_POPUP",
    "!DATASOURCE",
    "!DATASOURCE_LINE",
    "!DATASOURCE_COLUMNS",
    "!DATASOURCE_DELIMITER",
    "!ERRORIGNORE",
    "!ERRORLOOP",
    "!TIMEOUT",
    "!TIMEOUT_STEP",
    "!TIMEOUT_PAGE",
    "!TIMEOUT_TAG",
    "!TIMEOUT_DOWNLOAD",
    "!TIMEOUT_MACRO",
    "!REPLAYSPEED",
    "!CLIPBOARD",
    "!FOLDER_DATASOURCE",
    "!FOLDER_DOWNLOAD",
    "!FOLDER_MACROS",
    "!FILESTOPWATCH",
    "!STOPWATCHTIME",
    "!URLCURRENT",
    "!POPUP_ALLOWED",
    "!WAITPAGECOMPLETE",
    "!DOWNLOADED_FILE_NAME",
    "!SINGLESTEP",
    "!ENCRYPTION",
    "!IMAGEX",
    "!IMAGEY",
];

/// Values every fresh namespace starts with.
const DEFAULTS: &[(&str, &str)] = &[
    ("!LOOP", "1"),
    ("!ERRORIGNORE", "NO"),
    ("!ERRORLOOP", "NO"),
    ("!TIMEOUT", "60"),
    ("!TIMEOUT_STEP", "6"),
    ("!TIMEOUT_PAGE", "60"),
    ("!REPLAYSPEED", "MEDIUM"),
    ("!EXTRACT_TEST_POPUP", "YES"),
];

/// Number of `!COLn` slots a datasource row can fill.
pub const COLUMN_SLOTS: usize = 10;

const NOW: &str = "!NOW";
const DEFAULT_NOW_FORMAT: &str = "yyyymmdd_hhnnss";

/// Normalizes a variable name for lookup.
pub fn normalize(name: &str) -> String {
    name.trim().to_uppercase()
}

/// Whether `name` is in the recognized system set.
pub fn is_system_name(name: &str) -> bool {
    let upper = normalize(name);
    SYSTEM_VARIABLES.contains(&upper.as_str())
}

/// Name of the `n`-th column slot (1-based), e.g. `!COL3`.
pub fn column_slot(n: usize) -> String {
    format!("!COL{}", n)
}

/// Outcome of [`Variables::set`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetResult {
    pub success: bool,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
}

/// Outcome of [`Variables::expand`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Expansion {
    pub expanded: String,
    /// Upper-cased names in first-seen order, without duplicates.
    pub referenced_names: Vec<String>,
}

/// A piece of text split at `{{name}}` markers.
#[derive(Debug, Clone, PartialEq)]
enum StringSegment<'a> {
    Literal(&'a str),
    Variable(String),
}

fn segments(text: &str) -> Vec<StringSegment<'_>> {
    let mut out = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        let name = normalize(&after[..end]);
        if name.is_empty() {
            // `{{}}` is not a marker
            out.push(StringSegment::Literal(&rest[..start + end + 4]));
        } else {
            if start > 0 {
                out.push(StringSegment::Literal(&rest[..start]));
            }
            out.push(StringSegment::Variable(name));
        }
        rest = &after[end + 2..];
    }

    if !rest.is_empty() {
        out.push(StringSegment::Literal(rest));
    }
    out
}

/// Upper-cased names of every `{{name}}` marker in `text`, deduplicated.
pub fn references(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for seg in segments(text) {
        if let StringSegment::Variable(name) = seg {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

/// Replaces the macro whitespace tokens `<SP>`, `<BR>`, `<LF>` and `<TAB>`.
pub fn decode_special_tokens(text: &str) -> String {
    if !text.contains('<') {
        return text.to_string();
    }
    text.replace("<SP>", " ")
        .replace("<BR>", "\n")
        .replace("<LF>", "\n")
        .replace("<TAB>", "\t")
}

/// Whether a variable value reads as "on" (`YES`, `TRUE`, `1`, `ON`).
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_uppercase().as_str(),
        "YES" | "TRUE" | "1" | "ON"
    )
}

/// Renders a timestamp with the macro date tokens
/// `yyyy yy mm dd hh nn ss dow doy`. Other characters are copied verbatim.
pub fn format_now(format: &str, now: &DateTime<Local>) -> String {
    let mut out = String::new();
    let mut rest = format;

    while !rest.is_empty() {
        let (token, len) = if rest.starts_with("yyyy") {
            (format!("{:04}", now.year()), 4)
        } else if rest.starts_with("dow") {
            (now.weekday().number_from_sunday().to_string(), 3)
        } else if rest.starts_with("doy") {
            (now.ordinal().to_string(), 3)
        } else if rest.starts_with("yy") {
            (format!("{:02}", now.year() % 100), 2)
        } else if rest.starts_with("mm") {
            (format!("{:02}", now.month()), 2)
        } else if rest.starts_with("dd") {
            (format!("{:02}", now.day()), 2)
        } else if rest.starts_with("hh") {
            (format!("{:02}", now.hour()), 2)
        } else if rest.starts_with("nn") {
            (format!("{:02}", now.minute()), 2)
        } else if rest.starts_with("ss") {
            (format!("{:02}", now.second()), 2)
        } else {
            let ch = rest.chars().next().map_or(1, char::len_utf8);
            (rest[..ch].to_string(), ch)
        };
        out.push_str(&token);
        rest = &rest[len..];
    }
    out
}

/// The variable store for one macro run.
#[derive(Debug, Clone, PartialEq)]
pub struct Variables {
    values: HashMap<String, String>,
}

impl Default for Variables {
    fn default() -> Self {
        Self::new()
    }
}

impl Variables {
    /// Creates a namespace holding the default system values.
    pub fn new() -> Self {
        let values = DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { values }
    }

    /// Creates a namespace with no values at all.
    pub fn empty() -> Self {
        Self { values: HashMap::new() }
    }

    /// Reads a variable. `!NOW` and `!NOW:<format>` are computed on read.
    pub fn get(&self, name: &str) -> Option<String> {
        let key = normalize(name);
        if key == NOW {
            return Some(format_now(DEFAULT_NOW_FORMAT, &Local::now()));
        }
        if let Some(format) = key.strip_prefix("!NOW:") {
            return Some(format_now(&format.to_lowercase(), &Local::now()));
        }
        self.values.get(&key).cloned()
    }

    /// Whether a variable is writable: any custom name, or a recognized system name.
    pub fn is_writable(name: &str) -> bool {
        let key = normalize(name);
        !key.is_empty() && (!key.starts_with('!') || SYSTEM_VARIABLES.contains(&key.as_str()))
    }

    /// Writes a variable.
    ///
    /// Unrecognized `!` names are dropped; the returned result has
    /// `success == false` and nothing changes.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> SetResult {
        let key = normalize(name);
        if !Self::is_writable(&key) {
            debug!(name = %key, "dropped write to unrecognized system variable");
            return SetResult {
                success: false,
                previous_value: None,
                new_value: None,
            };
        }
        let value = value.into();
        trace!(name = %key, value = %value, "set variable");
        let previous_value = self.values.insert(key, value.clone());
        SetResult {
            success: true,
            previous_value,
            new_value: Some(value),
        }
    }

    /// Removes a variable, returning its old value.
    pub fn unset(&mut self, name: &str) -> Option<String> {
        self.values.remove(&normalize(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(&normalize(name))
    }

    /// Reads a yes/no variable (see [`is_truthy`]). Unset reads as `false`.
    pub fn flag(&self, name: &str) -> bool {
        self.get(name).map_or(false, |v| is_truthy(&v))
    }

    /// Reads a numeric variable.
    pub fn get_number(&self, name: &str) -> Option<f64> {
        self.get(name)?.trim().parse().ok()
    }

    /// Substitutes every `{{name}}` with its value, or `""` when unset.
    ///
    /// This is a single pass: text produced by a substitution is never
    /// scanned again, so a value containing `{{x}}` stays literal.
    pub fn expand(&self, text: &str) -> Expansion {
        let mut expansion = Expansion {
            expanded: String::with_capacity(text.len()),
            referenced_names: Vec::new(),
        };
        for seg in segments(text) {
            match seg {
                StringSegment::Literal(s) => expansion.expanded.push_str(s),
                StringSegment::Variable(name) => {
                    if let Some(value) = self.get(&name) {
                        expansion.expanded.push_str(&value);
                    }
                    if !expansion.referenced_names.contains(&name) {
                        expansion.referenced_names.push(name);
                    }
                }
            }
        }
        expansion
    }

    /// Copy of every stored value, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Replaces the whole namespace with `values`.
    ///
    /// Names are normalized; unrecognized system names are dropped as in [`set`](Self::set).
    pub fn restore(&mut self, values: &BTreeMap<String, String>) {
        self.values.clear();
        for (k, v) in values {
            self.set(k, v.clone());
        }
    }

    /// Names of the custom (non-system) variables currently set.
    pub fn custom_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .values
            .keys()
            .filter(|k| !k.starts_with('!'))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_defaults_installed() {
        let vars = Variables::new();
        assert_eq!(vars.get("!LOOP").as_deref(), Some("1"));
        assert_eq!(vars.get("!timeout_step").as_deref(), Some("6"));
        assert!(!vars.flag("!ERRORIGNORE"));
        assert!(Variables::empty().is_empty());
    }

    #[test]
    fn test_set_get_case_insensitive() {
        let mut vars = Variables::new();
        let r = vars.set("myVar", "x");
        assert!(r.success);
        assert_eq!(r.previous_value, None);
        assert_eq!(r.new_value.as_deref(), Some("x"));
        assert_eq!(vars.get("MYVAR").as_deref(), Some("x"));
        assert_eq!(vars.get("myvar").as_deref(), Some("x"));

        let r = vars.set("MyVar", "y");
        assert_eq!(r.previous_value.as_deref(), Some("x"));
    }

    #[test]
    fn test_system_variable_write() {
        let mut vars = Variables::new();
        assert!(vars.set("!var1", "hello").success);
        assert_eq!(vars.get("!VAR1").as_deref(), Some("hello"));
    }

    #[test]
    fn test_unrecognized_system_write_is_dropped() {
        let mut vars = Variables::new();
        let before = vars.snapshot();
        let r = vars.set("!VAR11", "x");
        assert!(!r.success);
        assert_eq!(r.previous_value, None);
        assert_eq!(r.new_value, None);
        assert_eq!(vars.get("!VAR11"), None);
        assert_eq!(vars.snapshot(), before);
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut vars = Variables::new();
        assert!(!vars.set("  ", "x").success);
    }

    #[test]
    fn test_expand_basic() {
        let mut vars = Variables::new();
        vars.set("!VAR1", "world");
        let e = vars.expand("hello {{!var1}}!");
        assert_eq!(e.expanded, "hello world!");
        assert_eq!(e.referenced_names, vec!["!VAR1".to_string()]);
    }

    #[test]
    fn test_expand_unset_is_empty() {
        let vars = Variables::new();
        let e = vars.expand("[{{missing}}]");
        assert_eq!(e.expanded, "[]");
        assert_eq!(e.referenced_names, vec!["MISSING".to_string()]);
    }

    #[test]
    fn test_expand_is_not_recursive() {
        let mut vars = Variables::new();
        vars.set("a", "{{b}}");
        vars.set("b", "boom");
        assert_eq!(vars.expand("{{a}}").expanded, "{{b}}");
    }

    #[test]
    fn test_expand_self_reference_terminates() {
        let mut vars = Variables::new();
        vars.set("loop", "{{loop}}{{loop}}");
        assert_eq!(vars.expand("{{loop}}").expanded, "{{loop}}{{loop}}");
    }

    #[test]
    fn test_expand_leaves_unterminated_and_empty_markers() {
        let vars = Variables::new();
        assert_eq!(vars.expand("a {{b").expanded, "a {{b");
        assert_eq!(vars.expand("a {{}} b").expanded, "a {{}} b");
    }

    #[test]
    fn test_expand_dedupes_names() {
        let mut vars = Variables::new();
        vars.set("x", "1");
        let e = vars.expand("{{x}}{{X}}{{y}}");
        assert_eq!(e.expanded, "11");
        assert_eq!(e.referenced_names, vec!["X".to_string(), "Y".to_string()]);
    }

    #[test]
    fn test_references() {
        assert_eq!(references("{{a}} and {{!COL1}}"), vec!["A".to_string(), "!COL1".to_string()]);
        assert!(references("plain").is_empty());
    }

    #[test]
    fn test_decode_special_tokens() {
        assert_eq!(decode_special_tokens("a<SP>b<BR>c<TAB>d"), "a b\nc\td");
        assert_eq!(decode_special_tokens("<unchanged>"), "<unchanged>");
    }

    #[test]
    fn test_format_now_tokens() {
        let t = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        assert_eq!(format_now("yyyymmdd_hhnnss", &t), "20240307_090502");
        assert_eq!(format_now("dd.mm.yy", &t), "07.03.24");
        assert_eq!(format_now("doy", &t), "67");
    }

    #[test]
    fn test_now_is_read_only_and_computed() {
        let mut vars = Variables::new();
        assert!(!vars.set("!NOW", "x").success);
        let now = vars.get("!NOW:yyyy").unwrap();
        assert_eq!(now.len(), 4);
        assert!(now.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut vars = Variables::new();
        vars.set("a", "1");
        let snap = vars.snapshot();
        vars.set("a", "2");
        vars.set("b", "3");
        vars.restore(&snap);
        assert_eq!(vars.get("a").as_deref(), Some("1"));
        assert_eq!(vars.get("b"), None);
    }

    #[test]
    fn test_custom_names() {
        let mut vars = Variables::new();
        vars.set("zeta", "1");
        vars.set("alpha", "1");
        vars.set("!VAR1", "1");
        assert_eq!(vars.custom_names(), vec!["ALPHA".to_string(), "ZETA".to_string()]);
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy("yes"));
        assert!(is_truthy(" TRUE "));
        assert!(!is_truthy("NO"));
        assert!(!is_truthy(""));
    }
}
