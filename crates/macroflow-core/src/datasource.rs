//! Tabular datasource for data-driven macros.
//!
//! A [`Datasource`] holds CSV-like rows and a row pointer. The dispatch loop
//! lends it to command handlers, which navigate it and copy the current row
//! into the `!COL1`..`!COL10` variables with
//! [`populate_variables`](Datasource::populate_variables).
//!
//! Quoting follows the usual CSV rules: a field that starts with `"` may
//! contain the delimiter and line breaks verbatim, and `""` inside it is a
//! literal quote.

use std::iter::Peekable;
use std::str::Chars;

use thiserror::Error;
use tracing::debug;

use crate::variables::{self, Variables, COLUMN_SLOTS};

/// Delimiters tried by auto-detection, in tie-break order.
pub const CANDIDATE_DELIMITERS: [char; 4] = [',', '\t', ';', '|'];

/// How many non-empty lines auto-detection looks at.
const DETECT_SAMPLE_LINES: usize = 10;

/// Errors raised while loading or navigating a datasource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatasourceError {
    #[error("datasource '{0}' is empty")]
    Empty(String),

    #[error("datasource '{0}' contains no data rows")]
    NoRows(String),

    #[error("unterminated quoted field starting on line {line}")]
    UnterminatedQuote { line: usize },

    #[error("start line {start} is beyond the {rows} rows loaded")]
    StartLineOutOfRange { start: usize, rows: usize },

    #[error("row {row} is out of range 1..={rows}")]
    RowOutOfRange { row: usize, rows: usize },

    /// A jump past the last row.
    #[error("end of datasource: row {row} requested, {rows} rows available")]
    EndOfData { row: usize, rows: usize },

    #[error("no datasource loaded")]
    NotLoaded,
}

/// Options for [`Datasource::load_from_content`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Field delimiter; auto-detected when `None`.
    pub delimiter: Option<char>,
    /// Treat the first record as column headers.
    pub has_header: bool,
    /// 1-based data row the pointer starts on.
    pub start_line: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            has_header: false,
            start_line: 1,
        }
    }
}

/// Rows of a loaded data file plus a row pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Datasource {
    rows: Vec<Vec<String>>,
    headers: Option<Vec<String>>,
    current_index: usize,
    delimiter: Option<char>,
    source_path: Option<String>,
}

impl Datasource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `content` and replaces whatever was loaded before.
    ///
    /// On error the previous contents are left untouched.
    pub fn load_from_content(
        &mut self,
        content: &str,
        path: &str,
        options: LoadOptions,
    ) -> Result<(), DatasourceError> {
        if content.trim().is_empty() {
            return Err(DatasourceError::Empty(path.to_string()));
        }

        let delimiter = options.delimiter.unwrap_or_else(|| detect_delimiter(content));
        let mut records = parse_records(content, delimiter)?;

        let headers = if options.has_header && !records.is_empty() {
            Some(records.remove(0))
        } else {
            None
        };

        if records.is_empty() {
            return Err(DatasourceError::NoRows(path.to_string()));
        }

        if let Some(ref headers) = headers {
            let width = headers.len();
            for row in &mut records {
                row.resize(width, String::new());
            }
        }

        let start = options.start_line.max(1);
        if start > records.len() {
            return Err(DatasourceError::StartLineOutOfRange {
                start,
                rows: records.len(),
            });
        }

        debug!(
            path,
            rows = records.len(),
            delimiter = %delimiter.escape_default(),
            has_header = headers.is_some(),
            "datasource loaded"
        );

        self.rows = records;
        self.headers = headers;
        self.current_index = start - 1;
        self.delimiter = Some(delimiter);
        self.source_path = Some(path.to_string());
        Ok(())
    }

    /// Drops all rows.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_loaded(&self) -> bool {
        !self.rows.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Header width if there are headers, otherwise the widest row.
    pub fn column_count(&self) -> usize {
        match self.headers {
            Some(ref h) => h.len(),
            None => self.rows.iter().map(Vec::len).max().unwrap_or(0),
        }
    }

    pub fn headers(&self) -> Option<&[String]> {
        self.headers.as_deref()
    }

    pub fn delimiter(&self) -> Option<char> {
        self.delimiter
    }

    pub fn source_path(&self) -> Option<&str> {
        self.source_path.as_deref()
    }

    /// 1-based number of the current row, or 0 when nothing is loaded.
    pub fn current_line_number(&self) -> usize {
        if self.rows.is_empty() {
            0
        } else {
            self.current_index + 1
        }
    }

    pub fn current_row(&self) -> Option<&[String]> {
        self.rows.get(self.current_index).map(Vec::as_slice)
    }

    /// Moves to the next row.
    ///
    /// Returns `false` and leaves the pointer where it is when already on the
    /// last row.
    pub fn next_row(&mut self) -> bool {
        if self.current_index + 1 < self.rows.len() {
            self.current_index += 1;
            true
        } else {
            false
        }
    }

    /// Moves to the previous row; `false` on the first row.
    pub fn previous_row(&mut self) -> bool {
        if self.current_index > 0 && !self.rows.is_empty() {
            self.current_index -= 1;
            true
        } else {
            false
        }
    }

    /// Jumps to a 1-based row.
    pub fn go_to_row(&mut self, row: usize) -> Result<(), DatasourceError> {
        if self.rows.is_empty() {
            return Err(DatasourceError::NotLoaded);
        }
        if row == 0 {
            return Err(DatasourceError::RowOutOfRange {
                row,
                rows: self.rows.len(),
            });
        }
        if row > self.rows.len() {
            return Err(DatasourceError::EndOfData {
                row,
                rows: self.rows.len(),
            });
        }
        self.current_index = row - 1;
        Ok(())
    }

    /// Back to row 1.
    pub fn reset(&mut self) {
        self.current_index = 0;
    }

    /// 1-based column of the current row, `""` when out of range.
    pub fn get_column(&self, column: usize) -> &str {
        column
            .checked_sub(1)
            .and_then(|i| self.current_row()?.get(i))
            .map_or("", String::as_str)
    }

    /// Column of the current row by header name (case-insensitive), `""` if absent.
    pub fn get_column_by_header(&self, name: &str) -> &str {
        let Some(ref headers) = self.headers else {
            return "";
        };
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name.trim()))
            .map_or("", |i| self.get_column(i + 1))
    }

    /// Copies the current row into `!COL1`..`!COL10` and updates the
    /// `!DATASOURCE*` variables.
    ///
    /// Columns past the tenth are not reachable from variables. Slots the
    /// current row does not fill are set to `""`. Does nothing when no data
    /// is loaded.
    pub fn populate_variables(&self, vars: &mut Variables) {
        if !self.is_loaded() {
            return;
        }
        for n in 1..=COLUMN_SLOTS {
            vars.set(&variables::column_slot(n), self.get_column(n));
        }
        if let Some(ref path) = self.source_path {
            vars.set("!DATASOURCE", path.as_str());
        }
        vars.set("!DATASOURCE_LINE", self.current_line_number().to_string());
        vars.set("!DATASOURCE_COLUMNS", self.column_count().to_string());
    }
}

/// Picks the candidate delimiter giving the most consistent field count over
/// the first few non-empty lines. Falls back to `,`.
pub fn detect_delimiter(content: &str) -> char {
    let sample: Vec<&str> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(DETECT_SAMPLE_LINES)
        .collect();

    let mut best = (',', 0usize);
    for candidate in CANDIDATE_DELIMITERS {
        let counts: Vec<usize> = sample
            .iter()
            .map(|line| count_fields(line, candidate))
            .collect();
        let score = consistency_score(&counts);
        if score > best.1 {
            best = (candidate, score);
        }
    }
    best.0
}

/// Number of lines agreeing on the most common field count, or 0 if that
/// count is 1 (the delimiter never split anything).
fn consistency_score(counts: &[usize]) -> usize {
    let mut best_count = 0;
    let mut best_agreement = 0;
    for &c in counts {
        let agreement = counts.iter().filter(|&&x| x == c).count();
        if agreement > best_agreement || (agreement == best_agreement && c > best_count) {
            best_count = c;
            best_agreement = agreement;
        }
    }
    if best_count <= 1 {
        0
    } else {
        best_agreement
    }
}

fn count_fields(line: &str, delimiter: char) -> usize {
    let mut in_quotes = false;
    let mut fields = 1;
    for c in line.chars() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == delimiter && !in_quotes {
            fields += 1;
        }
    }
    fields
}

fn parse_records(content: &str, delimiter: char) -> Result<Vec<Vec<String>>, DatasourceError> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut chars: Peekable<Chars<'_>> = content.chars().peekable();
    let mut line = 1usize;

    while let Some(c) = chars.next() {
        match c {
            '"' if field.is_empty() => {
                let start_line = line;
                loop {
                    match chars.next() {
                        Some('"') if chars.peek() == Some(&'"') => {
                            chars.next();
                            field.push('"');
                        }
                        Some('"') => break,
                        Some(ch) => {
                            if ch == '\n' {
                                line += 1;
                            }
                            field.push(ch);
                        }
                        None => {
                            return Err(DatasourceError::UnterminatedQuote { line: start_line })
                        }
                    }
                }
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                finish_record(&mut records, std::mem::take(&mut record));
                line += 1;
            }
            c if c == delimiter => record.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }

    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        finish_record(&mut records, record);
    }

    Ok(records)
}

fn finish_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    // a line with nothing on it is not a record
    if record.len() == 1 && record[0].is_empty() {
        return;
    }
    records.push(record);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(content: &str, options: LoadOptions) -> Datasource {
        let mut ds = Datasource::new();
        ds.load_from_content(content, "test.csv", options).unwrap();
        ds
    }

    #[test]
    fn test_quoted_delimiter() {
        let ds = load("\"Smith, John\",30,NYC", LoadOptions::default());
        assert_eq!(ds.current_row().unwrap(), ["Smith, John", "30", "NYC"]);
    }

    #[test]
    fn test_doubled_quote() {
        let ds = load("\"He said \"\"hi\"\"\",b", LoadOptions::default());
        assert_eq!(ds.current_row().unwrap(), ["He said \"hi\"", "b"]);
    }

    #[test]
    fn test_quoted_newline() {
        let ds = load("\"line one\nline two\",x\nnext,y\n", LoadOptions::default());
        assert_eq!(ds.row_count(), 2);
        assert_eq!(ds.get_column(1), "line one\nline two");
        assert_eq!(ds.get_column(2), "x");
    }

    #[test]
    fn test_unterminated_quote_fails() {
        let mut ds = Datasource::new();
        let err = ds
            .load_from_content("a,b\n\"open,c\n", "t.csv", LoadOptions::default())
            .unwrap_err();
        assert_eq!(err, DatasourceError::UnterminatedQuote { line: 2 });
        assert!(!ds.is_loaded());
    }

    #[test]
    fn test_empty_content_fails() {
        let mut ds = Datasource::new();
        let err = ds.load_from_content("  \n\n", "empty.csv", LoadOptions::default()).unwrap_err();
        assert_eq!(err, DatasourceError::Empty("empty.csv".to_string()));
        assert!(err.to_string().contains("empty.csv"));
    }

    #[test]
    fn test_header_only_fails() {
        let mut ds = Datasource::new();
        let opts = LoadOptions { has_header: true, ..Default::default() };
        let err = ds.load_from_content("a,b,c\n", "h.csv", opts).unwrap_err();
        assert_eq!(err, DatasourceError::NoRows("h.csv".to_string()));
    }

    #[test]
    fn test_header_pads_and_truncates() {
        let opts = LoadOptions { has_header: true, ..Default::default() };
        let ds = load("name,age,city\nann\nbob,40,LA,extra,more\n", opts);
        assert_eq!(ds.headers().unwrap().len(), 3);
        for row in &ds.rows {
            assert_eq!(row.len(), 3);
        }
        assert_eq!(ds.rows[0], ["ann", "", ""]);
        assert_eq!(ds.rows[1], ["bob", "40", "LA"]);
    }

    #[test]
    fn test_detect_delimiter() {
        assert_eq!(detect_delimiter("a;b;c\n1;2;3\n"), ';');
        assert_eq!(detect_delimiter("a\tb\n1\t2\n"), '\t');
        assert_eq!(detect_delimiter("a|b|c\n1|2|3"), '|');
        assert_eq!(detect_delimiter("a,b\n1,2"), ',');
        assert_eq!(detect_delimiter("single\ncolumn"), ',');
    }

    #[test]
    fn test_detect_prefers_consistent_counts() {
        // commas appear but inconsistently; semicolons split every line evenly
        let content = "a,x;b;c\nd;e;f\ng;h,y,z;i\n";
        assert_eq!(detect_delimiter(content), ';');
    }

    #[test]
    fn test_detect_ignores_quoted_delimiters() {
        assert_eq!(detect_delimiter("\"a;b\",c\n\"d;e\",f"), ',');
    }

    #[test]
    fn test_explicit_delimiter() {
        let opts = LoadOptions { delimiter: Some('|'), ..Default::default() };
        let ds = load("a,b|c", opts);
        assert_eq!(ds.current_row().unwrap(), ["a,b", "c"]);
        assert_eq!(ds.delimiter(), Some('|'));
    }

    #[test]
    fn test_blank_lines_and_crlf() {
        let ds = load("a,b\r\n\r\nc,d\r\n", LoadOptions::default());
        assert_eq!(ds.row_count(), 2);
        assert_eq!(ds.get_column(2), "b");
    }

    #[test]
    fn test_next_row_stops_at_end() {
        let mut ds = load("1\n2\n3", LoadOptions::default());
        assert!(ds.next_row());
        assert!(ds.next_row());
        assert_eq!(ds.current_line_number(), 3);
        assert!(!ds.next_row());
        assert_eq!(ds.current_line_number(), 3);
    }

    #[test]
    fn test_previous_row_stops_at_start() {
        let mut ds = load("1\n2", LoadOptions::default());
        assert!(!ds.previous_row());
        assert_eq!(ds.current_line_number(), 1);
        ds.next_row();
        assert!(ds.previous_row());
        assert_eq!(ds.get_column(1), "1");
    }

    #[test]
    fn test_go_to_row_and_reset() {
        let mut ds = load("1\n2\n3", LoadOptions::default());
        ds.go_to_row(3).unwrap();
        assert_eq!(ds.get_column(1), "3");
        assert_eq!(
            ds.go_to_row(4).unwrap_err(),
            DatasourceError::EndOfData { row: 4, rows: 3 }
        );
        assert_eq!(
            ds.go_to_row(0).unwrap_err(),
            DatasourceError::RowOutOfRange { row: 0, rows: 3 }
        );
        assert_eq!(ds.current_line_number(), 3);
        ds.reset();
        assert_eq!(ds.current_line_number(), 1);
    }

    #[test]
    fn test_go_to_row_without_data() {
        let mut ds = Datasource::new();
        assert_eq!(ds.go_to_row(1).unwrap_err(), DatasourceError::NotLoaded);
        assert_eq!(ds.current_line_number(), 0);
    }

    #[test]
    fn test_start_line() {
        let opts = LoadOptions { start_line: 2, ..Default::default() };
        let ds = load("a\nb\nc", opts);
        assert_eq!(ds.current_line_number(), 2);

        let mut ds = Datasource::new();
        let opts = LoadOptions { start_line: 9, ..Default::default() };
        assert!(matches!(
            ds.load_from_content("a\nb", "x", opts),
            Err(DatasourceError::StartLineOutOfRange { start: 9, rows: 2 })
        ));
    }

    #[test]
    fn test_get_column_out_of_range() {
        let ds = load("a,b,c", LoadOptions::default());
        for n in [0usize, 4, 5, 100, usize::MAX] {
            assert_eq!(ds.get_column(n), "");
        }
        assert_eq!(ds.get_column(3), "c");
    }

    #[test]
    fn test_get_column_by_header() {
        let opts = LoadOptions { has_header: true, ..Default::default() };
        let ds = load("Name,Email\nann,ann@x.io", opts);
        assert_eq!(ds.get_column_by_header("email"), "ann@x.io");
        assert_eq!(ds.get_column_by_header("NAME"), "ann");
        assert_eq!(ds.get_column_by_header("phone"), "");

        let no_headers = load("a,b", LoadOptions::default());
        assert_eq!(no_headers.get_column_by_header("a"), "");
    }

    #[test]
    fn test_populate_variables() {
        let row: Vec<String> = (1..=12).map(|i| format!("c{}", i)).collect();
        let ds = load(&row.join(","), LoadOptions::default());
        let mut vars = Variables::new();
        vars.set("!COL1", "stale");
        ds.populate_variables(&mut vars);
        assert_eq!(vars.get("!COL1").as_deref(), Some("c1"));
        assert_eq!(vars.get("!COL10").as_deref(), Some("c10"));
        assert_eq!(vars.get("!COL11"), None);
        assert_eq!(vars.get("!DATASOURCE").as_deref(), Some("test.csv"));
        assert_eq!(vars.get("!DATASOURCE_LINE").as_deref(), Some("1"));
        assert_eq!(vars.get("!DATASOURCE_COLUMNS").as_deref(), Some("12"));
    }

    #[test]
    fn test_populate_clears_unfilled_slots() {
        let mut ds = load("a,b,c\nd", LoadOptions::default());
        let mut vars = Variables::new();
        ds.populate_variables(&mut vars);
        assert_eq!(vars.get("!COL3").as_deref(), Some("c"));
        ds.next_row();
        ds.populate_variables(&mut vars);
        assert_eq!(vars.get("!COL1").as_deref(), Some("d"));
        assert_eq!(vars.get("!COL3").as_deref(), Some(""));
        assert_eq!(vars.get("!DATASOURCE_LINE").as_deref(), Some("2"));
    }

    #[test]
    fn test_populate_without_data_is_noop() {
        let ds = Datasource::new();
        let mut vars = Variables::new();
        let before = vars.snapshot();
        ds.populate_variables(&mut vars);
        assert_eq!(vars.snapshot(), before);
    }

    #[test]
    fn test_failed_load_keeps_previous_data() {
        let mut ds = load("a,b", LoadOptions::default());
        assert!(ds.load_from_content("", "other.csv", LoadOptions::default()).is_err());
        assert_eq!(ds.source_path(), Some("test.csv"));
        assert_eq!(ds.get_column(1), "a");
    }
}
