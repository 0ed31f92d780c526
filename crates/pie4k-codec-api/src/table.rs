//! Minimal, tolerant 2DA text table parser/serializer (IESDP 2DA V1.0):
//! a signature line, a default-value line, a whitespace-separated header
//! row, then one row per line with a row name followed by its fields.

#[derive(Debug, Default, Clone)]
pub struct TwoDaTable {
    signature: String,
    default_value: String,
    column_names: Vec<String>,
    row_names: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TwoDaTable {
    pub fn load_from_text(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let signature = lines.next()?.trim().to_string();
        let default_value = lines.next()?.trim().to_string();
        let column_names: Vec<String> = split_ws(lines.next()?);

        let mut row_names = Vec::new();
        let mut rows = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = split_ws(line);
            if fields.is_empty() {
                continue;
            }
            row_names.push(fields.remove(0));
            rows.push(fields);
        }

        Some(TwoDaTable {
            signature,
            default_value,
            column_names,
            row_names,
            rows,
        })
    }

    pub fn serialize_to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.signature);
        out.push('\n');
        out.push_str(&self.default_value);
        out.push('\n');
        out.push_str(&self.column_names.join("\t"));
        out.push('\n');
        for (name, fields) in self.row_names.iter().zip(&self.rows) {
            out.push_str(name);
            if !fields.is_empty() {
                out.push('\t');
                out.push_str(&fields.join("\t"));
            }
            out.push('\n');
        }
        out
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Scale every integer cell in rows whose name starts with any of
    /// `prefixes` (case-insensitive) by `factor`.
    pub fn scale_rows_by_prefixes(&mut self, prefixes: &[&str], factor: i64) {
        for (row_name, fields) in self.row_names.iter().zip(self.rows.iter_mut()) {
            let matches = prefixes.iter().any(|p| row_name.to_ascii_uppercase().starts_with(&p.to_ascii_uppercase()));
            if !matches {
                continue;
            }
            for field in fields.iter_mut() {
                if let Ok(value) = field.parse::<i64>() {
                    *field = (value * factor).to_string();
                }
            }
        }
    }

    /// Scale the integer cells of one data column (by zero-based column
    /// index, excluding the row-name column) across all rows, rounding
    /// the floating result.
    pub fn scale_integer_column_by(&mut self, column: usize, factor: f64) {
        for fields in self.rows.iter_mut() {
            if let Some(field) = fields.get_mut(column) {
                if let Ok(value) = field.parse::<i64>() {
                    *field = ((value as f64) * factor).round().to_string();
                }
            }
        }
    }
}

fn split_ws(line: &str) -> Vec<String> {
    line.split_whitespace().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "2DA V1.0\n0\nNAME XPOS YPOS\nSTART_XPOS 100 200\nOTHER 5 6\n";

    #[test]
    fn round_trips_through_load_and_serialize() {
        let table = TwoDaTable::load_from_text(SAMPLE).unwrap();
        assert_eq!(table.column_names, vec!["NAME", "XPOS", "YPOS"]);
        assert_eq!(table.row_names, vec!["START_XPOS", "OTHER"]);
        let text = table.serialize_to_text();
        assert!(text.starts_with("2DA V1.0\n0\n"));
    }

    #[test]
    fn scale_rows_by_prefix_only_touches_matching_rows() {
        let mut table = TwoDaTable::load_from_text(SAMPLE).unwrap();
        table.scale_rows_by_prefixes(&["START_XPOS"], 4);
        assert_eq!(table.rows[0], vec!["400", "800"]);
        assert_eq!(table.rows[1], vec!["5", "6"]);
    }

    #[test]
    fn scale_integer_column_rounds_to_nearest() {
        let mut table = TwoDaTable::load_from_text(SAMPLE).unwrap();
        let idx = table.column_index("XPOS").unwrap();
        table.scale_integer_column_by(idx, 1.5);
        assert_eq!(table.rows[0][0], "150");
    }

    #[test]
    fn unknown_column_lookup_is_case_insensitive() {
        let table = TwoDaTable::load_from_text(SAMPLE).unwrap();
        assert_eq!(table.column_index("xpos"), Some(1));
        assert_eq!(table.column_index("nope"), None);
    }
}
