//! Delimited wire format: comma-separated cells, semicolon-separated values
//! inside multi-valued cells, double quotes around cells that contain a
//! delimiter or quote. An empty cell means "unset".

pub const DELIMITER: char = ',';
pub const LIST_DELIMITER: char = ';';

/// Splits one line into cells, honoring double-quoted cells with `""`
/// escapes.
pub fn split_line(line: &str) -> Result<Vec<String>, String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();

    loop {
        match chars.next() {
            None => {
                cells.push(current);
                return Ok(cells);
            }
            Some('"') if current.is_empty() => {
                loop {
                    match chars.next() {
                        None => return Err("unterminated quoted cell".to_string()),
                        Some('"') => {
                            if chars.peek() == Some(&'"') {
                                chars.next();
                                current.push('"');
                            } else {
                                break;
                            }
                        }
                        Some(c) => current.push(c),
                    }
                }
                match chars.next() {
                    None => {
                        cells.push(std::mem::take(&mut current));
                        return Ok(cells);
                    }
                    Some(DELIMITER) => cells.push(std::mem::take(&mut current)),
                    Some(c) => {
                        return Err(format!("unexpected '{}' after closing quote", c));
                    }
                }
            }
            Some(DELIMITER) => cells.push(std::mem::take(&mut current)),
            Some(c) => current.push(c),
        }
    }
}

pub fn quote_cell(cell: &str) -> String {
    if cell.contains(DELIMITER) || cell.contains('"') || cell.contains('\n') || cell.contains('\r')
    {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

pub fn join_line<S: AsRef<str>>(cells: &[S]) -> String {
    cells
        .iter()
        .map(|c| quote_cell(c.as_ref()))
        .collect::<Vec<_>>()
        .join(&DELIMITER.to_string())
}

/// Splits a multi-valued cell on the secondary delimiter, dropping empty
/// entries.
pub fn split_values(cell: &str) -> Vec<String> {
    cell.split(LIST_DELIMITER)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

pub fn join_values<S: AsRef<str>>(values: &[S]) -> String {
    values
        .iter()
        .map(|v| v.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(&LIST_DELIMITER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_cells() {
        assert_eq!(
            split_line("a,,c").unwrap(),
            vec!["a".to_string(), "".to_string(), "c".to_string()]
        );
        assert_eq!(split_line("").unwrap(), vec!["".to_string()]);
    }

    #[test]
    fn splits_quoted_cells() {
        assert_eq!(
            split_line(r#""a,b",c"#).unwrap(),
            vec!["a,b".to_string(), "c".to_string()]
        );
        assert_eq!(
            split_line(r#""say ""hi""",x"#).unwrap(),
            vec!["say \"hi\"".to_string(), "x".to_string()]
        );
        assert!(split_line("\"abc").is_err());
    }

    #[test]
    fn rejects_garbage_after_closing_quote() {
        assert!(split_line(r#""a"b,c"#).is_err());
    }

    #[test]
    fn join_and_split_round_trip() {
        let cells = vec!["plain", "with,comma", "with\"quote", ""];
        let line = join_line(&cells);
        let back = split_line(&line).unwrap();
        assert_eq!(back, cells);
    }

    #[test]
    fn multi_value_cells() {
        assert_eq!(split_values(""), Vec::<String>::new());
        assert_eq!(split_values("t1"), vec!["t1".to_string()]);
        assert_eq!(
            split_values("t1; t2;"),
            vec!["t1".to_string(), "t2".to_string()]
        );
        assert_eq!(join_values(&["t1", "t2"]), "t1;t2");
    }
}
