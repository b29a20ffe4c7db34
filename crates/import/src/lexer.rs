use thiserror::Error;

#[derive(Error, Debug)]
pub enum LexError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Splits delimited text into rows of fields.
///
/// Quoted fields may hold the delimiter and raw newlines, `""` inside quotes
/// is a literal quote, and `\r\n`, `\n` and bare `\r` all end a row. Every
/// field is trimmed. Rows made only of empty fields are dropped. An
/// unterminated quote is closed at end of input rather than rejected.
///
/// No header is assumed: the first row comes back like any other.
pub fn tokenize(text: &str, delimiter: u8) -> Result<Vec<Vec<String>>, LexError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}
