/// Longest metric name accepted on the wire.
const MAX_NAME_LEN: usize = 1024;

/// A syntactically valid metric line, not yet matched against any pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPoint {
    pub name: String,
    pub value: f64,
    pub timestamp: i64,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("expected 'name value timestamp', got {0} fields")]
    FieldCount(usize),
    #[error("invalid metric name")]
    Name,
    #[error("invalid value: {0}")]
    Value(String),
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_graphic())
}

/// Parses one `<name> <value> <timestamp>` line. Trailing `\r` from TCP
/// peers using CRLF is tolerated.
pub fn parse_line(line: &str) -> Result<ParsedPoint, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut fields = line.split_ascii_whitespace();
    let (Some(name), Some(value), Some(timestamp), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        let count = line.split_ascii_whitespace().count();
        return Err(ParseError::FieldCount(count));
    };

    if !valid_name(name) {
        return Err(ParseError::Name);
    }

    let value: f64 = value
        .parse()
        .map_err(|_| ParseError::Value(value.to_string()))?;
    if !value.is_finite() {
        return Err(ParseError::Value(value.to_string()));
    }

    // Graphite clients send fractional timestamps; truncate to seconds.
    let timestamp = match timestamp.parse::<i64>() {
        Ok(ts) => ts,
        Err(_) => timestamp
            .parse::<f64>()
            .ok()
            .filter(|ts| ts.is_finite())
            .map(|ts| ts as i64)
            .ok_or_else(|| ParseError::Timestamp(timestamp.to_string()))?,
    };

    Ok(ParsedPoint {
        name: name.to_string(),
        value,
        timestamp,
    })
}
