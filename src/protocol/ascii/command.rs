use std::str::FromStr;

use strum::{AsRefStr, Display, EnumString};

use crate::device::ChannelField;

/// Command verbs understood by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Verb {
    Ping,
    Info,
    Set,
    Read,
}

/// Reason tokens sent back after `ERR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReason {
    UnknownVerb,
    UnknownField,
    BadUnit,
    BadValue,
    Usage,
}

/// A parsed request line.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping,
    Info,
    Set {
        field: ChannelField,
        unit: u8,
        value: String,
    },
    Read {
        field: ChannelField,
        unit: u8,
    },
}

/// Keep only printable ASCII and trim line endings and padding.
pub fn sanitize(raw: &[u8]) -> String {
    let kept: String = raw
        .iter()
        .filter(|b| (b.is_ascii() && !b.is_ascii_control()) || **b == b'\t')
        .map(|&b| b as char)
        .collect();
    kept.trim().to_string()
}

/// Render command parts as one wire line, `\n` terminated.
pub fn format_line<S: AsRef<str>>(parts: &[S]) -> String {
    let mut line = parts
        .iter()
        .map(|part| sanitize(part.as_ref().as_bytes()))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    line.push('\n');
    line
}

pub fn parse_request(line: &str) -> Result<Request, ErrorReason> {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next().ok_or(ErrorReason::Usage)?;
    let verb = Verb::from_str(verb).map_err(|_| ErrorReason::UnknownVerb)?;
    let args: Vec<&str> = tokens.collect();

    match (verb, args.as_slice()) {
        (Verb::Ping, []) => Ok(Request::Ping),
        (Verb::Info, []) => Ok(Request::Info),
        (Verb::Set, [field, unit, value]) => Ok(Request::Set {
            field: parse_field(field)?,
            unit: parse_unit(unit)?,
            value: value.to_string(),
        }),
        (Verb::Read, [field, unit]) => Ok(Request::Read {
            field: parse_field(field)?,
            unit: parse_unit(unit)?,
        }),
        _ => Err(ErrorReason::Usage),
    }
}

fn parse_field(token: &str) -> Result<ChannelField, ErrorReason> {
    ChannelField::from_str(token).map_err(|_| ErrorReason::UnknownField)
}

fn parse_unit(token: &str) -> Result<u8, ErrorReason> {
    token.parse::<u8>().map_err(|_| ErrorReason::BadUnit)
}

/// Parse a `0`/`1` flag argument.
pub fn parse_flag(token: &str) -> Result<bool, ErrorReason> {
    match token {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(ErrorReason::BadValue),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_verb() {
        assert_eq!(parse_request("PING"), Ok(Request::Ping));
        assert_eq!(parse_request("info"), Ok(Request::Info));
        assert_eq!(
            parse_request("SET OVERLOAD 1 1"),
            Ok(Request::Set {
                field: ChannelField::Overload,
                unit: 1,
                value: "1".to_string()
            })
        );
        assert_eq!(
            parse_request("READ START 3"),
            Ok(Request::Read {
                field: ChannelField::Running,
                unit: 3
            })
        );
    }

    #[test]
    fn reports_reasons() {
        assert_eq!(parse_request(""), Err(ErrorReason::Usage));
        assert_eq!(parse_request("JUMP 1"), Err(ErrorReason::UnknownVerb));
        assert_eq!(parse_request("READ VOLTAGE 1"), Err(ErrorReason::UnknownField));
        assert_eq!(parse_request("READ START x"), Err(ErrorReason::BadUnit));
        assert_eq!(parse_request("READ START"), Err(ErrorReason::Usage));
        assert_eq!(parse_request("PING 1"), Err(ErrorReason::Usage));
        assert_eq!(ErrorReason::BadUnit.to_string(), "BAD_UNIT");
    }

    #[test]
    fn sanitize_strips_non_ascii_and_line_endings() {
        assert_eq!(sanitize("READ START 1\r\n".as_bytes()), "READ START 1");
        assert_eq!(sanitize("PI\u{00e9}NG".as_bytes()), "PING");
        assert_eq!(sanitize(&[0xFF, b'O', b'K', 0x00]), "OK");
    }

    #[test]
    fn format_line_joins_parts() {
        assert_eq!(format_line(&["SET", "POWER", "2", "12.5"]), "SET POWER 2 12.5\n");
        assert_eq!(format_line(&["PING", ""]), "PING\n");
    }

    #[test]
    fn flags_are_strict() {
        assert_eq!(parse_flag("1"), Ok(true));
        assert_eq!(parse_flag("0"), Ok(false));
        assert_eq!(parse_flag("yes"), Err(ErrorReason::BadValue));
    }
}
