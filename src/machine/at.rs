//! AT command string handling: normalisation of unknown commands, quote-aware
//! argument splitting, command-type classification and the vendor command
//! table.

/// How an AT command was phrased by the peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AtCommandType {
    /// `AT+CMD?`
    Read,
    /// `AT+CMD=?`
    Test,
    /// `AT+CMD=...`
    Set,
    Unknown,
}

/// One parsed AT argument. Arguments that parse as integers are carried as
/// such; everything else stays a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtArg {
    Int(i64),
    Str(String),
}

/// Company IDs for the vendor-specific commands we recognise.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CompanyId {
    Plantronics = 85,
    Apple = 76,
    Google = 224,
}

/// Vendor-specific SET commands we accept, mapped to the company that defined
/// them.
pub const VENDOR_SPECIFIC_COMMANDS: [(&str, CompanyId); 4] = [
    ("+XEVENT", CompanyId::Plantronics),
    ("+ANDROID", CompanyId::Google),
    ("+XAPL", CompanyId::Apple),
    ("+IPHONEACCEV", CompanyId::Apple),
];

/// Look up the company ID for a vendor-specific command name.
pub fn vendor_company_id(command: &str) -> Option<CompanyId> {
    VENDOR_SPECIFIC_COMMANDS
        .iter()
        .find(|(name, _)| *name == command)
        .map(|(_, id)| *id)
}

/// Normalise an unrecognised AT command: upper-case everything outside
/// double-quoted spans, strip whitespace, and close an unmatched quote.
pub fn parse_unknown_at(at_string: &str) -> String {
    let mut out = String::with_capacity(at_string.len());
    let chars: Vec<char> = at_string.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            match chars[i + 1..].iter().position(|&x| x == '"') {
                None => {
                    // Unmatched quote: keep the tail and close it ourselves.
                    out.extend(&chars[i..]);
                    out.push('"');
                    break;
                }
                Some(offset) => {
                    let j = i + 1 + offset;
                    out.extend(&chars[i..=j]);
                    i = j;
                }
            }
        } else if c != ' ' {
            out.extend(c.to_uppercase());
        }
        i += 1;
    }
    out
}

/// Classify a normalised AT command (`+XXXX...`) by its suffix.
pub fn at_command_type(at_command: &str) -> AtCommandType {
    let at_command = at_command.trim();
    if at_command.len() <= 5 {
        return AtCommandType::Unknown;
    }
    let suffix = &at_command[5..];
    if suffix.starts_with('?') {
        AtCommandType::Read
    } else if suffix.starts_with("=?") {
        AtCommandType::Test
    } else if suffix.starts_with('=') {
        AtCommandType::Set
    } else {
        AtCommandType::Unknown
    }
}

/// Find `ch` in `input` starting at `from`, skipping double-quoted spans.
/// Returns `input.len()` when not found.
pub fn find_char(ch: char, input: &str, from: usize) -> usize {
    let bytes = input.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '"' {
            match input[i + 1..].find('"') {
                None => return input.len(),
                Some(offset) => i = i + 1 + offset,
            }
        } else if c == ch {
            return i;
        }
        i += 1;
    }
    input.len()
}

/// Break a comma-delimited argument string into individual arguments,
/// respecting double-quoted regions. Integer arguments become [`AtArg::Int`].
pub fn generate_args(input: &str) -> Vec<AtArg> {
    let mut out = Vec::new();
    let mut i = 0;
    while i <= input.len() {
        let j = find_char(',', input, i);
        let arg = &input[i..j];
        match arg.parse::<i64>() {
            Ok(n) => out.push(AtArg::Int(n)),
            Err(_) => out.push(AtArg::Str(arg.to_owned())),
        }
        i = j + 1;
    }
    out
}

/// Type-of-address octet for a phone number: 145 (international) when the
/// number carries a `+` prefix, 129 (unknown) otherwise.
pub fn toa_from_number(number: &str) -> i32 {
    if number.starts_with('+') {
        145
    } else {
        129
    }
}

/// Map pause/wait characters in a dial string to the characters telephony
/// expects, dropping anything else that is not dialable.
pub fn convert_pre_dial(number: &str) -> String {
    number
        .chars()
        .filter_map(|c| match c {
            'p' | 'P' => Some(','),
            'w' | 'W' => Some(';'),
            c if c.is_ascii_digit() => Some(c),
            '+' | '*' | '#' | ',' | ';' => Some(c),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unknown_at_uppercases_outside_quotes() {
        assert_eq!(parse_unknown_at("+cpbr = 1, 10"), "+CPBR=1,10");
        assert_eq!(parse_unknown_at("+cscs=\"utf-8\""), "+CSCS=\"utf-8\"");
    }

    #[test]
    fn test_parse_unknown_at_closes_unmatched_quote() {
        assert_eq!(parse_unknown_at("+cscs=\"utf-8"), "+CSCS=\"utf-8\"");
    }

    #[test]
    fn test_at_command_type() {
        assert_eq!(at_command_type("+CPBR?"), AtCommandType::Read);
        assert_eq!(at_command_type("+CPBR=?"), AtCommandType::Test);
        assert_eq!(at_command_type("+CPBR=1,10"), AtCommandType::Set);
        assert_eq!(at_command_type("+CPBR"), AtCommandType::Unknown);
        assert_eq!(at_command_type("+A"), AtCommandType::Unknown);
    }

    #[test]
    fn test_find_char_skips_quoted_commas() {
        let input = "\"a,b\",c";
        assert_eq!(find_char(',', input, 0), 5);
        assert_eq!(find_char(',', "abc", 0), 3);
    }

    #[test]
    fn test_generate_args_mixed() {
        let args = generate_args("2,5,\"hello, world\"");
        assert_eq!(
            args,
            vec![
                AtArg::Int(2),
                AtArg::Int(5),
                AtArg::Str("\"hello, world\"".to_owned()),
            ]
        );
    }

    #[test]
    fn test_generate_args_empty_input_yields_one_empty_arg() {
        assert_eq!(generate_args(""), vec![AtArg::Str(String::new())]);
    }

    #[test]
    fn test_vendor_company_ids() {
        assert_eq!(vendor_company_id("+XEVENT"), Some(CompanyId::Plantronics));
        assert_eq!(vendor_company_id("+ANDROID"), Some(CompanyId::Google));
        assert_eq!(vendor_company_id("+XAPL"), Some(CompanyId::Apple));
        assert_eq!(vendor_company_id("+IPHONEACCEV"), Some(CompanyId::Apple));
        assert_eq!(vendor_company_id("+NOPE"), None);
    }

    #[test]
    fn test_toa_from_number() {
        assert_eq!(toa_from_number("+14155550100"), 145);
        assert_eq!(toa_from_number("14155550100"), 129);
    }

    #[test]
    fn test_convert_pre_dial() {
        assert_eq!(convert_pre_dial("555p1234"), "555,1234");
        assert_eq!(convert_pre_dial("555w12#"), "555;12#");
        assert_eq!(convert_pre_dial("+1 (415) 555-0100"), "+14155550100");
    }
}
