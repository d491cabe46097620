//! Format patterns: validation at check time, application at run time.
//!
//! Each value type has a fixed pattern set. Anything else is a
//! `type.bad_format` at compile time, so the runtime paths can treat an
//! unknown pattern as unreachable and fall back to the plain rendering.

use chrono::NaiveDate;

use crate::types::Ty;

pub const DATE_PATTERNS: &[&str] = &["MM/dd/yyyy", "dd/MM/yyyy", "MMM dd, yyyy", "long"];
pub const DECIMAL_PATTERNS: &[&str] = &["0.00", "#,##0.00", "$0.00"];
pub const INT_PATTERNS: &[&str] = &["#,##0", "0000", "hex"];

/// Does `pattern` apply to values of `ty`?
pub fn validate(ty: &Ty, pattern: &str) -> bool {
    match ty {
        Ty::Date => DATE_PATTERNS.contains(&pattern),
        Ty::Decimal => DECIMAL_PATTERNS.contains(&pattern),
        Ty::Int => INT_PATTERNS.contains(&pattern),
        _ => false,
    }
}

/// Render a scaled decimal with exactly two fractional digits: `3.10`,
/// never `3.1`.
pub fn display_decimal(scaled: i64) -> String {
    let sign = if scaled < 0 { "-" } else { "" };
    let abs = scaled.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

pub fn format_int(value: i32, pattern: &str) -> String {
    match pattern {
        "#,##0" => {
            let sign = if value < 0 { "-" } else { "" };
            format!("{sign}{}", thousands(u64::from(value.unsigned_abs())))
        }
        "0000" => format!("{value:04}"),
        "hex" => format!("0x{:X}", value),
        _ => value.to_string(),
    }
}

pub fn format_decimal(scaled: i64, pattern: &str) -> String {
    let sign = if scaled < 0 { "-" } else { "" };
    let abs = scaled.unsigned_abs();
    match pattern {
        "#,##0.00" => format!("{sign}{}.{:02}", thousands(abs / 100), abs % 100),
        "$0.00" => format!("{sign}${}.{:02}", abs / 100, abs % 100),
        _ => display_decimal(scaled),
    }
}

/// Format an ISO date (`2024-12-31`, or a datetime with that prefix).
/// Unparseable dates render verbatim, matching the plain display rule.
pub fn format_date(iso: &str, pattern: &str) -> String {
    let date_part = if iso.len() >= 10 { &iso[..10] } else { iso };
    let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
        return iso.to_string();
    };
    match pattern {
        "MM/dd/yyyy" => date.format("%m/%d/%Y").to_string(),
        "dd/MM/yyyy" => date.format("%d/%m/%Y").to_string(),
        "MMM dd, yyyy" => date.format("%b %-d, %Y").to_string(),
        "long" => date.format("%A, %B %-d, %Y").to_string(),
        _ => iso.to_string(),
    }
}

fn thousands(mut value: u64) -> String {
    let mut groups = Vec::new();
    loop {
        if value < 1000 {
            groups.push(value.to_string());
            break;
        }
        groups.push(format!("{:03}", value % 1000));
        value /= 1000;
    }
    groups.reverse();
    groups.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_validation_by_type() {
        assert!(validate(&Ty::Decimal, "#,##0.00"));
        assert!(validate(&Ty::Date, "long"));
        assert!(validate(&Ty::Int, "hex"));
        assert!(!validate(&Ty::Int, "#,##0.00"));
        assert!(!validate(&Ty::Text, "0.00"));
        assert!(!validate(&Ty::Decimal, "bogus"));
    }

    #[test]
    fn decimal_display_keeps_two_digits() {
        assert_eq!(display_decimal(310), "3.10");
        assert_eq!(display_decimal(123_456), "1234.56");
        assert_eq!(display_decimal(-250), "-2.50");
        assert_eq!(display_decimal(5), "0.05");
        assert_eq!(display_decimal(0), "0.00");
    }

    #[test]
    fn decimal_patterns() {
        assert_eq!(format_decimal(123_456, "0.00"), "1234.56");
        assert_eq!(format_decimal(123_456, "#,##0.00"), "1,234.56");
        assert_eq!(format_decimal(123_456_789, "#,##0.00"), "1,234,567.89");
        assert_eq!(format_decimal(12_345, "$0.00"), "$123.45");
        assert_eq!(format_decimal(-12_345, "$0.00"), "-$123.45");
    }

    #[test]
    fn int_patterns() {
        assert_eq!(format_int(1_234_567, "#,##0"), "1,234,567");
        assert_eq!(format_int(-1234, "#,##0"), "-1,234");
        assert_eq!(format_int(123, "0000"), "0123");
        assert_eq!(format_int(123, "hex"), "0x7B");
    }

    #[test]
    fn date_patterns() {
        assert_eq!(format_date("2024-12-31", "MM/dd/yyyy"), "12/31/2024");
        assert_eq!(format_date("2024-12-31", "dd/MM/yyyy"), "31/12/2024");
        assert_eq!(format_date("2024-12-31", "MMM dd, yyyy"), "Dec 31, 2024");
        assert_eq!(format_date("2024-12-31", "long"), "Tuesday, December 31, 2024");
    }

    #[test]
    fn datetime_prefix_accepted() {
        assert_eq!(format_date("2024-12-31T08:30:00Z", "MM/dd/yyyy"), "12/31/2024");
    }

    #[test]
    fn unparseable_date_renders_verbatim() {
        assert_eq!(format_date("not-a-date", "MM/dd/yyyy"), "not-a-date");
    }
}
