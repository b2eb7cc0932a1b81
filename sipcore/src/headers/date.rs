use core::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::headers::HeaderParse;
use crate::parser::Parser;

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// The `Date` SIP header: an RFC 1123 date, always GMT.
///
/// The value is validated on parse and kept verbatim, e.g.
/// `Sat, 13 Nov 2010 23:29:00 GMT`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Date(Arc<str>);

impl Date {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(value: &str) -> bool {
        // rfc1123-date = wkday "," SP date1 SP time SP "GMT"
        let Some((wkday, rest)) = value.split_once(", ") else {
            return false;
        };
        if !WEEKDAYS.contains(&wkday) {
            return false;
        }
        let fields: Vec<&str> = rest.split(' ').collect();
        let [day, month, year, time, zone] = fields.as_slice() else {
            return false;
        };
        if *zone != "GMT" || !MONTHS.contains(month) {
            return false;
        }
        if day.len() != 2 || day.parse::<u8>().map_or(true, |d| !(1..=31).contains(&d)) {
            return false;
        }
        if year.len() != 4 || year.parse::<u16>().is_err() {
            return false;
        }
        let hms: Vec<&str> = time.split(':').collect();
        let [h, m, s] = hms.as_slice() else {
            return false;
        };
        matches!(h.parse::<u8>(), Ok(0..=23))
            && matches!(m.parse::<u8>(), Ok(0..=59))
            && matches!(s.parse::<u8>(), Ok(0..=60))
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Date::NAME, self.0)
    }
}

impl HeaderParse for Date {
    const NAME: &'static str = "Date";

    fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        let value = parser.read_line_str();
        if !Self::validate(value) {
            return parser.parse_failure("Invalid RFC 1123 date");
        }
        Ok(Date(value.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let date = Date::from_bytes(b"Sat, 13 Nov 2010 23:29:00 GMT\r\n").unwrap();
        assert_eq!(date.as_str(), "Sat, 13 Nov 2010 23:29:00 GMT");
    }

    #[test]
    fn test_reject_invalid() {
        assert!(Date::from_bytes(b"13 Nov 2010 23:29:00 GMT\r\n").is_err());
        assert!(Date::from_bytes(b"Sat, 13 Nov 2010 25:29:00 GMT\r\n").is_err());
        assert!(Date::from_bytes(b"Sat, 13 Nov 2010 23:29:00 PST\r\n").is_err());
    }
}
