use crate::error::{AdvanceError, Result};
use chrono::{Datelike, NaiveDate};

/// Normalizes any date to the first day of its month.
pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date)
}

pub fn next_month(date: NaiveDate) -> NaiveDate {
    let year = if date.month() == 12 {
        date.year() + 1
    } else {
        date.year()
    };

    let month = if date.month() == 12 {
        1
    } else {
        date.month() + 1
    };

    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

pub fn prev_month(date: NaiveDate) -> NaiveDate {
    let year = if date.month() == 1 {
        date.year() - 1
    } else {
        date.year()
    };

    let month = if date.month() == 1 {
        12
    } else {
        date.month() - 1
    };

    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

/// Adds `months` calendar months to the first-of-month of `date`.
pub fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    let mut current = first_of_month(date);
    for _ in 0..months {
        current = next_month(current);
    }
    current
}

pub fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// Every first-of-month date from `start` to `end`, both inclusive.
pub fn months_in_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut months = Vec::new();
    let end = first_of_month(end);

    let mut current = first_of_month(start);
    while current <= end {
        months.push(current);
        current = next_month(current);
    }

    months
}

/// Parses a month in the format "YYYY-MM" (a full "YYYY-MM-DD" date is also
/// accepted and truncated to its month).
pub fn parse_month(month: &str) -> Result<NaiveDate> {
    let trimmed = month.trim();

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(first_of_month(date));
    }

    let month_str = format!("{}-01", trimmed);
    NaiveDate::parse_from_str(&month_str, "%Y-%m-%d").map_err(|_| {
        AdvanceError::DateError(format!(
            "Invalid month format: {}. Expected YYYY-MM",
            month
        ))
    })
}

const FRENCH_MONTHS: [&str; 12] = [
    "Janvier",
    "Février",
    "Mars",
    "Avril",
    "Mai",
    "Juin",
    "Juillet",
    "Août",
    "Septembre",
    "Octobre",
    "Novembre",
    "Décembre",
];

/// Receipt label for a month, e.g. "Mars 2024".
pub fn french_month_label(month: NaiveDate) -> String {
    format!("{} {}", FRENCH_MONTHS[month.month0() as usize], month.year())
}

/// Wall-clock today, for callers that do not carry their own "now".
pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_next_and_prev_month_roll_over_years() {
        assert_eq!(next_month(ymd(2023, 12, 17)), ymd(2024, 1, 1));
        assert_eq!(next_month(ymd(2023, 1, 31)), ymd(2023, 2, 1));
        assert_eq!(prev_month(ymd(2024, 1, 1)), ymd(2023, 12, 1));
        assert_eq!(prev_month(ymd(2024, 3, 15)), ymd(2024, 2, 1));
    }

    #[test]
    fn test_add_months() {
        assert_eq!(add_months(ymd(2024, 1, 20), 0), ymd(2024, 1, 1));
        assert_eq!(add_months(ymd(2024, 11, 1), 3), ymd(2025, 2, 1));
        assert_eq!(add_months(ymd(2024, 1, 1), 24), ymd(2026, 1, 1));
    }

    #[test]
    fn test_months_between() {
        assert_eq!(months_between(ymd(2024, 1, 1), ymd(2024, 4, 1)), 3);
        assert_eq!(months_between(ymd(2023, 11, 1), ymd(2024, 2, 1)), 3);
        assert_eq!(months_between(ymd(2024, 4, 1), ymd(2024, 1, 1)), -3);
    }

    #[test]
    fn test_months_in_range() {
        let months = months_in_range(ymd(2023, 11, 5), ymd(2024, 2, 28));
        assert_eq!(
            months,
            vec![
                ymd(2023, 11, 1),
                ymd(2023, 12, 1),
                ymd(2024, 1, 1),
                ymd(2024, 2, 1)
            ]
        );
        assert!(months_in_range(ymd(2024, 3, 1), ymd(2024, 2, 1)).is_empty());
    }

    #[test]
    fn test_parse_month() {
        assert_eq!(parse_month("2024-02").unwrap(), ymd(2024, 2, 1));
        assert_eq!(parse_month(" 2024-11 ").unwrap(), ymd(2024, 11, 1));
        assert_eq!(parse_month("2024-02-17").unwrap(), ymd(2024, 2, 1));
        assert!(parse_month("2024-13").is_err());
        assert!(parse_month("février").is_err());
    }

    #[test]
    fn test_french_month_label() {
        assert_eq!(french_month_label(ymd(2024, 2, 1)), "Février 2024");
        assert_eq!(french_month_label(ymd(2023, 8, 1)), "Août 2023");
    }
}
