use chrono::{Datelike, NaiveDate};

use crate::error::RefreshError;

/// `DD/MM/YYYY` 形式の生年月日から `today` 時点の満年齢を計算する。
pub fn calculate_age(dob: &str, today: NaiveDate) -> Result<u32, RefreshError> {
    let trimmed = dob.trim();
    let parts: Vec<&str> = trimmed.split('/').collect();
    let [day, month, year] = parts.as_slice() else {
        return Err(RefreshError::InvalidDate(format!(
            "expected DD/MM/YYYY, got {trimmed:?}"
        )));
    };
    if day.len() != 2 || month.len() != 2 || year.len() != 4 {
        return Err(RefreshError::InvalidDate(format!(
            "expected DD/MM/YYYY, got {trimmed:?}"
        )));
    }
    let parse = |s: &str| {
        s.parse::<u32>()
            .map_err(|_| RefreshError::InvalidDate(format!("not a number: {s:?}")))
    };
    let (day, month, year) = (parse(*day)?, parse(*month)?, parse(*year)?);
    let born = NaiveDate::from_ymd_opt(year as i32, month, day)
        .ok_or_else(|| RefreshError::InvalidDate(format!("no such date: {trimmed}")))?;
    if born > today {
        return Err(RefreshError::InvalidDate(format!(
            "date of birth is in the future: {trimmed}"
        )));
    }

    let mut age = today.year() - born.year();
    if (today.month(), today.day()) < (born.month(), born.day()) {
        age -= 1;
    }
    Ok(age as u32)
}
