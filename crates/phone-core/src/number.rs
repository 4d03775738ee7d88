//! Dialled-number normalisation
//!
//! Numbers typed into the widget come in national format most of the time.
//! UK national prefixes are rewritten to E.164 before the number reaches the
//! SDK; everything else is cleaned of formatting and passed through.

use crate::error::{PhoneError, PhoneResult};

/// National trunk prefixes rewritten to the configured country code
const NATIONAL_PREFIXES: [&str; 4] = ["01", "02", "03", "07"];

/// Subscriber digits following the country code in a full national number
const NATIONAL_SIGNIFICANT_DIGITS: usize = 10;

/// Normalise a dialled number
///
/// `country_code` is the digits of the home country code without `+`
/// (`"44"` for the UK).
///
/// ```
/// use link_phone_core::number::normalize_phone_number;
///
/// assert_eq!(normalize_phone_number("07912 345678", "44").unwrap(), "+447912345678");
/// assert_eq!(normalize_phone_number("+1 (555) 010-9999", "44").unwrap(), "+15550109999");
/// ```
pub fn normalize_phone_number(raw: &str, country_code: &str) -> PhoneResult<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')' | '\t'))
        .collect();

    let (has_plus, digits) = match cleaned.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, cleaned.as_str()),
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(PhoneError::InvalidNumber {
            number: raw.to_string(),
        });
    }

    if has_plus {
        return Ok(format!("+{digits}"));
    }

    if let Some(international) = digits.strip_prefix("00") {
        if !international.is_empty() {
            return Ok(format!("+{international}"));
        }
    }

    if NATIONAL_PREFIXES.iter().any(|p| digits.starts_with(p)) {
        return Ok(format!("+{}{}", country_code, &digits[1..]));
    }

    if !country_code.is_empty()
        && digits.starts_with(country_code)
        && digits.len() == country_code.len() + NATIONAL_SIGNIFICANT_DIGITS
    {
        return Ok(format!("+{digits}"));
    }

    Ok(digits.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uk_mobile() {
        assert_eq!(normalize_phone_number("07912345678", "44").unwrap(), "+447912345678");
    }

    #[test]
    fn test_uk_geographic() {
        assert_eq!(normalize_phone_number("020 7946 0958", "44").unwrap(), "+442079460958");
        assert_eq!(normalize_phone_number("0161-496-0000", "44").unwrap(), "+441614960000");
        assert_eq!(normalize_phone_number("0300 123 4567", "44").unwrap(), "+443001234567");
    }

    #[test]
    fn test_already_international() {
        assert_eq!(normalize_phone_number("+44 7912 345678", "44").unwrap(), "+447912345678");
        assert_eq!(normalize_phone_number("0033 1 23 45 67 89", "44").unwrap(), "+33123456789");
    }

    #[test]
    fn test_bare_country_code() {
        assert_eq!(normalize_phone_number("447912345678", "44").unwrap(), "+447912345678");
        // too short to be a full national number
        assert_eq!(normalize_phone_number("4479", "44").unwrap(), "4479");
    }

    #[test]
    fn test_other_country_code() {
        assert_eq!(normalize_phone_number("07912345678", "353").unwrap(), "+3537912345678");
    }

    #[test]
    fn test_short_codes_pass_through() {
        assert_eq!(normalize_phone_number("999", "44").unwrap(), "999");
        assert_eq!(normalize_phone_number("08001234567", "44").unwrap(), "08001234567");
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            normalize_phone_number("", "44"),
            Err(PhoneError::InvalidNumber { .. })
        ));
        assert!(normalize_phone_number("+", "44").is_err());
        assert!(normalize_phone_number("call me", "44").is_err());
        assert!(normalize_phone_number("07912x45678", "44").is_err());
    }
}
