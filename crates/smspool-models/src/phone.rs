//! Validated destination numbers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// A destination number accepted by the dispatcher.
///
/// Two formats are accepted:
///
/// * international: `+`, a 1–3 digit country code, a 3 digit area code and a
///   7 digit subscriber number (11 to 13 digits after the `+`);
/// * domestic: a 4 digit prefix starting with `0` followed by 7 digits.
///
/// # Examples
///
/// ```
/// use smspool_models::PhoneNumber;
///
/// let intl: PhoneNumber = "+34123456789".parse().unwrap();
/// assert_eq!(intl.as_str(), "+34123456789");
///
/// assert!("04121234567".parse::<PhoneNumber>().is_ok());
/// assert!("badnumber".parse::<PhoneNumber>().is_err());
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Return the number as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ModelError> {
        let invalid = |reason: &str| ModelError::InvalidPhoneNumber {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (digits, min, max) = match s.strip_prefix('+') {
            Some(rest) => (rest, 11, 13),
            None if s.starts_with('0') => (s, 11, 11),
            None => {
                return Err(invalid(
                    "must start with '+' (international) or '0' (domestic)",
                ))
            }
        };

        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("must contain only digits after the prefix"));
        }
        if digits.len() < min || digits.len() > max {
            return Err(invalid(if min == max {
                "domestic numbers are a 4 digit prefix followed by 7 digits"
            } else {
                "international numbers carry 11 to 13 digits"
            }));
        }
        Ok(())
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for PhoneNumber {
    type Error = ModelError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::validate(s)?;
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = ModelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl FromStr for PhoneNumber {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

/// Split raw destinations into valid numbers and rejections, preserving order.
pub fn partition_destinations<I, S>(raw: I) -> (Vec<PhoneNumber>, Vec<ModelError>)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut valid = Vec::new();
    let mut rejected = Vec::new();
    for candidate in raw {
        match candidate.as_ref().parse::<PhoneNumber>() {
            Ok(number) => valid.push(number),
            Err(e) => rejected.push(e),
        }
    }
    (valid, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_international_lengths() {
        assert!("+11234567890".parse::<PhoneNumber>().is_ok());
        assert!("+34123456789".parse::<PhoneNumber>().is_ok());
        assert!("+3581234567890".parse::<PhoneNumber>().is_ok());
    }

    #[test]
    fn rejects_international_out_of_range() {
        assert!("+1234567890".parse::<PhoneNumber>().is_err());
        assert!("+35812345678901".parse::<PhoneNumber>().is_err());
        assert!("+34 123456789".parse::<PhoneNumber>().is_err());
    }

    #[test]
    fn accepts_domestic() {
        assert!("04121234567".parse::<PhoneNumber>().is_ok());
    }

    #[test]
    fn rejects_domestic_wrong_length() {
        assert!("0412123456".parse::<PhoneNumber>().is_err());
        assert!("041212345678".parse::<PhoneNumber>().is_err());
    }

    #[test]
    fn rejects_garbage() {
        let err = "badnumber".parse::<PhoneNumber>().unwrap_err();
        assert!(matches!(err, ModelError::InvalidPhoneNumber { ref value, .. } if value == "badnumber"));
        assert!("".parse::<PhoneNumber>().is_err());
        assert!("+".parse::<PhoneNumber>().is_err());
    }

    #[test]
    fn validation_is_idempotent() {
        let inputs = ["+34123456789", "04121234567", "+3581234567890"];
        let (first, rejected) = partition_destinations(inputs);
        assert!(rejected.is_empty());
        let (second, rejected) = partition_destinations(first.iter().map(PhoneNumber::as_str));
        assert!(rejected.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn partition_keeps_order() {
        let (valid, rejected) = partition_destinations(["+34123456789", "badnumber", "04121234567"]);
        assert_eq!(
            valid.iter().map(PhoneNumber::as_str).collect::<Vec<_>>(),
            vec!["+34123456789", "04121234567"]
        );
        assert_eq!(rejected.len(), 1);
    }
}
