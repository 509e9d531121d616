//! Permission codec.
//!
//! Converts between the 3-digit octal notation used in configuration
//! (`"640"`) and the per-subject use/manage/admin bits the API stores.

use std::fmt;
use std::str::FromStr;

use crate::error::{ConfigError, NebulaError, Result};
use crate::one::Value;
use crate::template::Element;

/// Use/manage/admin bits for one subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermissionSet {
    /// Use right (most significant bit).
    pub usage: bool,
    /// Manage right.
    pub manage: bool,
    /// Admin right (least significant bit).
    pub admin: bool,
}

impl PermissionSet {
    /// Builds the set from one octal digit.
    #[must_use]
    pub const fn from_digit(digit: u8) -> Self {
        Self {
            usage: digit & 0b100 != 0,
            manage: digit & 0b010 != 0,
            admin: digit & 0b001 != 0,
        }
    }

    /// Returns the octal digit for this set.
    #[must_use]
    pub const fn digit(self) -> u8 {
        (self.usage as u8) << 2 | (self.manage as u8) << 1 | self.admin as u8
    }

    fn args(self) -> [Value; 3] {
        [
            Value::Int(i64::from(self.usage)),
            Value::Int(i64::from(self.manage)),
            Value::Int(i64::from(self.admin)),
        ]
    }
}

/// Owner, group and other permission sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    /// Owner rights.
    pub owner: PermissionSet,
    /// Group rights.
    pub group: PermissionSet,
    /// Rights for everyone else.
    pub other: PermissionSet,
}

impl Permissions {
    /// Encodes a 3-digit octal permission string.
    ///
    /// # Errors
    ///
    /// Returns a validation error unless the input is exactly three characters
    /// in `'0'..='7'`.
    pub fn encode(input: &str) -> Result<Self> {
        let bytes = input.as_bytes();
        if bytes.len() != 3 {
            return Err(invalid(input, "must be exactly 3 digits"));
        }

        let mut digits = [0u8; 3];
        for (slot, byte) in digits.iter_mut().zip(bytes) {
            if !(b'0'..=b'7').contains(byte) {
                return Err(invalid(input, "digits must be in 0-7"));
            }
            *slot = byte - b'0';
        }

        Ok(Self {
            owner: PermissionSet::from_digit(digits[0]),
            group: PermissionSet::from_digit(digits[1]),
            other: PermissionSet::from_digit(digits[2]),
        })
    }

    /// Decodes back into the 3-digit string.
    #[must_use]
    pub fn decode(&self) -> String {
        self.to_string()
    }

    /// Returns the nine positional flags a `chmod` call takes after the ID.
    #[must_use]
    pub fn chmod_args(&self) -> Vec<Value> {
        [self.owner, self.group, self.other]
            .into_iter()
            .flat_map(PermissionSet::args)
            .collect()
    }

    /// Reads a `PERMISSIONS` element (`OWNER_U`, `OWNER_M`, ... `OTHER_A`).
    ///
    /// # Errors
    ///
    /// Returns an error if a flag is not an integer.
    pub fn from_element(element: &Element) -> Result<Self> {
        let flag = |name: &str| -> Result<bool> { Ok(element.child_i64(name)?.unwrap_or(0) != 0) };
        let set = |prefix: &str| -> Result<PermissionSet> {
            Ok(PermissionSet {
                usage: flag(&format!("{prefix}_U"))?,
                manage: flag(&format!("{prefix}_M"))?,
                admin: flag(&format!("{prefix}_A"))?,
            })
        };

        Ok(Self {
            owner: set("OWNER")?,
            group: set("GROUP")?,
            other: set("OTHER")?,
        })
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.owner.digit(),
            self.group.digit(),
            self.other.digit()
        )
    }
}

impl FromStr for Permissions {
    type Err = NebulaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::encode(s)
    }
}

fn invalid(input: &str, reason: &str) -> NebulaError {
    ConfigError::validation(
        format!("invalid permission string '{input}': {reason}"),
        "permissions",
    )
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_octal_string_round_trips() {
        for n in 0..512u32 {
            let s = format!("{}{}{}", n / 64, (n / 8) % 8, n % 8);
            let encoded = Permissions::encode(&s).expect("valid permission string");
            assert_eq!(encoded.decode(), s);
        }
    }

    #[test]
    fn test_rejects_bad_length_and_digits() {
        for bad in ["", "64", "6400", "648", "6a0", "-10", "٦٤٠"] {
            assert!(
                matches!(
                    Permissions::encode(bad),
                    Err(NebulaError::Config(ConfigError::ValidationError { .. }))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_digit_bit_order() {
        let perms: Permissions = "641".parse().expect("valid");
        assert!(perms.owner.usage && perms.owner.manage && !perms.owner.admin);
        assert!(perms.group.usage && !perms.group.manage);
        assert!(perms.other.admin && !perms.other.usage);
    }

    #[test]
    fn test_chmod_args_are_nine_flags() {
        let args = Permissions::encode("750").expect("valid").chmod_args();
        let flags: Vec<i64> = args
            .iter()
            .map(|v| match v {
                Value::Int(i) => *i,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(flags, vec![1, 1, 1, 1, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_from_element_missing_flags_are_zero() {
        let element = Element::parse("<PERMISSIONS><OWNER_U>1</OWNER_U></PERMISSIONS>")
            .expect("parse failed");
        assert_eq!(
            Permissions::from_element(&element).expect("perms").to_string(),
            "400"
        );
    }
}
