//! Attribute-per-line templates.
//!
//! Network calls and template updates take plain `KEY="VALUE"` lines, and
//! address ranges use the bracketed vector form `AR = [ KEY = "VALUE", ... ]`.

use std::fmt;
use std::net::Ipv4Addr;

/// A newline-separated block of `KEY="VALUE"` attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeTemplate {
    entries: Vec<(String, String)>,
}

impl AttributeTemplate {
    /// Creates an empty template.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Sets an attribute.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.entries.push((key.to_string(), value.to_string()));
        self
    }

    /// Sets an attribute only when a value is present.
    #[must_use]
    pub fn with_opt<T: fmt::Display>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    /// Returns true when no attribute was set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for AttributeTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{key}=\"{}\"", quote(value))?;
        }
        Ok(())
    }
}

/// A bracketed vector attribute such as an address range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorAttribute {
    name: String,
    entries: Vec<(String, String)>,
}

impl VectorAttribute {
    /// Creates an empty vector attribute.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    /// Adds a key to the vector.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.entries.push((key.to_string(), value.to_string()));
        self
    }
}

impl fmt::Display for VectorAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = [", self.name)?;
        for (i, (key, value)) in self.entries.iter().enumerate() {
            let sep = if i == 0 { "" } else { "," };
            write!(f, "{sep}\n  {key} = \"{}\"", quote(value))?;
        }
        write!(f, " ]")
    }
}

/// Builds the address-range block for a fresh IPv4 range.
#[must_use]
pub fn address_range(ip_start: &str, size: u32) -> VectorAttribute {
    VectorAttribute::new("AR")
        .with("TYPE", "IP4")
        .with("IP", ip_start)
        .with("SIZE", size)
}

/// Builds the address-range block resizing the first range of a network.
#[must_use]
pub fn address_range_update(ip_start: &str, size: u32) -> VectorAttribute {
    VectorAttribute::new("AR")
        .with("AR_ID", 0)
        .with("TYPE", "IP4")
        .with("IP", ip_start)
        .with("SIZE", size)
}

/// Builds the fragment holding or releasing one lease.
#[must_use]
pub fn lease(ip: Ipv4Addr) -> String {
    format!("LEASES=[IP={ip}]")
}

/// Builds the fragment carving a reservation out of an existing network.
#[must_use]
pub fn reservation(size: i64, name: &str) -> String {
    format!("SIZE={size}\nNAME=\"{}\"", quote(name))
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_lines() {
        let template = AttributeTemplate::new()
            .with("NAME", "frontend")
            .with_opt::<&str>("DESCRIPTION", None)
            .with("BRIDGE", "br0");

        assert_eq!(template.to_string(), "NAME=\"frontend\"\nBRIDGE=\"br0\"");
    }

    #[test]
    fn test_attribute_values_are_quoted() {
        let template = AttributeTemplate::new().with("DESCRIPTION", "say \"hi\"");
        assert_eq!(template.to_string(), "DESCRIPTION=\"say \\\"hi\\\"\"");
    }

    #[test]
    fn test_address_range_block() {
        assert_eq!(
            address_range("10.0.0.5", 16).to_string(),
            "AR = [\n  TYPE = \"IP4\",\n  IP = \"10.0.0.5\",\n  SIZE = \"16\" ]"
        );
        assert!(address_range_update("10.0.0.5", 32)
            .to_string()
            .starts_with("AR = [\n  AR_ID = \"0\","));
    }

    #[test]
    fn test_lease_and_reservation_fragments() {
        assert_eq!(lease(Ipv4Addr::new(10, 0, 0, 5)), "LEASES=[IP=10.0.0.5]");
        assert_eq!(reservation(4, "pool-a"), "SIZE=4\nNAME=\"pool-a\"");
    }
}
