//! Shared projections of remote documents.
//!
//! Every OpenNebula object document starts with the same header fields
//! (`ID`, `NAME`, `UID`, `GID`, `UNAME`, `GNAME`, `PERMISSIONS`). Kind-specific
//! projection lives with each driver.

use serde::{Deserialize, Serialize};

use crate::error::{RemoteError, Result};
use crate::permissions::Permissions;
use crate::template::Element;

/// Ownership of a remote object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    /// Owner user ID.
    pub uid: i64,
    /// Owner group ID.
    pub gid: i64,
    /// Owner user name.
    pub uname: String,
    /// Owner group name.
    pub gname: String,
}

/// Header fields common to all object documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    /// Numeric ID.
    pub id: i64,
    /// Object name.
    pub name: String,
    /// Ownership.
    pub ownership: Ownership,
    /// Permission string, when the document carries one.
    pub permissions: Option<String>,
}

impl ObjectHeader {
    /// Projects the header out of an object document.
    ///
    /// # Errors
    ///
    /// Returns an error if `ID` is missing or any numeric field is malformed.
    pub fn from_element(element: &Element) -> Result<Self> {
        let ownership = Ownership {
            uid: element.child_i64("UID")?.unwrap_or_default(),
            gid: element.child_i64("GID")?.unwrap_or_default(),
            uname: element.text_or_empty("UNAME"),
            gname: element.text_or_empty("GNAME"),
        };

        let permissions = element
            .child("PERMISSIONS")
            .map(Permissions::from_element)
            .transpose()?
            .map(|p| p.to_string());

        Ok(Self {
            id: element.require_i64("ID")?,
            name: element.text_or_empty("NAME"),
            ownership,
            permissions,
        })
    }
}

/// One entry of a pool listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    /// Numeric ID.
    pub id: i64,
    /// Object name.
    pub name: String,
}

/// Parses a pool document (`<IMAGE_POOL><IMAGE>...</IMAGE>...`) into entries.
///
/// Entries keep document order, which is what makes first-match resolution
/// deterministic.
///
/// # Errors
///
/// Returns an error if the document is malformed or an entry has no `ID`.
pub fn parse_pool(document: &str, entry: &str) -> Result<Vec<PoolEntry>> {
    let root = Element::parse(document)?;
    if !root.name.ends_with("_POOL") {
        return Err(RemoteError::invalid(format!("expected a pool document, got <{}>", root.name)).into());
    }

    root.children_named(entry)
        .map(|e| {
            Ok(PoolEntry {
                id: e.require_i64("ID")?,
                name: e.text_or_empty("NAME"),
            })
        })
        .collect()
}

/// Ownership filter for pool listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolScope {
    /// Everything visible to the session user.
    All,
    /// Objects owned by the session user.
    Mine,
    /// Objects owned by the session user and its group.
    MineAndGroup,
}

impl PoolScope {
    /// Returns the wire filter flag.
    #[must_use]
    pub const fn flag(self) -> i64 {
        match self {
            Self::All => -2,
            Self::Mine => -3,
            Self::MineAndGroup => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_projection() {
        let doc = Element::parse(
            "<VNET><ID>5</ID><UID>0</UID><GID>1</GID><UNAME>oneadmin</UNAME>\
             <GNAME>users</GNAME><NAME>private</NAME><PERMISSIONS>\
             <OWNER_U>1</OWNER_U><OWNER_M>1</OWNER_M><OWNER_A>0</OWNER_A>\
             <GROUP_U>1</GROUP_U><GROUP_M>0</GROUP_M><GROUP_A>0</GROUP_A>\
             <OTHER_U>0</OTHER_U><OTHER_M>0</OTHER_M><OTHER_A>0</OTHER_A>\
             </PERMISSIONS></VNET>",
        )
        .expect("parse failed");

        let header = ObjectHeader::from_element(&doc).expect("header");
        assert_eq!(header.id, 5);
        assert_eq!(header.name, "private");
        assert_eq!(header.ownership.gname, "users");
        assert_eq!(header.permissions.as_deref(), Some("640"));
    }

    #[test]
    fn test_pool_keeps_document_order() {
        let pool = parse_pool(
            "<IMAGE_POOL><IMAGE><ID>9</ID><NAME>a</NAME></IMAGE>\
             <IMAGE><ID>3</ID><NAME>b</NAME></IMAGE></IMAGE_POOL>",
            "IMAGE",
        )
        .expect("pool");

        assert_eq!(
            pool,
            vec![
                PoolEntry { id: 9, name: String::from("a") },
                PoolEntry { id: 3, name: String::from("b") },
            ]
        );
    }

    #[test]
    fn test_empty_pool() {
        assert!(parse_pool("<VM_POOL/>", "VM").expect("pool").is_empty());
        assert!(parse_pool("<VM><ID>1</ID></VM>", "VM").is_err());
    }

    #[test]
    fn test_scope_flags() {
        assert_eq!(PoolScope::All.flag(), -2);
        assert_eq!(PoolScope::Mine.flag(), -3);
        assert_eq!(PoolScope::MineAndGroup.flag(), -1);
    }
}
