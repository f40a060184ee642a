//! Global transaction identifiers.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Maximum size in bytes of the global transaction id part.
pub const MAXGTRIDSIZE: usize = 64;
/// Maximum size in bytes of the branch qualifier part.
pub const MAXBQUALSIZE: usize = 64;
/// Size of the data area of the wire representation.
pub const XIDDATASIZE: usize = MAXGTRIDSIZE + MAXBQUALSIZE;

/// Format id used for ids allocated by this transaction manager.
pub const FORMAT_ID: i64 = 0x5841_544d;

const NULL_FORMAT: i64 = -1;

/// Errors raised when building an id from untrusted parts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum XidError {
    #[error("gtrid length {0} exceeds {MAXGTRIDSIZE}")]
    GtridTooLong(usize),

    #[error("bqual length {0} exceeds {MAXBQUALSIZE}")]
    BqualTooLong(usize),

    #[error("invalid wire lengths: gtrid {gtrid}, bqual {bqual}")]
    InvalidWire { gtrid: i64, bqual: i64 },
}

/// A global transaction id: format, gtrid and branch qualifier.
///
/// Two ids denote the same transaction when their gtrid parts match and the
/// same branch when gtrid and bqual both match. The null id (format `-1`)
/// means "no transaction".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    format: i64,
    gtrid: Vec<u8>,
    bqual: Vec<u8>,
}

impl Xid {
    /// Allocates a new, globally unique id.
    pub fn new() -> Self {
        Self {
            format: FORMAT_ID,
            gtrid: Uuid::new_v4().as_bytes().to_vec(),
            bqual: Uuid::new_v4().as_bytes().to_vec(),
        }
    }

    /// The id that represents "no transaction".
    pub fn null() -> Self {
        Self {
            format: NULL_FORMAT,
            gtrid: Vec::new(),
            bqual: Vec::new(),
        }
    }

    /// Builds an id from its parts, validating the XA size limits.
    pub fn from_parts(
        format: i64,
        gtrid: impl Into<Vec<u8>>,
        bqual: impl Into<Vec<u8>>,
    ) -> Result<Self, XidError> {
        let gtrid = gtrid.into();
        let bqual = bqual.into();
        if gtrid.len() > MAXGTRIDSIZE {
            return Err(XidError::GtridTooLong(gtrid.len()));
        }
        if bqual.len() > MAXBQUALSIZE {
            return Err(XidError::BqualTooLong(bqual.len()));
        }
        if format == NULL_FORMAT {
            return Ok(Self::null());
        }
        Ok(Self {
            format,
            gtrid,
            bqual,
        })
    }

    pub fn is_null(&self) -> bool {
        self.format == NULL_FORMAT
    }

    pub fn format(&self) -> i64 {
        self.format
    }

    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid
    }

    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }

    /// True when both ids belong to the same global transaction.
    pub fn same_transaction(&self, other: &Xid) -> bool {
        !self.is_null() && !other.is_null() && self.gtrid == other.gtrid
    }

    /// A new branch of the same global transaction.
    ///
    /// Keeps format and gtrid, allocates a fresh branch qualifier. The
    /// branch of the null id is the null id.
    pub fn branch(&self) -> Self {
        if self.is_null() {
            return Self::null();
        }
        Self {
            format: self.format,
            gtrid: self.gtrid.clone(),
            bqual: Uuid::new_v4().as_bytes().to_vec(),
        }
    }

    /// An owned copy of the id in the layout resource-manager drivers expect.
    pub fn to_wire(&self) -> WireXid {
        WireXid::from(self)
    }
}

impl Default for Xid {
    fn default() -> Self {
        Self::null()
    }
}

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            return write!(f, "null");
        }
        for byte in &self.gtrid {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ":")?;
        for byte in &self.bqual {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ":{}", self.format)
    }
}

/// The XA `XID` structure: lengths plus a fixed data area holding gtrid
/// followed by bqual.
///
/// Handed by value to every driver call, so a driver may scribble on its
/// copy without touching transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireXid {
    pub format_id: i64,
    pub gtrid_length: i64,
    pub bqual_length: i64,
    pub data: [u8; XIDDATASIZE],
}

impl WireXid {
    /// Reads the wire layout back into an [`Xid`].
    pub fn to_xid(&self) -> Result<Xid, XidError> {
        if self.format_id == NULL_FORMAT {
            return Ok(Xid::null());
        }
        let gtrid = usize::try_from(self.gtrid_length).ok();
        let bqual = usize::try_from(self.bqual_length).ok();
        match (gtrid, bqual) {
            (Some(g), Some(b)) if g <= MAXGTRIDSIZE && b <= MAXBQUALSIZE => Xid::from_parts(
                self.format_id,
                &self.data[..g],
                &self.data[g..g + b],
            ),
            _ => Err(XidError::InvalidWire {
                gtrid: self.gtrid_length,
                bqual: self.bqual_length,
            }),
        }
    }
}

impl From<&Xid> for WireXid {
    fn from(xid: &Xid) -> Self {
        let mut data = [0u8; XIDDATASIZE];
        let gtrid = xid.gtrid.len();
        let bqual = xid.bqual.len();
        data[..gtrid].copy_from_slice(&xid.gtrid);
        data[gtrid..gtrid + bqual].copy_from_slice(&xid.bqual);
        Self {
            format_id: xid.format,
            gtrid_length: gtrid as i64,
            bqual_length: bqual as i64,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique_and_not_null() {
        let a = Xid::new();
        let b = Xid::new();
        assert_ne!(a, b);
        assert!(!a.is_null());
        assert!(!a.same_transaction(&b));
    }

    #[test]
    fn null_is_default_and_never_the_same_transaction() {
        let null = Xid::default();
        assert!(null.is_null());
        assert!(!null.same_transaction(&Xid::null()));
        assert_eq!(null.to_string(), "null");
    }

    #[test]
    fn branch_keeps_gtrid_and_changes_bqual() {
        let xid = Xid::new();
        let branch = xid.branch();
        assert!(xid.same_transaction(&branch));
        assert_ne!(xid, branch);
        assert_eq!(xid.format(), branch.format());
        assert!(Xid::null().branch().is_null());
    }

    #[test]
    fn from_parts_enforces_size_limits() {
        assert_eq!(
            Xid::from_parts(1, vec![0u8; 65], vec![]),
            Err(XidError::GtridTooLong(65))
        );
        assert_eq!(
            Xid::from_parts(1, vec![1u8], vec![0u8; 65]),
            Err(XidError::BqualTooLong(65))
        );
        assert!(Xid::from_parts(-1, vec![], vec![]).unwrap().is_null());
    }

    #[test]
    fn wire_layout_places_bqual_after_gtrid() {
        let xid = Xid::from_parts(7, b"abc".to_vec(), b"de".to_vec()).unwrap();
        let wire = xid.to_wire();
        assert_eq!(wire.format_id, 7);
        assert_eq!(wire.gtrid_length, 3);
        assert_eq!(wire.bqual_length, 2);
        assert_eq!(&wire.data[..5], b"abcde");
        assert_eq!(wire.to_xid().unwrap(), xid);
    }

    #[test]
    fn wire_copy_is_independent_of_the_id() {
        let xid = Xid::new();
        let mut wire = xid.to_wire();
        wire.data[0] ^= 0xff;
        assert_ne!(wire.to_xid().unwrap(), xid);
        assert_eq!(xid.to_wire().to_xid().unwrap(), xid);
    }

    #[test]
    fn corrupt_wire_lengths_are_rejected() {
        let mut wire = Xid::new().to_wire();
        wire.gtrid_length = 100;
        assert!(matches!(wire.to_xid(), Err(XidError::InvalidWire { .. })));
    }

    #[test]
    fn display_is_hex_gtrid_bqual_format() {
        let xid = Xid::from_parts(5, vec![0x0a, 0xff], vec![0x01]).unwrap();
        assert_eq!(xid.to_string(), "0aff:01:5");
    }
}
