//! XA flags and transaction identifiers
//!
//! Flag values follow the X/Open XA specification so that requests from
//! external transaction managers can be passed through unchanged.

use crate::error::{Result, StreamlineError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// XA flag word carried on START/END/PREPARE/COMMIT/ROLLBACK/RECOVER
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct XaFlags(pub i32);

impl XaFlags {
    pub const NOFLAGS: XaFlags = XaFlags(0x0000_0000);
    pub const ENDRSCAN: XaFlags = XaFlags(0x0080_0000);
    pub const STARTRSCAN: XaFlags = XaFlags(0x0100_0000);
    pub const SUSPEND: XaFlags = XaFlags(0x0200_0000);
    pub const SUCCESS: XaFlags = XaFlags(0x0400_0000);
    pub const RESUME: XaFlags = XaFlags(0x0800_0000);
    pub const FAIL: XaFlags = XaFlags(0x2000_0000);
    pub const JOIN: XaFlags = XaFlags(0x0020_0000);
    pub const ONEPHASE: XaFlags = XaFlags(0x4000_0000);

    pub fn bits(&self) -> i32 {
        self.0
    }

    /// Test an optional flag word for `flag`
    ///
    /// Absent flags count as NOFLAGS. NOFLAGS only matches an empty word;
    /// every other flag matches by bitmask.
    pub fn is_set(flags: Option<XaFlags>, flag: XaFlags) -> bool {
        let word = flags.unwrap_or(XaFlags::NOFLAGS);
        if flag == XaFlags::NOFLAGS {
            word == XaFlags::NOFLAGS
        } else {
            word.0 & flag.0 == flag.0
        }
    }

    pub fn contains(&self, flag: XaFlags) -> bool {
        Self::is_set(Some(*self), flag)
    }
}

impl std::ops::BitOr for XaFlags {
    type Output = XaFlags;

    fn bitor(self, rhs: XaFlags) -> XaFlags {
        XaFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for XaFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(XaFlags, &str); 8] = [
            (XaFlags::JOIN, "TMJOIN"),
            (XaFlags::ENDRSCAN, "TMENDRSCAN"),
            (XaFlags::STARTRSCAN, "TMSTARTRSCAN"),
            (XaFlags::SUSPEND, "TMSUSPEND"),
            (XaFlags::SUCCESS, "TMSUCCESS"),
            (XaFlags::RESUME, "TMRESUME"),
            (XaFlags::FAIL, "TMFAIL"),
            (XaFlags::ONEPHASE, "TMONEPHASE"),
        ];
        if self.0 == 0 {
            return f.write_str("TMNOFLAGS");
        }
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "0x{:08x}", self.0)
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// External XA transaction identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    gtrid: Vec<u8>,
    bqual: Vec<u8>,
}

impl Xid {
    pub const MAX_GTRID_SIZE: usize = 64;
    pub const MAX_BQUAL_SIZE: usize = 64;

    pub fn new(format_id: i32, gtrid: &[u8], bqual: &[u8]) -> Result<Self> {
        if gtrid.is_empty() || gtrid.len() > Self::MAX_GTRID_SIZE {
            return Err(StreamlineError::protocol_invalid_field(
                "xid.gtrid",
                format!("length {} outside 1..={}", gtrid.len(), Self::MAX_GTRID_SIZE),
            ));
        }
        if bqual.len() > Self::MAX_BQUAL_SIZE {
            return Err(StreamlineError::protocol_invalid_field(
                "xid.bqual",
                format!("length {} exceeds {}", bqual.len(), Self::MAX_BQUAL_SIZE),
            ));
        }
        Ok(Self {
            format_id,
            gtrid: gtrid.to_vec(),
            bqual: bqual.to_vec(),
        })
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid
    }

    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.format_id, hex(&self.gtrid), hex(&self.bqual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_flags_are_noflags() {
        assert!(XaFlags::is_set(None, XaFlags::NOFLAGS));
        assert!(!XaFlags::is_set(None, XaFlags::JOIN));
        assert!(XaFlags::is_set(Some(XaFlags::NOFLAGS), XaFlags::NOFLAGS));
    }

    #[test]
    fn test_noflags_matches_only_empty_word() {
        assert!(!XaFlags::is_set(Some(XaFlags::JOIN), XaFlags::NOFLAGS));
        assert!(XaFlags::is_set(Some(XaFlags::JOIN), XaFlags::JOIN));
        let combined = XaFlags::SUCCESS | XaFlags::ONEPHASE;
        assert!(combined.contains(XaFlags::SUCCESS));
        assert!(combined.contains(XaFlags::ONEPHASE));
        assert!(!combined.contains(XaFlags::FAIL));
    }

    #[test]
    fn test_flag_display() {
        assert_eq!(XaFlags::NOFLAGS.to_string(), "TMNOFLAGS");
        assert_eq!(XaFlags::STARTRSCAN.to_string(), "TMSTARTRSCAN");
        assert_eq!((XaFlags::SUCCESS | XaFlags::ONEPHASE).to_string(), "TMSUCCESS|TMONEPHASE");
    }

    #[test]
    fn test_xid_validation() {
        assert!(Xid::new(1, b"global", b"branch").is_ok());
        assert!(Xid::new(1, b"", b"branch").is_err());
        assert!(Xid::new(1, &[0u8; 65], b"").is_err());
        assert!(Xid::new(1, b"g", &[0u8; 65]).is_err());
    }

    #[test]
    fn test_xid_display() {
        let xid = Xid::new(7, &[0xab, 0x01], &[0xff]).unwrap();
        assert_eq!(xid.to_string(), "7:ab01:ff");
    }
}
