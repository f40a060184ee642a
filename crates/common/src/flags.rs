use serde::{Deserialize, Serialize};

/// XA call flags (`TM*` values) and switch capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(u64);

impl Flags {
    pub const NOFLAGS: Flags = Flags(0);

    // Switch capabilities
    pub const REGISTER: Flags = Flags(0x0000_0001);
    pub const NOMIGRATE: Flags = Flags(0x0000_0002);
    pub const USEASYNC: Flags = Flags(0x0000_0004);

    // Call flags
    pub const ASYNC: Flags = Flags(0x8000_0000);
    pub const ONEPHASE: Flags = Flags(0x4000_0000);
    pub const FAIL: Flags = Flags(0x2000_0000);
    pub const NOWAIT: Flags = Flags(0x1000_0000);
    pub const RESUME: Flags = Flags(0x0800_0000);
    pub const SUCCESS: Flags = Flags(0x0400_0000);
    pub const SUSPEND: Flags = Flags(0x0200_0000);
    pub const STARTRSCAN: Flags = Flags(0x0100_0000);
    pub const ENDRSCAN: Flags = Flags(0x0080_0000);
    pub const MULTIPLE: Flags = Flags(0x0040_0000);
    pub const JOIN: Flags = Flags(0x0020_0000);
    pub const MIGRATE: Flags = Flags(0x0010_0000);

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    /// True when every bit of `other` is set.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.insert(rhs);
    }
}

impl std::fmt::Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
