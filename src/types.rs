use std::fmt;

/// Absolute address in the target's address space.
///
/// Not a native pointer: every dereference goes through
/// a [`Memory`](crate::memory::Memory) implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Addr(pub u64);

impl Addr {
    pub const NULL: Addr = Addr(0);

    pub fn addr(self) -> u64 {
        self.0
    }

    /// Byte distance from `base` to `self`, or `None` if `self` lies below it.
    pub fn offset_from(self, base: Addr) -> Option<u64> {
        self.0.checked_sub(base.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::ops::Add<u64> for Addr {
    type Output = Addr;
    fn add(self, rhs: u64) -> Self::Output {
        Addr(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Sub<u64> for Addr {
    type Output = Addr;
    fn sub(self, rhs: u64) -> Self::Output {
        Addr(self.0.wrapping_sub(rhs))
    }
}

impl From<Int64> for Addr {
    fn from(v: Int64) -> Self {
        Addr(v.0)
    }
}

/// 64-bit integer that can be assembled from, and split into, 32-bit halves.
///
/// Leak primitives commonly hand out values as `(low, high)` dword pairs;
/// this type keeps that conversion in one place. Arithmetic wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Int64(pub u64);

impl Int64 {
    pub const ZERO: Int64 = Int64(0);

    pub fn from_halves(low: u32, high: u32) -> Self {
        Int64(((high as u64) << 32) | low as u64)
    }

    pub fn low(self) -> u32 {
        self.0 as u32
    }

    pub fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn halves(self) -> (u32, u32) {
        (self.low(), self.high())
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for Int64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for Int64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<u64> for Int64 {
    fn from(v: u64) -> Self {
        Int64(v)
    }
}

impl From<u32> for Int64 {
    fn from(v: u32) -> Self {
        Int64(v as u64)
    }
}

/// Sign-extends, so `-1` becomes all ones.
impl From<i64> for Int64 {
    fn from(v: i64) -> Self {
        Int64(v as u64)
    }
}

/// Sign-extends.
impl From<i32> for Int64 {
    fn from(v: i32) -> Self {
        Int64(v as i64 as u64)
    }
}

impl From<Addr> for Int64 {
    fn from(a: Addr) -> Self {
        Int64(a.0)
    }
}

impl std::ops::Add for Int64 {
    type Output = Int64;
    fn add(self, rhs: Int64) -> Self::Output {
        Int64(self.0.wrapping_add(rhs.0))
    }
}

impl std::ops::Sub for Int64 {
    type Output = Int64;
    fn sub(self, rhs: Int64) -> Self::Output {
        Int64(self.0.wrapping_sub(rhs.0))
    }
}

impl std::ops::BitAnd for Int64 {
    type Output = Int64;
    fn bitand(self, rhs: Int64) -> Self::Output {
        Int64(self.0 & rhs.0)
    }
}

impl std::ops::BitOr for Int64 {
    type Output = Int64;
    fn bitor(self, rhs: Int64) -> Self::Output {
        Int64(self.0 | rhs.0)
    }
}

impl std::ops::BitXor for Int64 {
    type Output = Int64;
    fn bitxor(self, rhs: Int64) -> Self::Output {
        Int64(self.0 ^ rhs.0)
    }
}

impl std::ops::Not for Int64 {
    type Output = Int64;
    fn not(self) -> Self::Output {
        Int64(!self.0)
    }
}
