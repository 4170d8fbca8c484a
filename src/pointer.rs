use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// A segment:offset far pointer.
///
/// Two pointers are equal only if both fields are equal; `0000:0010` and
/// `0001:0000` name the same byte but are different pointers.
pub struct Pointer {
    pub segment: u16,
    pub offset: u16,
}

impl Pointer {
    pub fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// The linear address `segment * 16 + offset`. There is no wraparound at
    /// 1 MB, so the result can be as large as 0x10ffef.
    pub fn linear(&self) -> u32 {
        u32::from(self.segment) * 16 + u32::from(self.offset)
    }

    /// Returns the pointer `n` bytes further along in the same segment. The
    /// offset wraps at 64 KB, as it does for word accesses in real mode.
    pub fn add(&self, n: u16) -> Self {
        Self { segment: self.segment, offset: self.offset.wrapping_add(n) }
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.segment, self.offset)
    }
}

#[test]
fn test_linear() {
    assert_eq!(Pointer::new(0, 0).linear(), 0);
    assert_eq!(Pointer::new(0x0010, 0x0006).linear(), 0x106);
    assert_eq!(Pointer::new(0x1000, 0x0000).linear(), 0x10000);
    assert_eq!(Pointer::new(0xffff, 0xffff).linear(), 0x10ffef);
    assert_ne!(Pointer::new(0x0000, 0x0010), Pointer::new(0x0001, 0x0000));
}

#[test]
fn test_add_wraps_within_segment() {
    assert_eq!(Pointer::new(0x2000, 0xffff).add(1), Pointer::new(0x2000, 0x0000));
    assert_eq!(format!("{}", Pointer::new(0x10, 0xfc)), "0010:00fc");
}
