//! 직렬 번호 비교 (TSN 32비트, SSN 16비트 wrap-around)

#[inline]
pub fn tsn_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn tsn_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub fn tsn_gt(a: u32, b: u32) -> bool {
    tsn_lt(b, a)
}

#[inline]
pub fn tsn_ge(a: u32, b: u32) -> bool {
    tsn_le(b, a)
}

/// 두 TSN 중 직렬 순서상 더 큰 값
#[inline]
pub fn tsn_max(a: u32, b: u32) -> u32 {
    if tsn_ge(a, b) {
        a
    } else {
        b
    }
}

#[inline]
pub fn ssn_lt(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

#[inline]
pub fn ssn_le(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) <= 0
}

#[inline]
pub fn ssn_gt(a: u16, b: u16) -> bool {
    ssn_lt(b, a)
}

#[inline]
pub fn ssn_ge(a: u16, b: u16) -> bool {
    ssn_le(b, a)
}
