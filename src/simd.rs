//! Batched byte comparison kernel.
//!
//! Inner-node routing and leaf fingerprint filtering compare one query
//! byte (or a second byte column) against a whole 16/32/64-byte column at
//! once. Each primitive returns a bitmask where bit `i` is set iff the
//! condition holds for lane `i`; all comparisons are unsigned.
//!
//! # Architecture support
//!
//! - **`x86_64` + AVX2** (runtime detection): 32 lanes per instruction.
//! - **`x86_64` SSE2** (always available): 16 lanes per instruction.
//! - **Other targets**: scalar fallback.
//!
//! The 32- and 64-lane variants compose two narrower compares and
//! concatenate their masks when the wider instruction set is missing. The
//! scalar fallbacks produce bit-identical masks and are exported for the
//! equivalence tests.
//!
//! SSE2/AVX2 only provide *signed* byte comparison; the unsigned
//! less-than lanes flip the sign bit of both operands first, which is the
//! standard correction and costs one `xor` per operand.

// ============================================================================
//  Dispatchers
// ============================================================================

/// `mask[i] = (p[i] == c)` over 16 lanes.
///
/// # Safety
/// `p` must be valid for 16 bytes of read.
#[inline]
#[must_use]
pub unsafe fn cmpeq_u8x16(p: *const u8, c: u8) -> u64 {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: SSE2 is part of the x86_64 baseline.
    unsafe {
        sse2::cmpeq16(p, c)
    }
    #[cfg(not(target_arch = "x86_64"))]
    // SAFETY: caller guarantees 16 readable bytes.
    unsafe {
        cmpeq_u8x16_scalar(p, c)
    }
}

/// `mask[i] = (p[i] < c)`, unsigned, over 16 lanes.
///
/// # Safety
/// `p` must be valid for 16 bytes of read.
#[inline]
#[must_use]
pub unsafe fn cmplt_u8x16(p: *const u8, c: u8) -> u64 {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: SSE2 is part of the x86_64 baseline.
    unsafe {
        sse2::cmplt16(p, c)
    }
    #[cfg(not(target_arch = "x86_64"))]
    // SAFETY: caller guarantees 16 readable bytes.
    unsafe {
        cmplt_u8x16_scalar(p, c)
    }
}

/// `mask[i] = (p[i] == c)` over 32 lanes.
///
/// # Safety
/// `p` must be valid for 32 bytes of read.
#[inline]
#[must_use]
pub unsafe fn cmpeq_u8x32(p: *const u8, c: u8) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            // SAFETY: AVX2 availability just checked.
            return unsafe { avx2::cmpeq32(p, c) };
        }
        // SAFETY: caller guarantees 32 readable bytes.
        unsafe { cmpeq_u8x16(p, c) | (cmpeq_u8x16(p.add(16), c) << 16) }
    }
    #[cfg(not(target_arch = "x86_64"))]
    // SAFETY: caller guarantees 32 readable bytes.
    unsafe {
        cmpeq_u8x32_scalar(p, c)
    }
}

/// `mask[i] = (p[i] < c)`, unsigned, over 32 lanes.
///
/// # Safety
/// `p` must be valid for 32 bytes of read.
#[inline]
#[must_use]
pub unsafe fn cmplt_u8x32(p: *const u8, c: u8) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            // SAFETY: AVX2 availability just checked.
            return unsafe { avx2::cmplt32(p, c) };
        }
        // SAFETY: caller guarantees 32 readable bytes.
        unsafe { cmplt_u8x16(p, c) | (cmplt_u8x16(p.add(16), c) << 16) }
    }
    #[cfg(not(target_arch = "x86_64"))]
    // SAFETY: caller guarantees 32 readable bytes.
    unsafe {
        cmplt_u8x32_scalar(p, c)
    }
}

/// `mask[i] = (p[i] == c)` over 64 lanes.
///
/// # Safety
/// `p` must be valid for 64 bytes of read.
#[inline]
#[must_use]
pub unsafe fn cmpeq_u8x64(p: *const u8, c: u8) -> u64 {
    // SAFETY: caller guarantees 64 readable bytes.
    unsafe { cmpeq_u8x32(p, c) | (cmpeq_u8x32(p.add(32), c) << 32) }
}

/// `mask[i] = (p[i] < c)`, unsigned, over 64 lanes.
///
/// # Safety
/// `p` must be valid for 64 bytes of read.
#[inline]
#[must_use]
pub unsafe fn cmplt_u8x64(p: *const u8, c: u8) -> u64 {
    // SAFETY: caller guarantees 64 readable bytes.
    unsafe { cmplt_u8x32(p, c) | (cmplt_u8x32(p.add(32), c) << 32) }
}

/// `mask[i] = (a[i] == b[i])` over 16 lanes.
///
/// # Safety
/// `a` and `b` must each be valid for 16 bytes of read.
#[inline]
#[must_use]
pub unsafe fn vcmpeq_u8x16(a: *const u8, b: *const u8) -> u64 {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: SSE2 is part of the x86_64 baseline.
    unsafe {
        sse2::vcmpeq16(a, b)
    }
    #[cfg(not(target_arch = "x86_64"))]
    // SAFETY: caller guarantees 16 readable bytes each.
    unsafe {
        vcmpeq_u8x16_scalar(a, b)
    }
}

/// `mask[i] = (a[i] < b[i])`, unsigned, over 16 lanes.
///
/// # Safety
/// `a` and `b` must each be valid for 16 bytes of read.
#[inline]
#[must_use]
pub unsafe fn vcmplt_u8x16(a: *const u8, b: *const u8) -> u64 {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: SSE2 is part of the x86_64 baseline.
    unsafe {
        sse2::vcmplt16(a, b)
    }
    #[cfg(not(target_arch = "x86_64"))]
    // SAFETY: caller guarantees 16 readable bytes each.
    unsafe {
        vcmplt_u8x16_scalar(a, b)
    }
}

/// `mask[i] = (a[i] == b[i])` over 32 lanes.
///
/// # Safety
/// `a` and `b` must each be valid for 32 bytes of read.
#[inline]
#[must_use]
pub unsafe fn vcmpeq_u8x32(a: *const u8, b: *const u8) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            // SAFETY: AVX2 availability just checked.
            return unsafe { avx2::vcmpeq32(a, b) };
        }
        // SAFETY: caller guarantees 32 readable bytes each.
        unsafe { vcmpeq_u8x16(a, b) | (vcmpeq_u8x16(a.add(16), b.add(16)) << 16) }
    }
    #[cfg(not(target_arch = "x86_64"))]
    // SAFETY: caller guarantees 32 readable bytes each.
    unsafe {
        vcmpeq_u8x32_scalar(a, b)
    }
}

/// `mask[i] = (a[i] < b[i])`, unsigned, over 32 lanes.
///
/// # Safety
/// `a` and `b` must each be valid for 32 bytes of read.
#[inline]
#[must_use]
pub unsafe fn vcmplt_u8x32(a: *const u8, b: *const u8) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            // SAFETY: AVX2 availability just checked.
            return unsafe { avx2::vcmplt32(a, b) };
        }
        // SAFETY: caller guarantees 32 readable bytes each.
        unsafe { vcmplt_u8x16(a, b) | (vcmplt_u8x16(a.add(16), b.add(16)) << 16) }
    }
    #[cfg(not(target_arch = "x86_64"))]
    // SAFETY: caller guarantees 32 readable bytes each.
    unsafe {
        vcmplt_u8x32_scalar(a, b)
    }
}

/// `mask[i] = (a[i] == b[i])` over 64 lanes.
///
/// # Safety
/// `a` and `b` must each be valid for 64 bytes of read.
#[inline]
#[must_use]
pub unsafe fn vcmpeq_u8x64(a: *const u8, b: *const u8) -> u64 {
    // SAFETY: caller guarantees 64 readable bytes each.
    unsafe { vcmpeq_u8x32(a, b) | (vcmpeq_u8x32(a.add(32), b.add(32)) << 32) }
}

/// `mask[i] = (a[i] < b[i])`, unsigned, over 64 lanes.
///
/// # Safety
/// `a` and `b` must each be valid for 64 bytes of read.
#[inline]
#[must_use]
pub unsafe fn vcmplt_u8x64(a: *const u8, b: *const u8) -> u64 {
    // SAFETY: caller guarantees 64 readable bytes each.
    unsafe { vcmplt_u8x32(a, b) | (vcmplt_u8x32(a.add(32), b.add(32)) << 32) }
}

// ============================================================================
//  Scalar fallbacks (always available, bit-identical)
// ============================================================================

macro_rules! scalar_lanes {
    ($name:ident, $lanes:literal, |$x:ident, $y:ident| $cond:expr) => {
        /// Scalar reference implementation.
        ///
        /// # Safety
        #[doc = concat!("`p` must be valid for ", stringify!($lanes), " bytes of read.")]
        #[must_use]
        pub unsafe fn $name(p: *const u8, c: u8) -> u64 {
            let mut mask = 0u64;
            for i in 0..$lanes {
                // SAFETY: i < lane count, within the caller's guarantee.
                let $x = unsafe { p.add(i).read() };
                let $y = c;
                if $cond {
                    mask |= 1 << i;
                }
            }
            mask
        }
    };
}

macro_rules! scalar_lanes2 {
    ($name:ident, $lanes:literal, |$x:ident, $y:ident| $cond:expr) => {
        /// Scalar reference implementation.
        ///
        /// # Safety
        #[doc = concat!("`a` and `b` must each be valid for ", stringify!($lanes), " bytes of read.")]
        #[must_use]
        pub unsafe fn $name(a: *const u8, b: *const u8) -> u64 {
            let mut mask = 0u64;
            for i in 0..$lanes {
                // SAFETY: i < lane count, within the caller's guarantee.
                let ($x, $y) = unsafe { (a.add(i).read(), b.add(i).read()) };
                if $cond {
                    mask |= 1 << i;
                }
            }
            mask
        }
    };
}

scalar_lanes!(cmpeq_u8x16_scalar, 16, |x, y| x == y);
scalar_lanes!(cmpeq_u8x32_scalar, 32, |x, y| x == y);
scalar_lanes!(cmpeq_u8x64_scalar, 64, |x, y| x == y);
scalar_lanes!(cmplt_u8x16_scalar, 16, |x, y| x < y);
scalar_lanes!(cmplt_u8x32_scalar, 32, |x, y| x < y);
scalar_lanes!(cmplt_u8x64_scalar, 64, |x, y| x < y);
scalar_lanes2!(vcmpeq_u8x16_scalar, 16, |x, y| x == y);
scalar_lanes2!(vcmpeq_u8x32_scalar, 32, |x, y| x == y);
scalar_lanes2!(vcmpeq_u8x64_scalar, 64, |x, y| x == y);
scalar_lanes2!(vcmplt_u8x16_scalar, 16, |x, y| x < y);
scalar_lanes2!(vcmplt_u8x32_scalar, 32, |x, y| x < y);
scalar_lanes2!(vcmplt_u8x64_scalar, 64, |x, y| x < y);

// ============================================================================
//  SSE2 (x86_64 baseline)
// ============================================================================

#[cfg(target_arch = "x86_64")]
mod sse2 {
    use std::arch::x86_64::{
        __m128i, _mm_cmpeq_epi8, _mm_cmpgt_epi8, _mm_loadu_si128, _mm_movemask_epi8,
        _mm_set1_epi8, _mm_xor_si128,
    };

    /// # Safety
    /// `p` must be valid for 16 bytes of read.
    #[inline]
    pub unsafe fn cmpeq16(p: *const u8, c: u8) -> u64 {
        // SAFETY: SSE2 is baseline on x86_64; loadu has no alignment
        // requirement and the caller guarantees the 16 readable bytes.
        unsafe {
            let v = _mm_loadu_si128(p.cast::<__m128i>());
            let cmp = _mm_cmpeq_epi8(v, _mm_set1_epi8(c as i8));
            (_mm_movemask_epi8(cmp) as u32 as u64) & 0xFFFF
        }
    }

    /// # Safety
    /// `p` must be valid for 16 bytes of read.
    #[inline]
    pub unsafe fn cmplt16(p: *const u8, c: u8) -> u64 {
        // SAFETY: SSE2 is baseline on x86_64; caller guarantees the bytes.
        unsafe {
            let sign = _mm_set1_epi8(-128);
            let vx = _mm_xor_si128(_mm_loadu_si128(p.cast::<__m128i>()), sign);
            let cx = _mm_xor_si128(_mm_set1_epi8(c as i8), sign);
            // c' > v' signed  ==  v < c unsigned
            let cmp = _mm_cmpgt_epi8(cx, vx);
            (_mm_movemask_epi8(cmp) as u32 as u64) & 0xFFFF
        }
    }

    /// # Safety
    /// `a` and `b` must each be valid for 16 bytes of read.
    #[inline]
    pub unsafe fn vcmpeq16(a: *const u8, b: *const u8) -> u64 {
        // SAFETY: SSE2 is baseline on x86_64; caller guarantees the bytes.
        unsafe {
            let va = _mm_loadu_si128(a.cast::<__m128i>());
            let vb = _mm_loadu_si128(b.cast::<__m128i>());
            let cmp = _mm_cmpeq_epi8(va, vb);
            (_mm_movemask_epi8(cmp) as u32 as u64) & 0xFFFF
        }
    }

    /// # Safety
    /// `a` and `b` must each be valid for 16 bytes of read.
    #[inline]
    pub unsafe fn vcmplt16(a: *const u8, b: *const u8) -> u64 {
        // SAFETY: SSE2 is baseline on x86_64; caller guarantees the bytes.
        unsafe {
            let sign = _mm_set1_epi8(-128);
            let ax = _mm_xor_si128(_mm_loadu_si128(a.cast::<__m128i>()), sign);
            let bx = _mm_xor_si128(_mm_loadu_si128(b.cast::<__m128i>()), sign);
            let cmp = _mm_cmpgt_epi8(bx, ax);
            (_mm_movemask_epi8(cmp) as u32 as u64) & 0xFFFF
        }
    }
}

// ============================================================================
//  AVX2 (runtime detection)
// ============================================================================

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::{
        __m256i, _mm256_cmpeq_epi8, _mm256_cmpgt_epi8, _mm256_loadu_si256, _mm256_movemask_epi8,
        _mm256_set1_epi8, _mm256_xor_si256,
    };

    /// # Safety
    /// AVX2 must be available; `p` must be valid for 32 bytes of read.
    #[inline]
    #[target_feature(enable = "avx2")]
    pub unsafe fn cmpeq32(p: *const u8, c: u8) -> u64 {
        // SAFETY: the dispatcher checked AVX2; caller guarantees the bytes.
        unsafe {
            let v = _mm256_loadu_si256(p.cast::<__m256i>());
            let cmp = _mm256_cmpeq_epi8(v, _mm256_set1_epi8(c as i8));
            _mm256_movemask_epi8(cmp) as u32 as u64
        }
    }

    /// # Safety
    /// AVX2 must be available; `p` must be valid for 32 bytes of read.
    #[inline]
    #[target_feature(enable = "avx2")]
    pub unsafe fn cmplt32(p: *const u8, c: u8) -> u64 {
        // SAFETY: the dispatcher checked AVX2; caller guarantees the bytes.
        unsafe {
            let sign = _mm256_set1_epi8(-128);
            let vx = _mm256_xor_si256(_mm256_loadu_si256(p.cast::<__m256i>()), sign);
            let cx = _mm256_xor_si256(_mm256_set1_epi8(c as i8), sign);
            let cmp = _mm256_cmpgt_epi8(cx, vx);
            _mm256_movemask_epi8(cmp) as u32 as u64
        }
    }

    /// # Safety
    /// AVX2 must be available; `a` and `b` must each be valid for 32 bytes
    /// of read.
    #[inline]
    #[target_feature(enable = "avx2")]
    pub unsafe fn vcmpeq32(a: *const u8, b: *const u8) -> u64 {
        // SAFETY: the dispatcher checked AVX2; caller guarantees the bytes.
        unsafe {
            let va = _mm256_loadu_si256(a.cast::<__m256i>());
            let vb = _mm256_loadu_si256(b.cast::<__m256i>());
            let cmp = _mm256_cmpeq_epi8(va, vb);
            _mm256_movemask_epi8(cmp) as u32 as u64
        }
    }

    /// # Safety
    /// AVX2 must be available; `a` and `b` must each be valid for 32 bytes
    /// of read.
    #[inline]
    #[target_feature(enable = "avx2")]
    pub unsafe fn vcmplt32(a: *const u8, b: *const u8) -> u64 {
        // SAFETY: the dispatcher checked AVX2; caller guarantees the bytes.
        unsafe {
            let sign = _mm256_set1_epi8(-128);
            let ax = _mm256_xor_si256(_mm256_loadu_si256(a.cast::<__m256i>()), sign);
            let bx = _mm256_xor_si256(_mm256_loadu_si256(b.cast::<__m256i>()), sign);
            let cmp = _mm256_cmpgt_epi8(bx, ax);
            _mm256_movemask_epi8(cmp) as u32 as u64
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn column(f: impl Fn(usize) -> u8) -> [u8; 64] {
        std::array::from_fn(f)
    }

    // ========================================================================
    //  SIMD-dispatching tests (skip under Miri - no SIMD support)
    // ========================================================================

    #[test]
    #[cfg(not(miri))]
    fn eq_basic() {
        let col = column(|i| (i % 7) as u8);
        let mask = unsafe { cmpeq_u8x64(col.as_ptr(), 3) };
        for (i, &b) in col.iter().enumerate() {
            assert_eq!(mask >> i & 1 == 1, b == 3, "lane {i}");
        }
    }

    #[test]
    #[cfg(not(miri))]
    fn lt_is_unsigned() {
        // 0x7F < 0x80 must hold; a signed kernel would invert it.
        let mut col = [0u8; 64];
        col[0] = 0x7F;
        col[1] = 0x80;
        col[2] = 0xFF;
        let mask = unsafe { cmplt_u8x64(col.as_ptr(), 0x80) };
        assert_eq!(mask & 1, 1, "0x7F < 0x80");
        assert_eq!(mask >> 1 & 1, 0, "0x80 !< 0x80");
        assert_eq!(mask >> 2 & 1, 0, "0xFF !< 0x80");
    }

    #[test]
    #[cfg(not(miri))]
    fn lt_against_zero_is_empty() {
        let col = column(|i| i as u8);
        assert_eq!(unsafe { cmplt_u8x64(col.as_ptr(), 0) }, 0);
    }

    #[test]
    #[cfg(not(miri))]
    fn lt_against_max() {
        let col = column(|i| i as u8);
        let mask = unsafe { cmplt_u8x64(col.as_ptr(), 0xFF) };
        assert_eq!(mask, u64::MAX, "every lane below 0xFF");
    }

    #[test]
    #[cfg(not(miri))]
    fn vec_eq_and_lt() {
        let a = column(|i| i as u8);
        let b = column(|i| if i % 2 == 0 { i as u8 } else { 200 });
        let eq = unsafe { vcmpeq_u8x64(a.as_ptr(), b.as_ptr()) };
        let lt = unsafe { vcmplt_u8x64(a.as_ptr(), b.as_ptr()) };
        for i in 0..64 {
            assert_eq!(eq >> i & 1 == 1, a[i] == b[i], "eq lane {i}");
            assert_eq!(lt >> i & 1 == 1, a[i] < b[i], "lt lane {i}");
        }
    }

    #[test]
    #[cfg(not(miri))]
    fn narrow_widths_match_prefix_of_wide() {
        let col = column(|i| (i * 37 % 251) as u8);
        for c in [0u8, 1, 0x7F, 0x80, 0xFE, 0xFF, 93] {
            let w64 = unsafe { cmpeq_u8x64(col.as_ptr(), c) };
            let w32 = unsafe { cmpeq_u8x32(col.as_ptr(), c) };
            let w16 = unsafe { cmpeq_u8x16(col.as_ptr(), c) };
            assert_eq!(w32, w64 & 0xFFFF_FFFF);
            assert_eq!(w16, w64 & 0xFFFF);

            let l64 = unsafe { cmplt_u8x64(col.as_ptr(), c) };
            let l32 = unsafe { cmplt_u8x32(col.as_ptr(), c) };
            let l16 = unsafe { cmplt_u8x16(col.as_ptr(), c) };
            assert_eq!(l32, l64 & 0xFFFF_FFFF);
            assert_eq!(l16, l64 & 0xFFFF);
        }
    }

    #[test]
    #[cfg(not(miri))]
    fn simd_matches_scalar_exhaustive_scalars() {
        let col = column(|i| (i as u8).wrapping_mul(31).wrapping_add(17));
        for c in 0..=u8::MAX {
            unsafe {
                assert_eq!(
                    cmpeq_u8x64(col.as_ptr(), c),
                    cmpeq_u8x64_scalar(col.as_ptr(), c),
                    "eq c={c}"
                );
                assert_eq!(
                    cmplt_u8x64(col.as_ptr(), c),
                    cmplt_u8x64_scalar(col.as_ptr(), c),
                    "lt c={c}"
                );
            }
        }
    }

    #[test]
    #[cfg(not(miri))]
    fn vec_simd_matches_scalar() {
        let a = column(|i| (i as u8).wrapping_mul(97));
        let b = column(|i| (i as u8).wrapping_mul(13).wrapping_add(5));
        unsafe {
            assert_eq!(
                vcmpeq_u8x64(a.as_ptr(), b.as_ptr()),
                vcmpeq_u8x64_scalar(a.as_ptr(), b.as_ptr())
            );
            assert_eq!(
                vcmplt_u8x64(a.as_ptr(), b.as_ptr()),
                vcmplt_u8x64_scalar(a.as_ptr(), b.as_ptr())
            );
            assert_eq!(
                vcmpeq_u8x16(a.as_ptr(), b.as_ptr()),
                vcmpeq_u8x16_scalar(a.as_ptr(), b.as_ptr())
            );
            assert_eq!(
                vcmplt_u8x32(a.as_ptr(), b.as_ptr()),
                vcmplt_u8x32_scalar(a.as_ptr(), b.as_ptr())
            );
        }
    }

    // ========================================================================
    //  Scalar tests (safe under Miri)
    // ========================================================================

    #[test]
    fn scalar_eq_and_lt() {
        let col = column(|i| (i * 3) as u8);
        let eq = unsafe { cmpeq_u8x64_scalar(col.as_ptr(), 9) };
        let lt = unsafe { cmplt_u8x64_scalar(col.as_ptr(), 9) };
        for (i, &b) in col.iter().enumerate() {
            assert_eq!(eq >> i & 1 == 1, b == 9, "eq lane {i}");
            assert_eq!(lt >> i & 1 == 1, b < 9, "lt lane {i}");
        }
    }

    #[test]
    fn scalar_lt_is_unsigned() {
        let mut col = [0u8; 16];
        col[0] = 0x7F;
        col[1] = 0x80;
        let mask = unsafe { cmplt_u8x16_scalar(col.as_ptr(), 0x80) };
        assert_eq!(mask & 1, 1, "0x7F < 0x80");
        assert_eq!(mask >> 1 & 1, 0, "0x80 !< 0x80");
    }

    #[test]
    fn scalar_vec_compare() {
        let a = column(|i| i as u8);
        let b = column(|i| (i as u8).wrapping_add(i as u8 % 3));
        let eq = unsafe { vcmpeq_u8x64_scalar(a.as_ptr(), b.as_ptr()) };
        let lt = unsafe { vcmplt_u8x64_scalar(a.as_ptr(), b.as_ptr()) };
        for i in 0..64 {
            assert_eq!(eq >> i & 1 == 1, a[i] == b[i], "eq lane {i}");
            assert_eq!(lt >> i & 1 == 1, a[i] < b[i], "lt lane {i}");
        }
    }
}
