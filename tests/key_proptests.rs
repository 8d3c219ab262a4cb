//! Property tests for the routing encodings: key order and route order
//! must agree for every key type.

use blinktree::{Key, Route};
use proptest::prelude::*;

proptest! {
    #[test]
    fn u64_routes_preserve_order(a in any::<u64>(), b in any::<u64>()) {
        prop_assert_eq!(a.cmp(&b), a.route().cmp(&b.route()));
    }

    #[test]
    fn i64_routes_preserve_order(a in any::<i64>(), b in any::<i64>()) {
        prop_assert_eq!(a.cmp(&b), a.route().cmp(&b.route()));
    }

    #[test]
    fn u32_routes_preserve_order(a in any::<u32>(), b in any::<u32>()) {
        prop_assert_eq!(a.cmp(&b), a.route().cmp(&b.route()));
    }

    #[test]
    fn i32_routes_preserve_order(a in any::<i32>(), b in any::<i32>()) {
        prop_assert_eq!(a.cmp(&b), a.route().cmp(&b.route()));
    }

    #[test]
    fn byte_string_routes_preserve_order(
        a in prop::collection::vec(any::<u8>(), 0..24),
        b in prop::collection::vec(any::<u8>(), 0..24),
    ) {
        let a: Box<[u8]> = a.into_boxed_slice();
        let b: Box<[u8]> = b.into_boxed_slice();
        prop_assert_eq!(a.cmp(&b), a.route().cmp(&b.route()));
    }

    #[test]
    fn route_bytes_round_trip_through_from_bytes(k in any::<u64>()) {
        let route = k.route();
        let rebuilt = <u64 as Key>::Route::from_bytes(route.as_bytes());
        prop_assert_eq!(route, rebuilt);
    }

    #[test]
    fn equal_keys_have_equal_fingerprints(k in any::<u64>()) {
        prop_assert_eq!(k.fingerprint(), k.fingerprint());
        let boxed: Box<[u8]> = k.to_be_bytes().to_vec().into_boxed_slice();
        prop_assert_eq!(boxed.fingerprint(), boxed.clone().fingerprint());
    }

    #[test]
    fn route_bytes_are_zero_padded(k in any::<u32>()) {
        let route = k.route();
        for idx in 4..64 {
            prop_assert_eq!(route.byte(idx), 0);
        }
    }
}
