//! Test utilities shared between the atoll crates.

use rand::rngs::StdRng;
use rand::SeedableRng;

/// A result type useful in tests, wrapping any error implementation.
pub type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A deterministic RNG for tests; pass a distinct seed per test so failures
/// reproduce.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Creates parametrized tests: expands to a module containing one `#[test]`
/// per named case, each calling the shared function with its arguments.
///
/// ```
/// # use atoll_test_utils::param_test;
/// param_test! {
///     test_sum: [
///         small: (1, 2, 3),
///         negative: (-4, 1, -3),
///     ]
/// }
/// fn test_sum(lhs: i32, rhs: i32, sum: i32) {
///     assert_eq!(lhs + rhs, sum);
/// }
/// ```
#[macro_export]
macro_rules! param_test {
    ($func_name:ident -> $return_ty:ty: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                #[test]
                $(#[$outer])*
                fn $case_name() -> $return_ty {
                    $func_name($($args),*)
                }
            )*
        }
    };
    ($func_name:ident: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::param_test!(
            $func_name -> ():
            [ $( $(#[$outer])* $case_name: ( $($args),* ) ),+ ]
        );
    };
}
