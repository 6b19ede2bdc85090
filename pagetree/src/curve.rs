//! Z-order (Morton) curve utilities.
//!
//! The Z-order curve maps n-dimensional grid coordinates to a single integer
//! by interleaving their bits. Two values sharing a long common leading-bit
//! prefix lie in the same small cell of the curve, which is what the
//! space-filling-curve split strategy and R-Tree bulk loading rely on.
//!
//! ## Key images
//! [`CurveKey`] maps a scalar key to a left-aligned `u64` image whose unsigned
//! order matches the key order, so that leading bits are comparable across
//! key widths.

use crate::region::{Rectangle, Separator};

/// Bits available for the interleaved result.
const CURVE_BITS: u32 = u64::BITS;

/// Interleaves the low `bits_per_dim` bits of each coordinate, most
/// significant bit first.
///
/// # Arguments
/// * `coords` - grid coordinates, one per dimension
/// * `bits_per_dim` - precision per dimension; `coords.len() * bits_per_dim`
///   must not exceed 64
///
/// # Returns
/// The Morton code, right-aligned.
pub fn interleave(coords: &[u64], bits_per_dim: u32) -> u64 {
    debug_assert!(coords.len() as u32 * bits_per_dim <= CURVE_BITS);

    let mut code = 0u64;
    for bit in (0..bits_per_dim).rev() {
        for c in coords {
            code = (code << 1) | ((c >> bit) & 1);
        }
    }
    code
}

/// Precision used per dimension for a `dims`-dimensional curve.
pub fn bits_per_dimension(dims: usize) -> u32 {
    if dims == 0 {
        return 0;
    }
    (CURVE_BITS / dims as u32).min(32)
}

/// Encodes a point to its Z-order index relative to `bounds`.
///
/// Coordinates are normalized into `bounds` and clamped; a dimension with
/// zero extent maps to its centre cell.
pub fn z_order_index(point: &[f64], bounds: &Rectangle) -> u64 {
    let dims = point.len().min(bounds.dimensions());
    let bits = bits_per_dimension(dims);
    if bits == 0 {
        return 0;
    }
    let cells = (1u64 << bits) - 1;

    let coords: Vec<u64> = (0..dims)
        .map(|d| {
            let lo = bounds.min()[d];
            let extent = bounds.max()[d] - lo;
            let norm = if extent > 0.0 {
                ((point[d] - lo) / extent).clamp(0.0, 1.0)
            } else {
                0.5
            };
            ((norm * cells as f64) as u64).min(cells)
        })
        .collect();

    interleave(&coords, bits)
}

/// Z-order index of a rectangle's centre.
pub fn z_order_of_center(rect: &Rectangle, bounds: &Rectangle) -> u64 {
    let center: Vec<f64> = (0..rect.dimensions()).map(|d| rect.center(d)).collect();
    z_order_index(&center, bounds)
}

/// Length of the common leading-bit prefix of two left-aligned images.
pub fn common_prefix_len(a: u64, b: u64) -> u32 {
    (a ^ b).leading_zeros()
}

/// A key that can be viewed as a fixed-width unsigned integer.
///
/// The image is left-aligned in a `u64` and preserves the key order under
/// unsigned comparison.
pub trait CurveKey {
    fn curve_bits(&self) -> u64;
}

macro_rules! unsigned_curve_key {
    ($($t:ty),*) => {
        $(
            impl CurveKey for $t {
                fn curve_bits(&self) -> u64 {
                    (*self as u64) << (u64::BITS - <$t>::BITS)
                }
            }
        )*
    };
}

macro_rules! signed_curve_key {
    ($($t:ty => $u:ty),*) => {
        $(
            impl CurveKey for $t {
                fn curve_bits(&self) -> u64 {
                    let flipped = (*self as $u) ^ (1 << (<$u>::BITS - 1));
                    (flipped as u64) << (u64::BITS - <$u>::BITS)
                }
            }
        )*
    };
}

unsigned_curve_key!(u8, u16, u32, u64);
signed_curve_key!(i8 => u8, i16 => u16, i32 => u32, i64 => u64);

/// Image of a separator; indefinite bounds map to the extremes.
pub fn separator_bits<K: CurveKey>(separator: &Separator<K>) -> u64 {
    match separator {
        Separator::NegInfinity => 0,
        Separator::Value(k) => k.curve_bits(),
        Separator::PosInfinity => u64::MAX,
    }
}

/// Big-endian image of the first eight bytes.
fn prefix_bits(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_be_bytes(buf)
}

impl CurveKey for String {
    fn curve_bits(&self) -> u64 {
        prefix_bits(self.as_bytes())
    }
}

impl CurveKey for Vec<u8> {
    fn curve_bits(&self) -> u64 {
        prefix_bits(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleave_two_dimensions() {
        // x = 0b10, y = 0b01 -> x1 y1 x0 y0 = 1 0 0 1
        assert_eq!(interleave(&[0b10, 0b01], 2), 0b1001);
        assert_eq!(interleave(&[0, 0], 16), 0);
        assert_eq!(interleave(&[0b11, 0b11], 2), 0b1111);
    }

    #[test]
    fn test_z_order_corners_distinct() {
        let bounds = Rectangle::new_2d(0.0, 0.0, 100.0, 100.0);
        let mut codes = vec![
            z_order_index(&[0.0, 0.0], &bounds),
            z_order_index(&[100.0, 0.0], &bounds),
            z_order_index(&[0.0, 100.0], &bounds),
            z_order_index(&[100.0, 100.0], &bounds),
        ];
        assert_eq!(codes[0], 0);
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), 4);
    }

    #[test]
    fn test_z_order_clamps_and_handles_zero_extent() {
        let bounds = Rectangle::new_2d(0.0, 0.0, 10.0, 10.0);
        assert_eq!(
            z_order_index(&[50.0, 50.0], &bounds),
            z_order_index(&[10.0, 10.0], &bounds)
        );
        let flat = Rectangle::new_2d(5.0, 5.0, 5.0, 5.0);
        let center = Rectangle::point(vec![5.0, 5.0]);
        assert_eq!(z_order_of_center(&center, &flat), z_order_index(&[7.0, 3.0], &flat));
    }

    #[test]
    fn test_common_prefix_len() {
        assert_eq!(common_prefix_len(0, 0), 64);
        assert_eq!(common_prefix_len(0, u64::MAX), 0);
        assert_eq!(common_prefix_len(0b1000 << 60, 0b1001 << 60), 3);
    }

    #[test]
    fn test_curve_key_preserves_order() {
        let signed = [i64::MIN, -5, -1, 0, 1, 7, i64::MAX];
        for pair in signed.windows(2) {
            assert!(pair[0].curve_bits() < pair[1].curve_bits());
        }
        let small = [i32::MIN, -1, 0, i32::MAX];
        for pair in small.windows(2) {
            assert!(pair[0].curve_bits() < pair[1].curve_bits());
        }
        assert!(3u8.curve_bits() < 200u8.curve_bits());
        assert!(String::from("apple").curve_bits() < String::from("banana").curve_bits());
    }

    #[test]
    fn test_curve_key_left_aligned() {
        assert_eq!(1u32.curve_bits(), 1u64 << 32);
        assert_eq!(u8::MAX.curve_bits().leading_ones(), 8);
        assert_eq!(0i8.curve_bits(), 1u64 << 63);
    }
}
