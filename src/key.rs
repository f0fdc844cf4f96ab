use std::cmp::Ordering;
use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

/// A key type the index can order and serialize.
///
/// Keys have a fixed encoded width. This keeps the byte accounting exact:
/// moving a key between nodes or replacing a separator never changes the
/// serialized footprint of the tree.
pub trait IndexKey: Ord + Clone + Send + Sync + fmt::Debug + 'static {
	/// Serialized width of every key of this type, in bytes.
	const ENCODED_LEN: usize;

	fn encode_into(&self, buf: &mut BytesMut);

	fn decode_from(buf: &mut &[u8]) -> Result<Self>;
}

macro_rules! impl_fixed_int_key {
	($t:ty, $len:expr, $put:ident, $get:ident) => {
		impl IndexKey for $t {
			const ENCODED_LEN: usize = $len;

			fn encode_into(&self, buf: &mut BytesMut) {
				buf.$put(*self);
			}

			fn decode_from(buf: &mut &[u8]) -> Result<Self> {
				if buf.remaining() < Self::ENCODED_LEN {
					return Err(Error::Deserialization("truncated key".into()));
				}
				Ok(buf.$get())
			}
		}
	};
}

impl_fixed_int_key!(u32, 4, put_u32_le, get_u32_le);
impl_fixed_int_key!(u64, 8, put_u64_le, get_u64_le);
impl_fixed_int_key!(i32, 4, put_i32_le, get_i32_le);
impl_fixed_int_key!(i64, 8, put_i64_le, get_i64_le);

/// A totally ordered `f64` key.
///
/// Ingested tuples are commonly indexed on floating-point fields; `f64`
/// itself is only partially ordered, so this wrapper orders via
/// `f64::total_cmp`.
#[derive(Clone, Copy, Debug)]
pub struct F64Key(pub f64);

impl From<f64> for F64Key {
	fn from(v: f64) -> Self {
		F64Key(v)
	}
}

impl PartialEq for F64Key {
	fn eq(&self, other: &Self) -> bool {
		self.0.total_cmp(&other.0) == Ordering::Equal
	}
}

impl Eq for F64Key {}

impl PartialOrd for F64Key {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for F64Key {
	fn cmp(&self, other: &Self) -> Ordering {
		self.0.total_cmp(&other.0)
	}
}

impl IndexKey for F64Key {
	const ENCODED_LEN: usize = 8;

	fn encode_into(&self, buf: &mut BytesMut) {
		buf.put_u64_le(self.0.to_bits());
	}

	fn decode_from(buf: &mut &[u8]) -> Result<Self> {
		if buf.remaining() < Self::ENCODED_LEN {
			return Err(Error::Deserialization("truncated key".into()));
		}
		Ok(F64Key(f64::from_bits(buf.get_u64_le())))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn round_trip<K: IndexKey>(key: K) -> K {
		let mut buf = BytesMut::new();
		key.encode_into(&mut buf);
		assert_eq!(buf.len(), K::ENCODED_LEN);
		let mut slice = &buf[..];
		let decoded = K::decode_from(&mut slice).unwrap();
		assert!(slice.is_empty());
		decoded
	}

	#[test]
	fn int_keys_round_trip() {
		assert_eq!(round_trip(42u32), 42);
		assert_eq!(round_trip(u64::MAX), u64::MAX);
		assert_eq!(round_trip(-7i32), -7);
		assert_eq!(round_trip(i64::MIN), i64::MIN);
	}

	#[test]
	fn f64_key_orders_totally() {
		let mut keys = vec![
			F64Key(3.5),
			F64Key(-1.0),
			F64Key(f64::NEG_INFINITY),
			F64Key(0.0),
			F64Key(f64::INFINITY),
		];
		keys.sort();
		assert_eq!(keys[0], F64Key(f64::NEG_INFINITY));
		assert_eq!(keys[1], F64Key(-1.0));
		assert_eq!(keys[2], F64Key(0.0));
		assert_eq!(keys[3], F64Key(3.5));
		assert_eq!(keys[4], F64Key(f64::INFINITY));

		// NaN must sort somewhere stable instead of breaking the order.
		let nan = F64Key(f64::NAN);
		assert_eq!(nan.cmp(&nan), Ordering::Equal);
	}

	#[test]
	fn f64_key_round_trip() {
		let decoded = round_trip(F64Key(-273.15));
		assert_eq!(decoded, F64Key(-273.15));
	}

	#[test]
	fn truncated_key_fails() {
		let buf = [0u8; 3];
		let mut slice = &buf[..];
		assert!(u64::decode_from(&mut slice).is_err());
	}
}
