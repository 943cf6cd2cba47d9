//! Canonical value codec between host values and guest linear memory.
//!
//! Every ABI-visible shape has a fixed flat width ([`AbiValue::SIZE`]).
//! Variable-size payloads (strings, lists) live out of line in memory the
//! guest allocator owns and appear in the flat encoding as 8-byte
//! (pointer, length) pairs, so nesting them never changes a parent's
//! width. All multi-byte fields are little-endian.

use crate::error::AbiError;
use crate::memory::GuestMemory;
use vela_ext_abi::v1::{discriminant, DISCRIMINANT_SIZE};

mod list;
mod string;

pub use list::WasmList;
pub use string::WasmStr;

/// A value with a canonical fixed-width encoding in guest memory.
///
/// `store` writes exactly `SIZE` bytes starting at `offset` and `load`
/// reads the same range back. Implementations never touch bytes outside
/// that range except through out-of-line pointers they themselves encode.
pub trait AbiValue: Sized {
    const SIZE: u32;

    fn store(&self, memory: &mut GuestMemory<'_>, offset: u32) -> Result<(), AbiError>;

    fn load(memory: &GuestMemory<'_>, offset: u32) -> Result<Self, AbiError>;
}

/// Lifts a host value into its ABI form, allocating guest memory for
/// out-of-line payloads along the way.
pub trait ToAbi {
    type Abi: AbiValue;

    fn to_abi(&self, memory: &mut GuestMemory<'_>) -> Result<Self::Abi, AbiError>;
}

pub(crate) const fn max_size(a: u32, b: u32) -> u32 {
    if a > b {
        a
    } else {
        b
    }
}

pub(crate) fn advance(base: u32, delta: u32) -> Result<u32, AbiError> {
    base.checked_add(delta).ok_or(AbiError::AddressOverflow {
        base,
        offset: delta as u64,
    })
}

// === scalars ================================================================

macro_rules! scalar_abi {
    ($ty:ty, $size:expr, $read:ident, $write:ident) => {
        impl AbiValue for $ty {
            const SIZE: u32 = $size;

            fn store(&self, memory: &mut GuestMemory<'_>, offset: u32) -> Result<(), AbiError> {
                memory.$write(offset, *self)
            }

            fn load(memory: &GuestMemory<'_>, offset: u32) -> Result<Self, AbiError> {
                memory.$read(offset)
            }
        }

        impl ToAbi for $ty {
            type Abi = $ty;

            fn to_abi(&self, _memory: &mut GuestMemory<'_>) -> Result<Self, AbiError> {
                Ok(*self)
            }
        }
    };
}

scalar_abi!(u8, 1, read_u8, write_u8);
scalar_abi!(i32, 4, read_i32, write_i32);
scalar_abi!(u32, 4, read_u32, write_u32);
scalar_abi!(i64, 8, read_i64, write_i64);
scalar_abi!(u64, 8, read_u64, write_u64);
scalar_abi!(f32, 4, read_f32, write_f32);
scalar_abi!(f64, 8, read_f64, write_f64);

impl AbiValue for () {
    const SIZE: u32 = 0;

    fn store(&self, _memory: &mut GuestMemory<'_>, _offset: u32) -> Result<(), AbiError> {
        Ok(())
    }

    fn load(_memory: &GuestMemory<'_>, _offset: u32) -> Result<Self, AbiError> {
        Ok(())
    }
}

impl ToAbi for () {
    type Abi = ();

    fn to_abi(&self, _memory: &mut GuestMemory<'_>) -> Result<(), AbiError> {
        Ok(())
    }
}

// === option and result ======================================================

/// `Option<T>`: u32 discriminant (0 none, 1 some), then the payload.
/// Payload space is always reserved and zero-filled for `None`, so the
/// width is the same on both arms.
impl<T: AbiValue> AbiValue for Option<T> {
    const SIZE: u32 = DISCRIMINANT_SIZE + T::SIZE;

    fn store(&self, memory: &mut GuestMemory<'_>, offset: u32) -> Result<(), AbiError> {
        match self {
            None => {
                memory.write_u32(offset, discriminant::NONE)?;
                memory.zero(advance(offset, DISCRIMINANT_SIZE)?, T::SIZE)
            }
            Some(value) => {
                memory.write_u32(offset, discriminant::SOME)?;
                value.store(memory, advance(offset, DISCRIMINANT_SIZE)?)
            }
        }
    }

    fn load(memory: &GuestMemory<'_>, offset: u32) -> Result<Self, AbiError> {
        match memory.read_u32(offset)? {
            discriminant::NONE => Ok(None),
            discriminant::SOME => {
                let payload = advance(offset, DISCRIMINANT_SIZE)?;
                Ok(Some(T::load(memory, payload)?))
            }
            value => Err(AbiError::InvalidDiscriminant {
                shape: "option",
                value,
            }),
        }
    }
}

/// `Result<T, E>`: u32 discriminant (0 ok, 1 err), then the payload in a
/// slot wide enough for either arm. The inactive tail is zero-filled so
/// the encoding of a value is deterministic.
impl<T: AbiValue, E: AbiValue> AbiValue for Result<T, E> {
    const SIZE: u32 = DISCRIMINANT_SIZE + max_size(T::SIZE, E::SIZE);

    fn store(&self, memory: &mut GuestMemory<'_>, offset: u32) -> Result<(), AbiError> {
        let width = max_size(T::SIZE, E::SIZE);
        match self {
            Ok(value) => {
                memory.write_u32(offset, discriminant::OK)?;
                let payload = advance(offset, DISCRIMINANT_SIZE)?;
                value.store(memory, payload)?;
                memory.zero(advance(payload, T::SIZE)?, width - T::SIZE)
            }
            Err(error) => {
                memory.write_u32(offset, discriminant::ERR)?;
                let payload = advance(offset, DISCRIMINANT_SIZE)?;
                error.store(memory, payload)?;
                memory.zero(advance(payload, E::SIZE)?, width - E::SIZE)
            }
        }
    }

    fn load(memory: &GuestMemory<'_>, offset: u32) -> Result<Self, AbiError> {
        match memory.read_u32(offset)? {
            discriminant::OK => {
                let payload = advance(offset, DISCRIMINANT_SIZE)?;
                Ok(Ok(T::load(memory, payload)?))
            }
            discriminant::ERR => {
                let payload = advance(offset, DISCRIMINANT_SIZE)?;
                Ok(Err(E::load(memory, payload)?))
            }
            value => Err(AbiError::InvalidDiscriminant {
                shape: "result",
                value,
            }),
        }
    }
}

impl<T: ToAbi> ToAbi for Option<T> {
    type Abi = Option<T::Abi>;

    fn to_abi(&self, memory: &mut GuestMemory<'_>) -> Result<Self::Abi, AbiError> {
        match self {
            None => Ok(None),
            Some(value) => Ok(Some(value.to_abi(memory)?)),
        }
    }
}

impl<T: ToAbi, E: ToAbi> ToAbi for Result<T, E> {
    type Abi = Result<T::Abi, E::Abi>;

    fn to_abi(&self, memory: &mut GuestMemory<'_>) -> Result<Self::Abi, AbiError> {
        match self {
            Ok(value) => Ok(Ok(value.to_abi(memory)?)),
            Err(error) => Ok(Err(error.to_abi(memory)?)),
        }
    }
}

// === tuples =================================================================

/// Tuples pack their fields back to back with no padding; the width is
/// the sum of the field widths.
impl<A: AbiValue, B: AbiValue> AbiValue for (A, B) {
    const SIZE: u32 = A::SIZE + B::SIZE;

    fn store(&self, memory: &mut GuestMemory<'_>, offset: u32) -> Result<(), AbiError> {
        self.0.store(memory, offset)?;
        self.1.store(memory, advance(offset, A::SIZE)?)
    }

    fn load(memory: &GuestMemory<'_>, offset: u32) -> Result<Self, AbiError> {
        let a = A::load(memory, offset)?;
        let b = B::load(memory, advance(offset, A::SIZE)?)?;
        Ok((a, b))
    }
}

impl<A: AbiValue, B: AbiValue, C: AbiValue> AbiValue for (A, B, C) {
    const SIZE: u32 = A::SIZE + B::SIZE + C::SIZE;

    fn store(&self, memory: &mut GuestMemory<'_>, offset: u32) -> Result<(), AbiError> {
        self.0.store(memory, offset)?;
        self.1.store(memory, advance(offset, A::SIZE)?)?;
        self.2.store(memory, advance(offset, A::SIZE + B::SIZE)?)
    }

    fn load(memory: &GuestMemory<'_>, offset: u32) -> Result<Self, AbiError> {
        let a = A::load(memory, offset)?;
        let b = B::load(memory, advance(offset, A::SIZE)?)?;
        let c = C::load(memory, advance(offset, A::SIZE + B::SIZE)?)?;
        Ok((a, b, c))
    }
}

impl<A: ToAbi, B: ToAbi> ToAbi for (A, B) {
    type Abi = (A::Abi, B::Abi);

    fn to_abi(&self, memory: &mut GuestMemory<'_>) -> Result<Self::Abi, AbiError> {
        Ok((self.0.to_abi(memory)?, self.1.to_abi(memory)?))
    }
}

impl<A: ToAbi, B: ToAbi, C: ToAbi> ToAbi for (A, B, C) {
    type Abi = (A::Abi, B::Abi, C::Abi);

    fn to_abi(&self, memory: &mut GuestMemory<'_>) -> Result<Self::Abi, AbiError> {
        Ok((
            self.0.to_abi(memory)?,
            self.1.to_abi(memory)?,
            self.2.to_abi(memory)?,
        ))
    }
}
