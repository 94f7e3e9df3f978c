use bytemuck::NoUninit;

use std::fmt;
use std::ops::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// size in bytes
pub type ByteSize = usize;
/// offset in bytes
pub type ByteOffset = isize;

/// Address represents an arbitrary heap address. This is designed to represent
/// addresses and do address arithmetic mostly in a safe way, and to mark the
/// operations that are not as unsafe. The type is zero overhead, memory wise
/// and time wise.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct Address(usize);

/// Address + ByteSize (positive)
impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

/// Address += ByteSize (positive)
impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, offset: ByteSize) {
        self.0 += offset;
    }
}

/// Address + ByteOffset (positive or negative)
impl Add<ByteOffset> for Address {
    type Output = Address;
    fn add(self, offset: ByteOffset) -> Address {
        Address((self.0 as isize + offset) as usize)
    }
}

/// Address - ByteSize (positive)
impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, offset: ByteSize) -> Address {
        Address(self.0 - offset)
    }
}

/// Address - Address (the first address must be higher)
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "for (addr_a - addr_b), a({}) needs to be larger than b({})",
            self,
            other
        );
        self.0 - other.0
    }
}

/// Address & mask
impl BitAnd<usize> for Address {
    type Output = usize;
    fn bitand(self, other: usize) -> usize {
        self.0 & other
    }
}

/// Address >> shift (get an index)
impl Shr<usize> for Address {
    type Output = usize;
    fn shr(self, shift: usize) -> usize {
        self.0 >> shift
    }
}

impl Address {
    /// The lowest possible address.
    pub const ZERO: Self = Address(0);

    /// creates Address from a pointer
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    /// creates Address from a Rust reference
    pub fn from_ref<T>(r: &T) -> Address {
        Address(r as *const T as usize)
    }

    /// creates Address from a mutable pointer
    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    /// creates an arbitrary Address
    /// # Safety
    /// The caller needs to be aware that they may create an invalid address.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// gets the raw address value
    pub fn as_usize(self) -> usize {
        self.0
    }

    /// is this address zero?
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// aligns up the address to the given alignment
    pub const fn align_up(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address((self.0 + align - 1) & !(align - 1))
    }

    /// aligns down the address to the given alignment
    pub const fn align_down(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address(self.0 & !(align - 1))
    }

    /// is this address aligned to the given alignment?
    pub const fn is_aligned_to(self, align: ByteSize) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    /// converts the Address to a pointer
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// converts the Address to a mutable pointer
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// converts the Address to a Rust reference
    ///
    /// # Safety
    /// The caller must guarantee the address actually points to a Rust object
    /// of type `T`, and that nothing else aliases it mutably for `'a`.
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        &*self.to_mut_ptr()
    }

    /// loads a value of type T from the address
    /// # Safety
    /// This could throw a segment fault if the address is invalid
    pub unsafe fn load<T: Copy>(self) -> T {
        (self.0 as *mut T).read()
    }

    /// stores a value of type T to the address
    /// # Safety
    /// This could throw a segment fault if the address is invalid
    pub unsafe fn store<T>(self, value: T) {
        (self.0 as *mut T).write(value)
    }

    /// atomic load of a word from the address
    /// # Safety
    /// The address must be valid and word aligned.
    pub unsafe fn atomic_load_word(self, order: Ordering) -> usize {
        (*(self.0 as *const AtomicUsize)).load(order)
    }

    /// atomic store of a word to the address
    /// # Safety
    /// The address must be valid and word aligned.
    pub unsafe fn atomic_store_word(self, value: usize, order: Ordering) {
        (*(self.0 as *const AtomicUsize)).store(value, order)
    }

    /// atomic compare-and-exchange of the word at the address
    /// # Safety
    /// The address must be valid and word aligned.
    pub unsafe fn atomic_cmpxchg_word(
        self,
        old: usize,
        new: usize,
        success: Ordering,
        failure: Ordering,
    ) -> Result<usize, usize> {
        (*(self.0 as *const AtomicUsize)).compare_exchange(old, new, success, failure)
    }
}

// Addresses format as hex. `Display` and `Debug` both print the
// `0x`-prefixed lowercase form; the `LowerHex`/`UpperHex` impls delegate to
// the raw word so the usual width, fill, and `#` flags keep working.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_down() {
        let addr = unsafe { Address::from_usize(0x1001) };
        assert_eq!(addr.align_down(0x1000), unsafe {
            Address::from_usize(0x1000)
        });
        assert_eq!(addr.align_up(0x1000), unsafe {
            Address::from_usize(0x2000)
        });
        assert!(!addr.is_aligned_to(8));
        assert!(addr.align_down(8).is_aligned_to(8));
    }

    #[test]
    fn arithmetic() {
        let a = unsafe { Address::from_usize(0x4000) };
        let b = a + 0x100usize;
        assert_eq!(b - a, 0x100);
        assert_eq!(b - 0x100usize, a);
        assert_eq!(a & 0xfffusize, 0);
        assert_eq!(a >> 12usize, 4);
    }

    #[test]
    fn load_store() {
        let mut slot: usize = 0;
        let addr = Address::from_ref(&slot);
        unsafe { addr.store::<usize>(42) };
        assert_eq!(unsafe { addr.load::<usize>() }, 42);
        assert_eq!(slot, 42);
        slot = 43;
        assert_eq!(unsafe { addr.load::<usize>() }, 43);
    }
}
