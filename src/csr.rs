//! Access to control and status registers.

/// Clear the given bits in a CSR, returning its previous value.
///
/// The caller must wrap this in `unsafe` and justify why changing the bits is sound.
macro_rules! clear_csr_bits {
    ($csr:ident, $bits:expr) => {{
        let prev: usize;
        core::arch::asm!(
            concat!("csrrc {}, ", stringify!($csr), ", {}"),
            lateout(reg) prev,
            in(reg) $bits,
        );
        prev
    }};
}
pub(crate) use clear_csr_bits;

/// Set the given bits in a CSR.
///
/// The caller must wrap this in `unsafe` and justify why changing the bits is sound.
macro_rules! set_csr_bits {
    ($csr:ident, $bits:expr) => {
        core::arch::asm!(
            concat!("csrs ", stringify!($csr), ", {}"),
            in(reg) $bits,
        )
    };
}
pub(crate) use set_csr_bits;
