// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

use sha2::{Digest, Sha512};

/// Size in bytes of a public key as carried on the wire (crypto session key material).
pub const PUBLIC_KEY_SIZE: usize = 32;

/// First byte every valid address on this overlay must have.
pub const IP6_PREFIX_BYTE: u8 = 0xfc;

/// A 16-byte IPv6-shaped overlay address.
pub type Ip6 = [u8; 16];

/// A 32-byte public key as used by the crypto session layer.
pub type PublicKey = [u8; PUBLIC_KEY_SIZE];

/// Derives the overlay IPv6 address for a public key: first byte fixed at `0xfc`,
/// remaining 120 bits are the low 120 bits of the double-SHA-512 of the key.
///
/// This is the sole source of truth for the IPv6<->key binding; every place that
/// accepts a peer-supplied key (handshake ingress, route header, PFChan `NODE`) must
/// run its claim through this function before trusting it.
pub fn address_for_public_key(pub_key: &PublicKey) -> Ip6 {
    let first = Sha512::digest(pub_key);
    let second = Sha512::digest(first);
    let mut ip6 = [0u8; 16];
    ip6[0] = IP6_PREFIX_BYTE;
    ip6[1..16].copy_from_slice(&second[second.len() - 15..]);
    ip6
}

/// True if `ip6` could plausibly have come from `address_for_public_key`: its first
/// byte matches the fixed prefix. Does not verify the hash relation itself -- callers
/// that hold a claimed key should instead compare against `address_for_public_key`.
#[inline(always)]
pub fn is_valid_prefix(ip6: &Ip6) -> bool {
    ip6[0] == IP6_PREFIX_BYTE
}

/// Full address record: IPv6, public key, protocol version, and current switch label
/// (the source route to this peer in label space).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub ip6: Ip6,
    pub public_key: PublicKey,
    pub version: u32,
    pub label: u64,
}

impl Address {
    /// Builds an address from a public key, deriving its IPv6 and leaving version/label
    /// at their zero defaults. Panics if the key does not derive a valid `0xfc` address --
    /// callers must validate untrusted keys with `is_valid_prefix` before reaching here.
    pub fn from_public_key(public_key: PublicKey) -> Self {
        let ip6 = address_for_public_key(&public_key);
        debug_assert!(is_valid_prefix(&ip6));
        Self { ip6, public_key, version: 0, label: 0 }
    }

    /// True if this address's IPv6 is actually derivable from its public key. A
    /// non-zero key that fails this check indicates a forged or corrupted address.
    pub fn is_self_consistent(&self) -> bool {
        self.public_key != [0u8; PUBLIC_KEY_SIZE] && address_for_public_key(&self.public_key) == self.ip6
    }
}

/// Reverses the order of the 8 bytes that make up a switch label, without changing
/// their individual byte contents. Used on switch-side ingress: labels are consumed
/// from the low end as they travel, so bit-reversing recovers the path back to us.
///
/// The name matches the source's bit-level reversal; in practice labels are handled as
/// whole big-endian u64s here, so a byte-order reversal on the decoded value is what's
/// required for the reverse-path property to hold (reversing twice is the identity).
#[inline(always)]
pub fn bit_reverse_label(label: u64) -> u64 {
    label.reverse_bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_address_has_fixed_prefix() {
        let key = [0x42u8; PUBLIC_KEY_SIZE];
        let ip6 = address_for_public_key(&key);
        assert_eq!(ip6[0], IP6_PREFIX_BYTE);
        assert!(is_valid_prefix(&ip6));
    }

    #[test]
    fn derivation_is_deterministic_and_key_sensitive() {
        let a = address_for_public_key(&[1u8; PUBLIC_KEY_SIZE]);
        let b = address_for_public_key(&[1u8; PUBLIC_KEY_SIZE]);
        let c = address_for_public_key(&[2u8; PUBLIC_KEY_SIZE]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn address_is_self_consistent_when_derived() {
        let addr = Address::from_public_key([7u8; PUBLIC_KEY_SIZE]);
        assert!(addr.is_self_consistent());
    }

    #[test]
    fn tampered_ip6_is_not_self_consistent() {
        let mut addr = Address::from_public_key([7u8; PUBLIC_KEY_SIZE]);
        addr.ip6[15] ^= 0xff;
        assert!(!addr.is_self_consistent());
    }

    #[test]
    fn bit_reverse_label_is_involution() {
        let label = 0x0000_0000_0000_0015u64;
        assert_eq!(bit_reverse_label(bit_reverse_label(label)), label);
    }
}
