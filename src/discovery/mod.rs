//! Discovery sources
//! Two parallel producers (chat channel parser, on-chain log listener) that
//! both fail closed and both dedup through the launch-candidate merge-upsert.

pub mod onchain;
pub mod telegram;

/// Addresses that can never be a launch candidate mint: system programs,
/// token programs, the native mint and the launchpad itself.
const KNOWN_PROGRAM_ADDRESSES: &[&str] = &[
    "11111111111111111111111111111111",             // system program
    "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",  // spl token
    "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb",  // token-2022
    "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL", // associated token account
    "ComputeBudget111111111111111111111111111111",  // compute budget
    "So11111111111111111111111111111111111111112",  // wrapped SOL
    "SysvarRent111111111111111111111111111111111",  // rent sysvar
    "metaqbxxUerdq28cj1RbAWkYQm3ybzjb6a8bt518x1s",  // metaplex metadata
    "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P",  // launchpad program
];

pub fn is_known_program_address(address: &str) -> bool {
    KNOWN_PROGRAM_ADDRESSES.contains(&address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_addresses_are_filtered() {
        assert!(is_known_program_address(
            "11111111111111111111111111111111"
        ));
        assert!(is_known_program_address(
            "So11111111111111111111111111111111111111112"
        ));
        assert!(!is_known_program_address(
            "4k3Dyjzvzp8eMZWUXbBCjEvwSkkk59S5iCNLY3QrkX6R"
        ));
    }
}
