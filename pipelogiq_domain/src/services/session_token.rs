// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Opaque Token Minting
//!
//! Random opaque tokens for worker sessions and gateway visibility leases.
//! Tokens carry no encoded state; everything about a token lives server-side
//! (the worker row, the gateway's pending-ack map). 32 random bytes rendered
//! as 64 hex characters.

use rand::RngCore;

/// Byte length of minted tokens before hex encoding.
const TOKEN_BYTES: usize = 32;

/// Mints a fresh opaque token.
pub fn opaque_token() -> String {
    let mut buf = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        let token = opaque_token();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = opaque_token();
        let b = opaque_token();
        assert_ne!(a, b);
    }
}
