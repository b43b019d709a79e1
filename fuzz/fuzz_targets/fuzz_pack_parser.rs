//! Fuzz target for pack decoding.
//!
//! Tests that the pack reader handles arbitrary input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tipfs_git::{HashAlgorithm, PackReader};

fuzz_target!(|data: &[u8]| {
    let Ok(rt) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };
    rt.block_on(async {
        let Ok(mut pack) = PackReader::new(data, HashAlgorithm::Sha1).await else {
            return;
        };
        while let Ok(Some(_)) = pack.next_object().await {}
    });
});
