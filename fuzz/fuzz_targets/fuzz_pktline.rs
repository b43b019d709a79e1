//! Fuzz target for pkt-line framing.
//!
//! Tests that the pkt-line reader handles arbitrary input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tipfs_git::{PktLine, PktLineReader};

fuzz_target!(|data: &[u8]| {
    let Ok(rt) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };
    rt.block_on(async {
        let mut reader = PktLineReader::new(data);

        // Bounded so crafted input cannot spin forever.
        for _ in 0..100 {
            match reader.read_expecting_pack().await {
                Ok(Some(PktLine::PackStart)) | Ok(None) | Err(_) => break,
                Ok(Some(_)) => continue,
            }
        }
    });
});
