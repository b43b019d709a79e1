//! Fuzz target for ref advertisement and upload request parsing.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tipfs_git::{PktLineReader, RefAdvertisement, UploadRequest};

fuzz_target!(|data: &[u8]| {
    let Ok(rt) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };
    rt.block_on(async {
        if let Ok(advertisement) = RefAdvertisement::read(&mut PktLineReader::new(data)).await {
            let _ = advertisement.resolve("main");
            let _ = advertisement.resolve("");
        }
        let _ = UploadRequest::parse(data).await;
    });
});
