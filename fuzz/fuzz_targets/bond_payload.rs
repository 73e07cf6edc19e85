//! Fuzz harness for bond payload decoding and the structural diff.
//!
//! Arbitrary bytes go through the bond and state decoders, which must
//! return `Ok` or `Err` without panicking. Input that decodes to a state is
//! then split in two and diffed; applying the patches to the first half must
//! reproduce the second.

#![no_main]
use libfuzzer_sys::fuzz_target;
use nbstate_core::codec;
use nbstate_core::diff::{apply, diff};

fuzz_target!(|data: &[u8]| {
    let _ = codec::deserialize_bonds(data);

    let (left, right) = data.split_at(data.len() / 2);
    let (Ok(before), Ok(after)) = (
        codec::deserialize_state(left),
        codec::deserialize_state(right),
    ) else {
        return;
    };

    assert!(diff(&before, &before).is_empty());
    let patches = diff(&before, &after);
    let mut patched = before.clone();
    apply(&mut patched, &patches).expect("patches from diff must apply");
    assert_eq!(patched, after);
});
